//! Raw live-channel transport.
//!
//! A [`TransportConnector`] turns a websocket URL into a [`TransportHandle`]:
//! a command sender for outbound frames and a receiver of open/text/error/close
//! notifications. The connection manager only ever talks to this seam, so the
//! lifecycle logic can be driven by an in-memory connector in tests.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, warn};
use url::Url;

/// Close code reported when the socket dies without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close code reported when the peer closed without a status.
pub const CLOSE_NO_STATUS: u16 = 1005;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Text(String),
    /// An outbound frame could not be written. The socket may still be usable.
    SendFailed(String),
    Error(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Send(String),
    Close { code: u16, reason: String },
}

pub struct TransportHandle {
    pub commands: mpsc::UnboundedSender<TransportCommand>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens live channels. `open` must not block on the handshake: it returns
/// immediately and reports the outcome through the handle's event stream.
pub trait TransportConnector: Send + Sync {
    fn open(&self, url: &Url) -> Result<TransportHandle>;
}

pub struct TungsteniteConnector;

impl TransportConnector for TungsteniteConnector {
    fn open(&self, url: &Url) -> Result<TransportHandle> {
        let runtime = tokio::runtime::Handle::try_current()
            .context("live channel requires a running tokio runtime")?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        runtime.spawn(run_socket(url.clone(), command_rx, event_tx));
        Ok(TransportHandle {
            commands: command_tx,
            events: event_rx,
        })
    }
}

async fn run_socket(
    url: Url,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(err) => {
            warn!(error = %err, host = url.host_str().unwrap_or_default(), "live channel handshake failed");
            let _ = events.send(TransportEvent::Error(err.to_string()));
            let _ = events.send(TransportEvent::Closed {
                code: CLOSE_ABNORMAL,
                reason: String::new(),
            });
            return;
        }
    };
    let _ = events.send(TransportEvent::Opened);
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Send(text)) => {
                    if let Err(err) = ws_writer.send(Message::Text(text)).await {
                        let _ = events.send(TransportEvent::SendFailed(err.to_string()));
                    }
                }
                Some(TransportCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(err) = ws_writer.send(Message::Close(Some(frame))).await {
                        debug!(error = %err, "close frame not delivered");
                    }
                    break;
                }
                None => {
                    let _ = ws_writer.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = ws_reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Text(text));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    let _ = events.send(TransportEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(TransportEvent::Error(format!(
                        "websocket receive failed: {err}"
                    )));
                    let _ = events.send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    break;
                }
                None => {
                    let _ = events.send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: String::new(),
                    });
                    break;
                }
            },
        }
    }
}
