use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{WebSocketStream, connect_async};
use url::Url;

use super::state::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use crate::errors::HavenError;

/// Frames the driver writes to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
}

/// Frames the socket hands back to the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// Answer to one of our keep-alive pings.
    Pong,
    Closed { code: u16, reason: String },
}

/// An open socket, seen as a pair of channels.
///
/// The [`Connector`] that produced it owns whatever pumps bytes between the
/// channels and the network.
#[derive(Debug)]
pub struct Socket {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

impl Socket {
    pub fn new(
        outbound: mpsc::UnboundedSender<OutboundFrame>,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
    ) -> Self {
        Self { outbound, inbound }
    }

    pub fn send(&self, frame: OutboundFrame) -> Result<(), HavenError> {
        self.outbound
            .send(frame)
            .map_err(|_| HavenError::Transport("socket writer is gone".into()))
    }

    /// Next inbound frame. A vanished transport reads as an abnormal close.
    pub async fn recv(&mut self) -> InboundFrame {
        self.inbound.recv().await.unwrap_or_else(|| InboundFrame::Closed {
            code: ABNORMAL_CLOSURE,
            reason: "transport dropped".into(),
        })
    }

    /// Send a close frame and release the socket.
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.outbound.send(OutboundFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Opens sockets for the connection driver.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, url: &Url) -> impl Future<Output = Result<Socket, HavenError>> + Send;
}

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Socket, HavenError> {
        tracing::info!("opening websocket to {}", redact_token(url));
        let (ws, _response) = connect_async(url.as_str()).await.map_err(map_connect_error)?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(ws, out_rx, in_tx));
        Ok(Socket::new(out_tx, in_rx))
    }
}

fn map_connect_error(e: WsError) -> HavenError {
    match e {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                HavenError::Auth(format!("socket handshake rejected with {status}"))
            } else {
                HavenError::Transport(format!("socket handshake failed with {status}"))
            }
        }
        other => HavenError::Transport(other.to_string()),
    }
}

/// The token rides in the query string; keep it out of the logs.
pub(crate) fn redact_token(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let result = match frame {
                    Some(OutboundFrame::Text(text)) => sink.send(WsMessage::text(text)).await,
                    Some(OutboundFrame::Ping) => sink.send(WsMessage::Ping(Default::default())).await,
                    Some(OutboundFrame::Close { code, reason }) => {
                        let _ = sink.send(close_message(code, reason)).await;
                        let _ = sink.close().await;
                        break;
                    }
                    None => {
                        let _ = sink.send(close_message(NORMAL_CLOSURE, String::new())).await;
                        let _ = sink.close().await;
                        break;
                    }
                };
                if let Err(e) = result {
                    tracing::warn!("websocket write failed: {e}");
                    let _ = inbound.send(InboundFrame::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    });
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = inbound.send(InboundFrame::Text(text.to_string()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    let _ = inbound.send(InboundFrame::Closed { code, reason });
                    break;
                }
                Some(Ok(WsMessage::Pong(_))) => {
                    let _ = inbound.send(InboundFrame::Pong);
                }
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = inbound.send(InboundFrame::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    });
                    break;
                }
                None => {
                    let _ = inbound.send(InboundFrame::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".into(),
                    });
                    break;
                }
            },
        }
    }
    tracing::debug!("websocket pump finished");
}

fn close_message(code: u16, reason: String) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}
