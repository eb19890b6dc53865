//! Socket connectors
//!
//! A [`Connector`] turns a [`Region`] into a pair of text channels. The
//! production connector runs a tungstenite pump task per socket; tests plug
//! in an in-memory script instead.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use pocket_core::{PocketError, PocketResult};

use crate::region::Region;

/// Frames buffered between the socket and the session in either direction
const CHANNEL_CAPACITY: usize = 256;

/// Both directions of one open socket
///
/// Dropping `outbound` closes the socket; `inbound` ends when it closes.
pub struct FrameChannel {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<PocketResult<String>>,
}

impl FrameChannel {
    /// Channel pair plus the far ends, for connectors that pump frames
    pub fn pair() -> (
        Self,
        mpsc::Receiver<String>,
        mpsc::Sender<PocketResult<String>>,
    ) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            out_rx,
            in_tx,
        )
    }
}

/// Opens one socket to one endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, region: &Region) -> PocketResult<FrameChannel>;
}

pub(crate) fn ws_error(e: tungstenite::Error) -> PocketError {
    PocketError::websocket(e.to_string())
}

/// tokio-tungstenite connector
#[derive(Debug, Clone)]
pub struct WsConnector {
    origin: String,
    user_agent: String,
    open_timeout: Duration,
}

impl WsConnector {
    pub fn new(origin: impl Into<String>, user_agent: impl Into<String>, open_timeout: Duration) -> Self {
        Self {
            origin: origin.into(),
            user_agent: user_agent.into(),
            open_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, region: &Region) -> PocketResult<FrameChannel> {
        let mut request = region.url.as_str().into_client_request().map_err(ws_error)?;

        let headers = request.headers_mut();
        if let Ok(origin) = HeaderValue::from_str(&self.origin) {
            headers.insert("Origin", origin);
        }
        if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
            headers.insert("User-Agent", agent);
        }

        let (ws_stream, _) = tokio::time::timeout(self.open_timeout, connect_async(request))
            .await
            .map_err(|_| PocketError::websocket(format!("open timed out: {}", region.name)))?
            .map_err(ws_error)?;

        info!("[PO WS] Socket open: {}", region);

        let (channel, mut out_rx, in_tx) = FrameChannel::pair();
        let (mut write, mut read) = ws_stream.split();
        let name = region.name.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => {
                        match outgoing {
                            Some(text) => {
                                if let Err(e) = write.send(Message::Text(text.into())).await {
                                    warn!("[PO WS] Send failed on {}: {}", name, e);
                                    let _ = in_tx.send(Err(ws_error(e))).await;
                                    break;
                                }
                            }
                            // Session side hung up
                            None => break,
                        }
                    }
                    incoming = read.next() => {
                        let frame = match incoming {
                            Some(Ok(Message::Text(text))) => Ok(text.to_string()),
                            Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes.to_vec())
                                .map_err(|e| PocketError::malformed(format!("binary frame is not UTF-8: {}", e))),
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    warn!("[PO WS] Failed to send pong on {}: {}", name, e);
                                    break;
                                }
                                continue;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("[PO WS] Connection closed by server ({}): {:?}", name, frame);
                                break;
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("[PO WS] Read error on {}: {}", name, e);
                                let _ = in_tx.send(Err(ws_error(e))).await;
                                break;
                            }
                            None => {
                                info!("[PO WS] Stream ended ({})", name);
                                break;
                            }
                        };

                        if in_tx.send(frame).await.is_err() {
                            // Listener gone
                            break;
                        }
                    }
                }
            }

            let _ = write.close().await;
            debug!("[PO WS] Pump for {} stopped", name);
        });

        Ok(channel)
    }
}
