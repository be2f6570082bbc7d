//! Where sessions get their channels from.
//!
//! `SwarmTransport` hands a session its relay room, the keystream provider
//! stream and a link backend. `WsTransport` is the networked
//! implementation; the in-memory one lives in `testing`.

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use limeshare_crypto::ProviderFrame;
use limeshare_types::{RelayFrame, RelayMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::config::SwarmConfig;
use crate::error::TransferError;
use crate::links::{LinkBackend, LinkEvent, TcpLinkBackend};
use crate::relay::{relay_pipe, RelayChannel};

/// Close code reported when the provider socket ends without a close frame.
const CLOSE_NO_STATUS: u16 = 1005;

pub trait SwarmTransport: Send + Sync + 'static {
    /// Join relay room `room`.
    fn open_relay(&self, room: String) -> BoxFuture<'_, Result<RelayChannel, TransferError>>;

    /// Start a keystream of `total_size` bytes in `chunk_size` frames.
    fn open_keystream(
        &self,
        total_size: u64,
        chunk_size: usize,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<ProviderFrame>, TransferError>>;

    /// A fresh link backend reporting to `events`.
    fn link_backend(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn LinkBackend>;
}

/// WebSocket relay and provider, TCP peer links.
pub struct WsTransport {
    config: SwarmConfig,
}

impl WsTransport {
    pub fn new(config: SwarmConfig) -> Self {
        Self { config }
    }

    pub fn relay_room_url(&self, room: &str) -> String {
        format!("{}/room/{}", self.config.relay_url, room)
    }

    pub fn keystream_url(&self, total_size: u64) -> String {
        format!("{}/ws/key/{}", self.config.keystream_url, total_size)
    }
}

impl SwarmTransport for WsTransport {
    fn open_relay(&self, room: String) -> BoxFuture<'_, Result<RelayChannel, TransferError>> {
        let url = self.relay_room_url(&room);
        async move { connect_relay(url).await }.boxed()
    }

    fn open_keystream(
        &self,
        total_size: u64,
        _chunk_size: usize,
    ) -> BoxFuture<'_, Result<mpsc::UnboundedReceiver<ProviderFrame>, TransferError>> {
        let url = self.keystream_url(total_size);
        async move { connect_provider(url).await }.boxed()
    }

    fn link_backend(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Box<dyn LinkBackend> {
        Box::new(TcpLinkBackend::new(&self.config, events))
    }
}

async fn connect_relay(url: String) -> Result<RelayChannel, TransferError> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| TransferError::RelayConnect(format!("{url}: {e}")))?;
    debug!(%url, "relay connected");

    let (mut sink, mut stream) = ws.split();
    let (sender, mut outbound) = relay_pipe();
    let (inbound_tx, inbound) = mpsc::unbounded_channel();

    // Session -> relay
    tokio::spawn(async move {
        while let Some(queued) = outbound.recv().await {
            let msg = match &queued.frame {
                RelayFrame::Control(ctrl) => match serde_json::to_string(ctrl) {
                    Ok(text) => Message::text(text),
                    Err(e) => {
                        warn!("unserializable relay frame: {}", e);
                        outbound.written(&queued);
                        continue;
                    }
                },
                RelayFrame::Binary(data) => Message::binary(data.clone()),
            };
            let result = sink.send(msg).await;
            outbound.written(&queued);
            if result.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Relay -> session
    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let frame = match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(text.as_str()) {
                    Ok(ctrl) => RelayFrame::Control(ctrl),
                    Err(e) => {
                        warn!("unparseable relay frame: {}", e);
                        continue;
                    }
                },
                Ok(Message::Binary(data)) => RelayFrame::Binary(data),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "relay closed");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("relay socket error: {}", e);
                    break;
                }
            };
            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
    });

    Ok(RelayChannel { sender, inbound })
}

async fn connect_provider(url: String) -> Result<mpsc::UnboundedReceiver<ProviderFrame>, TransferError> {
    let (ws, _) = connect_async(url.as_str())
        .await
        .map_err(|e| TransferError::ProviderConnect(format!("{url}: {e}")))?;
    debug!(%url, "keystream provider connected");

    let (_, mut stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let frame = match msg {
                Ok(Message::Binary(data)) => ProviderFrame::Binary(data),
                Ok(Message::Close(close)) => {
                    let code = close.map(|c| u16::from(c.code)).unwrap_or(CLOSE_NO_STATUS);
                    let _ = tx.send(ProviderFrame::Closed { code });
                    return;
                }
                Ok(Message::Text(text)) => {
                    trace!(text = text.as_str(), "provider notice");
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("keystream socket error: {}", e);
                    return;
                }
            };
            if tx.send(frame).is_err() {
                return;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let transport = WsTransport::new(SwarmConfig {
            relay_url: "wss://relay.example".into(),
            keystream_url: "wss://keys.example".into(),
            ..SwarmConfig::default()
        });
        assert_eq!(
            transport.relay_room_url("zkv-0123456789abcdef"),
            "wss://relay.example/room/zkv-0123456789abcdef"
        );
        assert_eq!(transport.keystream_url(1_000_000), "wss://keys.example/ws/key/1000000");
    }
}
