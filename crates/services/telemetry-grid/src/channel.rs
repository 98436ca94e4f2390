//! Sensor ingest channels
//!
//! Each configured sensor gets its own UDP socket and task. Datagrams are
//! decoded as UTF-8 JSON, stamped with their arrival time and published
//! into the snapshot store, replacing whatever the channel held before.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::config::IngestConfig;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::store::{Sample, SnapshotStore};

/// Delay between attempts to bind a channel port that is unavailable
const BIND_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Position of a channel in the configured channel list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(usize);

impl ChannelId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// A sensor source bound to one UDP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub port: u16,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            name: name.into(),
            port,
        }
    }
}

/// Channel identities in configuration order
pub fn channels_from_config(config: &IngestConfig) -> Vec<Channel> {
    config
        .channels
        .iter()
        .enumerate()
        .map(|(i, c)| Channel::new(ChannelId::new(i), c.name.clone(), c.port))
        .collect()
}

/// Why a datagram was dropped
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty datagram")]
    Empty,

    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode one datagram into a JSON object payload
///
/// Leading/trailing whitespace is ignored. A valid JSON value that is not an
/// object is wrapped as `{"raw": value}`.
pub fn decode_datagram(bytes: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(bytes)?.trim();
    if text.is_empty() {
        return Err(DecodeError::Empty);
    }
    let value: Value = serde_json::from_str(text)?;
    Ok(match value {
        Value::Object(_) => value,
        other => json!({ "raw": other }),
    })
}

/// Ingest errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Receive error: {0}")]
    Receive(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// UDP listener for a single channel
pub struct ChannelListener {
    channel: Channel,
    socket: UdpSocket,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
    shutdown: Shutdown,
}

impl ChannelListener {
    /// Bind the channel's port on `host`
    pub async fn bind(
        channel: Channel,
        host: &str,
        store: Arc<SnapshotStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, IngestError> {
        let addr = format!("{}:{}", host, channel.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| IngestError::Bind { addr, source })?;

        Ok(Self {
            channel,
            socket,
            store,
            metrics,
            buffer_size: 4096,
            shutdown: Shutdown::none(),
        })
    }

    /// Set the per-datagram receive buffer
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set shutdown signal sender
    pub fn with_shutdown(mut self, shutdown_tx: &broadcast::Sender<()>) -> Self {
        self.shutdown = Shutdown::new(shutdown_tx);
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive until shutdown
    ///
    /// Receive and decode failures are logged and the loop continues with
    /// the next datagram.
    pub async fn run(mut self) {
        let name = self.channel.name.clone();
        tracing::info!(
            channel = %name,
            addr = ?self.socket.local_addr().ok(),
            "Listening for sensor packets"
        );

        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let received = tokio::select! {
                result = self.socket.recv_from(&mut buf) => result,
                _ = self.shutdown.recv() => break,
            };

            match received {
                Ok((len, peer)) => {
                    if let Err(e) = self.handle_datagram(&buf[..len]) {
                        match e {
                            DecodeError::Empty => {
                                tracing::trace!(channel = %name, %peer, "Empty datagram ignored");
                            }
                            e => {
                                self.metrics.decode_error();
                                let raw = String::from_utf8_lossy(&buf[..len]);
                                tracing::warn!(
                                    channel = %name,
                                    %peer,
                                    raw = %raw,
                                    "Dropping packet: {}",
                                    e
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    self.metrics.receive_error();
                    tracing::warn!(channel = %name, error = %e, "UDP receive error");
                }
            }
        }

        tracing::info!(
            channel = %name,
            packets = self.metrics.channel_packets(self.channel.id),
            "Channel listener stopped"
        );
    }

    /// Decode a datagram and publish it as the channel's latest sample
    pub fn handle_datagram(&self, bytes: &[u8]) -> Result<(), DecodeError> {
        let arrival_time = crate::wall_clock_secs();
        let payload = decode_datagram(bytes)?;
        self.store
            .publish(self.channel.id, Sample::new(payload, arrival_time));
        self.metrics.packet_received(self.channel.id);
        Ok(())
    }
}

/// Bind and run a channel, retrying the bind until it succeeds
///
/// A port that is busy at startup does not take the other channels down;
/// this channel simply stays empty until the port frees up.
pub async fn run_with_retry(
    channel: Channel,
    config: IngestConfig,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown = Shutdown::new(&shutdown_tx);

    loop {
        match ChannelListener::bind(channel.clone(), &config.host, store.clone(), metrics.clone())
            .await
        {
            Ok(listener) => {
                listener
                    .with_buffer_size(config.recv_buffer_bytes)
                    .with_shutdown(&shutdown_tx)
                    .run()
                    .await;
                return;
            }
            Err(e) => {
                tracing::error!(channel = %channel.name, "{}, retrying", e);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(BIND_RETRY_INTERVAL) => {}
            _ = shutdown.recv() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    #[test]
    fn test_decode_object() {
        let value = decode_datagram(br#"  {"ts": 1.0, "imu": {"ax": 0.1}}  "#).unwrap();
        assert_eq!(value, json!({"ts": 1.0, "imu": {"ax": 0.1}}));
    }

    #[test]
    fn test_decode_wraps_non_objects() {
        assert_eq!(decode_datagram(b"42").unwrap(), json!({"raw": 42}));
        assert_eq!(decode_datagram(b"[1,2]").unwrap(), json!({"raw": [1, 2]}));
        assert_eq!(decode_datagram(br#""hi""#).unwrap(), json!({"raw": "hi"}));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_datagram(b""), Err(DecodeError::Empty)));
        assert!(matches!(decode_datagram(b" \r\n"), Err(DecodeError::Empty)));
        assert!(matches!(decode_datagram(b"{bad"), Err(DecodeError::Json(_))));
        assert!(matches!(decode_datagram(&[0xff, 0xfe]), Err(DecodeError::Utf8(_))));
    }

    #[test]
    fn test_channels_from_config() {
        let config = IngestConfig {
            channels: vec![ChannelConfig::new("a", 1), ChannelConfig::new("b", 2)],
            ..IngestConfig::default()
        };

        let channels = channels_from_config(&config);

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[1].id, ChannelId::new(1));
        assert_eq!(channels[1].name, "b");
        assert_eq!(channels[1].port, 2);
    }

    #[tokio::test]
    async fn test_handle_datagram_publishes_and_counts() {
        let store = Arc::new(SnapshotStore::new(1));
        let metrics = Arc::new(Metrics::new(["front_imu"]));
        let channel = Channel::new(ChannelId::new(0), "front_imu", 0);

        let listener = ChannelListener::bind(channel, "127.0.0.1", store.clone(), metrics.clone())
            .await
            .unwrap();

        listener.handle_datagram(br#"{"v": 1}"#).unwrap();
        assert!(listener.handle_datagram(b"not json").is_err());

        let sample = store.latest(ChannelId::new(0)).unwrap();
        assert_eq!(sample.payload, json!({"v": 1}));
        assert!(sample.arrival_time > 0.0);
        assert_eq!(metrics.channel_packets(ChannelId::new(0)), 1);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let store = Arc::new(SnapshotStore::new(1));
        let metrics = Arc::new(Metrics::new(["a"]));
        let first = ChannelListener::bind(
            Channel::new(ChannelId::new(0), "a", 0),
            "127.0.0.1",
            store.clone(),
            metrics.clone(),
        )
        .await
        .unwrap();
        let port = first.local_addr().unwrap().port();

        let second =
            ChannelListener::bind(Channel::new(ChannelId::new(0), "a", port), "127.0.0.1", store, metrics)
                .await;
        assert!(matches!(second, Err(IngestError::Bind { .. })));
    }
}
