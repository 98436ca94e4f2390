//! Subscriber streaming
//!
//! A single UDP socket serves both directions: clients send `SUBSCRIBE` or
//! `UNSUBSCRIBE` to it, and the aggregator sends every frame from it to the
//! registered addresses. The control channel is never acknowledged.
//!
//! A client that rebinds to a new ephemeral port just sends `SUBSCRIBE`
//! again; the old entry for its IP is replaced rather than kept alongside.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::metrics::Metrics;
use crate::shutdown::Shutdown;

/// Control datagrams are short words; anything longer is junk
const CONTROL_BUFFER_BYTES: usize = 1024;

/// Control command carried by one datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Subscribe,
    Unsubscribe,
    Unknown,
}

impl ControlCommand {
    /// Parse a whole datagram, ignoring surrounding whitespace and case
    pub fn parse(bytes: &[u8]) -> Self {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text.trim(),
            Err(_) => return ControlCommand::Unknown,
        };
        if text.eq_ignore_ascii_case("SUBSCRIBE") {
            ControlCommand::Subscribe
        } else if text.eq_ignore_ascii_case("UNSUBSCRIBE") {
            ControlCommand::Unsubscribe
        } else {
            ControlCommand::Unknown
        }
    }
}

/// Result of applying a control command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Sender registered; `replaced` lists earlier entries from the same IP
    Subscribed {
        replaced: Vec<SocketAddr>,
        total: usize,
    },

    /// Subscriber cap reached, sender not registered
    Rejected { replaced: Vec<SocketAddr> },

    Unsubscribed { total: usize },

    /// UNSUBSCRIBE from an address that was not registered
    NotSubscribed,

    /// Unrecognized command, no state change
    Ignored,
}

#[derive(Debug, Clone)]
struct Subscriber {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Registered subscriber addresses, at most one per IP
pub struct SubscriberRegistry {
    entries: Vec<Subscriber>,
    max_subscribers: usize,
    ttl: Option<Duration>,
}

impl SubscriberRegistry {
    pub fn new(max_subscribers: usize, ttl: Option<Duration>) -> Self {
        Self {
            entries: Vec::new(),
            max_subscribers,
            ttl,
        }
    }

    pub fn apply(&mut self, command: ControlCommand, addr: SocketAddr, now: Instant) -> ControlOutcome {
        match command {
            ControlCommand::Subscribe => self.subscribe(addr, now),
            ControlCommand::Unsubscribe => self.unsubscribe(addr),
            ControlCommand::Unknown => ControlOutcome::Ignored,
        }
    }

    /// Register `addr`, replacing any entry with the same IP
    pub fn subscribe(&mut self, addr: SocketAddr, now: Instant) -> ControlOutcome {
        let mut replaced = Vec::new();
        self.entries.retain(|s| {
            if s.addr.ip() == addr.ip() {
                replaced.push(s.addr);
                false
            } else {
                true
            }
        });

        if self.entries.len() < self.max_subscribers {
            self.entries.push(Subscriber {
                addr,
                last_seen: now,
            });
            ControlOutcome::Subscribed {
                replaced,
                total: self.entries.len(),
            }
        } else {
            ControlOutcome::Rejected { replaced }
        }
    }

    /// Remove exactly `addr`
    pub fn unsubscribe(&mut self, addr: SocketAddr) -> ControlOutcome {
        let before = self.entries.len();
        self.entries.retain(|s| s.addr != addr);
        if self.entries.len() < before {
            ControlOutcome::Unsubscribed {
                total: self.entries.len(),
            }
        } else {
            ControlOutcome::NotSubscribed
        }
    }

    /// Drop subscribers not refreshed within the TTL
    pub fn prune_expired(&mut self, now: Instant) -> Vec<SocketAddr> {
        let Some(ttl) = self.ttl else {
            return Vec::new();
        };
        let mut expired = Vec::new();
        self.entries.retain(|s| {
            if now.saturating_duration_since(s.last_seen) > ttl {
                expired.push(s.addr);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.entries.iter().map(|s| s.addr).collect()
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.entries.iter().any(|s| s.addr == addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_subscribers(&self) -> usize {
        self.max_subscribers
    }
}

/// Delivery summary for one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Stream errors
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control server and frame fan-out over one shared socket
pub struct SubscriptionManager {
    socket: UdpSocket,
    registry: Mutex<SubscriberRegistry>,
    static_targets: Vec<SocketAddr>,
    metrics: Option<Arc<Metrics>>,
}

impl SubscriptionManager {
    /// Bind the stream socket
    pub async fn bind(
        host: &str,
        port: u16,
        max_subscribers: usize,
        ttl: Option<Duration>,
    ) -> Result<Self, StreamError> {
        let addr = format!("{}:{}", host, port);
        let socket = UdpSocket::bind(&addr)
            .await
            .map_err(|source| StreamError::Bind { addr, source })?;
        Ok(Self::from_socket(socket, max_subscribers, ttl))
    }

    pub fn from_socket(socket: UdpSocket, max_subscribers: usize, ttl: Option<Duration>) -> Self {
        Self {
            socket,
            registry: Mutex::new(SubscriberRegistry::new(max_subscribers, ttl)),
            static_targets: Vec::new(),
            metrics: None,
        }
    }

    /// Addresses that receive every frame without subscribing
    pub fn with_static_targets(mut self, targets: Vec<SocketAddr>) -> Self {
        self.static_targets = targets;
        self
    }

    /// Count failed sends in the shared metrics
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn subscribers(&self) -> Vec<SocketAddr> {
        self.registry.lock().addresses()
    }

    /// Apply one control datagram from `peer`
    pub fn handle_control(&self, bytes: &[u8], peer: SocketAddr) -> ControlOutcome {
        let command = ControlCommand::parse(bytes);
        let (outcome, max) = {
            let mut registry = self.registry.lock();
            (registry.apply(command, peer, Instant::now()), registry.max_subscribers())
        };

        match &outcome {
            ControlOutcome::Subscribed { replaced, total } => {
                tracing::info!(
                    %peer,
                    replaced = ?replaced,
                    "SUBSCRIBE accepted, clients={}/{}",
                    total,
                    max
                );
            }
            ControlOutcome::Rejected { .. } => {
                tracing::warn!(%peer, "SUBSCRIBE rejected, max clients ({}) reached", max);
            }
            ControlOutcome::Unsubscribed { total } => {
                tracing::info!(%peer, "UNSUBSCRIBE accepted, clients={}/{}", total, max);
            }
            ControlOutcome::NotSubscribed => {
                tracing::debug!(%peer, "UNSUBSCRIBE from unknown address");
            }
            ControlOutcome::Ignored => {
                let text = String::from_utf8_lossy(bytes);
                tracing::warn!(%peer, command = %text.trim(), "Unknown stream command");
            }
        }

        outcome
    }

    /// Serve control datagrams until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        tracing::info!(
            addr = ?self.socket.local_addr().ok(),
            "Listening for stream clients"
        );

        let mut buf = [0u8; CONTROL_BUFFER_BYTES];

        loop {
            let received = tokio::select! {
                result = self.socket.recv_from(&mut buf) => result,
                _ = shutdown.recv() => break,
            };

            match received {
                Ok((len, peer)) => {
                    self.handle_control(&buf[..len], peer);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Stream control receive error");
                }
            }
        }

        tracing::info!("Stream control server stopped");
    }

    /// Send one frame to every subscriber and static target
    ///
    /// A failed send is logged and counted; the remaining addresses are
    /// still served.
    pub async fn fan_out(&self, bytes: &[u8]) -> FanOutReport {
        let targets = {
            let mut registry = self.registry.lock();
            for addr in registry.prune_expired(Instant::now()) {
                tracing::info!(%addr, "Subscriber expired");
            }
            registry.addresses()
        };

        let mut report = FanOutReport::default();
        for addr in targets.iter().chain(self.static_targets.iter()) {
            match self.socket.send_to(bytes, addr).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.fanout_failed();
                    }
                    tracing::warn!(%addr, error = %e, "Stream send error");
                }
            }
        }
        report
    }
}

/// Spawn the control loop for a shared manager
pub fn spawn_control(
    manager: Arc<SubscriptionManager>,
    shutdown_tx: &broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let shutdown = Shutdown::new(shutdown_tx);
    tokio::spawn(manager.run(shutdown))
}
