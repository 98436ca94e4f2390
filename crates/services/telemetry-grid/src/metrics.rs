//! Instrumentation for the telemetry grid
//!
//! Per-channel packet counters plus a few grid-wide totals. Every counter is
//! an independent atomic, so ingest tasks never contend with each other or
//! with the aggregator reading them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::channel::ChannelId;

struct ChannelCounter {
    name: String,
    packets: AtomicU64,
}

/// Grid metrics collector
///
/// Constructed once at startup and shared via `Arc` with every task.
pub struct Metrics {
    /// Packets accepted per channel, in channel order
    channels: Vec<ChannelCounter>,

    /// Datagrams dropped because they were not valid UTF-8 JSON
    decode_errors: AtomicU64,

    /// Socket-level receive failures across all channels
    receive_errors: AtomicU64,

    /// Frames written since startup
    frames_emitted: AtomicU64,

    /// Frame sends that failed for one subscriber
    fanout_failures: AtomicU64,

    started: Instant,
}

impl Metrics {
    /// Create a collector with one packet counter per channel name
    pub fn new<I, S>(channel_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            channels: channel_names
                .into_iter()
                .map(|name| ChannelCounter {
                    name: name.into(),
                    packets: AtomicU64::new(0),
                })
                .collect(),
            decode_errors: AtomicU64::new(0),
            receive_errors: AtomicU64::new(0),
            frames_emitted: AtomicU64::new(0),
            fanout_failures: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// Record an accepted packet on a channel
    pub fn packet_received(&self, channel: ChannelId) {
        if let Some(counter) = self.channels.get(channel.index()) {
            counter.packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Packets accepted so far on a channel
    pub fn channel_packets(&self, channel: ChannelId) -> u64 {
        self.channels
            .get(channel.index())
            .map(|c| c.packets.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an emitted frame, returning the new total
    pub fn frame_emitted(&self) -> u64 {
        self.frames_emitted.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn fanout_failed(&self) {
        self.fanout_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_per_channel: self
                .channels
                .iter()
                .map(|c| ChannelPackets {
                    channel: c.name.clone(),
                    packets: c.packets.load(Ordering::Relaxed),
                })
                .collect(),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            fanout_failures: self.fanout_failures.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// Packet count for one channel
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChannelPackets {
    pub channel: String,
    pub packets: u64,
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Accepted packets per channel, in channel order
    pub packets_per_channel: Vec<ChannelPackets>,

    /// Datagrams dropped by the decoder
    pub decode_errors: u64,

    /// Socket receive failures
    pub receive_errors: u64,

    /// Frames written
    pub frames_emitted: u64,

    /// Failed per-subscriber sends
    pub fanout_failures: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Total packets accepted across all channels
    pub fn total_packets(&self) -> u64 {
        self.packets_per_channel.iter().map(|c| c.packets).sum()
    }

    /// Calculate frames per second
    pub fn frames_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.frames_emitted as f64 / self.uptime_secs as f64
        }
    }

    /// `name=count` pairs for log lines
    pub fn packets_summary(&self) -> String {
        self.packets_per_channel
            .iter()
            .map(|c| format!("{}={}", c.channel, c.packets))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new(["front_imu", "rear_tyre"]);
        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.packets_per_channel.len(), 2);
        assert_eq!(snapshot.total_packets(), 0);
        assert_eq!(snapshot.frames_emitted, 0);
        assert_eq!(snapshot.decode_errors, 0);
    }

    #[test]
    fn test_channel_counters_are_independent() {
        let metrics = Metrics::new(["front_imu", "rear_tyre"]);

        for _ in 0..3 {
            metrics.packet_received(ChannelId::new(0));
        }
        metrics.packet_received(ChannelId::new(1));
        // Unknown channel is ignored
        metrics.packet_received(ChannelId::new(9));

        assert_eq!(metrics.channel_packets(ChannelId::new(0)), 3);
        assert_eq!(metrics.channel_packets(ChannelId::new(1)), 1);
        assert_eq!(metrics.channel_packets(ChannelId::new(9)), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_packets(), 4);
        assert_eq!(snapshot.packets_summary(), "front_imu=3 rear_tyre=1");
    }

    #[test]
    fn test_frame_and_error_tracking() {
        let metrics = Metrics::new(["a"]);

        assert_eq!(metrics.frame_emitted(), 1);
        assert_eq!(metrics.frame_emitted(), 2);
        metrics.decode_error();
        metrics.receive_error();
        metrics.fanout_failed();
        metrics.fanout_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_emitted, 2);
        assert_eq!(snapshot.decode_errors, 1);
        assert_eq!(snapshot.receive_errors, 1);
        assert_eq!(snapshot.fanout_failures, 2);
    }
}
