//! Time-grid aggregator
//!
//! Ticks on a fixed grid anchored at startup. Every tick snapshots the
//! store, flattens the channels into one frame, appends the frame to the log
//! and streams the identical bytes to subscribers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::channel::Channel;
use crate::frame::Frame;
use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use crate::sink::{FrameSink, SinkError};
use crate::store::SnapshotStore;
use crate::stream::SubscriptionManager;

/// Absolute tick schedule
///
/// Deadlines are computed as `anchor + slot * interval`, never by adding up
/// sleeps, so per-tick jitter does not accumulate. When a deadline has
/// already passed the tick fires at once and the schedule skips ahead to the
/// next boundary after `now`: a stall costs grid slots, never a burst of
/// back-to-back frames.
#[derive(Debug, Clone)]
pub struct TickSchedule {
    anchor: Instant,
    interval: Duration,
    slot: u64,
}

impl TickSchedule {
    pub fn new(anchor: Instant, interval: Duration) -> Self {
        Self {
            anchor,
            interval,
            slot: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn boundary(&self, slot: u64) -> Instant {
        let nanos = (self.interval.as_nanos() as u64).saturating_mul(slot);
        self.anchor + Duration::from_nanos(nanos)
    }

    /// Deadline for the next tick, or `None` if it is due now
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        let target = self.boundary(self.slot);
        if target > now {
            self.slot += 1;
            return Some(target);
        }

        let elapsed = now.saturating_duration_since(self.anchor).as_nanos();
        let interval = self.interval.as_nanos().max(1);
        self.slot = (elapsed / interval) as u64 + 1;
        None
    }
}

/// Aggregator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridState {
    Idle,
    Ticking,
}

/// Aggregator errors
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("Failed to open frame log {path}: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: SinkError,
    },

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Time-grid aggregator
pub struct Aggregator {
    channels: Vec<Channel>,
    store: Arc<SnapshotStore>,
    metrics: Arc<Metrics>,
    sink: Box<dyn FrameSink>,
    stream: Option<Arc<SubscriptionManager>>,
    interval: Duration,
    stats_every: u64,
    identity_field: Option<String>,
    frame_idx: u64,
    state: GridState,
    shutdown: Shutdown,
}

impl Aggregator {
    pub fn new(
        channels: Vec<Channel>,
        store: Arc<SnapshotStore>,
        metrics: Arc<Metrics>,
        sink: Box<dyn FrameSink>,
        interval: Duration,
    ) -> Self {
        Self {
            channels,
            store,
            metrics,
            sink,
            stream: None,
            interval,
            stats_every: 100,
            identity_field: None,
            frame_idx: 0,
            state: GridState::Idle,
            shutdown: Shutdown::none(),
        }
    }

    /// Fan frames out through a subscription manager
    pub fn with_stream(mut self, stream: Arc<SubscriptionManager>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Payload field to drop before flattening
    pub fn with_identity_field(mut self, field: Option<&str>) -> Self {
        self.identity_field = field.map(str::to_string);
        self
    }

    /// Diagnostics summary period in frames
    pub fn with_stats_every(mut self, frames: u64) -> Self {
        self.stats_every = frames.max(1);
        self
    }

    /// Set shutdown signal sender
    pub fn with_shutdown(mut self, shutdown_tx: &broadcast::Sender<()>) -> Self {
        self.shutdown = Shutdown::new(shutdown_tx);
        self
    }

    pub fn state(&self) -> GridState {
        self.state
    }

    /// Index of the last emitted frame (0 before the first tick)
    pub fn frame_idx(&self) -> u64 {
        self.frame_idx
    }

    /// Build, persist and stream one frame
    ///
    /// Log write and fan-out failures are logged; neither stops the grid.
    /// Returns the serialized frame.
    pub async fn tick(&mut self) -> Result<String, GridError> {
        self.frame_idx += 1;
        let frame_ts = crate::wall_clock_secs();
        let snapshot = self.store.snapshot();

        let frame = Frame::assemble(
            self.frame_idx,
            frame_ts,
            &self.channels,
            &snapshot,
            self.identity_field.as_deref(),
        );
        let line = frame.to_line()?;

        if let Err(e) = self.sink.write_line(&line) {
            tracing::error!(frame_idx = self.frame_idx, "Frame log write failed: {}", e);
        }

        if let Some(stream) = &self.stream {
            stream.fan_out(line.as_bytes()).await;
        }

        let emitted = self.metrics.frame_emitted();
        if emitted % self.stats_every == 0 {
            self.log_summary();
        }

        Ok(line)
    }

    fn log_summary(&self) {
        let snapshot = self.metrics.snapshot();
        let subscribers = self
            .stream
            .as_ref()
            .map(|s| s.subscriber_count())
            .unwrap_or(0);

        tracing::info!(
            frames = snapshot.frames_emitted,
            packets = %snapshot.packets_summary(),
            decode_errors = snapshot.decode_errors,
            fanout_failures = snapshot.fanout_failures,
            subscribers,
            "Grid summary"
        );
    }

    /// Tick until shutdown
    pub async fn run(mut self) -> Result<(), GridError> {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            channels = self.channels.len(),
            "Aggregator started"
        );

        self.state = GridState::Ticking;
        let mut schedule = TickSchedule::new(Instant::now(), self.interval);

        loop {
            match schedule.next_deadline(Instant::now()) {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.shutdown.recv() => break,
                    }
                }
                None => {
                    if self.shutdown.is_triggered() {
                        break;
                    }
                    tracing::debug!(frame_idx = self.frame_idx + 1, "Tick overran, firing now");
                }
            }

            if let Err(e) = self.tick().await {
                tracing::error!(frame_idx = self.frame_idx, "Frame dropped: {}", e);
            }
        }

        tracing::info!(frames = self.frame_idx, "Aggregator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::sink::MemorySink;
    use crate::store::Sample;
    use serde_json::{json, Value};

    const MS: Duration = Duration::from_millis(1);

    fn aggregator(sink: MemorySink, store: Arc<SnapshotStore>) -> Aggregator {
        let channels = vec![
            Channel::new(ChannelId::new(0), "front_imu", 6666),
            Channel::new(ChannelId::new(1), "rear_tyre", 1111),
        ];
        let metrics = Arc::new(Metrics::new(["front_imu", "rear_tyre"]));
        Aggregator::new(channels, store, metrics, Box::new(sink), 20 * MS)
            .with_identity_field(Some("node"))
    }

    #[test]
    fn test_schedule_first_tick_is_immediate() {
        let anchor = Instant::now();
        let mut schedule = TickSchedule::new(anchor, 20 * MS);

        assert_eq!(schedule.next_deadline(anchor), None);
        assert_eq!(schedule.next_deadline(anchor + MS), Some(anchor + 20 * MS));
        assert_eq!(schedule.next_deadline(anchor + 21 * MS), Some(anchor + 40 * MS));
    }

    #[test]
    fn test_schedule_does_not_drift() {
        let anchor = Instant::now();
        let mut schedule = TickSchedule::new(anchor, 20 * MS);
        schedule.next_deadline(anchor);

        // Each tick wakes 3 ms late; deadlines stay on the grid
        let mut now = anchor;
        for n in 1..=50u32 {
            let deadline = schedule.next_deadline(now).unwrap();
            assert_eq!(deadline, anchor + 20 * MS * n);
            now = deadline + 3 * MS;
        }
    }

    #[test]
    fn test_schedule_overrun_fires_once_then_realigns() {
        let anchor = Instant::now();
        let mut schedule = TickSchedule::new(anchor, 20 * MS);
        schedule.next_deadline(anchor);
        assert_eq!(schedule.next_deadline(anchor + MS), Some(anchor + 20 * MS));

        // Processing stalls until 75 ms; the 40 and 60 ms slots are missed
        assert_eq!(schedule.next_deadline(anchor + 75 * MS), None);
        // No catch-up burst: next wait is the 80 ms boundary
        assert_eq!(schedule.next_deadline(anchor + 76 * MS), Some(anchor + 80 * MS));
        assert_eq!(schedule.next_deadline(anchor + 81 * MS), Some(anchor + 100 * MS));
    }

    #[test]
    fn test_schedule_overrun_on_exact_boundary() {
        let anchor = Instant::now();
        let mut schedule = TickSchedule::new(anchor, 20 * MS);
        schedule.next_deadline(anchor);
        schedule.next_deadline(anchor);

        assert_eq!(schedule.next_deadline(anchor + 40 * MS), None);
        assert_eq!(schedule.next_deadline(anchor + 40 * MS), Some(anchor + 60 * MS));
    }

    #[tokio::test]
    async fn test_tick_indices_are_sequential() {
        let sink = MemorySink::new();
        let mut agg = aggregator(sink.clone(), Arc::new(SnapshotStore::new(2)));
        assert_eq!(agg.state(), GridState::Idle);

        for _ in 0..5 {
            agg.tick().await.unwrap();
        }

        let indices: Vec<u64> = sink
            .lines()
            .iter()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["frame_idx"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
        assert_eq!(agg.frame_idx(), 5);
    }

    #[tokio::test]
    async fn test_channel_appears_after_first_sample() {
        let sink = MemorySink::new();
        let store = Arc::new(SnapshotStore::new(2));
        let mut agg = aggregator(sink.clone(), store.clone());

        let before: Value = serde_json::from_str(&agg.tick().await.unwrap()).unwrap();
        assert_eq!(before.as_object().unwrap().len(), 2);

        store.publish(
            ChannelId::new(0),
            Sample::new(json!({"ts": 1.0, "node": "front_imu", "imu": {"ax": 0.1}}), 99.5),
        );

        let after: Value = serde_json::from_str(&agg.tick().await.unwrap()).unwrap();
        assert_eq!(after["front_imu_ts"], json!(1.0));
        assert_eq!(after["front_imu_imu_ax"], json!(0.1));
        assert_eq!(after["front_imu_log_ts"], json!(99.5));
        assert!(after.get("front_imu_node").is_none());
        assert!(after.get("rear_tyre_log_ts").is_none());
    }

    #[tokio::test]
    async fn test_stale_sample_repeats_every_tick() {
        let sink = MemorySink::new();
        let store = Arc::new(SnapshotStore::new(2));
        store.publish(ChannelId::new(1), Sample::new(json!({"temp": 30}), 5.0));
        let mut agg = aggregator(sink.clone(), store);

        agg.tick().await.unwrap();
        agg.tick().await.unwrap();

        for line in sink.lines() {
            let frame: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(frame["rear_tyre_temp"], json!(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_one_frame_per_interval() {
        let sink = MemorySink::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let agg = aggregator(sink.clone(), Arc::new(SnapshotStore::new(2))).with_shutdown(&shutdown_tx);

        let handle = tokio::spawn(agg.run());
        tokio::time::sleep(Duration::from_millis(990)).await;
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        // Ticks at 0, 20, ..., 980 ms
        let lines = sink.lines();
        assert_eq!(lines.len(), 50);
        for (i, line) in lines.iter().enumerate() {
            let frame: Value = serde_json::from_str(line).unwrap();
            assert_eq!(frame["frame_idx"].as_u64().unwrap(), i as u64 + 1);
        }
    }
}
