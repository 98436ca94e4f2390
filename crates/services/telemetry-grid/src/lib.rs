//! Telemetry Grid
//!
//! Time-grid logger for live sensor telemetry. Every configured sensor
//! pushes JSON datagrams to its own UDP port; the grid keeps the most recent
//! sample per channel and, on a fixed schedule, flattens all of them into one
//! frame that is appended to a JSONL log and streamed to UDP subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      remotemedia-telemetry-grid                         │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────┐                                                   │
//! │  │ Channel Listener │ ← UDP :6666, :5555, ... (one task per channel)    │
//! │  │ (decode + tag)   │                                                   │
//! │  └────────┬─────────┘                                                   │
//! │           │ publish (last write wins)                                   │
//! │           ▼                                                             │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌────────────────────┐  │
//! │  │  Snapshot Store  │──▶│    Aggregator    │──▶│  JSONL frame log   │  │
//! │  │  (one slot/chan) │   │  (tick schedule) │   │  (append + flush)  │  │
//! │  └──────────────────┘   └────────┬─────────┘   └────────────────────┘  │
//! │                                  │ fan-out                              │
//! │                                  ▼                                      │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │  Subscription Manager (UDP :9100, SUBSCRIBE / UNSUBSCRIBE)        │  │
//! │  └──────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod flatten;
pub mod frame;
pub mod grid;
pub mod metrics;
pub mod service;
pub mod shutdown;
pub mod sink;
pub mod store;
pub mod stream;
pub mod tap;

/// Current wall-clock time as fractional unix seconds
pub fn wall_clock_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}
