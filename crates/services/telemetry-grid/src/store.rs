//! Snapshot store
//!
//! Last-write-wins cache holding the most recent sample per channel. Ingest
//! tasks overwrite their own slot; the aggregator copies every slot out once
//! per tick. Slots hold `Arc<Sample>`, so both operations only move pointers
//! while the lock is held.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::channel::ChannelId;

/// Most recent decoded packet for a channel
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Decoded JSON payload, always an object
    pub payload: Value,

    /// Wall-clock arrival time in unix seconds
    pub arrival_time: f64,
}

impl Sample {
    pub fn new(payload: Value, arrival_time: f64) -> Self {
        Self {
            payload,
            arrival_time,
        }
    }

    /// Sample stamped with the current wall-clock time
    pub fn arrived_now(payload: Value) -> Self {
        Self::new(payload, crate::wall_clock_secs())
    }
}

/// Copy of every slot taken at one instant, in channel order
pub type Snapshot = Vec<Option<Arc<Sample>>>;

/// Shared last-write-wins store, one slot per channel
pub struct SnapshotStore {
    slots: Mutex<Vec<Option<Arc<Sample>>>>,
}

impl SnapshotStore {
    /// Create a store with an empty slot for each channel
    pub fn new(channel_count: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; channel_count]),
        }
    }

    /// Replace a channel's sample
    pub fn publish(&self, channel: ChannelId, sample: Sample) {
        let sample = Arc::new(sample);
        let previous = {
            let mut slots = self.slots.lock();
            match slots.get_mut(channel.index()) {
                Some(slot) => slot.replace(sample),
                None => {
                    tracing::warn!(channel = channel.index(), "Publish to unknown channel slot");
                    None
                }
            }
        };
        // The replaced sample is released outside the lock
        drop(previous);
    }

    /// Copy out every slot
    pub fn snapshot(&self) -> Snapshot {
        self.slots.lock().clone()
    }

    /// Current sample of one channel
    pub fn latest(&self, channel: ChannelId) -> Option<Arc<Sample>> {
        self.slots.lock().get(channel.index()).cloned().flatten()
    }

    /// Number of channel slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_store_is_empty() {
        let store = SnapshotStore::new(3);
        assert_eq!(store.len(), 3);
        assert!(store.snapshot().iter().all(Option::is_none));
    }

    #[test]
    fn test_publish_overwrites_slot() {
        let store = SnapshotStore::new(2);
        let channel = ChannelId::new(1);

        store.publish(channel, Sample::new(json!({"v": 1}), 10.0));
        store.publish(channel, Sample::new(json!({"v": 2}), 11.0));

        let latest = store.latest(channel).unwrap();
        assert_eq!(latest.payload, json!({"v": 2}));
        assert_eq!(latest.arrival_time, 11.0);
        assert!(store.latest(ChannelId::new(0)).is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = SnapshotStore::new(1);
        let channel = ChannelId::new(0);
        store.publish(channel, Sample::new(json!({"v": 1}), 1.0));

        let snapshot = store.snapshot();
        store.publish(channel, Sample::new(json!({"v": 2}), 2.0));

        assert_eq!(snapshot[0].as_ref().unwrap().payload, json!({"v": 1}));
        assert_eq!(store.latest(channel).unwrap().payload, json!({"v": 2}));
    }

    #[test]
    fn test_publish_unknown_channel_is_ignored() {
        let store = SnapshotStore::new(1);
        store.publish(ChannelId::new(5), Sample::new(json!({}), 0.0));
        assert!(store.snapshot()[0].is_none());
    }

    #[test]
    fn test_concurrent_publishers() {
        let store = Arc::new(SnapshotStore::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..1000 {
                        store.publish(ChannelId::new(i), Sample::new(json!({"n": n}), n as f64));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for sample in store.snapshot() {
            assert_eq!(sample.unwrap().payload, json!({"n": 999}));
        }
    }
}
