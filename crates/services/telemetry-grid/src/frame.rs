//! Frames: one synchronized, flattened snapshot of every channel per tick

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::channel::Channel;
use crate::flatten::{flatten_sample, FlatFields};
use crate::store::Snapshot;

/// One row of the frame log
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// 1-based, +1 per tick, never skips
    pub index: u64,

    /// Wall-clock time the frame was taken, unix seconds
    pub timestamp: f64,

    /// Flattened channel columns
    pub fields: FlatFields,
}

impl Frame {
    /// Build a frame from a store snapshot
    ///
    /// Channels are visited in configuration order. A channel that has not
    /// received anything yet contributes no columns at all.
    pub fn assemble(
        index: u64,
        timestamp: f64,
        channels: &[Channel],
        snapshot: &Snapshot,
        identity_field: Option<&str>,
    ) -> Self {
        let mut fields = FlatFields::new();
        for channel in channels {
            if let Some(Some(sample)) = snapshot.get(channel.id.index()) {
                flatten_sample(&channel.name, sample, identity_field, &mut fields);
            }
        }
        Self {
            index,
            timestamp,
            fields,
        }
    }

    /// Serialize as a single JSON line (no trailing newline)
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Whether any column of `channel` is present
    pub fn has_channel(&self, channel: &str) -> bool {
        self.fields.contains_key(&format!("{}_log_ts", channel))
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 2))?;
        map.serialize_entry("frame_ts", &self.timestamp)?;
        map.serialize_entry("frame_idx", &self.index)?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}
