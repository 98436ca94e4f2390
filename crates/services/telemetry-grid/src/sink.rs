//! Frame sink trait and implementations
//!
//! The aggregator hands every serialized frame to a `FrameSink`. The
//! production sink appends to a JSONL file; `MemorySink` captures lines
//! for tests and tooling.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

/// Trait for frame log targets
pub trait FrameSink: Send + Sync {
    /// Append one serialized frame. The line must be durable (flushed)
    /// before this returns.
    fn write_line(&self, line: &str) -> Result<(), SinkError>;
}

/// Error type for sink operations
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Newline-delimited JSON sink
///
/// Writes each frame followed by `\n` and flushes immediately, so at most
/// the frame being written is lost on a crash.
pub struct JsonlSink<W: Write + Send> {
    writer: Mutex<W>,
}

/// Append-only frame log on disk
pub type FileSink = JsonlSink<BufWriter<File>>;

impl<W: Write + Send> JsonlSink<W> {
    /// Create a sink writing to the specified output
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl JsonlSink<BufWriter<File>> {
    /// Open (or create) a log file in append mode
    pub fn append<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> FrameSink for JsonlSink<W> {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same line buffer
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for MemorySink {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");

        let sink = FileSink::append(&path).unwrap();
        sink.write_line(r#"{"frame_idx":1}"#).unwrap();
        sink.write_line(r#"{"frame_idx":2}"#).unwrap();

        // Flushed without dropping the sink
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"frame_idx\":1}\n{\"frame_idx\":2}\n");
    }

    #[test]
    fn test_jsonl_sink_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.jsonl");

        FileSink::append(&path).unwrap().write_line("a").unwrap();
        FileSink::append(&path).unwrap().write_line("b").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_append_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("frames.jsonl");
        assert!(matches!(FileSink::append(&path), Err(SinkError::Io(_))));
    }

    #[test]
    fn test_memory_sink_shares_buffer() {
        let sink = MemorySink::new();
        let handle = sink.clone();

        sink.write_line("one").unwrap();
        sink.write_line("two").unwrap();

        assert_eq!(handle.lines(), vec!["one", "two"]);
        assert_eq!(handle.len(), 2);
    }
}
