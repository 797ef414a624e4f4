// Render progress tracing
// Append-only JSONL trace of target and voice state transitions

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during trace operations
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// A single trace entry in the render log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// RFC 3339 timestamp of when this entry was created
    pub timestamp: String,

    /// Batch invocation this entry belongs to
    pub run_id: Uuid,

    pub target: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// State label ("idle", "rendering", "cached", "mixing", "done", "failed")
    pub state: String,

    pub message: String,

    /// Optional structured data (stem path, error details)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TraceEntry {
    /// Serialize to JSON line (with newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Trace writer shared by concurrent targets
///
/// Each entry is appended under a lock so lines never interleave.
#[derive(Debug)]
pub struct TraceWriter {
    file_path: PathBuf,
    lock: Mutex<()>,
}

impl TraceWriter {
    pub fn new(file_path: PathBuf) -> Self {
        TraceWriter {
            file_path,
            lock: Mutex::new(()),
        }
    }

    /// Append a trace entry, creating the file if needed
    pub fn write(&self, entry: &TraceEntry) -> Result<(), TraceError> {
        let json_line = entry.to_json_line()?;
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        file.write_all(json_line.as_bytes())?;
        file.flush()?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }
}

/// Helper builder for creating trace entries
pub struct TraceBuilder {
    run_id: Uuid,
    target: String,
    voice: Option<String>,
}

impl TraceBuilder {
    /// Start building an entry for a target
    pub fn target(run_id: Uuid, target: impl Into<String>) -> Self {
        TraceBuilder {
            run_id,
            target: target.into(),
            voice: None,
        }
    }

    pub fn voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    pub fn state(self, state: impl Into<String>, message: impl Into<String>) -> TraceEntry {
        TraceEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: self.run_id,
            target: self.target,
            voice: self.voice,
            state: state.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(
        self,
        state: impl Into<String>,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> TraceEntry {
        TraceEntry {
            data: Some(data),
            ..self.state(state, message)
        }
    }
}

/// Read trace entries from a JSONL file
pub fn read_trace_file(path: &Path) -> Result<Vec<TraceEntry>, TraceError> {
    let contents = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let entry: TraceEntry = serde_json::from_str(line)?;
        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_trace_builder() {
        let run_id = Uuid::new_v4();
        let entry = TraceBuilder::target(run_id, "mix")
            .voice("bass")
            .state("rendering", "Rendering bass");

        assert_eq!(entry.run_id, run_id);
        assert_eq!(entry.target, "mix");
        assert_eq!(entry.voice.as_deref(), Some("bass"));
        assert_eq!(entry.state, "rendering");
        assert!(entry.data.is_none());
    }

    #[test]
    fn test_trace_entry_with_data() {
        let entry = TraceBuilder::target(Uuid::new_v4(), "mix").with_data(
            "done",
            "Mixed",
            serde_json::json!({ "path": "out/mix.wav" }),
        );

        assert!(entry.voice.is_none());
        assert_eq!(entry.data.unwrap()["path"], "out/mix.wav");
    }

    #[test]
    fn test_trace_writer() {
        let temp_dir = TempDir::new().unwrap();
        let trace_path = temp_dir.path().join("trace.jsonl");
        let writer = TraceWriter::new(trace_path.clone());
        let run_id = Uuid::new_v4();

        writer
            .write(&TraceBuilder::target(run_id, "mix").state("idle", "Queued"))
            .unwrap();
        writer
            .write(&TraceBuilder::target(run_id, "mix").state("done", "Mixed"))
            .unwrap();

        let entries = read_trace_file(&trace_path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].state, "idle");
        assert_eq!(entries[1].state, "done");
        assert!(entries.iter().all(|e| e.run_id == run_id));
    }

    #[test]
    fn test_concurrent_writes_keep_lines_whole() {
        let temp_dir = TempDir::new().unwrap();
        let trace_path = temp_dir.path().join("trace.jsonl");
        let writer = Arc::new(TraceWriter::new(trace_path.clone()));
        let run_id = Uuid::new_v4();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let entry = TraceBuilder::target(run_id, format!("target{}", i))
                            .state("rendering", "x".repeat(200));
                        writer.write(&entry).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(read_trace_file(&trace_path).unwrap().len(), 100);
    }

    #[test]
    fn test_json_line_format() {
        let entry = TraceBuilder::target(Uuid::new_v4(), "mix").state("mixing", "Mixing");
        let json_line = entry.to_json_line().unwrap();

        assert!(json_line.ends_with('\n'));
        assert!(!json_line.contains("\"voice\""));

        let parsed: TraceEntry = serde_json::from_str(json_line.trim()).unwrap();
        assert_eq!(parsed, entry);
    }
}
