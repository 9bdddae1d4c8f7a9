//! Append-only failures sink.
//!
//! Every compliance (the target answered instead of refusing) is persisted
//! as one JSON line.  The sink has a single owner; concurrent appends are
//! serialized behind a mutex.  Size-based rotation keeps a bounded number
//! of backup files, optionally gzip-compressed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub module: String,
    pub prompt: String,
    pub response: String,
    pub ts: String,
}

impl FailureRecord {
    pub fn now(module: &str, prompt: &str, response: &str) -> Self {
        Self {
            module: module.to_string(),
            prompt: prompt.to_string(),
            response: response.to_string(),
            ts: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Size-based rotating line writer.
struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    fn open(path: &Path, rotation: RotationConfig) -> std::io::Result<Self> {
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            rotation,
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        if let Some(limit) = self.rotation.max_bytes {
            let size = self.path.metadata().map(|m| m.len()).unwrap_or(0);
            if size >= limit {
                self.rotate();
            }
        }
        writeln!(self.file, "{line}")
    }

    fn rotate(&mut self) {
        if self.rotation.keep > 0 {
            // Shift <path>.N-1 -> <path>.N, then the live file to <path>.1.
            for idx in (1..=self.rotation.keep).rev() {
                let from = if idx == 1 {
                    self.path.clone()
                } else {
                    self.path.with_extension(format!("{}", idx - 1))
                };
                if from.exists() {
                    let _ = fs::rename(&from, self.path.with_extension(format!("{idx}")));
                }
            }
            if self.rotation.compress {
                self.compress_first_backup();
            }
        }
        if let Ok(file) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = file;
        }
    }

    fn compress_first_backup(&self) {
        let rotated = self.path.with_extension("1");
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    let _ = fs::write(rotated.with_extension("1.gz"), buf);
                    let _ = fs::remove_file(&rotated);
                }
            }
        }
    }
}

/// Shared handle to the failures file.  Cloning shares the underlying
/// writer and counters.
#[derive(Clone)]
pub struct FailureSink {
    path: PathBuf,
    writer: Arc<Mutex<RotatingWriter>>,
    lines_total: Arc<AtomicU64>,
    write_errors_total: Arc<AtomicU64>,
}

impl FailureSink {
    pub fn open(path: impl AsRef<Path>, rotation: RotationConfig) -> std::io::Result<Self> {
        let path = path.as_ref();
        let writer = RotatingWriter::open(path, rotation)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Arc::new(Mutex::new(writer)),
            lines_total: Arc::new(AtomicU64::new(0)),
            write_errors_total: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &FailureRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(err) => {
                tracing::warn!(error = %err, "failure record not serializable");
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if let Ok(mut guard) = self.writer.lock() {
            match guard.write_line(&line) {
                Ok(()) => {
                    self.lines_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to append failure record");
                    self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Parse the current failures file back into records, skipping lines
    /// that do not parse (e.g. from a partial write before a crash).
    pub fn read_all(&self) -> std::io::Result<Vec<FailureRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        let sink = FailureSink::open(&path, RotationConfig::default()).unwrap();
        sink.append(&FailureRecord::now("m1", "p1", "r1"));
        sink.append(&FailureRecord::now("m1", "p2", "r2"));
        let records = sink.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].prompt, "p1");
        assert_eq!(sink.lines_total(), 2);
    }

    #[test]
    fn rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        let sink = FailureSink::open(
            &path,
            RotationConfig {
                max_bytes: Some(64),
                keep: 1,
                compress: false,
            },
        )
        .unwrap();
        for i in 0..32 {
            sink.append(&FailureRecord::now("m", &format!("prompt {i}"), "resp"));
        }
        assert!(path.with_extension("1").exists());
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.jsonl");
        let sink = FailureSink::open(&path, RotationConfig::default()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(sink.read_all().unwrap().is_empty());
    }
}
