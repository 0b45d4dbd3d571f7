//! JSONL file writer for run logs.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::{JsonLogEntry, RunMetadata};

/// Appends log entries to `logs/raw/<date>_<stream>.jsonl`.
pub struct RunLogWriter {
    stream: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl RunLogWriter {
    /// Create a writer for `stream`, creating the directory layout if needed:
    ///
    /// ```text
    /// logs/
    /// ├── raw/           # JSONL files (one per stream per day)
    /// │   └── 2026-01-21_nightly.jsonl
    /// └── runs/          # Run metadata
    ///     └── 01J....json
    /// ```
    pub fn new(logs_dir: impl AsRef<Path>, stream: impl Into<String>) -> std::io::Result<Self> {
        let stream = stream.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, stream));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            stream,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one entry as a single line.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = entry
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for RunLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Write run metadata to `logs/runs/<run_id>.json`.
pub fn write_run_metadata(
    logs_dir: impl AsRef<Path>,
    metadata: &RunMetadata,
) -> std::io::Result<PathBuf> {
    let runs_dir = logs_dir.as_ref().join("runs");
    fs::create_dir_all(&runs_dir)?;

    let path = runs_dir.join(format!("{}.json", metadata.run_id));
    let json = serde_json::to_string_pretty(metadata)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(&path, json)?;

    Ok(path)
}
