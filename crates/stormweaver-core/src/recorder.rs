//! Append-only outcome recorder.
//!
//! Workers hand outcomes to [`OutcomeRecorder::record`], which never blocks:
//! records travel over an unbounded channel to a writer running on the
//! blocking thread pool. The writer keeps every record in memory for the
//! checker and, when a sink path is configured, appends it as one JSON line.
//!
//! Per-worker order is preserved since each worker records from a single task;
//! records of different workers interleave in arrival order.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{WeaverError, WeaverResult};
use crate::outcome::Outcome;

enum RecorderMsg {
    Record(Box<Outcome>),
    Drain(oneshot::Sender<Vec<Outcome>>),
    Close(oneshot::Sender<WeaverResult<RecorderStats>>),
}

/// Totals reported when the recorder closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderStats {
    /// Outcomes accepted
    pub recorded: u64,
    /// Outcomes written to the sink
    pub persisted: u64,
}

/// Handle to the recorder task. Cheap to clone.
#[derive(Clone)]
pub struct OutcomeRecorder {
    tx: mpsc::UnboundedSender<RecorderMsg>,
}

impl OutcomeRecorder {
    /// Start a recorder, optionally persisting to `sink` as JSONL.
    ///
    /// The sink file is created (or truncated) up front so an unwritable path
    /// fails the run before any worker starts.
    pub fn start(sink: Option<&Path>, flush_every: usize) -> WeaverResult<Self> {
        let sink = match sink {
            Some(path) => Some(JsonlSink::create(path, flush_every)?),
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = RecorderWriter {
            buffer: Vec::new(),
            sink,
            stats: RecorderStats::default(),
            sink_error: None,
        };
        tokio::task::spawn_blocking(move || writer.run(rx));

        Ok(Self { tx })
    }

    /// Append one outcome. Never blocks; outcomes recorded after `close` are
    /// dropped with a warning.
    pub fn record(&self, outcome: Outcome) {
        if self.tx.send(RecorderMsg::Record(Box::new(outcome))).is_err() {
            warn!("Outcome recorded after the recorder closed; dropping it");
        }
    }

    /// Take every outcome recorded since the previous drain.
    ///
    /// Each outcome is yielded by exactly one drain. Outcomes recorded through
    /// this handle before the call are always included.
    pub async fn drain(&self) -> Drain {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RecorderMsg::Drain(reply)).is_err() {
            return Drain::default();
        }
        Drain {
            inner: rx.await.unwrap_or_default().into_iter(),
        }
    }

    /// Flush and close the sink. Outcomes not yet drained stay drainable.
    pub async fn close(&self) -> WeaverResult<RecorderStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RecorderMsg::Close(reply))
            .map_err(|_| WeaverError::Io("recorder already closed".into()))?;
        rx.await
            .map_err(|_| WeaverError::Io("recorder task exited".into()))?
    }
}

/// One-shot sequence of drained outcomes.
#[derive(Debug, Default)]
pub struct Drain {
    inner: std::vec::IntoIter<Outcome>,
}

impl Iterator for Drain {
    type Item = Outcome;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Drain {}

struct RecorderWriter {
    buffer: Vec<Outcome>,
    sink: Option<JsonlSink>,
    stats: RecorderStats,
    sink_error: Option<WeaverError>,
}

impl RecorderWriter {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<RecorderMsg>) {
        let mut closing = None;
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                RecorderMsg::Record(outcome) => self.append(*outcome),
                RecorderMsg::Drain(reply) => {
                    let _ = reply.send(std::mem::take(&mut self.buffer));
                }
                RecorderMsg::Close(reply) => {
                    closing = Some(reply);
                    break;
                }
            }
        }

        let result = self.finish();
        if let Some(reply) = closing {
            let _ = reply.send(result);
            // Keep serving drains until every handle is gone.
            while let Some(msg) = rx.blocking_recv() {
                match msg {
                    RecorderMsg::Drain(reply) => {
                        let _ = reply.send(std::mem::take(&mut self.buffer));
                    }
                    RecorderMsg::Close(reply) => {
                        let _ = reply.send(Err(WeaverError::Io("recorder already closed".into())));
                    }
                    RecorderMsg::Record(_) => {
                        warn!("Outcome arrived after close; dropping it");
                    }
                }
            }
        }
        debug!(recorded = self.stats.recorded, "Recorder stopped");
    }

    fn append(&mut self, outcome: Outcome) {
        self.stats.recorded += 1;
        if let Some(sink) = self.sink.as_mut() {
            match sink.write(&outcome) {
                Ok(()) => self.stats.persisted += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to persist outcome");
                    self.sink_error.get_or_insert(e);
                }
            }
        }
        self.buffer.push(outcome);
    }

    fn finish(&mut self) -> WeaverResult<RecorderStats> {
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.flush() {
                self.sink_error.get_or_insert(e);
            }
            debug!(path = %sink.path.display(), persisted = self.stats.persisted, "Closed outcome sink");
        }
        match self.sink_error.take() {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }
}

struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl JsonlSink {
    fn create(path: &Path, flush_every: usize) -> WeaverResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| WeaverError::Io(format!("{}: {}", path.display(), e)))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write(&mut self, outcome: &Outcome) -> WeaverResult<()> {
        let line = serde_json::to_string(outcome)?;
        writeln!(self.writer, "{}", line)?;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> WeaverResult<()> {
        self.pending = 0;
        self.writer.flush()?;
        Ok(())
    }
}

/// Load a persisted outcome stream.
///
/// Blank lines are skipped; any malformed line fails the whole read with its
/// line number.
pub fn read_outcomes(path: impl AsRef<Path>) -> WeaverResult<Vec<Outcome>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| WeaverError::Io(format!("{}: {}", path.display(), e)))?;

    let mut outcomes = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let outcome = serde_json::from_str(line).map_err(|e| {
            WeaverError::Serialization(format!("{}:{}: {}", path.display(), idx + 1, e))
        })?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
