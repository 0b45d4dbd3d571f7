//! In-process simulated backend.
//!
//! Lets scripts be dry-run without a database and gives tests precise control
//! over latency and failures. Statements are interpreted by prefix:
//!
//! | statement | behaviour |
//! |---|---|
//! | `SELECT ...` | one row per parameter (one row with `1` when none) |
//! | `SLEEP <ms>` | blocks for `<ms>` milliseconds, then succeeds |
//! | `FAIL ...` | query error, connection stays usable |
//! | `GONE ...` | error with the connection marked lost |
//! | anything else | succeeds with one affected row |

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{Driver, DriverError, DriverSession, Rows, SqlValue};

/// Counters shared by a simulated driver and all of its sessions.
#[derive(Debug, Default)]
pub struct SimStats {
    connects: AtomicU64,
    refused: AtomicU64,
    executed: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimStats {
    /// Successful connection attempts
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Refused connection attempts
    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::SeqCst)
    }

    /// Statements executed (successfully or not)
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Highest number of statements that were executing at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Simulated driver.
pub struct SimDriver {
    latency: Duration,
    refuse: Arc<AtomicBool>,
    stats: Arc<SimStats>,
}

impl SimDriver {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            refuse: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SimStats::default()),
        }
    }

    /// Make every subsequent connection attempt fail (or succeed again).
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn stats(&self) -> Arc<SimStats> {
        Arc::clone(&self.stats)
    }
}

impl Driver for SimDriver {
    fn kind(&self) -> &'static str {
        "sim"
    }

    fn connect(&self) -> Result<Box<dyn DriverSession>, DriverError> {
        if self.refuse.load(Ordering::SeqCst) {
            self.stats.refused.fetch_add(1, Ordering::SeqCst);
            return Err(DriverError::new("connection refused").with_code("SIM_REFUSED"));
        }
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SimSession {
            latency: self.latency,
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct SimSession {
    latency: Duration,
    stats: Arc<SimStats>,
}

impl SimSession {
    fn interpret(&self, sql: &str, params: &[SqlValue]) -> Result<Rows, DriverError> {
        let trimmed = sql.trim_start();
        let upper = trimmed.to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("SLEEP") {
            let millis: u64 = rest
                .trim()
                .parse()
                .map_err(|_| DriverError::new(format!("bad SLEEP argument: {}", rest.trim())))?;
            std::thread::sleep(Duration::from_millis(millis));
            return Ok(Rows::affected(0));
        }
        if upper.starts_with("FAIL") {
            return Err(DriverError::new(format!("simulated failure: {}", trimmed))
                .with_code("SIM_FAIL"));
        }
        if upper.starts_with("GONE") {
            return Err(DriverError::new("server has gone away")
                .with_code("SIM_GONE")
                .connection_lost());
        }
        if upper.starts_with("SELECT") {
            let rows = if params.is_empty() {
                vec![vec![SqlValue::Integer(1)]]
            } else {
                params.iter().map(|p| vec![p.clone()]).collect()
            };
            return Ok(Rows {
                columns: vec!["value".to_string()],
                rows,
                affected: 0,
            });
        }
        Ok(Rows::affected(1))
    }
}

impl DriverSession for SimSession {
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Rows, DriverError> {
        let now = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.stats.executed.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let result = self.interpret(sql, params);

        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
