//! Persistence layer.
//!
//! Settled trades are appended to a JSON-lines journal, one object per
//! line. On startup the tail of the journal warm-starts the in-memory
//! trade history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{Direction, TradeRecord};

/// One settled trade as written to the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub trade_id: String,
    pub instrument: String,
    pub timeframe: String,
    pub direction: Direction,
    pub score: i32,
    pub label: String,
    pub amount: Decimal,
    pub won: bool,
    pub profit: f64,
    pub placed_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn to_record(&self) -> TradeRecord {
        TradeRecord {
            won: self.won,
            timestamp: self.settled_at,
        }
    }
}

/// Append-only JSON-lines trade journal.
#[derive(Debug, Clone)]
pub struct TradeJournal {
    path: PathBuf,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, creating the file and its directory if needed.
    pub fn append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create journal directory {}", parent.display()))?;
        }
        let line = serde_json::to_string(entry).context("Failed to serialise journal entry")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("Failed to append to journal {}", self.path.display()))?;

        debug!(path = %self.path.display(), trade_id = %entry.trade_id, "Journal entry appended");
        Ok(())
    }

    /// The last `n` entries, oldest first. A missing journal is empty;
    /// malformed lines are skipped.
    pub fn load_recent(&self, n: usize) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No trade journal found, starting fresh");
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read journal {}", self.path.display()))?;

        let mut entries = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping malformed journal line"
                ),
            }
        }
        let skip = entries.len().saturating_sub(n);
        let recent: Vec<JournalEntry> = entries.into_iter().skip(skip).collect();

        info!(
            path = %self.path.display(),
            loaded = recent.len(),
            "Trade journal loaded"
        );
        Ok(recent)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
