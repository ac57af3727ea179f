//! Command Memory
//!
//! Append-only record of executed commands with their context: working
//! directory, an allow-listed environment subset, exit status, duration and
//! timestamp. The memory is the substrate for everything the core learns
//! from: training windows, recent-command sequences for the n-gram draft
//! producer, and per-day slices.
//!
//! Retention is a bounded ring: when full, the oldest unpinned entry is
//! evicted. A privacy filter screens command text before storage; matches
//! are skipped, never stored, and never written to disk.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{DeltaError, Result};

/// User feedback attached to a command's prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackKind {
    Helpful,
    Unhelpful,
    Correction,
}

impl FeedbackKind {
    /// Training label for this feedback: helpful +1, unhelpful -1, correction 0
    pub fn label(&self) -> i8 {
        match self {
            FeedbackKind::Helpful => 1,
            FeedbackKind::Unhelpful => -1,
            FeedbackKind::Correction => 0,
        }
    }
}

/// Execution outcome measured by the REPL and passed alongside the command text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub working_dir: String,
}

impl CommandOutcome {
    pub fn new(exit_code: i32, duration_ms: u64, working_dir: impl Into<String>) -> Self {
        Self {
            exit_code,
            duration_ms,
            working_dir: working_dir.into(),
        }
    }
}

/// A single recorded command execution. Immutable after creation except for
/// the feedback fields, where the last write wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEntry {
    pub id: Uuid,
    pub command: String,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub important: bool,
    #[serde(default)]
    pub feedback: Option<FeedbackKind>,
    #[serde(default)]
    pub correction: Option<String>,
}

impl CommandEntry {
    pub fn new(command: impl Into<String>, outcome: &CommandOutcome, env_allowlist: &[String]) -> Self {
        let env = env_allowlist
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect();
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            working_dir: outcome.working_dir.clone(),
            env,
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration_ms,
            timestamp: Utc::now(),
            important: false,
            feedback: None,
            correction: None,
        }
    }

    /// Whitespace tokens of the command text
    pub fn tokens(&self) -> Vec<String> {
        self.command.split_whitespace().map(|t| t.to_string()).collect()
    }
}

/// Result of an append: either stored, or skipped by the privacy filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Stored(Uuid),
    Skipped,
}

/// Memory statistics for monitoring
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandMemoryStats {
    pub total_appended: u64,
    pub privacy_skipped: u64,
    pub evicted: u64,
    pub feedback_count: u64,
    pub current_entries: usize,
    pub storage_errors: u64,
}

/// Bounded ring of command executions with an optional day-indexed backing store
#[derive(Debug)]
pub struct CommandMemory {
    entries: VecDeque<CommandEntry>,
    max_entries: usize,
    prune_when_full: bool,
    env_allowlist: Vec<String>,
    privacy_patterns: Vec<Regex>,
    persist_dir: Option<PathBuf>,
    stats: CommandMemoryStats,
}

impl CommandMemory {
    pub fn new(
        max_entries: usize,
        prune_when_full: bool,
        env_allowlist: Vec<String>,
        privacy_patterns: &[String],
        persist_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(privacy_patterns.len());
        for pattern in privacy_patterns {
            compiled.push(Regex::new(pattern)?);
        }
        if let Some(dir) = &persist_dir {
            fs::create_dir_all(dir)
                .map_err(|e| DeltaError::StorageError(format!("create {}: {}", dir.display(), e)))?;
        }
        Ok(Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
            prune_when_full,
            env_allowlist,
            privacy_patterns: compiled,
            persist_dir,
            stats: CommandMemoryStats::default(),
        })
    }

    /// Record a command execution. Returns `Skipped` when the privacy filter
    /// matches; the command is then never stored in memory or on disk.
    pub fn append(&mut self, command: &str, outcome: &CommandOutcome) -> Result<AppendOutcome> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(DeltaError::InvalidInput("empty command".to_string()));
        }

        if self.privacy_patterns.iter().any(|p| p.is_match(trimmed)) {
            self.stats.privacy_skipped += 1;
            log::debug!("privacy filter skipped command");
            return Ok(AppendOutcome::Skipped);
        }

        if self.entries.len() >= self.max_entries {
            if !self.prune_when_full {
                return Err(DeltaError::StorageError("command memory full".to_string()));
            }
            self.evict_oldest()?;
        }

        let entry = CommandEntry::new(trimmed, outcome, &self.env_allowlist);
        let id = entry.id;

        if let Err(e) = self.persist_entry(&entry) {
            // Disk failure never drops in-memory state
            self.stats.storage_errors += 1;
            log::warn!("command log write failed: {}", e);
        }

        self.entries.push_back(entry);
        self.stats.total_appended += 1;
        self.stats.current_entries = self.entries.len();
        Ok(AppendOutcome::Stored(id))
    }

    fn evict_oldest(&mut self) -> Result<()> {
        let victim = self.entries.iter().position(|e| !e.important);
        match victim {
            Some(idx) => {
                self.entries.remove(idx);
                self.stats.evicted += 1;
                Ok(())
            }
            // Every entry is pinned; refuse rather than drop one
            None => Err(DeltaError::StorageError(
                "command memory full of pinned entries".to_string(),
            )),
        }
    }

    /// Most recent `k` entries, oldest first
    pub fn tail(&self, k: usize) -> Vec<CommandEntry> {
        let start = self.entries.len().saturating_sub(k);
        self.entries.iter().skip(start).cloned().collect()
    }

    /// The most recent entry, if any
    pub fn last(&self) -> Option<&CommandEntry> {
        self.entries.back()
    }

    /// Entries whose timestamp falls within the given calendar day. Reads
    /// back from the day file when one is configured, merging with what is
    /// still held in memory.
    pub fn range_by_day(&self, day: NaiveDate) -> Result<Vec<CommandEntry>> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut out: Vec<CommandEntry> = Vec::new();

        for entry in &self.entries {
            if entry.timestamp.date_naive() == day {
                seen.insert(entry.id);
                out.push(entry.clone());
            }
        }

        if let Some(dir) = &self.persist_dir {
            let path = dir.join(Self::day_file_name(day));
            if path.exists() {
                let file = fs::File::open(&path)
                    .map_err(|e| DeltaError::StorageError(format!("open {}: {}", path.display(), e)))?;
                for line in BufReader::new(file).lines() {
                    let line = line
                        .map_err(|e| DeltaError::StorageError(format!("read {}: {}", path.display(), e)))?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<CommandEntry>(&line) {
                        Ok(entry) => {
                            if seen.insert(entry.id) {
                                out.push(entry);
                            }
                        }
                        Err(e) => log::warn!("skipping malformed command log line: {}", e),
                    }
                }
            }
        }

        out.sort_by_key(|e| e.timestamp);
        Ok(out)
    }

    /// Attach feedback to the most recent entry whose text matches `command`,
    /// or to the most recent entry overall when no text is given. Idempotent:
    /// the last feedback wins, and repeated corrections keep only the latest
    /// text. Returns a copy of the updated entry plus whether anything
    /// actually changed, so callers can skip re-applying identical feedback.
    pub fn set_feedback(
        &mut self,
        command: Option<&str>,
        kind: FeedbackKind,
        correction: Option<String>,
    ) -> Result<(CommandEntry, bool)> {
        let idx = match command {
            Some(text) => self
                .entries
                .iter()
                .rposition(|e| e.command == text)
                .or_else(|| self.entries.len().checked_sub(1)),
            None => self.entries.len().checked_sub(1),
        };
        let idx = idx.ok_or_else(|| DeltaError::InvalidInput("no command to attach feedback to".to_string()))?;

        let entry = &mut self.entries[idx];
        let correction = match kind {
            FeedbackKind::Correction => correction,
            _ => None,
        };
        let changed = entry.feedback != Some(kind) || entry.correction != correction;
        let first_feedback = entry.feedback.is_none();
        entry.feedback = Some(kind);
        entry.correction = correction;
        if first_feedback {
            self.stats.feedback_count += 1;
        }
        Ok((entry.clone(), changed))
    }

    /// Pin an entry so retention never evicts it
    pub fn mark_important(&mut self, id: Uuid) -> Result<()> {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.important = true;
                Ok(())
            }
            None => Err(DeltaError::InvalidInput(format!("unknown entry {}", id))),
        }
    }

    /// Flattened whitespace tokens of the last `n` commands, oldest first.
    /// This is the corpus for the n-gram draft producer.
    pub fn recent_token_stream(&self, n: usize) -> Vec<String> {
        self.tail(n).iter().flat_map(|e| e.tokens()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CommandMemoryStats {
        let mut stats = self.stats.clone();
        stats.current_entries = self.entries.len();
        stats
    }

    fn day_file_name(day: NaiveDate) -> String {
        format!("commands-{}.jsonl", day.format("%Y-%m-%d"))
    }

    fn persist_entry(&self, entry: &CommandEntry) -> Result<()> {
        let dir = match &self.persist_dir {
            Some(dir) => dir,
            None => return Ok(()),
        };
        let path = dir.join(Self::day_file_name(entry.timestamp.date_naive()));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DeltaError::StorageError(format!("open {}: {}", path.display(), e)))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{}", line)
            .map_err(|e| DeltaError::StorageError(format!("write {}: {}", path.display(), e)))?;
        Ok(())
    }
}
