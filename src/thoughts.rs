//! Thought Stream
//!
//! The core's output channel: a bounded, best-effort stream of short
//! single-line "thoughts" rendered above the REPL prompt. Producers are
//! background tasks, one per ingested command; the consumer polls once per
//! prompt draw and takes only the most recent result, dropping anything
//! older. A stale thought about three commands ago has no value.
//!
//! Every request carries a child cancellation token. Cancelling a request
//! guarantees its thought is never returned by a later poll, even when the
//! producer had already enqueued it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Display budget for a thought line, in characters
pub const MAX_THOUGHT_CHARS: usize = 160;

/// Channel depth; overflow drops the oldest pending thought
const CHANNEL_CAPACITY: usize = 8;

/// Cancelled-request ids remembered for suppression
const CANCELLED_MEMORY: usize = 64;

/// A single-line hint produced for one command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub request_id: Uuid,
    pub text: String,
    pub produced_at: DateTime<Utc>,
    pub cancelled: bool,
}

impl Thought {
    /// Build a thought, enforcing the single-line and length bounds
    pub fn new(request_id: Uuid, text: &str) -> Self {
        let mut line = text
            .split(['\n', '\r'])
            .map(|part| part.trim())
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if line.chars().count() > MAX_THOUGHT_CHARS {
            line = line.chars().take(MAX_THOUGHT_CHARS - 1).collect();
            line.push('…');
        }
        Self {
            request_id,
            text: line,
            produced_at: Utc::now(),
            cancelled: false,
        }
    }
}

/// An in-flight thought request
#[derive(Debug, Clone)]
pub struct ThoughtRequest {
    pub id: Uuid,
    pub cancel: CancellationToken,
}

/// Stream statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThoughtStreamStats {
    pub produced: u64,
    pub consumed: u64,
    pub dropped_stale: u64,
    pub cancelled: u64,
}

/// Bounded thought channel with per-request cancellation
pub struct ThoughtStream {
    tx: mpsc::Sender<Thought>,
    rx: Mutex<mpsc::Receiver<Thought>>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    cancelled_ids: Mutex<VecDeque<Uuid>>,
    root: CancellationToken,
    stats: Mutex<ThoughtStreamStats>,
}

impl ThoughtStream {
    pub fn new(root: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(rx),
            active: Mutex::new(HashMap::new()),
            cancelled_ids: Mutex::new(VecDeque::new()),
            root,
            stats: Mutex::new(ThoughtStreamStats::default()),
        }
    }

    /// Register a new request and hand back its id and child token
    pub fn begin(&self) -> ThoughtRequest {
        let id = Uuid::new_v4();
        let cancel = self.root.child_token();
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, cancel.clone());
        ThoughtRequest { id, cancel }
    }

    /// Publish the generated text for a request. A cancelled request is
    /// silently discarded; a full channel drops the thought (best effort).
    pub fn complete(&self, id: Uuid, text: &str) {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        let was_cancelled = token.map(|t| t.is_cancelled()).unwrap_or(true)
            || self
                .cancelled_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&id);
        if was_cancelled || text.is_empty() {
            return;
        }
        let thought = Thought::new(id, text);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        match self.tx.try_send(thought) {
            Ok(()) => stats.produced += 1,
            Err(_) => stats.dropped_stale += 1,
        }
    }

    /// Drop a request without output (producer failed or was cancelled)
    pub fn abandon(&self, id: Uuid) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Cancel one in-flight request. Its thought will never be returned.
    pub fn cancel_request(&self, id: Uuid) {
        if let Some(token) = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        {
            token.cancel();
        }
        let mut cancelled = self.cancelled_ids.lock().unwrap_or_else(|e| e.into_inner());
        if !cancelled.contains(&id) {
            if cancelled.len() >= CANCELLED_MEMORY {
                cancelled.pop_front();
            }
            cancelled.push_back(id);
        }
        drop(cancelled);
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).cancelled += 1;
    }

    /// Cancel every in-flight request, leaving the stream usable for new ones
    pub fn cancel_inflight(&self) {
        let ids: Vec<Uuid> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.cancel_request(id);
        }
    }

    /// Cancel everything in flight and the stream itself (shutdown path)
    pub fn cancel_all(&self) {
        self.cancel_inflight();
        self.root.cancel();
    }

    /// Non-blocking poll: the most recent unconsumed, non-cancelled thought.
    /// Older pending thoughts are dropped.
    pub fn next_thought(&self) -> Option<Thought> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        let cancelled = self.cancelled_ids.lock().unwrap_or_else(|e| e.into_inner());
        let mut latest: Option<Thought> = None;
        let mut dropped = 0_u64;
        while let Ok(thought) = rx.try_recv() {
            if cancelled.contains(&thought.request_id) {
                dropped += 1;
                continue;
            }
            if latest.is_some() {
                dropped += 1;
            }
            latest = Some(thought);
        }
        drop(cancelled);
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.dropped_stale += dropped;
        if latest.is_some() {
            stats.consumed += 1;
        }
        latest
    }

    pub fn stats(&self) -> ThoughtStreamStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
