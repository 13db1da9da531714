//! Live-run registry for streaming subscribers.
//!
//! A [`DebateRun`] is the shared state between the background worker driving
//! one debate and any number of HTTP subscribers: a bounded ring of recent
//! turns, terminal flags, and a level-triggered update signal.  Producers
//! never block on subscribers; a slow or absent subscriber simply observes
//! evicted turns through the adjusted-cursor protocol of [`DebateRun::snapshot`].
//!
//! The [`RunBroker`] indexes runs by generated id and evicts each run a
//! fixed retention period after it finishes.

use crate::parley::hooks::SavedArtifacts;
use crate::parley::transcript::{DebateResult, Turn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How long a finished run stays queryable.
pub const RUN_RETENTION: Duration = Duration::from_secs(10 * 60);

/// Default capacity of a run's turn ring.
pub const DEFAULT_TURN_BUFFER: usize = 512;

/// Payload of the SSE `start` event, fixed at run creation.
#[derive(Debug, Clone, Serialize)]
pub struct RunStart {
    pub run_id: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_path: Option<String>,
    pub persona_count: usize,
}

/// Terminal error attached to a run.
#[derive(Debug, Clone)]
pub enum RunError {
    /// The worker died to the run's own cancel signal.
    Cancelled,
    /// Anything else, pre-rendered for subscribers.
    Failed(String),
}

impl RunError {
    pub fn message(&self) -> &str {
        match self {
            RunError::Cancelled => "debate cancelled",
            RunError::Failed(msg) => msg,
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    turns: VecDeque<Turn>,
    base_cursor: u64,
    done: bool,
    stopped: bool,
    response: Option<DebateResult>,
    artifacts: Option<SavedArtifacts>,
    error: Option<String>,
}

/// Point-in-time view handed to a subscriber.
#[derive(Debug)]
pub struct RunSnapshot {
    /// Turns from the adjusted cursor to the newest retained turn.
    pub turns: Vec<Turn>,
    /// The clamped cursor the returned turns start at.  A jump past the
    /// requested cursor signals evicted turns.
    pub cursor: u64,
    pub done: bool,
    pub stopped: bool,
    pub response: Option<DebateResult>,
    pub artifacts: Option<SavedArtifacts>,
    pub error: Option<String>,
}

/// One in-flight (or recently finished) debate.
pub struct DebateRun {
    id: String,
    start: RunStart,
    max_turns: usize,
    cancel: CancellationToken,
    state: Mutex<RunState>,
    update_tx: watch::Sender<u64>,
}

impl DebateRun {
    pub fn new(start: RunStart, max_turns: usize, cancel: CancellationToken) -> Self {
        let (update_tx, _) = watch::channel(0u64);
        DebateRun {
            id: start.run_id.clone(),
            start,
            max_turns: max_turns.max(1),
            cancel,
            state: Mutex::new(RunState::default()),
            update_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_event(&self) -> &RunStart {
        &self.start
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Non-blocking, level-triggered wake-up for subscribers.
    fn notify(&self) {
        self.update_tx.send_modify(|version| *version += 1);
    }

    /// Receiver for [`DebateRun::notify`]; each subscriber holds its own.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.update_tx.subscribe()
    }

    /// Append a turn unless the run already finished.  When the ring is
    /// full the oldest turn is dropped and the base cursor advances.
    pub fn append_turn(&self, turn: Turn) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                return;
            }
            state.turns.push_back(turn);
            while state.turns.len() > self.max_turns {
                state.turns.pop_front();
                state.base_cursor += 1;
            }
        }
        self.notify();
    }

    /// Request cancellation.  Idempotent; the run finishes as stopped once
    /// the worker observes the cancel signal.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.stopped = true;
        }
        self.cancel.cancel();
        self.notify();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Record the terminal payload.  Idempotent: the first call wins.  A
    /// cancellation error on a stopped run is suppressed so user-initiated
    /// stops do not surface as failures.
    pub fn finish(
        &self,
        response: Option<DebateResult>,
        artifacts: Option<SavedArtifacts>,
        error: Option<RunError>,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            if state.done {
                return;
            }
            let error = match error {
                Some(RunError::Cancelled) if state.stopped => None,
                other => other,
            };
            state.done = true;
            state.response = response;
            state.artifacts = artifacts;
            state.error = error.map(|e| e.message().to_string());
        }
        self.notify();
    }

    /// Tail of the turn log starting at `cursor`, clamped into the retained
    /// window so late subscribers resume at the oldest available turn.
    pub fn snapshot(&self, cursor: u64) -> RunSnapshot {
        let state = self.state.lock().unwrap();
        let base = state.base_cursor;
        let end = base + state.turns.len() as u64;
        let clamped = cursor.max(base).min(end);
        let offset = (clamped - base) as usize;
        RunSnapshot {
            turns: state.turns.iter().skip(offset).cloned().collect(),
            cursor: clamped,
            done: state.done,
            stopped: state.stopped,
            response: state.response.clone(),
            artifacts: state.artifacts.clone(),
            error: state.error.clone(),
        }
    }

    /// Block until the next [`DebateRun::notify`] after `seen`.
    ///
    /// Used by polling subscribers that do not hold their own receiver.
    pub async fn wait_for_update(&self, seen: u64) -> u64 {
        let mut rx = self.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != seen {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    pub fn update_version(&self) -> u64 {
        *self.update_tx.borrow()
    }
}

/// Registry of live runs, indexed by id.
pub struct RunBroker {
    runs: Mutex<HashMap<String, Arc<DebateRun>>>,
    retention: Duration,
    seq: AtomicU64,
}

impl Default for RunBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunBroker {
    pub fn new() -> Self {
        Self::with_retention(RUN_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        RunBroker {
            runs: Mutex::new(HashMap::new()),
            retention,
            seq: AtomicU64::new(0),
        }
    }

    /// `run-<utc-timestamp>-<6-digit-seq>` from an atomic counter.
    pub fn next_run_id(&self, now: DateTime<Utc>) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("run-{}-{:06}", now.format("%Y%m%d%H%M%S"), seq % 1_000_000)
    }

    pub fn store(&self, run: Arc<DebateRun>) {
        self.runs
            .lock()
            .unwrap()
            .insert(run.id().to_string(), run);
    }

    pub fn get(&self, id: &str) -> Option<Arc<DebateRun>> {
        self.runs.lock().unwrap().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<DebateRun>> {
        self.runs.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the run from the index after the retention period.
    pub fn schedule_expiry(self: &Arc<Self>, id: String) {
        let broker = Arc::clone(self);
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            if broker.remove(&id).is_some() {
                log::debug!("expired run {}", id);
            }
        });
    }
}
