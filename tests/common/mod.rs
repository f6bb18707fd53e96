//! Shared fixtures for the integration tests: scripted stages, a recording
//! notification sink and fast escalation policies.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use midwife::checkpoint::{Checkpoint, Phase, StageId};
use midwife::escalation::EscalationPolicy;
use midwife::notify::NotificationSink;
use midwife::stage::{Catalog, Stage, StageOutcome};
use midwife::store::CheckpointStore;

/// Order in which stage bodies ran, shared between stages of one test
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<StageId>>>);

impl CallLog {
    pub fn record(&self, id: StageId) {
        self.0.lock().unwrap().push(id);
    }

    pub fn calls(&self) -> Vec<StageId> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, id: StageId) -> usize {
        self.calls().iter().filter(|c| **c == id).count()
    }
}

/// Stage that replays queued outcomes, then succeeds forever.
pub struct Scripted {
    id: StageId,
    description: Option<String>,
    log: CallLog,
    outcomes: Mutex<VecDeque<StageOutcome>>,
    panic_next: AtomicBool,
}

impl Scripted {
    pub fn ok(id: StageId, log: &CallLog) -> Self {
        Self {
            id,
            description: None,
            log: log.clone(),
            outcomes: Mutex::new(VecDeque::new()),
            panic_next: AtomicBool::new(false),
        }
    }

    pub fn then(self, outcome: StageOutcome) -> Self {
        self.outcomes.lock().unwrap().push_back(outcome);
        self
    }

    /// Override the catalog description
    pub fn described(mut self, text: &str) -> Self {
        self.description = Some(text.to_string());
        self
    }

    /// Simulate the process dying half-way through the stage body
    pub fn crashing(self) -> Self {
        self.panic_next.store(true, Ordering::SeqCst);
        self
    }
}

impl Stage for Scripted {
    fn id(&self) -> StageId {
        self.id
    }

    fn description(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or_else(|| self.id.description())
    }

    fn check(&self, checkpoint: &Checkpoint) -> bool {
        !checkpoint.is_completed(self.id)
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        self.log.record(self.id);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("simulated crash in {}", self.id);
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| StageOutcome::success(format!("{} done", self.id)))
    }

    fn verify(&self, _checkpoint: &Checkpoint) -> bool {
        true
    }
}

pub fn catalog(stages: Vec<Scripted>) -> Catalog {
    Catalog::new(
        stages
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn Stage>)
            .collect(),
    )
    .unwrap()
}

/// Sink that keeps every message and reports a fixed delivery result
#[derive(Clone)]
pub struct Recording {
    pub messages: Arc<Mutex<Vec<String>>>,
    pub accept: bool,
}

impl Recording {
    pub fn new(accept: bool) -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            accept,
        }
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl NotificationSink for Recording {
    fn send(&self, text: &str) -> bool {
        self.messages.lock().unwrap().push(text.to_string());
        self.accept
    }
}

pub fn fast_policy(timeout_ms: u64) -> EscalationPolicy {
    EscalationPolicy {
        poll_interval: Duration::from_millis(20),
        timeout: Duration::from_millis(timeout_ms),
    }
}

pub fn temp_store() -> (tempfile::TempDir, CheckpointStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
    (dir, store)
}

/// Block until the persisted checkpoint is parked in `error`
pub fn wait_for_escalation(store: &CheckpointStore) -> Checkpoint {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(cp) = store.load()
            && cp.stage == Phase::Error
        {
            return cp;
        }
        assert!(Instant::now() < deadline, "engine never escalated");
        std::thread::sleep(Duration::from_millis(10));
    }
}
