//! Escalation wait.
//!
//! Entered after a stage failure has been persisted with `stage = error`.
//! The controller re-reads the checkpoint every poll interval and returns as
//! soon as an operator has moved it out of `error`/`umbilical`. The checkpoint
//! file is the only channel between the two; there is no other handshake.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::process_guard::Interrupt;
use crate::store::CheckpointStore;

/// Longest uninterrupted sleep, so an interrupt is noticed promptly
const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    pub poll_interval: Duration,
    /// Ceiling on the whole wait
    pub timeout: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// How an escalation wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// An operator moved the checkpoint on; carries the record they left
    Resolved(Checkpoint),
    TimedOut { waited: Duration },
    Interrupted,
}

pub struct EscalationController<'a> {
    store: &'a CheckpointStore,
    policy: EscalationPolicy,
    interrupt: &'a Interrupt,
}

impl<'a> EscalationController<'a> {
    pub fn new(store: &'a CheckpointStore, policy: EscalationPolicy, interrupt: &'a Interrupt) -> Self {
        Self {
            store,
            policy,
            interrupt,
        }
    }

    /// Block until the checkpoint leaves the operator phases, the ceiling
    /// elapses, or an interrupt arrives.
    pub fn wait(&self) -> Escalation {
        // Signals now only raise the flag; we shut down ourselves
        let _deferral = self.interrupt.defer();
        let start = Instant::now();
        let mut polls = 0u64;

        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.policy.timeout {
                warn!(waited_secs = elapsed.as_secs(), polls, "Escalation timed out");
                return Escalation::TimedOut { waited: elapsed };
            }

            let nap = self.policy.poll_interval.min(self.policy.timeout - elapsed);
            if !self.sleep(nap) {
                info!("Escalation interrupted");
                return Escalation::Interrupted;
            }

            polls += 1;
            match self.store.load() {
                Some(checkpoint) if !checkpoint.stage.awaits_operator() => {
                    info!(
                        phase = %checkpoint.stage,
                        revision = checkpoint.revision,
                        polls,
                        "Escalation resolved by operator"
                    );
                    return Escalation::Resolved(checkpoint);
                }
                Some(checkpoint) => {
                    debug!(phase = %checkpoint.stage, polls, "Still waiting for operator");
                }
                // A reader can catch a foreign non-atomic write half done; keep waiting
                None => warn!(
                    path = %self.store.path().display(),
                    "Checkpoint unreadable while waiting for operator"
                ),
            }
        }
    }

    /// Sleep for `duration` in short slices. Returns false if interrupted.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.interrupt.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ErrorRecord, Phase, StageId};

    fn parked_store() -> (tempfile::TempDir, CheckpointStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoint.json"));
        let mut cp = Checkpoint::new();
        cp.record_failure(ErrorRecord::new(StageId::Packages, "apt update failed", None, true));
        store.save_if(&mut cp).unwrap();
        (dir, store)
    }

    fn fast_policy(timeout_ms: u64) -> EscalationPolicy {
        EscalationPolicy {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = EscalationPolicy::default();
        assert_eq!(policy.poll_interval, Duration::from_secs(10));
        assert_eq!(policy.timeout, Duration::from_secs(3600));
    }

    #[test]
    fn test_times_out_without_operator() {
        let (_dir, store) = parked_store();
        let interrupt = Interrupt::new();
        let controller = EscalationController::new(&store, fast_policy(150), &interrupt);

        let start = Instant::now();
        let result = controller.wait();
        assert!(matches!(result, Escalation::TimedOut { .. }));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_resolves_when_operator_clears_error() {
        let (_dir, store) = parked_store();
        let operator_store = store.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            operator_store
                .update(|cp| cp.stage = Phase::Running(StageId::Packages))
                .unwrap();
        });

        let interrupt = Interrupt::new();
        let controller = EscalationController::new(&store, fast_policy(5_000), &interrupt);
        let result = controller.wait();
        writer.join().unwrap();

        match result {
            Escalation::Resolved(cp) => assert_eq!(cp.stage, Phase::Running(StageId::Packages)),
            other => panic!("expected resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_umbilical_keeps_waiting() {
        let (_dir, store) = parked_store();
        store.update(|cp| cp.stage = Phase::Umbilical).unwrap();

        let interrupt = Interrupt::new();
        let controller = EscalationController::new(&store, fast_policy(120), &interrupt);
        assert!(matches!(controller.wait(), Escalation::TimedOut { .. }));
    }

    #[test]
    fn test_interrupt_aborts_promptly() {
        let (_dir, store) = parked_store();
        let interrupt = Interrupt::new();
        let raiser = interrupt.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            raiser.raise();
        });

        let controller = EscalationController::new(&store, fast_policy(10_000), &interrupt);
        let start = Instant::now();
        assert_eq!(controller.wait(), Escalation::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(2));
        // Deferral released once the wait is over
        assert!(!interrupt.is_deferred());
    }
}
