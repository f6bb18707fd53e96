//! Provisioning engine.
//!
//! Drives the catalog against the checkpoint store:
//!
//! 1. Load the checkpoint, or create and persist a fresh one.
//! 2. Walk the catalog from the starting stage, skipping completed entries.
//! 3. Persist `stage = <id>` *before* running a stage, so a crash mid-stage
//!    re-runs exactly that stage next time (at-least-once per stage).
//! 4. Persist every outcome. A failure parks the pipeline in `error` and hands
//!    over to the [`EscalationController`]; once an operator resolves it the
//!    engine reloads their checkpoint and walks the catalog again.
//! 5. Set `complete` only once every catalog entry is satisfied. A walk that
//!    started past unfinished stages leaves them pending in the report.
//!
//! Every write is a compare-and-swap. If an operator wrote in between, the
//! engine reloads their record and re-applies its own change on top.

use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, ErrorRecord, StageId};
use crate::error::{MidwifeError, Result};
use crate::escalation::{Escalation, EscalationController, EscalationPolicy};
use crate::notify::{Notice, Notifier, remediation_hints};
use crate::process_guard::Interrupt;
use crate::stage::{Catalog, StageStatus};
use crate::store::{CheckpointStore, MAX_CAS_ATTEMPTS, StoreError};

/// Summary of a successful pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Stages whose `run` was invoked this session, in order (repeats included)
    pub executed: Vec<StageId>,
    /// Catalog entries still outstanding; non-empty only when a resume hint
    /// started the walk past them
    pub pending: Vec<StageId>,
    /// Number of escalations an operator resolved
    pub escalations: usize,
    pub checkpoint: Checkpoint,
}

/// Per-stage health, for `status --verify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDiagnosis {
    pub id: StageId,
    pub description: String,
    pub completed: bool,
    /// `check()`: real work remains
    pub needs_work: bool,
    /// `verify()`: goal state holds
    pub verified: bool,
}

pub struct Engine {
    catalog: Catalog,
    store: CheckpointStore,
    notifier: Notifier,
    policy: EscalationPolicy,
    interrupt: Interrupt,
}

impl Engine {
    pub fn new(catalog: Catalog, store: CheckpointStore, notifier: Notifier) -> Self {
        Self {
            catalog,
            store,
            notifier,
            policy: EscalationPolicy::default(),
            interrupt: Interrupt::global(),
        }
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run the pipeline to completion.
    ///
    /// `resume_hint` starts the walk at that catalog entry instead of the
    /// first one. Returns an error if an escalation times out or is
    /// interrupted, or if the checkpoint cannot be written.
    pub fn run(&self, resume_hint: Option<StageId>) -> Result<RunReport> {
        let ids = self.catalog.ids();
        let start_index = match resume_hint {
            Some(id) => self
                .catalog
                .position(id)
                .ok_or_else(|| MidwifeError::unknown_stage(id.to_string()))?,
            None => 0,
        };

        let mut checkpoint = match self.store.load() {
            Some(checkpoint) => checkpoint,
            None => {
                let mut checkpoint = Checkpoint::new();
                checkpoint.recompute_progress(&ids);
                self.store.save_if(&mut checkpoint)?;
                info!(path = %self.store.path().display(), "Created new checkpoint");
                self.notifier.notify(&Notice::Started { total: ids.len() });
                return self.drive(checkpoint, start_index, &ids);
            }
        };

        let completed = ids.iter().filter(|id| checkpoint.is_completed(**id)).count();
        if checkpoint.is_complete() && completed == ids.len() {
            info!("Pipeline already complete, nothing to do");
            return Ok(RunReport {
                executed: Vec::new(),
                pending: Vec::new(),
                escalations: 0,
                checkpoint,
            });
        }

        if checkpoint.stage.awaits_operator() {
            warn!(phase = %checkpoint.stage, "Previous run stopped while waiting for an operator, retrying");
        }
        // Catalog may have changed since the last run
        checkpoint.recompute_progress(&ids);
        info!(completed, total = ids.len(), phase = %checkpoint.stage, "Resuming pipeline");
        self.notifier.notify(&Notice::Resumed {
            completed,
            total: ids.len(),
            progress: checkpoint.progress_percent,
        });
        self.drive(checkpoint, start_index, &ids)
    }

    fn drive(
        &self,
        mut checkpoint: Checkpoint,
        start_index: usize,
        ids: &[StageId],
    ) -> Result<RunReport> {
        let mut executed = Vec::new();
        let mut escalations = 0;

        'pipeline: loop {
            for stage in self.catalog.iter().skip(start_index) {
                let id = stage.id();
                if checkpoint.is_completed(id) {
                    debug!(stage = %id, "Already completed, skipping");
                    continue;
                }

                self.commit(&mut checkpoint, |cp| cp.begin_stage(id, stage.description()))?;
                info!(stage = %id, task = stage.description(), "Running stage");
                let outcome = stage.run(&checkpoint);
                executed.push(id);

                match outcome.status {
                    StageStatus::Success | StageStatus::Skipped => {
                        info!(stage = %id, status = %outcome.status, "{}", outcome.message);
                        let facts = outcome.facts.clone();
                        self.commit(&mut checkpoint, |cp| {
                            if let Some(facts) = &facts {
                                cp.config.merge(facts.clone());
                            }
                            cp.mark_completed(id, ids);
                        })?;

                        if outcome.status == StageStatus::Success && !stage.verify(&checkpoint) {
                            warn!(stage = %id, "Stage reported success but verification does not hold");
                        }
                    }
                    StageStatus::Failed => {
                        warn!(
                            stage = %id,
                            recoverable = outcome.recoverable,
                            detail = outcome.detail.as_deref().unwrap_or(""),
                            "Stage failed: {}",
                            outcome.message
                        );
                        let record = ErrorRecord::new(
                            id,
                            outcome.message.clone(),
                            outcome.detail.clone(),
                            outcome.recoverable,
                        );
                        self.commit(&mut checkpoint, |cp| cp.record_failure(record.clone()))?;

                        let hints = remediation_hints(&record);
                        self.notifier.notify(&Notice::StageFailed {
                            record: record.clone(),
                            hints,
                        });

                        match self.escalate(id) {
                            Escalation::Resolved(resolved) => {
                                escalations += 1;
                                self.notifier.notify(&Notice::Resolved {
                                    stage: id,
                                    phase: resolved.stage,
                                });
                                checkpoint = resolved;
                                continue 'pipeline;
                            }
                            Escalation::TimedOut { waited } => {
                                self.notifier
                                    .notify(&Notice::EscalationTimedOut { stage: id, waited });
                                return Err(MidwifeError::EscalationTimeout {
                                    stage: id,
                                    waited,
                                    recoverable: record.recoverable,
                                });
                            }
                            Escalation::Interrupted => {
                                return Err(MidwifeError::Interrupted { stage: id });
                            }
                        }
                    }
                }
            }
            break;
        }

        let pending = checkpoint.pending(ids);
        if pending.is_empty() {
            self.commit(&mut checkpoint, |cp| cp.finish(ids))?;
            info!(executed = executed.len(), "Pipeline complete");
            self.notifier.notify(&Notice::Completed {
                executed: executed.len(),
                total: ids.len(),
            });
        } else {
            self.commit(&mut checkpoint, |cp| cp.pause(ids))?;
            warn!(?pending, "Walk ended with stages before the start point still pending");
            self.notifier.notify(&Notice::Pending {
                executed: executed.len(),
                pending: pending.clone(),
            });
        }

        Ok(RunReport {
            executed,
            pending,
            escalations,
            checkpoint,
        })
    }

    fn escalate(&self, stage: StageId) -> Escalation {
        self.notifier.notify(&Notice::AwaitingOperator {
            stage,
            poll_interval: self.policy.poll_interval,
            timeout: self.policy.timeout,
        });
        EscalationController::new(&self.store, self.policy, &self.interrupt).wait()
    }

    /// Apply `mutate` and persist with compare-and-swap.
    ///
    /// On a revision conflict the on-disk record (an operator's edit) becomes
    /// the base and `mutate` is applied again on top of it.
    fn commit<F>(&self, checkpoint: &mut Checkpoint, mutate: F) -> Result<()>
    where
        F: Fn(&mut Checkpoint),
    {
        mutate(checkpoint);
        checkpoint.touch();

        for _ in 0..MAX_CAS_ATTEMPTS {
            match self.store.save_if(checkpoint) {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict { expected, found }) => {
                    warn!(expected, found, "Checkpoint changed underneath the engine, re-applying");
                    // If the record became unreadable, our copy simply wins next round
                    if let Some(on_disk) = self.store.load() {
                        *checkpoint = on_disk;
                        mutate(checkpoint);
                        checkpoint.touch();
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Contended {
            attempts: MAX_CAS_ATTEMPTS,
        }
        .into())
    }

    /// Evaluate `check`/`verify` for every catalog entry against the
    /// persisted checkpoint. Never mutates anything.
    pub fn diagnose(&self) -> Vec<StageDiagnosis> {
        let checkpoint = self.store.load().unwrap_or_default();
        self.catalog
            .iter()
            .map(|stage| StageDiagnosis {
                id: stage.id(),
                description: stage.description().to_string(),
                completed: checkpoint.is_completed(stage.id()),
                needs_work: stage.check(&checkpoint),
                verified: stage.verify(&checkpoint),
            })
            .collect()
    }
}
