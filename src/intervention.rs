//! Operator interventions.
//!
//! These are the only writes made from outside the engine. Each one is a
//! compare-and-swap update of the checkpoint, so an intervention racing the
//! engine's own writes is either applied on top of them or retried, never
//! lost.
//!
//! Moving the checkpoint out of `error`/`umbilical` is what releases a
//! waiting engine; the engine then walks the catalog again from its starting
//! stage, skipping everything in `completed_stages`.

use std::fmt;

use tracing::info;

use crate::checkpoint::{Checkpoint, Phase, ProvisionFacts, StageId};
use crate::error::{MidwifeError, Result};
use crate::store::CheckpointStore;

/// A single operator action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intervention {
    /// Run the failed stage again
    Retry,
    /// Continue without the stage
    Skip(StageId),
    /// The stage was finished by hand
    Complete(StageId),
    /// Hold the pipeline while working on the machine
    Attach,
    /// Release the hold without resolving anything
    Detach,
    /// Record a fact for later stages
    SetFact { key: String, value: String },
}

impl fmt::Display for Intervention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry => write!(f, "retry"),
            Self::Skip(stage) => write!(f, "skip {}", stage),
            Self::Complete(stage) => write!(f, "complete {}", stage),
            Self::Attach => write!(f, "attach"),
            Self::Detach => write!(f, "detach"),
            Self::SetFact { key, value } => write!(f, "set {}={}", key, value),
        }
    }
}

/// Apply `intervention` to the persisted checkpoint.
///
/// `catalog` is the active pipeline order; `skip`/`complete` reject stages
/// outside it and progress is recomputed against it.
pub fn apply(
    store: &CheckpointStore,
    catalog: &[StageId],
    intervention: &Intervention,
) -> Result<Checkpoint> {
    let current = store
        .load()
        .ok_or_else(|| MidwifeError::NoCheckpoint(store.path().display().to_string()))?;
    validate(&current, catalog, intervention)?;

    let checkpoint = store.update(|cp| mutate(cp, catalog, intervention))?;
    info!(
        action = %intervention,
        phase = %checkpoint.stage,
        revision = checkpoint.revision,
        "Intervention applied"
    );
    Ok(checkpoint)
}

fn validate(current: &Checkpoint, catalog: &[StageId], intervention: &Intervention) -> Result<()> {
    match intervention {
        Intervention::Retry | Intervention::Attach => {
            if !current.stage.awaits_operator() {
                return Err(MidwifeError::NotEscalated(current.stage));
            }
        }
        Intervention::Detach => {
            if current.stage != Phase::Umbilical {
                return Err(MidwifeError::NotEscalated(current.stage));
            }
        }
        Intervention::Skip(stage) | Intervention::Complete(stage) => {
            if !catalog.contains(stage) {
                return Err(MidwifeError::unknown_stage(stage.to_string()));
            }
        }
        Intervention::SetFact { key, value } => {
            // Dry run against a copy so a bad value is rejected before writing
            set_fact(&mut current.config.clone(), key, value)?;
        }
    }
    Ok(())
}

fn mutate(cp: &mut Checkpoint, catalog: &[StageId], intervention: &Intervention) {
    match intervention {
        Intervention::Retry => {
            match cp.last_error().map(|record| record.stage) {
                Some(stage) => {
                    cp.stage = Phase::Running(stage);
                    cp.current_task = Some(format!("Retrying: {}", stage.description()));
                }
                None => {
                    cp.stage = Phase::Init;
                    cp.current_task = None;
                }
            }
        }
        Intervention::Skip(stage) => {
            cp.mark_completed(*stage, catalog);
            cp.current_task = Some(format!("Skipped by operator: {}", stage.description()));
            release(cp, *stage);
        }
        Intervention::Complete(stage) => {
            cp.mark_completed(*stage, catalog);
            cp.current_task = Some(format!("Completed by operator: {}", stage.description()));
            release(cp, *stage);
        }
        Intervention::Attach => {
            cp.stage = Phase::Umbilical;
            cp.current_task = Some("Operator attached".to_string());
        }
        Intervention::Detach => {
            // Back to plain escalation; still needs retry/skip/complete
            if cp.stage == Phase::Umbilical {
                cp.stage = Phase::Error;
                cp.current_task = Some("Operator detached, awaiting resolution".to_string());
            }
        }
        Intervention::SetFact { key, value } => {
            // Validated already; a concurrent writer cannot make it invalid
            let _ = set_fact(&mut cp.config, key, value);
        }
    }
}

/// A parked pipeline resumes once its failed stage is dealt with.
fn release(cp: &mut Checkpoint, stage: StageId) {
    if cp.stage.awaits_operator() {
        cp.stage = Phase::Running(stage);
    }
}

/// Set a fact by name. Typed fields are parsed; unknown keys go to `extra`.
pub fn set_fact(facts: &mut ProvisionFacts, key: &str, value: &str) -> Result<()> {
    let invalid = |what: &str| MidwifeError::config(format!("{key}: {value:?} is not {what}"));

    match key {
        "hostname" => facts.hostname = Some(value.to_string()),
        "os_release" => facts.os_release = Some(value.to_string()),
        "cpu_model" => facts.cpu_model = Some(value.to_string()),
        "gpu" => facts.gpu = Some(value.to_string()),
        "service_unit" => facts.service_unit = Some(value.to_string()),
        "cpu_cores" => facts.cpu_cores = Some(value.parse().map_err(|_| invalid("a core count"))?),
        "memory_mb" => facts.memory_mb = Some(value.parse().map_err(|_| invalid("a size in MiB"))?),
        "network_online" => {
            facts.network_online = Some(value.parse().map_err(|_| invalid("true or false"))?)
        }
        "models" => {
            let model = value.trim();
            if model.is_empty() {
                return Err(invalid("a model name"));
            }
            if !facts.models.iter().any(|m| m == model) {
                facts.models.push(model.to_string());
            }
        }
        _ => {
            if key.trim().is_empty() {
                return Err(MidwifeError::config("fact name must not be empty"));
            }
            if !facts.insert_extra(key, value) {
                return Err(MidwifeError::config(format!(
                    "cannot add fact {key:?}: the extension map is full"
                )));
            }
        }
    }
    Ok(())
}
