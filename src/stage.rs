//! Stage contract and catalog.
//!
//! Every provisioning step implements [`Stage`]. The [`Catalog`] fixes the
//! order in which the engine visits them; it is built once and never reordered.
//!
//! # Contract
//!
//! - `check()`: side-effect free. Returns true if real work remains.
//! - `run()`: performs the effect. Must be safe to call again after a crash
//!   half-way through, either because the effect is naturally idempotent or
//!   because the stage re-checks its preconditions first.
//! - `verify()`: independent confirmation that the goal state holds. Used for
//!   diagnostics only, never to gate the pipeline.

use std::fmt;

use crate::checkpoint::{Checkpoint, ProvisionFacts, StageId};
use crate::error::{MidwifeError, Result};

/// Result classification of a single `run()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Success,
    Skipped,
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// What a stage reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub message: String,
    pub detail: Option<String>,
    /// Facts to merge into the checkpoint's `config`
    pub facts: Option<ProvisionFacts>,
    /// Only meaningful for failures; defaults to true
    pub recoverable: bool,
}

impl StageOutcome {
    fn with_status(status: StageStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
            facts: None,
            recoverable: true,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::with_status(StageStatus::Success, message)
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self::with_status(StageStatus::Skipped, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(StageStatus::Failed, message)
    }

    /// Failure from an error chain: the outermost context becomes the message,
    /// the full chain the detail.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::failed(err.to_string()).with_detail(format!("{err:#}"))
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_facts(mut self, facts: ProvisionFacts) -> Self {
        self.facts = Some(facts);
        self
    }

    /// Mark a failure as needing manual repair rather than a retry
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        self.status == StageStatus::Failed
    }
}

/// A single provisioning step.
pub trait Stage: Send {
    /// Stable identifier, also the pipeline tag persisted in the checkpoint
    fn id(&self) -> StageId;

    /// Human-readable description for `current_task` and listings
    fn description(&self) -> &str {
        self.id().description()
    }

    /// Returns true if real work remains.
    fn check(&self, checkpoint: &Checkpoint) -> bool;

    /// Perform the stage's effect.
    fn run(&self, checkpoint: &Checkpoint) -> StageOutcome;

    /// Returns true if the stage's goal state currently holds.
    fn verify(&self, checkpoint: &Checkpoint) -> bool;
}

/// Fixed, ordered list of stages defining the pipeline.
pub struct Catalog {
    stages: Vec<Box<dyn Stage>>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

impl Catalog {
    /// Build a catalog. Each identifier may appear only once.
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Result<Self> {
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].iter().any(|s| s.id() == stage.id()) {
                return Err(MidwifeError::config(format!(
                    "stage '{}' appears more than once in the catalog",
                    stage.id()
                )));
            }
        }
        Ok(Self { stages })
    }

    /// Identifiers in pipeline order
    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Stage> {
        self.stages.iter().map(|s| s.as_ref())
    }

    /// Position of `id` in the pipeline
    pub fn position(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|s| s.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(StageId);

    impl Stage for Noop {
        fn id(&self) -> StageId {
            self.0
        }
        fn check(&self, _: &Checkpoint) -> bool {
            true
        }
        fn run(&self, _: &Checkpoint) -> StageOutcome {
            StageOutcome::success("done")
        }
        fn verify(&self, _: &Checkpoint) -> bool {
            true
        }
    }

    #[test]
    fn test_catalog_preserves_order() {
        let catalog = Catalog::new(vec![
            Box::new(Noop(StageId::Models)),
            Box::new(Noop(StageId::Network)),
        ])
        .unwrap();
        assert_eq!(catalog.ids(), vec![StageId::Models, StageId::Network]);
        assert_eq!(catalog.position(StageId::Network), Some(1));
        assert_eq!(catalog.position(StageId::Service), None);
        assert_eq!(catalog.iter().next().map(|s| s.description()), Some("Pulling language models"));
    }

    #[test]
    fn test_catalog_rejects_duplicates() {
        let err = Catalog::new(vec![
            Box::new(Noop(StageId::Network)),
            Box::new(Noop(StageId::Network)),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_outcome_defaults_to_recoverable() {
        let outcome = StageOutcome::failed("apt update failed");
        assert!(outcome.is_failure());
        assert!(outcome.recoverable);
        assert!(!outcome.non_recoverable().recoverable);
    }

    #[test]
    fn test_outcome_from_error_chain() {
        let err = anyhow::anyhow!("exit code 100").context("apt update failed");
        let outcome = StageOutcome::from_error(&err);
        assert_eq!(outcome.message, "apt update failed");
        assert_eq!(outcome.detail.as_deref(), Some("apt update failed: exit code 100"));
    }
}
