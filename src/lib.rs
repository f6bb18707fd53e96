//! midwife library
//!
//! Resumable, checkpointed provisioning pipeline. The [`engine::Engine`]
//! walks a fixed [`stage::Catalog`], persisting every transition through the
//! [`store::CheckpointStore`] and parking in an operator escalation whenever a
//! stage fails.

pub mod checkpoint;
pub mod cli;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod intervention;
pub mod notify;
pub mod process_guard;
pub mod stage;
pub mod stages;
pub mod store;

// Re-export main types for convenience
pub use checkpoint::{Checkpoint, ErrorRecord, Phase, ProvisionFacts, StageId};
pub use config::MidwifeConfig;
pub use engine::{Engine, RunReport, StageDiagnosis};
pub use error::{MidwifeError, Result};
pub use escalation::{Escalation, EscalationController, EscalationPolicy};
pub use intervention::Intervention;
pub use notify::{NotificationSink, Notice, Notifier};
pub use process_guard::{ChildRegistry, GuardedCommand, Interrupt, ProcessGuard, TrackedChild};
pub use stage::{Catalog, Stage, StageOutcome, StageStatus};
pub use store::{CheckpointStore, StoreError};
