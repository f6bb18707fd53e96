//! Provisioning checkpoint
//!
//! The single persisted record of pipeline progress. The engine owns one
//! `Checkpoint` value and passes it by reference to every stage; the only other
//! writer is an operator intervening through the checkpoint file.
//!
//! # Phase Flow
//!
//! ```text
//! init
//!   ↓
//! hardware → network → packages → models → service → integrations
//!   ↓
//! complete
//!
//! (any pipeline stage can move to `error`; an operator may hold `umbilical`
//!  while a human session is active, and resolves `error` by writing any other phase)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// Version of the on-disk checkpoint layout.
pub const SCHEMA_VERSION: u32 = 1;

/// Upper bound on stage-specific facts kept in [`ProvisionFacts::extra`].
pub const MAX_EXTRA_FACTS: usize = 64;

/// Stable identifiers for every provisioning stage.
///
/// The string forms are persisted in the checkpoint and accepted on the
/// command line, so they must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageId {
    /// Detect CPU, memory, GPU and OS facts
    Hardware,
    /// Confirm outbound connectivity
    Network,
    /// Install OS packages
    Packages,
    /// Pull language-model weights
    Models,
    /// Generate and enable the service-manager unit
    Service,
    /// Probe application-level integrations
    Integrations,
}

impl StageId {
    /// Returns a human-readable description of this stage
    pub const fn description(self) -> &'static str {
        match self {
            Self::Hardware => "Detecting hardware",
            Self::Network => "Checking network connectivity",
            Self::Packages => "Installing system packages",
            Self::Models => "Pulling language models",
            Self::Service => "Installing service unit",
            Self::Integrations => "Testing integrations",
        }
    }
}

/// Current pipeline position, persisted as the checkpoint's `stage` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Phase {
    /// Checkpoint created, no stage entered yet
    Init,
    /// A pipeline stage is (or was, before a crash) in flight
    Running(StageId),
    /// Every catalog entry is satisfied
    Complete,
    /// A stage failed and the engine is waiting for an operator
    Error,
    /// An operator session is attached to the machine
    Umbilical,
}

impl Phase {
    /// Returns true while the pipeline is parked on an operator.
    ///
    /// The escalation wait ends as soon as this turns false.
    pub const fn awaits_operator(self) -> bool {
        matches!(self, Phase::Error | Phase::Umbilical)
    }

    /// Returns the stage identifier if this phase is a pipeline stage
    pub const fn stage(self) -> Option<StageId> {
        match self {
            Phase::Running(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Init => f.write_str("init"),
            Phase::Running(id) => f.write_str(id.as_ref()),
            Phase::Complete => f.write_str("complete"),
            Phase::Error => f.write_str("error"),
            Phase::Umbilical => f.write_str("umbilical"),
        }
    }
}

impl FromStr for Phase {
    type Err = strum::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Phase::Init),
            "complete" => Ok(Phase::Complete),
            "error" => Ok(Phase::Error),
            "umbilical" => Ok(Phase::Umbilical),
            other => StageId::from_str(other).map(Phase::Running),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.to_string()
    }
}

impl TryFrom<String> for Phase {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Phase, strum::ParseError> {
        value.parse()
    }
}

/// One entry in the append-only failure log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: StageId,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl ErrorRecord {
    pub fn new(
        stage: StageId,
        message: impl Into<String>,
        detail: Option<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            stage,
            message: message.into(),
            detail,
            timestamp: Utc::now(),
            recoverable,
        }
    }
}

/// Facts accumulated by stages.
///
/// Every field is optional: stages read what earlier stages left behind and
/// must cope with anything being absent (an operator may have skipped the
/// stage that would have filled it in).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionFacts {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_online: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_unit: Option<String>,
    /// Stage-specific facts without a dedicated field, capped at [`MAX_EXTRA_FACTS`]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ProvisionFacts {
    /// Insert a stage-specific fact.
    ///
    /// Returns false (and stores nothing) if the key is new and the map is full.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if !self.extra.contains_key(&key) && self.extra.len() >= MAX_EXTRA_FACTS {
            tracing::warn!(key = %key, "Dropping fact: extension map is full");
            return false;
        }
        self.extra.insert(key, value.into());
        true
    }

    /// Merge facts reported by a stage. Present values win; models are unioned.
    pub fn merge(&mut self, update: ProvisionFacts) {
        let ProvisionFacts {
            hostname,
            os_release,
            cpu_model,
            cpu_cores,
            memory_mb,
            gpu,
            network_online,
            models,
            service_unit,
            extra,
        } = update;

        if hostname.is_some() {
            self.hostname = hostname;
        }
        if os_release.is_some() {
            self.os_release = os_release;
        }
        if cpu_model.is_some() {
            self.cpu_model = cpu_model;
        }
        if cpu_cores.is_some() {
            self.cpu_cores = cpu_cores;
        }
        if memory_mb.is_some() {
            self.memory_mb = memory_mb;
        }
        if gpu.is_some() {
            self.gpu = gpu;
        }
        if network_online.is_some() {
            self.network_online = network_online;
        }
        for model in models {
            if !self.models.contains(&model) {
                self.models.push(model);
            }
        }
        if service_unit.is_some() {
            self.service_unit = service_unit;
        }
        for (key, value) in extra {
            self.insert_extra(key, value);
        }
    }
}

/// The persisted pipeline record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    /// Write counter used for compare-and-swap saves
    #[serde(default)]
    pub revision: u64,
    pub stage: Phase,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_stages: BTreeSet<StageId>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub progress_percent: u8,
    #[serde(default)]
    pub config: ProvisionFacts,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint {
    /// Create a fresh checkpoint in the `init` phase.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            revision: 0,
            stage: Phase::Init,
            started_at: now,
            updated_at: now,
            completed_stages: BTreeSet::new(),
            errors: Vec::new(),
            current_task: None,
            progress_percent: 0,
            config: ProvisionFacts::default(),
        }
    }

    /// Refresh `updated_at`. Called on every mutation before persisting.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    #[inline]
    pub fn is_completed(&self, id: StageId) -> bool {
        self.completed_stages.contains(&id)
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.stage == Phase::Complete
    }

    /// Enter a pipeline stage. `task` is the stage's own description.
    pub fn begin_stage(&mut self, id: StageId, task: &str) {
        self.stage = Phase::Running(id);
        self.current_task = Some(task.to_string());
    }

    /// Catalog entries not yet completed, in catalog order
    pub fn pending(&self, catalog: &[StageId]) -> Vec<StageId> {
        catalog
            .iter()
            .copied()
            .filter(|id| !self.is_completed(*id))
            .collect()
    }

    /// End a session that left catalog entries outstanding.
    ///
    /// The phase stays on the last stage entered; only `finish` may set
    /// `complete`.
    pub fn pause(&mut self, catalog: &[StageId]) {
        self.recompute_progress(catalog);
        let pending = self.pending(catalog);
        let names: Vec<&str> = pending.iter().map(|id| id.as_ref()).collect();
        self.current_task = Some(format!("Pending: {}", names.join(", ")));
    }

    /// Record a satisfied stage and recompute progress against `catalog`.
    pub fn mark_completed(&mut self, id: StageId, catalog: &[StageId]) {
        self.completed_stages.insert(id);
        self.recompute_progress(catalog);
    }

    /// Recompute `progress_percent` from the completed set.
    pub fn recompute_progress(&mut self, catalog: &[StageId]) {
        self.progress_percent = progress_percent(&self.completed_stages, catalog);
    }

    /// Append a failure and park the pipeline in the `error` phase.
    pub fn record_failure(&mut self, record: ErrorRecord) {
        self.current_task = Some(format!(
            "Awaiting operator: {} failed",
            record.stage.description()
        ));
        self.errors.push(record);
        self.stage = Phase::Error;
    }

    /// Most recent failure, if any
    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.errors.last()
    }

    /// Mark the whole pipeline as done.
    pub fn finish(&mut self, catalog: &[StageId]) {
        self.recompute_progress(catalog);
        self.stage = Phase::Complete;
        self.current_task = None;
    }
}

/// `100 * |completed ∩ catalog| / |catalog|`, rounded down.
///
/// An empty catalog is trivially complete.
pub fn progress_percent(completed: &BTreeSet<StageId>, catalog: &[StageId]) -> u8 {
    if catalog.is_empty() {
        return 100;
    }
    let done = catalog.iter().filter(|id| completed.contains(id)).count();
    // done <= catalog.len(), so the quotient is at most 100
    (100 * done / catalog.len()) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    // =========================================================================
    // StageId / Phase Tests
    // =========================================================================

    #[test]
    fn test_stage_id_string_forms() {
        assert_eq!(StageId::Hardware.to_string(), "hardware");
        assert_eq!(StageId::Integrations.as_ref(), "integrations");
        assert_eq!("models".parse::<StageId>().unwrap(), StageId::Models);
        assert!("bogus".parse::<StageId>().is_err());
    }

    #[test]
    fn test_every_stage_has_description() {
        for id in StageId::iter() {
            assert!(!id.description().is_empty(), "{:?} has no description", id);
        }
    }

    #[test]
    fn test_phase_parses_all_tags() {
        assert_eq!("init".parse::<Phase>().unwrap(), Phase::Init);
        assert_eq!("complete".parse::<Phase>().unwrap(), Phase::Complete);
        assert_eq!("error".parse::<Phase>().unwrap(), Phase::Error);
        assert_eq!("umbilical".parse::<Phase>().unwrap(), Phase::Umbilical);
        assert_eq!(
            "packages".parse::<Phase>().unwrap(),
            Phase::Running(StageId::Packages)
        );
        assert!("halfway".parse::<Phase>().is_err());
    }

    #[test]
    fn test_phase_serializes_as_plain_tag() {
        let json = serde_json::to_string(&Phase::Running(StageId::Network)).unwrap();
        assert_eq!(json, "\"network\"");
        let json = serde_json::to_string(&Phase::Error).unwrap();
        assert_eq!(json, "\"error\"");
    }

    #[test]
    fn test_awaits_operator() {
        assert!(Phase::Error.awaits_operator());
        assert!(Phase::Umbilical.awaits_operator());
        assert!(!Phase::Init.awaits_operator());
        assert!(!Phase::Running(StageId::Models).awaits_operator());
        assert!(!Phase::Complete.awaits_operator());
    }

    // =========================================================================
    // Progress Tests
    // =========================================================================

    #[test]
    fn test_progress_counts_only_catalog_members() {
        let catalog = [StageId::Network, StageId::Packages, StageId::Models];
        let mut completed = BTreeSet::new();
        assert_eq!(progress_percent(&completed, &catalog), 0);

        completed.insert(StageId::Network);
        assert_eq!(progress_percent(&completed, &catalog), 33);

        // Not in the catalog: must not count
        completed.insert(StageId::Service);
        assert_eq!(progress_percent(&completed, &catalog), 33);

        completed.insert(StageId::Packages);
        completed.insert(StageId::Models);
        assert_eq!(progress_percent(&completed, &catalog), 100);
    }

    #[test]
    fn test_progress_empty_catalog() {
        assert_eq!(progress_percent(&BTreeSet::new(), &[]), 100);
    }

    // =========================================================================
    // Checkpoint Tests
    // =========================================================================

    #[test]
    fn test_new_checkpoint_starts_at_init() {
        let cp = Checkpoint::new();
        assert_eq!(cp.stage, Phase::Init);
        assert_eq!(cp.schema_version, SCHEMA_VERSION);
        assert_eq!(cp.revision, 0);
        assert!(cp.completed_stages.is_empty());
        assert_eq!(cp.progress_percent, 0);
    }

    #[test]
    fn test_record_failure_parks_in_error() {
        let mut cp = Checkpoint::new();
        cp.begin_stage(StageId::Packages, "Installing system packages");
        cp.record_failure(ErrorRecord::new(
            StageId::Packages,
            "apt update failed",
            None,
            true,
        ));

        assert_eq!(cp.stage, Phase::Error);
        assert_eq!(cp.errors.len(), 1);
        assert_eq!(cp.last_error().map(|e| e.stage), Some(StageId::Packages));
        assert!(cp.current_task.as_deref().unwrap_or("").contains("Awaiting operator"));
    }

    #[test]
    fn test_pause_keeps_phase_and_lists_pending() {
        let catalog = [StageId::Network, StageId::Packages, StageId::Models];
        let mut cp = Checkpoint::new();
        cp.begin_stage(StageId::Models, "Pulling language models");
        cp.mark_completed(StageId::Models, &catalog);
        cp.pause(&catalog);

        assert_eq!(cp.stage, Phase::Running(StageId::Models));
        assert_eq!(cp.pending(&catalog), vec![StageId::Network, StageId::Packages]);
        assert_eq!(cp.current_task.as_deref(), Some("Pending: network, packages"));
        assert_eq!(cp.progress_percent, 33);
    }

    #[test]
    fn test_checkpoint_json_layout() {
        let mut cp = Checkpoint::new();
        cp.mark_completed(StageId::Hardware, &[StageId::Hardware, StageId::Network]);
        let value = serde_json::to_value(&cp).unwrap();

        assert_eq!(value["stage"], "init");
        assert_eq!(value["completed_stages"][0], "hardware");
        assert_eq!(value["progress_percent"], 50);
        assert_eq!(value["schema_version"], 1);
    }

    // =========================================================================
    // ProvisionFacts Tests
    // =========================================================================

    #[test]
    fn test_merge_prefers_present_values() {
        let mut facts = ProvisionFacts {
            hostname: Some("old".into()),
            cpu_cores: Some(4),
            models: vec!["llama3".into()],
            ..Default::default()
        };
        facts.merge(ProvisionFacts {
            hostname: Some("new".into()),
            memory_mb: Some(16_000),
            models: vec!["llama3".into(), "mistral".into()],
            ..Default::default()
        });

        assert_eq!(facts.hostname.as_deref(), Some("new"));
        assert_eq!(facts.cpu_cores, Some(4));
        assert_eq!(facts.memory_mb, Some(16_000));
        assert_eq!(facts.models, vec!["llama3".to_string(), "mistral".to_string()]);
    }

    #[test]
    fn test_extra_facts_are_bounded() {
        let mut facts = ProvisionFacts::default();
        for i in 0..MAX_EXTRA_FACTS {
            assert!(facts.insert_extra(format!("k{i}"), "v"));
        }
        assert!(!facts.insert_extra("overflow", "v"));
        // Existing keys can still be updated
        assert!(facts.insert_extra("k0", "updated"));
        assert_eq!(facts.extra.len(), MAX_EXTRA_FACTS);
        assert_eq!(facts.extra["k0"], "updated");
    }

    #[test]
    fn test_facts_tolerate_missing_and_unknown_fields() {
        let facts: ProvisionFacts = serde_json::from_str(r#"{"gpu":"nvidia","rack":"b4"}"#).unwrap();
        assert_eq!(facts.gpu.as_deref(), Some("nvidia"));
        assert!(facts.hostname.is_none());
    }
}
