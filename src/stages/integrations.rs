//! Application integrations
//!
//! Last stage: every configured endpoint the assistant depends on must accept
//! connections. Probing is read-only, so it is safe to repeat.

use std::time::Duration;

use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, ProvisionFacts, StageId};
use crate::config::IntegrationProbe;
use crate::stage::{Stage, StageOutcome};
use crate::stages::network::probe_address;

pub struct IntegrationsStage {
    probes: Vec<IntegrationProbe>,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl IntegrationsStage {
    pub fn new(probes: &[IntegrationProbe], timeout: Duration, attempts: u32) -> Self {
        Self {
            probes: probes.to_vec(),
            timeout,
            attempts: attempts.max(1),
            retry_delay: Duration::from_secs(3),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Probes that are currently unreachable, with their errors
    fn unreachable(&self) -> Vec<(&IntegrationProbe, String)> {
        self.probes
            .iter()
            .filter_map(|probe| {
                probe_address(&probe.address, self.timeout)
                    .err()
                    .map(|e| (probe, format!("{e:#}")))
            })
            .collect()
    }
}

impl Stage for IntegrationsStage {
    fn id(&self) -> StageId {
        StageId::Integrations
    }

    fn check(&self, _checkpoint: &Checkpoint) -> bool {
        !self.unreachable().is_empty()
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        if self.probes.is_empty() {
            return StageOutcome::skipped("No integrations configured");
        }

        let mut failures = Vec::new();
        for attempt in 1..=self.attempts {
            failures = self.unreachable();
            if failures.is_empty() {
                break;
            }
            warn!(attempt, down = failures.len(), "Integrations not reachable yet");
            if attempt < self.attempts {
                std::thread::sleep(self.retry_delay);
            }
        }

        if failures.is_empty() {
            let mut facts = ProvisionFacts::default();
            for probe in &self.probes {
                facts.insert_extra(format!("integration.{}", probe.name), probe.address.clone());
            }
            info!(count = self.probes.len(), "All integrations reachable");
            return StageOutcome::success(format!("{} integrations reachable", self.probes.len()))
                .with_facts(facts);
        }

        let names: Vec<&str> = failures.iter().map(|(p, _)| p.name.as_str()).collect();
        let detail: Vec<String> = failures
            .iter()
            .map(|(p, e)| format!("{}: {}", p.name, e))
            .collect();
        StageOutcome::failed(format!("Unreachable integrations: {}", names.join(", ")))
            .with_detail(detail.join("; "))
    }

    fn verify(&self, _checkpoint: &Checkpoint) -> bool {
        self.unreachable().is_empty()
    }
}
