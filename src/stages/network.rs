//! Network connectivity
//!
//! Uses `TcpStream::connect_timeout` rather than ICMP: ping is often
//! firewalled and would mean shelling out. Any one reachable probe is enough.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, ProvisionFacts, StageId};
use crate::config::NetworkSettings;
use crate::stage::{Stage, StageOutcome};

/// Try one `host:port` address. Every resolved socket address is attempted.
pub fn probe_address(address: &str, timeout: Duration) -> Result<()> {
    let addrs = address
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", address))?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(_stream) => {
                debug!(%addr, "Probe connected");
                return Ok(());
            }
            Err(e) => last_err = Some(e),
        }
    }
    match last_err {
        Some(e) => Err(e).with_context(|| format!("Failed to connect to {}", address)),
        None => anyhow::bail!("{} resolved to no addresses", address),
    }
}

pub struct NetworkStage {
    probes: Vec<String>,
    timeout: Duration,
    attempts: u32,
    retry_delay: Duration,
}

impl NetworkStage {
    pub fn new(settings: &NetworkSettings) -> Self {
        Self {
            probes: settings.probes.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            attempts: settings.attempts.max(1),
            retry_delay: Duration::from_secs(2),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// First probe that answers, or the error from each one.
    fn probe_any(&self) -> std::result::Result<&str, Vec<String>> {
        let mut errors = Vec::new();
        for probe in &self.probes {
            match probe_address(probe, self.timeout) {
                Ok(()) => return Ok(probe.as_str()),
                Err(e) => errors.push(format!("{e:#}")),
            }
        }
        Err(errors)
    }
}

impl Stage for NetworkStage {
    fn id(&self) -> StageId {
        StageId::Network
    }

    fn check(&self, checkpoint: &Checkpoint) -> bool {
        checkpoint.config.network_online != Some(true)
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        let mut errors = Vec::new();
        for attempt in 1..=self.attempts {
            match self.probe_any() {
                Ok(probe) => {
                    info!(probe, attempt, "Network connectivity confirmed");
                    let facts = ProvisionFacts {
                        network_online: Some(true),
                        ..Default::default()
                    };
                    return StageOutcome::success(format!("Reached {}", probe)).with_facts(facts);
                }
                Err(e) => {
                    warn!(attempt, attempts = self.attempts, "No probe reachable");
                    errors = e;
                }
            }
            if attempt < self.attempts {
                std::thread::sleep(self.retry_delay);
            }
        }

        StageOutcome::failed("No network connectivity").with_detail(errors.join("; "))
    }

    fn verify(&self, _checkpoint: &Checkpoint) -> bool {
        self.probe_any().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn settings(probes: Vec<String>) -> NetworkSettings {
        NetworkSettings {
            probes,
            timeout_secs: 1,
            attempts: 2,
        }
    }

    /// An address nothing listens on
    fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    #[test]
    fn test_probe_address_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(probe_address(&addr, Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_probe_address_refused() {
        let err = probe_address(&closed_port(), Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to connect to 127.0.0.1:"));
    }

    #[test]
    fn test_stage_succeeds_with_one_reachable_probe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open = listener.local_addr().unwrap().to_string();
        let stage = NetworkStage::new(&settings(vec![closed_port(), open]))
            .with_retry_delay(Duration::ZERO);

        let cp = Checkpoint::new();
        assert!(stage.check(&cp));
        let outcome = stage.run(&cp);
        assert!(!outcome.is_failure());
        assert_eq!(outcome.facts.unwrap().network_online, Some(true));
        assert!(stage.verify(&cp));
    }

    #[test]
    fn test_stage_fails_recoverably_when_offline() {
        let stage =
            NetworkStage::new(&settings(vec![closed_port()])).with_retry_delay(Duration::ZERO);
        let outcome = stage.run(&Checkpoint::new());
        assert!(outcome.is_failure());
        assert!(outcome.recoverable);
        assert_eq!(outcome.message, "No network connectivity");
        assert!(outcome.detail.unwrap().contains("Failed to connect"));
    }

    #[test]
    fn test_check_trusts_recorded_fact() {
        let stage = NetworkStage::new(&settings(vec![closed_port()]));
        let mut cp = Checkpoint::new();
        cp.config.network_online = Some(true);
        assert!(!stage.check(&cp));
    }
}
