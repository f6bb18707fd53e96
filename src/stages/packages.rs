//! System packages via apt
//!
//! Only packages `dpkg` does not report as installed are passed to apt, so a
//! re-run after a crash installs whatever is still missing and nothing else.

use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, StageId};
use crate::command::{binary_exists, run_command};
use crate::stage::{Stage, StageOutcome};

const APT_ENV: &[(&str, &str)] = &[("DEBIAN_FRONTEND", "noninteractive")];

pub struct PackagesStage {
    packages: Vec<String>,
}

impl PackagesStage {
    pub fn new(packages: Vec<String>) -> Self {
        Self { packages }
    }

    /// Configured packages not currently installed.
    ///
    /// If `dpkg-query` cannot be run at all, everything counts as missing.
    pub fn missing(&self) -> Vec<String> {
        if self.packages.is_empty() {
            return Vec::new();
        }
        let mut args = vec!["-W", "-f=${Package} ${Status}\\n"];
        args.extend(self.packages.iter().map(String::as_str));

        // dpkg-query exits 1 when any name is unknown but still lists the rest
        let installed = match run_command("dpkg-query", &args, &[]) {
            Ok(output) => parse_dpkg_status(&output.stdout),
            Err(e) => {
                warn!("dpkg-query unavailable: {e:#}");
                BTreeSet::new()
            }
        };
        self.packages
            .iter()
            .filter(|p| !installed.contains(p.as_str()))
            .cloned()
            .collect()
    }
}

impl Stage for PackagesStage {
    fn id(&self) -> StageId {
        StageId::Packages
    }

    fn check(&self, _checkpoint: &Checkpoint) -> bool {
        !self.missing().is_empty()
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        let missing = self.missing();
        if missing.is_empty() {
            return StageOutcome::skipped("All packages already installed");
        }
        if !binary_exists("apt-get") {
            return StageOutcome::failed("apt-get is not available on this system")
                .with_detail(format!("missing packages: {}", missing.join(" ")))
                .non_recoverable();
        }

        match run_command("apt-get", &["update"], APT_ENV) {
            Ok(output) if output.success => {}
            Ok(output) => {
                return StageOutcome::failed("apt update failed")
                    .with_detail(output.stderr.trim().to_string());
            }
            Err(e) => return StageOutcome::from_error(&e.context("apt update failed")),
        }

        let mut args = vec!["install", "-y", "--no-install-recommends"];
        args.extend(missing.iter().map(String::as_str));
        match run_command("apt-get", &args, APT_ENV) {
            Ok(output) if output.success => {
                info!(count = missing.len(), "Packages installed");
                StageOutcome::success(format!("Installed {}", missing.join(", ")))
            }
            Ok(output) => StageOutcome::failed("Package installation failed")
                .with_detail(output.stderr.trim().to_string()),
            Err(e) => StageOutcome::from_error(&e.context("Package installation failed")),
        }
    }

    fn verify(&self, _checkpoint: &Checkpoint) -> bool {
        self.missing().is_empty()
    }
}

/// Installed package names from `dpkg-query -W -f='${Package} ${Status}\n'`.
pub fn parse_dpkg_status(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let (name, status) = line.trim().split_once(' ')?;
            status
                .ends_with("install ok installed")
                .then(|| name.to_string())
        })
        .collect()
}
