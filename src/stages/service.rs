//! Assistant systemd unit
//!
//! The unit file is rendered from configuration and only rewritten when its
//! content differs; `systemctl enable --now` is a no-op for a running unit.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::checkpoint::{Checkpoint, ProvisionFacts, StageId};
use crate::command::{binary_exists, run_command};
use crate::config::ServiceSettings;
use crate::stage::{Stage, StageOutcome};

pub struct ServiceStage {
    settings: ServiceSettings,
}

impl ServiceStage {
    pub fn new(settings: &ServiceSettings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }

    pub fn unit_name(&self) -> String {
        format!("{}.service", self.settings.name)
    }

    pub fn unit_path(&self) -> PathBuf {
        self.settings.unit_dir.join(self.unit_name())
    }

    fn unit_is_current(&self) -> bool {
        fs::read_to_string(self.unit_path())
            .map(|existing| existing == render_unit(&self.settings))
            .unwrap_or(false)
    }

    /// Write the unit file if it differs. Returns true if it was written.
    pub fn write_unit(&self) -> Result<bool> {
        if self.unit_is_current() {
            debug!(path = %self.unit_path().display(), "Unit file already current");
            return Ok(false);
        }
        fs::create_dir_all(&self.settings.unit_dir).with_context(|| {
            format!("Failed to create {}", self.settings.unit_dir.display())
        })?;
        let path = self.unit_path();
        fs::write(&path, render_unit(&self.settings))
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Unit file written");
        Ok(true)
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        let output = run_command("systemctl", args, &[])?;
        output.ensure_success(&format!("systemctl {}", args.join(" ")))
    }

    fn is_enabled(&self) -> bool {
        let unit = self.unit_name();
        run_command("systemctl", &["is-enabled", "--quiet", unit.as_str()], &[])
            .map(|output| output.success)
            .unwrap_or(false)
    }

    fn install(&self) -> Result<()> {
        if self.write_unit()? {
            self.systemctl(&["daemon-reload"])?;
        }
        let unit = self.unit_name();
        self.systemctl(&["enable", "--now", unit.as_str()])
    }
}

impl Stage for ServiceStage {
    fn id(&self) -> StageId {
        StageId::Service
    }

    fn check(&self, _checkpoint: &Checkpoint) -> bool {
        !self.unit_is_current() || !self.is_enabled()
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        if !binary_exists("systemctl") {
            return StageOutcome::failed("systemd is not available on this system")
                .non_recoverable();
        }
        match self.install() {
            Ok(()) => {
                let facts = ProvisionFacts {
                    service_unit: Some(self.unit_path().display().to_string()),
                    ..Default::default()
                };
                StageOutcome::success(format!("{} enabled and started", self.unit_name()))
                    .with_facts(facts)
            }
            Err(e) => StageOutcome::from_error(&e.context("Service installation failed")),
        }
    }

    fn verify(&self, _checkpoint: &Checkpoint) -> bool {
        let unit = self.unit_name();
        self.unit_is_current()
            && run_command("systemctl", &["is-active", "--quiet", unit.as_str()], &[])
                .map(|output| output.success)
                .unwrap_or(false)
    }
}

/// Render the unit file for the assistant service.
pub fn render_unit(settings: &ServiceSettings) -> String {
    let mut unit = String::new();
    // Writing to a String cannot fail
    let _ = writeln!(unit, "# Managed by midwife; local edits are overwritten");
    let _ = writeln!(unit, "[Unit]");
    let _ = writeln!(unit, "Description={}", settings.description);
    let _ = writeln!(unit, "Wants=network-online.target");
    let _ = writeln!(unit, "After=network-online.target");
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Service]");
    let _ = writeln!(unit, "Type=simple");
    let _ = writeln!(unit, "ExecStart={}", settings.exec_start);
    if let Some(user) = &settings.user {
        let _ = writeln!(unit, "User={}", user);
    }
    for (key, value) in &settings.environment {
        let _ = writeln!(unit, "Environment=\"{}={}\"", key, value);
    }
    let _ = writeln!(unit, "Restart=on-failure");
    let _ = writeln!(unit, "RestartSec=5");
    let _ = writeln!(unit);
    let _ = writeln!(unit, "[Install]");
    let _ = writeln!(unit, "WantedBy=multi-user.target");
    unit
}
