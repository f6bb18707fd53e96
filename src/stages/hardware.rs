//! Hardware inventory
//!
//! Reads CPU, memory, OS and firmware facts straight from procfs/sysfs. The
//! GPU is taken from `lspci` when it is installed. Nothing here changes the
//! machine, so re-running after a crash is always safe.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, ProvisionFacts, StageId};
use crate::command::{binary_exists, run_command};
use crate::stage::{Stage, StageOutcome};

/// Detected firmware mode of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareMode {
    Uefi,
    Bios,
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

pub struct HardwareStage {
    /// Filesystem root to read `/proc`, `/sys` and `/etc` under
    root: PathBuf,
    use_lspci: bool,
}

impl Default for HardwareStage {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareStage {
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("/"),
            use_lspci: true,
        }
    }

    /// Read everything below `root` instead of `/` and never shell out
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            use_lspci: false,
        }
    }

    fn read(&self, path: &str) -> Result<String> {
        let full = sysroot_path(&self.root, path);
        fs::read_to_string(&full).with_context(|| format!("Failed to read {}", full.display()))
    }

    fn firmware_mode(&self) -> FirmwareMode {
        // The kernel only exposes this directory when booted through UEFI
        if self.root.join("sys/firmware/efi").exists() {
            FirmwareMode::Uefi
        } else {
            FirmwareMode::Bios
        }
    }

    fn detect_gpu(&self) -> Option<String> {
        if !self.use_lspci || !binary_exists("lspci") {
            return None;
        }
        match run_command("lspci", &[], &[]) {
            Ok(output) if output.success => parse_lspci_gpu(&output.stdout),
            Ok(output) => {
                debug!(code = ?output.exit_code, "lspci failed, no GPU fact");
                None
            }
            Err(e) => {
                debug!("lspci could not run: {e:#}");
                None
            }
        }
    }

    /// Collect all facts. CPU and memory are mandatory, the rest best effort.
    pub fn detect(&self) -> Result<ProvisionFacts> {
        let cpuinfo = self.read("/proc/cpuinfo")?;
        let (cpu_model, cpu_cores) = parse_cpuinfo(&cpuinfo);
        let meminfo = self.read("/proc/meminfo")?;
        let memory_mb = parse_meminfo(&meminfo).context("MemTotal missing from /proc/meminfo")?;

        let hostname = self
            .read("/etc/hostname")
            .or_else(|_| self.read("/proc/sys/kernel/hostname"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let os_release = match self.read("/etc/os-release") {
            Ok(content) => parse_os_release(&content),
            Err(e) => {
                warn!("{e:#}");
                None
            }
        };

        let mut facts = ProvisionFacts {
            hostname,
            os_release,
            cpu_model,
            cpu_cores,
            memory_mb: Some(memory_mb),
            gpu: self.detect_gpu(),
            ..Default::default()
        };
        facts.insert_extra("firmware", self.firmware_mode().to_string());
        Ok(facts)
    }
}

impl Stage for HardwareStage {
    fn id(&self) -> StageId {
        StageId::Hardware
    }

    fn check(&self, checkpoint: &Checkpoint) -> bool {
        checkpoint.config.cpu_model.is_none() || checkpoint.config.memory_mb.is_none()
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        match self.detect() {
            Ok(facts) => {
                info!(
                    cpu = facts.cpu_model.as_deref().unwrap_or("unknown"),
                    cores = ?facts.cpu_cores,
                    memory_mb = ?facts.memory_mb,
                    gpu = facts.gpu.as_deref().unwrap_or("none"),
                    "Hardware detected"
                );
                StageOutcome::success("Hardware inventory recorded").with_facts(facts)
            }
            // Without procfs nothing later can be trusted either
            Err(e) => StageOutcome::from_error(&e.context("Hardware detection failed")).non_recoverable(),
        }
    }

    fn verify(&self, checkpoint: &Checkpoint) -> bool {
        !self.check(checkpoint)
    }
}

/// CPU model name and logical core count from `/proc/cpuinfo`.
pub fn parse_cpuinfo(content: &str) -> (Option<String>, Option<u32>) {
    let mut model = None;
    let mut cores = 0u32;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => cores += 1,
            // "Model" is what ARM boards report
            "model name" | "Model" if model.is_none() => {
                let value = value.trim();
                if !value.is_empty() {
                    model = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    (model, (cores > 0).then_some(cores))
}

/// Total memory in MiB from `/proc/meminfo`.
pub fn parse_meminfo(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib / 1024)
    })
}

/// `PRETTY_NAME` from `/etc/os-release`, falling back to `NAME`.
pub fn parse_os_release(content: &str) -> Option<String> {
    let value = |wanted: &str| {
        content.lines().find_map(|line| {
            let (key, value) = line.split_once('=')?;
            (key.trim() == wanted).then(|| value.trim().trim_matches('"').to_string())
        })
    };
    value("PRETTY_NAME")
        .or_else(|| value("NAME"))
        .filter(|v| !v.is_empty())
}

/// First display controller in `lspci` output.
pub fn parse_lspci_gpu(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once(' ')?;
        let (class, device) = rest.split_once(": ")?;
        let is_gpu = class.starts_with("VGA compatible controller")
            || class.starts_with("3D controller")
            || class.starts_with("Display controller");
        is_gpu.then(|| device.trim().to_string())
    })
}

/// `path` resolved below `root`.
pub fn sysroot_path(root: &Path, path: &str) -> PathBuf {
    root.join(path.trim_start_matches('/'))
}
