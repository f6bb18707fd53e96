//! Configuration file handling.
//!
//! midwife reads a single JSON document. Every field has a default, so an
//! empty file (or no file at all) yields a working configuration for a stock
//! Debian-family image.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::escalation::EscalationPolicy;

pub const DEFAULT_CHECKPOINT_PATH: &str = "/var/lib/midwife/checkpoint.json";

/// Overrides the configuration file location
pub const CONFIG_ENV: &str = "MIDWIFE_CONFIG";

/// Overrides `checkpoint_path` from the configuration file
pub const CHECKPOINT_ENV: &str = "MIDWIFE_CHECKPOINT";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidwifeConfig {
    pub checkpoint_path: PathBuf,
    pub escalation: EscalationSettings,
    pub notify: NotifySettings,
    pub network: NetworkSettings,
    /// OS packages installed by the packages stage
    pub packages: Vec<String>,
    pub models: ModelSettings,
    pub service: ServiceSettings,
    pub integrations: Vec<IntegrationProbe>,
}

impl Default for MidwifeConfig {
    fn default() -> Self {
        Self {
            checkpoint_path: PathBuf::from(DEFAULT_CHECKPOINT_PATH),
            escalation: EscalationSettings::default(),
            notify: NotifySettings::None,
            network: NetworkSettings::default(),
            packages: ["ca-certificates", "curl", "git", "jq"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            models: ModelSettings::default(),
            service: ServiceSettings::default(),
            integrations: vec![IntegrationProbe {
                name: "ollama".to_string(),
                address: "127.0.0.1:11434".to_string(),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationSettings {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            timeout_secs: 3600,
        }
    }
}

/// Where remote notifications go. The console mirror is always on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifySettings {
    None,
    /// Run a relay client; the message is appended as the last argument
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_notify_timeout")]
        timeout_secs: u64,
    },
    /// Write one JSON line to a relay daemon's Unix socket
    Socket {
        path: PathBuf,
        #[serde(default = "default_notify_timeout")]
        timeout_secs: u64,
    },
}

fn default_notify_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// `host:port` endpoints; reaching any one of them counts as online
    pub probes: Vec<String>,
    pub timeout_secs: u64,
    pub attempts: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probes: vec!["1.1.1.1:443".to_string(), "deb.debian.org:443".to_string()],
            timeout_secs: 5,
            attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub names: Vec<String>,
    pub ollama_bin: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            names: vec!["llama3.2".to_string()],
            ollama_bin: "ollama".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Unit name without the `.service` suffix
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub user: Option<String>,
    pub unit_dir: PathBuf,
    pub environment: BTreeMap<String, String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "assistant".to_string(),
            description: "Resident assistant".to_string(),
            exec_start: "/usr/local/bin/assistant serve".to_string(),
            user: None,
            unit_dir: PathBuf::from("/etc/systemd/system"),
            environment: BTreeMap::new(),
        }
    }
}

/// An application endpoint that must accept TCP connections once provisioning is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationProbe {
    pub name: String,
    pub address: String,
}

impl MidwifeConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Locate and load the configuration.
    ///
    /// Precedence: explicit path, then `MIDWIFE_CONFIG`, then built-in
    /// defaults. `MIDWIFE_CHECKPOINT` overrides the checkpoint location last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        Self::resolve_with(
            explicit,
            std::env::var_os(CONFIG_ENV).map(PathBuf::from),
            std::env::var_os(CHECKPOINT_ENV).map(PathBuf::from),
        )
    }

    fn resolve_with(
        explicit: Option<&Path>,
        env_config: Option<PathBuf>,
        env_checkpoint: Option<PathBuf>,
    ) -> Result<Self> {
        let mut config = match explicit.map(Path::to_path_buf).or(env_config) {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::default(),
        };
        if let Some(checkpoint) = env_checkpoint {
            config.checkpoint_path = checkpoint;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_path.as_os_str().is_empty() {
            anyhow::bail!("Checkpoint path must be specified");
        }

        if self.escalation.poll_interval_secs == 0 {
            anyhow::bail!("Escalation poll interval must be at least one second");
        }
        if self.escalation.timeout_secs < self.escalation.poll_interval_secs {
            anyhow::bail!("Escalation timeout must not be shorter than the poll interval");
        }

        match &self.notify {
            NotifySettings::Command { program, .. } if program.trim().is_empty() => {
                anyhow::bail!("Notification command program must be specified");
            }
            NotifySettings::Socket { path, .. } if path.as_os_str().is_empty() => {
                anyhow::bail!("Notification socket path must be specified");
            }
            _ => {}
        }

        if self.network.probes.is_empty() {
            anyhow::bail!("At least one network probe address is required");
        }
        if self.network.attempts == 0 {
            anyhow::bail!("Network probe attempts must be at least 1");
        }
        for probe in &self.network.probes {
            validate_address(probe).context("Invalid network probe")?;
        }

        for package in &self.packages {
            if package.is_empty()
                || !package
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "+-.:".contains(c))
            {
                anyhow::bail!("Invalid package name: {:?}", package);
            }
        }

        for model in &self.models.names {
            if model.trim().is_empty() || model.contains(char::is_whitespace) {
                anyhow::bail!("Invalid model name: {:?}", model);
            }
        }

        let name = &self.service.name;
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_@.".contains(c))
        {
            anyhow::bail!("Service name can only contain letters, numbers, '-', '_', '@' and '.'");
        }
        if !self.service.exec_start.starts_with('/') {
            anyhow::bail!("Service ExecStart must be an absolute path");
        }

        for probe in &self.integrations {
            if probe.name.trim().is_empty() {
                anyhow::bail!("Integration name must be specified");
            }
            validate_address(&probe.address)
                .with_context(|| format!("Invalid address for integration {}", probe.name))?;
        }

        Ok(())
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            poll_interval: Duration::from_secs(self.escalation.poll_interval_secs),
            timeout: Duration::from_secs(self.escalation.timeout_secs),
        }
    }
}

/// `host:port` with a numeric port
fn validate_address(address: &str) -> Result<()> {
    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("{:?} is not in host:port form", address))?;
    if host.is_empty() {
        anyhow::bail!("{:?} has an empty host", address);
    }
    port.parse::<u16>()
        .with_context(|| format!("{:?} has an invalid port", address))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = MidwifeConfig::default();
        config.validate().expect("defaults must validate");
        assert_eq!(config.escalation.poll_interval_secs, 10);
        assert_eq!(config.escalation.timeout_secs, 3600);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: MidwifeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, MidwifeConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let json = r#"{
            "packages": ["htop"],
            "escalation": { "timeout_secs": 60 },
            "notify": { "kind": "command", "program": "relay-send", "args": ["--room", "ops"] }
        }"#;
        let config: MidwifeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.packages, vec!["htop".to_string()]);
        assert_eq!(config.escalation.poll_interval_secs, 10);
        assert_eq!(config.escalation.timeout_secs, 60);
        assert_eq!(
            config.notify,
            NotifySettings::Command {
                program: "relay-send".into(),
                args: vec!["--room".into(), "ops".into()],
                timeout_secs: 10,
            }
        );
        config.validate().unwrap();
    }

    fn write_config(config: &MidwifeConfig) -> NamedTempFile {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(serde_json::to_string_pretty(config).unwrap().as_bytes())
            .unwrap();
        temp
    }

    #[test]
    fn test_load_file_round_trip() {
        let mut config = MidwifeConfig::default();
        config.models.names = vec!["mistral".into()];

        let temp = write_config(&config);
        let loaded = MidwifeConfig::load_from_file(temp.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let mut temp = NamedTempFile::new().unwrap();
        writeln!(temp, "{{ not json").unwrap();
        assert!(MidwifeConfig::load_from_file(temp.path()).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = MidwifeConfig::default();
        config.escalation.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = MidwifeConfig::default();
        config.escalation.timeout_secs = 5;
        assert!(config.validate().is_err());

        let mut config = MidwifeConfig::default();
        config.packages.push("rm -rf".into());
        assert!(config.validate().is_err());

        let mut config = MidwifeConfig::default();
        config.network.probes = vec!["no-port".into()];
        assert!(config.validate().is_err());

        let mut config = MidwifeConfig::default();
        config.service.exec_start = "assistant".into();
        assert!(config.validate().is_err());

        let mut config = MidwifeConfig::default();
        config.notify = NotifySettings::Command {
            program: " ".into(),
            args: vec![],
            timeout_secs: 10,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_precedence() {
        let mut explicit = MidwifeConfig::default();
        explicit.packages = vec!["explicit".into()];
        let explicit_file = write_config(&explicit);

        let mut from_env = MidwifeConfig::default();
        from_env.packages = vec!["env".into()];
        let env_file = write_config(&from_env);

        let config = MidwifeConfig::resolve_with(
            Some(explicit_file.path()),
            Some(env_file.path().to_path_buf()),
            None,
        )
        .unwrap();
        assert_eq!(config.packages, vec!["explicit".to_string()]);

        let config =
            MidwifeConfig::resolve_with(None, Some(env_file.path().to_path_buf()), None).unwrap();
        assert_eq!(config.packages, vec!["env".to_string()]);

        let config =
            MidwifeConfig::resolve_with(None, None, Some(PathBuf::from("/tmp/cp.json"))).unwrap();
        assert_eq!(config.checkpoint_path, PathBuf::from("/tmp/cp.json"));
    }

    #[test]
    fn test_escalation_policy_conversion() {
        let policy = MidwifeConfig::default().escalation_policy();
        assert_eq!(policy.poll_interval, Duration::from_secs(10));
        assert_eq!(policy.timeout, Duration::from_secs(3600));
    }
}
