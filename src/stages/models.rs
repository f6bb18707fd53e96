//! Local model weights via `ollama`
//!
//! `ollama pull` resumes partial downloads, and models already listed by
//! `ollama list` are not pulled again.

use tracing::info;

use crate::checkpoint::{Checkpoint, ProvisionFacts, StageId};
use crate::command::{binary_exists, run_command};
use crate::config::ModelSettings;
use crate::stage::{Stage, StageOutcome};

pub struct ModelsStage {
    names: Vec<String>,
    ollama: String,
}

impl ModelsStage {
    pub fn new(settings: &ModelSettings) -> Self {
        Self {
            names: settings.names.clone(),
            ollama: settings.ollama_bin.clone(),
        }
    }

    fn installed(&self) -> anyhow::Result<Vec<String>> {
        let output = run_command(&self.ollama, &["list"], &[])?;
        output.ensure_success("ollama list")?;
        Ok(parse_model_list(&output.stdout))
    }

    fn missing_from(&self, installed: &[String]) -> Vec<String> {
        self.names
            .iter()
            .filter(|name| !model_present(installed, name))
            .cloned()
            .collect()
    }
}

impl Stage for ModelsStage {
    fn id(&self) -> StageId {
        StageId::Models
    }

    fn check(&self, _checkpoint: &Checkpoint) -> bool {
        match self.installed() {
            Ok(installed) => !self.missing_from(&installed).is_empty(),
            Err(_) => !self.names.is_empty(),
        }
    }

    fn run(&self, _checkpoint: &Checkpoint) -> StageOutcome {
        if self.names.is_empty() {
            return StageOutcome::skipped("No models configured");
        }
        if !binary_exists(&self.ollama) {
            return StageOutcome::failed(format!("{} is not installed", self.ollama))
                .with_detail("install the ollama runtime, then retry this stage")
                .non_recoverable();
        }

        // Usually the daemon is still starting up
        let installed = match self.installed() {
            Ok(installed) => installed,
            Err(e) => return StageOutcome::from_error(&e.context("Cannot query installed models")),
        };

        let missing = self.missing_from(&installed);
        let facts = ProvisionFacts {
            models: self.names.clone(),
            ..Default::default()
        };
        if missing.is_empty() {
            return StageOutcome::skipped("All models already present").with_facts(facts);
        }

        for name in &missing {
            info!(model = %name, "Pulling model");
            let result = run_command(&self.ollama, &["pull", name.as_str()], &[])
                .and_then(|output| output.ensure_success("ollama pull"));
            if let Err(e) = result {
                return StageOutcome::from_error(&e.context(format!("Model pull failed: {}", name)));
            }
        }
        StageOutcome::success(format!("Pulled {}", missing.join(", "))).with_facts(facts)
    }

    fn verify(&self, _checkpoint: &Checkpoint) -> bool {
        self.installed()
            .map(|installed| self.missing_from(&installed).is_empty())
            .unwrap_or(false)
    }
}

/// Model names from `ollama list` (first column, header skipped).
pub fn parse_model_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("NAME"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Untagged names match the `latest` tag, as `ollama pull` does.
pub fn model_present(installed: &[String], wanted: &str) -> bool {
    let wanted_tagged = if wanted.contains(':') {
        wanted.to_string()
    } else {
        format!("{}:latest", wanted)
    };
    installed.iter().any(|name| *name == wanted || *name == wanted_tagged)
}
