use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::checkpoint::StageId;
use crate::intervention::Intervention;

/// midwife - brings a freshly imaged machine to a working assistant host
#[derive(Parser)]
#[command(name = "midwife")]
#[command(about = "Resumable, checkpointed provisioning pipeline")]
#[command(version)]
pub struct Cli {
    /// Path to configuration file (JSON). Defaults to $MIDWIFE_CONFIG, then built-in defaults.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) the provisioning pipeline
    Run {
        /// Discard any existing checkpoint and start from scratch
        #[arg(long)]
        fresh: bool,

        /// Start at this stage instead of the first one
        #[arg(long, value_name = "STAGE")]
        from: Option<StageId>,

        /// Only print notifications locally; don't contact the relay
        #[arg(long)]
        no_notify: bool,
    },
    /// List pipeline stages in execution order
    List,
    /// Show the persisted checkpoint
    Status {
        /// Also run each stage's verification against the live system
        #[arg(long)]
        verify: bool,
    },
    /// Delete the checkpoint (next run starts from scratch)
    Reset,
    /// Operator actions that unblock a waiting pipeline
    Intervene {
        #[command(subcommand)]
        action: InterveneCommands,
    },
}

#[derive(Subcommand)]
pub enum InterveneCommands {
    /// Run the failed stage again
    Retry,
    /// Mark a stage as done without running it and continue
    Skip {
        stage: StageId,
    },
    /// Mark a stage as done after fixing it by hand
    Complete {
        stage: StageId,
    },
    /// Hold the pipeline while you work on the machine
    Attach,
    /// Release the hold without resolving the failure
    Detach,
    /// Record a fact for later stages
    Set {
        key: String,
        value: String,
    },
}

impl From<InterveneCommands> for Intervention {
    fn from(action: InterveneCommands) -> Self {
        match action {
            InterveneCommands::Retry => Intervention::Retry,
            InterveneCommands::Skip { stage } => Intervention::Skip(stage),
            InterveneCommands::Complete { stage } => Intervention::Complete(stage),
            InterveneCommands::Attach => Intervention::Attach,
            InterveneCommands::Detach => Intervention::Detach,
            InterveneCommands::Set { key, value } => Intervention::SetFact { key, value },
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["midwife"]).is_err());
    }

    #[test]
    fn test_cli_run_flags() {
        let cli = Cli::try_parse_from(["midwife", "run", "--fresh", "--from", "models", "--no-notify"])
            .unwrap();
        match cli.command {
            Commands::Run {
                fresh,
                from,
                no_notify,
            } => {
                assert!(fresh);
                assert_eq!(from, Some(StageId::Models));
                assert!(no_notify);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_stage() {
        assert!(Cli::try_parse_from(["midwife", "run", "--from", "bogus"]).is_err());
        assert!(Cli::try_parse_from(["midwife", "intervene", "skip", "bogus"]).is_err());
    }

    #[test]
    fn test_cli_global_config() {
        let cli = Cli::try_parse_from(["midwife", "status", "--config", "/etc/midwife.json"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/midwife.json")));
        assert!(matches!(cli.command, Commands::Status { verify: false }));
    }

    #[test]
    fn test_cli_intervene_maps_to_intervention() {
        let cli = Cli::try_parse_from(["midwife", "intervene", "complete", "packages"]).unwrap();
        let Commands::Intervene { action } = cli.command else {
            panic!("Expected Intervene command");
        };
        assert_eq!(
            Intervention::from(action),
            Intervention::Complete(StageId::Packages)
        );

        let cli = Cli::try_parse_from(["midwife", "intervene", "set", "apt_mirror", "http://m"])
            .unwrap();
        let Commands::Intervene { action } = cli.command else {
            panic!("Expected Intervene command");
        };
        assert_eq!(
            Intervention::from(action),
            Intervention::SetFact {
                key: "apt_mirror".into(),
                value: "http://m".into()
            }
        );
    }
}
