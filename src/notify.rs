//! Operator notifications.
//!
//! The remote channel is best effort: a sink that returns false or panics is
//! logged and otherwise ignored. Every notice is also mirrored to the local
//! console so the pipeline stays operable with the relay unreachable.

use std::fmt;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

use crate::checkpoint::{ErrorRecord, Phase, StageId};
use crate::command::run_with_deadline;
use crate::config::NotifySettings;

/// Remote notification capability.
pub trait NotificationSink: Send {
    /// Deliver `text`. Returns false if delivery failed.
    fn send(&self, text: &str) -> bool;
}

/// Runs a relay client with the message as its final argument.
#[derive(Debug, Clone)]
pub struct CommandSink {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl NotificationSink for CommandSink {
    fn send(&self, text: &str) -> bool {
        let mut args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        args.push(text);
        match run_with_deadline(&self.program, &args, self.timeout) {
            Ok(Some(status)) => status.success(),
            Ok(None) => false,
            Err(e) => {
                debug!("Notification command failed: {e:#}");
                false
            }
        }
    }
}

/// Writes one JSON line per message to a relay daemon's Unix socket.
#[derive(Debug, Clone)]
pub struct SocketSink {
    pub path: PathBuf,
    pub timeout: Duration,
}

impl SocketSink {
    fn deliver(&self, text: &str) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(&self.path)?;
        stream.set_write_timeout(Some(self.timeout))?;
        let mut line = serde_json::json!({ "source": "midwife", "text": text }).to_string();
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        stream.flush()
    }
}

impl NotificationSink for SocketSink {
    fn send(&self, text: &str) -> bool {
        match self.deliver(text) {
            Ok(()) => true,
            Err(e) => {
                debug!(path = %self.path.display(), "Relay socket delivery failed: {e}");
                false
            }
        }
    }
}

/// Pipeline events the operator hears about.
#[derive(Debug, Clone)]
pub enum Notice {
    Started {
        total: usize,
    },
    Resumed {
        completed: usize,
        total: usize,
        progress: u8,
    },
    StageFailed {
        record: ErrorRecord,
        hints: Vec<String>,
    },
    AwaitingOperator {
        stage: StageId,
        poll_interval: Duration,
        timeout: Duration,
    },
    Resolved {
        stage: StageId,
        phase: Phase,
    },
    EscalationTimedOut {
        stage: StageId,
        waited: Duration,
    },
    Completed {
        executed: usize,
        total: usize,
    },
    /// The walk ended with catalog entries still outstanding (started past them)
    Pending {
        executed: usize,
        pending: Vec<StageId>,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Started { total } => {
                write!(f, "🚀 Provisioning started ({} stages)", total)
            }
            Notice::Resumed {
                completed,
                total,
                progress,
            } => write!(
                f,
                "🔁 Provisioning resumed: {}/{} stages done ({}%)",
                completed, total, progress
            ),
            Notice::StageFailed { record, hints } => {
                write!(
                    f,
                    "✗ Stage '{}' failed ({}): {}",
                    record.stage,
                    if record.recoverable {
                        "recoverable"
                    } else {
                        "needs manual repair"
                    },
                    record.message
                )?;
                if let Some(detail) = &record.detail {
                    write!(f, "\n  detail: {}", detail)?;
                }
                if !hints.is_empty() {
                    write!(f, "\n  To unblock, run one of:")?;
                    for hint in hints {
                        write!(f, "\n    {}", hint)?;
                    }
                }
                Ok(())
            }
            Notice::AwaitingOperator {
                stage,
                poll_interval,
                timeout,
            } => write!(
                f,
                "⏳ Waiting for operator on '{}' (checking every {}s, giving up after {}s)",
                stage,
                poll_interval.as_secs(),
                timeout.as_secs()
            ),
            Notice::Resolved { stage, phase } => write!(
                f,
                "✓ Operator resolved '{}' (checkpoint now at '{}'), resuming",
                stage, phase
            ),
            Notice::EscalationTimedOut { stage, waited } => write!(
                f,
                "✗ Nobody resolved '{}' within {}s, aborting",
                stage,
                waited.as_secs()
            ),
            Notice::Completed { executed, total } => write!(
                f,
                "✓ Provisioning complete: {} of {} stages ran this session",
                executed, total
            ),
            Notice::Pending { executed, pending } => {
                let names: Vec<&str> = pending.iter().map(|id| id.as_ref()).collect();
                write!(
                    f,
                    "⚠ Provisioning stopped after {} stage(s); still pending: {} (run `midwife run` to finish)",
                    executed,
                    names.join(", ")
                )
            }
        }
    }
}

/// Intervention commands an operator can issue for a failed stage.
pub fn remediation_hints(record: &ErrorRecord) -> Vec<String> {
    let stage = record.stage;
    let mut hints = Vec::new();
    if record.recoverable {
        hints.push("midwife intervene retry                  # run the stage again".to_string());
        hints.push(format!(
            "midwife intervene skip {:<16} # continue without it",
            stage
        ));
        hints.push(format!(
            "midwife intervene complete {:<12} # after fixing it by hand",
            stage
        ));
    } else {
        hints.push("midwife intervene attach                 # hold the pipeline while you work".to_string());
        hints.push(format!(
            "midwife intervene complete {:<12} # after fixing it by hand",
            stage
        ));
        hints.push("midwife intervene retry                  # once the cause is repaired".to_string());
    }
    hints
}

/// Fans notices out to the console and the optional remote sink.
pub struct Notifier {
    sink: Option<Box<dyn NotificationSink>>,
    console: bool,
}

impl Notifier {
    pub fn new(sink: Option<Box<dyn NotificationSink>>) -> Self {
        Self {
            sink,
            console: true,
        }
    }

    /// Console mirror only
    pub fn console_only() -> Self {
        Self::new(None)
    }

    /// Build from configuration. `remote_enabled = false` keeps only the console.
    pub fn from_settings(settings: &NotifySettings, remote_enabled: bool) -> Self {
        if !remote_enabled {
            return Self::console_only();
        }
        let sink: Option<Box<dyn NotificationSink>> = match settings {
            NotifySettings::None => None,
            NotifySettings::Command {
                program,
                args,
                timeout_secs,
            } => Some(Box::new(CommandSink {
                program: program.clone(),
                args: args.clone(),
                timeout: Duration::from_secs(*timeout_secs),
            })),
            NotifySettings::Socket { path, timeout_secs } => Some(Box::new(SocketSink {
                path: path.clone(),
                timeout: Duration::from_secs(*timeout_secs),
            })),
        };
        Self::new(sink)
    }

    /// Disable the console mirror (tests)
    pub fn without_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Deliver a notice. Never fails and never panics.
    pub fn notify(&self, notice: &Notice) {
        let text = notice.to_string();
        if self.console {
            println!("[midwife] {}", text);
        }

        let Some(sink) = &self.sink else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| sink.send(&text))) {
            Ok(true) => debug!("Notification delivered"),
            Ok(false) => warn!("Notification sink rejected message, continuing"),
            Err(_) => warn!("Notification sink panicked, continuing"),
        }
    }
}
