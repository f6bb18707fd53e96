//! Process lifecycle and interrupt handling
//!
//! Stage bodies shell out to long-running tools (`apt-get`, `ollama pull`,
//! `systemctl`). If midwife is interrupted mid-stage those children must not
//! keep mutating the machine behind our back, so:
//!
//! - children are spawned in their own process group with a parent-death signal
//!   (see [`GuardedCommand`])
//! - their process groups are tracked in the global [`ChildRegistry`] for as
//!   long as a [`TrackedChild`] handle lives
//! - on SIGINT/SIGTERM/SIGHUP every tracked group gets SIGTERM, then SIGKILL
//!   after a grace period, and the process exits with `128 + signal`
//!
//! The exception is the escalation wait: nothing is running then, and the
//! engine wants to abort gracefully. While an [`InterruptDeferral`] is held the
//! signal thread only raises the [`Interrupt`] flag and leaves shutdown to the
//! waiting code.

use std::collections::BTreeMap;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

static CHILD_REGISTRY: OnceLock<Arc<Mutex<ChildRegistry>>> = OnceLock::new();
static INTERRUPT: OnceLock<Interrupt> = OnceLock::new();

/// Grace period between SIGTERM and SIGKILL when a signal arrives mid-stage
const SIGNAL_GRACE: Duration = Duration::from_secs(3);

/// Grace period used by [`ProcessGuard`] on drop
const GUARD_GRACE: Duration = Duration::from_secs(5);

/// Process groups of running stage children, keyed by group leader PID
#[derive(Debug, Default)]
pub struct ChildRegistry {
    groups: BTreeMap<i32, String>,
    reaped: bool,
}

impl ChildRegistry {
    pub fn global() -> Arc<Mutex<ChildRegistry>> {
        CHILD_REGISTRY
            .get_or_init(|| Arc::new(Mutex::new(ChildRegistry::default())))
            .clone()
    }

    pub fn track(&mut self, pid: u32, program: &str) {
        debug!(pid, program, "Tracking child process group");
        self.groups.insert(pid as i32, program.to_string());
    }

    pub fn release(&mut self, pid: u32) {
        if self.groups.remove(&(pid as i32)).is_some() {
            debug!(pid, "Child process group released");
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Terminate every tracked group: SIGTERM, wait up to `grace`, SIGKILL
    /// whatever is left. Only the first call does anything.
    ///
    /// Returns the number of groups that had to be killed.
    pub fn reap(&mut self, grace: Duration) -> usize {
        if std::mem::replace(&mut self.reaped, true) || self.groups.is_empty() {
            return 0;
        }

        let groups = std::mem::take(&mut self.groups);
        for (&leader, program) in &groups {
            info!(pid = leader, program = %program, "Stopping stage child");
            signal_group(leader, Signal::SIGTERM);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if groups.keys().all(|&leader| !is_running(leader)) {
                debug!("Stage children exited after SIGTERM");
                return 0;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        let mut killed = 0;
        for (&leader, program) in &groups {
            if is_running(leader) {
                warn!(pid = leader, program = %program, "Still running after grace period, sending SIGKILL");
                signal_group(leader, Signal::SIGKILL);
                killed += 1;
            }
        }
        killed
    }
}

/// Signal a whole process group so grandchildren (dpkg under apt-get, for
/// example) go too. Falls back to the leader alone if the group is gone.
pub(crate) fn signal_group(leader: i32, signal: Signal) {
    let pid = Pid::from_raw(leader);
    match killpg(pid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(group_err) => {
            if let Err(e) = kill(pid, signal) {
                error!(pid = leader, ?signal, "Failed to signal child ({group_err}, then {e})");
            }
        }
    }
}

/// True while `pid` exists and is neither a zombie nor dead
pub(crate) fn is_running(pid: i32) -> bool {
    if kill(Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => process_state(&stat).is_none_or(|state| !matches!(state, 'Z' | 'X')),
        Err(_) => true,
    }
}

/// State letter from a `/proc/<pid>/stat` line.
///
/// The command name is parenthesized and may itself contain spaces or
/// parentheses, so the state is the first field after the last `)`.
fn process_state(stat: &str) -> Option<char> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.trim_start().chars().next()
}

/// Handle for a tracked child; releases the registry entry on drop.
pub struct TrackedChild {
    pid: u32,
}

impl TrackedChild {
    pub fn track(pid: u32, program: &str) -> Self {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.track(pid, program);
        }
        Self { pid }
    }
}

impl Drop for TrackedChild {
    fn drop(&mut self) {
        if let Ok(mut registry) = ChildRegistry::global().lock() {
            registry.release(self.pid);
        }
    }
}

/// RAII guard that terminates all tracked children on drop.
///
/// Held by `main` for the duration of a pipeline run so a panic or early
/// return never leaves a stage's children running.
pub struct ProcessGuard {
    registry: Arc<Mutex<ChildRegistry>>,
}

impl ProcessGuard {
    pub fn new() -> Self {
        Self {
            registry: ChildRegistry::global(),
        }
    }
}

impl Default for ProcessGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.registry.lock()
            && !registry.is_empty()
        {
            let killed = registry.reap(GUARD_GRACE);
            debug!(killed, "Leftover stage children terminated");
        }
    }
}

/// Cooperative interrupt flag.
///
/// Cloning shares the underlying state. Tests create private instances with
/// [`Interrupt::new`]; the binary uses [`Interrupt::global`], which the signal
/// thread raises.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    raised: Arc<AtomicBool>,
    deferred: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Interrupt {
        INTERRUPT.get_or_init(Interrupt::new).clone()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    /// Ask the signal thread to leave shutdown to the caller until the
    /// returned guard is dropped.
    pub fn defer(&self) -> InterruptDeferral {
        self.deferred.store(true, Ordering::SeqCst);
        InterruptDeferral {
            deferred: Arc::clone(&self.deferred),
        }
    }
}

/// Returned by [`Interrupt::defer`]; restores immediate shutdown on drop.
pub struct InterruptDeferral {
    deferred: Arc<AtomicBool>,
}

impl Drop for InterruptDeferral {
    fn drop(&mut self) {
        self.deferred.store(false, Ordering::SeqCst);
    }
}

/// Start the signal thread for SIGINT, SIGTERM and SIGHUP.
/// Call once at program start.
pub fn init_signal_handlers() -> std::io::Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use signal_hook::low_level::signal_name;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;
    let interrupt = Interrupt::global();

    std::thread::Builder::new()
        .name("midwife-signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                let name = signal_name(sig).unwrap_or("unknown");
                interrupt.raise();
                if interrupt.is_deferred() {
                    info!(signal = name, "Interrupt received while waiting for operator");
                    continue;
                }

                warn!(signal = name, "Interrupt received, abandoning current stage");
                if let Ok(mut registry) = ChildRegistry::global().lock() {
                    registry.reap(SIGNAL_GRACE);
                }
                std::process::exit(128 + sig);
            }
        })?;

    Ok(())
}

/// Spawn configuration shared by every stage child.
pub trait GuardedCommand {
    /// Put the child in a fresh process group and have the kernel send it
    /// SIGTERM if midwife dies first.
    fn guarded(&mut self) -> &mut Self;
}

impl GuardedCommand for Command {
    fn guarded(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;

        self.process_group(0);
        // SAFETY: prctl is async-signal-safe and touches no parent state
        unsafe {
            self.pre_exec(|| {
                // Child dies with us instead of finishing a half-done install alone
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_and_release() {
        let mut registry = ChildRegistry::default();
        registry.track(4242, "apt-get");
        registry.track(4343, "ollama");
        assert_eq!(registry.len(), 2);

        registry.release(4242);
        registry.release(4242);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reap_stops_whole_group() {
        // The shell's own child must die with it
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60 & wait"])
            .guarded()
            .spawn()
            .expect("spawn sh");
        let pid = child.id();

        let mut registry = ChildRegistry::default();
        registry.track(pid, "sh");
        assert!(is_running(pid as i32));

        registry.reap(Duration::from_secs(2));
        let status = child.wait().expect("wait");
        assert!(!status.success());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reap_only_once() {
        let mut registry = ChildRegistry::default();
        registry.track(999_999, "gone");
        assert_eq!(registry.reap(Duration::from_millis(10)), 0);

        registry.track(999_998, "also-gone");
        assert_eq!(registry.reap(Duration::from_millis(10)), 0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_process_state_parsing() {
        assert_eq!(process_state("1234 (sleep) S 1 1234 1234 0"), Some('S'));
        assert_eq!(process_state("77 (my (odd) prog) Z 1 77"), Some('Z'));
        assert_eq!(process_state("garbage"), None);
    }

    #[test]
    fn test_nonexistent_process_is_not_running() {
        assert!(!is_running(999_999));
    }

    #[test]
    fn test_interrupt_is_shared_between_clones() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!clone.is_raised());
        interrupt.raise();
        assert!(clone.is_raised());
    }

    #[test]
    fn test_deferral_resets_on_drop() {
        let interrupt = Interrupt::new();
        {
            let _deferral = interrupt.defer();
            assert!(interrupt.is_deferred());
        }
        assert!(!interrupt.is_deferred());
    }
}
