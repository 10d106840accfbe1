/// Bounded execution of external commands.
/// The child runs in its own process group so a timeout can kill everything
/// it spawned, not just the direct child.
use crate::config::types::{LabError, Result};
use crate::utils::output::{CollectedOutput, OutputCollector, OutputLimits};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Outcome of one bounded run
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Exited {
        code: i32,
        output: CollectedOutput,
        elapsed: Duration,
    },
    TimedOut {
        output: CollectedOutput,
        elapsed: Duration,
    },
}

impl RunOutcome {
    pub fn output(&self) -> &CollectedOutput {
        match self {
            RunOutcome::Exited { output, .. } | RunOutcome::TimedOut { output, .. } => output,
        }
    }

    /// Exit code, with 124 standing in for a timeout
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited { code, .. } => *code,
            RunOutcome::TimedOut { .. } => 124,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, RunOutcome::Exited { code: 0, .. })
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, RunOutcome::TimedOut { .. })
    }
}

/// Shell-style exit code: the status code, or 128 + signal
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

/// Spawn `cmd` in a fresh process group and wait at most `timeout`.
///
/// Stdin is closed, stdout/stderr are captured up to `limits`. On timeout the
/// whole group receives SIGKILL and is reaped before returning.
pub fn run_bounded(mut cmd: Command, timeout: Duration, limits: OutputLimits) -> Result<RunOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| LabError::Process(format!("Failed to start process: {}", e)))?;
    let pending = OutputCollector::new(limits).start(&mut child);
    let pgid = Pid::from_raw(child.id() as i32);

    match wait_exited(pgid, timeout) {
        Ok(true) => {
            // The unreaped leader still holds the group id; kill stragglers
            // that keep the pipes open, then reap.
            let _ = killpg(pgid, Signal::SIGKILL);
            let status = child
                .wait()
                .map_err(|e| LabError::Process(format!("wait failed: {}", e)))?;
            Ok(RunOutcome::Exited {
                code: exit_code_of(status),
                output: pending.finish(),
                elapsed: start.elapsed(),
            })
        }
        Ok(false) => {
            log::warn!("Process group {} exceeded {:?}, killing", pgid, timeout);
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait();
            Ok(RunOutcome::TimedOut {
                output: pending.finish(),
                elapsed: start.elapsed(),
            })
        }
        Err(e) => {
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait();
            Err(e)
        }
    }
}

/// Wait up to `timeout` for child `pid` to exit, leaving it unreaped.
///
/// Until the caller reaps it, the zombie keeps `pid` reserved, so signalling
/// its process group cannot reach a recycled group.
pub fn wait_exited(pid: Pid, timeout: Duration) -> Result<bool> {
    let deadline = Instant::now() + timeout;
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    loop {
        match waitid(Id::Pid(pid), flags) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(_) => return Ok(true),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(LabError::Process(format!("wait failed: {}", e))),
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(EXIT_POLL);
    }
}
