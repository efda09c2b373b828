// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY process runner: spawn agent CLIs in a pseudo-terminal, read their
//! output, and terminate whole process groups.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{self, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;

pub mod io;
pub mod probe;

pub use io::{read_chunk, write_all, MasterFd, READ_CHUNK};

/// How long `terminate` waits between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);
const TERM_POLL: Duration = Duration::from_millis(100);

/// Exit status of a reaped child: either an exit code or a signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A child process attached to a fresh PTY pair. The parent holds the
/// master side; the slave side became the child's stdin/stdout/stderr.
pub struct PtyChild {
    pub master: AsyncFd<MasterFd>,
    pub pid: Pid,
    pub pgid: Pid,
}

impl PtyChild {
    /// Spawn `command` on a new PTY with optional working directory and
    /// environment overlays.
    ///
    /// The child becomes its own session leader (so the whole group can be
    /// signaled as a unit), applies `env` on top of the inherited
    /// environment, changes into `cwd`, and execs. Any child-side failure
    /// exits with status 1 and surfaces through wait semantics.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(
        command: &[String],
        cwd: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!command.is_empty(), "empty command");

        let winsize = Winsize { ws_col: 200, ws_row: 50, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We immediately exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                // Child: forkpty already made us a session leader with the
                // slave as controlling terminal on stdin/stdout/stderr.
                std::env::set_var("TERM", "xterm-256color");
                for (k, v) in env {
                    std::env::set_var(k, v);
                }
                if let Some(dir) = cwd {
                    if nix::unistd::chdir(dir).is_err() {
                        // SAFETY: _exit is async-signal-safe and skips atexit
                        // handlers, which must not run in the forked child.
                        unsafe { nix::libc::_exit(1) }
                    }
                }
                let c_args: Result<Vec<CString>, _> =
                    command.iter().map(|s| CString::new(s.as_bytes())).collect();
                if let Ok(args) = c_args {
                    let _ = execvp(&args[0], &args);
                }
                // SAFETY: as above — exec failed, leave without unwinding.
                unsafe { nix::libc::_exit(1) }
            }
            ForkptyResult::Parent { child, master } => {
                io::set_nonblocking(&master)?;
                let afd = AsyncFd::new(MasterFd(master)).context("AsyncFd::new failed")?;
                let pgid = nix::unistd::getpgid(Some(child)).unwrap_or(child);
                Ok(Self { master: afd, pid: child, pgid })
            }
        }
    }
}

/// Check whether a process with the given PID is still alive (signal 0).
pub fn is_process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Terminate a process group: SIGTERM, wait up to 5 s for the leader to be
/// reaped, then SIGKILL. Never fails; problems are logged.
pub async fn terminate(pid: Pid, pgid: Pid) -> Option<ExitStatus> {
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pgid = pgid.as_raw(), err = %e, "SIGTERM to process group failed");
        }
    }

    let mut deadline = TERM_GRACE.as_millis() / TERM_POLL.as_millis();
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Some(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Some(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => {}
            // Already reaped elsewhere.
            Err(nix::errno::Errno::ECHILD) => return None,
            Err(e) => {
                tracing::warn!(pid = pid.as_raw(), err = %e, "waitpid failed");
                return None;
            }
        }

        if deadline == 0 {
            break;
        }
        deadline -= 1;
        tokio::time::sleep(TERM_POLL).await;
    }

    // Still alive after the grace period.
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            tracing::error!(pgid = pgid.as_raw(), err = %e, "SIGKILL to process group failed");
        }
    } else {
        tracing::warn!(pgid = pgid.as_raw(), "sent SIGKILL after grace period");
    }
    match waitpid(pid, None) {
        Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus { code: Some(code), signal: None }),
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            Some(ExitStatus { code: None, signal: Some(sig as i32) })
        }
        _ => None,
    }
}

/// Non-blocking reap of an exited child, for use after the reader sees EOF.
///
/// `None` means the child was already reaped (treated as a clean exit by
/// callers, matching wait semantics for processes another path collected).
pub fn try_reap(pid: Pid) -> Option<ExitStatus> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus { code: Some(code), signal: None }),
        Ok(WaitStatus::Signaled(_, sig, _)) => {
            Some(ExitStatus { code: None, signal: Some(sig as i32) })
        }
        _ => None,
    }
}

#[cfg(test)]
#[path = "spawn_tests.rs"]
mod tests;
