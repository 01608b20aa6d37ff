//! The controller process that sits between the harness and the target
//! program.
//!
//! The controller runs as the command line of the tmux session. It
//! forks the child immediately so its pid can be published, but holds
//! the child on a pipe read until the harness sends the release signal
//! — that way the harness never races against the target's startup
//! output. Lifecycle milestones (its own pid, the child's pid, the
//! child's exit status) go into the report file, the only state the
//! harness can see.
//!
//! Synchronization with the harness is deliberately primitive: the
//! release signal is blocked in the signal mask before the fork, so a
//! signal arriving at any point after the pids are published is queued
//! rather than lost, and a single `sigwait` consumes it. There is no
//! handler and no global flag, and redundant release signals simply
//! stay pending.

use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, fork, pipe, ForkResult, Pid};
use thiserror::Error;

use crate::report::{self, ReportWriter};

/// Reserved exit status for "the controller could not run the target":
/// exec failure, a broken handshake, or a fork that never happened.
pub const COMMAND_FAILED_STATUS: i32 = 111;

/// Signal the harness sends, exactly once, to authorize the exec.
pub const RELEASE_SIGNAL: Signal = Signal::SIGUSR1;

/// The byte written down the release pipe to unblock the child.
const RELEASE_BYTE: u8 = b'1';

/// How long the controller lingers after recording the exit status, so
/// the harness can capture the pane before the session vanishes.
const EXIT_LINGER: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to write report: {0}")]
    Report(#[from] std::io::Error),

    #[error("{0} failed: {1}")]
    Sys(&'static str, #[source] nix::Error),

    #[error("release pipe closed before the release byte arrived")]
    ReleasePipeClosed,

    #[error("no target command given")]
    EmptyCommand,

    #[error("command contains an interior NUL byte")]
    BadCommand(#[from] std::ffi::NulError),
}

/// Validate the report-file argument the way the CLI contract demands:
/// the harness pre-creates the file, so it must be an absolute path to
/// something that already exists.
pub fn validate_report_path(path: &Path) -> Result<(), String> {
    if !path.is_absolute() {
        return Err(format!(
            "report-file must be an absolute path, got {}",
            path.display()
        ));
    }
    if !path.exists() {
        return Err(format!("no such file {}", path.display()));
    }
    Ok(())
}

/// Collapse a wait status into the single integer the report carries:
/// the exit code for a normal exit, `128 + signo` for death by signal.
pub fn encode_wait_status(status: WaitStatus) -> i64 {
    match status {
        WaitStatus::Exited(_, code) => code as i64,
        WaitStatus::Signaled(_, signal, _) => 128 + signal as i64,
        // waitpid without WUNTRACED/WCONTINUED should not produce
        // anything else; report it as a controller failure if it does.
        _ => COMMAND_FAILED_STATUS as i64,
    }
}

/// Run the controller to completion.
///
/// Whatever happens after `Controller-pid` has been recorded, an
/// `Exit-status` field is eventually appended — on internal failure a
/// best-effort `Exit-status: 111` — so the polling harness can never
/// hang forever on a controller that died early.
pub fn run(report_path: &Path, command: &[OsString]) -> Result<(), RunnerError> {
    if command.is_empty() {
        return Err(RunnerError::EmptyCommand);
    }
    let mut reporter = ReportWriter::open(report_path)?;
    reporter.write_field(report::CONTROLLER_PID, Pid::this().as_raw() as i64)?;

    match supervise(&mut reporter, command) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = reporter.write_field(report::EXIT_STATUS, COMMAND_FAILED_STATUS as i64);
            Err(err)
        }
    }
}

fn supervise(reporter: &mut ReportWriter, command: &[OsString]) -> Result<(), RunnerError> {
    // Block the release signal before forking so it can never arrive
    // between pid publication and the sigwait below.
    let mut release = SigSet::empty();
    release.add(RELEASE_SIGNAL);
    release
        .thread_block()
        .map_err(|e| RunnerError::Sys("sigprocmask", e))?;

    let (pipe_read, pipe_write) = pipe().map_err(|e| RunnerError::Sys("pipe", e))?;

    match unsafe { fork() }.map_err(|e| RunnerError::Sys("fork", e))? {
        ForkResult::Child => {
            drop(pipe_write);
            child_branch(pipe_read, &release, command)
        }
        ForkResult::Parent { child } => {
            reporter.write_field(report::CHILD_PID, child.as_raw() as i64)?;
            drop(pipe_read);

            // One-shot wait for the release signal. The harness sends
            // it exactly once; anything redundant stays pending in the
            // blocked mask and is discarded when we exit.
            release.wait().map_err(|e| RunnerError::Sys("sigwait", e))?;
            unistd::write(pipe_write.as_fd(), &[RELEASE_BYTE])
                .map_err(|e| RunnerError::Sys("write", e))?;
            drop(pipe_write);

            let status = waitpid(child, None).map_err(|e| RunnerError::Sys("waitpid", e))?;
            reporter.write_field(report::EXIT_STATUS, encode_wait_status(status))?;

            thread::sleep(EXIT_LINGER);
            Ok(())
        }
    }
}

/// The forked child: wait for the release byte, then become the target.
/// Never returns; any failure before the exec exits with the reserved
/// status so the harness sees a distinguished abnormal exit instead of
/// a hang.
fn child_branch(pipe_read: OwnedFd, release: &SigSet, command: &[OsString]) -> ! {
    match await_release_and_exec(pipe_read, release, command) {
        Ok(never) => match never {},
        Err(err) => {
            eprintln!("coven-runner: {err}");
            process::exit(COMMAND_FAILED_STATUS);
        }
    }
}

fn await_release_and_exec(
    pipe_read: OwnedFd,
    release: &SigSet,
    command: &[OsString],
) -> Result<Infallible, RunnerError> {
    let mut byte = [0u8; 1];
    let n = unistd::read(pipe_read.as_fd(), &mut byte).map_err(|e| RunnerError::Sys("read", e))?;
    if n != 1 || byte[0] != RELEASE_BYTE {
        return Err(RunnerError::ReleasePipeClosed);
    }
    drop(pipe_read);

    // The blocked mask survives exec; don't hand it to the target.
    release
        .thread_unblock()
        .map_err(|e| RunnerError::Sys("sigprocmask", e))?;

    let program = cstring(&command[0])?;
    let args = command.iter().map(cstring).collect::<Result<Vec<_>, _>>()?;
    unistd::execvp(&program, &args).map_err(|e| RunnerError::Sys("execvp", e))?;
    unreachable!("execvp returned without error")
}

fn cstring(arg: &OsString) -> Result<CString, std::ffi::NulError> {
    CString::new(arg.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_path_must_be_absolute() {
        let err = validate_report_path(Path::new("relative/report")).unwrap_err();
        assert!(err.contains("absolute"), "unexpected message: {err}");
    }

    #[test]
    fn test_report_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let err = validate_report_path(&missing).unwrap_err();
        assert!(err.contains("no such file"), "unexpected message: {err}");
    }

    #[test]
    fn test_report_path_accepts_existing_absolute_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report");
        std::fs::write(&path, "").unwrap();
        assert!(validate_report_path(&path).is_ok());
    }

    #[test]
    fn test_encode_normal_exit() {
        assert_eq!(encode_wait_status(WaitStatus::Exited(Pid::from_raw(1), 0)), 0);
        assert_eq!(
            encode_wait_status(WaitStatus::Exited(Pid::from_raw(1), 42)),
            42
        );
    }

    #[test]
    fn test_encode_signal_death() {
        assert_eq!(
            encode_wait_status(WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false)),
            128 + Signal::SIGKILL as i64
        );
    }

    #[test]
    fn test_cstring_rejects_interior_nul() {
        assert!(cstring(&OsString::from("a\0b")).is_err());
    }
}
