//! The harness: drives a target program inside an isolated tmux session
//! and exposes polling primitives to assert on its behavior.
//!
//! Construction starts a private tmux server whose one session runs the
//! controller (`coven-runner`); the controller forks the target and
//! holds it until [`Harness::start`] sends the release signal. From
//! there the harness is purely an observer: every `await_*` primitive
//! re-reads the report file or re-captures the pane in a bounded poll
//! loop — there is no push notification anywhere, and no wait is
//! unbounded.
//!
//! A harness must be shut down on every exit path. The supported
//! pattern is [`Harness::with`], which guarantees it; dropping a
//! harness without shutting it down is a programming error that is
//! surfaced as a loud warning and repaired best-effort.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::report::Report;
use crate::runner;
use crate::tmux::{Tmux, TmuxError};

/// Name of the single session every harness runs.
const SESSION_NAME: &str = "coven";

/// Kill escalation schedule: three terminate requests with widening
/// grace periods, then the hammer.
const KILL_ESCALATION: [Duration; 3] = [
    Duration::from_millis(10),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

#[derive(Error, Debug)]
pub enum HarnessError {
    /// A poll deadline elapsed without the predicate holding.
    /// Recoverable; the caller decides whether it is fatal.
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// The target terminated with a non-zero status.
    #[error("process exited with status {0}")]
    AbnormalExit(i64),

    /// An operation was invoked in a state that forbids it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::Error),

    #[error(transparent)]
    Tmux(#[from] TmuxError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Harness construction options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Terminal width in columns.
    pub width: u16,
    /// Terminal height in rows.
    pub height: u16,
    /// Sleep between poll iterations in every `await_*` operation.
    pub poll_interval: Duration,
    /// Deadline applied when an `await_*` caller passes no timeout,
    /// and to the readiness wait during construction.
    pub default_timeout: Duration,
    /// Path to the `coven-runner` binary.
    pub runner_program: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
            poll_interval: Duration::from_millis(10),
            default_timeout: Duration::from_secs(1),
            runner_program: default_runner_program(),
        }
    }
}

/// Resolve the controller binary: `$COVEN_RUNNER` wins, otherwise look
/// next to the current executable (popping a trailing `deps/` so test
/// binaries find their sibling bin target).
fn default_runner_program() -> PathBuf {
    if let Some(path) = std::env::var_os("COVEN_RUNNER") {
        return path.into();
    }
    let mut dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_default();
    if dir.file_name().is_some_and(|name| name == "deps") {
        dir.pop();
    }
    dir.join("coven-runner")
}

/// Quote one word for the session's shell command line.
fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "-_./=:%+,@^".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Session exists; pids not yet observed in the report.
    AwaitingReady,
    /// Both pids observed; target still held pre-exec.
    Ready,
    /// Release signal sent; target is executing.
    Running,
    /// Exit status observed in the report.
    Exited,
    /// Terminal; all external resources torn down.
    ShutDown,
}

/// A running test session. One harness owns one tmux server, one
/// controller, and one target process; nothing is shared.
pub struct Harness {
    tmux: Tmux,
    options: Options,
    report_file: PathBuf,
    state: State,
    started: bool,
    controller_pid: Option<Pid>,
    child_pid: Option<Pid>,
    last_screenshot: String,
}

impl Harness {
    /// Start a session running `command` and wait until the controller
    /// has forked the target (both pids visible in the report). The
    /// target itself is still held; call [`start`](Self::start) to
    /// release it, or use [`spawn`](Self::spawn).
    ///
    /// On any failure the partially created server is torn down before
    /// the error propagates.
    pub fn new<S: AsRef<str>>(command: &[S], options: Options) -> Result<Self, HarnessError> {
        if command.is_empty() {
            return Err(HarnessError::InvalidState("empty target command".into()));
        }

        let socket_id = format!("{:016x}", rand::random::<u64>());
        let comms_dir = std::env::temp_dir().join("coven_comms");
        std::fs::create_dir_all(&comms_dir)?;
        let report_file = comms_dir.join(&socket_id);
        std::fs::File::create(&report_file)?;

        let mut words = vec![
            options.runner_program.display().to_string(),
            report_file.display().to_string(),
        ];
        words.extend(command.iter().map(|word| word.as_ref().to_string()));
        let command_line = words
            .iter()
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ");

        info!(socket = %socket_id, command = %command_line, "starting session");

        let mut harness = Self {
            tmux: Tmux::new(socket_id),
            options,
            report_file,
            state: State::AwaitingReady,
            started: false,
            controller_pid: None,
            child_pid: None,
            last_screenshot: String::new(),
        };

        match harness.initialize(&command_line) {
            Ok(()) => Ok(harness),
            Err(err) => {
                harness.teardown_session();
                harness.state = State::ShutDown;
                Err(err)
            }
        }
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub fn spawn<S: AsRef<str>>(command: &[S], options: Options) -> Result<Self, HarnessError> {
        let mut harness = Self::new(command, options)?;
        harness.start()?;
        Ok(harness)
    }

    /// Scoped harness: spawn, run `f`, and shut down on every exit
    /// path. An error from `f` wins over a shutdown error.
    pub fn with<T, S: AsRef<str>>(
        command: &[S],
        options: Options,
        f: impl FnOnce(&mut Harness) -> Result<T, HarnessError>,
    ) -> Result<T, HarnessError> {
        let mut harness = Self::spawn(command, options)?;
        let result = f(&mut harness);
        let shutdown_result = harness.shutdown();
        match result {
            Ok(value) => shutdown_result.map(|()| value),
            Err(err) => Err(err),
        }
    }

    fn initialize(&mut self, command_line: &str) -> Result<(), HarnessError> {
        self.tmux.new_session(
            SESSION_NAME,
            self.options.width,
            self.options.height,
            command_line,
        )?;

        // A fresh socket shouldn't carry anything else; sweep strays
        // so the topology check below means what it says.
        for session in self.tmux.sessions()? {
            if session != SESSION_NAME {
                warn!(session = %session, "killing stray session");
                self.tmux.kill_session(&session)?;
            }
        }

        let windows = self.tmux.windows()?;
        if windows.len() != 1 {
            return Err(HarnessError::InvalidState(format!(
                "expected exactly one window, found {}",
                windows.len()
            )));
        }
        let panes = self.tmux.panes()?;
        if panes.len() != 1 {
            return Err(HarnessError::InvalidState(format!(
                "expected exactly one pane, found {}",
                panes.len()
            )));
        }

        self.screenshot()?;
        self.await_ready()
    }

    /// Poll the report until the controller has published both pids.
    fn await_ready(&mut self) -> Result<(), HarnessError> {
        let timeout = self.options.default_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let report = Report::read(&self.report_file)?;
            if let (Some(controller), Some(child)) = (report.controller_pid(), report.child_pid())
            {
                self.controller_pid = Some(Pid::from_raw(controller as i32));
                self.child_pid = Some(Pid::from_raw(child as i32));
                self.state = State::Ready;
                self.screenshot()?;
                debug!(controller, child, "target forked and held");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout {
                    what: "process to start".into(),
                    timeout,
                });
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Release the held target: sends the release signal to the
    /// controller, exactly once.
    pub fn start(&mut self) -> Result<(), HarnessError> {
        if self.state != State::Ready {
            return Err(HarnessError::InvalidState(format!(
                "start() called in state {:?}",
                self.state
            )));
        }
        // Ready implies both pids were observed.
        let controller = self.controller_pid.ok_or_else(|| {
            HarnessError::InvalidState("controller pid unknown in Ready state".into())
        })?;
        signal::kill(controller, runner::RELEASE_SIGNAL)?;
        self.started = true;
        self.state = State::Running;
        info!(controller = controller.as_raw(), "target released");
        Ok(())
    }

    /// Send one literal key (tmux key syntax: `Enter`, `C-d`, `a`...)
    /// to the pane. Delivery order relative to [`write`](Self::write)
    /// is preserved by the pty, even before the target is released.
    pub fn press(&self, key: &str) -> Result<(), HarnessError> {
        self.ensure_live()?;
        self.tmux.send_key(SESSION_NAME, key)?;
        Ok(())
    }

    /// Type arbitrary text (including unicode) into the pane via the
    /// paste buffer, so nothing is interpreted as key names.
    pub fn write(&self, text: &str) -> Result<(), HarnessError> {
        self.ensure_live()?;
        self.tmux.load_buffer(text.as_bytes())?;
        self.tmux.paste_buffer(SESSION_NAME)?;
        Ok(())
    }

    /// Capture the pane's current contents. Once the server is gone
    /// (the session's command exited and took the server with it) the
    /// last successful capture is returned instead, so late inspection
    /// is never fatal.
    pub fn screenshot(&mut self) -> Result<String, HarnessError> {
        match self.tmux.capture_pane(SESSION_NAME) {
            Ok(screen) => {
                self.last_screenshot = screen.clone();
                Ok(screen)
            }
            Err(TmuxError::DeadServer(_)) => Ok(self.last_screenshot.clone()),
            Err(err) => Err(err.into()),
        }
    }

    /// Poll until `text` appears on screen. The capture is flattened
    /// (hard line breaks removed) before the substring test, because
    /// the terminal may wrap the text across display lines that do not
    /// correspond to logical breaks.
    ///
    /// A match does not imply the target is still running afterwards;
    /// text match and exit can interleave in either order.
    pub fn await_text(&mut self, text: &str, timeout: Option<Duration>) -> Result<(), HarnessError> {
        self.ensure_live()?;
        let timeout = timeout.unwrap_or(self.options.default_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let screen = self.screenshot()?;
            if screen.replace('\n', "").contains(text) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout {
                    what: format!("text {text:?} to appear"),
                    timeout,
                });
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Poll until the target's exit status appears in the report.
    /// Zero is silent success; anything else is [`HarnessError::AbnormalExit`]
    /// carrying the status.
    pub fn await_exit(&mut self, timeout: Option<Duration>) -> Result<(), HarnessError> {
        self.ensure_live()?;
        let timeout = timeout.unwrap_or(self.options.default_timeout);
        let deadline = Instant::now() + timeout;
        loop {
            let report = Report::read(&self.report_file)?;
            if let Some(status) = report.exit_status() {
                self.state = State::Exited;
                // Grab the final screen while the controller lingers.
                let _ = self.screenshot();
                debug!(status, "target exited");
                if status != 0 {
                    return Err(HarnessError::AbnormalExit(status));
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = self.screenshot();
                return Err(HarnessError::Timeout {
                    what: "process to exit".into(),
                    timeout,
                });
            }
            thread::sleep(self.options.poll_interval);
        }
    }

    /// Send an arbitrary signal directly to the target, independent of
    /// any polling state.
    pub fn kill(&self, signal: Signal) -> Result<(), HarnessError> {
        self.ensure_live()?;
        let child = self
            .child_pid
            .ok_or_else(|| HarnessError::InvalidState("target pid not yet known".into()))?;
        signal::kill(child, signal)?;
        Ok(())
    }

    /// Tear everything down. Idempotent: a second call is `Ok(())`.
    ///
    /// If the exit status has not been observed yet, one bounded wait
    /// for it happens first; its timeout is swallowed but an abnormal
    /// exit found on the way out is reported after cleanup completes.
    /// Individual kill failures (process already gone) never abort the
    /// rest of shutdown.
    pub fn shutdown(&mut self) -> Result<(), HarnessError> {
        if self.state == State::ShutDown {
            return Ok(());
        }

        let mut abnormal = None;
        if self.state == State::Running {
            match self.await_exit(None) {
                Ok(()) => {}
                Err(HarnessError::Timeout { .. }) => {}
                Err(HarnessError::AbnormalExit(status)) => abnormal = Some(status),
                Err(err) => warn!(%err, "ignoring error while awaiting exit during shutdown"),
            }
        }
        debug!(screen = %self.last_screenshot, "final screen");

        for pid in [self.child_pid, self.controller_pid].into_iter().flatten() {
            must_die(pid);
        }
        self.teardown_session();

        let was_started = self.started;
        self.state = State::ShutDown;

        if let Some(status) = abnormal {
            return Err(HarnessError::AbnormalExit(status));
        }
        if !was_started {
            return Err(HarnessError::InvalidState(
                "shutdown() called on a harness that was never started".into(),
            ));
        }
        Ok(())
    }

    fn teardown_session(&mut self) {
        self.tmux.kill_server();
        if let Err(err) = std::fs::remove_file(&self.report_file) {
            debug!(%err, "report file removal failed (ignored)");
        }
    }

    fn ensure_live(&self) -> Result<(), HarnessError> {
        if self.state == State::ShutDown {
            return Err(HarnessError::InvalidState(
                "harness has been shut down".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.state != State::ShutDown {
            warn!(
                "Harness dropped without shutdown(); cleaning up best-effort — \
                 call shutdown() or use Harness::with"
            );
            if let Err(err) = self.shutdown() {
                warn!(%err, "error during drop-triggered shutdown");
            }
        }
    }
}

/// Graduated termination: terminate-request with escalating grace
/// periods, then kill. A pid that is already gone ends the escalation
/// immediately.
fn must_die(pid: Pid) {
    for delay in KILL_ESCALATION {
        if signal::kill(pid, Signal::SIGTERM).is_err() {
            return;
        }
        thread::sleep(delay);
    }
    let _ = signal::kill(pid, Signal::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain_word_unchanged() {
        assert_eq!(shell_quote("cat"), "cat");
        assert_eq!(shell_quote("/usr/bin/vim"), "/usr/bin/vim");
    }

    #[test]
    fn test_shell_quote_wraps_specials() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("a;b"), "'a;b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn test_default_options() {
        let options = Options::default();
        assert_eq!(options.width, 80);
        assert_eq!(options.height, 24);
        assert_eq!(options.poll_interval, Duration::from_millis(10));
        assert_eq!(options.default_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_runner_program_resolves_to_a_path() {
        // Either the env override or the sibling-of-executable default;
        // both end in the binary name.
        let program = default_runner_program();
        assert!(program.to_string_lossy().contains("coven-runner"));
    }
}
