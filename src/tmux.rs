//! Thin wrapper around the tmux CLI.
//!
//! Every harness owns a private tmux server, isolated by socket name
//! (`tmux -L <socket>`), so tests never touch the user's sessions. All
//! operations are synchronous invocations of the tmux binary; tmux does
//! the actual terminal emulation, keystroke delivery, and screen
//! rendering.
//!
//! Failures split into two classes: [`TmuxError::CommandFailed`] for an
//! invocation tmux rejected, and [`TmuxError::DeadServer`] for a server
//! that has already gone away — the latter is expected late in a
//! harness's life (e.g. capturing a screen after the session's command
//! exited) and callers treat it as non-fatal.

use std::io::Write;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TmuxError {
    #[error("failed to invoke tmux: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("tmux i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("tmux server is gone: {0}")]
    DeadServer(String),
}

/// Resolve the tmux binary, honoring the `COVEN_TMUX_BINARY` override.
fn tmux_binary() -> String {
    std::env::var("COVEN_TMUX_BINARY").unwrap_or_else(|_| "tmux".to_string())
}

/// stderr patterns tmux emits when the target server no longer exists.
fn looks_dead(output: &str) -> bool {
    ["no server running", "error connecting to", "server exited unexpectedly"]
        .iter()
        .any(|pattern| output.contains(pattern))
}

/// Split `-F` formatted list output into names, one per line.
fn parse_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Handle to one isolated tmux server.
pub struct Tmux {
    socket: String,
}

impl Tmux {
    pub fn new(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Run one tmux command against this server and return its stdout.
    pub fn execute(&self, args: &[&str]) -> Result<String, TmuxError> {
        self.execute_with_stdin(args, None)
    }

    fn execute_with_stdin(
        &self,
        args: &[&str],
        stdin_data: Option<&[u8]>,
    ) -> Result<String, TmuxError> {
        debug!(socket = %self.socket, ?args, "tmux");
        let mut command = Command::new(tmux_binary());
        command
            .arg("-u")
            .arg("-L")
            .arg(&self.socket)
            .args(args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(TmuxError::Spawn)?;
        if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
            stdin.write_all(data)?;
            // Dropping stdin closes the pipe so tmux sees EOF.
        }
        let output = child.wait_with_output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stdout));
            let text = text.trim().to_string();
            if looks_dead(&text) {
                Err(TmuxError::DeadServer(text))
            } else {
                Err(TmuxError::CommandFailed(text))
            }
        }
    }

    /// Create a detached session of the given size running `command`
    /// (a single shell command string).
    pub fn new_session(
        &self,
        name: &str,
        width: u16,
        height: u16,
        command: &str,
    ) -> Result<(), TmuxError> {
        self.execute(&[
            "new-session",
            "-d",
            "-x",
            &width.to_string(),
            "-y",
            &height.to_string(),
            "-s",
            name,
            command,
        ])?;
        Ok(())
    }

    pub fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.execute(&["kill-session", "-t", name])?;
        Ok(())
    }

    pub fn sessions(&self) -> Result<Vec<String>, TmuxError> {
        Ok(parse_names(&self.execute(&[
            "list-sessions",
            "-F",
            "#{session_name}",
        ])?))
    }

    pub fn windows(&self) -> Result<Vec<String>, TmuxError> {
        Ok(parse_names(&self.execute(&[
            "list-windows",
            "-F",
            "#{window_name}",
        ])?))
    }

    pub fn panes(&self) -> Result<Vec<String>, TmuxError> {
        Ok(parse_names(&self.execute(&[
            "list-panes",
            "-F",
            "#{pane_id}",
        ])?))
    }

    /// Send one literal key (tmux key syntax, e.g. `Enter`, `C-d`, `a`)
    /// to the pane.
    pub fn send_key(&self, target: &str, key: &str) -> Result<(), TmuxError> {
        self.execute(&["send-keys", "-t", target, key])?;
        Ok(())
    }

    /// Load arbitrary bytes into the server's paste buffer via stdin.
    pub fn load_buffer(&self, data: &[u8]) -> Result<(), TmuxError> {
        self.execute_with_stdin(&["load-buffer", "-"], Some(data))?;
        Ok(())
    }

    /// Paste the most recent buffer into the pane.
    pub fn paste_buffer(&self, target: &str) -> Result<(), TmuxError> {
        self.execute(&["paste-buffer", "-t", target])?;
        Ok(())
    }

    /// Capture the pane's current visible contents as text.
    pub fn capture_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.execute(&["capture-pane", "-p", "-t", target])
    }

    /// Tear down the whole server. Errors are swallowed: the common
    /// case is a server that already exited with its last session.
    pub fn kill_server(&self) {
        if let Err(err) = self.execute(&["kill-server"]) {
            debug!(socket = %self.socket, %err, "kill-server (ignored)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_server_patterns() {
        assert!(looks_dead("no server running on /tmp/tmux-1000/x"));
        assert!(looks_dead("error connecting to /tmp/tmux-1000/x (No such file or directory)"));
        assert!(looks_dead("server exited unexpectedly"));
    }

    #[test]
    fn test_ordinary_failures_are_not_dead_server() {
        assert!(!looks_dead("can't find session: missing"));
        assert!(!looks_dead("unknown command: frobnicate"));
    }

    #[test]
    fn test_parse_names_skips_blank_lines() {
        assert_eq!(
            parse_names("coven\n\n  other  \n"),
            vec!["coven".to_string(), "other".to_string()]
        );
        assert!(parse_names("").is_empty());
    }

    #[test]
    fn test_execute_against_missing_server_is_dead_server() {
        // A freshly named socket has no server behind it, so any
        // query command fails with the dead-server class.
        let tmux = Tmux::new("coven-test-no-such-server");
        match tmux.sessions() {
            Err(TmuxError::DeadServer(_)) => {}
            other => panic!("expected DeadServer, got {other:?}"),
        }
    }
}
