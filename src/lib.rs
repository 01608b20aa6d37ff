//! coven - a tmux-backed test harness for interactive terminal
//! applications.
//!
//! Launch a target program inside an isolated tmux server, feed it
//! keystrokes and text, and assert on the rendered screen:
//!
//! ```no_run
//! use coven::{Harness, Options};
//!
//! # fn main() -> Result<(), coven::HarnessError> {
//! Harness::with(&["cat"], Options::default(), |h| {
//!     h.write("hi")?;
//!     h.press("Enter")?;
//!     h.await_text("hi", None)?;
//!     h.press("C-d")?;
//!     h.await_exit(None)
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! The target is spawned indirectly: the tmux session runs the
//! `coven-runner` controller, which forks the target and holds it on a
//! pipe until the harness sends the release signal. That handshake —
//! and the report file the controller writes milestones into — is what
//! lets three unrelated processes agree on spawn, release, and exit
//! without sharing memory. See [`runner`] for the protocol and
//! [`harness`] for the polling engine built on top of it.

pub mod harness;
pub mod report;
pub mod runner;
pub mod tmux;

pub use harness::{Harness, HarnessError, Options};
pub use tmux::{Tmux, TmuxError};

/// Re-exported so callers of [`Harness::kill`] don't need a direct
/// `nix` dependency.
pub use nix::sys::signal::Signal;
