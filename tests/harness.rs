//! End-to-end harness scenarios. These drive real programs inside a
//! real (isolated) tmux server and are skipped when tmux is not on the
//! PATH.

use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use coven::{Harness, HarnessError, Options, Signal};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn tmux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Harness options for tests: the runner binary Cargo just built, and a
/// timeout generous enough for loaded CI machines.
fn options() -> Options {
    Options {
        runner_program: PathBuf::from(env!("CARGO_BIN_EXE_coven-runner")),
        default_timeout: Duration::from_secs(5),
        ..Options::default()
    }
}

macro_rules! require_tmux {
    () => {
        init_tracing();
        if !tmux_available() {
            eprintln!("skipping: tmux not found on PATH");
            return Ok(());
        }
    };
}

#[test]
fn test_can_launch_a_simple_program() -> anyhow::Result<()> {
    require_tmux!();
    let dir = tempfile::tempdir()?;
    let out = dir.path().join("out");
    let script = format!("echo hello world > {}", out.display());

    Harness::with(&["bash", "-c", script.as_str()], options(), |h| {
        h.await_exit(None)
    })?;

    assert!(std::fs::read_to_string(&out)?.contains("hello world"));
    Ok(())
}

#[test]
fn test_can_send_enter() -> anyhow::Result<()> {
    require_tmux!();
    let screen = Harness::with(&["cat"], options(), |h| {
        h.write("hi")?;
        h.press("Enter")?;
        h.write("there")?;
        h.await_text("there", None)?;
        let screen = h.screenshot()?;
        h.press("C-d")?;
        h.await_exit(None)?;
        Ok(screen)
    })?;
    assert!(screen.contains("hi\nthere"), "screen was:\n{screen}");
    Ok(())
}

#[test]
fn test_can_write_unicode() -> anyhow::Result<()> {
    require_tmux!();
    Harness::with(&["cat"], options(), |h| {
        h.write("☃")?;
        h.await_text("☃", None)?;
        h.press("C-d")?;
        h.await_exit(None)
    })?;
    Ok(())
}

#[test]
fn test_can_send_eof() -> anyhow::Result<()> {
    require_tmux!();
    Harness::with(&["cat"], options(), |h| {
        h.press("C-d")?;
        h.await_exit(None)
    })?;
    Ok(())
}

#[test]
fn test_reports_abnormal_exit() -> anyhow::Result<()> {
    require_tmux!();
    let err = Harness::with(
        &["cat", "/does/not/exist/no/really"],
        options(),
        |_h| -> Result<(), HarnessError> { Ok(()) },
    )
    .unwrap_err();
    assert!(
        matches!(err, HarnessError::AbnormalExit(status) if status != 0),
        "expected AbnormalExit, got {err:?}"
    );
    Ok(())
}

#[test]
fn test_nonexistent_program_culminates_in_abnormal_exit() -> anyhow::Result<()> {
    require_tmux!();
    // Exec failure in the held child surfaces as the reserved status
    // rather than an indefinite hang.
    let err = Harness::with(
        &["/no/such/program/really"],
        options(),
        |h| h.await_exit(None),
    )
    .unwrap_err();
    assert!(
        matches!(err, HarnessError::AbnormalExit(111)),
        "expected AbnormalExit(111), got {err:?}"
    );
    Ok(())
}

#[test]
fn test_sets_the_console_size_appropriately() -> anyhow::Result<()> {
    require_tmux!();
    let options = Options {
        width: 10,
        height: 100,
        ..options()
    };
    let screen = Harness::with(&["cat"], options, |h| {
        h.write(&".".repeat(100))?;
        h.press("Enter")?;
        h.write("Squirrel")?;
        h.await_text("Squirrel", None)?;
        let screen = h.screenshot()?;
        h.press("Enter")?;
        h.press("C-d")?;
        h.await_exit(None)?;
        Ok(screen)
    })?;
    let wrapped = format!("{}\n{}", ".".repeat(10), ".".repeat(10));
    assert!(screen.contains(&wrapped), "screen was:\n{screen}");
    Ok(())
}

#[test]
fn test_await_text_matches_across_wrapped_lines() -> anyhow::Result<()> {
    require_tmux!();
    // At width 10 the text is rendered across a display-line boundary;
    // the flattened match must still succeed.
    let options = Options {
        width: 10,
        height: 24,
        ..options()
    };
    Harness::with(&["cat"], options, |h| {
        h.write("abcdefghijklmno")?;
        h.await_text("abcdefghijklmno", None)?;
        h.press("Enter")?;
        h.press("C-d")?;
        h.await_exit(None)
    })?;
    Ok(())
}

#[test]
fn test_input_before_release_is_not_lost() -> anyhow::Result<()> {
    require_tmux!();
    // Keystrokes sent while the target is still held by the controller
    // are buffered by the pty and delivered once it starts reading.
    let mut h = Harness::new(&["cat"], options())?;
    h.write("hi")?;
    h.press("Enter")?;
    h.start()?;
    h.await_text("hi", None)?;
    h.press("C-d")?;
    h.await_exit(None)?;
    h.shutdown()?;
    Ok(())
}

#[test]
fn test_shutdown_twice_is_a_no_op() -> anyhow::Result<()> {
    require_tmux!();
    let mut h = Harness::spawn(&["sh", "-c", "exit 0"], options())?;
    h.shutdown()?;
    h.shutdown()?;
    Ok(())
}

#[test]
fn test_start_twice_is_invalid_state() -> anyhow::Result<()> {
    require_tmux!();
    let mut h = Harness::spawn(&["cat"], options())?;
    let err = h.start().unwrap_err();
    assert!(matches!(err, HarnessError::InvalidState(_)));
    h.press("C-d")?;
    h.await_exit(None)?;
    h.shutdown()?;
    Ok(())
}

#[test]
fn test_await_text_times_out() -> anyhow::Result<()> {
    require_tmux!();
    Harness::with(&["cat"], options(), |h| {
        let err = h
            .await_text("never appears", Some(Duration::from_millis(200)))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Timeout { .. }));
        h.press("C-d")?;
        h.await_exit(None)
    })?;
    Ok(())
}

#[test]
fn test_kill_delivers_signal_to_target() -> anyhow::Result<()> {
    require_tmux!();
    let err = Harness::with(&["cat"], options(), |h| {
        h.kill(Signal::SIGTERM)?;
        h.await_exit(None)
    })
    .unwrap_err();
    assert!(
        matches!(err, HarnessError::AbnormalExit(status) if status == 128 + Signal::SIGTERM as i64),
        "expected signal-death status, got {err:?}"
    );
    Ok(())
}

#[test]
fn test_screenshot_survives_server_teardown() -> anyhow::Result<()> {
    require_tmux!();
    let mut h = Harness::spawn(&["sh", "-c", "echo marker; sleep 0.1"], options())?;
    h.await_text("marker", None)?;
    h.await_exit(None)?;
    h.shutdown()?;
    // The server is gone; the cached capture stands in.
    let screen = h.screenshot()?;
    assert!(screen.contains("marker"), "screen was:\n{screen}");
    Ok(())
}
