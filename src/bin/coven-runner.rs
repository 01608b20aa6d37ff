//! coven-runner - the controller process.
//!
//! Runs as the command line of the harness's tmux session: forks the
//! target, reports pids and exit status into the report file, and holds
//! the target until the harness sends the release signal. See
//! `coven::runner` for the protocol.

use clap::error::ErrorKind;
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process;

/// Controller process for the coven harness.
///
/// Usage: coven-runner <report-file> <command> [args...]
#[derive(Parser, Debug)]
#[command(name = "coven-runner", version, about)]
struct Cli {
    /// Absolute path to the report file (pre-created by the harness)
    report_file: PathBuf,

    /// Target command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<OsString>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if err.kind() == ErrorKind::DisplayHelp || err.kind() == ErrorKind::DisplayVersion => {
            err.exit()
        }
        Err(err) => {
            // Missing arguments are a usage error with exit code 1,
            // not clap's default 2.
            eprintln!("{err}");
            process::exit(1);
        }
    };

    if let Err(message) = coven::runner::validate_report_path(&cli.report_file) {
        eprintln!("coven-runner: {message}");
        process::exit(1);
    }

    if let Err(err) = coven::runner::run(&cli.report_file, &cli.command) {
        eprintln!("coven-runner: {err}");
        process::exit(1);
    }
}
