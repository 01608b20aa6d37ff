//! The report channel: the only cross-process state shared between the
//! harness and the controller.
//!
//! A report is a plain text file of `"<FieldName>: <integer>"` lines.
//! The controller appends fields as lifecycle milestones occur and
//! flushes after every write; the harness polls the file and treats the
//! presence of a key as a monotonic fact. Zero is a valid exit status,
//! so presence-of-key is the only signal — readers never need to
//! distinguish "not yet written" from "written as zero".

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Field recording the controller's own pid, written first.
pub const CONTROLLER_PID: &str = "Controller-pid";
/// Field recording the forked child's pid, written once fork succeeds.
pub const CHILD_PID: &str = "Child-pid";
/// Field recording the child's exit status, written after waitpid.
pub const EXIT_STATUS: &str = "Exit-status";

/// Single-writer handle for appending fields to a report file.
///
/// Each field is written as one line and flushed immediately, so a
/// polling reader observes fields in write order and at worst sees a
/// partially flushed trailing line (which [`Report`] skips).
pub struct ReportWriter {
    file: File,
}

impl ReportWriter {
    /// Open an existing report file for writing. The harness pre-creates
    /// the file; the controller only ever appends to it.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Self { file })
    }

    /// Append one `"<field>: <value>"` line and flush it.
    pub fn write_field(&mut self, field: &str, value: i64) -> io::Result<()> {
        writeln!(self.file, "{field}: {value}")?;
        self.file.flush()
    }
}

/// A point-in-time view of a report file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    fields: HashMap<String, i64>,
}

impl Report {
    /// Read and parse the report file as it currently stands.
    pub fn read(path: &Path) -> io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Parse report contents. A trailing line without a newline may be
    /// mid-flush and is skipped; so is any line that fails to parse,
    /// rather than treating a torn read as fatal.
    pub fn parse(contents: &str) -> Self {
        let mut fields = HashMap::new();
        let mut parts = contents.split('\n').peekable();
        while let Some(line) = parts.next() {
            // The element after the final '\n' is "" for a complete
            // file; anything else is an unterminated partial line.
            if parts.peek().is_none() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if let Ok(value) = value.trim().parse::<i64>() {
                fields.insert(name.to_string(), value);
            }
        }
        Self { fields }
    }

    /// Look up a field by name.
    pub fn get(&self, field: &str) -> Option<i64> {
        self.fields.get(field).copied()
    }

    pub fn controller_pid(&self) -> Option<i64> {
        self.get(CONTROLLER_PID)
    }

    pub fn child_pid(&self) -> Option<i64> {
        self.get(CHILD_PID)
    }

    pub fn exit_status(&self) -> Option<i64> {
        self.get(EXIT_STATUS)
    }
}
