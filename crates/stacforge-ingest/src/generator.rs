//! Item generators backed by external programs

use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::framework::types::{ItemGenerator, Record};

/// Runs `<program> <args..> <identifier>` once per item and reads one JSON
/// record from its stdout. Every call gets its own process.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a command line on whitespace, e.g. `"python -m cryoforge.generate"`
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| IngestError::config("generator command is empty"))?;
        Ok(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ItemGenerator for CommandGenerator {
    fn generate(&self, identifier: &str) -> Result<Record> {
        debug!(program = %self.program, identifier, "Running generator");

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(identifier)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                IngestError::item_generation(identifier, format!("cannot run {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            return Err(IngestError::item_generation(
                identifier,
                format!("{} exited with {}: {}", self.program, output.status, last_line.trim()),
            ));
        }

        let document = serde_json::from_slice(&output.stdout).map_err(|e| {
            IngestError::item_generation(identifier, format!("invalid JSON on stdout: {}", e))
        })?;

        Record::from_value(document).map_err(|e| IngestError::item_generation(identifier, e))
    }
}
