//! Result type for command execution.

use std::time::Duration;

use crate::parser::{self, Record};
use crate::transport::ExecOutput;

/// Outcome of one executed command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// The command that was executed (redacted if it carried a secret).
    pub command: String,

    /// Exit status, if the device reported one.
    pub exit_status: Option<u32>,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time taken.
    pub elapsed: Duration,
}

impl CommandResult {
    /// Build a result from raw exec output.
    pub fn new(command: impl Into<String>, output: ExecOutput, elapsed: Duration) -> Self {
        Self {
            command: command.into(),
            exit_status: output.exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed,
        }
    }

    /// Parse stdout as terse output.
    pub fn records(&self) -> Vec<Record> {
        parser::parse(&self.stdout)
    }

    /// Get the stdout lines as an iterator.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_from_output() {
        let output = ExecOutput {
            exit_status: Some(0),
            stdout: b"0 name=ether1\n1 X name=ether2\n".to_vec(),
            stderr: Vec::new(),
        };
        let result = CommandResult::new("/interface print terse", output, Duration::from_millis(5));
        assert_eq!(result.records().len(), 2);
        assert_eq!(result.lines().count(), 2);
        assert!(result.stderr.is_empty());
    }
}
