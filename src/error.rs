use std::fmt;

use thiserror::Error;

use crate::remote::ExecutionResult;

pub const EXIT_VALIDATION: u8 = 2;
pub const EXIT_CONNECTION: u8 = 3;
pub const EXIT_TRANSFER: u8 = 4;
pub const EXIT_REMOTE_COMMAND: u8 = 5;

// Which remote command failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Probe,
    Invoke,
    // sudo refused to run the entry command
    Escalate,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::Probe => "probe",
            Step::Invoke => "invoke",
            Step::Escalate => "escalate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Validation(String),

    // output: whatever the call printed before it was cut off, if it started
    #[error("connection to {host} failed during {step}: {reason}")]
    Connection {
        host: String,
        step: Step,
        reason: String,
        output: Option<ExecutionResult>,
    },

    #[error("mirror failed ({}): {}", exit_desc(.code), .stderr.trim())]
    Transfer { code: Option<i32>, stderr: String },

    #[error("remote {step} command exited with status {}", .result.exit_code)]
    RemoteCommand { step: Step, result: ExecutionResult },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn category(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Connection { .. } => "connection",
            Error::Transfer { .. } => "transfer",
            Error::RemoteCommand { .. } => "remote command",
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Validation(_) => EXIT_VALIDATION,
            Error::Connection { .. } => EXIT_CONNECTION,
            Error::Transfer { .. } => EXIT_TRANSFER,
            Error::RemoteCommand { .. } => EXIT_REMOTE_COMMAND,
        }
    }
}

fn exit_desc(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("rsync exit code {c}"),
        None => "interrupted".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_exit_codes_distinct() {
        let errs = [
            Error::validation("x"),
            Error::Connection {
                host: "h".into(),
                step: Step::Probe,
                reason: "r".into(),
                output: None,
            },
            Error::Transfer {
                code: Some(23),
                stderr: String::new(),
            },
            Error::RemoteCommand {
                step: Step::Invoke,
                result: ExecutionResult {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: Duration::ZERO,
                },
            },
        ];
        let mut codes: Vec<u8> = errs.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
        assert!(!codes.contains(&0));
        assert!(!codes.contains(&1));
    }

    #[test]
    fn test_transfer_message() {
        let err = Error::Transfer {
            code: None,
            stderr: "killed\n".into(),
        };
        assert_eq!(err.to_string(), "mirror failed (interrupted): killed");
        let err = Error::Transfer {
            code: Some(12),
            stderr: "protocol error".into(),
        };
        assert_eq!(
            err.to_string(),
            "mirror failed (rsync exit code 12): protocol error"
        );
    }

    #[test]
    fn test_connection_message_names_step() {
        let err = Error::Connection {
            host: "gitlab.internal".into(),
            step: Step::Invoke,
            reason: "timed out after 1.0s".into(),
            output: None,
        };
        assert_eq!(
            err.to_string(),
            "connection to gitlab.internal failed during invoke: timed out after 1.0s"
        );
    }
}
