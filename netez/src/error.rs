//! Error types for netez.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::resources::ResourceKind;

/// Main error type for netez operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Input rejected before any command was sent.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// No open session.
    #[error("Not connected - call connect() first")]
    NotConnected,

    /// A session is already open on this manager.
    #[error("Already connected to {host}:{port}")]
    AlreadyConnected { host: String, port: u16 },

    /// The device refused the credentials.
    #[error("Authentication rejected for user '{user}'")]
    AuthenticationRejected { user: String },

    /// TCP connection could not be established.
    #[error("Host {host}:{port} unreachable: {source}")]
    Unreachable {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Connect or command exceeded its bounded wait.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// SSH handshake, host key or protocol failure while connecting.
    #[error("SSH protocol error: {message}")]
    Protocol { message: String },

    /// The transport broke during an operation.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The session was closed while the command was in flight.
    #[error("Session closed")]
    SessionClosed,

    /// The device executed the command but reported an error.
    #[error("Command rejected: {message} (command: {command})")]
    CommandRejected { command: String, message: String },

    /// Create against a name that already exists on the device.
    #[error("{kind} '{id}' already exists: {message}")]
    AlreadyExists {
        kind: ResourceKind,
        id: String,
        message: String,
    },

    /// The reference no longer resolves on the device.
    #[error("{kind} '{id}' not found: {message}")]
    NotFound {
        kind: ResourceKind,
        id: String,
        message: String,
    },

    /// The reference was obtained in a different session epoch.
    #[error("{kind} '{id}' belongs to session epoch {found}, current epoch is {current}")]
    StaleReference {
        kind: ResourceKind,
        id: String,
        found: u64,
        current: u64,
    },

    /// Backup file did not show up in the file listing in time.
    #[error("Backup '{name}' not present after {attempts} checks")]
    BackupTimeout { name: String, attempts: u32 },

    /// A file transfer completed but carried no data.
    #[error("Transfer of '{path}' returned no data")]
    EmptyTransfer { path: String },

    /// Writing a transferred file locally failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    /// A multi-step operation failed after earlier steps were applied.
    #[error("{0}")]
    PartialSuccess(Box<PartialSuccess>),

    /// Operation not offered by a resource kind.
    #[error("{operation} is not supported for {kind}")]
    Unsupported {
        kind: ResourceKind,
        operation: &'static str,
    },

    /// Secondary index read/write failure.
    #[error("Index error: {0}")]
    Index(#[from] IndexError),
}

impl Error {
    /// Whether the session must be re-established before retrying.
    pub fn requires_reconnect(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Timeout(_) | Error::SessionClosed => true,
            Error::PartialSuccess(partial) => partial.cause.requires_reconnect(),
            _ => false,
        }
    }

    /// Classified cause for a failed connect attempt.
    pub fn failure_cause(&self) -> Option<FailureCause> {
        match self {
            Error::AuthenticationRejected { .. } => Some(FailureCause::AuthenticationRejected),
            Error::Unreachable { .. } => Some(FailureCause::Unreachable),
            Error::Timeout(_) => Some(FailureCause::Timeout),
            Error::Protocol { .. } | Error::Transport { .. } => Some(FailureCause::ProtocolError),
            _ => None,
        }
    }

    /// The device's literal diagnostic text, when the device produced one.
    pub fn device_message(&self) -> Option<&str> {
        match self {
            Error::CommandRejected { message, .. }
            | Error::AlreadyExists { message, .. }
            | Error::NotFound { message, .. } => Some(message),
            Error::PartialSuccess(partial) => partial.cause.device_message(),
            _ => None,
        }
    }

    pub(crate) fn transport(message: impl fmt::Display) -> Self {
        Error::Transport {
            message: message.to_string(),
        }
    }
}

/// Why a connect attempt ended in the `Failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    AuthenticationRejected,
    Unreachable,
    Timeout,
    ProtocolError,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCause::AuthenticationRejected => "authentication rejected",
            FailureCause::Unreachable => "unreachable",
            FailureCause::Timeout => "timeout",
            FailureCause::ProtocolError => "protocol error",
        };
        f.write_str(s)
    }
}

/// Outcome of a multi-step operation that stopped part way.
///
/// Steps listed in `committed` are live on the device; nothing is rolled
/// back.
#[derive(Debug)]
pub struct PartialSuccess {
    /// Name of the whole operation (e.g. `block example.com`).
    pub operation: String,

    /// Labels of the steps that were applied, in order.
    pub committed: Vec<String>,

    /// Label of the step that failed.
    pub failed_step: String,

    /// Why the failed step failed.
    pub cause: Box<Error>,
}

impl fmt::Display for PartialSuccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} partially applied: committed [{}], step '{}' failed: {}",
            self.operation,
            self.committed.join(", "),
            self.failed_step,
            self.cause
        )
    }
}

/// Input validation errors. Secret values are never echoed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} '{value}' contains characters that are not allowed")]
    IllegalCharacters { field: &'static str, value: String },

    #[error("{field} contains characters that are not allowed")]
    IllegalSecret { field: &'static str },

    #[error("{field} must be between {min} and {max} characters")]
    Length {
        field: &'static str,
        min: usize,
        max: usize,
    },

    #[error("'{value}' is not a valid domain name")]
    Domain { value: String },

    #[error("'{value}' is not a valid IPv4 address")]
    Address { value: String },

    #[error("prefix length {0} is out of range (0-32)")]
    PrefixLength(u8),

    #[error("'{value}' is not a contiguous subnet mask")]
    SubnetMask { value: String },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("'{value}' is not a valid {field}")]
    Malformed { field: &'static str, value: String },

    #[error("nothing to change: {0}")]
    NothingToApply(&'static str),
}

/// Secondary index errors.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using netez's Error.
pub type Result<T> = std::result::Result<T, Error>;
