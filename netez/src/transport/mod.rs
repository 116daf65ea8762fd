//! SSH transport layer wrapping russh.
//!
//! A [`Transport`] is one authenticated connection to the device. It runs
//! single commands on exec channels and reaches the device's file store
//! through an SFTP sub-channel of the same connection. A [`Connector`]
//! produces transports; the connection manager only ever talks to these
//! two traits, which is also where tests plug in a scripted device.

pub mod config;
mod ssh;

use std::future::Future;

use bytes::Bytes;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use ssh::{SshConnector, SshTransport};

use crate::error::Result;

/// Raw outcome of one exec channel.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit status, if the device reported one.
    pub exit_status: Option<u32>,

    /// Bytes received on the data stream.
    pub stdout: Vec<u8>,

    /// Bytes received on the extended (stderr) stream.
    pub stderr: Vec<u8>,
}

/// Attributes of a remote file, as far as the device reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub size: Option<u64>,

    /// Modification time, seconds since the epoch.
    pub modified: Option<u32>,
}

/// An open, authenticated connection to one device.
pub trait Transport: Send + Sync + 'static {
    /// Run one command and collect its output.
    fn exec(&self, command: &str) -> impl Future<Output = Result<ExecOutput>> + Send;

    /// List file names in a directory over the file-transfer sub-channel.
    fn list_dir(&self, path: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Read a whole remote file over the file-transfer sub-channel.
    fn read_file(&self, path: &str) -> impl Future<Output = Result<Bytes>> + Send;

    /// Attributes of a remote file; `None` if it does not exist.
    fn stat(&self, path: &str) -> impl Future<Output = Result<Option<FileStat>>> + Send;

    /// Whether the underlying connection is still up.
    fn is_alive(&self) -> bool;

    /// Close the connection, releasing all resources.
    fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// Opens transports.
pub trait Connector: Send + Sync + 'static {
    /// Transport produced by this connector.
    type Transport: Transport;

    /// Connect and authenticate.
    fn connect(&self, config: &SshConfig) -> impl Future<Output = Result<Self::Transport>> + Send;
}
