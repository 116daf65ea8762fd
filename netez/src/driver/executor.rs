//! Single-command execution over an open session.

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};

use super::command::Command;
use super::result::CommandResult;
use super::session::Session;
use crate::error::{Error, Result};
use crate::parser::{self, Record};
use crate::platform::DeviceProfile;
use crate::resources::{ResourceKind, ResourceRef};
use crate::transport::{FileStat, Transport};

/// Runs commands on a borrowed session.
///
/// There is no retry: a command that timed out or lost its channel may or
/// may not have been applied, and re-sending an `add` could apply it twice.
pub struct Executor<'a, T> {
    session: &'a Session<T>,
    profile: &'a DeviceProfile,
    timeout: Duration,
    transfer_timeout: Duration,
}

impl<T> Clone for Executor<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Executor<'_, T> {}

impl<'a, T: Transport> Executor<'a, T> {
    /// Create an executor.
    pub fn new(session: &'a Session<T>, profile: &'a DeviceProfile, timeout: Duration) -> Self {
        Self {
            session,
            profile,
            timeout,
            transfer_timeout: timeout,
        }
    }

    /// Set the bound used for file transfers.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    /// Epoch of the session this executor runs on.
    pub fn epoch(&self) -> u64 {
        self.session.epoch()
    }

    /// The device profile used for failure detection.
    pub fn profile(&self) -> &DeviceProfile {
        self.profile
    }

    /// Execute one command.
    ///
    /// Non-empty stderr, a non-zero exit status, or a failure marker on
    /// stdout all yield `CommandRejected` with the device's text.
    pub async fn execute(&self, command: &Command) -> Result<CommandResult> {
        let result = self.run(command).await?;
        let stdout = result.stdout.trim();
        self.classify(&result, stdout)?;
        Ok(result)
    }

    /// Execute a `print terse` style command and parse its output.
    ///
    /// Failure markers are only looked for on lines that are not records,
    /// so a comment or SSID quoting device error text does not fail the
    /// listing.
    pub async fn list(&self, command: &Command) -> Result<Vec<Record>> {
        let result = self.run(command).await?;
        let stray: Vec<&str> = result
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty() && parser::parse_line(line).is_none())
            .map(str::trim)
            .collect();
        self.classify(&result, &stray.join("\n"))?;
        Ok(result.records())
    }

    async fn run(&self, command: &Command) -> Result<CommandResult> {
        let epoch = self.session.epoch();
        debug!("[epoch {epoch}] exec: {command}");

        let start = Instant::now();
        let output = self
            .guarded(self.session.transport().exec(command.line()), self.timeout)
            .await?;
        let result = CommandResult::new(command.to_string(), output, start.elapsed());

        debug!(
            "[epoch {epoch}] done in {:?}: exit={:?} stdout={}B stderr={}B",
            result.elapsed,
            result.exit_status,
            result.stdout.len(),
            result.stderr.len()
        );
        Ok(result)
    }

    /// List a directory on the device's file store.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        debug!("[epoch {}] list files: {path}", self.epoch());
        self.guarded(self.session.transport().list_dir(path), self.timeout)
            .await
    }

    /// Fetch a file from the device's file store.
    pub async fn read_file(&self, path: &str) -> Result<Bytes> {
        debug!("[epoch {}] fetch file: {path}", self.epoch());
        self.guarded(
            self.session.transport().read_file(path),
            self.transfer_timeout,
        )
        .await
    }

    /// Attributes of a file on the device's file store.
    pub async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        self.guarded(self.session.transport().stat(path), self.timeout)
            .await
    }

    /// Fail closed on references obtained in another session epoch.
    pub fn check_ref(&self, target: &ResourceRef, kind: ResourceKind) -> Result<()> {
        if target.kind != kind {
            return Err(Error::NotFound {
                kind,
                id: target.id.clone(),
                message: format!("reference is a {}", target.kind),
            });
        }
        if target.epoch != self.epoch() {
            return Err(Error::StaleReference {
                kind,
                id: target.id.clone(),
                found: target.epoch,
                current: self.epoch(),
            });
        }
        Ok(())
    }

    /// Turn a rejection into `NotFound`/`AlreadyExists` when the device
    /// text says so.
    pub fn refine(&self, err: Error, kind: ResourceKind, id: &str) -> Error {
        match err {
            Error::CommandRejected { message, .. } if self.profile.is_not_found(&message) => {
                Error::NotFound {
                    kind,
                    id: id.to_string(),
                    message,
                }
            }
            Error::CommandRejected { message, .. } if self.profile.is_exists(&message) => {
                Error::AlreadyExists {
                    kind,
                    id: id.to_string(),
                    message,
                }
            }
            other => other,
        }
    }

    /// Run a transport future bounded by a timeout and by the session
    /// staying open.
    async fn guarded<R>(
        &self,
        op: impl Future<Output = Result<R>>,
        timeout: Duration,
    ) -> Result<R> {
        let epoch = self.session.epoch();
        let mut state = self.session.state_receiver();
        let closed = async move {
            // A dropped manager counts as closed too
            let _ = state.wait_for(|s| !s.is_connected_at(epoch)).await;
        };

        tokio::select! {
            biased;
            _ = closed => Err(Error::SessionClosed),
            outcome = tokio::time::timeout(timeout, op) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    warn!("[epoch {epoch}] no response within {timeout:?}; session presumed desynchronized");
                    Err(Error::Timeout(timeout))
                }
            },
        }
    }

    /// `scanned` is the part of stdout checked for failure markers.
    fn classify(&self, result: &CommandResult, scanned: &str) -> Result<()> {
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            return Err(Error::CommandRejected {
                command: result.command.clone(),
                message: stderr.to_string(),
            });
        }

        let stdout = result.stdout.trim();
        if let Some(code) = result.exit_status.filter(|code| *code != 0) {
            let message = if stdout.is_empty() {
                format!("exit status {code}")
            } else {
                stdout.to_string()
            };
            return Err(Error::CommandRejected {
                command: result.command.clone(),
                message,
            });
        }

        if self.profile.detect_failure(scanned).is_some() {
            return Err(Error::CommandRejected {
                command: result.command.clone(),
                message: scanned.to_string(),
            });
        }

        Ok(())
    }
}
