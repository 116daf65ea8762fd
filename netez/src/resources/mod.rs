//! Resource reconcilers.
//!
//! Each reconciler translates a desired state for one kind of device
//! object into command sequences and reports observed state as parsed
//! [`Record`]s. All of them share the [`Reconciler`] shape; the facade
//! picks one by [`ResourceKind`].

pub mod address;
pub mod firewall;
pub mod interface;
pub mod queue;
pub mod wireless;

use std::fmt;
use std::future::Future;

use log::warn;

pub use address::{AddressReconciler, AddressSpec, AddressView, prefix_from_mask};
pub use firewall::{BlockSpec, BlockView, FirewallReconciler};
pub use interface::{InterfaceReconciler, InterfaceSpec, InterfaceView};
pub use queue::{BandwidthLimitView, QueueReconciler, QueueSpec, Throughput};
pub use wireless::{WirelessReconciler, WirelessSpec, WirelessView};

use crate::driver::{Command, CommandResult, Executor};
use crate::error::{Error, PartialSuccess, Result};
use crate::parser::Record;
use crate::transport::Transport;

/// The kinds of device objects this crate manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Interface,
    Address,
    Block,
    Queue,
    Wireless,
    Backup,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Interface => "interface",
            ResourceKind::Address => "address",
            ResourceKind::Block => "block",
            ResourceKind::Queue => "queue",
            ResourceKind::Wireless => "wireless interface",
            ResourceKind::Backup => "backup",
        };
        f.write_str(s)
    }
}

/// Handle to one device object, valid only in the session epoch it was
/// obtained in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// Kind of object.
    pub kind: ResourceKind,

    /// Device-side identifier (internal id or name, depending on kind).
    pub id: String,

    /// Session epoch the identifier was obtained in.
    pub epoch: u64,
}

impl ResourceRef {
    /// Create a reference.
    pub fn new(kind: ResourceKind, id: impl Into<String>, epoch: u64) -> Self {
        Self {
            kind,
            id: id.into(),
            epoch,
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.kind, self.id, self.epoch)
    }
}

/// Uniform shape of every reconciler.
pub trait Reconciler {
    /// Desired state accepted by create/update.
    type Spec;

    /// Kind handled by this reconciler.
    const KIND: ResourceKind;

    /// Observed state, one record per object.
    fn list(&self) -> impl Future<Output = Result<Vec<Record>>> + Send;

    /// Create an object.
    fn create(&self, spec: Self::Spec) -> impl Future<Output = Result<ResourceRef>> + Send;

    /// Change an existing object.
    fn update(
        &self,
        target: &ResourceRef,
        spec: Self::Spec,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove an object.
    fn delete(&self, target: &ResourceRef) -> impl Future<Output = Result<()>> + Send;
}

/// Tracks the steps of a multi-step operation. A step failing after
/// earlier ones landed becomes `PartialSuccess`; nothing is rolled back.
pub(crate) struct StepLog {
    operation: String,
    committed: Vec<String>,
}

impl StepLog {
    pub(crate) fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            committed: Vec::new(),
        }
    }

    /// Run one step.
    pub(crate) async fn run<T: Transport>(
        &mut self,
        exec: &Executor<'_, T>,
        label: &str,
        command: &Command,
    ) -> Result<CommandResult> {
        match exec.execute(command).await {
            Ok(result) => {
                self.commit(label);
                Ok(result)
            }
            Err(e) => Err(self.fail(label, e)),
        }
    }

    /// Mark a step as applied.
    pub(crate) fn commit(&mut self, label: &str) {
        self.committed.push(label.to_string());
    }

    /// Record a failed step. With nothing committed yet the bare error
    /// is returned.
    pub(crate) fn fail(&self, label: &str, cause: Error) -> Error {
        if self.committed.is_empty() {
            return cause;
        }
        warn!(
            "{}: step '{}' failed after [{}] were applied",
            self.operation,
            label,
            self.committed.join(", ")
        );
        Error::PartialSuccess(Box::new(PartialSuccess {
            operation: self.operation.clone(),
            committed: self.committed.clone(),
            failed_step: label.to_string(),
            cause: Box::new(cause),
        }))
    }

    /// Steps applied so far.
    pub(crate) fn committed(&self) -> &[String] {
        &self.committed
    }
}

/// Error for operations a kind does not offer.
pub(crate) fn unsupported<R>(kind: ResourceKind, operation: &'static str) -> Result<R> {
    Err(Error::Unsupported { kind, operation })
}
