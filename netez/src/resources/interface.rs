//! Interface reconciler: list and enable/disable.
//!
//! Interfaces are never created or removed from here. Setting the state
//! an interface already has succeeds.

use log::info;

use super::{Reconciler, ResourceKind, ResourceRef, unsupported};
use crate::driver::{Command, Executor, Value};
use crate::error::{Error, Result};
use crate::parser::Record;
use crate::transport::Transport;

const MENU: &str = "/interface";

/// Desired interface state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSpec {
    pub enabled: bool,
}

/// Typed view of an interface record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceView {
    pub reference: ResourceRef,
    pub name: String,
    pub kind: Option<String>,
    pub enabled: bool,
    pub running: bool,
    pub mtu: Option<String>,
    pub comment: Option<String>,
}

impl InterfaceView {
    /// Build from a record; records without a name are skipped.
    pub fn from_record(record: &Record, epoch: u64) -> Option<Self> {
        let name = record.get("name")?.to_string();
        Some(Self {
            reference: ResourceRef::new(ResourceKind::Interface, name.clone(), epoch),
            kind: record.get("type").map(str::to_string),
            enabled: !record.has_flag('X'),
            running: record.has_flag('R'),
            mtu: record.get("mtu").map(str::to_string),
            comment: record.get("comment").map(str::to_string),
            name,
        })
    }
}

/// Reconciler for `/interface`.
pub struct InterfaceReconciler<'a, T> {
    exec: Executor<'a, T>,
}

impl<'a, T: Transport> InterfaceReconciler<'a, T> {
    pub fn new(exec: Executor<'a, T>) -> Self {
        Self { exec }
    }

    /// Typed listing.
    pub async fn interfaces(&self) -> Result<Vec<InterfaceView>> {
        let epoch = self.exec.epoch();
        Ok(self
            .list()
            .await?
            .iter()
            .filter_map(|r| InterfaceView::from_record(r, epoch))
            .collect())
    }

    /// Enable or disable an interface by name.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let target = ResourceRef::new(ResourceKind::Interface, name, self.exec.epoch());
        self.update(&target, InterfaceSpec { enabled }).await
    }
}

impl<T: Transport> Reconciler for InterfaceReconciler<'_, T> {
    type Spec = InterfaceSpec;
    const KIND: ResourceKind = ResourceKind::Interface;

    async fn list(&self) -> Result<Vec<Record>> {
        let command = Command::builder(MENU, "print")
            .flag("terse")
            .flag("show-ids")
            .build();
        self.exec.list(&command).await
    }

    async fn create(&self, _spec: InterfaceSpec) -> Result<ResourceRef> {
        unsupported(Self::KIND, "create")
    }

    async fn update(&self, target: &ResourceRef, spec: InterfaceSpec) -> Result<()> {
        self.exec.check_ref(target, Self::KIND)?;
        let name = Value::text("interface", &target.id, 1, 64)?;

        let known = self
            .list()
            .await?
            .iter()
            .any(|r| r.get("name") == Some(target.id.as_str()));
        if !known {
            return Err(Error::NotFound {
                kind: Self::KIND,
                id: target.id.clone(),
                message: "no such interface".into(),
            });
        }

        let command = Command::builder(MENU, "set")
            .find("name", &name)
            .arg(
                "disabled",
                &Value::keyword(if spec.enabled { "no" } else { "yes" }),
            )
            .build();
        self.exec
            .execute(&command)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &target.id))?;

        info!(
            "interface {} {}",
            target.id,
            if spec.enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    async fn delete(&self, _target: &ResourceRef) -> Result<()> {
        unsupported(Self::KIND, "delete")
    }
}
