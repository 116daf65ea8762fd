//! Simple-queue bandwidth limits, one queue per target address.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use log::info;

use super::{Reconciler, ResourceKind, ResourceRef};
use crate::driver::{Command, Executor, Value};
use crate::error::{Error, Result, ValidationError};
use crate::parser::Record;
use crate::transport::Transport;

const MENU: &str = "/queue simple";

const KILO: u64 = 1_000;
const MEGA: u64 = 1_000_000;
const GIGA: u64 = 1_000_000_000;

/// A rate in bits per second.
///
/// RouterOS unit suffixes are decimal (`k` = 1000), so conversions are
/// exact integer multiplications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Throughput(u64);

impl Throughput {
    pub fn from_bps(bps: u64) -> std::result::Result<Self, ValidationError> {
        if bps == 0 {
            return Err(ValidationError::NotPositive { field: "bandwidth" });
        }
        Ok(Self(bps))
    }

    pub fn from_kbps(kbps: u64) -> std::result::Result<Self, ValidationError> {
        Self::scaled(kbps, KILO)
    }

    pub fn from_mbps(mbps: u64) -> std::result::Result<Self, ValidationError> {
        Self::scaled(mbps, MEGA)
    }

    pub fn bits_per_second(&self) -> u64 {
        self.0
    }

    fn scaled(value: u64, factor: u64) -> std::result::Result<Self, ValidationError> {
        let bps = value
            .checked_mul(factor)
            .ok_or_else(|| ValidationError::Malformed {
                field: "bandwidth",
                value: value.to_string(),
            })?;
        Self::from_bps(bps)
    }
}

/// Renders the shortest exact device form: `10M`, `512k`, `1500`.
impl fmt::Display for Throughput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            bps if bps % GIGA == 0 => write!(f, "{}G", bps / GIGA),
            bps if bps % MEGA == 0 => write!(f, "{}M", bps / MEGA),
            bps if bps % KILO == 0 => write!(f, "{}k", bps / KILO),
            bps => write!(f, "{bps}"),
        }
    }
}

impl FromStr for Throughput {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let malformed = || ValidationError::Malformed {
            field: "bandwidth",
            value: s.to_string(),
        };
        let s = s.trim();
        let (digits, factor) = match s.chars().last() {
            Some('k' | 'K') => (&s[..s.len() - 1], KILO),
            Some('M') => (&s[..s.len() - 1], MEGA),
            Some('G') => (&s[..s.len() - 1], GIGA),
            _ => (s, 1),
        };
        let value: u64 = digits.parse().map_err(|_| malformed())?;
        Self::scaled(value, factor)
    }
}

/// Desired limit for one address. `upload` is traffic from the target,
/// `download` traffic to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub target: Ipv4Addr,
    pub upload: Throughput,
    pub download: Throughput,
}

impl QueueSpec {
    /// Limits given in Mbps.
    pub fn mbps(
        target: Ipv4Addr,
        upload: u64,
        download: u64,
    ) -> std::result::Result<Self, ValidationError> {
        Ok(Self {
            target,
            upload: Throughput::from_mbps(upload)?,
            download: Throughput::from_mbps(download)?,
        })
    }

    /// Limits given in kbps, for rates below one Mbps.
    pub fn kbps(
        target: Ipv4Addr,
        upload: u64,
        download: u64,
    ) -> std::result::Result<Self, ValidationError> {
        Ok(Self {
            target,
            upload: Throughput::from_kbps(upload)?,
            download: Throughput::from_kbps(download)?,
        })
    }

    fn max_limit(&self) -> String {
        format!("{}/{}", self.upload, self.download)
    }
}

/// Typed view of a simple queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthLimitView {
    pub reference: ResourceRef,
    pub name: String,
    pub target: Option<String>,
    pub upload: Option<Throughput>,
    pub download: Option<Throughput>,
    pub enabled: bool,
    pub dynamic: bool,
}

impl BandwidthLimitView {
    pub fn from_record(record: &Record, epoch: u64) -> Option<Self> {
        let name = record.get("name")?.to_string();
        let limits = record.get("max-limit").and_then(|l| l.split_once('/'));
        Some(Self {
            reference: ResourceRef::new(ResourceKind::Queue, name.clone(), epoch),
            target: record.get("target").map(str::to_string),
            // 0 means unlimited on the device
            upload: limits.and_then(|(up, _)| up.parse().ok()),
            download: limits.and_then(|(_, down)| down.parse().ok()),
            enabled: !record.has_flag('X'),
            dynamic: record.has_flag('D'),
            name,
        })
    }
}

/// Reconciler for `/queue simple`.
pub struct QueueReconciler<'a, T> {
    exec: Executor<'a, T>,
    prefix: String,
}

impl<'a, T: Transport> QueueReconciler<'a, T> {
    pub fn new(exec: Executor<'a, T>, prefix: impl Into<String>) -> Self {
        Self {
            exec,
            prefix: prefix.into(),
        }
    }

    /// Queue name for a target address.
    pub fn queue_name(&self, target: Ipv4Addr) -> String {
        format!("{}{target}", self.prefix)
    }

    /// Typed listing of every simple queue.
    pub async fn limits(&self) -> Result<Vec<BandwidthLimitView>> {
        let epoch = self.exec.epoch();
        Ok(self
            .list()
            .await?
            .iter()
            .filter_map(|r| BandwidthLimitView::from_record(r, epoch))
            .collect())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|r| r.get("name") == Some(name)))
    }

    async fn require(&self, target: &ResourceRef) -> Result<Value> {
        self.exec.check_ref(target, Self::KIND)?;
        let name = Value::text("queue name", &target.id, 1, 128)?;
        if !self.exists(&target.id).await? {
            return Err(Error::NotFound {
                kind: Self::KIND,
                id: target.id.clone(),
                message: "no simple queue with this name".into(),
            });
        }
        Ok(name)
    }
}

impl<T: Transport> Reconciler for QueueReconciler<'_, T> {
    type Spec = QueueSpec;
    const KIND: ResourceKind = ResourceKind::Queue;

    async fn list(&self) -> Result<Vec<Record>> {
        let command = Command::builder(MENU, "print")
            .flag("terse")
            .flag("show-ids")
            .build();
        self.exec.list(&command).await
    }

    async fn create(&self, spec: QueueSpec) -> Result<ResourceRef> {
        let name = self.queue_name(spec.target);
        if self.exists(&name).await? {
            return Err(Error::AlreadyExists {
                kind: Self::KIND,
                id: name,
                message: "a queue for this address exists; update or delete it".into(),
            });
        }

        let command = Command::builder(MENU, "add")
            .arg("name", &Value::text("queue name", &name, 1, 128)?)
            .arg("target", &Value::word("target", &format!("{}/32", spec.target))?)
            .arg("max-limit", &Value::word("max-limit", &spec.max_limit())?)
            .build();
        self.exec
            .execute(&command)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &name))?;

        info!("queue {name} limits {} to {}", spec.target, spec.max_limit());
        Ok(ResourceRef::new(Self::KIND, name, self.exec.epoch()))
    }

    async fn update(&self, target: &ResourceRef, spec: QueueSpec) -> Result<()> {
        let name = self.require(target).await?;
        let command = Command::builder(MENU, "set")
            .find("name", &name)
            .arg("max-limit", &Value::word("max-limit", &spec.max_limit())?)
            .build();
        self.exec
            .execute(&command)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &target.id))?;
        info!("queue {} set to {}", target.id, spec.max_limit());
        Ok(())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        let name = self.require(target).await?;
        let command = Command::builder(MENU, "remove").find("name", &name).build();
        self.exec
            .execute(&command)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &target.id))?;
        info!("queue {} removed", target.id);
        Ok(())
    }
}
