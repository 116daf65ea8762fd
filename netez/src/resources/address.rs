//! IPv4 address reconciler.

use std::net::Ipv4Addr;

use log::{debug, info};

use super::{Reconciler, ResourceKind, ResourceRef, StepLog};
use crate::driver::{Command, Executor, ItemId, Value};
use crate::error::{Error, Result, ValidationError};
use crate::parser::Record;
use crate::transport::Transport;

const MENU: &str = "/ip address";

/// Convert a dotted subnet mask to a prefix length.
///
/// Only contiguous masks are accepted: `255.255.255.0` is 24,
/// `255.0.255.0` is rejected.
pub fn prefix_from_mask(mask: Ipv4Addr) -> std::result::Result<u8, ValidationError> {
    let bits = u32::from(mask);
    let ones = bits.leading_ones();
    // Anything left after shifting out the leading ones is a hole
    if bits.checked_shl(ones).unwrap_or(0) != 0 {
        return Err(ValidationError::SubnetMask {
            value: mask.to_string(),
        });
    }
    Ok(ones as u8)
}

/// Desired address assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    pub interface: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,

    /// Remove every address already on `interface` before adding.
    pub replace_existing: bool,
}

impl AddressSpec {
    pub fn new(
        interface: impl Into<String>,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> std::result::Result<Self, ValidationError> {
        if prefix_len > 32 {
            return Err(ValidationError::PrefixLength(prefix_len));
        }
        Ok(Self {
            interface: interface.into(),
            address,
            prefix_len,
            replace_existing: false,
        })
    }

    /// Build from `a.b.c.d/len`.
    pub fn parse(
        interface: impl Into<String>,
        cidr: &str,
    ) -> std::result::Result<Self, ValidationError> {
        let (address, prefix_len) = parse_cidr(cidr)?;
        Self::new(interface, address, prefix_len)
    }

    /// Build from an address and a dotted subnet mask.
    pub fn with_mask(
        interface: impl Into<String>,
        address: Ipv4Addr,
        mask: Ipv4Addr,
    ) -> std::result::Result<Self, ValidationError> {
        Self::new(interface, address, prefix_from_mask(mask)?)
    }

    /// Opt in to removing existing addresses on the interface first.
    pub fn replacing(mut self, replace_existing: bool) -> Self {
        self.replace_existing = replace_existing;
        self
    }

    /// `a.b.c.d/len`.
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// Typed view of an address record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressView {
    pub reference: ResourceRef,
    pub address: Option<Ipv4Addr>,
    pub prefix_len: Option<u8>,
    pub network: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub enabled: bool,
    pub dynamic: bool,
    pub invalid: bool,
    pub comment: Option<String>,
}

impl AddressView {
    /// Build from a record; records without an item id are skipped.
    pub fn from_record(record: &Record, epoch: u64) -> Option<Self> {
        let id = record.id()?;
        let parsed = record.get("address").and_then(|a| parse_cidr(a).ok());
        Some(Self {
            reference: ResourceRef::new(ResourceKind::Address, id, epoch),
            address: parsed.map(|(a, _)| a),
            prefix_len: parsed.map(|(_, p)| p),
            network: record.get("network").and_then(|n| n.parse().ok()),
            interface: record.get("interface").map(str::to_string),
            enabled: !record.has_flag('X'),
            dynamic: record.has_flag('D'),
            invalid: record.has_flag('I'),
            comment: record.get("comment").map(str::to_string),
        })
    }
}

/// Reconciler for `/ip address`.
pub struct AddressReconciler<'a, T> {
    exec: Executor<'a, T>,
}

impl<'a, T: Transport> AddressReconciler<'a, T> {
    pub fn new(exec: Executor<'a, T>) -> Self {
        Self { exec }
    }

    pub async fn addresses(&self) -> Result<Vec<AddressView>> {
        let epoch = self.exec.epoch();
        Ok(self
            .list()
            .await?
            .iter()
            .filter_map(|r| AddressView::from_record(r, epoch))
            .collect())
    }

    /// Find the id of a freshly added address when `:put` printed nothing
    /// usable.
    async fn lookup(&self, cidr: &str, interface: &str) -> Result<Option<ItemId>> {
        let records = self.list().await?;
        Ok(records
            .iter()
            .find(|r| r.get("address") == Some(cidr) && r.get("interface") == Some(interface))
            .and_then(Record::id)
            .and_then(|id| ItemId::parse(id).ok()))
    }
}

impl<T: Transport> Reconciler for AddressReconciler<'_, T> {
    type Spec = AddressSpec;
    const KIND: ResourceKind = ResourceKind::Address;

    async fn list(&self) -> Result<Vec<Record>> {
        let command = Command::builder(MENU, "print")
            .flag("terse")
            .flag("show-ids")
            .build();
        self.exec.list(&command).await
    }

    async fn create(&self, spec: AddressSpec) -> Result<ResourceRef> {
        let cidr = spec.cidr();
        let address = Value::word("address", &cidr)?;
        let interface = Value::text("interface", &spec.interface, 1, 64)?;

        let mut steps = StepLog::new(format!("add address {cidr} on {}", spec.interface));

        if spec.replace_existing {
            let remove = Command::builder(MENU, "remove")
                .find("interface", &interface)
                .build();
            steps.run(&self.exec, "remove existing addresses", &remove).await?;
        }

        let add = Command::builder(MENU, "add")
            .arg("address", &address)
            .arg("interface", &interface)
            .capture_id()
            .build();
        let result = match self.exec.execute(&add).await {
            Ok(result) => result,
            Err(e) => {
                let e = self.exec.refine(e, Self::KIND, &cidr);
                return Err(steps.fail("add address", e));
            }
        };
        steps.commit("add address");

        let printed = result
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .and_then(|l| ItemId::parse(l).ok());
        let id = match printed {
            Some(id) => id,
            None => {
                debug!("no id printed for {cidr}, looking it up");
                match self.lookup(&cidr, &spec.interface).await {
                    Ok(Some(id)) => id,
                    Ok(None) => {
                        let missing = Error::NotFound {
                            kind: Self::KIND,
                            id: cidr.clone(),
                            message: "added but not present in the address list".into(),
                        };
                        return Err(steps.fail("resolve id", missing));
                    }
                    Err(e) => return Err(steps.fail("resolve id", e)),
                }
            }
        };

        info!("address {cidr} added on {} as {id}", spec.interface);
        Ok(ResourceRef::new(Self::KIND, id.as_str(), self.exec.epoch()))
    }

    async fn update(&self, target: &ResourceRef, spec: AddressSpec) -> Result<()> {
        self.exec.check_ref(target, Self::KIND)?;
        let id = ItemId::parse(&target.id)?;
        let address = Value::word("address", &spec.cidr())?;
        let interface = Value::text("interface", &spec.interface, 1, 64)?;

        let command = Command::builder(MENU, "set")
            .item(&id)
            .arg("address", &address)
            .arg("interface", &interface)
            .build();
        self.exec
            .execute(&command)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &target.id))?;
        info!("address {id} set to {} on {}", spec.cidr(), spec.interface);
        Ok(())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        self.exec.check_ref(target, Self::KIND)?;
        let id = ItemId::parse(&target.id)?;

        let command = Command::builder(MENU, "remove").item(&id).build();
        self.exec
            .execute(&command)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &target.id))?;
        info!("address {id} removed");
        Ok(())
    }
}

fn parse_cidr(cidr: &str) -> std::result::Result<(Ipv4Addr, u8), ValidationError> {
    let malformed = || ValidationError::Address {
        value: cidr.to_string(),
    };
    let (addr, len) = cidr.split_once('/').ok_or_else(malformed)?;
    let address: Ipv4Addr = addr.parse().map_err(|_| malformed())?;
    let prefix_len: u8 = len.parse().map_err(|_| malformed())?;
    if prefix_len > 32 {
        return Err(ValidationError::PrefixLength(prefix_len));
    }
    Ok((address, prefix_len))
}
