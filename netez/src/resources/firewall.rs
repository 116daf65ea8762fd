//! Domain blocking with layer7 matchers.
//!
//! A block is a pair of device objects sharing one name: a
//! `layer7-protocol` matcher holding the escaped domain as its regexp, and
//! a forward-chain drop filter that references the matcher and carries the
//! same name as comment. The name is the configured prefix plus the
//! normalized domain, so every domain has its own pair and unblocking one
//! never touches another.

use std::collections::HashMap;

use chrono::NaiveDate;
use log::info;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Reconciler, ResourceKind, ResourceRef, StepLog, unsupported};
use crate::driver::{Command, Executor, Value};
use crate::error::{Error, Result, ValidationError};
use crate::index::BlockDuration;
use crate::parser::Record;
use crate::transport::Transport;

const LAYER7: &str = "/ip firewall layer7-protocol";
const FILTER: &str = "/ip firewall filter";

const MAX_DOMAIN: usize = 253;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$")
        .expect("domain pattern is valid")
});

/// Lowercase, trim and validate a domain name.
pub fn normalize_domain(domain: &str) -> std::result::Result<String, ValidationError> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        return Err(ValidationError::Empty { field: "domain" });
    }
    if domain.len() > MAX_DOMAIN || !DOMAIN_RE.is_match(&domain) {
        return Err(ValidationError::Domain { value: domain });
    }
    Ok(domain)
}

/// A domain to block.
///
/// Schedule and duration are bookkeeping for the caller; the device rule
/// is permanent until unblocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    pub domain: String,
    pub schedule: Option<NaiveDate>,
    pub duration: BlockDuration,
}

impl BlockSpec {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            schedule: None,
            duration: BlockDuration::Permanent,
        }
    }

    pub fn schedule(mut self, date: NaiveDate) -> Self {
        self.schedule = Some(date);
        self
    }

    pub fn duration(mut self, duration: BlockDuration) -> Self {
        self.duration = duration;
        self
    }
}

/// One block as found on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockView {
    pub reference: ResourceRef,
    pub name: String,
    pub domain: String,
    pub regexp: Option<String>,

    /// Filters referencing the matcher.
    pub filter_count: usize,

    /// At least one referencing filter is enabled.
    pub enforced: bool,

    /// From the secondary index, when it has an entry.
    pub schedule: Option<NaiveDate>,
    pub duration: Option<BlockDuration>,
}

impl BlockView {
    fn from_record(record: &Record, epoch: u64) -> Option<Self> {
        let name = record.get("name")?.to_string();
        Some(Self {
            reference: ResourceRef::new(ResourceKind::Block, name.clone(), epoch),
            domain: record.get("domain").unwrap_or_default().to_string(),
            regexp: record.get("regexp").map(str::to_string),
            filter_count: record
                .get("filters")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            enforced: record.get("enforced") == Some("yes"),
            schedule: None,
            duration: None,
            name,
        })
    }
}

/// Reconciler for domain blocks.
pub struct FirewallReconciler<'a, T> {
    exec: Executor<'a, T>,
    prefix: String,
}

impl<'a, T: Transport> FirewallReconciler<'a, T> {
    pub fn new(exec: Executor<'a, T>, prefix: impl Into<String>) -> Self {
        Self {
            exec,
            prefix: prefix.into(),
        }
    }

    /// Device name used for a domain.
    pub fn block_name(&self, domain: &str) -> std::result::Result<String, ValidationError> {
        Ok(format!("{}{}", self.prefix, normalize_domain(domain)?))
    }

    /// Typed listing.
    pub async fn blocks(&self) -> Result<Vec<BlockView>> {
        let epoch = self.exec.epoch();
        Ok(self
            .list()
            .await?
            .iter()
            .filter_map(|r| BlockView::from_record(r, epoch))
            .collect())
    }

    /// Block a domain; returns the block's reference.
    pub async fn block(&self, spec: BlockSpec) -> Result<ResourceRef> {
        self.create(spec).await
    }

    /// Remove a block by reference.
    pub async fn unblock(&self, target: &ResourceRef) -> Result<()> {
        self.delete(target).await
    }

    async fn matchers(&self) -> Result<Vec<Record>> {
        let command = Command::builder(LAYER7, "print")
            .flag("terse")
            .flag("show-ids")
            .build();
        self.exec.list(&command).await
    }

    async fn matcher_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .matchers()
            .await?
            .iter()
            .any(|r| r.get("name") == Some(name)))
    }
}

impl<T: Transport> Reconciler for FirewallReconciler<'_, T> {
    type Spec = BlockSpec;
    const KIND: ResourceKind = ResourceKind::Block;

    /// One synthetic record per matcher carrying the prefix: `name`,
    /// `domain`, `regexp`, `filters` (count of referencing filters) and
    /// `enforced` (`yes` if any of them is enabled).
    async fn list(&self) -> Result<Vec<Record>> {
        let matchers = self.matchers().await?;
        let command = Command::builder(FILTER, "print")
            .flag("terse")
            .flag("show-ids")
            .build();
        let filters = self.exec.list(&command).await?;

        let mut usage: HashMap<&str, (usize, bool)> = HashMap::new();
        for filter in &filters {
            if let Some(name) = filter.get("layer7-protocol") {
                let entry = usage.entry(name).or_default();
                entry.0 += 1;
                entry.1 |= !filter.has_flag('X');
            }
        }

        Ok(matchers
            .iter()
            .filter_map(|m| {
                let name = m.get("name")?;
                let domain = name.strip_prefix(self.prefix.as_str())?;
                let (count, enforced) = usage.get(name).copied().unwrap_or_default();

                let mut record = Record::new();
                if let Some(id) = m.id() {
                    record.insert(crate::parser::ID_FIELD, id);
                }
                record.insert("name", name);
                record.insert("domain", domain);
                if let Some(regexp) = m.get("regexp") {
                    record.insert("regexp", regexp);
                }
                record.insert("filters", count.to_string());
                record.insert("enforced", if enforced { "yes" } else { "no" });
                Some(record)
            })
            .collect())
    }

    async fn create(&self, spec: BlockSpec) -> Result<ResourceRef> {
        let domain = normalize_domain(&spec.domain)?;
        let name = format!("{}{domain}", self.prefix);
        let name_value = Value::text("block name", &name, 1, 255)?;

        if self.matcher_exists(&name).await? {
            return Err(Error::AlreadyExists {
                kind: Self::KIND,
                id: name,
                message: "a layer7 matcher with this name is already on the device".into(),
            });
        }

        let mut steps = StepLog::new(format!("block {domain}"));

        let matcher = Command::builder(LAYER7, "add")
            .arg("name", &name_value)
            .arg("regexp", &Value::quoted(regex::escape(&domain)))
            .build();
        steps
            .run(&self.exec, "layer7-protocol", &matcher)
            .await
            .map_err(|e| self.exec.refine(e, Self::KIND, &name))?;

        let filter = Command::builder(FILTER, "add")
            .arg("chain", &Value::keyword("forward"))
            .arg("layer7-protocol", &name_value)
            .arg("action", &Value::keyword("drop"))
            .arg("comment", &name_value)
            .build();
        steps.run(&self.exec, "filter", &filter).await?;

        info!(
            "blocked {domain} as {name} (schedule {:?}, duration {})",
            spec.schedule, spec.duration
        );
        Ok(ResourceRef::new(Self::KIND, name, self.exec.epoch()))
    }

    async fn update(&self, _target: &ResourceRef, _spec: BlockSpec) -> Result<()> {
        unsupported(Self::KIND, "update")
    }

    /// Remove the filters first so no filter is left pointing at a
    /// missing matcher, then the matcher.
    async fn delete(&self, target: &ResourceRef) -> Result<()> {
        self.exec.check_ref(target, Self::KIND)?;
        let name = Value::text("block name", &target.id, 1, 255)?;

        if !self.matcher_exists(&target.id).await? {
            return Err(Error::NotFound {
                kind: Self::KIND,
                id: target.id.clone(),
                message: "no layer7 matcher with this name".into(),
            });
        }

        let mut steps = StepLog::new(format!("unblock {}", target.id));
        let filters = Command::builder(FILTER, "remove")
            .find("layer7-protocol", &name)
            .build();
        steps.run(&self.exec, "filter", &filters).await?;

        let matcher = Command::builder(LAYER7, "remove")
            .find("name", &name)
            .build();
        steps.run(&self.exec, "layer7-protocol", &matcher).await?;

        info!("unblocked {}", target.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::driver::ConnectionManager;
    use crate::platform;
    use crate::testing::{MockConnector, MockTransport, Reply, ssh_config};

    async fn manager(transport: &MockTransport) -> ConnectionManager<MockConnector> {
        let manager = ConnectionManager::new(MockConnector::new(transport.clone()));
        manager.connect(&ssh_config()).await.unwrap();
        manager
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain(" Example.COM. ").unwrap(), "example.com");
        assert_eq!(normalize_domain("sub-1.example.co.id").unwrap(), "sub-1.example.co.id");
        assert!(normalize_domain("").is_err());
        assert!(normalize_domain("localhost").is_err());
        assert!(normalize_domain("example.com\" action=accept").is_err());
        assert!(normalize_domain("-bad.example.com").is_err());
        assert!(normalize_domain("exa mple.com").is_err());
        assert!(normalize_domain(&format!("{}.com", "a".repeat(254))).is_err());
    }

    #[tokio::test]
    async fn test_block_issues_matcher_then_filter() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let reference = FirewallReconciler::new(exec, "block-")
            .block(BlockSpec::new("Example.com"))
            .await
            .unwrap();
        assert_eq!(reference.id, "block-example.com");
        assert_eq!(
            transport.commands(),
            vec![
                "/ip firewall layer7-protocol print terse show-ids".to_string(),
                r#"/ip firewall layer7-protocol add name="block-example.com" regexp="example\\.com""#
                    .to_string(),
                r#"/ip firewall filter add chain=forward layer7-protocol="block-example.com" action=drop comment="block-example.com""#
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_filter_failure_is_partial_success() {
        let transport = MockTransport::new();
        transport.on("/ip firewall filter add", |_| {
            Reply::stdout("failure: out of memory")
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let err = FirewallReconciler::new(exec, "block-")
            .block(BlockSpec::new("example.com"))
            .await
            .unwrap_err();
        match err {
            Error::PartialSuccess(partial) => {
                assert_eq!(partial.committed, vec!["layer7-protocol"]);
                assert_eq!(partial.failed_step, "filter");
                assert_eq!(partial.cause.device_message(), Some("failure: out of memory"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matcher_failure_is_plain_error() {
        let transport = MockTransport::new();
        transport.on("/ip firewall layer7-protocol add", |_| {
            Reply::stdout("failure: already have such name")
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let err = FirewallReconciler::new(exec, "block-")
            .block(BlockSpec::new("example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert!(!transport.commands().iter().any(|c| c.contains("filter add")));
    }

    #[tokio::test]
    async fn test_repeat_block_is_already_exists() {
        let transport = MockTransport::new();
        transport.on("/ip firewall layer7-protocol print", |_| {
            Reply::stdout(r#" *1 name=block-example.com regexp="example\.com""#)
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let err = FirewallReconciler::new(exec, "block-")
            .block(BlockSpec::new("example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(transport.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_domain_sends_nothing() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let err = FirewallReconciler::new(exec, "block-")
            .block(BlockSpec::new("example.com; /system reboot"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::Domain { .. })));
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unblock_removes_filters_then_matcher() {
        let transport = MockTransport::new();
        transport.on("/ip firewall layer7-protocol print", |_| {
            Reply::stdout(
                " *1 name=block-example.com regexp=example\\.com\n *2 name=block-other.org regexp=other\\.org\n",
            )
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let reference = ResourceRef::new(ResourceKind::Block, "block-example.com", 1);
        FirewallReconciler::new(exec, "block-")
            .unblock(&reference)
            .await
            .unwrap();
        let commands = transport.commands();
        assert_eq!(
            commands[1],
            r#"/ip firewall filter remove [find layer7-protocol="block-example.com"]"#
        );
        assert_eq!(
            commands[2],
            r#"/ip firewall layer7-protocol remove [find name="block-example.com"]"#
        );
        assert!(!commands.iter().any(|c| c.contains("other.org")));
    }

    #[tokio::test]
    async fn test_unblock_unknown_is_not_found() {
        let transport = MockTransport::new();
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let reference = ResourceRef::new(ResourceKind::Block, "block-example.com", 1);
        let err = FirewallReconciler::new(exec, "block-")
            .unblock(&reference)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_joins_matchers_and_filters() {
        let transport = MockTransport::new();
        transport.on("/ip firewall layer7-protocol print", |_| {
            Reply::stdout(
                " *1 name=block-example.com regexp=example\\.com\n\
                 *2 name=block-other.org regexp=other\\.org\n\
                 *3 name=voip regexp=^sip\n",
            )
        });
        transport.on("/ip firewall filter print", |_| {
            Reply::stdout(
                " *A chain=forward action=drop layer7-protocol=block-example.com comment=block-example.com\n\
                 *B X chain=forward action=drop layer7-protocol=block-other.org comment=block-other.org\n\
                 *C chain=input action=accept protocol=icmp\n",
            )
        });
        let manager = manager(&transport).await;
        let guard = manager.lock().await.unwrap();
        let profile = platform::routeros();
        let exec = Executor::new(guard.session().unwrap(), &profile, Duration::from_secs(5));

        let views = FirewallReconciler::new(exec, "block-").blocks().await.unwrap();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].domain, "example.com");
        assert_eq!(views[0].regexp.as_deref(), Some("example\\.com"));
        assert_eq!(views[0].filter_count, 1);
        assert!(views[0].enforced);
        assert_eq!(views[1].domain, "other.org");
        assert!(!views[1].enforced);
    }
}
