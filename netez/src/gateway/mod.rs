//! Orchestration facade.
//!
//! [`Gateway`] is the one entry point callers use. It owns the
//! [`ConnectionManager`] and builds a reconciler per request on top of the
//! locked session, so every operation, single or multi-step, runs with
//! exclusive use of the device shell. Errors that leave the session
//! unusable tear it down before they are returned.

mod builder;

pub use builder::GatewayBuilder;

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;
use log::{debug, warn};
use secrecy::SecretString;
use tokio::sync::watch;

use crate::backup::{self, BackupGateway};
use crate::config::GatewayConfig;
use crate::driver::{ConnectResult, ConnectionManager, ConnectionState, Executor, Session};
use crate::error::{Result, ValidationError};
use crate::index::{BlockDuration, BlockIndex, BlockedSiteEntry};
use crate::parser::Record;
use crate::resources::{
    AddressReconciler, AddressSpec, AddressView, BandwidthLimitView, BlockSpec, BlockView,
    FirewallReconciler, InterfaceReconciler, InterfaceView, QueueReconciler, QueueSpec, Reconciler,
    ResourceKind, ResourceRef, WirelessReconciler, WirelessSpec, WirelessView, unsupported,
};
use crate::transport::{AuthMethod, Connector, SshConfig, SshConnector};

/// Single entry point for managing one device.
///
/// # Example
///
/// ```rust,no_run
/// use netez::{AuthMethod, Gateway, GatewayConfig};
///
/// # async fn example() -> Result<(), netez::Error> {
/// let gateway = Gateway::new(GatewayConfig::default());
/// gateway
///     .connect("192.168.88.1", 22, "admin", AuthMethod::password("secret"))
///     .await?;
///
/// for iface in gateway.list_interfaces().await? {
///     println!("{} enabled={}", iface.name, iface.enabled);
/// }
///
/// gateway.disconnect().await?;
/// # Ok(())
/// # }
/// ```
pub struct Gateway<C: Connector = SshConnector> {
    manager: ConnectionManager<C>,
    config: GatewayConfig,
    index: Option<Arc<BlockIndex>>,
}

impl Gateway<SshConnector> {
    /// Gateway connecting over SSH.
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_connector(SshConnector, config)
    }

    /// Start a [`GatewayBuilder`].
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }
}

impl<C: Connector> Gateway<C> {
    /// Gateway using a custom connector.
    pub fn with_connector(connector: C, config: GatewayConfig) -> Self {
        let index = config
            .index_path
            .as_ref()
            .map(|path| Arc::new(BlockIndex::new(path)));
        Self {
            manager: ConnectionManager::new(connector),
            config,
            index,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// The secondary blocked-site index, if enabled.
    pub fn index(&self) -> Option<&BlockIndex> {
        self.index.as_deref()
    }

    /// Run a blocking index operation on the blocking pool. `None` when the
    /// index is disabled or the task died.
    async fn on_index<R, F>(&self, op: F) -> Option<R>
    where
        F: FnOnce(&BlockIndex) -> R + Send + 'static,
        R: Send + 'static,
    {
        let index = Arc::clone(self.index.as_ref()?);
        match tokio::task::spawn_blocking(move || op(&index)).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!("block index task failed: {e}");
                None
            }
        }
    }

    // -- connection --------------------------------------------------------

    /// Connect and authenticate.
    pub async fn connect(
        &self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> Result<ConnectResult> {
        let ssh = self.config.ssh_config(host, port, username, auth);
        self.manager.connect(&ssh).await
    }

    /// Connect with fully specified SSH settings.
    pub async fn connect_with(&self, ssh: &SshConfig) -> Result<ConnectResult> {
        self.manager.connect(ssh).await
    }

    /// Close the session; pending commands fail with `SessionClosed`.
    pub async fn disconnect(&self) -> Result<()> {
        self.manager.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe()
    }

    /// Check the transport; a dead one is torn down.
    pub async fn health_check(&self) -> Result<()> {
        self.manager.health_check().await
    }

    fn executor<'s>(&'s self, session: &'s Session<C::Transport>) -> Executor<'s, C::Transport> {
        Executor::new(session, &self.config.profile, self.config.command_timeout)
            .with_transfer_timeout(self.config.transfer_timeout)
    }

    // -- interfaces --------------------------------------------------------

    pub async fn list_interfaces(&self) -> Result<Vec<InterfaceView>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = InterfaceReconciler::new(self.executor(session))
            .interfaces()
            .await;
        guard.settle(result).await
    }

    /// Enable or disable an interface. Setting the current state succeeds.
    pub async fn set_interface_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = InterfaceReconciler::new(self.executor(session))
            .set_enabled(name, enabled)
            .await;
        guard.settle(result).await
    }

    // -- addresses ---------------------------------------------------------

    pub async fn list_addresses(&self) -> Result<Vec<AddressView>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = AddressReconciler::new(self.executor(session))
            .addresses()
            .await;
        guard.settle(result).await
    }

    /// Assign an address. With `replace_existing`, every address already
    /// on the interface is removed first.
    pub async fn add_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        prefix_len: u8,
        replace_existing: bool,
    ) -> Result<ResourceRef> {
        let spec = AddressSpec::new(interface, address, prefix_len)?.replacing(replace_existing);
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = AddressReconciler::new(self.executor(session))
            .create(spec)
            .await;
        guard.settle(result).await
    }

    pub async fn update_address(&self, target: &ResourceRef, spec: AddressSpec) -> Result<()> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = AddressReconciler::new(self.executor(session))
            .update(target, spec)
            .await;
        guard.settle(result).await
    }

    pub async fn delete_address(&self, target: &ResourceRef) -> Result<()> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = AddressReconciler::new(self.executor(session))
            .delete(target)
            .await;
        guard.settle(result).await
    }

    // -- domain blocks -----------------------------------------------------

    /// Block a domain. The index entry, if enabled, is written after the
    /// device accepted the block.
    pub async fn block_domain(
        &self,
        domain: &str,
        schedule: Option<NaiveDate>,
        duration: BlockDuration,
    ) -> Result<ResourceRef> {
        let mut spec = BlockSpec::new(domain).duration(duration);
        spec.schedule = schedule;

        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = FirewallReconciler::new(self.executor(session), &self.config.block_prefix)
            .create(spec)
            .await;
        let reference = guard.settle(result).await?;

        let domain = self.block_domain_name(&reference).to_string();
        let entry = BlockedSiteEntry::new(&domain, schedule, duration, reference.id.as_str());
        if let Some(Err(e)) = self.on_index(move |index| index.upsert(entry)).await {
            warn!("block of {domain} applied but index update failed: {e}");
        }
        Ok(reference)
    }

    /// Remove a block and its index entry.
    pub async fn unblock_domain(&self, target: &ResourceRef) -> Result<()> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = FirewallReconciler::new(self.executor(session), &self.config.block_prefix)
            .delete(target)
            .await;
        guard.settle(result).await?;

        self.forget_block(target).await;
        Ok(())
    }

    fn block_domain_name<'r>(&self, reference: &'r ResourceRef) -> &'r str {
        reference
            .id
            .strip_prefix(self.config.block_prefix.as_str())
            .unwrap_or(&reference.id)
    }

    async fn forget_block(&self, target: &ResourceRef) {
        let domain = self.block_domain_name(target).to_string();
        let key = domain.clone();
        match self.on_index(move |index| index.remove(&key)).await {
            Some(Ok(true)) => debug!("index entry for {domain} removed"),
            Some(Ok(false)) => debug!("no index entry for {domain}"),
            Some(Err(e)) => warn!("unblocked {domain} but index update failed: {e}"),
            None => {}
        }
    }

    /// Blocks as found on the device, with schedule and duration from the
    /// index where it has an entry.
    pub async fn list_blocks(&self) -> Result<Vec<BlockView>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = FirewallReconciler::new(self.executor(session), &self.config.block_prefix)
            .blocks()
            .await;
        let mut blocks = guard.settle(result).await?;

        if let Some(entries) = self.on_index(BlockIndex::load).await {
            for block in &mut blocks {
                if let Some(entry) = entries.iter().find(|e| e.domain == block.domain) {
                    block.schedule = entry.schedule;
                    block.duration = Some(entry.duration);
                }
            }
        }
        Ok(blocks)
    }

    // -- bandwidth limits --------------------------------------------------

    /// Limit an address, rates in Mbps. A second limit for the same address
    /// fails with `AlreadyExists`.
    pub async fn set_bandwidth_limit(
        &self,
        ip: Ipv4Addr,
        upload_mbps: u64,
        download_mbps: u64,
    ) -> Result<ResourceRef> {
        self.create_limit(QueueSpec::mbps(ip, upload_mbps, download_mbps)?)
            .await
    }

    /// Like [`set_bandwidth_limit`](Self::set_bandwidth_limit), rates in kbps.
    pub async fn set_bandwidth_limit_kbps(
        &self,
        ip: Ipv4Addr,
        upload_kbps: u64,
        download_kbps: u64,
    ) -> Result<ResourceRef> {
        self.create_limit(QueueSpec::kbps(ip, upload_kbps, download_kbps)?)
            .await
    }

    /// Change the rates of an existing limit, in Mbps.
    pub async fn update_bandwidth_limit(
        &self,
        target: &ResourceRef,
        upload_mbps: u64,
        download_mbps: u64,
    ) -> Result<()> {
        let ip = self.limit_target(target)?;
        self.update_limit(target, QueueSpec::mbps(ip, upload_mbps, download_mbps)?)
            .await
    }

    /// Change the rates of an existing limit, in kbps.
    pub async fn update_bandwidth_limit_kbps(
        &self,
        target: &ResourceRef,
        upload_kbps: u64,
        download_kbps: u64,
    ) -> Result<()> {
        let ip = self.limit_target(target)?;
        self.update_limit(target, QueueSpec::kbps(ip, upload_kbps, download_kbps)?)
            .await
    }

    fn limit_target(&self, target: &ResourceRef) -> Result<Ipv4Addr> {
        let ip = target
            .id
            .strip_prefix(self.config.queue_prefix.as_str())
            .and_then(|ip| ip.parse().ok())
            .ok_or_else(|| ValidationError::Malformed {
                field: "queue reference",
                value: target.id.clone(),
            })?;
        Ok(ip)
    }

    async fn create_limit(&self, spec: QueueSpec) -> Result<ResourceRef> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = QueueReconciler::new(self.executor(session), &self.config.queue_prefix)
            .create(spec)
            .await;
        guard.settle(result).await
    }

    async fn update_limit(&self, target: &ResourceRef, spec: QueueSpec) -> Result<()> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = QueueReconciler::new(self.executor(session), &self.config.queue_prefix)
            .update(target, spec)
            .await;
        guard.settle(result).await
    }

    pub async fn delete_bandwidth_limit(&self, target: &ResourceRef) -> Result<()> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = QueueReconciler::new(self.executor(session), &self.config.queue_prefix)
            .delete(target)
            .await;
        guard.settle(result).await
    }

    pub async fn list_bandwidth_limits(&self) -> Result<Vec<BandwidthLimitView>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = QueueReconciler::new(self.executor(session), &self.config.queue_prefix)
            .limits()
            .await;
        guard.settle(result).await
    }

    // -- wireless ----------------------------------------------------------

    /// Change SSID and/or WPA2 key on the configured radio.
    pub async fn set_wireless(
        &self,
        ssid: Option<&str>,
        password: Option<SecretString>,
    ) -> Result<()> {
        let spec = WirelessSpec::new(ssid.map(str::to_string), password);
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result =
            WirelessReconciler::new(self.executor(session), &self.config.wireless_interface)
                .apply(spec)
                .await;
        guard.settle(result).await
    }

    pub async fn list_wireless(&self) -> Result<Vec<WirelessView>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result =
            WirelessReconciler::new(self.executor(session), &self.config.wireless_interface)
                .interfaces()
                .await;
        guard.settle(result).await
    }

    // -- backups -----------------------------------------------------------

    fn backups<'s>(&'s self, session: &'s Session<C::Transport>) -> BackupGateway<'s, C::Transport> {
        BackupGateway::new(self.executor(session)).with_polling(
            self.config.backup_poll_attempts,
            self.config.backup_poll_interval,
        )
    }

    pub async fn list_backups(&self) -> Result<Vec<String>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = self.backups(session).list().await;
        guard.settle(result).await
    }

    /// Save a backup and wait until it is listed; returns the file name.
    pub async fn create_backup(&self, name: &str) -> Result<String> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = self.backups(session).create(name).await;
        guard.settle(result).await
    }

    /// Fetch a backup into memory.
    pub async fn fetch_backup(&self, name: &str) -> Result<Bytes> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = self.backups(session).fetch(name).await;
        guard.settle(result).await
    }

    /// Fetch a backup into `dir`; nothing is left behind on failure. The
    /// session is released before the file is written.
    pub async fn fetch_backup_to(&self, name: &str, dir: &Path) -> Result<PathBuf> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let result = self.backups(session).fetch(name).await;
        let data = guard.settle(result).await?;
        backup::save_to(name, dir, data).await
    }

    // -- uniform dispatch --------------------------------------------------

    /// Raw records for any kind. Backups list as records with a `name`
    /// field.
    pub async fn list(&self, kind: ResourceKind) -> Result<Vec<Record>> {
        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let exec = self.executor(session);
        let result = match kind {
            ResourceKind::Interface => InterfaceReconciler::new(exec).list().await,
            ResourceKind::Address => AddressReconciler::new(exec).list().await,
            ResourceKind::Block => {
                FirewallReconciler::new(exec, &self.config.block_prefix)
                    .list()
                    .await
            }
            ResourceKind::Queue => {
                QueueReconciler::new(exec, &self.config.queue_prefix)
                    .list()
                    .await
            }
            ResourceKind::Wireless => {
                WirelessReconciler::new(exec, &self.config.wireless_interface)
                    .list()
                    .await
            }
            ResourceKind::Backup => self.backups(session).list().await.map(|files| {
                files
                    .into_iter()
                    .map(|name| Record::from_iter([("name", name)]))
                    .collect()
            }),
        };
        guard.settle(result).await
    }

    /// Delete by reference, whatever its kind.
    pub async fn delete(&self, target: &ResourceRef) -> Result<()> {
        if target.kind == ResourceKind::Block {
            return self.unblock_domain(target).await;
        }

        let guard = self.manager.lock().await?;
        let session = guard.session()?;
        let exec = self.executor(session);
        let result = match target.kind {
            ResourceKind::Interface => InterfaceReconciler::new(exec).delete(target).await,
            ResourceKind::Address => AddressReconciler::new(exec).delete(target).await,
            ResourceKind::Queue => {
                QueueReconciler::new(exec, &self.config.queue_prefix)
                    .delete(target)
                    .await
            }
            ResourceKind::Wireless => {
                WirelessReconciler::new(exec, &self.config.wireless_interface)
                    .delete(target)
                    .await
            }
            ResourceKind::Block | ResourceKind::Backup => unsupported(target.kind, "delete"),
        };
        guard.settle(result).await
    }
}
