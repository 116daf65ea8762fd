//! Builder for creating gateways.

use std::path::PathBuf;
use std::time::Duration;

use super::Gateway;
use crate::config::GatewayConfig;
use crate::platform::DeviceProfile;
use crate::transport::{Connector, HostKeyVerification, SshConnector};

/// Builder for constructing a [`Gateway`].
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use netez::GatewayBuilder;
///
/// let gateway = GatewayBuilder::new()
///     .command_timeout(Duration::from_secs(15))
///     .wireless_interface("wlan2")
///     .index_path("/var/lib/netez/blocked.json")
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct GatewayBuilder {
    config: GatewayConfig,
}

impl GatewayBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Set the connect timeout (default: 10s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the per-command timeout (default: 30s).
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = timeout;
        self
    }

    /// Set the file transfer timeout (default: 120s).
    pub fn transfer_timeout(mut self, timeout: Duration) -> Self {
        self.config.transfer_timeout = timeout;
        self
    }

    /// Set how long to wait for a new backup file (default: 10 checks, 1s apart).
    pub fn backup_polling(mut self, attempts: u32, interval: Duration) -> Self {
        self.config.backup_poll_attempts = attempts;
        self.config.backup_poll_interval = interval;
        self
    }

    /// Set the wireless interface (default: `wlan1`).
    pub fn wireless_interface(mut self, name: impl Into<String>) -> Self {
        self.config.wireless_interface = name.into();
        self
    }

    /// Set the block name prefix (default: `block-`).
    pub fn block_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.block_prefix = prefix.into();
        self
    }

    /// Set the queue name prefix (default: `limit-`).
    pub fn queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.queue_prefix = prefix.into();
        self
    }

    /// Enable the secondary blocked-site index at `path`.
    pub fn index_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.index_path = Some(path.into());
        self
    }

    /// Use a custom device profile.
    pub fn profile(mut self, profile: DeviceProfile) -> Self {
        self.config.profile = profile;
        self
    }

    /// Set host key verification (default: accept new keys).
    pub fn host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.config.host_key_verification = mode;
        self
    }

    /// Use a specific known_hosts file.
    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.known_hosts_path = Some(path.into());
        self
    }

    /// Build a gateway that connects over SSH.
    ///
    /// This does not connect. Call `connect()` on the returned gateway.
    pub fn build(self) -> Gateway<SshConnector> {
        Gateway::with_connector(SshConnector, self.config)
    }

    /// Build a gateway with a custom connector.
    pub fn build_with<C: Connector>(self, connector: C) -> Gateway<C> {
        Gateway::with_connector(connector, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_config() {
        let gateway = GatewayBuilder::new()
            .command_timeout(Duration::from_secs(5))
            .backup_polling(3, Duration::from_millis(200))
            .block_prefix("netez-block-")
            .index_path("/tmp/blocked.json")
            .build();
        let config = gateway.config();
        assert_eq!(config.command_timeout, Duration::from_secs(5));
        assert_eq!(config.backup_poll_attempts, 3);
        assert_eq!(config.block_prefix, "netez-block-");
        assert_eq!(config.queue_prefix, "limit-");
        assert!(config.index_path.is_some());
    }
}
