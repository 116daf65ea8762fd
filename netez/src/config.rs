//! Gateway configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::platform::{self, DeviceProfile};
use crate::transport::{AuthMethod, HostKeyVerification, SshConfig};

/// Tunables for a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bound on TCP connect, handshake and authentication.
    pub connect_timeout: Duration,

    /// Bound on a single command.
    pub command_timeout: Duration,

    /// Bound on a single file transfer.
    pub transfer_timeout: Duration,

    /// How many times the file list is checked after saving a backup.
    pub backup_poll_attempts: u32,

    /// Pause between those checks.
    pub backup_poll_interval: Duration,

    /// Radio that wireless settings are applied to.
    pub wireless_interface: String,

    /// Prefix of layer7 matcher and filter names created for blocks.
    pub block_prefix: String,

    /// Prefix of simple-queue names created for bandwidth limits.
    pub queue_prefix: String,

    /// Secondary blocked-site index; `None` disables it.
    pub index_path: Option<PathBuf>,

    /// Failure markers of the device dialect.
    pub profile: DeviceProfile,

    pub host_key_verification: HostKeyVerification,
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(120),
            backup_poll_attempts: 10,
            backup_poll_interval: Duration::from_secs(1),
            wireless_interface: "wlan1".to_string(),
            block_prefix: "block-".to_string(),
            queue_prefix: "limit-".to_string(),
            index_path: None,
            profile: platform::routeros(),
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
        }
    }
}

impl GatewayConfig {
    /// SSH settings for one connect request.
    pub fn ssh_config(
        &self,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMethod,
    ) -> SshConfig {
        let mut config = SshConfig::new(host, port, username, auth);
        config.timeout = self.connect_timeout;
        config.host_key_verification = self.host_key_verification.clone();
        config.known_hosts_path = self.known_hosts_path.clone();
        config
    }
}
