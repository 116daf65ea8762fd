//! SSH transport implementation using russh and russh-sftp.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace, warn};
use russh::ChannelMsg;
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use secrecy::ExposeSecret;

use super::config::{AuthMethod, HostKeyVerification, SshConfig};
use super::{Connector, ExecOutput, FileStat, Transport};
use crate::error::{Error, Result};
use crate::resources::ResourceKind;

/// Extended data stream id carrying stderr.
const STDERR_STREAM: u32 = 1;

/// Connector producing real SSH transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Transport = SshTransport;

    async fn connect(&self, config: &SshConfig) -> Result<SshTransport> {
        SshTransport::connect(config).await
    }
}

/// SSH transport wrapping a russh client handle.
pub struct SshTransport {
    /// The russh session handle.
    handle: Handle<SshHandler>,

    /// User the session authenticated as.
    username: String,
}

impl SshTransport {
    /// Connect to the SSH server and authenticate.
    pub async fn connect(config: &SshConfig) -> Result<Self> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification.clone(),
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        debug!("connecting to {}", config.socket_addr());

        let mut handle = tokio::time::timeout(
            config.timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| Error::Timeout(config.timeout))?
        .map_err(|e| {
            // Prefer the detailed host key error over russh's generic one
            if let Some(hk_err) = host_key_error.lock().ok().and_then(|mut slot| slot.take()) {
                return hk_err;
            }
            match e {
                russh::Error::IO(source) => Error::Unreachable {
                    host: config.host.clone(),
                    port: config.port,
                    source,
                },
                other => Error::Protocol {
                    message: other.to_string(),
                },
            }
        })?;

        tokio::time::timeout(config.timeout, Self::authenticate(&mut handle, config))
            .await
            .map_err(|_| Error::Timeout(config.timeout))??;

        debug!(
            "authenticated to {} as '{}'",
            config.socket_addr(),
            config.username
        );

        Ok(Self {
            handle,
            username: config.username.clone(),
        })
    }

    /// Authenticate with the server.
    async fn authenticate(handle: &mut Handle<SshHandler>, config: &SshConfig) -> Result<()> {
        let protocol = |e: russh::Error| Error::Protocol {
            message: e.to_string(),
        };

        let success = match &config.auth {
            AuthMethod::None => handle
                .authenticate_none(&config.username)
                .await
                .map_err(protocol)?
                .success(),
            AuthMethod::Password(password) => handle
                .authenticate_password(&config.username, password.expose_secret())
                .await
                .map_err(protocol)?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                    .map_err(|e| Error::Protocol {
                        message: format!("cannot load key {}: {e}", path.display()),
                    })?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(protocol)?
                    .flatten();

                handle
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(protocol)?
                    .success()
            }
        };

        if !success {
            return Err(Error::AuthenticationRejected {
                user: config.username.clone(),
            });
        }

        Ok(())
    }

    /// Open an SFTP session on a fresh channel of this connection.
    async fn sftp(&self) -> Result<SftpSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(Error::transport)?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(Error::transport)?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(Error::transport)
    }

    /// User this transport authenticated as.
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Transport for SshTransport {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(Error::transport)?;

        channel.exec(true, command).await.map_err(Error::transport)?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                    output.stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        trace!(
            "exec done: {} stdout bytes, {} stderr bytes, exit {:?}",
            output.stdout.len(),
            output.stderr.len(),
            output.exit_status
        );

        Ok(output)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let sftp = self.sftp().await?;
        let listing = sftp.read_dir(path).await;
        if let Err(e) = sftp.close().await {
            debug!("sftp close after listing {path}: {e}");
        }
        let names = listing
            .map_err(|e| sftp_error(path, e))?
            .map(|entry| entry.file_name())
            .collect();
        Ok(names)
    }

    async fn read_file(&self, path: &str) -> Result<Bytes> {
        let sftp = self.sftp().await?;
        let data = sftp.read(path).await;
        if let Err(e) = sftp.close().await {
            debug!("sftp close after reading {path}: {e}");
        }
        data.map(Bytes::from).map_err(|e| sftp_error(path, e))
    }

    async fn stat(&self, path: &str) -> Result<Option<FileStat>> {
        let sftp = self.sftp().await?;
        let attrs = sftp.metadata(path).await;
        if let Err(e) = sftp.close().await {
            debug!("sftp close after stat of {path}: {e}");
        }
        match attrs {
            Ok(attrs) => Ok(Some(FileStat {
                size: attrs.size,
                modified: attrs.mtime,
            })),
            Err(e) => match sftp_error(path, e) {
                Error::NotFound { .. } => Ok(None),
                other => Err(other),
            },
        }
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn close(self) -> Result<()> {
        self.handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(Error::transport)
    }
}

/// Classify an SFTP failure: status replies are device answers, anything
/// else means the sub-channel is gone.
fn sftp_error(path: &str, err: SftpError) -> Error {
    match err {
        SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile => {
            Error::NotFound {
                kind: ResourceKind::Backup,
                id: path.to_string(),
                message: status.error_message,
            }
        }
        SftpError::Status(status) => Error::CommandRejected {
            command: format!("sftp {path}"),
            message: status.error_message,
        },
        other => Error::transport(other),
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Detailed host key error surfaced by connect() instead of the
    /// generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<Error>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if host not found.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> std::result::Result<bool, Error> {
        let result = if let Some(ref path) = self.known_hosts_path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(Error::Protocol {
                message: format!(
                    "host key for {}:{} changed (known_hosts line {line})",
                    self.host, self.port
                ),
            }),
            Err(e) => Err(Error::Protocol {
                message: format!("known_hosts: {e}"),
            }),
        }
    }

    /// Save a new host key to known_hosts.
    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), russh::keys::Error> {
        if let Some(ref path) = self.known_hosts_path {
            russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey)
        }
    }

    fn reject(&self, err: Error) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(err);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.host_key_verification {
            HostKeyVerification::Disabled => Ok(true),

            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {}", e);
                    }
                    Ok(true)
                }
                Err(e) => Ok(self.reject(e)),
            },

            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => Ok(true),
                Ok(false) => Ok(self.reject(Error::Protocol {
                    message: format!("host {}:{} not in known_hosts", self.host, self.port),
                })),
                Err(e) => Ok(self.reject(e)),
            },
        }
    }
}
