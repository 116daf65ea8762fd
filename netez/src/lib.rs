//! # Netez
//!
//! Async SSH command gateway for RouterOS devices.
//!
//! Netez keeps one authenticated session per device and exposes typed
//! operations for the objects a small-network admin touches every day:
//! interfaces, IPv4 addresses, domain blocks, per-host bandwidth limits,
//! the wireless radio and configuration backups.
//!
//! ## Features
//!
//! - Async SSH sessions via russh, file transfer via russh-sftp
//! - Explicit connection states with session epochs, so references from a
//!   previous session are refused instead of hitting the wrong object
//! - Injection-safe command construction
//! - Device failures classified from console output
//! - Multi-step operations report exactly which steps were applied
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netez::{AuthMethod, BlockDuration, Gateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), netez::Error> {
//!     let gateway = Gateway::builder()
//!         .index_path("blocked.json")
//!         .build();
//!
//!     gateway
//!         .connect("192.168.88.1", 22, "admin", AuthMethod::password("secret"))
//!         .await?;
//!
//!     gateway.set_interface_enabled("ether2", true).await?;
//!     let block = gateway
//!         .block_domain("example.com", None, BlockDuration::Permanent)
//!         .await?;
//!     println!("blocked as {}", block.id);
//!
//!     gateway.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod config;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod index;
pub mod parser;
pub mod platform;
pub mod resources;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::GatewayConfig;
pub use driver::{ConnectResult, ConnectionState};
pub use error::{Error, FailureCause, PartialSuccess, Result, ValidationError};
pub use gateway::{Gateway, GatewayBuilder};
pub use index::{BlockDuration, BlockIndex, BlockedSiteEntry};
pub use parser::Record;
pub use resources::{ResourceKind, ResourceRef};
pub use transport::{AuthMethod, HostKeyVerification, SshConfig};
