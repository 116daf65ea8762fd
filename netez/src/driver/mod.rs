//! Command execution layer.
//!
//! The driver layer owns the session lifecycle ([`ConnectionManager`]),
//! builds command lines safely ([`Command`]) and runs them one at a time
//! ([`Executor`]), classifying device failures.

pub mod command;
mod executor;
mod result;
mod session;

pub use command::{Command, CommandBuilder, ItemId, Value};
pub use executor::Executor;
pub use result::CommandResult;
pub use session::{ConnectResult, ConnectionManager, ConnectionState, Session, SessionGuard};
