//! Error types for the vendor-specific HCI client.
//!
//! Errors never reach callers of the session facade. They are produced by the
//! remote service and binder implementations, logged by the session, and turned
//! into a terminal release of the session.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the vendor-specific client.
#[derive(Error, Debug)]
pub enum VsError {
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("Invalid bus name: {0}")]
   BusName(#[from] zbus::names::Error),

   #[error("Invalid object path: {0}")]
   ObjectPath(#[from] zbus::zvariant::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Invalid hex string: {0}")]
   Hex(#[from] hex::FromHexError),

   #[error("Transport error: {0}")]
   Transport(String),

   #[error("Vendor service unavailable: {0}")]
   ServiceUnavailable(SmolStr),

   #[error("Callback relay is not registered")]
   NotRegistered,

   #[error("A callback relay is already registered")]
   AlreadyRegistered,

   #[error("Invalid event filter: {0}")]
   InvalidFilter(String),

   #[error("Invalid opcode: {0}")]
   InvalidOpcode(String),

   #[error("Background task failed: {0}")]
   TaskPanicked(#[from] tokio::task::JoinError),

   #[error("Binder has been shut down")]
   BinderShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `VsError`.
pub type Result<T> = std::result::Result<T, VsError>;
