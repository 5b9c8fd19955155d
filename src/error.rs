//! Error types for the speaker orchestration service.
//!
//! This module defines all error types that can occur while planning,
//! pairing and routing speakers, including Bluetooth, D-Bus, I/O and
//! configuration errors.

use bluer::Address;
use thiserror::Error;

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum SyncSonicError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Operation already in progress")]
   InProgress,

   #[error("Device {0} did not appear during discovery")]
   DiscoveryTimeout(Address),

   #[error("Handshake with {0} failed after exhausting retries")]
   HandshakeExhausted(Address),

   #[error("Service has been shut down")]
   ServiceShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Reserved adapter not configured (set RESERVED_HCI)")]
   ReservedAdapterUnset,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl SyncSonicError {
   /// Whether this is a benign "operation already in progress" race reported
   /// by the Bluetooth stack.
   pub fn is_in_progress(&self) -> bool {
      match self {
         Self::InProgress => true,
         Self::Bluetooth(e) => matches!(e.kind, bluer::ErrorKind::InProgress),
         _ => false,
      }
   }

   /// Whether the stack refused because the requested state already holds
   /// (already paired, already connected).
   pub fn is_already_done(&self) -> bool {
      matches!(
         self,
         Self::Bluetooth(e) if matches!(
            e.kind,
            bluer::ErrorKind::AlreadyExists | bluer::ErrorKind::AlreadyConnected
         )
      )
   }
}

/// Convenience type alias for Results with `SyncSonicError`.
pub type Result<T> = std::result::Result<T, SyncSonicError>;
