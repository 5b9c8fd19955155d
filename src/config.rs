//! Configuration management for the speaker service.
//!
//! This module handles loading and saving configuration from disk,
//! including the reserved adapter and the timing parameters of the
//! connection handshake and audio routing.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncSonicError};

/// Environment variable naming the adapter reserved for the phone link.
const RESERVED_HCI_ENV: &str = "RESERVED_HCI";

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// HCI name (e.g. `hci0`) of the adapter kept for the control channel.
   #[serde(default)]
   pub reserved_adapter: Option<String>,

   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_sec: u64,

   #[serde(default = "default_handshake_attempts")]
   pub handshake_attempts: u32,

   #[serde(default = "default_retry_base_delay")]
   pub retry_base_delay_ms: u64,

   #[serde(default = "default_retry_max_delay")]
   pub retry_max_delay_ms: u64,

   #[serde(default = "default_worker_poll")]
   pub worker_poll_ms: u64,

   #[serde(default = "default_command_queue_size")]
   pub command_queue_size: usize,

   #[serde(default = "default_loopback_latency")]
   pub loopback_latency_ms: u32,

   #[serde(default = "default_sink_wait")]
   pub sink_wait_sec: u64,

   #[serde(default = "default_sink_poll")]
   pub sink_poll_ms: u64,

   #[serde(default = "default_virtual_sink")]
   pub virtual_sink: String,
}

const fn default_discovery_timeout() -> u64 {
   20
}

const fn default_handshake_attempts() -> u32 {
   3
}

const fn default_retry_base_delay() -> u64 {
   500
}

const fn default_retry_max_delay() -> u64 {
   4000
}

const fn default_worker_poll() -> u64 {
   1000
}

const fn default_command_queue_size() -> usize {
   256
}

const fn default_loopback_latency() -> u32 {
   100
}

const fn default_sink_wait() -> u64 {
   20
}

const fn default_sink_poll() -> u64 {
   500
}

fn default_virtual_sink() -> String {
   "virtual_out".to_string()
}

impl Default for Config {
   fn default() -> Self {
      Self {
         reserved_adapter: None,
         discovery_timeout_sec: default_discovery_timeout(),
         handshake_attempts: default_handshake_attempts(),
         retry_base_delay_ms: default_retry_base_delay(),
         retry_max_delay_ms: default_retry_max_delay(),
         worker_poll_ms: default_worker_poll(),
         command_queue_size: default_command_queue_size(),
         loopback_latency_ms: default_loopback_latency(),
         sink_wait_sec: default_sink_wait(),
         sink_poll_ms: default_sink_poll(),
         virtual_sink: default_virtual_sink(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let mut config = Self::load_from(&Self::config_path()?)?;
      if let Ok(reserved) = env::var(RESERVED_HCI_ENV)
         && !reserved.trim().is_empty()
      {
         config.reserved_adapter = Some(reserved.trim().to_string());
      }
      Ok(config)
   }

   /// Loads configuration from an explicit path, writing defaults if the
   /// file does not exist yet.
   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the configuration to the given path.
   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("SYNCSONIC_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(SyncSonicError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("syncsonic").join("config.toml"))
   }

   /// Returns the reserved adapter name, failing if none is configured.
   pub fn require_reserved_adapter(&self) -> Result<&str> {
      self
         .reserved_adapter
         .as_deref()
         .ok_or(SyncSonicError::ReservedAdapterUnset)
   }

   pub const fn discovery_timeout(&self) -> Duration {
      Duration::from_secs(self.discovery_timeout_sec)
   }

   pub const fn worker_poll(&self) -> Duration {
      Duration::from_millis(self.worker_poll_ms)
   }

   pub const fn sink_wait(&self) -> Duration {
      Duration::from_secs(self.sink_wait_sec)
   }

   pub const fn sink_poll(&self) -> Duration {
      Duration::from_millis(self.sink_poll_ms)
   }
}
