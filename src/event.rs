//! Status notifications for connection progress.
//!
//! Every connect/disconnect command reports its progress as a series of
//! phase events and finishes with exactly one terminal event per device.

use std::sync::Arc;

use bluer::Address;
use serde_json::json;
use smol_str::SmolStr;

/// Phases reported while driving a speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
   // Progress
   Evicted,
   FsmStart,
   FsmState,
   DiscoveryStart,
   DiscoveryComplete,
   PairingStart,
   PairingSuccess,
   PairingFailed,
   Trusting,
   ConnectStart,
   ConnectFailed,

   // Terminal
   ConnectSuccess,
   LoopbackFailed,
   NoController,
   DiscoveryTimeout,
   HandshakeFailed,
   PlanningFailed,
   Disconnected,
   DisconnectFailed,
   LatencySet,
   VolumeSet,
   MuteSet,
   AudioFailed,
}

impl Phase {
   /// Terminal phases close out a command for a device.
   pub const fn is_terminal(self) -> bool {
      !matches!(
         self,
         Self::Evicted
            | Self::FsmStart
            | Self::FsmState
            | Self::DiscoveryStart
            | Self::DiscoveryComplete
            | Self::PairingStart
            | Self::PairingSuccess
            | Self::PairingFailed
            | Self::Trusting
            | Self::ConnectStart
            | Self::ConnectFailed
      )
   }

   pub const fn is_failure(self) -> bool {
      matches!(
         self,
         Self::PairingFailed
            | Self::ConnectFailed
            | Self::LoopbackFailed
            | Self::NoController
            | Self::DiscoveryTimeout
            | Self::HandshakeFailed
            | Self::PlanningFailed
            | Self::DisconnectFailed
            | Self::AudioFailed
      )
   }
}

/// A single status notification for one device.
#[derive(Debug, Clone)]
pub struct StatusEvent {
   pub device: Address,
   pub phase: Phase,
   pub attempt: Option<u32>,
   pub detail: Option<SmolStr>,
}

impl StatusEvent {
   pub const fn new(device: Address, phase: Phase) -> Self {
      Self {
         device,
         phase,
         attempt: None,
         detail: None,
      }
   }

   pub const fn with_attempt(mut self, attempt: u32) -> Self {
      self.attempt = Some(attempt);
      self
   }

   pub fn with_detail(mut self, detail: impl Into<SmolStr>) -> Self {
      self.detail = Some(detail.into());
      self
   }

   pub fn to_json(&self) -> serde_json::Value {
      let mut value = json!({
         "phase": self.phase.to_string(),
         "device": self.device.to_string(),
         "error": self.phase.is_failure(),
      });
      if let Some(attempt) = self.attempt {
         value["attempt"] = json!(attempt);
      }
      if let Some(detail) = &self.detail {
         value["detail"] = json!(detail.as_str());
      }
      value
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: StatusEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
