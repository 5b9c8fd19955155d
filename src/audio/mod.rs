//! Audio routing for connected speakers.
//!
//! Each connected speaker receives a loopback from the shared virtual sink's
//! monitor to its own Bluetooth sink. All operations are best-effort and
//! idempotent; they may be called before the speaker's sink exists.

use async_trait::async_trait;
use bluer::Address;

pub mod pulse;

/// Audio routing collaborator.
#[async_trait]
pub trait AudioRouter: Send + Sync {
   /// Waits for a sink whose name starts with `sink_prefix` and routes the
   /// virtual sink into it, replacing any existing route.
   async fn create_loopback(&self, sink_prefix: &str, latency_ms: u32) -> bool;

   /// Removes every route into the device's sink.
   async fn remove_loopback(&self, device: Address);

   /// Sets volume (percent) with left/right balance in `0.0..=1.0`.
   async fn set_volume(&self, device: Address, volume: u8, balance: f32) -> bool;

   async fn set_mute(&self, device: Address, mute: bool) -> bool;
}

/// Prefix of the sink the audio server creates for a Bluetooth device.
pub fn sink_prefix(device: Address) -> String {
   format!("bluez_sink.{}", device.to_string().replace(':', "_"))
}
