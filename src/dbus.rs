use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::info;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   bluetooth::{
      bluez::BluerBus,
      bus::DeviceView,
      service::{Command, ServiceHandle, paired_devices},
   },
   error::SyncSonicError,
};

pub struct SyncSonicService {
   handle: ServiceHandle,
   bus: Arc<BluerBus>,
}

impl SyncSonicService {
   pub const fn new(handle: ServiceHandle, bus: Arc<BluerBus>) -> Self {
      Self { handle, bus }
   }

   async fn submit(&self, command: Command) -> zbus::fdo::Result<bool> {
      self.handle.submit(command).await.map_err(to_fdo)?;
      Ok(true)
   }
}

fn parse_mac(address: &str) -> zbus::fdo::Result<Address> {
   Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{address}: {e}")))
}

fn parse_macs(addresses: &[String]) -> zbus::fdo::Result<Vec<Address>> {
   addresses.iter().map(|a| parse_mac(a)).collect()
}

fn to_fdo(err: SyncSonicError) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(err.to_string())
}

fn device_json(device: &DeviceView) -> serde_json::Value {
   json!({
      "address": device.address.to_string(),
      "name": device.display_name(),
      "adapter": device.adapter.to_string(),
      "connected": device.connected,
   })
}

#[interface(name = "org.syncsonic.Manager")]
impl SyncSonicService {
   /// Queues a connect for `address`; `allowed` lists every speaker in the
   /// current configuration. Progress arrives as `ConnectionStatus` signals.
   async fn connect_one(
      &self,
      address: String,
      name: String,
      allowed: Vec<String>,
   ) -> zbus::fdo::Result<bool> {
      let mac = parse_mac(&address)?;
      let mut allowed = parse_macs(&allowed)?;
      if !allowed.contains(&mac) {
         allowed.push(mac);
      }
      info!("ConnectOne {name} ({mac}) with {} allowed", allowed.len());
      self
         .handle
         .connect_one(mac, name, allowed)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<bool> {
      let mac = parse_mac(&address)?;
      self.handle.disconnect(mac).await.map_err(to_fdo)?;
      Ok(true)
   }

   async fn set_expected(&self, addresses: Vec<String>, replace: bool) -> zbus::fdo::Result<bool> {
      let macs = parse_macs(&addresses)?;
      self
         .handle
         .set_expected(macs, replace)
         .await
         .map_err(to_fdo)?;
      Ok(true)
   }

   async fn set_latency(&self, address: String, latency_ms: u32) -> zbus::fdo::Result<bool> {
      let mac = parse_mac(&address)?;
      self.submit(Command::SetLatency { mac, latency_ms }).await
   }

   async fn set_volume(
      &self,
      address: String,
      volume: u8,
      balance: f64,
   ) -> zbus::fdo::Result<bool> {
      let mac = parse_mac(&address)?;
      if !(0.0..=1.0).contains(&balance) {
         return Err(zbus::fdo::Error::InvalidArgs(format!(
            "Balance {balance} outside 0.0..=1.0"
         )));
      }
      self
         .submit(Command::SetVolume {
            mac,
            volume,
            balance: balance as f32,
         })
         .await
   }

   async fn set_mute(&self, address: String, mute: bool) -> zbus::fdo::Result<bool> {
      let mac = parse_mac(&address)?;
      self.submit(Command::SetMute { mac, mute }).await
   }

   /// JSON array of paired speakers on non-reserved adapters.
   async fn paired_devices(&self) -> zbus::fdo::Result<String> {
      let devices = paired_devices(self.bus.as_ref()).await.map_err(to_fdo)?;
      let devices: Vec<_> = devices.iter().map(device_json).collect();
      Ok(serde_json::Value::Array(devices).to_string())
   }

   #[zbus(signal)]
   pub async fn connection_status(
      emitter: &SignalEmitter<'_>,
      address: &str,
      phase: &str,
      payload: &str,
   ) -> zbus::Result<()>;
}
