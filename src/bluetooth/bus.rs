//! Bus client boundary and live topology snapshots.
//!
//! The service never caches adapter or device state: every decision is
//! taken against a [`Snapshot`] read fresh from the Bluetooth stack.

use async_trait::async_trait;
use bluer::Address;
use futures::stream::BoxStream;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::error::Result;

/// Audio Sink service class (A2DP sink side of a speaker).
pub const AUDIO_SINK_UUID: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);

/// View of one adapter at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterView {
   /// HCI name, e.g. `hci1`.
   pub name: SmolStr,
   pub address: Address,
   /// Unpowered adapters cannot host a link and are left out of planning.
   pub powered: bool,
   /// Kept for the control-channel link; never used for speakers.
   pub reserved: bool,
}

impl AdapterView {
   /// Numeric index parsed from the HCI name.
   pub fn index(&self) -> Option<u16> {
      self.name.strip_prefix("hci")?.parse().ok()
   }
}

/// View of one device object under one adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceView {
   /// Address of the adapter this device object lives under.
   pub adapter: Address,
   pub address: Address,
   pub name: Option<SmolStr>,
   pub paired: bool,
   pub trusted: bool,
   pub connected: bool,
   pub uuids: Vec<Uuid>,
}

impl DeviceView {
   pub fn has_audio_profile(&self) -> bool {
      self.uuids.contains(&AUDIO_SINK_UUID)
   }

   /// Paired, trusted, connected and advertising an audio sink.
   pub fn is_fully_linked(&self) -> bool {
      self.paired && self.trusted && self.connected && self.has_audio_profile()
   }

   pub fn display_name(&self) -> String {
      self
         .name
         .as_ref()
         .map_or_else(|| self.address.to_string(), ToString::to_string)
   }
}

/// Point-in-time copy of every adapter and device known to the stack.
///
/// Iteration order is the order the stack reported objects in; the planner
/// relies on it for tie-breaking.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
   pub adapters: Vec<AdapterView>,
   pub devices: Vec<DeviceView>,
}

impl Snapshot {
   pub fn adapter(&self, address: Address) -> Option<&AdapterView> {
      self.adapters.iter().find(|a| a.address == address)
   }

   pub fn device_on(&self, adapter: Address, device: Address) -> Option<&DeviceView> {
      self
         .devices
         .iter()
         .find(|d| d.adapter == adapter && d.address == device)
   }

   /// Every adapter the device is currently connected through.
   pub fn connected_adapters(&self, device: Address) -> impl Iterator<Item = &AdapterView> + '_ {
      self
         .devices
         .iter()
         .filter(move |d| d.address == device && d.connected)
         .filter_map(|d| self.adapter(d.adapter))
   }

   /// Whether the device holds a link on any non-reserved adapter.
   pub fn is_linked(&self, device: Address) -> bool {
      self.connected_adapters(device).any(|a| !a.reserved)
   }

   /// Paired devices on adapters available to speakers.
   pub fn paired_speakers(&self) -> impl Iterator<Item = &DeviceView> + '_ {
      self.devices.iter().filter(|d| {
         d.paired && self.adapter(d.adapter).is_some_and(|a| !a.reserved)
      })
   }
}

/// Asynchronous notifications from the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
   /// A device object appeared under an adapter.
   DeviceAdded { adapter: SmolStr, device: Address },
   /// The `Connected` property of a device object changed.
   ConnectionChanged {
      adapter: SmolStr,
      device: Address,
      connected: bool,
   },
}

pub type BusEventStream = BoxStream<'static, BusEvent>;

/// Transactional access to the Bluetooth stack.
///
/// Only the connection worker may call the mutating operations; the
/// event stream is observation only.
#[async_trait]
pub trait BusClient: Send + Sync {
   async fn snapshot(&self) -> Result<Snapshot>;

   async fn start_discovery(&self, adapter: &AdapterView) -> Result<()>;
   async fn stop_discovery(&self, adapter: &AdapterView) -> Result<()>;

   async fn pair(&self, adapter: &AdapterView, device: Address) -> Result<()>;
   async fn trust(&self, adapter: &AdapterView, device: Address) -> Result<()>;
   async fn connect(&self, adapter: &AdapterView, device: Address) -> Result<()>;
   async fn connect_profile(&self, adapter: &AdapterView, device: Address, profile: Uuid)
   -> Result<()>;
   async fn disconnect(&self, adapter: &AdapterView, device: Address) -> Result<()>;
   async fn remove_device(&self, adapter: &AdapterView, device: Address) -> Result<()>;

   /// Subscribes to device-added and connection-change notifications.
   async fn events(&self) -> Result<BusEventStream>;
}

/// Splits a BlueZ object path such as `/org/bluez/hci1/dev_AA_BB_CC_DD_EE_FF`
/// into its adapter name and device address.
pub fn parse_device_path(path: &str) -> Option<(SmolStr, Address)> {
   let rest = path.strip_prefix("/org/bluez/")?;
   let (adapter, device) = rest.split_once('/')?;
   let mac = device.strip_prefix("dev_")?;
   // Nested objects (services, characteristics) are not devices.
   if mac.contains('/') {
      return None;
   }
   let address = mac.replace('_', ":").parse().ok()?;
   Some((SmolStr::new(adapter), address))
}
