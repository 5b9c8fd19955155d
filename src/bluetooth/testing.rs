//! In-memory doubles for the Bluetooth stack, the audio router and the
//! notification channel.

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use bluer::Address;
use futures::{
   StreamExt,
   channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
   stream,
};
use parking_lot::{Mutex, MutexGuard};
use smol_str::SmolStr;
use tokio::{sync::Notify, time};
use uuid::Uuid;

use crate::{
   audio::{AudioRouter, sink_prefix},
   bluetooth::bus::{
      AUDIO_SINK_UUID, AdapterView, BusClient, BusEvent, BusEventStream, DeviceView, Snapshot,
   },
   error::{Result, SyncSonicError},
   event::{EventBus, Phase, StatusEvent},
};

pub fn addr(s: &str) -> Address {
   s.parse().unwrap()
}

/// Address of fake adapter `hci{index}`; `hci0` is the reserved one.
pub fn hci(index: u8) -> Address {
   Address::new([0xC0, 0, 0, 0, 0, index])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
   StartDiscovery(Address),
   StopDiscovery(Address),
   Pair(Address, Address),
   Trust(Address, Address),
   Connect(Address, Address),
   ConnectProfile(Address, Address),
   Disconnect(Address, Address),
   RemoveDevice(Address, Address),
}

#[derive(Default)]
pub struct FakeState {
   pub adapters: Vec<AdapterView>,
   pub devices: Vec<DeviceView>,
   pub ops: Vec<Op>,
   /// Devices that show up under an adapter once it starts discovery.
   pub in_range: HashSet<Address>,
   pub discovery_in_progress: bool,
   pub pair_failures: HashMap<Address, u32>,
   pub connect_failures: HashMap<Address, u32>,
   /// Set when two mutating calls were ever in flight at once.
   pub overlapped: bool,
}

pub struct FakeBus {
   state: Mutex<FakeState>,
   busy: AtomicBool,
   op_delay: Duration,
   events_tx: UnboundedSender<BusEvent>,
   events_rx: Mutex<Option<UnboundedReceiver<BusEvent>>>,
}

impl FakeBus {
   /// `hci0` (reserved) plus `count` speaker adapters `hci1..=hci{count}`.
   pub fn with_adapters(count: u8) -> Arc<Self> {
      Self::build(count, Duration::ZERO)
   }

   /// Like [`Self::with_adapters`] but every mutating call takes `delay`.
   pub fn with_op_delay(count: u8, delay: Duration) -> Arc<Self> {
      Self::build(count, delay)
   }

   fn build(count: u8, op_delay: Duration) -> Arc<Self> {
      let adapters = (0..=count)
         .map(|i| AdapterView {
            name: format!("hci{i}").into(),
            address: hci(i),
            powered: true,
            reserved: i == 0,
         })
         .collect();
      let (events_tx, events_rx) = unbounded();
      Arc::new(Self {
         state: Mutex::new(FakeState {
            adapters,
            ..FakeState::default()
         }),
         busy: AtomicBool::new(false),
         op_delay,
         events_tx,
         events_rx: Mutex::new(Some(events_rx)),
      })
   }

   pub fn state(&self) -> MutexGuard<'_, FakeState> {
      self.state.lock()
   }

   pub fn adapter_view(&self, index: u8) -> AdapterView {
      self
         .state
         .lock()
         .adapters
         .iter()
         .find(|a| a.address == hci(index))
         .cloned()
         .unwrap()
   }

   pub fn add_device(&self, adapter: Address, device: Address, f: impl FnOnce(&mut DeviceView)) {
      let mut view = DeviceView {
         adapter,
         address: device,
         name: None,
         paired: false,
         trusted: false,
         connected: false,
         uuids: vec![],
      };
      f(&mut view);
      self.state.lock().devices.push(view);
   }

   /// Adds a fully linked speaker.
   pub fn add_linked(&self, adapter: Address, device: Address) {
      self.add_device(adapter, device, |d| {
         d.paired = true;
         d.trusted = true;
         d.connected = true;
         d.uuids.push(AUDIO_SINK_UUID);
      });
   }

   pub fn set_in_range(&self, device: Address) {
      self.state.lock().in_range.insert(device);
   }

   pub fn is_connected(&self, adapter: Address, device: Address) -> bool {
      self
         .state
         .lock()
         .devices
         .iter()
         .any(|d| d.adapter == adapter && d.address == device && d.connected)
   }

   /// Flips a link from the speaker side, as a power cycle would, and
   /// signals it the way the stack does.
   pub fn set_connected(&self, adapter: Address, device: Address, connected: bool) {
      let name = {
         let mut state = self.state.lock();
         let name = state
            .adapters
            .iter()
            .find(|a| a.address == adapter)
            .map(|a| a.name.clone())
            .unwrap();
         Self::device_mut(&mut state, adapter, device).unwrap().connected = connected;
         name
      };
      self.report_connection(true, name, device, connected);
   }

   fn report_connection(&self, flipped: bool, adapter: SmolStr, device: Address, connected: bool) {
      if flipped {
         self.emit(BusEvent::ConnectionChanged {
            adapter,
            device,
            connected,
         });
      }
   }

   pub fn emit(&self, event: BusEvent) {
      let _ = self.events_tx.unbounded_send(event);
   }

   pub fn ops(&self) -> Vec<Op> {
      self.state.lock().ops.clone()
   }

   pub fn count(&self, f: impl Fn(&Op) -> bool) -> usize {
      self.state.lock().ops.iter().filter(|op| f(op)).count()
   }

   async fn mutate<T>(&self, op: Op, apply: impl FnOnce(&mut FakeState) -> Result<T>) -> Result<T> {
      if self.busy.swap(true, Ordering::AcqRel) {
         self.state.lock().overlapped = true;
      }
      self.state.lock().ops.push(op);
      if self.op_delay.is_zero() {
         tokio::task::yield_now().await;
      } else {
         time::sleep(self.op_delay).await;
      }
      let result = apply(&mut self.state.lock());
      self.busy.store(false, Ordering::Release);
      result
   }

   fn device_mut(state: &mut FakeState, adapter: Address, device: Address) -> Result<&mut DeviceView> {
      state
         .devices
         .iter_mut()
         .find(|d| d.adapter == adapter && d.address == device)
         .ok_or(SyncSonicError::DeviceNotFound(device))
   }
}

fn rejected(what: &str) -> SyncSonicError {
   SyncSonicError::Io(std::io::Error::other(format!("{what} rejected")))
}

#[async_trait]
impl BusClient for FakeBus {
   async fn snapshot(&self) -> Result<Snapshot> {
      let state = self.state.lock();
      Ok(Snapshot {
         adapters: state.adapters.clone(),
         devices: state.devices.clone(),
      })
   }

   async fn start_discovery(&self, adapter: &AdapterView) -> Result<()> {
      let address = adapter.address;
      let name = adapter.name.clone();
      let added = self
         .mutate(Op::StartDiscovery(address), |state| {
            if state.discovery_in_progress {
               return Err(SyncSonicError::InProgress);
            }
            let missing: Vec<Address> = state
               .in_range
               .iter()
               .copied()
               .filter(|dev| !state.devices.iter().any(|d| d.adapter == address && d.address == *dev))
               .collect();
            for device in &missing {
               state.devices.push(DeviceView {
                  adapter: address,
                  address: *device,
                  name: None,
                  paired: false,
                  trusted: false,
                  connected: false,
                  uuids: vec![AUDIO_SINK_UUID],
               });
            }
            Ok(missing)
         })
         .await?;
      for device in added {
         self.emit(BusEvent::DeviceAdded {
            adapter: name.clone(),
            device,
         });
      }
      Ok(())
   }

   async fn stop_discovery(&self, adapter: &AdapterView) -> Result<()> {
      self
         .mutate(Op::StopDiscovery(adapter.address), |state| {
            if state.discovery_in_progress {
               Err(SyncSonicError::InProgress)
            } else {
               Ok(())
            }
         })
         .await
   }

   async fn pair(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      let adapter = adapter.address;
      self
         .mutate(Op::Pair(device, adapter), |state| {
            if let Some(left) = state.pair_failures.get_mut(&device)
               && *left > 0
            {
               *left -= 1;
               return Err(rejected("pairing"));
            }
            Self::device_mut(state, adapter, device)?.paired = true;
            Ok(())
         })
         .await
   }

   async fn trust(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      let adapter = adapter.address;
      self
         .mutate(Op::Trust(device, adapter), |state| {
            Self::device_mut(state, adapter, device)?.trusted = true;
            Ok(())
         })
         .await
   }

   async fn connect(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      let name = adapter.name.clone();
      let adapter = adapter.address;
      self
         .mutate(Op::Connect(device, adapter), |state| {
            if let Some(left) = state.connect_failures.get_mut(&device)
               && *left > 0
            {
               *left -= 1;
               return Err(rejected("connection"));
            }
            let view = Self::device_mut(state, adapter, device)?;
            let flipped = !view.connected;
            view.connected = true;
            if !view.has_audio_profile() {
               view.uuids.push(AUDIO_SINK_UUID);
            }
            Ok(flipped)
         })
         .await
         .map(|flipped| self.report_connection(flipped, name, device, true))
   }

   async fn connect_profile(&self, adapter: &AdapterView, device: Address, _profile: Uuid) -> Result<()> {
      self
         .mutate(Op::ConnectProfile(device, adapter.address), |_| Ok(()))
         .await
   }

   async fn disconnect(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      let name = adapter.name.clone();
      let adapter = adapter.address;
      self
         .mutate(Op::Disconnect(device, adapter), |state| {
            let view = Self::device_mut(state, adapter, device)?;
            let flipped = view.connected;
            view.connected = false;
            Ok(flipped)
         })
         .await
         .map(|flipped| self.report_connection(flipped, name, device, false))
   }

   async fn remove_device(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      let adapter = adapter.address;
      self
         .mutate(Op::RemoveDevice(device, adapter), |state| {
            state
               .devices
               .retain(|d| !(d.adapter == adapter && d.address == device));
            Ok(())
         })
         .await
   }

   async fn events(&self) -> Result<BusEventStream> {
      Ok(match self.events_rx.lock().take() {
         Some(rx) => rx.boxed(),
         None => stream::pending().boxed(),
      })
   }
}

#[derive(Default)]
pub struct RouterState {
   /// Active loopbacks keyed by sink prefix, with their latency.
   pub routes: HashMap<String, u32>,
   pub created: usize,
   pub removed: usize,
   pub fail_create: bool,
   pub volumes: HashMap<Address, (u8, f32)>,
   pub mutes: HashMap<Address, bool>,
}

#[derive(Default)]
pub struct FakeRouter {
   state: Mutex<RouterState>,
}

impl FakeRouter {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn state(&self) -> MutexGuard<'_, RouterState> {
      self.state.lock()
   }

   pub fn has_route(&self, device: Address) -> bool {
      self.state.lock().routes.contains_key(&sink_prefix(device))
   }

   pub fn latency(&self, device: Address) -> Option<u32> {
      self.state.lock().routes.get(&sink_prefix(device)).copied()
   }
}

#[async_trait]
impl AudioRouter for FakeRouter {
   async fn create_loopback(&self, sink_prefix: &str, latency_ms: u32) -> bool {
      let mut state = self.state.lock();
      if state.fail_create {
         return false;
      }
      state.created += 1;
      state.routes.insert(sink_prefix.to_string(), latency_ms);
      true
   }

   async fn remove_loopback(&self, device: Address) {
      let mut state = self.state.lock();
      state.removed += 1;
      state.routes.remove(&sink_prefix(device));
   }

   async fn set_volume(&self, device: Address, volume: u8, balance: f32) -> bool {
      self.state.lock().volumes.insert(device, (volume, balance));
      true
   }

   async fn set_mute(&self, device: Address, mute: bool) -> bool {
      self.state.lock().mutes.insert(device, mute);
      true
   }
}

/// Collects every emitted status event.
#[derive(Default)]
pub struct RecordingEvents {
   events: Mutex<Vec<StatusEvent>>,
   notify: Notify,
}

impl RecordingEvents {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn phases(&self, device: Address) -> Vec<Phase> {
      self
         .events
         .lock()
         .iter()
         .filter(|e| e.device == device)
         .map(|e| e.phase)
         .collect()
   }

   pub fn terminal(&self, device: Address) -> Vec<Phase> {
      self
         .phases(device)
         .into_iter()
         .filter(|p| p.is_terminal())
         .collect()
   }

   fn terminal_count(&self) -> usize {
      self.events.lock().iter().filter(|e| e.phase.is_terminal()).count()
   }

   /// Waits until at least `count` terminal events were recorded.
   pub async fn wait_terminal(&self, count: usize) {
      let wait = async {
         loop {
            let notified = self.notify.notified();
            if self.terminal_count() >= count {
               return;
            }
            notified.await;
         }
      };
      time::timeout(Duration::from_secs(30), wait)
         .await
         .expect("timed out waiting for terminal events");
   }
}

impl EventBus for RecordingEvents {
   fn emit(&self, event: StatusEvent) {
      self.events.lock().push(event);
      self.notify.notify_waiters();
   }
}
