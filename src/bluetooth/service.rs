//! Connection service: the single writer for Bluetooth state.
//!
//! All mutating work runs on one worker task that drains a bounded command
//! queue in submission order. Bus notifications are observed on a separate
//! bridge task which only wakes discovery waiters and enqueues loopback
//! syncs; it never touches the stack or the service state directly.

use std::{
   collections::{HashMap, HashSet},
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use futures::StreamExt;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{
   audio::{AudioRouter, sink_prefix},
   bluetooth::{
      bus::{BusClient, BusEvent, BusEventStream, DeviceView, Snapshot},
      handshake::Handshake,
      planner::{AllocationDecision, PlanStatus, connect_one_plan},
      scan::ScanCoordinator,
   },
   config::Config,
   error::{Result, SyncSonicError},
   event::{EventSender, Phase, StatusEvent},
};

/// How long shutdown waits for the worker to finish its current command.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Work items for the connection worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
   ConnectOne {
      mac: Address,
      friendly_name: SmolStr,
      allowed: Vec<Address>,
   },
   Disconnect {
      mac: Address,
   },
   SetExpected {
      macs: Vec<Address>,
      replace: bool,
   },
   LoopbackSync {
      mac: Address,
      connected: bool,
   },
   SetLatency {
      mac: Address,
      latency_ms: u32,
   },
   SetVolume {
      mac: Address,
      volume: u8,
      balance: f32,
   },
   SetMute {
      mac: Address,
      mute: bool,
   },
}

/// Cloneable, thread-safe entry point for submitting commands.
#[derive(Clone)]
pub struct ServiceHandle {
   inbox: mpsc::Sender<Command>,
}

impl ServiceHandle {
   pub async fn submit(&self, command: Command) -> Result<()> {
      self
         .inbox
         .send(command)
         .await
         .map_err(|_| SyncSonicError::ServiceShutdown)
   }

   pub async fn connect_one(
      &self,
      mac: Address,
      friendly_name: impl Into<SmolStr>,
      allowed: Vec<Address>,
   ) -> Result<()> {
      self
         .submit(Command::ConnectOne {
            mac,
            friendly_name: friendly_name.into(),
            allowed,
         })
         .await
   }

   pub async fn disconnect(&self, mac: Address) -> Result<()> {
      self.submit(Command::Disconnect { mac }).await
   }

   pub async fn set_expected(&self, macs: Vec<Address>, replace: bool) -> Result<()> {
      self.submit(Command::SetExpected { macs, replace }).await
   }
}

/// Running connection service: the worker plus the bus event bridge.
pub struct ConnectionService {
   handle: ServiceHandle,
   shutdown: Arc<AtomicBool>,
   worker: JoinHandle<()>,
   bridge: JoinHandle<()>,
}

impl ConnectionService {
   pub async fn start(
      bus: Arc<dyn BusClient>,
      audio: Arc<dyn AudioRouter>,
      events: EventSender,
      config: Config,
   ) -> Result<Self> {
      let (inbox, commands) = mpsc::channel(config.command_queue_size.max(1));
      let handle = ServiceHandle { inbox };
      let scan = Arc::new(ScanCoordinator::new(bus.clone()));
      let expected = Arc::new(RwLock::new(HashSet::new()));
      let shutdown = Arc::new(AtomicBool::new(false));

      let stream = bus.events().await?;
      let bridge = tokio::spawn(run_event_bridge(
         stream,
         scan.clone(),
         expected.clone(),
         handle.clone(),
      ));

      let worker = Worker {
         handshake: Handshake::new(bus.clone(), scan, events.clone(), &config),
         bus,
         audio,
         events,
         expected,
         loopbacks: HashSet::new(),
         latencies: HashMap::new(),
         poll: config.worker_poll(),
         default_latency: config.loopback_latency_ms,
      };
      let worker = tokio::spawn(worker.run(commands, shutdown.clone()));

      Ok(Self {
         handle,
         shutdown,
         worker,
         bridge,
      })
   }

   pub fn handle(&self) -> ServiceHandle {
      self.handle.clone()
   }

   /// Stops the bridge and lets the worker finish its current command.
   pub async fn shutdown(self) {
      self.shutdown.store(true, Ordering::Release);
      self.bridge.abort();
      if time::timeout(SHUTDOWN_GRACE, self.worker).await.is_err() {
         warn!("Connection worker did not stop within {SHUTDOWN_GRACE:?}");
      }
   }
}

/// Forwards bus notifications into the worker queue.
async fn run_event_bridge(
   mut stream: BusEventStream,
   scan: Arc<ScanCoordinator>,
   expected: Arc<RwLock<HashSet<Address>>>,
   handle: ServiceHandle,
) {
   while let Some(event) = stream.next().await {
      match event {
         BusEvent::DeviceAdded { adapter, device } => {
            debug!("Device {device} added on {adapter}");
            scan.notify_device_added();
         },
         BusEvent::ConnectionChanged {
            adapter,
            device,
            connected,
         } => {
            if !expected.read().contains(&device) {
               continue;
            }
            debug!("Expected speaker {device} on {adapter}: connected={connected}");
            if handle
               .submit(Command::LoopbackSync {
                  mac: device,
                  connected,
               })
               .await
               .is_err()
            {
               break;
            }
         },
      }
   }
   debug!("Bus event bridge stopped");
}

struct Worker {
   bus: Arc<dyn BusClient>,
   audio: Arc<dyn AudioRouter>,
   events: EventSender,
   handshake: Handshake,
   /// Written only here; the bridge reads it to filter notifications.
   expected: Arc<RwLock<HashSet<Address>>>,
   /// Speakers with an active audio route.
   loopbacks: HashSet<Address>,
   latencies: HashMap<Address, u32>,
   poll: Duration,
   default_latency: u32,
}

impl Worker {
   async fn run(mut self, mut commands: mpsc::Receiver<Command>, shutdown: Arc<AtomicBool>) {
      info!("Connection worker started");
      while !shutdown.load(Ordering::Acquire) {
         match time::timeout(self.poll, commands.recv()).await {
            Ok(Some(command)) => self.handle_command(command).await,
            Ok(None) => break,
            Err(_) => {},
         }
      }
      info!("Connection worker stopped");
   }

   fn emit(&self, event: StatusEvent) {
      self.events.emit(event);
   }

   async fn handle_command(&mut self, command: Command) {
      match command {
         Command::SetExpected { macs, replace } => self.set_expected(macs, replace),
         Command::ConnectOne {
            mac,
            friendly_name,
            allowed,
         } => self.connect_one(mac, &friendly_name, &allowed).await,
         Command::Disconnect { mac } => self.disconnect_everywhere(mac).await,
         Command::LoopbackSync { mac, connected } => self.sync_loopback(mac, connected).await,
         Command::SetLatency { mac, latency_ms } => self.set_latency(mac, latency_ms).await,
         Command::SetVolume {
            mac,
            volume,
            balance,
         } => {
            let phase = if self.audio.set_volume(mac, volume, balance).await {
               Phase::VolumeSet
            } else {
               Phase::AudioFailed
            };
            self.emit(StatusEvent::new(mac, phase));
         },
         Command::SetMute { mac, mute } => {
            let phase = if self.audio.set_mute(mac, mute).await {
               Phase::MuteSet
            } else {
               Phase::AudioFailed
            };
            self.emit(StatusEvent::new(mac, phase));
         },
      }
   }

   fn set_expected(&mut self, macs: Vec<Address>, replace: bool) {
      let mut expected = self.expected.write();
      if replace {
         expected.clear();
      }
      expected.extend(macs);
      info!("Expected speakers now {} entries", expected.len());
   }

   async fn connect_one(&mut self, mac: Address, name: &str, allowed: &[Address]) {
      info!("Connect request for {name} ({mac})");
      self.expected.write().insert(mac);

      let snapshot = match self.bus.snapshot().await {
         Ok(snapshot) => snapshot,
         Err(e) => {
            error!("Could not read Bluetooth state: {e}");
            self.emit(StatusEvent::new(mac, Phase::PlanningFailed).with_detail(e.to_string()));
            return;
         },
      };

      let decision = connect_one_plan(mac, allowed, &snapshot);
      info!(
         "Plan for {mac}: {:?} on {:?}, {} eviction(s)",
         decision.status,
         decision.controller,
         decision.evict.len()
      );
      self.apply_evictions(mac, &decision, &snapshot).await;

      let adapter = decision
         .controller
         .and_then(|c| snapshot.adapter(c))
         .cloned();
      match (decision.status, adapter) {
         (PlanStatus::AlreadyConnected, Some(adapter)) => {
            self.handshake.request_audio_profile(&adapter, mac).await;
            self.finish_link(mac).await;
         },
         (PlanStatus::NeedsConnection, Some(adapter)) => {
            match self.handshake.run(&adapter, mac).await {
               Ok(()) => self.finish_link(mac).await,
               Err(e) => self.report_handshake_error(mac, &e),
            }
         },
         (PlanStatus::Error, _) => {
            warn!("No controller available for {mac}");
            self.emit(StatusEvent::new(mac, Phase::NoController));
         },
         (_, None) => {
            error!("Planned controller for {mac} missing from snapshot");
            self.emit(
               StatusEvent::new(mac, Phase::PlanningFailed).with_detail("controller vanished"),
            );
         },
      }
   }

   async fn apply_evictions(&mut self, target: Address, decision: &AllocationDecision, snapshot: &Snapshot) {
      if decision.evict.is_empty() {
         return;
      }
      let mut evicted: SmallVec<[Address; 4]> = SmallVec::new();
      for eviction in &decision.evict {
         let Some(adapter) = snapshot.adapter(eviction.controller) else {
            warn!("Eviction adapter {} not found", eviction.controller);
            continue;
         };
         info!("Evicting {} from {}", eviction.device, adapter.name);
         if let Err(e) = self.bus.disconnect(adapter, eviction.device).await {
            warn!("Failed to evict {} from {}: {e}", eviction.device, adapter.name);
         }
         self.emit(
            StatusEvent::new(eviction.device, Phase::Evicted).with_detail(adapter.address.to_string()),
         );
         if !evicted.contains(&eviction.device) {
            evicted.push(eviction.device);
         }
      }

      // Routes follow the device, not the link: keep them while any link remains.
      let after = match self.bus.snapshot().await {
         Ok(after) => Some(after),
         Err(e) => {
            warn!("Could not re-read Bluetooth state after evictions: {e}");
            None
         },
      };
      for device in evicted {
         let linked = match &after {
            Some(after) => after.is_linked(device),
            None => device == target && decision.status == PlanStatus::AlreadyConnected,
         };
         if linked {
            debug!("{device} still linked elsewhere, keeping its route");
         } else {
            self.drop_loopback(device).await;
         }
      }
   }

   async fn finish_link(&mut self, mac: Address) {
      if self.ensure_loopback(mac).await {
         info!("{mac} connected with audio route");
         self.emit(StatusEvent::new(mac, Phase::ConnectSuccess));
      } else {
         warn!("{mac} connected but loopback creation failed");
         self.emit(StatusEvent::new(mac, Phase::LoopbackFailed));
      }
   }

   fn report_handshake_error(&self, mac: Address, err: &SyncSonicError) {
      warn!("Failed to connect {mac}: {err}");
      let phase = match err {
         SyncSonicError::DiscoveryTimeout(_) => Phase::DiscoveryTimeout,
         _ => Phase::HandshakeFailed,
      };
      self.emit(StatusEvent::new(mac, phase).with_detail(err.to_string()));
   }

   async fn disconnect_everywhere(&mut self, mac: Address) {
      self.expected.write().remove(&mac);

      let mut failed = None;
      match self.bus.snapshot().await {
         Ok(snapshot) => {
            for adapter in snapshot.connected_adapters(mac) {
               info!("Disconnecting {mac} from {}", adapter.name);
               if let Err(e) = self.bus.disconnect(adapter, mac).await {
                  warn!("Failed to disconnect {mac} from {}: {e}", adapter.name);
                  failed = Some(e.to_string());
               }
            }
         },
         Err(e) => failed = Some(e.to_string()),
      }
      self.drop_loopback(mac).await;

      match failed {
         None => self.emit(StatusEvent::new(mac, Phase::Disconnected)),
         Some(detail) => {
            self.emit(StatusEvent::new(mac, Phase::DisconnectFailed).with_detail(detail));
         },
      }
   }

   /// Reconciles the route with the device's links across all adapters.
   /// Bus notifications are per adapter, so the reported flag only stands
   /// in when the stack cannot be read.
   async fn sync_loopback(&mut self, mac: Address, reported: bool) {
      if !self.expected.read().contains(&mac) {
         debug!("Ignoring loopback sync for unexpected {mac}");
         return;
      }
      let connected = match self.bus.snapshot().await {
         Ok(snapshot) => snapshot.is_linked(mac),
         Err(e) => {
            warn!("Could not read Bluetooth state for {mac}, trusting signal: {e}");
            reported
         },
      };
      if connected != reported {
         debug!("Signal for {mac} (connected={reported}) superseded by live state");
      }
      if connected && !self.loopbacks.contains(&mac) {
         if self.ensure_loopback(mac).await {
            info!("Loopback provisioned for {mac}");
         }
      } else if !connected && self.loopbacks.contains(&mac) {
         self.drop_loopback(mac).await;
         info!("Loopback removed after disconnect of {mac}");
      }
   }

   async fn set_latency(&mut self, mac: Address, latency_ms: u32) {
      self.latencies.insert(mac, latency_ms);
      let ok = !self.loopbacks.contains(&mac)
         || self.audio.create_loopback(&sink_prefix(mac), latency_ms).await;
      let phase = if ok { Phase::LatencySet } else { Phase::AudioFailed };
      self.emit(StatusEvent::new(mac, phase).with_detail(format!("{latency_ms} ms")));
   }

   async fn ensure_loopback(&mut self, mac: Address) -> bool {
      if self.loopbacks.contains(&mac) {
         return true;
      }
      let latency = self
         .latencies
         .get(&mac)
         .copied()
         .unwrap_or(self.default_latency);
      if self.audio.create_loopback(&sink_prefix(mac), latency).await {
         self.loopbacks.insert(mac);
         true
      } else {
         false
      }
   }

   async fn drop_loopback(&mut self, mac: Address) {
      if self.loopbacks.remove(&mac) {
         self.audio.remove_loopback(mac).await;
      }
   }
}

/// Paired speakers available for listing, read from a fresh snapshot.
pub async fn paired_devices(bus: &dyn BusClient) -> Result<Vec<DeviceView>> {
   let snapshot = bus.snapshot().await?;
   Ok(snapshot.paired_speakers().cloned().collect())
}
