//! SyncSonic speaker orchestration daemon.
//!
//! Connects several Bluetooth speakers at once, one per adapter, keeps an
//! audio loopback per connected speaker and exposes the whole thing as a
//! D-Bus object.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use audio::pulse::PulseRouter;
use bluetooth::{bluez::BluerBus, service::ConnectionService};
use dbus::SyncSonicService;
use event::{EventBus, StatusEvent};

mod audio;
mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;

use crate::{dbus::SyncSonicServiceSignals, error::Result};

const OBJECT_PATH: &str = "/org/syncsonic/manager";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting SyncSonic speaker service...");

   let config = config::Config::load()?;
   let reserved = config.require_reserved_adapter()?.to_string();
   info!("Reserved adapter: {reserved}");

   let bus = Arc::new(BluerBus::new(reserved).await?);

   let router = Arc::new(PulseRouter::new(&config));
   if !router.setup().await {
      warn!("Audio routing unavailable, speakers will connect without loopbacks");
   }

   let event_bus = EventProcessor::new();

   let service = ConnectionService::start(bus.clone(), router, event_bus.clone(), config).await?;

   let connection = connection::Builder::session()?
      .name("org.syncsonic")?
      .serve_at(OBJECT_PATH, SyncSonicService::new(service.handle(), bus))?
      .build()
      .await?;

   info!("SyncSonic D-Bus service started at org.syncsonic");

   event_bus.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down SyncSonic service...");
   service.shutdown().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<StatusEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<StatusEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<SyncSonicService>, event: StatusEvent) -> Result<()> {
      let phase: &'static str = event.phase.into();
      iface
         .connection_status(
            &event.device.to_string(),
            phase,
            &event.to_json().to_string(),
         )
         .await?;
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, SyncSonicService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching status event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: StatusEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
