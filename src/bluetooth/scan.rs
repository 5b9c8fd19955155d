//! Discovery coordination across concurrent callers.
//!
//! BlueZ keeps a single discovery session per adapter, so discovery is
//! reference counted here: the first caller starts it, the last one to
//! release stops it. Callers waiting for a device block on a notification
//! raised by device-added bus events instead of polling.

use std::{collections::HashMap, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   sync::{Mutex, Notify},
   time::{self, Instant},
};

use crate::{
   bluetooth::bus::{AdapterView, BusClient, DeviceView},
   error::Result,
};

pub struct ScanCoordinator {
   bus: Arc<dyn BusClient>,
   refcounts: Mutex<HashMap<Address, u32>>,
   device_added: Notify,
}

impl ScanCoordinator {
   pub fn new(bus: Arc<dyn BusClient>) -> Self {
      Self {
         bus,
         refcounts: Mutex::new(HashMap::new()),
         device_added: Notify::new(),
      }
   }

   /// Takes a discovery reference on `adapter`, starting discovery if this
   /// is the first one.
   pub async fn ensure_discovery(&self, adapter: &AdapterView) -> Result<()> {
      let mut counts = self.refcounts.lock().await;
      let count = counts.entry(adapter.address).or_insert(0);
      if *count == 0 {
         match self.bus.start_discovery(adapter).await {
            Ok(()) => info!("Discovery started on {}", adapter.name),
            Err(e) if e.is_in_progress() => {
               debug!("Discovery already running on {}", adapter.name);
            },
            Err(e) => return Err(e),
         }
      }
      *count += 1;
      Ok(())
   }

   /// Drops a discovery reference; discovery stops with the last one.
   pub async fn release_discovery(&self, adapter: &AdapterView) -> Result<()> {
      let mut counts = self.refcounts.lock().await;
      let Some(count) = counts.get_mut(&adapter.address) else {
         return Ok(());
      };
      if *count == 0 {
         warn!("Unbalanced discovery release on {}", adapter.name);
         return Ok(());
      }
      *count -= 1;
      if *count == 0 {
         counts.remove(&adapter.address);
         match self.bus.stop_discovery(adapter).await {
            Ok(()) => info!("Discovery stopped on {}", adapter.name),
            Err(e) if e.is_in_progress() => {
               debug!("StopDiscovery on {} ignored, stack busy", adapter.name);
            },
            Err(e) => return Err(e),
         }
      }
      Ok(())
   }

   /// Current reference count for an adapter.
   pub async fn discovery_refs(&self, adapter: Address) -> u32 {
      self.refcounts.lock().await.get(&adapter).copied().unwrap_or(0)
   }

   /// Wakes every waiter so it can re-check the device list.
   pub fn notify_device_added(&self) {
      self.device_added.notify_waiters();
   }

   /// Blocks until `device` shows up under `adapter` or `timeout` elapses.
   pub async fn wait_for_device(
      &self,
      adapter: &AdapterView,
      device: Address,
      timeout: Duration,
   ) -> Result<Option<DeviceView>> {
      let deadline = Instant::now() + timeout;
      loop {
         let notified = self.device_added.notified();
         tokio::pin!(notified);
         // Register before checking so an event between check and wait is not lost.
         notified.as_mut().enable();

         let snapshot = self.bus.snapshot().await?;
         if let Some(found) = snapshot.device_on(adapter.address, device) {
            return Ok(Some(found.clone()));
         }

         let now = Instant::now();
         if now >= deadline {
            debug!("Gave up waiting for {device} on {}", adapter.name);
            return Ok(None);
         }
         let _ = time::timeout(deadline - now, notified).await;
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::bluetooth::testing::{FakeBus, Op, addr, hci};

   #[tokio::test]
   async fn discovery_is_reference_counted() {
      let bus = FakeBus::with_adapters(2);
      let scan = ScanCoordinator::new(bus.clone());
      let adapter = bus.adapter_view(1);

      scan.ensure_discovery(&adapter).await.unwrap();
      scan.ensure_discovery(&adapter).await.unwrap();
      assert_eq!(scan.discovery_refs(adapter.address).await, 2);

      scan.release_discovery(&adapter).await.unwrap();
      assert_eq!(bus.count(|op| matches!(op, Op::StopDiscovery(_))), 0);
      scan.release_discovery(&adapter).await.unwrap();

      assert_eq!(bus.count(|op| matches!(op, Op::StartDiscovery(_))), 1);
      assert_eq!(bus.count(|op| matches!(op, Op::StopDiscovery(_))), 1);
      assert_eq!(scan.discovery_refs(adapter.address).await, 0);
   }

   #[tokio::test]
   async fn in_progress_races_are_tolerated() {
      let bus = FakeBus::with_adapters(1);
      bus.state().discovery_in_progress = true;
      let scan = ScanCoordinator::new(bus.clone());
      let adapter = bus.adapter_view(1);

      scan.ensure_discovery(&adapter).await.unwrap();
      assert_eq!(scan.discovery_refs(adapter.address).await, 1);
      scan.release_discovery(&adapter).await.unwrap();
      assert_eq!(scan.discovery_refs(adapter.address).await, 0);
   }

   #[tokio::test]
   async fn unbalanced_release_is_ignored() {
      let bus = FakeBus::with_adapters(1);
      let scan = ScanCoordinator::new(bus.clone());
      let adapter = bus.adapter_view(1);

      scan.release_discovery(&adapter).await.unwrap();
      assert_eq!(bus.count(|op| matches!(op, Op::StopDiscovery(_))), 0);
   }

   #[tokio::test]
   async fn device_already_present_returns_immediately() {
      let bus = FakeBus::with_adapters(1);
      let speaker = addr("00:00:00:00:00:0A");
      bus.add_device(hci(1), speaker, |_| {});
      let scan = ScanCoordinator::new(bus.clone());

      let found = scan
         .wait_for_device(&bus.adapter_view(1), speaker, Duration::from_secs(1))
         .await
         .unwrap();
      assert_eq!(found.map(|d| d.address), Some(speaker));
   }

   #[tokio::test(start_paused = true)]
   async fn waiter_wakes_on_device_added() {
      let bus = FakeBus::with_adapters(1);
      let scan = Arc::new(ScanCoordinator::new(bus.clone()));
      let speaker = addr("00:00:00:00:00:0A");
      let adapter = bus.adapter_view(1);

      let waiter = {
         let scan = scan.clone();
         let adapter = adapter.clone();
         tokio::spawn(async move {
            scan
               .wait_for_device(&adapter, speaker, Duration::from_secs(20))
               .await
         })
      };

      time::sleep(Duration::from_secs(3)).await;
      bus.add_device(hci(1), speaker, |_| {});
      scan.notify_device_added();

      let found = waiter.await.unwrap().unwrap();
      assert_eq!(found.map(|d| d.adapter), Some(adapter.address));
   }

   #[tokio::test(start_paused = true)]
   async fn wait_times_out() {
      let bus = FakeBus::with_adapters(2);
      let scan = ScanCoordinator::new(bus.clone());
      let speaker = addr("00:00:00:00:00:0A");
      // Visible on another adapter only.
      bus.add_device(hci(2), speaker, |_| {});

      let started = Instant::now();
      let found = scan
         .wait_for_device(&bus.adapter_view(1), speaker, Duration::from_secs(20))
         .await
         .unwrap();
      assert!(found.is_none());
      assert!(started.elapsed() >= Duration::from_secs(20));
   }
}
