//! Controller allocation for speakers.
//!
//! Each non-reserved adapter carries at most one audio link. Given the
//! speaker to connect, the speakers in the current configuration and a
//! live snapshot, [`connect_one_plan`] decides which adapter the speaker
//! should use and which existing links have to be torn down first.

use bluer::Address;
use log::{debug, info};
use smallvec::SmallVec;

use crate::bluetooth::bus::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
   /// Target is linked on `controller`; only evictions may be needed.
   AlreadyConnected,
   /// Target must be handshaken on `controller`.
   NeedsConnection,
   /// Every adapter is held by an in-config speaker.
   Error,
}

/// A (device, adapter) link to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eviction {
   pub device: Address,
   pub controller: Address,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationDecision {
   pub status: PlanStatus,
   pub controller: Option<Address>,
   pub evict: SmallVec<[Eviction; 4]>,
}

impl AllocationDecision {
   fn new(status: PlanStatus, controller: Option<Address>, evict: SmallVec<[Eviction; 4]>) -> Self {
      Self {
         status,
         controller,
         evict,
      }
   }
}

/// Adapters each in-config speaker is linked through, in snapshot order.
#[derive(Default)]
struct SpeakerUsage(Vec<(Address, SmallVec<[Address; 2]>)>);

impl SpeakerUsage {
   fn record(&mut self, speaker: Address, controller: Address) {
      if let Some((_, controllers)) = self.0.iter_mut().find(|(s, _)| *s == speaker) {
         controllers.push(controller);
      } else {
         self.0.push((speaker, SmallVec::from_slice(&[controller])));
      }
   }

   /// First speaker holding more than one adapter, with its second adapter.
   fn first_duplicate(&self) -> Option<Eviction> {
      self.0.iter().find_map(|(speaker, controllers)| {
         controllers.get(1).map(|&controller| Eviction {
            device: *speaker,
            controller,
         })
      })
   }

   fn other_occupant(&self, target: Address, controller: Address) -> Option<Address> {
      self
         .0
         .iter()
         .find(|(s, controllers)| *s != target && controllers.contains(&controller))
         .map(|(s, _)| *s)
   }
}

/// Computes where `target` should be connected.
///
/// Pure: reads the snapshot and returns a decision plus the links the caller
/// must disconnect before acting on it.
pub fn connect_one_plan(target: Address, allowed: &[Address], snapshot: &Snapshot) -> AllocationDecision {
   let controllers: Vec<Address> = snapshot
      .adapters
      .iter()
      .filter(|a| !a.reserved && a.powered)
      .map(|a| a.address)
      .collect();

   let mut evict: SmallVec<[Eviction; 4]> = SmallVec::new();
   let mut target_on: SmallVec<[Address; 2]> = SmallVec::new();
   let mut usage = SpeakerUsage::default();
   let mut occupied: SmallVec<[Address; 4]> = SmallVec::new();

   for device in snapshot.devices.iter().filter(|d| d.connected) {
      if !controllers.contains(&device.adapter) {
         continue;
      }
      let in_config = allowed.contains(&device.address);
      if in_config {
         usage.record(device.address, device.adapter);
      }

      if device.address == target {
         debug!("Target {target} connected on {}", device.adapter);
         target_on.push(device.adapter);
      } else if in_config {
         debug!("Config speaker {} occupies {}", device.address, device.adapter);
         if !occupied.contains(&device.adapter) {
            occupied.push(device.adapter);
         }
      } else {
         info!(
            "Out-of-config device {} on {} marked for eviction",
            device.address, device.adapter
         );
         evict.push(Eviction {
            device: device.address,
            controller: device.adapter,
         });
      }
   }

   if let Some((&keep, extra)) = target_on.split_first()
      && !extra.is_empty()
   {
      info!("Target {target} connected on {} adapters, keeping {keep}", target_on.len());
      evict.extend(extra.iter().map(|&controller| Eviction {
         device: target,
         controller,
      }));
      return AllocationDecision::new(PlanStatus::AlreadyConnected, Some(keep), evict);
   }

   if let Some(&current) = target_on.first() {
      let Some(other) = usage.other_occupant(target, current) else {
         return AllocationDecision::new(PlanStatus::AlreadyConnected, Some(current), evict);
      };

      info!("Target {target} shares {current} with config speaker {other}, reallocating");
      evict.push(Eviction {
         device: target,
         controller: current,
      });
      if let Some(&free) = controllers
         .iter()
         .find(|&&c| c != current && !occupied.contains(&c))
      {
         return AllocationDecision::new(PlanStatus::NeedsConnection, Some(free), evict);
      }
      return free_duplicate(target, usage, evict);
   }

   if let Some(&free) = controllers.iter().find(|c| !occupied.contains(c)) {
      info!("Free controller {free} found for {target}");
      return AllocationDecision::new(PlanStatus::NeedsConnection, Some(free), evict);
   }

   free_duplicate(target, usage, evict)
}

fn free_duplicate(
   target: Address,
   usage: SpeakerUsage,
   mut evict: SmallVec<[Eviction; 4]>,
) -> AllocationDecision {
   if let Some(dup) = usage.first_duplicate() {
      info!(
         "Freeing {} from duplicate link of {} for {target}",
         dup.controller, dup.device
      );
      evict.push(dup);
      return AllocationDecision::new(PlanStatus::NeedsConnection, Some(dup.controller), evict);
   }

   info!("No controller available for {target}");
   AllocationDecision::new(PlanStatus::Error, None, evict)
}
