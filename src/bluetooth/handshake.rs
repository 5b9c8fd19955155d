//! Pair/trust/connect handshake for one speaker on one adapter.
//!
//! The walk is `run_discovery → pair → trust → connect`, sharing a single
//! retry budget across all states. A failed pairing drops the device object
//! and rediscovers it; a failed connect goes back to pairing. Running out of
//! budget leaves the device as the last operation left it.

use std::{sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use rand::Rng;
use tokio::time;

use crate::{
   bluetooth::{
      bus::{AUDIO_SINK_UUID, AdapterView, BusClient, DeviceView},
      scan::ScanCoordinator,
   },
   config::Config,
   error::{Result, SyncSonicError},
   event::{EventSender, Phase, StatusEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum HandshakeState {
   RunDiscovery,
   Pair,
   Trust,
   Connect,
   AlreadyConnected,
}

impl HandshakeState {
   /// Where to start, given the device as currently seen on the adapter.
   pub fn classify(device: Option<&DeviceView>) -> Self {
      match device {
         None => Self::RunDiscovery,
         Some(d) if d.is_fully_linked() => Self::AlreadyConnected,
         Some(d) if !d.paired => Self::Pair,
         Some(d) if !d.trusted => Self::Trust,
         Some(_) => Self::Connect,
      }
   }
}

pub struct Handshake {
   bus: Arc<dyn BusClient>,
   scan: Arc<ScanCoordinator>,
   events: EventSender,
   attempts: u32,
   discovery_timeout: Duration,
   retry_base: Duration,
   retry_max: Duration,
}

impl Handshake {
   pub fn new(
      bus: Arc<dyn BusClient>,
      scan: Arc<ScanCoordinator>,
      events: EventSender,
      config: &Config,
   ) -> Self {
      Self {
         bus,
         scan,
         events,
         attempts: config.handshake_attempts,
         discovery_timeout: config.discovery_timeout(),
         retry_base: Duration::from_millis(config.retry_base_delay_ms),
         retry_max: Duration::from_millis(config.retry_max_delay_ms),
      }
   }

   fn emit(&self, device: Address, phase: Phase) {
      self.events.emit(StatusEvent::new(device, phase));
   }

   /// Drives `device` to a connected audio link on `adapter`.
   pub async fn run(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      let snapshot = self.bus.snapshot().await?;
      let mut state = HandshakeState::classify(snapshot.device_on(adapter.address, device));
      info!("Handshake for {device} via {} starting at {state}", adapter.name);
      self.emit(device, Phase::FsmStart);

      let mut attempt = 0;
      while attempt < self.attempts {
         debug!("[{}/{}] {device}: {state}", attempt + 1, self.attempts);
         self.events.emit(
            StatusEvent::new(device, Phase::FsmState)
               .with_attempt(attempt)
               .with_detail(state.to_string()),
         );

         state = match state {
            HandshakeState::RunDiscovery => {
               self.discover(adapter, device).await?;
               HandshakeState::Pair
            },
            HandshakeState::Pair => {
               self.emit(device, Phase::PairingStart);
               match self.bus.pair(adapter, device).await {
                  Ok(()) => {
                     self.emit(device, Phase::PairingSuccess);
                     HandshakeState::Trust
                  },
                  Err(e) if e.is_already_done() => {
                     debug!("{device} already paired");
                     self.emit(device, Phase::PairingSuccess);
                     HandshakeState::Trust
                  },
                  Err(e) => {
                     attempt += 1;
                     warn!("Pairing {device} failed: {e}, removing device and retrying");
                     self.events.emit(
                        StatusEvent::new(device, Phase::PairingFailed)
                           .with_attempt(attempt)
                           .with_detail(e.to_string()),
                     );
                     if let Err(e) = self.bus.remove_device(adapter, device).await {
                        warn!("Failed to remove {device} from {}: {e}", adapter.name);
                     }
                     self.backoff(attempt).await;
                     HandshakeState::RunDiscovery
                  },
               }
            },
            HandshakeState::Trust => {
               self.emit(device, Phase::Trusting);
               if let Err(e) = self.bus.trust(adapter, device).await {
                  warn!("Trusting {device} failed: {e}");
               }
               HandshakeState::Connect
            },
            HandshakeState::Connect => {
               self.emit(device, Phase::ConnectStart);
               match self.bus.connect(adapter, device).await {
                  Ok(()) => {
                     self.request_audio_profile(adapter, device).await;
                     return Ok(());
                  },
                  Err(e) if e.is_already_done() => {
                     self.request_audio_profile(adapter, device).await;
                     return Ok(());
                  },
                  Err(e) => {
                     attempt += 1;
                     warn!("Connecting {device} failed: {e}");
                     self.events.emit(
                        StatusEvent::new(device, Phase::ConnectFailed)
                           .with_attempt(attempt)
                           .with_detail(e.to_string()),
                     );
                     self.backoff(attempt).await;
                     HandshakeState::Pair
                  },
               }
            },
            HandshakeState::AlreadyConnected => {
               self.request_audio_profile(adapter, device).await;
               return Ok(());
            },
         };
      }

      warn!("Handshake for {device} exhausted {} attempts", self.attempts);
      Err(SyncSonicError::HandshakeExhausted(device))
   }

   async fn discover(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      self.emit(device, Phase::DiscoveryStart);
      self.scan.ensure_discovery(adapter).await?;
      debug!(
         "{} discovery refs on {}",
         self.scan.discovery_refs(adapter.address).await,
         adapter.name
      );
      let found = self
         .scan
         .wait_for_device(adapter, device, self.discovery_timeout)
         .await;
      if let Err(e) = self.scan.release_discovery(adapter).await {
         warn!("Failed to release discovery on {}: {e}", adapter.name);
      }

      if found?.is_none() {
         info!("Discovery of {device} on {} timed out", adapter.name);
         return Err(SyncSonicError::DiscoveryTimeout(device));
      }
      self.emit(device, Phase::DiscoveryComplete);
      Ok(())
   }

   /// Explicitly asks for the audio sink profile; some speakers only bring
   /// up the control link on a plain connect.
   pub async fn request_audio_profile(&self, adapter: &AdapterView, device: Address) {
      match self
         .bus
         .connect_profile(adapter, device, AUDIO_SINK_UUID)
         .await
      {
         Ok(()) => debug!("Audio profile connected on {device}"),
         Err(e) if e.is_already_done() => debug!("Audio profile already up on {device}"),
         Err(e) => warn!("Audio profile connect on {device} failed: {e}"),
      }
   }

   async fn backoff(&self, attempt: u32) {
      if attempt >= self.attempts {
         return;
      }
      time::sleep(retry_delay(self.retry_base, self.retry_max, attempt)).await;
   }
}

fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
   let exponential = base * (1 << attempt.saturating_sub(1).min(4));
   let delay = exponential.min(max);
   let jitter_ms = (base.as_millis() / 4) as u64;
   let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
   delay + Duration::from_millis(jitter)
}
