//! `pactl`-driven audio routing.
//!
//! Speakers are fed from a null sink (`virtual_out` by default) through one
//! `module-loopback` per Bluetooth sink.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   process::Command,
   time::{self, Instant},
};

use crate::{
   audio::{AudioRouter, sink_prefix},
   config::Config,
};

/// Upper bound for a single channel volume, in percent.
const MAX_CHANNEL_VOLUME: u32 = 150;
/// Attempts while waiting for the audio server to answer.
const SERVER_START_ATTEMPTS: u32 = 5;
const SERVER_START_POLL: Duration = Duration::from_secs(1);

pub struct PulseRouter {
   virtual_sink: String,
   sink_wait: Duration,
   sink_poll: Duration,
}

impl PulseRouter {
   pub fn new(config: &Config) -> Self {
      Self {
         virtual_sink: config.virtual_sink.clone(),
         sink_wait: config.sink_wait(),
         sink_poll: config.sink_poll(),
      }
   }

   /// Makes sure the audio server answers and the virtual sink exists and
   /// is the default output.
   pub async fn setup(&self) -> bool {
      if !server_ready().await {
         warn!("Audio server not responding, restarting it");
         match Command::new("pulseaudio")
            .arg("--start")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
         {
            Ok(status) if status.success() => debug!("pulseaudio --start succeeded"),
            Ok(status) => warn!("pulseaudio --start exited with {status}"),
            Err(e) => warn!("Failed to run pulseaudio: {e}"),
         }
         let mut ready = false;
         for _ in 0..SERVER_START_ATTEMPTS {
            if server_ready().await {
               ready = true;
               break;
            }
            time::sleep(SERVER_START_POLL).await;
         }
         if !ready {
            warn!("Audio server did not come up");
            return false;
         }
      }

      let sinks = pactl(&["list", "short", "sinks"]).await.unwrap_or_default();
      if sinks
         .lines()
         .any(|l| l.split_whitespace().nth(1) == Some(self.virtual_sink.as_str()))
      {
         debug!("Virtual sink {} already present", self.virtual_sink);
         return true;
      }

      let sink_name = format!("sink_name={}", self.virtual_sink);
      let properties = format!("sink_properties=device.description={}", self.virtual_sink);
      if pactl(&["load-module", "module-null-sink", &sink_name, &properties])
         .await
         .is_none()
      {
         warn!("Failed to create virtual sink {}", self.virtual_sink);
         return false;
      }
      if pactl(&["set-default-sink", &self.virtual_sink]).await.is_none() {
         warn!("Failed to make {} the default sink", self.virtual_sink);
         return false;
      }
      info!("Virtual sink {} ready", self.virtual_sink);
      true
   }

   async fn find_sink(&self, prefix: &str) -> Option<String> {
      let deadline = Instant::now() + self.sink_wait;
      loop {
         if let Some(listing) = pactl(&["list", "short", "sinks"]).await
            && let Some(sink) = find_sink(&listing, prefix)
         {
            return Some(sink.to_string());
         }
         if Instant::now() + self.sink_poll > deadline {
            return None;
         }
         time::sleep(self.sink_poll).await;
      }
   }

   async fn unload_loopbacks(&self, sink: &str) {
      let Some(listing) = pactl(&["list", "short", "modules"]).await else {
         return;
      };
      for id in loopback_modules(&listing, sink) {
         debug!("Unloading loopback module {id} for {sink}");
         if pactl(&["unload-module", id]).await.is_none() {
            warn!("Failed to unload loopback module {id} for {sink}");
         }
      }
   }
}

#[async_trait]
impl AudioRouter for PulseRouter {
   async fn create_loopback(&self, sink_prefix: &str, latency_ms: u32) -> bool {
      let Some(sink) = self.find_sink(sink_prefix).await else {
         warn!("No sink matching {sink_prefix} appeared");
         return false;
      };

      self.unload_loopbacks(&sink).await;

      let source = format!("source={}.monitor", self.virtual_sink);
      let sink_arg = format!("sink={sink}");
      let latency = format!("latency_msec={latency_ms}");
      let loaded = pactl(&["load-module", "module-loopback", &source, &sink_arg, &latency])
         .await
         .is_some();
      if loaded {
         info!("Loopback into {sink} created ({latency_ms} ms)");
      } else {
         warn!("Failed to load loopback into {sink}");
      }
      loaded
   }

   async fn remove_loopback(&self, device: Address) {
      self.unload_loopbacks(&sink_prefix(device)).await;
   }

   async fn set_volume(&self, device: Address, volume: u8, balance: f32) -> bool {
      let Some(sink) = self.find_sink(&sink_prefix(device)).await else {
         return false;
      };
      let (left, right) = stereo_levels(volume, balance);
      let left = format!("{left}%");
      let right = format!("{right}%");
      pactl(&["set-sink-volume", &sink, &left, &right])
         .await
         .is_some()
   }

   async fn set_mute(&self, device: Address, mute: bool) -> bool {
      let Some(sink) = self.find_sink(&sink_prefix(device)).await else {
         return false;
      };
      pactl(&["set-sink-mute", &sink, if mute { "1" } else { "0" }])
         .await
         .is_some()
   }
}

/// Runs `pactl`, returning stdout on success.
async fn pactl(args: &[&str]) -> Option<String> {
   let output = Command::new("pactl")
      .args(args)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .output()
      .await;

   match output {
      Ok(o) if o.status.success() => Some(String::from_utf8_lossy(&o.stdout).into_owned()),
      Ok(o) => {
         debug!(
            "pactl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&o.stderr).trim()
         );
         None
      },
      Err(e) => {
         warn!("Failed to run pactl: {e}");
         None
      },
   }
}

async fn server_ready() -> bool {
   pactl(&["info"])
      .await
      .is_some_and(|out| out.contains("Server Name"))
}

/// Name of the first sink in a `pactl list short sinks` listing that starts
/// with `prefix`.
fn find_sink<'a>(listing: &'a str, prefix: &str) -> Option<&'a str> {
   listing
      .lines()
      .filter_map(|line| line.split_whitespace().nth(1))
      .find(|name| name.starts_with(prefix))
}

/// Ids of loopback modules in a `pactl list short modules` listing whose
/// target sink starts with `sink`.
fn loopback_modules<'a>(listing: &'a str, sink: &str) -> Vec<&'a str> {
   let needle = format!("sink={sink}");
   listing
      .lines()
      .filter_map(|line| {
         let mut parts = line.split_whitespace();
         let id = parts.next()?;
         let module = parts.next()?;
         (module == "module-loopback" && parts.any(|arg| arg.starts_with(&needle))).then_some(id)
      })
      .collect()
}

/// Left/right percentages for a volume and balance (0.5 is centred).
fn stereo_levels(volume: u8, balance: f32) -> (u32, u32) {
   let balance = balance.clamp(0.0, 1.0);
   let volume = f32::from(volume);
   let left = if balance >= 0.5 {
      (volume * (1.0 - balance) * 2.0).round()
   } else {
      volume
   };
   let right = if balance <= 0.5 {
      (volume * balance * 2.0).round()
   } else {
      volume
   };
   (
      (left as u32).min(MAX_CHANNEL_VOLUME),
      (right as u32).min(MAX_CHANNEL_VOLUME),
   )
}
