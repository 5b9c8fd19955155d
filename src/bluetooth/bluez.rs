//! BlueZ-backed bus client.
//!
//! Operations go through a `bluer` session; change notifications are read
//! straight off the system bus with `zbus` so that device objects appearing
//! under any adapter are seen, not only those of an adapter we scan on.

use std::{collections::HashMap, pin::pin};

use async_trait::async_trait;
use bluer::{
   Adapter, Address, Device, Session,
   agent::{Agent, AgentHandle, AuthorizeService, RequestAuthorization, RequestConfirmation},
};
use futures::{StreamExt, stream};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use uuid::Uuid;
use zbus::{
   Connection, MatchRule, Message, MessageStream,
   message::Type as MessageType,
   zvariant::{OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   bluetooth::bus::{
      AdapterView, BusClient, BusEvent, BusEventStream, DeviceView, Snapshot, parse_device_path,
   },
   error::{Result, SyncSonicError},
};

const BLUEZ_SERVICE: &str = "org.bluez";
const DEVICE_INTERFACE: &str = "org.bluez.Device1";

type InterfaceMap = HashMap<String, HashMap<String, OwnedValue>>;

pub struct BluerBus {
   session: Session,
   /// Unregisters the pairing agent when dropped.
   _agent: AgentHandle,
   reserved: SmolStr,
   /// Live discovery sessions, keyed by adapter name.
   discovery: Mutex<HashMap<SmolStr, JoinHandle<()>>>,
}

impl BluerBus {
   pub async fn new(reserved: impl Into<SmolStr>) -> Result<Self> {
      let session = Session::new().await?;
      let agent = session.register_agent(auto_accept_agent()).await?;
      let reserved = reserved.into();
      info!("Bluetooth session open with pairing agent, reserved adapter {reserved}");
      Ok(Self {
         session,
         _agent: agent,
         reserved,
         discovery: Mutex::new(HashMap::new()),
      })
   }

   fn adapter(&self, view: &AdapterView) -> Result<Adapter> {
      Ok(self.session.adapter(&view.name)?)
   }

   fn device(&self, view: &AdapterView, address: Address) -> Result<Device> {
      Ok(self.adapter(view)?.device(address)?)
   }

   async fn adapter_view(&self, name: &str, adapter: &Adapter) -> Result<AdapterView> {
      Ok(AdapterView {
         name: name.into(),
         address: adapter.address().await?,
         powered: adapter.is_powered().await?,
         reserved: name == self.reserved,
      })
   }

   async fn device_views(adapter: &Adapter, adapter_address: Address) -> Result<Vec<DeviceView>> {
      let mut addresses = adapter.device_addresses().await?;
      addresses.sort();
      let mut views = Vec::with_capacity(addresses.len());
      for address in addresses {
         let device = adapter.device(address)?;
         // A device can vanish between listing and reading; skip it.
         match Self::device_view(&device, adapter_address).await {
            Ok(view) => views.push(view),
            Err(e) => debug!("Skipping {address} on {adapter_address}: {e}"),
         }
      }
      Ok(views)
   }

   async fn device_view(device: &Device, adapter: Address) -> Result<DeviceView> {
      let mut uuids: Vec<Uuid> = device.uuids().await?.unwrap_or_default().into_iter().collect();
      uuids.sort();
      Ok(DeviceView {
         adapter,
         address: device.address(),
         name: device.name().await?.map(SmolStr::from),
         paired: device.is_paired().await?,
         trusted: device.is_trusted().await?,
         connected: device.is_connected().await?,
         uuids,
      })
   }
}

#[async_trait]
impl BusClient for BluerBus {
   async fn snapshot(&self) -> Result<Snapshot> {
      let mut named = Vec::new();
      for name in self.session.adapter_names().await? {
         let adapter = self.session.adapter(&name)?;
         let view = self.adapter_view(&name, &adapter).await?;
         named.push((view, adapter));
      }
      named.sort_by_key(|(view, _)| view.index());

      let mut snapshot = Snapshot::default();
      for (view, adapter) in named {
         snapshot
            .devices
            .extend(Self::device_views(&adapter, view.address).await?);
         snapshot.adapters.push(view);
      }
      Ok(snapshot)
   }

   async fn start_discovery(&self, adapter: &AdapterView) -> Result<()> {
      if self.discovery.lock().contains_key(&adapter.name) {
         return Err(SyncSonicError::InProgress);
      }

      let events = self.adapter(adapter)?.discover_devices().await?;
      let name = adapter.name.clone();
      let task = tokio::spawn(async move {
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            debug!("{name} discovery: {event:?}");
         }
      });

      let mut sessions = self.discovery.lock();
      if sessions.contains_key(&adapter.name) {
         task.abort();
         return Err(SyncSonicError::InProgress);
      }
      sessions.insert(adapter.name.clone(), task);
      Ok(())
   }

   async fn stop_discovery(&self, adapter: &AdapterView) -> Result<()> {
      // Dropping the discovery stream ends the BlueZ session.
      match self.discovery.lock().remove(&adapter.name) {
         Some(task) => task.abort(),
         None => debug!("No discovery session on {}", adapter.name),
      }
      Ok(())
   }

   async fn pair(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      Ok(self.device(adapter, device)?.pair().await?)
   }

   async fn trust(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      Ok(self.device(adapter, device)?.set_trusted(true).await?)
   }

   async fn connect(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      Ok(self.device(adapter, device)?.connect().await?)
   }

   async fn connect_profile(&self, adapter: &AdapterView, device: Address, profile: Uuid) -> Result<()> {
      Ok(self
         .device(adapter, device)?
         .connect_profile(&profile)
         .await?)
   }

   async fn disconnect(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      Ok(self.device(adapter, device)?.disconnect().await?)
   }

   async fn remove_device(&self, adapter: &AdapterView, device: Address) -> Result<()> {
      Ok(self.adapter(adapter)?.remove_device(device).await?)
   }

   async fn events(&self) -> Result<BusEventStream> {
      let connection = Connection::system().await?;

      let properties = MatchRule::builder()
         .msg_type(MessageType::Signal)
         .sender(BLUEZ_SERVICE)?
         .interface("org.freedesktop.DBus.Properties")?
         .member("PropertiesChanged")?
         .arg(0, DEVICE_INTERFACE)?
         .build();
      let added = MatchRule::builder()
         .msg_type(MessageType::Signal)
         .sender(BLUEZ_SERVICE)?
         .interface("org.freedesktop.DBus.ObjectManager")?
         .member("InterfacesAdded")?
         .build();

      let properties = MessageStream::for_match_rule(properties, &connection, None).await?;
      let added = MessageStream::for_match_rule(added, &connection, None).await?;

      let events = stream::select(properties, added).filter_map(|msg| async move {
         match msg {
            Ok(msg) => parse_signal(&msg),
            Err(e) => {
               warn!("Bus signal stream error: {e}");
               None
            },
         }
      });
      Ok(events.boxed())
   }
}

/// Default agent that accepts every pairing and service request; speakers
/// have no input and nobody sits in front of the host to confirm.
fn auto_accept_agent() -> Agent {
   Agent {
      request_default: true,
      request_confirmation: Some(Box::new(|req: RequestConfirmation| {
         Box::pin(async move {
            info!(
               "Confirming pairing with {} on {} (passkey {:06})",
               req.device, req.adapter, req.passkey
            );
            Ok(())
         })
      })),
      request_authorization: Some(Box::new(|req: RequestAuthorization| {
         Box::pin(async move {
            info!("Authorizing pairing with {} on {}", req.device, req.adapter);
            Ok(())
         })
      })),
      authorize_service: Some(Box::new(|req: AuthorizeService| {
         Box::pin(async move {
            debug!("Authorizing service {} for {}", req.service, req.device);
            Ok(())
         })
      })),
      ..Default::default()
   }
}

fn parse_signal(msg: &Message) -> Option<BusEvent> {
   let header = msg.header();
   match header.member()?.as_str() {
      "PropertiesChanged" => {
         let (adapter, device) = parse_device_path(header.path()?.as_str())?;
         let (_, changed, _): (String, HashMap<String, OwnedValue>, Vec<String>) =
            msg.body().deserialize().ok()?;
         let Value::Bool(connected) = &**changed.get("Connected")? else {
            return None;
         };
         Some(BusEvent::ConnectionChanged {
            adapter,
            device,
            connected: *connected,
         })
      },
      "InterfacesAdded" => {
         let (path, interfaces): (OwnedObjectPath, InterfaceMap) = msg.body().deserialize().ok()?;
         if !interfaces.contains_key(DEVICE_INTERFACE) {
            return None;
         }
         let (adapter, device) = parse_device_path(path.as_str())?;
         Some(BusEvent::DeviceAdded { adapter, device })
      },
      _ => None,
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn pairing_agent_accepts_without_input() {
      let agent = auto_accept_agent();
      assert!(agent.request_default);
      assert!(agent.request_confirmation.is_some());
      assert!(agent.request_authorization.is_some());
      assert!(agent.authorize_service.is_some());
      assert!(agent.request_pin_code.is_none());
      assert!(agent.request_passkey.is_none());
   }
}
