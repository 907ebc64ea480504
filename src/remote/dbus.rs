//! D-Bus transport for the vendor service.
//!
//! The privileged service owns a well-known name and exports
//! `org.btvs.VendorService1`. Each registered relay is exported by this client
//! as `org.btvs.VendorCallback1` under the configured prefix, and the service
//! calls back into it.
//!
//! [`RemoteService`] calls block on the D-Bus reply. They must not be issued
//! from a current-thread runtime; from async code, wrap them in
//! `spawn_blocking`.

use std::{
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU64, Ordering},
   },
};

use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{
   runtime::Handle,
   sync::mpsc,
   task::{self, JoinHandle},
};
use zbus::{
   Connection, interface,
   names::{BusName, OwnedUniqueName, UniqueName},
   proxy,
   proxy::OwnerChangedStream,
   zvariant::ObjectPath,
};

use crate::{
   config::{BusKind, Config},
   error::{Result, VsError},
   remote::{ListenerRef, RelayRef, RemoteService, ServiceBinder, same_object},
   vendor::opcode,
};

static NEXT_RELAY_ID: AtomicU64 = AtomicU64::new(1);

#[proxy(interface = "org.btvs.VendorService1", gen_blocking = false)]
trait VendorService {
   fn register_callback(&self, callback: &ObjectPath<'_>) -> zbus::Result<()>;

   fn unregister_callback(&self, callback: &ObjectPath<'_>) -> zbus::Result<()>;

   fn send_command(&self, opcode: u32, params: &[u8]) -> zbus::Result<()>;

   fn set_event_filter(
      &self,
      callback: &ObjectPath<'_>,
      mask: &[u8],
      value: &[u8],
   ) -> zbus::Result<()>;

   fn clear_event_filter(&self, callback: &ObjectPath<'_>) -> zbus::Result<()>;
}

/// Notification received on the exported relay object.
#[derive(Debug)]
enum Inbound {
   Ready,
   Down,
   Complete(u32, Vec<u8>),
   Event(Vec<u8>),
}

/// Exported relay object. Queues every call for in-order delivery.
struct RelayObject {
   tx: mpsc::UnboundedSender<Inbound>,
}

impl RelayObject {
   fn forward(&self, inbound: Inbound) {
      if self.tx.send(inbound).is_err() {
         debug!("Relay pump already stopped");
      }
   }
}

#[interface(name = "org.btvs.VendorCallback1")]
impl RelayObject {
   async fn interface_ready(&self) {
      self.forward(Inbound::Ready);
   }

   async fn interface_down(&self) {
      self.forward(Inbound::Down);
   }

   async fn command_complete(&self, opcode: u32, params: Vec<u8>) {
      self.forward(Inbound::Complete(opcode, params));
   }

   async fn event_received(&self, params: Vec<u8>) {
      self.forward(Inbound::Event(params));
   }
}

/// Delivers queued notifications to `relay` from a single blocking thread.
///
/// Ends once the exported object, and with it the sender, is gone.
fn spawn_pump(
   runtime: &Handle,
   relay: RelayRef,
   mut rx: mpsc::UnboundedReceiver<Inbound>,
) -> JoinHandle<()> {
   runtime.spawn_blocking(move || {
      while let Some(inbound) = rx.blocking_recv() {
         match inbound {
            Inbound::Ready => relay.interface_ready(),
            Inbound::Down => relay.interface_down(),
            Inbound::Complete(op, params) => {
               relay.command_complete(opcode::from_wire(op), &params);
            },
            Inbound::Event(params) => relay.event_received(&params),
         }
      }
      debug!("Relay pump finished");
   })
}

struct Registration {
   relay: RelayRef,
   path: ObjectPath<'static>,
}

/// Connected vendor service reached over D-Bus.
pub struct DbusService {
   runtime: Handle,
   connection: Connection,
   proxy: VendorServiceProxy<'static>,
   callback_path_prefix: SmolStr,
   registration: Mutex<Option<Registration>>,
}

impl DbusService {
   fn block_on<F: Future>(&self, fut: F) -> F::Output {
      let _guard = self.runtime.enter();
      futures::executor::block_on(fut)
   }

   fn registered_path(&self, relay: &RelayRef) -> Result<ObjectPath<'static>> {
      match self.registration.lock().as_ref() {
         Some(registration) if same_object(&registration.relay, relay) => {
            Ok(registration.path.clone())
         },
         _ => Err(VsError::NotRegistered),
      }
   }
}

impl RemoteService for DbusService {
   fn register_callback(&self, relay: &RelayRef) -> Result<()> {
      let mut registration = self.registration.lock();
      if registration.is_some() {
         return Err(VsError::AlreadyRegistered);
      }

      let id = NEXT_RELAY_ID.fetch_add(1, Ordering::Relaxed);
      let path = ObjectPath::try_from(format!("{}/relay{id}", self.callback_path_prefix))?;
      let (tx, rx) = mpsc::unbounded_channel();
      let object_server = self.connection.object_server();

      self.block_on(object_server.at(path.clone(), RelayObject { tx }))?;
      let _ = spawn_pump(&self.runtime, relay.clone(), rx);

      if let Err(e) = self.block_on(self.proxy.register_callback(&path)) {
         if let Err(cleanup) = self.block_on(object_server.remove::<RelayObject, _>(path.clone())) {
            warn!("Failed to remove relay object at {path}: {cleanup}");
         }
         return Err(e.into());
      }

      debug!("Registered relay at {path}");
      *registration = Some(Registration {
         relay: relay.clone(),
         path,
      });
      Ok(())
   }

   fn unregister_callback(&self, relay: &RelayRef) -> Result<()> {
      let path = self.registered_path(relay)?;
      self.registration.lock().take();

      let result = self.block_on(self.proxy.unregister_callback(&path));
      let object_server = self.connection.object_server();
      if let Err(e) = self.block_on(object_server.remove::<RelayObject, _>(path.clone())) {
         warn!("Failed to remove relay object at {path}: {e}");
      }
      result?;
      debug!("Unregistered relay at {path}");
      Ok(())
   }

   fn send_command(&self, op: u16, params: &[u8]) -> Result<()> {
      self.block_on(self.proxy.send_command(opcode::to_wire(op), params))?;
      Ok(())
   }

   fn set_event_filter(
      &self,
      relay: &RelayRef,
      mask: Option<&[u8]>,
      value: Option<&[u8]>,
   ) -> Result<()> {
      let path = self.registered_path(relay)?;
      match (mask, value) {
         (Some(mask), Some(value)) => {
            self.block_on(self.proxy.set_event_filter(&path, mask, value))?;
         },
         _ => self.block_on(self.proxy.clear_event_filter(&path))?,
      }
      Ok(())
   }
}

/// Binds sessions to the vendor service over D-Bus.
///
/// Connection work runs on the supplied tokio runtime. Listener callbacks are
/// made from blocking threads so they may call back into [`DbusService`].
pub struct DbusBinder {
   runtime: Handle,
   config: Config,
   bindings: Mutex<Vec<(ListenerRef, JoinHandle<()>)>>,
   shut_down: AtomicBool,
}

impl DbusBinder {
   pub fn new(runtime: Handle, config: Config) -> Self {
      Self {
         runtime,
         config,
         bindings: Mutex::new(Vec::new()),
         shut_down: AtomicBool::new(false),
      }
   }

   /// Drops every binding and rejects further bind requests.
   pub fn shutdown(&self) {
      self.shut_down.store(true, Ordering::SeqCst);
      for (_, task) in self.bindings.lock().drain(..) {
         task.abort();
      }
   }
}

impl ServiceBinder for DbusBinder {
   fn bind(&self, listener: ListenerRef) -> Result<()> {
      if self.shut_down.load(Ordering::SeqCst) {
         return Err(VsError::BinderShutdown);
      }

      let name = BusName::try_from(self.config.service_name.to_string())?;
      let path = ObjectPath::try_from(self.config.object_path.to_string())?;
      ObjectPath::try_from(self.config.callback_path_prefix.as_str())?;

      let target = Target {
         bus: self.config.bus,
         name,
         path,
         callback_path_prefix: self.config.callback_path_prefix.clone(),
      };
      let task = self
         .runtime
         .spawn(run_binding(self.runtime.clone(), target, listener.clone()));
      self.bindings.lock().push((listener, task));
      Ok(())
   }

   fn unbind(&self, listener: &ListenerRef) {
      let mut bindings = self.bindings.lock();
      if let Some(idx) = bindings
         .iter()
         .position(|(bound, _)| same_object(bound, listener))
      {
         let (_, task) = bindings.swap_remove(idx);
         task.abort();
      }
   }
}

/// Where to find the vendor service.
struct Target {
   bus: BusKind,
   name: BusName<'static>,
   path: ObjectPath<'static>,
   callback_path_prefix: SmolStr,
}

/// A reachable vendor service, together with the watch on its bus name.
struct Opened {
   service: DbusService,
   name: BusName<'static>,
   owner: OwnedUniqueName,
   owner_changes: OwnerChangedStream<'static>,
}

/// Whether a name owner change means the instance we registered with is gone.
fn owner_lost(initial: &UniqueName<'_>, owner: Option<&UniqueName<'_>>) -> bool {
   owner.is_none_or(|owner| owner != initial)
}

async fn open_service(runtime: Handle, target: Target) -> Result<Opened> {
   let connection = match target.bus {
      BusKind::System => Connection::system().await?,
      BusKind::Session => Connection::session().await?,
   };

   let proxy = VendorServiceProxy::builder(&connection)
      .destination(target.name.clone())?
      .path(target.path)?
      .build()
      .await?;

   // Watch before resolving the owner so no change slips in between.
   let owner_changes = proxy.inner().receive_owner_changed().await?;
   let dbus = zbus::fdo::DBusProxy::new(&connection).await?;
   let owner = match dbus.get_name_owner(target.name.clone()).await {
      Ok(owner) => owner,
      Err(zbus::fdo::Error::NameHasNoOwner(_)) => {
         return Err(VsError::ServiceUnavailable(target.name.as_str().into()));
      },
      Err(e) => return Err(e.into()),
   };

   let service = DbusService {
      runtime,
      connection,
      proxy,
      callback_path_prefix: target.callback_path_prefix,
      registration: Mutex::new(None),
   };
   Ok(Opened {
      service,
      name: target.name,
      owner,
      owner_changes,
   })
}

async fn run_binding(runtime: Handle, target: Target, listener: ListenerRef) {
   let Opened {
      service,
      name,
      owner,
      mut owner_changes,
   } = match open_service(runtime, target).await {
      Ok(opened) => opened,
      Err(e) => {
         warn!("Vendor service unreachable: {e}");
         notify_disconnected(listener).await;
         return;
      },
   };
   info!("Connected to vendor service {name} at {}", owner.as_str());

   let service = Arc::new(service);
   {
      let listener = listener.clone();
      let _ = task::spawn_blocking(move || listener.on_service_connected(service)).await;
   }

   while let Some(current) = owner_changes.next().await {
      if owner_lost(&owner, current.as_ref()) {
         break;
      }
   }

   info!("Vendor service {name} went away");
   notify_disconnected(listener).await;
}

async fn notify_disconnected(listener: ListenerRef) {
   let _ = task::spawn_blocking(move || listener.on_service_disconnected()).await;
}
