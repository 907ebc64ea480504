//! Capabilities of the privileged vendor service and of the environment that
//! binds to it.
//!
//! The session only ever talks to these traits. [`dbus`] implements them over
//! the system or session bus; [`mock`] implements them in-process with fully
//! scripted behavior.

use std::sync::Arc;

use crate::error::Result;

pub mod dbus;
pub mod mock;

/// Handle to the remote vendor service.
///
/// Every method may fail with a transport error, after which the handle should
/// be considered dead.
pub trait RemoteService: Send + Sync {
   /// Registers the relay that receives this client's notifications.
   fn register_callback(&self, relay: &RelayRef) -> Result<()>;

   /// Removes a relay registered with [`RemoteService::register_callback`].
   fn unregister_callback(&self, relay: &RelayRef) -> Result<()>;

   /// Sends a vendor command. Completion arrives later through the relay.
   fn send_command(&self, opcode: u16, params: &[u8]) -> Result<()>;

   /// Replaces the event filter of `relay`. `None` halves clear it, after
   /// which no events are delivered to that relay.
   fn set_event_filter(
      &self,
      relay: &RelayRef,
      mask: Option<&[u8]>,
      value: Option<&[u8]>,
   ) -> Result<()>;
}

/// Notifications the remote service pushes to a registered relay.
///
/// Calls may arrive on any thread, concurrently with each other.
pub trait RemoteCallback: Send + Sync {
   /// May be signalled more than once.
   fn interface_ready(&self);

   /// The interface is permanently unusable. May arrive without a prior ready.
   fn interface_down(&self);

   fn command_complete(&self, opcode: u16, params: &[u8]);

   /// Event parameters that already passed the relay's filter.
   fn event_received(&self, params: &[u8]);
}

/// Shared relay identity passed to the remote service.
pub type RelayRef = Arc<dyn RemoteCallback>;

/// Observer of a binding requested through [`ServiceBinder::bind`].
pub trait BindListener: Send + Sync {
   fn on_service_connected(&self, service: Arc<dyn RemoteService>);

   /// The bound service went away, or could not be reached after all.
   fn on_service_disconnected(&self);
}

/// Shared listener identity passed to a binder.
pub type ListenerRef = Arc<dyn BindListener>;

/// Locates the vendor service and binds to it on behalf of a listener.
pub trait ServiceBinder: Send + Sync {
   /// Requests a binding. An `Err` means the request was rejected outright
   /// and the listener will never hear about it; otherwise the outcome is
   /// reported to `listener`, possibly before this call returns.
   fn bind(&self, listener: ListenerRef) -> Result<()>;

   /// Releases the binding held for `listener`.
   fn unbind(&self, listener: &ListenerRef);
}

/// Compares two trait objects by the data they point to.
pub(crate) fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
   std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
