//! Adapters through which the environment and the remote service reach a
//! session.
//!
//! Both hold only a weak reference, so a session can be dropped while the
//! binder or the service still keeps its listener and relay alive.

use std::sync::{Arc, Weak};

use log::{debug, trace};

use crate::{
   remote::{BindListener, RemoteCallback, RemoteService},
   session::SessionInner,
};

/// Receives vendor notifications from the remote service.
pub(crate) struct CallbackRelay {
   session: Weak<SessionInner>,
}

impl CallbackRelay {
   pub const fn new(session: Weak<SessionInner>) -> Self {
      Self { session }
   }

   fn session(&self) -> Option<Arc<SessionInner>> {
      let session = self.session.upgrade();
      if session.is_none() {
         trace!("Relay signal for a dropped session");
      }
      session
   }
}

impl RemoteCallback for CallbackRelay {
   fn interface_ready(&self) {
      if let Some(session) = self.session() {
         session.mark_active();
      }
   }

   fn interface_down(&self) {
      if let Some(session) = self.session() {
         debug!("session {}: remote reported interface down", session.id);
         session.release(true);
      }
   }

   fn command_complete(&self, opcode: u16, params: &[u8]) {
      if let Some(session) = self.session() {
         session.deliver_command_complete(opcode, params);
      }
   }

   fn event_received(&self, params: &[u8]) {
      if let Some(session) = self.session() {
         session.deliver_event(params);
      }
   }
}

/// Observes the binding a session requested from its binder.
pub(crate) struct ConnectionListener {
   session: Weak<SessionInner>,
}

impl ConnectionListener {
   pub const fn new(session: Weak<SessionInner>) -> Self {
      Self { session }
   }
}

impl BindListener for ConnectionListener {
   fn on_service_connected(&self, service: Arc<dyn RemoteService>) {
      if let Some(session) = self.session.upgrade() {
         session.service_connected(service);
      }
   }

   fn on_service_disconnected(&self) {
      if let Some(session) = self.session.upgrade() {
         session.service_disconnected();
      }
   }
}
