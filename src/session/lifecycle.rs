//! Connection lifecycle state of a vendor session.

use std::{mem, sync::Arc};

use crate::remote::RemoteService;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
   /// Constructed, no binding requested yet.
   Unbound,
   /// Binding requested, waiting for the service to report ready.
   Connecting,
   /// Ready; commands and events flow.
   Active,
   /// Terminal. Nothing flows and nothing changes.
   Released,
}

/// Resources that must be torn down when a session is released.
pub(crate) struct Teardown {
   pub service: Option<Arc<dyn RemoteService>>,
   pub registered: bool,
   pub bound: bool,
}

/// Mutable state guarded by the session lock.
pub(crate) struct Lifecycle {
   state: ConnectionState,
   service: Option<Arc<dyn RemoteService>>,
   registered: bool,
   bound: bool,
}

impl Lifecycle {
   pub const fn new() -> Self {
      Self {
         state: ConnectionState::Unbound,
         service: None,
         registered: false,
         bound: false,
      }
   }

   pub const fn state(&self) -> ConnectionState {
      self.state
   }

   pub fn is_usable(&self) -> bool {
      self.state == ConnectionState::Active
   }

   pub fn is_released(&self) -> bool {
      self.state == ConnectionState::Released
   }

   /// `Unbound → Connecting`. Returns false if connecting already started.
   pub fn begin_connect(&mut self) -> bool {
      if self.state != ConnectionState::Unbound {
         return false;
      }
      self.state = ConnectionState::Connecting;
      true
   }

   /// Records a granted binding. Returns false if the session was released
   /// in the meantime and the binding has to be undone by the caller.
   pub fn mark_bound(&mut self) -> bool {
      if self.is_released() {
         return false;
      }
      self.bound = true;
      true
   }

   /// Stores the connected service. Returns false once released.
   pub fn attach(&mut self, service: Arc<dyn RemoteService>) -> bool {
      if self.is_released() {
         return false;
      }
      self.service = Some(service);
      true
   }

   /// Forgets the service after the environment reported it gone.
   pub fn detach(&mut self) {
      self.service = None;
      self.registered = false;
   }

   /// Records a completed relay registration. Returns false if the session
   /// was released while registering.
   pub fn mark_registered(&mut self) -> bool {
      if self.is_released() {
         return false;
      }
      self.registered = true;
      true
   }

   /// `Connecting → Active`. Duplicate ready signals and late signals after
   /// release return false.
   pub fn activate(&mut self) -> bool {
      match self.state {
         ConnectionState::Active | ConnectionState::Released => false,
         ConnectionState::Unbound | ConnectionState::Connecting => {
            self.state = ConnectionState::Active;
            true
         },
      }
   }

   /// The service handle, if commands may currently be sent through it.
   pub fn usable_service(&self) -> Option<Arc<dyn RemoteService>> {
      if self.is_usable() {
         self.service.clone()
      } else {
         None
      }
   }

   /// Enters `Released` and hands back what needs tearing down. Returns
   /// `None` if the session was already released.
   pub fn release(&mut self) -> Option<Teardown> {
      if self.is_released() {
         return None;
      }
      self.state = ConnectionState::Released;
      Some(Teardown {
         service: self.service.take(),
         registered: mem::take(&mut self.registered),
         bound: mem::take(&mut self.bound),
      })
   }
}
