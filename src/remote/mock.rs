//! In-process stand-in for the vendor service and its binder.
//!
//! Every remote-side signal is triggered explicitly and delivered on the
//! calling thread, so tests can drive a session through any interleaving
//! deterministically. Calls are counted and individual call kinds can be made
//! to fail with a transport error.

use std::{
   collections::{HashMap, HashSet},
   sync::Arc,
};

use log::debug;
use parking_lot::Mutex;

use crate::{
   error::{Result, VsError},
   remote::{ListenerRef, RelayRef, RemoteService, ServiceBinder, same_object},
   vendor::{EventFilter, Packet, filter},
};

/// Kinds of calls a [`MockService`] receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MockCall {
   Register,
   Unregister,
   SendCommand,
   SetEventFilter,
}

#[derive(Default)]
struct ServiceState {
   relay: Option<RelayRef>,
   last_relay: Option<RelayRef>,
   filter: Option<EventFilter>,
   commands: Vec<(u16, Packet)>,
   calls: HashMap<MockCall, usize>,
   failing: HashSet<MockCall>,
   ready_on_register: bool,
   down_on_register: bool,
}

impl ServiceState {
   fn record(&mut self, call: MockCall) -> Result<()> {
      *self.calls.entry(call).or_default() += 1;
      if self.failing.contains(&call) {
         return Err(VsError::Transport(format!("simulated {call} failure")));
      }
      Ok(())
   }

   fn is_current(&self, relay: &RelayRef) -> bool {
      self
         .relay
         .as_ref()
         .is_some_and(|current| same_object(current, relay))
   }
}

/// Scriptable vendor service.
#[derive(Default)]
pub struct MockService {
   state: Mutex<ServiceState>,
}

impl MockService {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Makes every following call of this kind fail.
   pub fn fail(&self, call: MockCall) {
      self.state.lock().failing.insert(call);
   }

   /// Undoes [`MockService::fail`].
   pub fn recover(&self, call: MockCall) {
      self.state.lock().failing.remove(&call);
   }

   /// Signals ready from inside `register_callback`, like a service whose
   /// controller is already up.
   pub fn ready_on_register(&self, enabled: bool) {
      self.state.lock().ready_on_register = enabled;
   }

   /// Signals down from inside `register_callback`, after the relay was
   /// accepted.
   pub fn down_on_register(&self, enabled: bool) {
      self.state.lock().down_on_register = enabled;
   }

   /// Number of calls of a kind, failed ones included.
   pub fn calls(&self, call: MockCall) -> usize {
      self.state.lock().calls.get(&call).copied().unwrap_or(0)
   }

   /// Commands that were accepted, in order.
   pub fn commands(&self) -> Vec<(u16, Vec<u8>)> {
      self
         .state
         .lock()
         .commands
         .iter()
         .map(|(opcode, params)| (*opcode, params.to_vec()))
         .collect()
   }

   pub fn filter(&self) -> Option<EventFilter> {
      self.state.lock().filter.clone()
   }

   pub fn is_registered(&self) -> bool {
      self.state.lock().relay.is_some()
   }

   /// The most recently registered relay, even after it was unregistered.
   pub fn last_relay(&self) -> Option<RelayRef> {
      self.state.lock().last_relay.clone()
   }

   fn relay(&self) -> Option<RelayRef> {
      self.state.lock().relay.clone()
   }

   /// Reports the interface ready. Returns false if no relay is registered.
   pub fn signal_ready(&self) -> bool {
      let Some(relay) = self.relay() else {
         return false;
      };
      relay.interface_ready();
      true
   }

   /// Reports the interface down. Returns false if no relay is registered.
   pub fn signal_down(&self) -> bool {
      let Some(relay) = self.relay() else {
         return false;
      };
      relay.interface_down();
      true
   }

   /// Reports a command completion. Returns false if no relay is registered.
   pub fn complete(&self, opcode: u16, params: &[u8]) -> bool {
      let Some(relay) = self.relay() else {
         return false;
      };
      relay.command_complete(opcode, params);
      true
   }

   /// Emits a vendor event through the current filter. Returns whether it
   /// reached the relay.
   pub fn emit_event(&self, params: &[u8]) -> bool {
      let relay = {
         let state = self.state.lock();
         if !filter::accepts(state.filter.as_ref(), params) {
            debug!("mock: filtered out event {}", hex::encode(params));
            return false;
         }
         state.relay.clone()
      };
      let Some(relay) = relay else {
         return false;
      };
      relay.event_received(params);
      true
   }
}

impl RemoteService for MockService {
   fn register_callback(&self, relay: &RelayRef) -> Result<()> {
      let (ready, down) = {
         let mut state = self.state.lock();
         state.record(MockCall::Register)?;
         if state.relay.is_some() {
            return Err(VsError::AlreadyRegistered);
         }
         state.relay = Some(relay.clone());
         state.last_relay = Some(relay.clone());
         (state.ready_on_register, state.down_on_register)
      };
      if ready {
         relay.interface_ready();
      }
      if down {
         relay.interface_down();
      }
      Ok(())
   }

   fn unregister_callback(&self, relay: &RelayRef) -> Result<()> {
      let mut state = self.state.lock();
      state.record(MockCall::Unregister)?;
      if !state.is_current(relay) {
         return Err(VsError::NotRegistered);
      }
      state.relay = None;
      state.filter = None;
      Ok(())
   }

   fn send_command(&self, opcode: u16, params: &[u8]) -> Result<()> {
      let mut state = self.state.lock();
      state.record(MockCall::SendCommand)?;
      state.commands.push((opcode, Packet::from_slice(params)));
      Ok(())
   }

   fn set_event_filter(
      &self,
      relay: &RelayRef,
      mask: Option<&[u8]>,
      value: Option<&[u8]>,
   ) -> Result<()> {
      let mut state = self.state.lock();
      state.record(MockCall::SetEventFilter)?;
      if !state.is_current(relay) {
         return Err(VsError::NotRegistered);
      }
      state.filter = EventFilter::from_parts(mask, value);
      Ok(())
   }
}

#[derive(Default)]
struct BinderState {
   listener: Option<ListenerRef>,
   last_listener: Option<ListenerRef>,
   bind_calls: usize,
   unbind_calls: usize,
   reject_bind: bool,
   auto_connect: bool,
   disconnect_on_unbind: bool,
}

/// Scriptable binder handing out a single [`MockService`].
pub struct MockBinder {
   service: Arc<MockService>,
   state: Mutex<BinderState>,
}

impl MockBinder {
   pub fn new(service: Arc<MockService>) -> Arc<Self> {
      Arc::new(Self {
         service,
         state: Mutex::new(BinderState::default()),
      })
   }

   /// Rejects bind requests outright.
   pub fn reject_bind(&self, enabled: bool) {
      self.state.lock().reject_bind = enabled;
   }

   /// Reports the service connected from inside `bind`.
   pub fn auto_connect(&self, enabled: bool) {
      self.state.lock().auto_connect = enabled;
   }

   /// Reports the service disconnected from inside `unbind`.
   pub fn disconnect_on_unbind(&self, enabled: bool) {
      self.state.lock().disconnect_on_unbind = enabled;
   }

   pub fn bind_calls(&self) -> usize {
      self.state.lock().bind_calls
   }

   pub fn unbind_calls(&self) -> usize {
      self.state.lock().unbind_calls
   }

   pub fn is_bound(&self) -> bool {
      self.state.lock().listener.is_some()
   }

   /// The most recently bound listener, even after it was unbound.
   pub fn last_listener(&self) -> Option<ListenerRef> {
      self.state.lock().last_listener.clone()
   }

   fn listener(&self) -> Option<ListenerRef> {
      self.state.lock().listener.clone()
   }

   /// Reports the service connected. Returns false if nothing is bound.
   pub fn connect(&self) -> bool {
      let Some(listener) = self.listener() else {
         return false;
      };
      listener.on_service_connected(self.service.clone());
      true
   }

   /// Reports the service gone while keeping the binding. Returns false if
   /// nothing is bound.
   pub fn disconnect(&self) -> bool {
      let Some(listener) = self.listener() else {
         return false;
      };
      listener.on_service_disconnected();
      true
   }
}

impl ServiceBinder for MockBinder {
   fn bind(&self, listener: ListenerRef) -> Result<()> {
      let connect = {
         let mut state = self.state.lock();
         state.bind_calls += 1;
         if state.reject_bind {
            return Err(VsError::ServiceUnavailable("mock".into()));
         }
         state.listener = Some(listener.clone());
         state.last_listener = Some(listener.clone());
         state.auto_connect
      };
      if connect {
         listener.on_service_connected(self.service.clone());
      }
      Ok(())
   }

   fn unbind(&self, listener: &ListenerRef) {
      let disconnect = {
         let mut state = self.state.lock();
         state.unbind_calls += 1;
         let bound = state
            .listener
            .as_ref()
            .is_some_and(|current| same_object(current, listener));
         if bound {
            state.listener = None;
         }
         bound && state.disconnect_on_unbind
      };
      if disconnect {
         listener.on_service_disconnected();
      }
   }
}
