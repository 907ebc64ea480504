//! Client-side session with the vendor-specific HCI service.
//!
//! A [`VendorSession`] binds to the service on construction, registers a relay
//! for notifications, and stays usable until it is released, either by the
//! client or because the service or transport failed. Release is terminal;
//! a new session must be constructed to talk to the service again.

use std::{
   cell::RefCell,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use log::{debug, error, info, trace, warn};
use parking_lot::ReentrantMutex;

use crate::{
   dispatch::NotifyQueue,
   error::Result,
   event::CallbackSet,
   remote::{ListenerRef, RelayRef, RemoteService, ServiceBinder},
   session::relay::{CallbackRelay, ConnectionListener},
};

pub mod lifecycle;
mod relay;

pub use lifecycle::ConnectionState;
use lifecycle::Lifecycle;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between the facade and the adapters handed to the binder and
/// the remote service.
pub(crate) struct SessionInner {
   pub(crate) id: u64,
   binder: Arc<dyn ServiceBinder>,
   callbacks: CallbackSet,
   notify: Arc<NotifyQueue>,
   relay: RelayRef,
   listener: ListenerRef,
   lifecycle: ReentrantMutex<RefCell<Lifecycle>>,
}

impl SessionInner {
   fn attempt_connect(&self) {
      {
         let guard = self.lifecycle.lock();
         if !guard.borrow_mut().begin_connect() {
            return;
         }
      }

      info!("session {}: binding to vendor service", self.id);
      match self.binder.bind(self.listener.clone()) {
         Ok(()) => {
            let guard = self.lifecycle.lock();
            let bound = guard.borrow_mut().mark_bound();
            if !bound {
               debug!("session {}: released while binding, undoing bind", self.id);
               self.binder.unbind(&self.listener);
            }
         },
         Err(e) => {
            error!("session {}: failed to bind vendor service: {e}", self.id);
            self.release(true);
         },
      }
   }

   pub(crate) fn service_connected(&self, service: Arc<dyn RemoteService>) {
      let guard = self.lifecycle.lock();
      let attached = guard.borrow_mut().attach(service.clone());
      if !attached {
         debug!("session {}: service connected after release, ignoring", self.id);
         return;
      }

      info!("session {}: vendor service connected, registering relay", self.id);
      match service.register_callback(&self.relay) {
         Ok(()) => {
            let registered = guard.borrow_mut().mark_registered();
            if !registered {
               // Released from inside the registration; nobody else will undo it.
               if let Err(e) = service.unregister_callback(&self.relay) {
                  warn!("session {}: failed to unregister relay: {e}", self.id);
               }
            }
         },
         Err(e) => {
            error!("session {}: failed to register relay: {e}", self.id);
            self.release(true);
         },
      }
   }

   pub(crate) fn service_disconnected(&self) {
      let guard = self.lifecycle.lock();
      guard.borrow_mut().detach();
      warn!("session {}: vendor service disconnected", self.id);
      self.release(true);
   }

   pub(crate) fn mark_active(&self) {
      let guard = self.lifecycle.lock();
      let activated = guard.borrow_mut().activate();
      if !activated {
         debug!(
            "session {}: ignoring ready signal while {}",
            self.id,
            guard.borrow().state()
         );
         return;
      }
      info!("session {}: vendor interface ready", self.id);
      self.callbacks.on_interface_ready();
   }

   pub(crate) fn deliver_command_complete(&self, opcode: u16, params: &[u8]) {
      let guard = self.lifecycle.lock();
      if !guard.borrow().is_usable() {
         trace!("session {}: dropping completion for {opcode:#06x}", self.id);
         return;
      }
      debug!(
         "← session {}: complete {opcode:#06x}: {}",
         self.id,
         hex::encode(params)
      );
      self.callbacks.on_command_complete(opcode, params);
   }

   pub(crate) fn deliver_event(&self, params: &[u8]) {
      let guard = self.lifecycle.lock();
      if !guard.borrow().is_usable() {
         trace!("session {}: dropping event", self.id);
         return;
      }
      debug!("← session {}: event: {}", self.id, hex::encode(params));
      self.callbacks.on_event(params);
   }

   /// Runs `op` against the service if the session is active. A failure
   /// releases the session and is reported through `on_interface_down`.
   fn with_service<F>(&self, what: &str, op: F)
   where
      F: FnOnce(&dyn RemoteService) -> Result<()>,
   {
      let guard = self.lifecycle.lock();
      let service = guard.borrow().usable_service();
      let Some(service) = service else {
         debug!(
            "session {}: {what} ignored while {}",
            self.id,
            guard.borrow().state()
         );
         return;
      };
      if let Err(e) = op(&*service) {
         error!("session {}: {what} failed: {e}", self.id);
         self.release(true);
      }
   }

   /// Tears the session down. Only the first call has any effect.
   pub(crate) fn release(&self, notify: bool) {
      let guard = self.lifecycle.lock();
      let teardown = guard.borrow_mut().release();
      let Some(teardown) = teardown else {
         return;
      };
      info!("session {}: released (notify: {notify})", self.id);

      if teardown.registered
         && let Some(service) = &teardown.service
         && let Err(e) = service.unregister_callback(&self.relay)
      {
         warn!("session {}: failed to unregister relay: {e}", self.id);
      }

      if teardown.bound {
         self.binder.unbind(&self.listener);
      }

      if notify {
         let callbacks = self.callbacks.clone();
         let id = self.id;
         self.notify.post(move || {
            debug!("session {id}: delivering interface down");
            callbacks.on_interface_down();
         });
      }
   }
}

/// A session with the vendor-specific HCI service.
///
/// None of the operations report errors directly. A session that is not yet
/// ready, or already released, silently ignores commands and filter changes;
/// transport failures release the session and surface as a single
/// `on_interface_down` callback.
///
/// Dropping a session releases it without notifying the client.
pub struct VendorSession(Arc<SessionInner>);

impl VendorSession {
   /// Creates a session and immediately starts binding to the service.
   ///
   /// A bind request rejected by `binder` is reported through
   /// `on_interface_down` on `notify`, like any later failure.
   pub fn new(
      binder: Arc<dyn ServiceBinder>,
      callbacks: CallbackSet,
      notify: Arc<NotifyQueue>,
   ) -> Self {
      let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
      let inner = Arc::new_cyclic(|weak| SessionInner {
         id,
         binder,
         callbacks,
         notify,
         relay: Arc::new(CallbackRelay::new(weak.clone())),
         listener: Arc::new(ConnectionListener::new(weak.clone())),
         lifecycle: ReentrantMutex::new(RefCell::new(Lifecycle::new())),
      });
      inner.attempt_connect();
      Self(inner)
   }

   /// Process-unique identifier used in log messages.
   pub fn id(&self) -> u64 {
      self.0.id
   }

   pub fn state(&self) -> ConnectionState {
      self.0.lifecycle.lock().borrow().state()
   }

   pub fn is_ready(&self) -> bool {
      self.state() == ConnectionState::Active
   }

   /// Sends a vendor-specific command to the controller.
   pub fn send_command(&self, opcode: u16, params: &[u8]) {
      let id = self.0.id;
      self.0.with_service("send command", |service| {
         debug!("→ session {id}: command {opcode:#06x}: {}", hex::encode(params));
         service.send_command(opcode, params)
      });
   }

   /// Sets the filter selecting which vendor events are delivered.
   ///
   /// Without a filter no events are delivered. Events shorter than `mask`
   /// are never delivered. `mask` and `value` must have the same length.
   pub fn set_filter(&self, mask: &[u8], value: &[u8]) {
      self.set_event_filter(Some(mask), Some(value));
   }

   /// Clears the event filter; no events are delivered until a new one is set.
   pub fn clear_filter(&self) {
      self.set_event_filter(None, None);
   }

   fn set_event_filter(&self, mask: Option<&[u8]>, value: Option<&[u8]>) {
      let relay = self.0.relay.clone();
      self.0.with_service("set event filter", |service| {
         service.set_event_filter(&relay, mask, value)
      });
   }

   /// Releases the session. The client is not notified.
   pub fn release(&self) {
      self.0.release(false);
   }
}

impl Drop for VendorSession {
   fn drop(&mut self) {
      self.0.release(false);
   }
}

#[cfg(test)]
mod tests {
   use std::{sync::atomic::AtomicUsize, thread};

   use super::*;
   use crate::{
      event::VendorCallbacks,
      remote::mock::{MockBinder, MockCall, MockService},
   };

   #[derive(Default)]
   struct Recorder {
      ready: AtomicUsize,
      down: AtomicUsize,
      completions: parking_lot::Mutex<Vec<(u16, Vec<u8>)>>,
      events: parking_lot::Mutex<Vec<Vec<u8>>>,
   }

   impl Recorder {
      fn ready(&self) -> usize {
         self.ready.load(Ordering::SeqCst)
      }

      fn down(&self) -> usize {
         self.down.load(Ordering::SeqCst)
      }
   }

   impl VendorCallbacks for Recorder {
      fn on_interface_ready(&self) {
         self.ready.fetch_add(1, Ordering::SeqCst);
      }

      fn on_interface_down(&self) {
         self.down.fetch_add(1, Ordering::SeqCst);
      }

      fn on_command_complete(&self, opcode: u16, params: &[u8]) {
         self.completions.lock().push((opcode, params.to_vec()));
      }

      fn on_event(&self, params: &[u8]) {
         self.events.lock().push(params.to_vec());
      }
   }

   struct Harness {
      service: Arc<MockService>,
      binder: Arc<MockBinder>,
      recorder: Arc<Recorder>,
      queue: Arc<NotifyQueue>,
   }

   impl Harness {
      fn new() -> Self {
         let service = MockService::new();
         let binder = MockBinder::new(service.clone());
         Self {
            service,
            binder,
            recorder: Arc::new(Recorder::default()),
            queue: NotifyQueue::new(),
         }
      }

      fn session(&self) -> VendorSession {
         VendorSession::new(
            self.binder.clone(),
            self.recorder.clone(),
            self.queue.clone(),
         )
      }

      /// Binds, connects, and signals ready.
      fn active_session(&self) -> VendorSession {
         let session = self.session();
         assert!(self.binder.connect());
         assert!(self.service.signal_ready());
         assert_eq!(session.state(), ConnectionState::Active);
         session
      }
   }

   #[test]
   fn test_connect_sequence() {
      let h = Harness::new();
      let session = h.session();
      assert_eq!(session.state(), ConnectionState::Connecting);
      assert_eq!(h.binder.bind_calls(), 1);
      assert!(!h.service.is_registered());

      h.binder.connect();
      assert!(h.service.is_registered());
      assert_eq!(session.state(), ConnectionState::Connecting);

      h.service.signal_ready();
      assert!(session.is_ready());
      assert_eq!(h.recorder.ready(), 1);
   }

   #[test]
   fn test_duplicate_ready_is_deduplicated() {
      let h = Harness::new();
      let session = h.active_session();
      for _ in 0..5 {
         h.service.signal_ready();
      }
      assert_eq!(h.recorder.ready(), 1);
      assert!(session.is_ready());
   }

   #[test]
   fn test_bind_failure_reports_down_once() {
      let h = Harness::new();
      h.binder.reject_bind(true);
      let session = h.session();

      assert_eq!(session.state(), ConnectionState::Released);
      // Delivery is deferred to the queue.
      assert_eq!(h.recorder.down(), 0);
      assert_eq!(h.queue.run_pending(), 1);
      assert_eq!(h.recorder.down(), 1);
      assert_eq!(h.recorder.ready(), 0);

      session.send_command(0x0042, &[0xAA]);
      session.set_filter(&[0x01], &[0x01]);
      session.clear_filter();
      session.release();
      assert_eq!(h.queue.run_pending(), 0);
      assert_eq!(h.recorder.down(), 1);
      assert_eq!(h.service.calls(MockCall::SendCommand), 0);
      assert_eq!(h.binder.unbind_calls(), 0);
   }

   #[test]
   fn test_release_during_bind_undoes_binding() {
      let h = Harness::new();
      h.binder.auto_connect(true);
      h.service.fail(MockCall::Register);
      let session = h.session();

      // Released from inside bind, before the binding was recorded.
      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.binder.bind_calls(), 1);
      assert_eq!(h.binder.unbind_calls(), 1);
      assert!(!h.binder.is_bound());
      assert_eq!(h.queue.run_pending(), 1);
      assert_eq!(h.recorder.down(), 1);
   }

   #[test]
   fn test_release_during_register_undoes_registration() {
      let h = Harness::new();
      h.service.down_on_register(true);
      let session = h.session();
      h.binder.connect();

      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Register), 1);
      assert_eq!(h.service.calls(MockCall::Unregister), 1);
      assert!(!h.service.is_registered());
      assert_eq!(h.binder.unbind_calls(), 1);
      assert_eq!(h.queue.run_pending(), 1);
      assert_eq!(h.recorder.down(), 1);
      assert_eq!(h.recorder.ready(), 0);
   }

   #[test]
   fn test_connection_after_release_is_ignored() {
      let h = Harness::new();
      let session = h.session();
      let listener = h.binder.last_listener().expect("listener was bound");
      session.release();

      listener.on_service_connected(h.service.clone());
      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Register), 0);
      assert!(!h.service.is_registered());
      assert_eq!(h.queue.run_pending(), 0);
   }

   #[test]
   fn test_calls_before_ready_are_noops() {
      let h = Harness::new();
      let session = h.session();
      session.send_command(0x0042, &[0xAA]);
      session.set_filter(&[0x01], &[0x01]);

      h.binder.connect();
      session.send_command(0x0042, &[0xAA]);
      session.clear_filter();

      assert_eq!(h.service.calls(MockCall::SendCommand), 0);
      assert_eq!(h.service.calls(MockCall::SetEventFilter), 0);
      assert_eq!(session.state(), ConnectionState::Connecting);
   }

   #[test]
   fn test_send_command_delegates() {
      let h = Harness::new();
      let session = h.active_session();
      session.send_command(0xFC42, &[0x01, 0x02]);
      assert_eq!(h.service.commands(), vec![(0xFC42, vec![0x01, 0x02])]);

      h.service.complete(0xFC42, &[0x00]);
      assert_eq!(*h.recorder.completions.lock(), vec![(0xFC42, vec![0x00])]);
   }

   #[test]
   fn test_command_transport_error_releases_with_notification() {
      let h = Harness::new();
      let session = h.active_session();
      h.service.fail(MockCall::SendCommand);

      session.send_command(0x0042, &[0xAA]);
      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Unregister), 1);
      assert_eq!(h.binder.unbind_calls(), 1);

      h.queue.run_pending();
      assert_eq!(h.recorder.down(), 1);

      session.send_command(0x0042, &[0xAA]);
      assert_eq!(h.service.calls(MockCall::SendCommand), 1);
   }

   #[test]
   fn test_filter_error_releases_with_notification() {
      let h = Harness::new();
      let session = h.active_session();
      h.service.fail(MockCall::SetEventFilter);

      session.set_filter(&[0x01], &[0x01]);
      assert_eq!(session.state(), ConnectionState::Released);
      h.queue.run_pending();
      assert_eq!(h.recorder.down(), 1);
   }

   #[test]
   fn test_register_failure_releases_with_notification() {
      let h = Harness::new();
      h.service.fail(MockCall::Register);
      let session = h.session();
      h.binder.connect();

      assert_eq!(session.state(), ConnectionState::Released);
      // Never registered, so never unregistered.
      assert_eq!(h.service.calls(MockCall::Unregister), 0);
      assert_eq!(h.binder.unbind_calls(), 1);
      h.queue.run_pending();
      assert_eq!(h.recorder.down(), 1);
   }

   #[test]
   fn test_events_follow_filter() {
      let h = Harness::new();
      let session = h.active_session();

      // No filter yet: nothing is delivered.
      assert!(!h.service.emit_event(&[0x01]));

      session.set_filter(&[0x01], &[0x01]);
      assert!(h.service.emit_event(&[0x01, 0x02]));
      assert!(!h.service.emit_event(&[0x00]));
      assert!(!h.service.emit_event(&[]));

      session.clear_filter();
      assert!(!h.service.emit_event(&[0x01]));
      assert_eq!(*h.recorder.events.lock(), vec![vec![0x01, 0x02]]);
      assert_eq!(h.service.calls(MockCall::SetEventFilter), 2);
   }

   #[test]
   fn test_client_release_is_silent_and_balanced() {
      let h = Harness::new();
      let session = h.active_session();
      for _ in 0..3 {
         session.release();
      }
      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Unregister), 1);
      assert_eq!(h.binder.unbind_calls(), 1);
      assert_eq!(h.queue.run_pending(), 0);
      assert_eq!(h.recorder.down(), 0);
   }

   #[test]
   fn test_remote_down_releases_with_notification() {
      let h = Harness::new();
      let session = h.active_session();
      h.service.signal_down();
      h.service.signal_down();

      assert_eq!(session.state(), ConnectionState::Released);
      h.queue.run_pending();
      assert_eq!(h.recorder.down(), 1);
   }

   #[test]
   fn test_down_before_ready() {
      let h = Harness::new();
      let session = h.session();
      h.binder.connect();
      h.service.signal_down();

      assert_eq!(session.state(), ConnectionState::Released);
      h.queue.run_pending();
      assert_eq!(h.recorder.down(), 1);
      assert_eq!(h.recorder.ready(), 0);
   }

   #[test]
   fn test_service_disconnect_skips_unregister() {
      let h = Harness::new();
      let session = h.active_session();
      h.binder.disconnect();

      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Unregister), 0);
      assert_eq!(h.binder.unbind_calls(), 1);
      h.queue.run_pending();
      assert_eq!(h.recorder.down(), 1);
   }

   #[test]
   fn test_nothing_delivered_after_release() {
      let h = Harness::new();
      let session = h.active_session();
      session.set_filter(&[], &[]);
      let relay = h.service.last_relay().expect("relay was registered");
      session.release();

      // A remote that ignores the unregistration keeps calling the relay.
      relay.interface_ready();
      relay.command_complete(0x0042, &[0x00]);
      relay.event_received(&[0x01]);
      relay.interface_down();

      assert_eq!(h.recorder.ready(), 1);
      assert!(h.recorder.completions.lock().is_empty());
      assert!(h.recorder.events.lock().is_empty());
      assert_eq!(h.queue.run_pending(), 0);
   }

   #[test]
   fn test_unregister_failure_is_ignored() {
      let h = Harness::new();
      let session = h.active_session();
      h.service.fail(MockCall::Unregister);
      session.release();

      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.binder.unbind_calls(), 1);
      assert_eq!(h.queue.run_pending(), 0);
   }

   #[test]
   fn test_disconnect_reported_from_inside_unbind() {
      let h = Harness::new();
      h.binder.disconnect_on_unbind(true);
      let session = h.active_session();
      session.release();

      assert_eq!(h.binder.unbind_calls(), 1);
      assert_eq!(h.queue.run_pending(), 0);
      assert_eq!(h.recorder.down(), 0);
   }

   #[test]
   fn test_synchronous_connect_and_ready() {
      let h = Harness::new();
      h.binder.auto_connect(true);
      h.service.ready_on_register(true);
      let session = h.session();

      assert!(session.is_ready());
      assert_eq!(h.recorder.ready(), 1);
      assert_eq!(h.service.calls(MockCall::Register), 1);
   }

   #[test]
   fn test_drop_releases_silently() {
      let h = Harness::new();
      let session = h.active_session();
      drop(session);

      assert!(!h.service.is_registered());
      assert!(!h.binder.is_bound());
      assert_eq!(h.queue.run_pending(), 0);
      assert_eq!(h.recorder.down(), 0);
      // The relay outlives the session but has nowhere to deliver.
      h.service.last_relay().unwrap().interface_down();
      assert_eq!(h.queue.run_pending(), 0);
   }

   #[test]
   fn test_concurrent_release_is_idempotent() {
      let h = Harness::new();
      let session = h.active_session();
      session.set_filter(&[], &[]);
      let relay = h.service.last_relay().unwrap();

      thread::scope(|s| {
         for i in 0..8 {
            let session = &session;
            let relay = relay.clone();
            s.spawn(move || {
               for _ in 0..50 {
                  match i % 4 {
                     0 => session.release(),
                     1 => relay.interface_down(),
                     2 => relay.event_received(&[0x01]),
                     _ => session.send_command(0x0042, &[0xAA]),
                  }
               }
            });
         }
      });

      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Unregister), 1);
      assert_eq!(h.binder.unbind_calls(), 1);
      h.queue.run_pending();
      assert!(h.recorder.down() <= 1);

      let events = h.recorder.events.lock().len();
      relay.event_received(&[0x01]);
      assert_eq!(h.recorder.events.lock().len(), events);
   }

   #[test]
   fn test_concurrent_client_release_stays_silent() {
      let h = Harness::new();
      let session = h.active_session();
      session.set_filter(&[], &[]);
      let relay = h.service.last_relay().unwrap();

      thread::scope(|s| {
         for i in 0..6 {
            let session = &session;
            let relay = relay.clone();
            s.spawn(move || {
               for _ in 0..50 {
                  match i % 3 {
                     0 => session.release(),
                     1 => relay.event_received(&[0x01]),
                     _ => session.send_command(0x0042, &[0xAA]),
                  }
               }
            });
         }
      });

      assert_eq!(session.state(), ConnectionState::Released);
      assert_eq!(h.service.calls(MockCall::Unregister), 1);
      assert_eq!(h.binder.unbind_calls(), 1);
      assert_eq!(h.queue.run_pending(), 0);
      assert_eq!(h.recorder.down(), 0);
   }

   #[test]
   fn test_callbacks_may_reenter_session() {
      struct Reentrant {
         session: parking_lot::Mutex<Option<Arc<VendorSession>>>,
         completions: AtomicUsize,
      }

      impl VendorCallbacks for Reentrant {
         fn on_interface_ready(&self) {
            let session = self.session.lock().clone();
            if let Some(session) = session {
               session.send_command(0xFC01, &[]);
            }
         }

         fn on_interface_down(&self) {}

         fn on_command_complete(&self, _opcode: u16, _params: &[u8]) {
            self.completions.fetch_add(1, Ordering::SeqCst);
            let session = self.session.lock().take();
            if let Some(session) = session {
               session.release();
            }
         }

         fn on_event(&self, _params: &[u8]) {}
      }

      let service = MockService::new();
      let binder = MockBinder::new(service.clone());
      let callbacks = Arc::new(Reentrant {
         session: parking_lot::Mutex::new(None),
         completions: AtomicUsize::new(0),
      });
      let session = Arc::new(VendorSession::new(
         binder.clone(),
         callbacks.clone(),
         NotifyQueue::new(),
      ));
      *callbacks.session.lock() = Some(session.clone());

      binder.connect();
      service.signal_ready();
      assert_eq!(service.commands(), vec![(0xFC01, vec![])]);

      service.complete(0xFC01, &[0x00]);
      service.complete(0xFC01, &[0x00]);
      assert_eq!(callbacks.completions.load(Ordering::SeqCst), 1);
      assert_eq!(session.state(), ConnectionState::Released);
   }
}
