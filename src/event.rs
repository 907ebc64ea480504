//! Client-facing notifications of a vendor session.
//!
//! A session reports everything through a single callback set supplied at
//! construction: readiness, terminal failure, command completions, and
//! filtered vendor events.

use std::sync::Arc;

/// Callback set implemented by the client of a [`VendorSession`].
///
/// `on_interface_ready`, `on_command_complete`, and `on_event` run on the
/// thread that delivered the remote notification, with the session lock held.
/// They may call back into the session, but must not block on another thread
/// that uses the same session.
///
/// `on_interface_down` is never invoked under the session lock; it is posted
/// to the session's [`NotifyQueue`] and runs wherever that queue is drained.
///
/// [`VendorSession`]: crate::session::VendorSession
/// [`NotifyQueue`]: crate::dispatch::NotifyQueue
pub trait VendorCallbacks: Send + Sync {
   /// The interface finished initialization and accepts commands.
   fn on_interface_ready(&self);

   /// The interface is permanently unusable. Delivered at most once.
   fn on_interface_down(&self);

   /// A command complete was received for a previously sent command.
   fn on_command_complete(&self, opcode: u16, params: &[u8]);

   /// A vendor event that matched the current filter was received.
   fn on_event(&self, params: &[u8]);
}

/// Type alias for a shared callback set.
pub type CallbackSet = Arc<dyn VendorCallbacks>;
