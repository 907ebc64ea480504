//! Client side of a Bluetooth vendor-specific HCI session.
//!
//! A [`VendorSession`] binds to a privileged vendor service, registers a relay
//! for notifications, and lets its client send vendor commands and filter
//! vendor events until the session is released. Transports plug in through
//! the traits in [`remote`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod remote;
pub mod session;
pub mod vendor;

pub use dispatch::NotifyQueue;
pub use error::{Result, VsError};
pub use event::{CallbackSet, VendorCallbacks};
pub use session::{ConnectionState, VendorSession};
pub use vendor::{CommandRequest, EventFilter};
