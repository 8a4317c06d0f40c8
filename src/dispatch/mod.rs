//! Cooperative dispatch of readiness events to channels.
//!
//! [`Registry`] maps descriptors to [`Channel`](crate::Channel)s;
//! [`DispatchLoop`] waits on the registry and routes events. Two readiness
//! backends share the same dispatch semantics:
//!
//! - [`DispatchLoop::poll`]: three descriptor lists per iteration.
//! - [`DispatchLoop::poll2`]: persistent bitmask registration.

mod event_loop;
mod registry;

pub use event_loop::DispatchLoop;
pub use registry::{Registry, SharedRegistry};
