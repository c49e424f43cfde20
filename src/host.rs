//! Embedding host hooks.
//!
//! A service normally owns its process. When several services are loaded
//! into one shared host process instead, the host counts live activities
//! across all of them and decides itself when to stop. It receives the
//! notifications below and is asked to clean a service up where a
//! standalone process would simply exit.

use std::sync::Arc;

/// Notifications forwarded to an embedding host.
///
/// All methods default to no-ops. They are called without any runtime lock
/// held.
pub trait ServiceHost: Send + Sync {
    /// A new activity went live.
    fn increase_activity(&self) {}

    /// A live activity completed.
    fn decrease_activity(&self) {}

    /// The service has no live activities left.
    fn enter_idle(&self) {}

    /// The service unregistered from the bus and can be unloaded.
    fn cleanup(&self, _bus_id: &str) {}
}

/// Shared host pointer.
pub type HostPtr = Arc<dyn ServiceHost>;
