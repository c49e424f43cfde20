//! Service runtime for an inter-process message bus
//!
//! This library turns raw bus events into application callbacks. It
//! dispatches method requests to registered handlers, backs every request
//! with a keepalive activity from the bus-side activity authority, tracks
//! multi-response subscriptions until they are cancelled, and stops the
//! service once nothing has been live for the idle timeout.
//!

#[macro_use]
mod macros;

// Import all sub modules once...
mod activity;
mod client;
mod domain;
mod server;
mod transport;

mod config;
mod host;
mod message;
mod shutdown;
mod sync;

mod error;
mod token;

// Re-export main types
pub use activity::{Activity, ActivityManager, ActivitySpec};
pub use client::{BusClient, Subscription, SubscriptionEvent};
pub use server::{is_privileged, BoxFuture, BoxedHandler, BusWiring, MethodSpec, Service, ServiceBuilder};

pub use config::{
    //
    ActivityConfig,
    ServiceConfig,
    DEFAULT_ACTIVITY_AUTHORITY_URI,
    DISABLE_ACTIVITY_CREATION_FLAG,
    DISABLE_TIMEOUTS_FLAG,
};
pub use host::{HostPtr, ServiceHost};
pub use message::{normalize_response, Message};
pub use shutdown::{ShutdownReason, ShutdownSignal};

pub use error::{Error, Result};
pub use token::UniqueToken;

pub use transport::{create_memory_transport, MemoryAuthority, MemoryHub, AUTHORITY_SERVICE_NAME};

// --- public re-exports
pub use domain::{
    //
    BusEvent,
    BusMessage,
    BusRole,
    BusTransport,
    BusUri,
    CallHandle,
    EventInbox,
    TransportBase,
    TransportPtr,
};
