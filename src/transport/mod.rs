//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`BusTransport`](crate::BusTransport) trait, the receive loop that
//! drives them, and an in-memory activity authority for local runs.
//!
//! Domain code must not depend on transport-specific types.

mod authority;
mod memory;
pub(crate) mod runner;

pub use authority::{MemoryAuthority, AUTHORITY_SERVICE_NAME};
pub use memory::{create_memory_transport, MemoryHub};
