//! Bus event runner.
//!
//! This module provides the glue between a [`BusTransport`] connection and
//! the role that consumes its inbound events (the service dispatcher).
//!
//! The runner is responsible for:
//! - starting to listen on the connection
//! - driving a receive loop over the connection's event inbox
//! - handing every received [`BusEvent`] to the consumer
//! - consolidating logging for failed events
//!
//! It does **not** define dispatch semantics, activity handling, or
//! subscription bookkeeping.
//!
//! ## Receive loop
//!
//! [`run`] spawns a long-running task that waits for inbound events. When the
//! connection unregisters, its inbox closes and the loop exits naturally.
//!
//! ## Error handling
//!
//! Errors returned by [`BusConsumer::handle_event`] are logged and do not
//! terminate the receive loop: one bad message must not take the service
//! down.

use crate::Result;
use tokio::task::JoinHandle;

use crate::{
    // ---
    BusEvent,
    TransportPtr,
};

/// A consumer of inbound bus events.
///
/// Implementations should assume:
/// - events arrive in bus order per connection, but different connections
///   interleave arbitrarily
/// - a cancel may arrive for a token that is unknown or already gone
#[async_trait::async_trait]
pub trait BusConsumer: Send + Sync {
    /// Handle a single inbound event received on `handle`.
    ///
    /// Returning an error does not terminate the receive loop.
    async fn handle_event(&self, handle: &TransportPtr, event: BusEvent) -> Result<()>;
}

/// Start a receive loop for `transport`, feeding `consumer`.
///
/// The returned [`JoinHandle`] represents the lifetime of the loop. Dropping
/// it does not stop the loop; abort it or unregister the connection.
pub async fn run<T>(transport: TransportPtr, consumer: T) -> Result<JoinHandle<Result<()>>>
where
    T: BusConsumer + 'static,
{
    // ---
    let mut events = transport.listen().await?;

    let join = tokio::spawn(async move {
        // ---
        loop {
            match events.inbox.recv().await {
                Some(event) => {
                    log_trace!("{}: {event:?}", transport.service_name());
                    if let Err(_err) = consumer.handle_event(&transport, event).await {
                        log_warn!("{}: bus event error: {_err}", transport.service_name());
                    }
                }
                None => {
                    log_debug!("{}: {:?} connection closed", transport.service_name(), transport.role());
                    break;
                }
            }
        }
        Ok(())
    });

    Ok(join)
}
