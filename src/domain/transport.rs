// src/domain/transport.rs

//! Bus transport domain abstractions.
//!
//! This module defines the narrow interface the service runtime needs from
//! the underlying inter-process bus: receiving request and cancel events,
//! registering methods, issuing calls and subscriptions, and sending
//! responses. It intentionally avoids any reference to a concrete bus
//! library or wire format.
//!
//! The transport layer is responsible only for routing raw messages.
//! Higher-level semantics such as method dispatch, activities, and
//! subscription bookkeeping are handled by the server and client layers.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::{Error, Result, UniqueToken};
use bytes::Bytes;
use std::borrow::Cow;
use std::sync::Arc;

use tokio::sync::mpsc;

/// Visibility domain of a bus connection.
///
/// Services either hold one connection to a single access-controlled bus
/// ([`Unified`](BusRole::Unified)) or two connections, one restricted
/// ([`Private`](BusRole::Private)) and one general-access
/// ([`Public`](BusRole::Public)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusRole {
    /// Restricted bus, reachable only by privileged peers.
    Private,

    /// General-access bus.
    Public,

    /// Single bus with access control handled by the bus itself.
    Unified,
}

impl BusRole {
    /// True for the restricted bus.
    pub fn is_private(self) -> bool {
        matches!(self, BusRole::Private)
    }
}

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base` and returns it
/// from [`BusTransport::base`].
#[derive(Debug, Clone)]
pub struct TransportBase {
    /// Bus name of the service owning this connection.
    pub service_name: String,
    /// Which visibility domain the connection belongs to.
    pub role: BusRole,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(service_name: impl Into<String>, role: BusRole) -> Self {
        Self {
            service_name: service_name.into(),
            role,
        }
    }
}

/// One raw message as delivered by the bus.
///
/// Used for inbound requests, for responses to outbound calls, and for
/// cancel notifications. The payload is kept as raw bytes; parsing is left to
/// [`Message`](crate::Message), which never fails on malformed JSON.
#[derive(Clone, Debug)]
pub struct BusMessage {
    // ---
    /// Method category, always starting with `/`.
    pub category: String,

    /// Method name (last path segment).
    pub method: String,

    /// Raw JSON payload.
    pub payload: Bytes,

    /// Token identifying the exchange; responses and cancels carry the token
    /// of the request they belong to.
    pub unique_token: UniqueToken,

    /// Per-connection serial number of the exchange.
    pub token: u64,

    /// True when the sender expects more than one response.
    pub is_subscription: bool,

    /// Application id of the sender; empty for plain services. May carry a
    /// trailing `" <pid>"` suffix.
    pub application_id: String,

    /// Bus name of the sending service.
    pub sender_service_name: String,
}

impl BusMessage {
    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Sender identity: the application id up to its first space when
    /// present, else the sending service's bus name.
    pub fn sender(&self) -> String {
        // ---
        if self.application_id.is_empty() {
            self.sender_service_name.clone()
        } else {
            self.application_id
                .split(' ')
                .next()
                .unwrap_or_default()
                .to_string()
        }
    }
}

/// An event delivered by a bus connection.
#[derive(Clone, Debug)]
pub enum BusEvent {
    /// A method invocation addressed to this service.
    Request(BusMessage),

    /// A response to a call or subscription this connection issued.
    Response(BusMessage),

    /// The peer cancelled a subscription previously tracked with
    /// [`BusTransport::subscription_add`].
    Cancel(BusMessage),
}

/// Receiver for inbound request and cancel events of one connection.
pub struct EventInbox {
    // ---
    /// Events in arrival order. Closes when the connection unregisters.
    pub inbox: mpsc::UnboundedReceiver<BusEvent>,
}

/// Handle for one outbound call or subscription.
///
/// Responses arrive as [`BusEvent::Response`]. For a plain call the channel
/// closes after the first response; for a subscription it stays open until
/// [`BusTransport::cancel_call`] or until the callee goes away.
pub struct CallHandle {
    // ---
    /// Token of the exchange, used to cancel it.
    pub token: UniqueToken,

    /// Responses for this exchange.
    pub inbox: mpsc::UnboundedReceiver<BusEvent>,
}

/// A parsed bus URI: `luna://<service>/<category...>/<method>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusUri {
    /// Target service bus name.
    pub service: String,
    /// Method category, `/` when the path has a single segment.
    pub category: String,
    /// Method name.
    pub method: String,
}

impl BusUri {
    /// Parse a `luna://` or `palm://` URI.
    ///
    /// ```
    /// # use bus_service::BusUri;
    /// let uri = BusUri::parse("luna://com.example.svc/config/setGreeting").unwrap();
    /// assert_eq!(uri.service, "com.example.svc");
    /// assert_eq!(uri.category, "/config");
    /// assert_eq!(uri.method, "setGreeting");
    /// ```
    pub fn parse(uri: &str) -> Result<Self> {
        // ---
        let rest = uri
            .strip_prefix("luna://")
            .or_else(|| uri.strip_prefix("palm://"))
            .ok_or_else(|| Error::InvalidArgument(format!("unsupported bus uri: {uri}")))?;

        let (service, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidArgument(format!("bus uri has no method: {uri}")))?;

        if service.is_empty() {
            return Err(Error::InvalidArgument(format!("bus uri has no service: {uri}")));
        }

        let (category, method) = match path.rsplit_once('/') {
            Some((category, method)) => (format!("/{category}"), method),
            None => ("/".to_string(), path),
        };

        if method.is_empty() {
            return Err(Error::InvalidArgument(format!("bus uri has no method: {uri}")));
        }

        Ok(Self {
            service: service.to_string(),
            category,
            method: method.to_string(),
        })
    }
}

/// Bus transport abstraction.
///
/// A `BusTransport` is one logical connection to the bus, owned by one
/// service and bound to one [`BusRole`]. It defines the minimal contract the
/// runtime needs without committing to a specific bus library.
///
/// Implementations must ensure that:
/// - Requests and cancels addressed to the connection are queued in the
///   [`EventInbox`] returned by [`listen`](BusTransport::listen), in arrival
///   order.
/// - [`respond`](BusTransport::respond) and the subscription-tracking verbs
///   never block.
/// - A cancel event is only delivered for tokens that were tracked with
///   [`subscription_add`](BusTransport::subscription_add).
///
/// The in-memory bus serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat the methods as
/// normal `async fn`s.
#[async_trait::async_trait]
pub trait BusTransport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Bus name of the owning service.
    fn service_name(&self) -> &str {
        &self.base().service_name
    }

    /// Visibility domain of this connection.
    fn role(&self) -> BusRole {
        self.base().role
    }

    /// Start receiving inbound events.
    ///
    /// May be called once; later calls fail.
    async fn listen(&self) -> Result<EventInbox>;

    /// Make `category`/`method` callable on this connection.
    async fn register_method(&self, category: &str, method: &str) -> Result<()>;

    /// Issue a one-shot call. `session_id` selects a user session on buses
    /// that have them.
    async fn call(&self, uri: &str, payload: String, session_id: Option<&str>)
        -> Result<CallHandle>;

    /// Issue a subscription: the callee may answer any number of times.
    async fn subscribe(
        &self,
        uri: &str,
        payload: String,
        session_id: Option<&str>,
    ) -> Result<CallHandle>;

    /// Send a response for an inbound request. Returns false when the
    /// response could not be sent.
    fn respond(&self, request: &BusMessage, payload: String) -> bool;

    /// Track `request` as a subscription so the peer's cancel is delivered
    /// as [`BusEvent::Cancel`].
    fn subscription_add(&self, request: &BusMessage) -> bool;

    /// Stop tracking `request`; no cancel event will follow.
    fn subscription_remove(&self, request: &BusMessage);

    /// Cancel an outbound call or subscription issued on this connection.
    fn cancel_call(&self, token: &UniqueToken);

    /// Remove the connection from the bus. The event inbox closes.
    async fn unregister(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn BusTransport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
pub type TransportPtr = Arc<dyn BusTransport>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn message(application_id: &str) -> BusMessage {
        BusMessage {
            category: "/".into(),
            method: "hello".into(),
            payload: Bytes::from_static(b"{}"),
            unique_token: UniqueToken::from("t"),
            token: 1,
            is_subscription: false,
            application_id: application_id.into(),
            sender_service_name: "com.example.caller".into(),
        }
    }

    #[test]
    fn test_sender_prefers_application_id() {
        // ---
        assert_eq!(message("com.example.app 1234").sender(), "com.example.app");
        assert_eq!(message("").sender(), "com.example.caller");
    }

    #[test]
    fn test_parse_uri_single_segment() {
        // ---
        let uri = BusUri::parse("luna://com.example.svc/hello").unwrap();
        assert_eq!(uri.category, "/");
        assert_eq!(uri.method, "hello");
    }

    #[test]
    fn test_parse_uri_nested_category() {
        // ---
        let uri = BusUri::parse("palm://com.example.svc/do/re/me").unwrap();
        assert_eq!(uri.service, "com.example.svc");
        assert_eq!(uri.category, "/do/re");
        assert_eq!(uri.method, "me");
    }

    #[test]
    fn test_parse_uri_rejects_garbage() {
        // ---
        assert!(BusUri::parse("http://x/y").is_err());
        assert!(BusUri::parse("luna://com.example.svc").is_err());
        assert!(BusUri::parse("luna://com.example.svc/").is_err());
        assert!(BusUri::parse("luna:///hello").is_err());
    }
}
