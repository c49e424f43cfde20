//! In-memory bus implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`BusTransport`] trait. It is intended primarily for testing, local
//! execution, and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - A connection is identified by `(service name, role)`; connecting the same
//!   pair twice fails.
//! - Calls are routed by the service part of the URI. A caller on the
//!   restricted bus reaches the callee's private connection first, a caller on
//!   the general-access bus its public connection; both fall back to a unified
//!   connection.
//! - A call to an unknown service or to a method the callee never registered
//!   on the reached connection is answered by the bus itself with a
//!   `returnValue: false` response.
//! - Requests are queued until the callee listens; nothing is dropped because
//!   of scheduling.
//! - A client cancel reaches the callee only for tokens tracked with
//!   `subscription_add`.
//!
//! ## Non-Goals
//!
//! Security policy, multi-session routing, and any wire format.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use serde_json::json;
use tokio::sync::mpsc;

use crate::sync::lock_ignore_poison;
use crate::{
    // ---
    BusEvent,
    BusMessage,
    BusRole,
    BusTransport,
    BusUri,
    CallHandle,
    Error,
    EventInbox,
    Result,
    TransportBase,
    TransportPtr,
    UniqueToken,
};

type EndpointKey = (String, BusRole);

struct Endpoint {
    // ---
    events: mpsc::UnboundedSender<BusEvent>,
    methods: HashSet<(String, String)>,
}

struct PendingCall {
    // ---
    reply: mpsc::UnboundedSender<BusEvent>,
    request: BusMessage,
    caller: EndpointKey,
    callee: EndpointKey,
    subscription: bool,
    tracked: bool,
}

/// Shared in-process bus.
///
/// All connections created from the same hub can call each other, exactly as
/// services attached to a real bus daemon would.
///
/// # Usage in Integration Tests
///
/// Construct a hub per test so parallel tests do not see each other's
/// services:
///
/// ```
/// # use bus_service::{MemoryHub, BusRole};
/// # fn example() -> bus_service::Result<()> {
/// let hub = MemoryHub::new();
/// let private = hub.connect("com.example.svc", BusRole::Private)?;
/// let public = hub.connect("com.example.svc", BusRole::Public)?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    endpoints: Mutex<HashMap<EndpointKey, Endpoint>>,
    calls: Mutex<HashMap<UniqueToken, PendingCall>>,
    serial: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Open a connection for `service_name` in the given visibility domain.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if that service already holds a
    /// connection with the same role.
    pub fn connect(self: &Arc<Self>, service_name: &str, role: BusRole) -> Result<TransportPtr> {
        // ---
        let key = (service_name.to_string(), role);
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut endpoints = lock_ignore_poison(&self.endpoints);
            if endpoints.contains_key(&key) {
                return Err(Error::Transport(format!(
                    "{service_name} is already connected as {role:?}"
                )));
            }
            endpoints.insert(
                key,
                Endpoint {
                    events: tx,
                    methods: HashSet::new(),
                },
            );
        }

        log_debug!("{service_name}: connected to memory hub as {role:?}");

        Ok(Arc::new(MemoryTransport {
            base: TransportBase::new(service_name, role),
            hub: self.clone(),
            inbox: Mutex::new(Some(rx)),
        }))
    }

    /// Number of outbound exchanges still awaiting responses.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.calls).len()
    }

    fn route_roles(caller: BusRole) -> &'static [BusRole] {
        match caller {
            BusRole::Private => &[BusRole::Private, BusRole::Unified],
            BusRole::Public => &[BusRole::Public, BusRole::Unified],
            BusRole::Unified => &[BusRole::Unified, BusRole::Private, BusRole::Public],
        }
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send(
        &self,
        caller: &TransportBase,
        uri: &str,
        payload: String,
        subscription: bool,
    ) -> Result<CallHandle> {
        // ---
        let target = BusUri::parse(uri)?;
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let token = UniqueToken::generate();

        let request = BusMessage {
            category: target.category.clone(),
            method: target.method.clone(),
            payload: Bytes::from(payload),
            unique_token: token.clone(),
            token: self.next_serial(),
            is_subscription: subscription,
            application_id: String::new(),
            sender_service_name: caller.service_name.clone(),
        };

        // Resolve the callee connection and its event sender
        let resolved = {
            let endpoints = lock_ignore_poison(&self.endpoints);
            Self::route_roles(caller.role)
                .iter()
                .map(|role| (target.service.clone(), *role))
                .find_map(|key| endpoints.get(&key).map(|ep| (key, ep)))
                .map(|(key, ep)| {
                    let registered = ep
                        .methods
                        .contains(&(target.category.clone(), target.method.clone()));
                    (key, ep.events.clone(), registered)
                })
        };

        let (callee, events) = match resolved {
            Some((key, events, true)) => (key, events),
            Some((_, _, false)) => {
                let err = Error::MethodNotFound {
                    category: target.category,
                    method: target.method,
                };
                Self::reply_error(&reply_tx, &request, &err);
                return Ok(CallHandle {
                    token,
                    inbox: reply_rx,
                });
            }
            None => {
                let err = Error::ServiceNotFound(target.service);
                Self::reply_error(&reply_tx, &request, &err);
                return Ok(CallHandle {
                    token,
                    inbox: reply_rx,
                });
            }
        };

        lock_ignore_poison(&self.calls).insert(
            token.clone(),
            PendingCall {
                reply: reply_tx.clone(),
                request: request.clone(),
                caller: (caller.service_name.clone(), caller.role),
                callee,
                subscription,
                tracked: false,
            },
        );

        if events.send(BusEvent::Request(request.clone())).is_err() {
            lock_ignore_poison(&self.calls).remove(&token);
            Self::reply_error(
                &reply_tx,
                &request,
                &Error::ChannelClosed(format!("{} stopped listening", target.service)),
            );
        }

        Ok(CallHandle {
            token,
            inbox: reply_rx,
        })
    }

    fn reply_error(reply: &mpsc::UnboundedSender<BusEvent>, request: &BusMessage, err: &Error) {
        // ---
        let payload = json!({
            "returnValue": false,
            "errorCode": err.error_code(),
            "errorText": err.to_string(),
        });
        let mut response = request.clone();
        response.payload = Bytes::from(payload.to_string());
        let _ = reply.send(BusEvent::Response(response));
    }

    fn respond(&self, request: &BusMessage, payload: String) -> bool {
        // ---
        let mut calls = lock_ignore_poison(&self.calls);
        let Some(call) = calls.get(&request.unique_token) else {
            log_debug!("no pending call for token {}", request.unique_token);
            return false;
        };

        let mut response = call.request.clone();
        response.payload = Bytes::from(payload);
        let delivered = call.reply.send(BusEvent::Response(response)).is_ok();
        let keep = call.subscription && delivered;

        if !keep {
            calls.remove(&request.unique_token);
        }
        delivered
    }

    fn set_tracked(&self, request: &BusMessage, tracked: bool) -> bool {
        // ---
        let mut calls = lock_ignore_poison(&self.calls);
        match calls.get_mut(&request.unique_token) {
            Some(call) if call.subscription => {
                call.tracked = tracked;
                true
            }
            _ => false,
        }
    }

    fn cancel(&self, token: &UniqueToken) {
        // ---
        let Some(call) = lock_ignore_poison(&self.calls).remove(token) else {
            return;
        };

        if !(call.subscription && call.tracked) {
            return;
        }

        let events = lock_ignore_poison(&self.endpoints)
            .get(&call.callee)
            .map(|ep| ep.events.clone());

        if let Some(events) = events {
            let _ = events.send(BusEvent::Cancel(call.request));
        }
    }

    fn drop_endpoint(&self, key: &EndpointKey) {
        // ---
        lock_ignore_poison(&self.endpoints).remove(key);

        // Calls in either direction die with the connection; callers see
        // their reply channel close.
        lock_ignore_poison(&self.calls).retain(|_, call| &call.callee != key && &call.caller != key);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            endpoints: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            serial: AtomicU64::new(0),
        }
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// One connection to a [`MemoryHub`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    hub: Arc<MemoryHub>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
}

impl MemoryTransport {
    fn key(&self) -> EndpointKey {
        (self.base.service_name.clone(), self.base.role)
    }
}

#[async_trait::async_trait]
impl BusTransport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn listen(&self) -> Result<EventInbox> {
        // ---
        lock_ignore_poison(&self.inbox)
            .take()
            .map(|inbox| EventInbox { inbox })
            .ok_or_else(|| Error::Transport(format!("{}: already listening", self.service_name())))
    }

    async fn register_method(&self, category: &str, method: &str) -> Result<()> {
        // ---
        let mut endpoints = lock_ignore_poison(&self.hub.endpoints);
        let endpoint = endpoints
            .get_mut(&self.key())
            .ok_or_else(|| Error::Transport(format!("{}: not connected", self.service_name())))?;

        endpoint
            .methods
            .insert((category.to_string(), method.to_string()));

        log_debug!("{}: registered {category}/{method} on {:?}", self.service_name(), self.role());
        Ok(())
    }

    async fn call(
        &self,
        uri: &str,
        payload: String,
        session_id: Option<&str>,
    ) -> Result<CallHandle> {
        // ---
        if let Some(_session) = session_id {
            log_debug!("{}: session {_session} ignored by memory hub", self.service_name());
        }
        self.hub.send(&self.base, uri, payload, false)
    }

    async fn subscribe(
        &self,
        uri: &str,
        payload: String,
        session_id: Option<&str>,
    ) -> Result<CallHandle> {
        // ---
        if let Some(_session) = session_id {
            log_debug!("{}: session {_session} ignored by memory hub", self.service_name());
        }
        self.hub.send(&self.base, uri, payload, true)
    }

    fn respond(&self, request: &BusMessage, payload: String) -> bool {
        self.hub.respond(request, payload)
    }

    fn subscription_add(&self, request: &BusMessage) -> bool {
        self.hub.set_tracked(request, true)
    }

    fn subscription_remove(&self, request: &BusMessage) {
        self.hub.set_tracked(request, false);
    }

    fn cancel_call(&self, token: &UniqueToken) {
        self.hub.cancel(token)
    }

    async fn unregister(&self) -> Result<()> {
        // ---
        log_debug!("{}: unregistering {:?} connection", self.service_name(), self.role());
        self.hub.drop_endpoint(&self.key());
        Ok(())
    }
}

/// Create a connection on the process-global hub.
///
/// All connections created with this function share one bus. For isolated
/// parallel testing, use [`MemoryHub::new`] and [`MemoryHub::connect`].
pub fn create_memory_transport(service_name: &str, role: BusRole) -> Result<TransportPtr> {
    // ---
    global_hub().connect(service_name, role)
}
