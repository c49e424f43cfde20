//! In-memory activity authority.
//!
//! A minimal stand-in for the bus-side activity authority, attached to a
//! [`MemoryHub`]. It answers `create`, `adopt` and `complete` the way the
//! real authority does for the parts the runtime relies on:
//!
//! - `create` assigns numeric ids starting at 1. With `subscribe: true` the
//!   caller's subscription is kept open and answered with
//!   `{"event": "complete"}` when the activity completes.
//! - `adopt` answers `{"adopted": true}` for known, uncompleted activities
//!   and keeps the subscription open the same way.
//! - `complete` marks the activity completed and records the options.
//!
//! Failures can be injected for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::message::payload_from_bytes;
use crate::sync::lock_ignore_poison;
use crate::{BusEvent, BusMessage, BusRole, MemoryHub, Result, TransportPtr, UniqueToken};

/// Bus name the authority registers under.
pub const AUTHORITY_SERVICE_NAME: &str = "com.webos.service.activitymanager";

struct Record {
    // ---
    name: String,
    completed: bool,
    subscribers: Vec<BusMessage>,
}

#[derive(Default)]
struct State {
    // ---
    next_id: u64,
    records: HashMap<u64, Record>,
    completions: Vec<(u64, Map<String, Value>)>,
    fail_next_create: Option<String>,
    refuse_adopt: HashSet<u64>,
}

struct Inner {
    // ---
    transport: TransportPtr,
    state: Mutex<State>,
}

/// Activity authority serving a [`MemoryHub`].
///
/// Stops serving when dropped.
///
/// ```no_run
/// # use bus_service::{MemoryAuthority, MemoryHub};
/// # async fn example() -> bus_service::Result<()> {
/// let hub = MemoryHub::new();
/// let authority = MemoryAuthority::spawn(&hub).await?;
/// let reference = authority.issue("Timer");
/// assert!(reference["activityId"].is_u64());
/// # Ok(())
/// # }
/// ```
pub struct MemoryAuthority {
    // ---
    inner: Arc<Inner>,
    join: JoinHandle<()>,
}

impl MemoryAuthority {
    /// Connect to `hub` as [`AUTHORITY_SERVICE_NAME`] and start serving.
    ///
    /// # Errors
    ///
    /// Fails if an authority is already connected to `hub`.
    pub async fn spawn(hub: &Arc<MemoryHub>) -> Result<Self> {
        // ---
        let transport = hub.connect(AUTHORITY_SERVICE_NAME, BusRole::Unified)?;
        for verb in ["create", "adopt", "complete"] {
            transport.register_method("/", verb).await?;
        }
        let mut events = transport.listen().await?;

        let inner = Arc::new(Inner {
            transport,
            state: Mutex::new(State {
                next_id: 1,
                ..State::default()
            }),
        });

        let join = tokio::spawn({
            let inner = inner.clone();
            async move {
                while let Some(event) = events.inbox.recv().await {
                    match event {
                        BusEvent::Request(request) => inner.handle_request(request),
                        BusEvent::Cancel(request) => inner.forget_subscriber(&request.unique_token),
                        BusEvent::Response(_) => {}
                    }
                }
            }
        });

        Ok(Self { inner, join })
    }

    /// Create an activity on behalf of some other party, as a client would
    /// before handing it to a service. Returns the reference to pass as
    /// `$activity`.
    pub fn issue(&self, name: &str) -> Value {
        // ---
        let id = lock_ignore_poison(&self.inner.state).insert(name);
        json!({ "activityId": id, "activity": { "name": name } })
    }

    /// Answer the next `create` with `returnValue: false` and `error_text`.
    pub fn fail_next_create(&self, error_text: impl Into<String>) {
        lock_ignore_poison(&self.inner.state).fail_next_create = Some(error_text.into());
    }

    /// Refuse adoption of activity `id`.
    pub fn refuse_adopt(&self, id: u64) {
        lock_ignore_poison(&self.inner.state).refuse_adopt.insert(id);
    }

    /// Completed activity ids, in completion order.
    pub fn completed(&self) -> Vec<u64> {
        lock_ignore_poison(&self.inner.state)
            .completions
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    /// Options passed when `id` was completed.
    pub fn completion_options(&self, id: u64) -> Option<Map<String, Value>> {
        lock_ignore_poison(&self.inner.state)
            .completions
            .iter()
            .find(|(completed, _)| *completed == id)
            .map(|(_, options)| options.clone())
    }

    /// Name of activity `id`, if known.
    pub fn name_of(&self, id: u64) -> Option<String> {
        lock_ignore_poison(&self.inner.state)
            .records
            .get(&id)
            .map(|record| record.name.clone())
    }

    /// Number of open keepalive subscriptions for activity `id`.
    pub fn subscribers(&self, id: u64) -> usize {
        lock_ignore_poison(&self.inner.state)
            .records
            .get(&id)
            .map_or(0, |record| record.subscribers.len())
    }

    /// Number of activities created so far.
    pub fn created(&self) -> usize {
        lock_ignore_poison(&self.inner.state).records.len()
    }
}

impl Drop for MemoryAuthority {
    fn drop(&mut self) {
        self.join.abort();
    }
}

impl State {
    fn insert(&mut self, name: &str) -> u64 {
        // ---
        let id = self.next_id;
        self.next_id += 1;
        self.records.insert(
            id,
            Record {
                name: name.to_string(),
                completed: false,
                subscribers: Vec::new(),
            },
        );
        id
    }
}

impl Inner {
    fn handle_request(&self, request: BusMessage) {
        // ---
        let payload = payload_from_bytes(&request);
        let reply = match request.method.as_str() {
            "create" => self.create(&request, &payload),
            "adopt" => self.adopt(&request, &payload),
            "complete" => self.complete(&payload),
            _ => json!({ "returnValue": false, "errorText": "unknown method" }),
        };
        self.transport.respond(&request, reply.to_string());
    }

    fn create(&self, request: &BusMessage, payload: &Value) -> Value {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if let Some(error_text) = state.fail_next_create.take() {
            return json!({ "returnValue": false, "errorCode": 1, "errorText": error_text });
        }

        let Some(name) = payload.pointer("/activity/name").and_then(Value::as_str) else {
            return json!({ "returnValue": false, "errorCode": 22, "errorText": "activity name required" });
        };

        let id = state.insert(name);
        if request.is_subscription && self.transport.subscription_add(request) {
            if let Some(record) = state.records.get_mut(&id) {
                record.subscribers.push(request.clone());
            }
            json!({ "returnValue": true, "activityId": id, "subscribed": true })
        } else {
            json!({ "returnValue": true, "activityId": id })
        }
    }

    fn adopt(&self, request: &BusMessage, payload: &Value) -> Value {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let Some(id) = payload.get("activityId").and_then(Value::as_u64) else {
            return json!({ "returnValue": false, "errorCode": 22, "errorText": "activityId required" });
        };
        if state.refuse_adopt.contains(&id) {
            return json!({ "returnValue": false, "errorCode": 1, "errorText": "adoption refused" });
        }

        let Some(record) = state.records.get_mut(&id).filter(|record| !record.completed) else {
            return json!({ "returnValue": false, "errorCode": 2, "errorText": "activity not found" });
        };

        if request.is_subscription && self.transport.subscription_add(request) {
            record.subscribers.push(request.clone());
        }
        json!({ "returnValue": true, "adopted": true, "subscribed": true })
    }

    fn complete(&self, payload: &Value) -> Value {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let Some(id) = payload.get("activityId").and_then(Value::as_u64) else {
            return json!({ "returnValue": false, "errorCode": 22, "errorText": "activityId required" });
        };
        let Some(record) = state.records.get_mut(&id).filter(|record| !record.completed) else {
            return json!({ "returnValue": false, "errorCode": 2, "errorText": "activity not found" });
        };

        record.completed = true;
        let event = json!({ "returnValue": true, "event": "complete", "activityId": id }).to_string();
        for subscriber in &record.subscribers {
            self.transport.respond(subscriber, event.clone());
        }

        let mut options = payload.as_object().cloned().unwrap_or_default();
        options.remove("activityId");
        state.completions.push((id, options));

        json!({ "returnValue": true })
    }

    fn forget_subscriber(&self, token: &UniqueToken) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        for record in state.records.values_mut() {
            record.subscribers.retain(|subscriber| &subscriber.unique_token != token);
        }
    }
}
