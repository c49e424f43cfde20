//! Activity lifecycle and the idle shutdown timer.
//!
//! The manager keeps the set of live activities. Every activity it adds is
//! removed exactly once, by [`ActivityManager::complete`]. The idle timer is
//! armed exactly when the live set is empty; when it fires the manager's
//! [`ShutdownSignal`] is raised with [`ShutdownReason::Idle`].
//!
//! Real activities are created and adopted through outbound subscriptions
//! to the activity authority. The subscription is the keepalive: it stays
//! open while the activity is live and is cancelled when the activity is
//! removed.

use crate::activity::{named_spec, Activity, ActivitySpec};
use crate::client::{BusClient, CallCanceller, Subscription, SubscriptionEvent};
use crate::config::ActivityConfig;
use crate::host::HostPtr;
use crate::message::truthy;
use crate::sync::lock_ignore_poison;
use crate::{Error, Result, ShutdownReason, ShutdownSignal, TransportPtr};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

/// What keeps a live activity alive on the authority side.
enum KeepAlive {
    /// Dummy activity.
    Noop,

    /// Open create/adopt subscription.
    Call(CallCanceller),
}

impl KeepAlive {
    fn cancel(&self) {
        if let KeepAlive::Call(canceller) = self {
            canceller.cancel();
        }
    }
}

struct State {
    // ---
    live: HashMap<String, KeepAlive>,
    idle_timer: Option<JoinHandle<()>>,
    counter: u64,
    dummy_counter: u64,
}

struct Inner {
    // ---
    config: ActivityConfig,
    transport: Mutex<Option<TransportPtr>>,
    host: Option<HostPtr>,
    shutdown: ShutdownSignal,
    state: Mutex<State>,
}

/// Host notifications collected under the state lock and sent after it is
/// released.
#[derive(Default)]
struct HostNotes {
    increase: bool,
    decrease: bool,
    idle: bool,
}

/// Tracks live activities and drives the idle shutdown timer.
///
/// Cheap to clone; clones share state. One manager normally serves one
/// service, but a manager may be shared between several services through
/// [`ServiceBuilder::activity_manager`](crate::ServiceBuilder::activity_manager).
#[derive(Clone)]
pub struct ActivityManager {
    inner: Arc<Inner>,
}

impl ActivityManager {
    /// Create a manager and arm its idle timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ActivityConfig, host: Option<HostPtr>) -> Self {
        // ---
        let inner = Arc::new(Inner {
            config,
            transport: Mutex::new(None),
            host,
            shutdown: ShutdownSignal::new(),
            state: Mutex::new(State {
                live: HashMap::new(),
                idle_timer: None,
                counter: 1,
                dummy_counter: 1,
            }),
        });

        {
            let mut state = lock_ignore_poison(&inner.state);
            start_timer(&inner, &mut state);
        }

        Self { inner }
    }

    /// Set the connection used to reach the activity authority.
    ///
    /// The first connection set wins; later calls are ignored so a manager
    /// shared between services keeps talking through one of them.
    pub fn set_transport(&self, transport: TransportPtr) {
        // ---
        let mut slot = lock_ignore_poison(&self.inner.transport);
        if slot.is_none() {
            *slot = Some(transport);
        }
    }

    /// True once a connection is set.
    pub fn has_transport(&self) -> bool {
        lock_ignore_poison(&self.inner.transport).is_some()
    }

    /// Signal raised when the idle timer fires with timeouts enabled.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.shutdown.clone()
    }

    /// Activity settings in use.
    pub fn config(&self) -> &ActivityConfig {
        &self.inner.config
    }

    /// Number of live activities.
    pub fn live_count(&self) -> usize {
        lock_ignore_poison(&self.inner.state).live.len()
    }

    /// True while the idle timer is armed.
    pub fn is_idle_timer_armed(&self) -> bool {
        lock_ignore_poison(&self.inner.state).idle_timer.is_some()
    }

    /// Create an activity.
    ///
    /// A [`Named`](ActivitySpec::Named) job gets a unique name (`job` plus
    /// the manager's counter, starting at 1) and the default specification.
    /// In dummy mode named jobs never reach the authority: they get a
    /// `dummy_<n>` id and go live immediately.
    ///
    /// A specification with `subscribe: true` goes live once the authority
    /// answers with its `activityId`; one without is returned without being
    /// tracked.
    ///
    /// # Errors
    ///
    /// - [`Error::Authority`] when the authority answers `returnValue: false`
    /// - [`Error::Transport`] when no connection has been set
    /// - [`Error::ChannelClosed`] when the authority goes away mid-exchange
    pub async fn create(&self, spec: impl Into<ActivitySpec>) -> Result<Arc<Activity>> {
        // ---
        match spec.into() {
            ActivitySpec::Named(job) => {
                let name = {
                    let mut state = lock_ignore_poison(&self.inner.state);
                    let name = format!("{job}{}", state.counter);
                    state.counter += 1;
                    name
                };

                if self.inner.config.use_dummy_activity {
                    Ok(self.create_dummy(name))
                } else {
                    log_debug!("creating activity for {name}");
                    self.create_actual(named_spec(&name)).await
                }
            }
            ActivitySpec::Full(spec) => self.create_actual(spec).await,
        }
    }

    fn create_dummy(&self, name: String) -> Arc<Activity> {
        // ---
        let id = {
            let mut state = lock_ignore_poison(&self.inner.state);
            let id = format!("dummy_{}", state.dummy_counter);
            state.dummy_counter += 1;
            id
        };

        log_debug!("created dummy activity {id} for {name}");
        let spec = json!({ "activity": { "name": name } });
        let activity = Arc::new(Activity::new(Value::String(id.clone()), name, true, spec));
        self.add(&id, KeepAlive::Noop);
        activity
    }

    async fn create_actual(&self, spec: Value) -> Result<Arc<Activity>> {
        // ---
        let client = self.client()?;
        let uri = self.authority_uri("create");
        let name = spec
            .pointer("/activity/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if !spec.get("subscribe").is_some_and(truthy) {
            let reply = client.call(&uri, &spec).await?;
            if !reply.payload.get("returnValue").is_some_and(truthy) {
                log_error!("activity creation failed: {}", reply.payload);
                return Err(Error::authority(&reply.payload));
            }
            let id = activity_id(&reply.payload)?;
            return Ok(Arc::new(Activity::new(id, name, false, spec)));
        }

        let mut sub = client.subscribe(&uri, &spec).await?;
        loop {
            match sub.next().await {
                Some(SubscriptionEvent::Response(reply)) => {
                    if !reply.payload.get("returnValue").is_some_and(truthy) {
                        log_error!("activity creation failed: {}", reply.payload);
                        sub.cancel();
                        return Err(Error::authority(&reply.payload));
                    }
                    if reply.payload.get("event").is_some() {
                        // Lifecycle events before the id are not ours to act on
                        continue;
                    }

                    let id = match activity_id(&reply.payload) {
                        Ok(id) => id,
                        Err(err) => {
                            log_error!("activity creation reply has no activityId: {}", reply.payload);
                            sub.cancel();
                            return Err(err);
                        }
                    };
                    let activity = Arc::new(Activity::new(id, name, false, spec));
                    log_debug!("activity id = {}", activity.id());

                    self.add(activity.id(), KeepAlive::Call(sub.canceller()));
                    tokio::spawn(watch_keepalive(sub, activity.id().to_string()));
                    return Ok(activity);
                }
                Some(SubscriptionEvent::Cancel(reply)) => {
                    log_error!("activity creation failed: {}", reply.payload);
                    return Err(Error::authority(&reply.payload));
                }
                None => {
                    return Err(Error::ChannelClosed(format!("{uri} closed before replying")));
                }
            }
        }
    }

    /// Take over an activity another party created, from a reference such
    /// as a request's `$activity` value.
    ///
    /// The activity goes live once the authority reports `adopted: true`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] when the reference has no `activityId`
    /// - [`Error::Authority`] when the authority refuses the adoption
    /// - [`Error::Transport`] when no connection has been set
    pub async fn adopt(&self, reference: &Value) -> Result<Arc<Activity>> {
        // ---
        let activity = Activity::from_ref(reference)?;
        let client = self.client()?;
        let uri = self.authority_uri("adopt");
        let args = json!({
            "activityId": activity.id_value(),
            "subscribe": true,
            "wait": false,
        });

        let mut sub = client.subscribe(&uri, &args).await?;
        loop {
            match sub.next().await {
                Some(SubscriptionEvent::Response(reply)) => {
                    if reply.payload.get("adopted").is_some_and(truthy) {
                        log_debug!("adopted {}", activity.id());
                        let activity = Arc::new(activity);
                        self.add(activity.id(), KeepAlive::Call(sub.canceller()));
                        tokio::spawn(watch_keepalive(sub, activity.id().to_string()));
                        return Ok(activity);
                    }
                    if !reply.payload.get("returnValue").is_some_and(truthy) {
                        log_error!("adopt of {} failed: {}", activity.id(), reply.payload);
                        sub.cancel();
                        return Err(Error::authority(&reply.payload));
                    }
                }
                Some(SubscriptionEvent::Cancel(reply)) => {
                    log_error!("adopt of {} failed: {}", activity.id(), reply.payload);
                    return Err(Error::authority(&reply.payload));
                }
                None => {
                    return Err(Error::ChannelClosed(format!("{uri} closed before replying")));
                }
            }
        }
    }

    /// Complete `activity`, passing `options` (e.g. `{"restart": true}`) to
    /// the authority.
    ///
    /// Returns false and does nothing if the activity was already completed.
    /// Otherwise the local entry is removed whether or not the authority
    /// accepts the release; a refused release is only logged.
    pub async fn complete(&self, activity: &Activity, options: Map<String, Value>) -> bool {
        // ---
        if !activity.mark_completed() {
            return false;
        }

        if !activity.is_dummy() {
            let mut params = Map::new();
            params.insert("activityId".to_string(), activity.id_value().clone());
            params.extend(options);

            match self.client() {
                Ok(client) => {
                    let uri = self.authority_uri("complete");
                    match client.call(&uri, &Value::Object(params)).await {
                        Ok(reply) if reply.payload.get("returnValue").is_some_and(truthy) => {}
                        Ok(_reply) => {
                            log_error!("failed to complete {}, error: {}", activity.id(), _reply.payload);
                        }
                        Err(_err) => {
                            log_error!("failed to complete {}: {_err}", activity.id());
                        }
                    }
                }
                Err(_err) => {
                    log_error!("failed to complete {}: {_err}", activity.id());
                }
            }
        }

        self.remove(activity.id());
        true
    }

    /// Disarm the idle timer without touching the live set.
    pub(crate) fn stop_timer(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.inner.state);
        stop_timer(&mut state);
    }

    fn add(&self, id: &str, keepalive: KeepAlive) {
        // ---
        let mut notes = HostNotes::default();
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            stop_timer(&mut state);

            if state.live.contains_key(id) {
                log_warn!("activity {id} already started");
            } else {
                state.live.insert(id.to_string(), keepalive);
                notes.increase = true;
            }
        }
        self.notify_host(notes);
    }

    fn remove(&self, id: &str) {
        // ---
        let mut notes = HostNotes::default();
        let removed = {
            let mut state = lock_ignore_poison(&self.inner.state);
            let removed = state.live.remove(id);
            match removed {
                Some(_) => notes.decrease = true,
                None => {
                    log_warn!("activity {id} not started");
                }
            }
            if state.live.is_empty() {
                start_timer(&self.inner, &mut state);
                notes.idle = true;
            }
            removed
        };

        if let Some(keepalive) = removed {
            keepalive.cancel();
        }
        self.notify_host(notes);
    }

    fn notify_host(&self, notes: HostNotes) {
        // ---
        let Some(host) = &self.inner.host else {
            return;
        };
        if notes.increase {
            host.increase_activity();
        }
        if notes.decrease {
            host.decrease_activity();
        }
        if notes.idle {
            host.enter_idle();
        }
    }

    fn client(&self) -> Result<BusClient> {
        // ---
        lock_ignore_poison(&self.inner.transport)
            .clone()
            .map(BusClient::new)
            .ok_or_else(|| Error::Transport("activity manager has no bus connection".into()))
    }

    fn authority_uri(&self, verb: &str) -> String {
        format!("{}/{verb}", self.inner.config.authority_uri.trim_end_matches('/'))
    }
}

impl std::fmt::Debug for ActivityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityManager")
            .field("live", &self.live_count())
            .field("idle_timer_armed", &self.is_idle_timer_armed())
            .finish()
    }
}

fn activity_id(payload: &Value) -> Result<Value> {
    // ---
    payload
        .get("activityId")
        .filter(|v| v.is_string() || v.is_number())
        .cloned()
        .ok_or(Error::InvalidResponse)
}

fn start_timer(inner: &Arc<Inner>, state: &mut State) {
    // ---
    if state.idle_timer.is_some() {
        log_debug!("idle timer already started, ignoring");
        return;
    }

    let weak: Weak<Inner> = Arc::downgrade(inner);
    let idle_timeout = inner.config.idle_timeout;

    state.idle_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        if let Some(inner) = weak.upgrade() {
            on_idle_timeout(&inner);
        }
    }));
}

fn stop_timer(state: &mut State) {
    // ---
    match state.idle_timer.take() {
        Some(timer) => timer.abort(),
        None => {
            log_debug!("idle timer already stopped, ignoring");
        }
    }
}

fn on_idle_timeout(inner: &Inner) {
    // ---
    if !lock_ignore_poison(&inner.state).live.is_empty() {
        return;
    }

    if inner.config.exit_on_timeout {
        log_info!("no active activities, exiting");
        inner.shutdown.trigger(ShutdownReason::Idle);
    } else {
        log_info!("no active activities, would exit, but timeout is disabled");
    }
}

/// Drain a keepalive subscription; cancel it once the authority reports the
/// activity complete.
async fn watch_keepalive(mut sub: Subscription, _id: String) {
    // ---
    while let Some(event) = sub.next().await {
        match event {
            SubscriptionEvent::Response(reply) => {
                if reply.payload.get("event").and_then(Value::as_str) == Some("complete") {
                    log_debug!("activity {_id} complete, cancelling subscription");
                    sub.cancel();
                }
            }
            SubscriptionEvent::Cancel(_) => break,
        }
    }
}
