//! Inbound request and cancel dispatch.
//!
//! Per request the dispatcher resolves the method, registers a subscription
//! when the caller asked for one, attaches an activity (adopting the
//! caller's `$activity` or creating one named after the method) and then
//! runs the request handlers. Each request is processed in its own task so
//! a slow activity authority never stalls the receive loop.
//!
//! Cancels tear the subscription row down, complete its activity and run
//! the method's cancel handlers.

use super::handler::BoxedHandler;
use super::registry::{MethodEntry, MethodRegistry};
use super::subscriptions::SubscriptionTable;
use crate::activity::{ActivityManager, ActivitySpec};
use crate::sync::lock_ignore_poison;
use crate::transport::runner::BusConsumer;
use crate::{BusEvent, BusMessage, Message, Result, TransportPtr, UniqueToken};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, Weak};

pub(crate) struct Dispatcher {
    // ---
    registry: Mutex<MethodRegistry>,
    subscriptions: Mutex<SubscriptionTable>,
    activities: ActivityManager,
    weak_self: Weak<Dispatcher>,
}

impl Dispatcher {
    // ---

    pub fn new(activities: ActivityManager) -> Arc<Self> {
        // ---
        Arc::new_cyclic(|weak_self| Self {
            registry: Mutex::new(MethodRegistry::new()),
            subscriptions: Mutex::new(SubscriptionTable::new()),
            activities,
            weak_self: weak_self.clone(),
        })
    }

    pub fn activities(&self) -> &ActivityManager {
        &self.activities
    }

    pub fn register(
        &self,
        category: &str,
        method: &str,
        request: Option<BoxedHandler>,
        cancel: Option<BoxedHandler>,
        description: Option<Value>,
        private_bus_only: bool,
    ) {
        // ---
        lock_ignore_poison(&self.registry).register(
            category,
            method,
            request,
            cancel,
            description,
            private_bus_only,
        );
    }

    pub fn lookup(&self, category: &str, method: &str) -> Option<MethodEntry> {
        lock_ignore_poison(&self.registry).lookup(category, method)
    }

    pub fn describe(&self, include_private: bool) -> Map<String, Value> {
        lock_ignore_poison(&self.registry).describe(include_private)
    }

    pub fn subscription_count(&self) -> usize {
        lock_ignore_poison(&self.subscriptions).len()
    }

    /// Start processing one inbound request.
    ///
    /// Resolution and subscription registration happen before this returns,
    /// so a cancel that follows on the same connection always finds its
    /// row. Activity attachment and the handlers run in a spawned task.
    pub fn dispatch(&self, handle: &TransportPtr, raw: BusMessage) {
        // ---
        let message = Message::inbound(handle.clone(), raw, self.weak_self.clone());

        let entry = {
            let registry = lock_ignore_poison(&self.registry);
            match registry.lookup(&message.category, &message.method) {
                Some(entry) => entry,
                None => {
                    if registry.has_category(&message.category) {
                        log_error!(
                            "no method for category {}, method {}",
                            message.category,
                            message.method
                        );
                    } else {
                        log_error!("no methods for category {}", message.category);
                    }
                    return;
                }
            }
        };

        if message.is_subscription {
            if !entry.has_cancel_handler() {
                log_warn!(
                    "a client attempted to add a subscription for {} which has no cancel handler, ignoring",
                    message.method
                );
                return;
            }
            lock_ignore_poison(&self.subscriptions).insert(message.clone());
            if !handle.subscription_add(message.raw()) {
                log_warn!("{}: bus refused to track subscription {}", handle.service_name(), message.unique_token);
            }
        }

        let Some(dispatcher) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            dispatcher.attach_and_invoke(message, entry).await;
        });
    }

    async fn attach_and_invoke(&self, message: Message, entry: MethodEntry) {
        // ---
        let attached = match message.activity_ref().cloned() {
            Some(reference) => {
                log_debug!("adopting activity {reference}");
                self.activities.adopt(&reference).await
            }
            None => {
                self.activities
                    .create(ActivitySpec::Named(message.method.clone()))
                    .await
            }
        };

        let activity = match attached {
            Ok(activity) => activity,
            Err(_err) => {
                log_error!(
                    "activity for {}/{} failed, dropping request: {_err}",
                    message.category,
                    message.method
                );
                if message.is_subscription
                    && lock_ignore_poison(&self.subscriptions)
                        .remove(&message.unique_token)
                        .is_some()
                {
                    message.handle().subscription_remove(message.raw());
                }
                return;
            }
        };

        message.attach_activity(activity.clone());

        // A cancel that raced attachment already removed the row; the
        // activity has no owner left to complete it.
        if message.is_subscription && !lock_ignore_poison(&self.subscriptions).contains(&message.unique_token) {
            log_debug!("subscription {} cancelled during attachment", message.unique_token);
            self.activities.complete(&activity, Map::new()).await;
        }

        for handler in entry.request {
            let message = message.clone();
            tokio::spawn(run_request_handler(handler, message));
        }
    }

    /// Tear down the inbound subscription `token`.
    ///
    /// Returns false if no such subscription is live.
    pub async fn teardown(&self, token: &UniqueToken) -> bool {
        // ---
        let Some(row) = lock_ignore_poison(&self.subscriptions).remove(token) else {
            log_debug!("attempt to cancel unknown subscription {token}");
            return false;
        };

        if let Some(activity) = row.message.activity() {
            self.activities.complete(&activity, Map::new()).await;
        }

        if let Some(entry) = self.lookup(&row.category, &row.method) {
            for handler in entry.cancel {
                if let Err(_err) = handler(row.message.clone()).await {
                    log_warn!("cancel handler for {}/{} failed: {_err}", row.category, row.method);
                }
            }
        }
        true
    }

    /// Drop every live subscription at shutdown, completing their
    /// activities. Cancel handlers are not run. Returns how many were
    /// dropped.
    pub async fn release_subscriptions(&self) -> usize {
        // ---
        let rows = lock_ignore_poison(&self.subscriptions).drain();
        for row in &rows {
            row.message.handle().subscription_remove(row.message.raw());
            if let Some(activity) = row.message.activity() {
                self.activities.complete(&activity, Map::new()).await;
            }
        }
        rows.len()
    }

    /// Server-side cancel: stop bus tracking, then tear down.
    pub async fn cancel_subscription(&self, handle: &TransportPtr, raw: &BusMessage) -> bool {
        // ---
        handle.subscription_remove(raw);
        self.teardown(&raw.unique_token).await
    }
}

async fn run_request_handler(handler: BoxedHandler, message: Message) {
    // ---
    if let Err(err) = handler(message.clone()).await {
        log_warn!("handler for {}/{} failed: {err}", message.category, message.method);
        let response = json!({
            "returnValue": false,
            "errorCode": err.error_code(),
            "errorText": err.to_string(),
        });

        // A subscription ends with the error; its row and activity go too
        let sent = if message.is_subscription {
            message.cancel(Some(response)).await
        } else {
            message.respond(response).await
        };
        if let Err(_err) = sent {
            log_error!("could not send error response: {_err}");
        }
    }
}

#[async_trait::async_trait]
impl BusConsumer for Arc<Dispatcher> {
    // ---
    async fn handle_event(&self, handle: &TransportPtr, event: BusEvent) -> Result<()> {
        // ---
        match event {
            BusEvent::Request(raw) => self.dispatch(handle, raw),
            BusEvent::Cancel(raw) => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher.teardown(&raw.unique_token).await;
                });
            }
            BusEvent::Response(_raw) => {
                log_debug!("{}: stray response for {}", handle.service_name(), _raw.unique_token);
            }
        }
        Ok(())
    }
}
