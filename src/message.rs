//! Messages exchanged with handlers.
//!
//! A [`Message`] wraps one raw [`BusMessage`] together with the connection it
//! arrived on. Inbound requests additionally carry the activity attached by
//! the dispatcher; responding to them releases that activity.

use crate::activity::Activity;
use crate::server::dispatcher::Dispatcher;
use crate::{BusMessage, BusRole, Error, Result, TransportPtr, UniqueToken};
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock, Weak};

/// One request, reply or cancel as seen by application code.
///
/// Clones share the attached activity.
#[derive(Clone)]
pub struct Message {
    // ---
    /// Method category, always starting with `/`.
    pub category: String,

    /// Method name.
    pub method: String,

    /// True when the sender expects several responses.
    pub is_subscription: bool,

    /// Token identifying the exchange.
    pub unique_token: UniqueToken,

    /// Per-connection serial number of the exchange.
    pub token: u64,

    /// Parsed payload, or `{"badPayload": <raw text>}` when the payload was
    /// not valid JSON.
    pub payload: Value,

    /// Application id (without pid suffix) or bus name of the sender.
    pub sender: String,

    raw: BusMessage,
    handle: TransportPtr,
    activity: Arc<OnceLock<Arc<Activity>>>,
    dispatcher: Option<Weak<Dispatcher>>,
}

impl Message {
    /// Wrap an inbound request received on `handle`.
    pub(crate) fn inbound(handle: TransportPtr, raw: BusMessage, dispatcher: Weak<Dispatcher>) -> Self {
        // ---
        let payload = payload_from_bytes(&raw);
        Self::with_payload(handle, raw, payload, Some(dispatcher))
    }

    /// Wrap a reply to an outbound call.
    pub(crate) fn reply(handle: TransportPtr, raw: BusMessage) -> Self {
        // ---
        let payload = payload_from_bytes(&raw);
        Self::with_payload(handle, raw, payload, None)
    }

    pub(crate) fn with_payload(
        handle: TransportPtr,
        raw: BusMessage,
        payload: Value,
        dispatcher: Option<Weak<Dispatcher>>,
    ) -> Self {
        // ---
        Self {
            category: raw.category.clone(),
            method: raw.method.clone(),
            is_subscription: raw.is_subscription,
            unique_token: raw.unique_token.clone(),
            token: raw.token,
            sender: raw.sender(),
            payload,
            raw,
            handle,
            activity: Arc::new(OnceLock::new()),
            dispatcher,
        }
    }

    /// Which bus the message arrived on.
    pub fn role(&self) -> BusRole {
        self.handle.role()
    }

    /// The connection the message arrived on.
    pub fn handle(&self) -> &TransportPtr {
        &self.handle
    }

    /// The raw bus message.
    pub fn raw(&self) -> &BusMessage {
        &self.raw
    }

    /// The activity attached to this request, once attachment finished.
    pub fn activity(&self) -> Option<Arc<Activity>> {
        self.activity.get().cloned()
    }

    /// Attach `activity`. Returns false if one was already attached.
    pub(crate) fn attach_activity(&self, activity: Arc<Activity>) -> bool {
        self.activity.set(activity).is_ok()
    }

    /// The `$activity` reference a client passed along, if any.
    pub fn activity_ref(&self) -> Option<&Value> {
        self.payload.get("$activity").filter(|v| v.is_object())
    }

    /// Send `response` to the caller.
    ///
    /// The response is normalized with [`normalize_response`]. For a
    /// non-subscription request the attached activity is completed after
    /// sending, whether or not the send succeeded.
    ///
    /// Returns `Ok(false)` when the bus refused the response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidResponse`] if `response` is not a JSON object;
    /// nothing is sent in that case.
    pub async fn respond(&self, response: Value) -> Result<bool> {
        // ---
        let body = normalize_response(response)?;
        let sent = self.handle.respond(&self.raw, Value::Object(body).to_string());

        if !sent {
            log_error!(
                "{}: respond() failed for {}/{}",
                self.handle.service_name(),
                self.category,
                self.method
            );
        }

        if !self.is_subscription {
            self.complete_activity().await;
        }
        Ok(sent)
    }

    /// Tell a subscriber that no more responses are coming.
    ///
    /// Stops tracking the subscription, tears it down locally (completing
    /// its activity and running cancel handlers), then sends a final
    /// response with `subscribed: false` merged into `response`.
    ///
    /// Does nothing and returns `Ok(false)` for non-subscription requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidResponse`] if `response` is present but not a
    /// JSON object.
    pub async fn cancel(&self, response: Option<Value>) -> Result<bool> {
        // ---
        if !self.is_subscription {
            return Ok(false);
        }

        let mut body = match response {
            None => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(Error::InvalidResponse),
        };

        if let Some(dispatcher) = self.dispatcher.as_ref().and_then(Weak::upgrade) {
            dispatcher.cancel_subscription(&self.handle, &self.raw).await;
        } else {
            self.handle.subscription_remove(&self.raw);
        }

        body.insert("subscribed".to_string(), Value::Bool(false));
        self.respond(Value::Object(body)).await
    }

    async fn complete_activity(&self) {
        // ---
        let Some(activity) = self.activity() else {
            return;
        };
        if let Some(dispatcher) = self.dispatcher.as_ref().and_then(Weak::upgrade) {
            dispatcher.activities().complete(&activity, Map::new()).await;
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("category", &self.category)
            .field("method", &self.method)
            .field("is_subscription", &self.is_subscription)
            .field("unique_token", &self.unique_token)
            .field("sender", &self.sender)
            .field("payload", &self.payload)
            .field("activity", &self.activity.get().map(|a| a.id().to_string()))
            .finish()
    }
}

/// Parse a raw payload. Never fails: malformed JSON is kept as
/// `{"badPayload": <raw text>}`.
pub(crate) fn payload_from_bytes(raw: &BusMessage) -> Value {
    // ---
    match serde_json::from_slice::<Value>(&raw.payload) {
        Ok(value) => value,
        Err(_err) => {
            let text = raw.payload_str().into_owned();
            log_error!("badly-formatted message payload: {_err}; payload: {text}");
            let mut sentinel = Map::new();
            sentinel.insert("badPayload".to_string(), Value::String(text));
            Value::Object(sentinel)
        }
    }
}

/// Apply the response defaults.
///
/// - neither `returnValue` nor an error field: `returnValue: true`
/// - `errorCode` or `errorText` without `returnValue`: `returnValue: false`,
///   a missing `errorCode` becomes -1 and a missing `errorText` becomes
///   `"no error message provided"`
///
/// An explicit `returnValue` is left alone.
///
/// ```
/// # use bus_service::normalize_response;
/// # use serde_json::json;
/// let body = normalize_response(json!({"errorText": "nope"})).unwrap();
/// assert_eq!(body["returnValue"], false);
/// assert_eq!(body["errorCode"], -1);
/// ```
///
/// # Errors
///
/// Returns [`Error::InvalidResponse`] if `response` is not an object.
pub fn normalize_response(response: Value) -> Result<Map<String, Value>> {
    // ---
    let Value::Object(mut body) = response else {
        return Err(Error::InvalidResponse);
    };

    if !body.contains_key("returnValue") {
        let has_code = body.get("errorCode").is_some_and(truthy);
        let has_text = body.get("errorText").is_some_and(truthy);

        if has_code || has_text {
            body.insert("returnValue".to_string(), Value::Bool(false));
            if !has_code {
                body.insert("errorCode".to_string(), Value::from(-1));
            }
            if !has_text {
                body.insert(
                    "errorText".to_string(),
                    Value::String("no error message provided".to_string()),
                );
            }
        } else {
            body.insert("returnValue".to_string(), Value::Bool(true));
        }
    }
    Ok(body)
}

/// Loose truthiness used for bus flags: `null`, `false`, `0` and `""` are
/// false, everything else is true.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use serde_json::json;

    fn raw(payload: &'static str) -> BusMessage {
        BusMessage {
            category: "/".into(),
            method: "hello".into(),
            payload: Bytes::from_static(payload.as_bytes()),
            unique_token: UniqueToken::from("t"),
            token: 1,
            is_subscription: false,
            application_id: String::new(),
            sender_service_name: "com.example.caller".into(),
        }
    }

    #[test]
    fn test_bad_payload_sentinel() {
        // ---
        for text in ["{", "not json", "", "{\"a\":}"] {
            let payload = payload_from_bytes(&raw(text));
            assert_eq!(payload, json!({ "badPayload": text }));
        }
    }

    #[test]
    fn test_good_payload_parsed() {
        // ---
        assert_eq!(payload_from_bytes(&raw(r#"{"name":"Ada"}"#)), json!({"name": "Ada"}));
    }

    #[test]
    fn test_normalize_defaults_return_value() {
        // ---
        let body = normalize_response(json!({"reply": "hi"})).unwrap();
        assert_eq!(body["returnValue"], true);
        assert!(!body.contains_key("errorCode"));
    }

    #[test]
    fn test_normalize_error_fields() {
        // ---
        let body = normalize_response(json!({"errorCode": 7})).unwrap();
        assert_eq!(body["returnValue"], false);
        assert_eq!(body["errorCode"], 7);
        assert_eq!(body["errorText"], "no error message provided");

        // Falsy error fields do not count as errors
        let body = normalize_response(json!({"errorCode": 0, "errorText": ""})).unwrap();
        assert_eq!(body["returnValue"], true);
    }

    #[test]
    fn test_normalize_keeps_explicit_return_value() {
        // ---
        let body = normalize_response(json!({"returnValue": true, "errorText": "x"})).unwrap();
        assert_eq!(body["returnValue"], true);
        assert!(!body.contains_key("errorCode"));
    }

    #[test]
    fn test_normalize_rejects_non_objects() {
        // ---
        for value in [json!(null), json!(1), json!("x"), json!([])] {
            assert!(matches!(normalize_response(value), Err(Error::InvalidResponse)));
        }
    }
}
