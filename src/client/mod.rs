//! Outbound calls and subscriptions.
//!
//! [`BusClient`] issues calls from one bus connection and wraps replies into
//! [`Message`]s. A [`Subscription`] is a stream of replies that ends when the
//! callee answers with `subscribed: false`, when the bus cancels it, or when
//! the caller cancels it.

use crate::{BusEvent, BusMessage, Error, Message, Result, TransportPtr, UniqueToken};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Client for outbound bus calls.
///
/// Cheap to clone; all clones send through the same connection.
///
/// # Example
///
/// ```no_run
/// # use bus_service::{BusClient, BusRole, MemoryHub};
/// # use serde_json::json;
/// # async fn example() -> bus_service::Result<()> {
/// let hub = MemoryHub::new();
/// let client = BusClient::new(hub.connect("com.example.client", BusRole::Unified)?);
///
/// let reply = client
///     .call("luna://com.example.helloworld/hello", &json!({"name": "Ada"}))
///     .await?;
/// println!("{}", reply.payload);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BusClient {
    // ---
    transport: TransportPtr,
}

impl BusClient {
    // ---

    /// Create a client sending on `transport`.
    pub fn new(transport: TransportPtr) -> Self {
        Self { transport }
    }

    /// The connection this client sends on.
    pub fn transport(&self) -> &TransportPtr {
        &self.transport
    }

    /// Call `uri` once and wait for its reply.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `args` is not a JSON object
    /// - [`Error::ChannelClosed`] if the exchange ends without a reply
    /// - any error the transport reports while sending
    pub async fn call(&self, uri: &str, args: &Value) -> Result<Message> {
        self.call_inner(uri, args, None).await
    }

    /// Like [`call`](BusClient::call), on behalf of a user session.
    pub async fn call_session(&self, uri: &str, args: &Value, session_id: &str) -> Result<Message> {
        self.call_inner(uri, args, Some(session_id)).await
    }

    /// Subscribe to `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `args` is not a JSON object.
    pub async fn subscribe(&self, uri: &str, args: &Value) -> Result<Subscription> {
        self.subscribe_inner(uri, args, None).await
    }

    /// Like [`subscribe`](BusClient::subscribe), on behalf of a user session.
    pub async fn subscribe_session(
        &self,
        uri: &str,
        args: &Value,
        session_id: &str,
    ) -> Result<Subscription> {
        self.subscribe_inner(uri, args, Some(session_id)).await
    }

    async fn call_inner(&self, uri: &str, args: &Value, session_id: Option<&str>) -> Result<Message> {
        // ---
        let payload = object_payload(args)?;
        let mut handle = self.transport.call(uri, payload, session_id).await?;

        match handle.inbox.recv().await {
            Some(BusEvent::Response(raw)) => Ok(Message::reply(self.transport.clone(), raw)),
            Some(_) | None => Err(Error::ChannelClosed(format!("no reply from {uri}"))),
        }
    }

    async fn subscribe_inner(
        &self,
        uri: &str,
        args: &Value,
        session_id: Option<&str>,
    ) -> Result<Subscription> {
        // ---
        let payload = object_payload(args)?;
        let handle = self.transport.subscribe(uri, payload, session_id).await?;

        Ok(Subscription {
            uri: uri.to_string(),
            token: handle.token,
            transport: self.transport.clone(),
            inbox: handle.inbox,
            done: false,
        })
    }
}

fn object_payload(args: &Value) -> Result<String> {
    // ---
    if !args.is_object() {
        return Err(Error::InvalidArgument("payload must be an object".into()));
    }
    Ok(args.to_string())
}

/// One event on an outbound subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A regular reply.
    Response(Message),

    /// The subscription ended: the callee replied `subscribed: false` or
    /// the bus cancelled it. No further events follow.
    Cancel(Message),
}

/// An outbound subscription.
///
/// Dropping a `Subscription` does not cancel it on the bus; call
/// [`cancel`](Subscription::cancel).
pub struct Subscription {
    // ---
    uri: String,
    token: UniqueToken,
    transport: TransportPtr,
    inbox: mpsc::UnboundedReceiver<BusEvent>,
    done: bool,
}

impl Subscription {
    // ---

    /// URI this subscription was issued to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Token of the underlying exchange.
    pub fn token(&self) -> &UniqueToken {
        &self.token
    }

    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is over: after a
    /// [`Cancel`](SubscriptionEvent::Cancel) event, after
    /// [`cancel`](Subscription::cancel), or when the bus drops the exchange.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        // ---
        if self.done {
            return None;
        }

        let event = match self.inbox.recv().await {
            Some(event) => event,
            None => {
                self.done = true;
                return None;
            }
        };

        match event {
            BusEvent::Response(raw) | BusEvent::Request(raw) => {
                let payload = reply_payload(&raw);
                let cancelled = payload.get("subscribed") == Some(&Value::Bool(false));
                let message = Message::with_payload(self.transport.clone(), raw, payload, None);

                if cancelled {
                    self.cancel();
                    Some(SubscriptionEvent::Cancel(message))
                } else {
                    Some(SubscriptionEvent::Response(message))
                }
            }
            BusEvent::Cancel(raw) => {
                self.done = true;
                Some(SubscriptionEvent::Cancel(Message::reply(self.transport.clone(), raw)))
            }
        }
    }

    /// Stop receiving replies.
    pub fn cancel(&mut self) {
        // ---
        if !self.done {
            self.done = true;
            self.transport.cancel_call(&self.token);
        }
    }

    /// A handle that cancels this subscription from elsewhere.
    pub(crate) fn canceller(&self) -> CallCanceller {
        CallCanceller {
            transport: self.transport.clone(),
            token: self.token.clone(),
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("uri", &self.uri)
            .field("token", &self.token)
            .field("done", &self.done)
            .finish()
    }
}

/// Detached cancel handle for an outbound exchange.
#[derive(Clone)]
pub(crate) struct CallCanceller {
    // ---
    transport: TransportPtr,
    token: UniqueToken,
}

impl CallCanceller {
    pub(crate) fn cancel(&self) {
        self.transport.cancel_call(&self.token);
    }
}

/// Parse a subscription reply; a malformed one ends the subscription.
fn reply_payload(raw: &BusMessage) -> Value {
    // ---
    match serde_json::from_slice::<Value>(&raw.payload) {
        Ok(value) => value,
        Err(_err) => {
            let text = raw.payload_str().into_owned();
            log_error!("badly-formatted reply payload from {}: {_err}", raw.sender_service_name);
            json!({
                "subscribed": false,
                "returnValue": false,
                "errorText": text,
                "badPayload": text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{BusRole, MemoryHub};
    use tokio::time::{timeout, Duration};

    async fn serve_one(server: &TransportPtr, replies: &[&str]) -> BusMessage {
        // ---
        let mut events = server.listen().await.unwrap();
        let request = match timeout(Duration::from_millis(100), events.inbox.recv()).await {
            Ok(Some(BusEvent::Request(m))) => m,
            other => panic!("unexpected {other:?}"),
        };
        for reply in replies {
            server.respond(&request, reply.to_string());
        }
        request
    }

    #[tokio::test]
    async fn test_call_returns_reply_message() {
        // ---
        let hub = MemoryHub::new();
        let server = hub.connect("com.example.svc", BusRole::Unified).unwrap();
        server.register_method("/", "hello").await.unwrap();
        let client = BusClient::new(hub.connect("com.example.client", BusRole::Unified).unwrap());

        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.call("luna://com.example.svc/hello", &json!({})).await }
        });
        serve_one(&server, &[r#"{"returnValue":true,"reply":"hi"}"#]).await;

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.payload["reply"], "hi");
        assert_eq!(reply.method, "hello");
    }

    #[tokio::test]
    async fn test_call_rejects_non_object_args() {
        // ---
        let hub = MemoryHub::new();
        let client = BusClient::new(hub.connect("com.example.client", BusRole::Unified).unwrap());

        let err = client
            .call("luna://com.example.svc/hello", &json!([1, 2]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_subscription_ends_on_subscribed_false() {
        // ---
        let hub = MemoryHub::new();
        let server = hub.connect("com.example.svc", BusRole::Unified).unwrap();
        server.register_method("/", "watch").await.unwrap();
        let client = BusClient::new(hub.connect("com.example.client", BusRole::Unified).unwrap());

        let mut sub = client
            .subscribe("luna://com.example.svc/watch", &json!({"subscribe": true}))
            .await
            .unwrap();
        serve_one(&server, &[r#"{"beat":1}"#, r#"{"subscribed":false}"#]).await;

        match sub.next().await {
            Some(SubscriptionEvent::Response(m)) => assert_eq!(m.payload["beat"], 1),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(sub.next().await, Some(SubscriptionEvent::Cancel(_))));
        assert!(sub.next().await.is_none());
        assert_eq!(hub.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_reply_becomes_cancel() {
        // ---
        let hub = MemoryHub::new();
        let server = hub.connect("com.example.svc", BusRole::Unified).unwrap();
        server.register_method("/", "watch").await.unwrap();
        let client = BusClient::new(hub.connect("com.example.client", BusRole::Unified).unwrap());

        let mut sub = client
            .subscribe("luna://com.example.svc/watch", &json!({}))
            .await
            .unwrap();
        serve_one(&server, &["{not json"]).await;

        match sub.next().await {
            Some(SubscriptionEvent::Cancel(m)) => {
                assert_eq!(m.payload["badPayload"], "{not json");
                assert_eq!(m.payload["errorText"], "{not json");
                assert_eq!(m.payload["returnValue"], false);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
