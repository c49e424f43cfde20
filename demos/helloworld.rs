//! Hello-world service on an in-memory bus.
//!
//! Registers a handful of methods, drives them from a client, then asks the
//! service to quit over the restricted bus.
//!
//! Run with `RUST_LOG=debug cargo run --example helloworld`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bus_service::{
    BusClient, BusRole, MemoryAuthority, MemoryHub, Message, MethodSpec, Result, ServiceBuilder,
    ServiceConfig, SubscriptionEvent, UniqueToken,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

const BUS_ID: &str = "com.example.helloworld";

type Subscribers = Arc<Mutex<HashMap<UniqueToken, Message>>>;

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hub = MemoryHub::new();
    let _authority = MemoryAuthority::spawn(&hub).await?;

    let service = ServiceBuilder::new(ServiceConfig::from_args(BUS_ID, std::env::args()))
        .split(
            hub.connect(BUS_ID, BusRole::Private)?,
            hub.connect(BUS_ID, BusRole::Public)?,
        )
        .build()
        .await?;

    let greeting = Arc::new(Mutex::new("Hello, World!".to_string()));
    let subscribers: Subscribers = Arc::default();

    service
        .register(MethodSpec::new("hello").on_request({
            let greeting = greeting.clone();
            move |message: Message| {
                let greeting = greeting.lock().map(|g| g.clone()).unwrap_or_default();
                async move {
                    message.respond(json!({ "message": greeting })).await?;
                    Ok(())
                }
            }
        }))
        .await?;

    service
        .register(MethodSpec::new("config/setGreeting").on_request({
            let greeting = greeting.clone();
            move |message: Message| {
                let greeting = greeting.clone();
                async move {
                    let Some(new) = message.payload["greeting"].as_str() else {
                        message
                            .respond(json!({
                                "returnValue": false,
                                "errorText": "argument 'greeting' is required",
                                "errorCode": 1,
                            }))
                            .await?;
                        return Ok(());
                    };
                    if let Ok(mut current) = greeting.lock() {
                        *current = new.to_string();
                    }
                    message.respond(json!({ "greeting": new })).await?;
                    Ok(())
                }
            }
        }))
        .await?;

    service
        .register(
            MethodSpec::new("heartbeat")
                .on_request({
                    let subscribers = subscribers.clone();
                    move |message: Message| {
                        let subscribers = subscribers.clone();
                        async move {
                            message.respond(json!({ "event": "beat" })).await?;
                            if message.is_subscription {
                                if let Ok(mut subscribers) = subscribers.lock() {
                                    subscribers.insert(message.unique_token.clone(), message);
                                }
                            }
                            Ok(())
                        }
                    }
                })
                .on_cancel({
                    let subscribers = subscribers.clone();
                    move |message: Message| {
                        if let Ok(mut subscribers) = subscribers.lock() {
                            subscribers.remove(&message.unique_token);
                        }
                        async { Ok(()) }
                    }
                }),
        )
        .await?;

    service
        .register(MethodSpec::new("cancel_subscriptions").on_request({
            let subscribers = subscribers.clone();
            move |message: Message| {
                let subscribers = subscribers.clone();
                async move {
                    let current: Vec<Message> = subscribers
                        .lock()
                        .map(|s| s.values().cloned().collect())
                        .unwrap_or_default();
                    for subscriber in current {
                        subscriber.cancel(Some(json!({ "message": "sorry" }))).await?;
                    }
                    message.respond(json!({})).await?;
                    Ok(())
                }
            }
        }))
        .await?;

    service
        .register(MethodSpec::new("/do/re/me").on_request(|message: Message| async move {
            message
                .respond(json!({ "verses": [
                    { "doe": "a deer, a female deer" },
                    { "ray": "a drop of golden sun" },
                    { "me": "a name I call myself" },
                ] }))
                .await?;
            Ok(())
        }))
        .await?;

    let count = Arc::new(Mutex::new(0u64));
    for (path, step) in [("increment", 1), ("getCount", 0)] {
        let count = count.clone();
        service
            .register(MethodSpec::new(path).on_request(move |message: Message| {
                let value = count
                    .lock()
                    .map(|mut c| {
                        *c += step;
                        *c
                    })
                    .unwrap_or_default();
                async move {
                    message.respond(json!({ "count": value })).await?;
                    Ok(())
                }
            }))
            .await?;
    }

    // Beat every 200ms to whoever is subscribed
    let beats = tokio::spawn({
        let subscribers = subscribers.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_millis(200));
            for beat in 1u64.. {
                interval.tick().await;
                let current: Vec<Message> = subscribers
                    .lock()
                    .map(|s| s.values().cloned().collect())
                    .unwrap_or_default();
                for subscriber in current {
                    let _ = subscriber.respond(json!({ "event": format!("beat {beat}") })).await;
                }
            }
        }
    });

    let run = service.spawn();

    // --- client side
    let client = BusClient::new(hub.connect("com.example.helloclient", BusRole::Public)?);
    let uri = |method: &str| format!("luna://{BUS_ID}/{method}");

    let reply = client.call(&uri("hello"), &json!({})).await?;
    println!("hello: {}", reply.payload);

    let reply = client
        .call(&uri("config/setGreeting"), &json!({ "greeting": "Howdy!" }))
        .await?;
    println!("setGreeting: {}", reply.payload);
    let reply = client.call(&uri("config/setGreeting"), &json!({})).await?;
    println!("setGreeting without argument: {}", reply.payload);

    let reply = client.call(&uri("hello"), &json!({})).await?;
    println!("hello: {}", reply.payload);

    let mut heartbeat = client
        .subscribe(&uri("heartbeat"), &json!({ "subscribe": true }))
        .await?;
    for _ in 0..3 {
        if let Some(SubscriptionEvent::Response(beat)) = heartbeat.next().await {
            println!("heartbeat: {}", beat.payload);
        }
    }

    client.call(&uri("cancel_subscriptions"), &json!({})).await?;
    while let Some(event) = heartbeat.next().await {
        match event {
            SubscriptionEvent::Response(beat) => println!("heartbeat: {}", beat.payload),
            SubscriptionEvent::Cancel(last) => println!("heartbeat cancelled: {}", last.payload),
        }
    }

    client.call(&uri("increment"), &json!({})).await?;
    client.call(&uri("increment"), &json!({})).await?;
    let reply = client.call(&uri("getCount"), &json!({})).await?;
    println!("count: {}", reply.payload["count"]);

    let reply = client.call(&uri("do/re/me"), &json!({})).await?;
    println!("do/re/me: {}", reply.payload["verses"]);

    let info = client.call(&uri("info"), &json!({})).await?;
    println!("info: {}", info.payload["commands"]);

    let admin = BusClient::new(hub.connect("com.webos.admin", BusRole::Private)?);
    let reply = admin.call(&uri("quit"), &json!({})).await?;
    println!("quit: {}", reply.payload);

    let reason = run
        .await
        .map_err(|err| bus_service::Error::Transport(err.to_string()))??;
    println!("service stopped: {reason:?}");

    beats.abort();
    Ok(())
}
