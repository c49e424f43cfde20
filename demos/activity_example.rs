//! Activity example on an in-memory bus.
//!
//! `createTimer` asks the activity authority for a timer activity,
//! `timerFired` is what the authority would call when it fires, and
//! `cancelActivity` completes an activity by id. The service stops on its
//! own once no activity keeps it busy.
//!
//! Run with `RUST_LOG=debug cargo run --example activity_example`.

use std::time::Duration;

use bus_service::{
    Activity, ActivitySpec, BusClient, BusRole, MemoryAuthority, MemoryHub, Message, MethodSpec,
    Result, Service, ServiceBuilder, ServiceConfig,
};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

const BUS_ID: &str = "com.example.activityexample";

fn timer_spec() -> ActivitySpec {
    // ---
    ActivitySpec::Full(json!({
        "activity": {
            "name": "Timer",
            "description": "periodic activity for activityexample",
            "type": { "foreground": true },
            "persist": false,
            "explicit": true,
            "callback": {
                "method": format!("luna://{BUS_ID}/timerFired"),
                "params": { "fired": true },
            },
            "schedule": { "interval": "5m" },
        },
        "start": true,
        "replace": true,
        "subscribe": false,
    }))
}

fn options(restart: bool) -> Map<String, Value> {
    let mut options = Map::new();
    options.insert("restart".to_string(), Value::Bool(restart));
    options
}

async fn register_methods(service: &Service) -> Result<()> {
    // ---
    let manager = service.activity_manager().clone();
    service
        .register(MethodSpec::new("createTimer").on_request(move |message: Message| {
            let manager = manager.clone();
            async move {
                let activity = manager.create(timer_spec()).await?;
                message
                    .respond(json!({ "msg": format!("Created activity {}", activity.id()) }))
                    .await?;
                Ok(())
            }
        }))
        .await?;

    let manager = service.activity_manager().clone();
    service
        .register(MethodSpec::new("timerFired").on_request(move |message: Message| {
            let manager = manager.clone();
            async move {
                // The adopted `$activity` is attached to the message
                let Some(activity) = message.activity_ref().and(message.activity()) else {
                    message
                        .respond(json!({
                            "returnValue": false,
                            "errorText": "$activity must be specified",
                        }))
                        .await?;
                    return Ok(());
                };
                manager.complete(&activity, options(true)).await;
                message
                    .respond(json!({
                        "message": format!("activityId {} completed, and restarted.", activity.id())
                    }))
                    .await?;
                Ok(())
            }
        }))
        .await?;

    let manager = service.activity_manager().clone();
    service
        .register(MethodSpec::new("cancelActivity").on_request(move |message: Message| {
            let manager = manager.clone();
            async move {
                let Some(id) = message.payload.get("activityId").cloned() else {
                    message
                        .respond(json!({
                            "returnValue": false,
                            "errorText": "activityId must be specified",
                        }))
                        .await?;
                    return Ok(());
                };
                let activity = Activity::from_ref(&json!({ "activityId": id }))?;
                manager.complete(&activity, options(false)).await;
                message.respond(json!({ "status": "cancelling" })).await?;
                Ok(())
            }
        }))
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hub = MemoryHub::new();
    let authority = MemoryAuthority::spawn(&hub).await?;

    let config = ServiceConfig::from_args(BUS_ID, std::env::args())
        .with_idle_timeout(Duration::from_millis(500));
    let service = ServiceBuilder::new(config)
        .unified(hub.connect(BUS_ID, BusRole::Unified)?)
        .build()
        .await?;
    register_methods(&service).await?;
    let run = service.spawn();

    // --- client side
    let client = BusClient::new(hub.connect("com.example.activityclient", BusRole::Public)?);
    let uri = |method: &str| format!("luna://{BUS_ID}/{method}");

    let reply = client.call(&uri("createTimer"), &json!({})).await?;
    println!("createTimer: {}", reply.payload);
    let timer_id = reply.payload["msg"]
        .as_str()
        .and_then(|msg| msg.rsplit(' ').next())
        .and_then(|id| id.parse::<u64>().ok())
        .unwrap_or(1);

    // The authority firing the timer
    let fired = json!({
        "fired": true,
        "$activity": { "activityId": timer_id, "activity": { "name": "Timer" } },
    });
    let reply = client.call(&uri("timerFired"), &fired).await?;
    println!("timerFired: {}", reply.payload);
    println!(
        "authority completions: {:?}, restart = {:?}",
        authority.completed(),
        authority.completion_options(timer_id).map(|o| o["restart"].clone())
    );

    let reply = client.call(&uri("timerFired"), &json!({})).await?;
    println!("timerFired without activity: {}", reply.payload);

    let reply = client.call(&uri("createTimer"), &json!({})).await?;
    println!("createTimer: {}", reply.payload);
    let reply = client
        .call(&uri("cancelActivity"), &json!({ "activityId": timer_id + 1 }))
        .await?;
    println!("cancelActivity: {}", reply.payload);

    let reason = run
        .await
        .map_err(|err| bus_service::Error::Transport(err.to_string()))??;
    println!("service stopped: {reason:?}");
    Ok(())
}
