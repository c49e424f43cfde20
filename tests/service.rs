// tests/service.rs

mod common;

use serde_json::json;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};

use bus_service::{
    // ---
    ActivityManager,
    BusClient,
    BusEvent,
    BusRole,
    Error,
    MemoryHub,
    Message,
    MethodSpec,
    Service,
    ServiceBuilder,
    ServiceConfig,
    ShutdownReason,
    SubscriptionEvent,
    AUTHORITY_SERVICE_NAME,
};

use common::{next_event, wait_until, Bus, Counter, Parked, RecordingHost};

async fn unified_service(bus: &Bus, bus_id: &str) -> Service {
    // ---
    ServiceBuilder::new(ServiceConfig::new(bus_id))
        .unified(bus.hub.connect(bus_id, BusRole::Unified).expect("connect failed"))
        .build()
        .await
        .expect("failed to build service")
}

async fn split_service(bus: &Bus, bus_id: &str) -> Service {
    // ---
    ServiceBuilder::new(ServiceConfig::new(bus_id))
        .split(
            bus.hub.connect(bus_id, BusRole::Private).expect("connect failed"),
            bus.hub.connect(bus_id, BusRole::Public).expect("connect failed"),
        )
        .build()
        .await
        .expect("failed to build service")
}

/// `hello` that parks its message and greets the caller.
fn hello(parked: &Parked) -> MethodSpec {
    // ---
    let parked = parked.clone();
    MethodSpec::new("hello").on_request(move |message: Message| {
        let parked = parked.clone();
        async move {
            parked.put(message.clone());
            let name = message.payload["name"].as_str().unwrap_or("World").to_string();
            message.respond(json!({ "reply": format!("Hello, {name}!") })).await?;
            Ok(())
        }
    })
}

/// `heartbeat` subscription: answers once, parks the message, counts cancels.
fn heartbeat(parked: &Parked, cancels: &Counter) -> MethodSpec {
    // ---
    let parked = parked.clone();
    let cancels = cancels.clone();
    MethodSpec::new("heartbeat")
        .on_request(move |message: Message| {
            let parked = parked.clone();
            async move {
                parked.put(message.clone());
                message.respond(json!({ "beat": 1 })).await?;
                Ok(())
            }
        })
        .on_cancel(move |_message: Message| {
            let cancels = cancels.clone();
            async move {
                cancels.bump();
                Ok(())
            }
        })
}

#[tokio::test]
async fn request_is_backed_by_an_activity_released_on_respond() {
    // ---
    // Arrange
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.hello").await;
    let parked = Parked::default();
    service.register(hello(&parked)).await.expect("register failed");

    // ---
    // Act
    // ---
    let reply = bus
        .public_client
        .call("luna://com.example.hello/hello", &json!({ "name": "Ada" }))
        .await
        .expect("call failed");

    // ---
    // Assert
    // ---
    assert_eq!(reply.payload["reply"], "Hello, Ada!");
    assert_eq!(reply.payload["returnValue"], true);

    let message = parked.take().expect("handler did not run");
    assert_eq!(message.sender, "com.example.client");
    let activity = message.activity().expect("no activity attached");
    assert_eq!(activity.name(), "hello1");
    assert_eq!(activity.id(), "1");

    let manager = service.activity_manager();
    wait_until(|| bus.authority.completed() == vec![1]).await;
    wait_until(|| manager.live_count() == 0).await;
    assert!(manager.is_idle_timer_armed());
    assert!(activity.is_completed());
    wait_until(|| bus.authority.subscribers(1) == 0).await;
}

#[tokio::test]
async fn malformed_payload_reaches_handler_as_bad_payload() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.echo").await;
    service
        .register(MethodSpec::new("echo").on_request(|message: Message| async move {
            message.respond(json!({ "echo": &message.payload })).await?;
            Ok(())
        }))
        .await
        .expect("register failed");

    let mut call = bus
        .public_client
        .transport()
        .call("luna://com.example.echo/echo", "{not json".into(), None)
        .await
        .expect("call failed");

    let reply = match timeout(Duration::from_secs(1), call.inbox.recv()).await {
        Ok(Some(BusEvent::Response(raw))) => serde_json::from_slice::<serde_json::Value>(&raw.payload).unwrap(),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(reply["echo"], json!({ "badPayload": "{not json" }));
}

#[tokio::test]
async fn subscription_without_cancel_handler_is_dropped() {
    // ---
    // Arrange
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.watch").await;
    let invoked = Counter::default();
    service
        .register(MethodSpec::new("watch").on_request({
            let invoked = invoked.clone();
            move |_message: Message| {
                let invoked = invoked.clone();
                async move {
                    invoked.bump();
                    Ok(())
                }
            }
        }))
        .await
        .expect("register failed");

    // ---
    // Act
    // ---
    let mut sub = bus
        .public_client
        .subscribe("luna://com.example.watch/watch", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");

    // ---
    // Assert
    // ---
    assert!(timeout(Duration::from_millis(50), sub.next()).await.is_err());
    assert_eq!(invoked.get(), 0);
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(bus.authority.created(), 0);
}

#[tokio::test]
async fn client_cancel_tears_down_subscription() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.beat").await;
    let parked = Parked::default();
    let cancels = Counter::default();
    service
        .register(heartbeat(&parked, &cancels))
        .await
        .expect("register failed");

    let mut sub = bus
        .public_client
        .subscribe("luna://com.example.beat/heartbeat", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");

    match next_event(&mut sub).await {
        SubscriptionEvent::Response(m) => assert_eq!(m.payload["beat"], 1),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(service.subscription_count(), 1);
    assert_eq!(service.activity_manager().live_count(), 1);

    sub.cancel();

    wait_until(|| cancels.get() == 1).await;
    assert_eq!(service.subscription_count(), 0);
    wait_until(|| bus.authority.completed() == vec![1]).await;
    wait_until(|| service.activity_manager().live_count() == 0).await;
}

#[tokio::test]
async fn server_cancel_sends_final_response() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.beat").await;
    let parked = Parked::default();
    let cancels = Counter::default();
    service
        .register(heartbeat(&parked, &cancels))
        .await
        .expect("register failed");

    let mut sub = bus
        .public_client
        .subscribe("luna://com.example.beat/heartbeat", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");
    wait_until(|| parked.is_set()).await;

    let message = parked.take().expect("handler did not run");
    assert!(message
        .cancel(Some(json!({ "reason": "done" })))
        .await
        .expect("cancel failed"));

    assert!(matches!(next_event(&mut sub).await, SubscriptionEvent::Response(_)));
    match next_event(&mut sub).await {
        SubscriptionEvent::Cancel(m) => {
            assert_eq!(m.payload["subscribed"], false);
            assert_eq!(m.payload["reason"], "done");
            assert_eq!(m.payload["returnValue"], true);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(sub.next().await.is_none());

    assert_eq!(cancels.get(), 1);
    assert_eq!(service.subscription_count(), 0);
    wait_until(|| service.activity_manager().live_count() == 0).await;

    // A cancel for a non-subscription request is a no-op
    let parked_hello = Parked::default();
    service.register(hello(&parked_hello)).await.expect("register failed");
    bus.public_client
        .call("luna://com.example.beat/hello", &json!({}))
        .await
        .expect("call failed");
    let plain = parked_hello.take().expect("handler did not run");
    assert!(!plain.cancel(None).await.expect("cancel failed"));
}

#[tokio::test]
async fn quit_refused_on_public_bus_without_public_methods() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.quiet").await;

    let reply = bus
        .public_client
        .call("luna://com.example.quiet/quit", &json!({}))
        .await
        .expect("call failed");

    assert_eq!(reply.payload["returnValue"], false);
    assert_eq!(
        reply.payload["errorText"],
        "The \"quit\" method is not supported on the Public bus"
    );
    assert!(!service.has_public_methods());
}

#[tokio::test]
async fn quit_from_private_bus_stops_service() {
    // ---
    // Arrange
    // ---
    let bus = Bus::new().await;
    let service = split_service(&bus, "com.example.split").await;
    let run = service.spawn();

    // quit is not exposed on the general-access bus yet
    let refused = bus
        .public_client
        .call("luna://com.example.split/quit", &json!({}))
        .await
        .expect("call failed");
    assert_eq!(refused.payload["returnValue"], false);

    // ---
    // Act
    // ---
    let reply = bus
        .private_client
        .call("luna://com.example.split/quit", &json!({}))
        .await
        .expect("call failed");

    // ---
    // Assert
    // ---
    assert_eq!(reply.payload["status"], "quitting");
    let reason = timeout(Duration::from_secs(1), run)
        .await
        .expect("service did not stop")
        .expect("service task panicked")
        .expect("service failed");
    assert_eq!(reason, ShutdownReason::Quit);

    // Unregistered: the bus no longer knows the service
    let gone = bus
        .private_client
        .call("luna://com.example.split/info", &json!({}))
        .await
        .expect("call failed");
    assert_eq!(gone.payload["returnValue"], false);
}

#[tokio::test]
async fn quit_allowed_on_public_bus_once_public_methods_exist() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.open").await;
    service.register(hello(&Parked::default())).await.expect("register failed");
    let run = service.spawn();

    let reply = bus
        .public_client
        .call("luna://com.example.open/quit", &json!({}))
        .await
        .expect("call failed");
    assert_eq!(reply.payload["status"], "quitting");

    let reason = timeout(Duration::from_secs(1), run)
        .await
        .expect("service did not stop")
        .expect("service task panicked")
        .expect("service failed");
    assert_eq!(reason, ShutdownReason::Quit);
}

#[tokio::test]
async fn info_lists_methods_visible_on_callers_bus() {
    // ---
    let bus = Bus::new().await;
    let service = split_service(&bus, "com.example.info").await;
    service
        .register_private(MethodSpec::new("secret").on_request(|m: Message| async move {
            m.respond(json!({})).await?;
            Ok(())
        }))
        .await
        .expect("register failed");
    service
        .register(
            hello(&Parked::default()).description(json!({ "description": "greets the caller" })),
        )
        .await
        .expect("register failed");
    assert!(service.has_public_methods());

    let private = bus
        .private_client
        .call("luna://com.example.info/info", &json!({}))
        .await
        .expect("call failed");
    let commands = private.payload["commands"].as_object().unwrap();
    assert!(commands.contains_key("/secret"));
    assert_eq!(commands["/hello"], json!({ "description": "greets the caller" }));
    assert_eq!(commands["/quit"]["description"], "quits the service");
    assert!(commands.contains_key("/info"));

    let public = bus
        .public_client
        .call("luna://com.example.info/info", &json!({}))
        .await
        .expect("call failed");
    let commands = public.payload["commands"].as_object().unwrap();
    assert!(!commands.contains_key("/secret"));
    assert!(commands.contains_key("/hello"));
    assert!(commands.contains_key("/quit"));
    assert!(commands.contains_key("/info"));
}

#[tokio::test]
async fn builtin_methods_can_be_disabled() {
    // ---
    let bus = Bus::new().await;
    let service = ServiceBuilder::new(ServiceConfig::new("com.example.bare").without_builtin_methods())
        .unified(bus.hub.connect("com.example.bare", BusRole::Unified).unwrap())
        .build()
        .await
        .expect("failed to build service");
    service.register(hello(&Parked::default())).await.expect("register failed");

    let reply = bus
        .public_client
        .call("luna://com.example.bare/info", &json!({}))
        .await
        .expect("call failed");
    assert_eq!(reply.payload["returnValue"], false);
}

#[tokio::test]
async fn adopt_uses_callers_activity() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.alarm").await;
    let parked = Parked::default();
    service.register(hello(&parked)).await.expect("register failed");
    let reference = bus.authority.issue("Timer");

    bus.public_client
        .call("luna://com.example.alarm/hello", &json!({ "$activity": reference }))
        .await
        .expect("call failed");

    let message = parked.take().expect("handler did not run");
    let activity = message.activity().expect("no activity attached");
    assert_eq!(activity.id(), "1");
    assert_eq!(activity.name(), "Timer");
    assert_eq!(bus.authority.created(), 1);

    wait_until(|| bus.authority.completed() == vec![1]).await;
    wait_until(|| service.activity_manager().live_count() == 0).await;
}

#[tokio::test]
async fn refused_adopt_skips_handler() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.alarm").await;
    let parked = Parked::default();
    service.register(hello(&parked)).await.expect("register failed");
    let reference = bus.authority.issue("Timer");
    bus.authority.refuse_adopt(1);

    let args = json!({ "$activity": reference });
    let call = bus.public_client.call("luna://com.example.alarm/hello", &args);
    assert!(timeout(Duration::from_millis(100), call).await.is_err());

    assert!(!parked.is_set());
    assert_eq!(service.activity_manager().live_count(), 0);
    assert!(service.activity_manager().is_idle_timer_armed());
}

#[tokio::test]
async fn failed_create_skips_handler() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.hello").await;
    let parked = Parked::default();
    service.register(hello(&parked)).await.expect("register failed");
    bus.authority.fail_next_create("no resources");

    let args = json!({});
    let call = bus.public_client.call("luna://com.example.hello/hello", &args);
    assert!(timeout(Duration::from_millis(100), call).await.is_err());

    assert!(!parked.is_set());
    assert_eq!(service.activity_manager().live_count(), 0);
}

#[tokio::test]
async fn handler_error_becomes_error_response() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.strict").await;
    service
        .register(MethodSpec::new("greet").on_request(|message: Message| async move {
            if message.payload.get("name").is_none() {
                return Err(Error::InvalidArgument("name required".into()));
            }
            message.respond(json!({})).await?;
            Ok(())
        }))
        .await
        .expect("register failed");
    service
        .register(MethodSpec::new("scalar").on_request(|message: Message| async move {
            message.respond(json!(42)).await?;
            Ok(())
        }))
        .await
        .expect("register failed");

    let reply = bus
        .public_client
        .call("luna://com.example.strict/greet", &json!({}))
        .await
        .expect("call failed");
    assert_eq!(reply.payload["returnValue"], false);
    assert_eq!(reply.payload["errorCode"], -1);
    assert!(reply.payload["errorText"].as_str().unwrap().contains("name required"));

    let reply = bus
        .public_client
        .call("luna://com.example.strict/scalar", &json!({}))
        .await
        .expect("call failed");
    assert_eq!(reply.payload["errorText"], "response must be an object");

    wait_until(|| bus.authority.completed().len() == 2).await;
    wait_until(|| service.activity_manager().live_count() == 0).await;
}

#[tokio::test]
async fn nested_paths_are_routable() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.paths").await;
    for path in ["do/re/me", "/config/setGreeting", "bar"] {
        service
            .register(MethodSpec::new(path).on_request(|message: Message| async move {
                let route = json!({ "category": &message.category, "method": &message.method });
                message.respond(json!({ "route": route })).await?;
                Ok(())
            }))
            .await
            .expect("register failed");
    }

    for (uri, category, method) in [
        ("luna://com.example.paths/do/re/me", "/do/re", "me"),
        ("luna://com.example.paths/config/setGreeting", "/config", "setGreeting"),
        ("luna://com.example.paths/bar", "/", "bar"),
    ] {
        let reply = bus.public_client.call(uri, &json!({})).await.expect("call failed");
        assert_eq!(reply.payload["route"]["category"], category);
        assert_eq!(reply.payload["route"]["method"], method);
    }
}

#[tokio::test]
async fn shared_activity_manager_counts_across_services() {
    // ---
    let bus = Bus::new().await;
    let config = ServiceConfig::new("unused").with_dummy_activities();
    let manager = ActivityManager::new(config.activity.clone(), None);

    let mut parked = Vec::new();
    for bus_id in ["com.example.one", "com.example.two"] {
        let service = ServiceBuilder::new(ServiceConfig {
            bus_id: bus_id.to_string(),
            ..config.clone()
        })
        .unified(bus.hub.connect(bus_id, BusRole::Unified).unwrap())
        .activity_manager(manager.clone())
        .build()
        .await
        .expect("failed to build service");
        let slot = Parked::default();
        service.register(hello(&slot)).await.expect("register failed");
        bus.public_client
            .call(&format!("luna://{bus_id}/hello"), &json!({}))
            .await
            .expect("call failed");
        parked.push((service, slot));
    }

    let names: Vec<String> = parked
        .iter()
        .map(|(_, slot)| slot.take().unwrap().activity().unwrap().name().to_string())
        .collect();
    assert_eq!(names, vec!["hello1", "hello2"]);
    wait_until(|| manager.live_count() == 0).await;
    assert_eq!(bus.authority.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_service_shuts_down_and_cleans_up() {
    // ---
    // Arrange
    // ---
    let bus = Bus::new().await;
    let host = Arc::new(RecordingHost::default());
    let service = ServiceBuilder::new(ServiceConfig::new("com.example.idle").with_dummy_activities())
        .unified(bus.hub.connect("com.example.idle", BusRole::Unified).unwrap())
        .host(host.clone())
        .build()
        .await
        .expect("failed to build service");

    let parked = Parked::default();
    service
        .register(MethodSpec::new("slow").on_request({
            let parked = parked.clone();
            move |message: Message| {
                let parked = parked.clone();
                async move {
                    parked.put(message);
                    Ok(())
                }
            }
        }))
        .await
        .expect("register failed");

    let run = service.spawn();
    let client = bus.public_client.clone();
    let call = tokio::spawn(async move { client.call("luna://com.example.idle/slow", &json!({})).await });

    // ---
    // Act
    // ---
    wait_until(|| parked.is_set()).await;
    sleep(Duration::from_secs(30)).await;
    assert!(!run.is_finished());

    let message = parked.take().unwrap();
    message.respond(json!({})).await.expect("respond failed");
    call.await.unwrap().expect("call failed");

    // ---
    // Assert
    // ---
    let reason = run.await.unwrap().expect("service failed");
    assert_eq!(reason, ShutdownReason::Idle);
    assert_eq!(*host.cleanups.lock().unwrap(), vec!["com.example.idle".to_string()]);
    assert_eq!(host.increases.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(host.decreases.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(!service.activity_manager().is_idle_timer_armed());
}

#[tokio::test]
async fn failing_subscription_handler_ends_subscription() {
    // ---
    // Arrange
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.watch").await;
    let cancels = Counter::default();
    service
        .register(
            MethodSpec::new("watch")
                .on_request(|_message: Message| async { Err(Error::InvalidArgument("bad".into())) })
                .on_cancel({
                    let cancels = cancels.clone();
                    move |_message: Message| {
                        let cancels = cancels.clone();
                        async move {
                            cancels.bump();
                            Ok(())
                        }
                    }
                }),
        )
        .await
        .expect("register failed");

    // ---
    // Act
    // ---
    let mut sub = bus
        .public_client
        .subscribe("luna://com.example.watch/watch", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");

    // ---
    // Assert
    // ---
    match next_event(&mut sub).await {
        SubscriptionEvent::Cancel(m) => {
            assert_eq!(m.payload["subscribed"], false);
            assert_eq!(m.payload["returnValue"], false);
            assert_eq!(m.payload["errorCode"], -1);
            assert!(m.payload["errorText"].as_str().unwrap().contains("bad"));
        }
        other => panic!("unexpected {other:?}"),
    }

    let manager = service.activity_manager();
    wait_until(|| manager.live_count() == 0).await;
    assert_eq!(service.subscription_count(), 0);
    assert!(manager.is_idle_timer_armed());
    assert_eq!(bus.authority.completed(), vec![1]);
    assert_eq!(cancels.get(), 1);
}

#[tokio::test]
async fn cancel_during_attachment_releases_activity() {
    // ---
    // Arrange
    // ---
    let hub = MemoryHub::new();
    let authority = hub
        .connect(AUTHORITY_SERVICE_NAME, BusRole::Unified)
        .expect("connect failed");
    for verb in ["create", "complete"] {
        authority.register_method("/", verb).await.expect("register failed");
    }
    let mut authority_events = authority.listen().await.expect("listen failed");

    let service = ServiceBuilder::new(ServiceConfig::new("com.example.race"))
        .unified(hub.connect("com.example.race", BusRole::Unified).expect("connect failed"))
        .build()
        .await
        .expect("failed to build service");

    let handled = Counter::default();
    let cancels = Counter::default();
    service
        .register(
            MethodSpec::new("watch")
                .on_request({
                    let handled = handled.clone();
                    move |_message: Message| {
                        let handled = handled.clone();
                        async move {
                            handled.bump();
                            Ok(())
                        }
                    }
                })
                .on_cancel({
                    let cancels = cancels.clone();
                    move |_message: Message| {
                        let cancels = cancels.clone();
                        async move {
                            cancels.bump();
                            Ok(())
                        }
                    }
                }),
        )
        .await
        .expect("register failed");

    let client = BusClient::new(hub.connect("com.example.client", BusRole::Public).expect("connect failed"));
    let mut sub = client
        .subscribe("luna://com.example.race/watch", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");

    // The authority holds its create reply
    let create = match timeout(Duration::from_secs(1), authority_events.inbox.recv()).await {
        Ok(Some(BusEvent::Request(request))) if request.method == "create" => request,
        other => panic!("unexpected {other:?}"),
    };

    // ---
    // Act
    // ---
    sub.cancel();
    wait_until(|| cancels.get() == 1).await;
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(handled.get(), 0);

    assert!(authority.subscription_add(&create));
    assert!(authority.respond(
        &create,
        json!({ "returnValue": true, "activityId": 7, "subscribed": true }).to_string()
    ));

    let complete = loop {
        match timeout(Duration::from_secs(1), authority_events.inbox.recv()).await {
            Ok(Some(BusEvent::Request(request))) if request.method == "complete" => break request,
            Ok(Some(_)) => continue,
            other => panic!("unexpected {other:?}"),
        }
    };
    let args: serde_json::Value = serde_json::from_slice(&complete.payload).expect("bad complete payload");
    assert_eq!(args["activityId"], 7);
    assert!(authority.respond(&complete, json!({ "returnValue": true }).to_string()));

    // ---
    // Assert
    // ---
    wait_until(|| handled.get() == 1).await;
    assert_eq!(cancels.get(), 1);
    let manager = service.activity_manager();
    wait_until(|| manager.live_count() == 0).await;
    assert!(manager.is_idle_timer_armed());
}

#[tokio::test]
async fn repeated_server_cancel_is_ignored() {
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.beat").await;
    let parked = Parked::default();
    let cancels = Counter::default();
    service
        .register(heartbeat(&parked, &cancels))
        .await
        .expect("register failed");

    let mut sub = bus
        .public_client
        .subscribe("luna://com.example.beat/heartbeat", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");
    assert!(matches!(next_event(&mut sub).await, SubscriptionEvent::Response(_)));
    let message = parked.take().expect("handler did not run");

    assert!(message.cancel(None).await.expect("cancel failed"));
    assert!(matches!(next_event(&mut sub).await, SubscriptionEvent::Cancel(_)));
    assert!(sub.next().await.is_none());

    // The row is gone: nothing is torn down twice
    let again = message.cancel(None).await.expect("cancel failed");

    assert!(!again);
    assert_eq!(cancels.get(), 1);
    assert_eq!(bus.authority.completed(), vec![1]);
    assert_eq!(service.subscription_count(), 0);
}

#[tokio::test]
async fn shutdown_releases_live_subscriptions() {
    // ---
    // Arrange
    // ---
    let bus = Bus::new().await;
    let service = unified_service(&bus, "com.example.beat").await;
    let parked = Parked::default();
    let cancels = Counter::default();
    service
        .register(heartbeat(&parked, &cancels))
        .await
        .expect("register failed");

    let mut sub = bus
        .public_client
        .subscribe("luna://com.example.beat/heartbeat", &json!({ "subscribe": true }))
        .await
        .expect("subscribe failed");
    assert!(matches!(next_event(&mut sub).await, SubscriptionEvent::Response(_)));
    assert_eq!(service.activity_manager().live_count(), 1);

    // ---
    // Act
    // ---
    service.shutdown();
    let reason = service.run().await.expect("service failed");

    // ---
    // Assert
    // ---
    assert_eq!(reason, ShutdownReason::Quit);
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(service.activity_manager().live_count(), 0);
    assert_eq!(bus.authority.completed(), vec![1]);
    assert_eq!(cancels.get(), 0);

    // Unregistering closed the exchange
    let end = timeout(Duration::from_secs(1), sub.next())
        .await
        .expect("subscription still open");
    assert!(end.is_none());
}
