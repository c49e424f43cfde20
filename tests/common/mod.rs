// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing_subscriber::EnvFilter;

use bus_service::{
    // ---
    BusClient,
    BusRole,
    MemoryAuthority,
    MemoryHub,
    Message,
    ServiceHost,
    Subscription,
    SubscriptionEvent,
};

/// Install a test-friendly tracing subscriber once. `RUST_LOG` selects the
/// level.
pub fn init_tracing() {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A private hub with an activity authority and a client on each bus.
pub struct Bus {
    // ---
    pub hub: Arc<MemoryHub>,
    pub authority: MemoryAuthority,
    pub public_client: BusClient,
    pub private_client: BusClient,
}

impl Bus {
    pub async fn new() -> Self {
        // ---
        init_tracing();
        let hub = MemoryHub::new();
        let authority = MemoryAuthority::spawn(&hub)
            .await
            .expect("failed to start authority");
        let public_client = BusClient::new(
            hub.connect("com.example.client", BusRole::Public)
                .expect("failed to connect public client"),
        );
        let private_client = BusClient::new(
            hub.connect("com.example.privileged", BusRole::Private)
                .expect("failed to connect private client"),
        );
        Self {
            hub,
            authority,
            public_client,
            private_client,
        }
    }
}

/// Wait up to a second for `cond` to hold.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    // ---
    timeout(Duration::from_secs(1), async {
        while !cond() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Next event of `sub`, failing the test after a second.
pub async fn next_event(sub: &mut Subscription) -> SubscriptionEvent {
    // ---
    timeout(Duration::from_secs(1), sub.next())
        .await
        .expect("timed out waiting for subscription event")
        .expect("subscription ended unexpectedly")
}

/// Shared counter for handler invocations.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Slot where a handler parks the message it received.
#[derive(Clone, Default)]
pub struct Parked(Arc<Mutex<Option<Message>>>);

impl Parked {
    pub fn put(&self, message: Message) {
        *self.0.lock().unwrap() = Some(message);
    }

    pub fn take(&self) -> Option<Message> {
        self.0.lock().unwrap().take()
    }

    pub fn is_set(&self) -> bool {
        self.0.lock().unwrap().is_some()
    }
}

/// Embedding host recording every notification.
#[derive(Default)]
pub struct RecordingHost {
    pub increases: AtomicUsize,
    pub decreases: AtomicUsize,
    pub idles: AtomicUsize,
    pub cleanups: Mutex<Vec<String>>,
}

impl ServiceHost for RecordingHost {
    fn increase_activity(&self) {
        self.increases.fetch_add(1, Ordering::SeqCst);
    }

    fn decrease_activity(&self) {
        self.decreases.fetch_add(1, Ordering::SeqCst);
    }

    fn enter_idle(&self) {
        self.idles.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&self, bus_id: &str) {
        self.cleanups.lock().unwrap().push(bus_id.to_string());
    }
}
