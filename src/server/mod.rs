//! The service facade.
//!
//! A [`Service`] owns its bus connections, a dispatcher with the method
//! table and subscription table, and an [`ActivityManager`]. It is built by
//! [`ServiceBuilder`] and runs until the idle timer fires or `quit` is
//! called.

mod builder;
pub(crate) mod dispatcher;
mod handler;
mod registry;
mod subscriptions;

pub use builder::ServiceBuilder;
pub use handler::{BoxFuture, BoxedHandler, MethodSpec};

use crate::activity::ActivityManager;
use crate::client::{BusClient, Subscription};
use crate::config::ServiceConfig;
use crate::host::HostPtr;
use crate::sync::lock_ignore_poison;
use crate::{Message, Result, ShutdownReason, ShutdownSignal, TransportPtr};
use dispatcher::Dispatcher;
use registry::split_path;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;

/// Bus prefixes allowed to send on the restricted bus.
const PRIVILEGED_PREFIXES: [&str; 3] = ["com.palm.", "com.lge.", "com.webos."];

/// True if `id` may send on the restricted bus.
///
/// ```
/// # use bus_service::is_privileged;
/// assert!(is_privileged("com.webos.service.foo"));
/// assert!(!is_privileged("com.example.foo"));
/// assert!(!is_privileged("org.com.palm.foo"));
/// ```
pub fn is_privileged(id: &str) -> bool {
    PRIVILEGED_PREFIXES.iter().any(|prefix| id.starts_with(prefix))
}

/// How a service is attached to the bus.
#[derive(Clone)]
pub enum BusWiring {
    /// One connection to an access-controlled bus. Every method is
    /// registered on it.
    Unified(TransportPtr),

    /// Separate restricted and general-access connections.
    Split {
        /// Restricted bus connection.
        private: TransportPtr,
        /// General-access bus connection.
        public: TransportPtr,
    },
}

impl BusWiring {
    fn handles(&self) -> Vec<TransportPtr> {
        match self {
            BusWiring::Unified(handle) => vec![handle.clone()],
            BusWiring::Split { private, public } => vec![private.clone(), public.clone()],
        }
    }
}

struct Inner {
    // ---
    config: ServiceConfig,
    wiring: BusWiring,
    sending: TransportPtr,
    dispatcher: Arc<Dispatcher>,
    host: Option<HostPtr>,
    quit: ShutdownSignal,
    has_public_methods: AtomicBool,
    cleaned_up: AtomicBool,
    loops: Mutex<Vec<JoinHandle<Result<()>>>>,
}

/// A bus service.
///
/// Cheap to clone; clones share the same connections and state.
///
/// # Example
///
/// ```no_run
/// use bus_service::{BusRole, MemoryHub, MethodSpec, ServiceBuilder, ServiceConfig};
/// use serde_json::json;
///
/// # async fn example() -> bus_service::Result<()> {
/// let hub = MemoryHub::new();
/// let service = ServiceBuilder::new(ServiceConfig::new("com.example.helloworld"))
///     .unified(hub.connect("com.example.helloworld", BusRole::Unified)?)
///     .build()
///     .await?;
///
/// service
///     .register(MethodSpec::new("hello").on_request(|message| async move {
///         message.respond(json!({"reply": "Hello, World!"})).await?;
///         Ok(())
///     }))
///     .await?;
///
/// let reason = service.run().await?;
/// println!("stopped: {reason:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// Wire a service together. Called by [`ServiceBuilder::build`].
    pub(crate) async fn new(
        config: ServiceConfig,
        wiring: BusWiring,
        activities: ActivityManager,
        host: Option<HostPtr>,
    ) -> Result<Self> {
        // ---
        let sending = match &wiring {
            BusWiring::Unified(handle) => handle.clone(),
            BusWiring::Split { private, public } => {
                if is_privileged(&config.bus_id) {
                    private.clone()
                } else {
                    public.clone()
                }
            }
        };
        activities.set_transport(sending.clone());

        let service = Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(activities),
                config,
                wiring,
                sending,
                host,
                quit: ShutdownSignal::new(),
                has_public_methods: AtomicBool::new(false),
                cleaned_up: AtomicBool::new(false),
                loops: Mutex::new(Vec::new()),
            }),
        };

        if service.inner.config.builtin_methods {
            service.register_builtins(true).await?;
        }

        for handle in service.inner.wiring.handles() {
            let join = crate::transport::runner::run(handle, service.inner.dispatcher.clone()).await?;
            lock_ignore_poison(&service.inner.loops).push(join);
        }

        log_info!("{}: service ready", service.inner.config.bus_id);
        Ok(service)
    }

    /// Bus name of this service.
    pub fn bus_id(&self) -> &str {
        &self.inner.config.bus_id
    }

    /// The service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// The activity manager serving this service.
    pub fn activity_manager(&self) -> &ActivityManager {
        self.inner.dispatcher.activities()
    }

    /// Number of live inbound subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.dispatcher.subscription_count()
    }

    /// True once a method was exposed on the general-access bus.
    pub fn has_public_methods(&self) -> bool {
        self.inner.has_public_methods.load(Ordering::Acquire)
    }

    /// Register a method on every bus.
    ///
    /// The first call also exposes the built-in `quit` and `info` methods
    /// on the general-access bus.
    ///
    /// # Errors
    ///
    /// Returns an error if a connection refuses the registration.
    pub async fn register(&self, spec: MethodSpec) -> Result<()> {
        // ---
        let first_public = !self.inner.has_public_methods.swap(true, Ordering::AcqRel);
        if first_public && self.inner.config.builtin_methods {
            self.register_builtins(false).await?;
        }
        self.register_on(spec, false).await
    }

    /// Register a method on the restricted bus only.
    ///
    /// With [`BusWiring::Unified`] there is a single bus and the method is
    /// registered on it.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection refuses the registration.
    pub async fn register_private(&self, spec: MethodSpec) -> Result<()> {
        self.register_on(spec, true).await
    }

    async fn register_on(&self, spec: MethodSpec, private_bus: bool) -> Result<()> {
        // ---
        let (category, method) = split_path(&spec.path);

        let (handles, private_bus_only) = match &self.inner.wiring {
            BusWiring::Unified(handle) => (vec![handle.clone()], false),
            BusWiring::Split { private, .. } if private_bus => (vec![private.clone()], true),
            BusWiring::Split { private, public } => (vec![private.clone(), public.clone()], false),
        };

        for handle in &handles {
            handle.register_method(&category, &method).await?;
        }

        self.inner.dispatcher.register(
            &category,
            &method,
            spec.request,
            spec.cancel,
            spec.description,
            private_bus_only,
        );

        log_debug!("{}: registered {category}/{method}", self.bus_id());
        Ok(())
    }

    async fn register_builtins(&self, private_bus: bool) -> Result<()> {
        // ---
        let weak = Arc::downgrade(&self.inner);

        // Handlers are attached once, by the restricted-bus registration.
        let (quit, info) = if private_bus {
            let quit = MethodSpec::new("quit").on_request({
                let weak = weak.clone();
                move |message| quit_method(weak.clone(), message)
            });
            let info = MethodSpec::new("info").on_request({
                let weak = weak.clone();
                move |message| info_method(weak.clone(), message)
            });
            (quit, info)
        } else {
            (MethodSpec::new("quit"), MethodSpec::new("info"))
        };

        let quit = quit.description(json!({
            "description": "quits the service",
            "arguments": "[none]",
        }));
        let info = info.description(json!({
            "description": "returns information about the service",
            "arguments": "[none]",
        }));

        self.register_on(quit, private_bus).await?;
        self.register_on(info, private_bus).await
    }

    /// Client sending from this service's bus identity.
    ///
    /// In split wiring privileged services send on the restricted bus, all
    /// others on the general-access bus.
    pub fn client(&self) -> BusClient {
        BusClient::new(self.inner.sending.clone())
    }

    /// Call another service once. See [`BusClient::call`].
    pub async fn call(&self, uri: &str, args: &Value) -> Result<Message> {
        self.client().call(uri, args).await
    }

    /// Call on behalf of a user session. See [`BusClient::call_session`].
    pub async fn call_session(&self, uri: &str, args: &Value, session_id: &str) -> Result<Message> {
        self.client().call_session(uri, args, session_id).await
    }

    /// Subscribe to another service. See [`BusClient::subscribe`].
    pub async fn subscribe(&self, uri: &str, args: &Value) -> Result<Subscription> {
        self.client().subscribe(uri, args).await
    }

    /// Subscribe on behalf of a user session. See
    /// [`BusClient::subscribe_session`].
    pub async fn subscribe_session(
        &self,
        uri: &str,
        args: &Value,
        session_id: &str,
    ) -> Result<Subscription> {
        self.client().subscribe_session(uri, args, session_id).await
    }

    /// Ask the service to stop as if `quit` had been called.
    pub fn shutdown(&self) {
        self.inner.quit.trigger(ShutdownReason::Quit);
    }

    /// Serve until the idle timer fires or `quit` is called, then clean up.
    ///
    /// Requests are served from the moment the service is built; `run` only
    /// waits for the end.
    ///
    /// # Errors
    ///
    /// Returns an error if unregistering from the bus fails.
    pub async fn run(&self) -> Result<ShutdownReason> {
        // ---
        let idle = self.activity_manager().shutdown_signal();
        let reason = tokio::select! {
            reason = idle.wait() => reason,
            reason = self.inner.quit.wait() => reason,
        };

        log_info!("{}: shutting down ({reason:?})", self.bus_id());
        self.cleanup().await?;
        Ok(reason)
    }

    /// Run the service in a background task.
    pub fn spawn(&self) -> JoinHandle<Result<ShutdownReason>> {
        // ---
        let service = self.clone();
        tokio::spawn(async move { service.run().await })
    }

    /// Release live subscriptions, unregister from the bus, stop the idle
    /// timer and notify the host.
    ///
    /// Runs once; later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the first error a connection reports while unregistering.
    /// The remaining steps still run.
    pub async fn cleanup(&self) -> Result<()> {
        // ---
        if self.inner.cleaned_up.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let _released = self.inner.dispatcher.release_subscriptions().await;
        if _released > 0 {
            log_debug!("{}: released {_released} live subscriptions", self.bus_id());
        }

        let mut result = Ok(());
        for handle in self.inner.wiring.handles() {
            if let Err(err) = handle.unregister().await {
                log_error!("{}: unregister failed: {err}", self.bus_id());
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        let loops: Vec<_> = lock_ignore_poison(&self.inner.loops).drain(..).collect();
        for join in loops {
            join.abort();
        }

        self.activity_manager().stop_timer();

        if let Some(host) = &self.inner.host {
            host.cleanup(self.bus_id());
        }
        result
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("bus_id", &self.inner.config.bus_id)
            .field("has_public_methods", &self.has_public_methods())
            .finish()
    }
}

async fn quit_method(service: Weak<Inner>, message: Message) -> Result<()> {
    // ---
    let Some(service) = service.upgrade() else {
        return Ok(());
    };

    if !service.has_public_methods.load(Ordering::Acquire) && !message.role().is_private() {
        message
            .respond(json!({
                "returnValue": false,
                "errorText": "The \"quit\" method is not supported on the Public bus",
            }))
            .await?;
        return Ok(());
    }

    message.respond(json!({ "status": "quitting" })).await?;

    let quit = service.quit.clone();
    let grace = service.config.quit_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        quit.trigger(ShutdownReason::Quit);
    });
    Ok(())
}

async fn info_method(service: Weak<Inner>, message: Message) -> Result<()> {
    // ---
    let Some(service) = service.upgrade() else {
        return Ok(());
    };

    let commands = service.dispatcher.describe(message.role().is_private());
    message.respond(json!({ "commands": commands })).await?;
    Ok(())
}

