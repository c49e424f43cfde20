//! Service builder.
//!
//! Provides a fluent builder API for wiring a [`Service`] to its bus
//! connections, an optional embedding host and an optional shared activity
//! manager.

use super::{BusWiring, Service};
use crate::activity::ActivityManager;
use crate::config::ServiceConfig;
use crate::host::HostPtr;
use crate::{Error, Result, TransportPtr};

/// Builder for creating [`Service`] instances.
///
/// # Examples
///
/// ## Single access-controlled bus
/// ```no_run
/// use bus_service::{BusRole, MemoryHub, ServiceBuilder, ServiceConfig};
///
/// # async fn example() -> bus_service::Result<()> {
/// let hub = MemoryHub::new();
/// let service = ServiceBuilder::new(ServiceConfig::new("com.example.svc"))
///     .unified(hub.connect("com.example.svc", BusRole::Unified)?)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Restricted and general-access buses
/// ```no_run
/// use bus_service::{BusRole, MemoryHub, ServiceBuilder, ServiceConfig};
///
/// # async fn example() -> bus_service::Result<()> {
/// let hub = MemoryHub::new();
/// let service = ServiceBuilder::new(ServiceConfig::new("com.example.svc").with_dummy_activities())
///     .split(
///         hub.connect("com.example.svc", BusRole::Private)?,
///         hub.connect("com.example.svc", BusRole::Public)?,
///     )
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBuilder {
    // ---
    config: ServiceConfig,
    wiring: Option<BusWiring>,
    host: Option<HostPtr>,
    activities: Option<ActivityManager>,
}

impl ServiceBuilder {
    /// Create a new service builder.
    pub fn new(config: ServiceConfig) -> Self {
        // ---
        Self {
            config,
            wiring: None,
            host: None,
            activities: None,
        }
    }

    /// Attach to a single access-controlled bus.
    pub fn unified(mut self, handle: TransportPtr) -> Self {
        self.wiring = Some(BusWiring::Unified(handle));
        self
    }

    /// Attach to separate restricted and general-access buses.
    pub fn split(mut self, private: TransportPtr, public: TransportPtr) -> Self {
        self.wiring = Some(BusWiring::Split { private, public });
        self
    }

    /// Attach with an explicit [`BusWiring`].
    pub fn wiring(mut self, wiring: BusWiring) -> Self {
        self.wiring = Some(wiring);
        self
    }

    /// Run inside an embedding host.
    ///
    /// The host receives activity notifications and the `cleanup` call when
    /// the service stops.
    pub fn host(mut self, host: HostPtr) -> Self {
        self.host = Some(host);
        self
    }

    /// Use an existing activity manager instead of creating one.
    ///
    /// Default: a new manager built from the config's activity settings and
    /// the host, if any.
    pub fn activity_manager(mut self, manager: ActivityManager) -> Self {
        self.activities = Some(manager);
        self
    }

    /// Build the service (consumes self).
    ///
    /// Registers the built-in methods on the restricted bus and starts
    /// serving requests. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if no bus connection was given or a
    ///   connection belongs to another service
    /// - any error a connection reports while registering or listening
    pub async fn build(self) -> Result<Service> {
        // ---
        let wiring = self
            .wiring
            .ok_or_else(|| Error::InvalidArgument("no bus connection configured".into()))?;

        let wrong = match &wiring {
            BusWiring::Unified(handle) => (handle.service_name() != self.config.bus_id)
                .then(|| handle.service_name().to_string()),
            BusWiring::Split { private, public } => [private, public]
                .into_iter()
                .find(|handle| handle.service_name() != self.config.bus_id)
                .map(|handle| handle.service_name().to_string()),
        };
        if let Some(name) = wrong {
            return Err(Error::InvalidArgument(format!(
                "connection for {name} cannot serve {}",
                self.config.bus_id
            )));
        }

        let activities = match self.activities {
            Some(manager) => manager,
            None => ActivityManager::new(self.config.activity.clone(), self.host.clone()),
        };

        Service::new(self.config, wiring, activities, self.host).await
    }
}
