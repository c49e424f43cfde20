//! Service configuration.
//!
//! Transport-agnostic knobs for a bus service: the idle shutdown timer, the
//! activity authority, built-in methods and the two startup flags
//! (`--disable-timeouts`, `--disable-activity-creation`).

use std::time::Duration;

/// Bus address of the activity authority.
pub const DEFAULT_ACTIVITY_AUTHORITY_URI: &str = "luna://com.webos.service.activitymanager";

/// Command-line flag that keeps the service alive when the idle timer fires.
pub const DISABLE_TIMEOUTS_FLAG: &str = "--disable-timeouts";

/// Command-line flag that replaces authority activities with local dummies.
pub const DISABLE_ACTIVITY_CREATION_FLAG: &str = "--disable-activity-creation";

/// Settings consumed by the activity manager.
///
/// # Example
///
/// ```
/// use bus_service::ActivityConfig;
/// use std::time::Duration;
///
/// let config = ActivityConfig {
///     idle_timeout: Duration::from_secs(10),
///     ..ActivityConfig::default()
/// };
/// assert!(config.exit_on_timeout);
/// ```
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    /// How long the live-activity count must stay at zero before shutdown.
    pub idle_timeout: Duration,

    /// When false, a fired idle timer is only logged.
    pub exit_on_timeout: bool,

    /// Skip the authority and synthesize `dummy_<n>` activities.
    pub use_dummy_activity: bool,

    /// Base URI of the activity authority (`/create`, `/adopt`, `/complete`
    /// are appended).
    pub authority_uri: String,
}

impl Default for ActivityConfig {
    /// - `idle_timeout`: 5s
    /// - `exit_on_timeout`: true
    /// - `use_dummy_activity`: false
    /// - `authority_uri`: [`DEFAULT_ACTIVITY_AUTHORITY_URI`]
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            exit_on_timeout: true,
            use_dummy_activity: false,
            authority_uri: DEFAULT_ACTIVITY_AUTHORITY_URI.to_string(),
        }
    }
}

/// Configuration of one bus service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // ---
    /// Bus name the service registers under (e.g. `"com.example.helloworld"`).
    pub bus_id: String,

    /// Register the `quit` and `info` methods.
    pub builtin_methods: bool,

    /// Delay between answering `quit` and shutting down, so the response
    /// can flush.
    ///
    /// Default: 50ms
    pub quit_grace: Duration,

    /// Activity manager settings.
    pub activity: ActivityConfig,
}

impl ServiceConfig {
    /// Create a config with defaults for the given bus name.
    pub fn new(bus_id: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            builtin_methods: true,
            quit_grace: Duration::from_millis(50),
            activity: ActivityConfig::default(),
        }
    }

    /// Create a config and apply the startup flags found in `args`.
    ///
    /// Unknown arguments are ignored.
    ///
    /// # Example
    ///
    /// ```
    /// use bus_service::ServiceConfig;
    ///
    /// let config = ServiceConfig::from_args(
    ///     "com.example.svc",
    ///     ["svc", "--disable-timeouts"],
    /// );
    /// assert!(!config.activity.exit_on_timeout);
    /// assert!(!config.activity.use_dummy_activity);
    /// ```
    pub fn from_args<I, S>(bus_id: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        // ---
        let mut config = Self::new(bus_id);
        for arg in args {
            match arg.as_ref() {
                DISABLE_TIMEOUTS_FLAG => config.activity.exit_on_timeout = false,
                DISABLE_ACTIVITY_CREATION_FLAG => config.activity.use_dummy_activity = true,
                _ => {}
            }
        }
        config
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.activity.idle_timeout = timeout;
        self
    }

    /// Keep running when the idle timer fires.
    pub fn with_timeouts_disabled(mut self) -> Self {
        self.activity.exit_on_timeout = false;
        self
    }

    /// Use local dummy activities instead of the authority.
    pub fn with_dummy_activities(mut self) -> Self {
        self.activity.use_dummy_activity = true;
        self
    }

    /// Do not register `quit` and `info`.
    pub fn without_builtin_methods(mut self) -> Self {
        self.builtin_methods = false;
        self
    }

    /// Override the activity authority URI.
    pub fn with_authority_uri(mut self, uri: impl Into<String>) -> Self {
        self.activity.authority_uri = uri.into();
        self
    }

    /// Set the grace period between the `quit` response and shutdown.
    pub fn with_quit_grace(mut self, grace: Duration) -> Self {
        self.quit_grace = grace;
        self
    }
}
