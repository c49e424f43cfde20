use crate::{Message, Result};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by a handler.
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Type-erased async handler function
///
/// Handlers take the [`Message`] for one exchange and respond through it.
///
/// Wrapped in Arc for cheap cloning when spawning tasks.
pub type BoxedHandler = Arc<dyn Fn(Message) -> BoxFuture + Send + Sync>;

/// Wrap an async closure into a type-erased handler
///
/// This allows the registry to store handlers of different closure types in
/// the same row.
pub(crate) fn wrap_handler<F, Fut>(handler: F) -> BoxedHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    // ---
    Arc::new(move |message: Message| Box::pin(handler(message)) as BoxFuture)
}

/// Registration of one method.
///
/// # Example
///
/// ```no_run
/// # use bus_service::MethodSpec;
/// # use serde_json::json;
/// let spec = MethodSpec::new("config/setGreeting")
///     .description(json!({"description": "sets the greeting"}))
///     .on_request(|message| async move {
///         message.respond(json!({"greeting": message.payload["greeting"]})).await?;
///         Ok(())
///     });
/// ```
pub struct MethodSpec {
    // ---
    pub(crate) path: String,
    pub(crate) request: Option<BoxedHandler>,
    pub(crate) cancel: Option<BoxedHandler>,
    pub(crate) description: Option<Value>,
}

impl MethodSpec {
    /// Start a registration for the slash-delimited `path`.
    ///
    /// The last segment is the method name; the rest, `/` when empty, is
    /// the category.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            request: None,
            cancel: None,
            description: None,
        }
    }

    /// Handler invoked for each request, once its activity is attached.
    pub fn on_request<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.request = Some(wrap_handler(handler));
        self
    }

    /// Handler invoked when a subscriber cancels.
    ///
    /// Subscribing requests are refused for methods without one.
    pub fn on_cancel<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.cancel = Some(wrap_handler(handler));
        self
    }

    /// Metadata reported by the `info` method.
    pub fn description(mut self, description: Value) -> Self {
        self.description = Some(description);
        self
    }

    /// The registered path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for MethodSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodSpec")
            .field("path", &self.path)
            .field("request", &self.request.is_some())
            .field("cancel", &self.cancel.is_some())
            .field("description", &self.description)
            .finish()
    }
}
