use thiserror::Error;

/// Errors that can occur while serving or calling bus methods
#[derive(Error, Debug)]
pub enum Error {
    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A response was not a JSON object
    #[error("response must be an object")]
    InvalidResponse,

    /// Caller supplied an argument the operation cannot use
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The activity authority answered with `returnValue: false`
    #[error("activity authority error {error_code}: {error_text}")]
    Authority {
        /// `errorCode` from the authority reply (-1 when absent)
        error_code: i64,
        /// `errorText` from the authority reply
        error_text: String,
    },

    /// The underlying bus connection failed or refused an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// No service is registered under the requested bus name
    #[error("service does not exist: {0}")]
    ServiceNotFound(String),

    /// The target service has no such method on the caller's bus
    #[error("unknown method {method} for category {category}")]
    MethodNotFound {
        /// Category of the missing method
        category: String,
        /// Name of the missing method
        method: String,
    },

    /// A reply or event channel closed before delivering anything
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

impl Error {
    /// Build an [`Error::Authority`] from a reply payload.
    pub(crate) fn authority(payload: &serde_json::Value) -> Self {
        // ---
        let error_code = payload
            .get("errorCode")
            .and_then(|v| v.as_i64())
            .unwrap_or(-1);
        let error_text = payload
            .get("errorText")
            .and_then(|v| v.as_str())
            .unwrap_or("no error message provided")
            .to_string();
        Error::Authority {
            error_code,
            error_text,
        }
    }

    /// Error code used when this error is turned into a bus response.
    pub fn error_code(&self) -> i64 {
        match self {
            Error::Authority { error_code, .. } => *error_code,
            _ => -1,
        }
    }
}

/// Result type alias for bus service operations
pub type Result<T> = std::result::Result<T, Error>;
