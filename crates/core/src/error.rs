use std::time::Duration;

/// Result alias that carries the custom [`LightsError`] type.
pub type Result<T> = std::result::Result<T, LightsError>;

/// Common error type for the core crate.
///
/// None of these are fatal to the engine. Each is recovered where it occurs
/// and surfaced through the log and the engine statistics.
#[derive(Debug, thiserror::Error)]
pub enum LightsError {
    /// The light id maps to a controller board that does not exist.
    #[error("light {light} does not map to a controller board")]
    InvalidLightAddress { light: usize },
    /// The transport refused or failed to deliver a packet.
    #[error("transport failure: {0}")]
    TransportFailure(String),
    /// A malformed or out-of-range configuration entry.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    /// The consumer did not acknowledge a stop request in time.
    #[error("consumer did not exit within {0:?}")]
    ShutdownTimeout(Duration),
    /// Free-form message for host-side failures.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl LightsError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::ConfigurationError(msg.into())
    }
}

impl From<&str> for LightsError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LightsError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
