use thiserror::Error;

/// Errors surfaced by the bus to the code awaiting a call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusError {
    /// The outbound half of the channel is gone.
    #[error("channel closed")]
    ChannelClosed,

    /// The remote side answered with an `error` frame.
    #[error("{0}")]
    Remote(String),

    /// Only possible when a call timeout was configured.
    #[error("call timed out after {0} ms")]
    Timeout(u64),

    /// The correlation table was dropped before an answer arrived.
    #[error("pending call dropped before completion")]
    Dropped,

    #[error("empty frame")]
    EmptyFrame,

    #[error("JSON error: {0}")]
    Json(String),

    #[error("invalid arguments for {group}: {reason}")]
    InvalidArgs { group: String, reason: String },

    #[error("route not found: {0}")]
    UnknownRoute(String),

    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),

    #[error("agent `{agent}` has no method `{method}`")]
    UnknownMethod { agent: String, method: String },
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> BusError {
        BusError::Json(err.to_string())
    }
}
