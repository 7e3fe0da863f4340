use crate::cursor::StateError;

/// Core error type for the relay.
///
/// Adapter crates map their transport errors into [`Error::Channel`] so the
/// processing cycle can treat every failure uniformly (per-item vs fatal).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("contract violation: {0}")]
    Contract(String),

    #[error("cursor state error: {0}")]
    State(#[from] StateError),

    /// A remote operation failed after the client's retry budget.
    ///
    /// `detail` is the structured provider error rendered as JSON.
    #[error("{operation} failed: {detail}")]
    Channel {
        operation: String,
        transient: bool,
        detail: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether retrying the failed operation later has a reasonable chance to succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Channel { transient, .. } => *transient,
            Self::Io(_) | Self::External(_) => true,
            Self::State(e) => e.kind.is_io(),
            Self::Config(_) | Self::Contract(_) | Self::Json(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
