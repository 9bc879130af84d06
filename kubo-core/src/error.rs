//! Error taxonomy shared by every subsystem.

/// Errors surfaced by the session layer.
///
/// Precondition and not-found errors are raised before any foreign call is made.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation not allowed in the current session state (offline, feature disabled, closed).
    #[error("precondition failed: {0}")]
    Precondition(String),
    /// A local path required by the operation does not exist (or has the wrong kind).
    #[error("not found: {0}")]
    NotFound(String),
    /// The engine reported failure through its status/sentinel value.
    #[error("engine call {op} failed with status {code}")]
    Engine { op: &'static str, code: i64 },
    /// The engine returned no result where one was required.
    #[error("engine call {op} returned no data")]
    NoData { op: &'static str },
    /// Engine output could not be decoded. Only used internally; listings degrade to empty.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    /// Failure to encode an argument buffer or acquire/release a local resource.
    #[error("resource error: {0}")]
    Resource(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Error::Precondition(msg.into())
    }

    /// True for errors raised by local checks, before the engine was involved.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Error::Precondition(_))
    }
}
