//! Error types for the Tether engine.

use serde_json::Value;
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    // Recoverable data errors
    /// A validation hook rejected a mutation. State is unchanged and an
    /// `"invalid"` event has already fired; the payload is whatever the
    /// hook returned.
    #[error("validation rejected: {0}")]
    Validation(Value),

    // Configuration faults (programmer error)
    #[error("cannot sort a set without a comparator")]
    MissingComparator,

    #[error("no url available: configure url_root or attach to a set with a url")]
    MissingUrl,

    // Transport boundary
    /// The transport collaborator reported a failure. An `"error"` event has
    /// already fired on the affected entity or set.
    #[error("transport failure: {0}")]
    Transport(Value),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
