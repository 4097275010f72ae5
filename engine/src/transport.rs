//! The capability boundary between the data layer and the outside world.
//!
//! The core never performs IO. Persistence operations build a [`Request`]
//! and hand it to a caller-supplied [`Transport`], which must resolve it
//! with exactly one of a server representation or an error payload. The
//! calling object wraps the outcome in its `"sync"`/`"error"` event surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The persistence verb for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Create,
    Read,
    Update,
    Patch,
    Delete,
}

/// One persistence request, fully described.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub url: String,
    /// The representation to send, absent for reads and deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A synchronous persistence backend.
///
/// `Ok` carries the parsed server representation, `Err` an opaque error
/// payload. Implementations decide what either means; the data layer only
/// routes them.
pub trait Transport {
    fn sync(&self, request: &Request) -> Result<Value, Value>;
}
