//! The key-value state machine driven by the replicated log.

pub mod command;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

pub use command::{KvCommand, KvOp};
pub use store::{ClientSession, KvStore, MAX_VALUE_LEN};

/// Client identity plus a request counter, so retries reuse the same
/// idempotency key and new requests always get a fresh one.
#[derive(Debug)]
pub struct ClientHandle {
    client_id: String,
    next_request: AtomicU64,
}

impl ClientHandle {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Request ids start at 1; 0 is reserved for untracked writes.
    pub fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ClientHandle {
    fn default() -> Self {
        Self::new()
    }
}
