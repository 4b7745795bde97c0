use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
}

/// A client write as it travels through the replicated log.
///
/// `{client_id, request_id}` is the idempotency key: a request id at or
/// below the last one applied for the client is answered from the session
/// cache instead of being applied again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub client_id: String,
    pub request_id: u64,
    pub op: KvOp,
}

impl KvCommand {
    pub fn set(
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
        client_id: impl Into<String>,
        request_id: u64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            request_id,
            op: KvOp::Set {
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn delete(key: impl Into<String>, client_id: impl Into<String>, request_id: u64) -> Self {
        Self {
            client_id: client_id.into(),
            request_id,
            op: KvOp::Delete { key: key.into() },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
