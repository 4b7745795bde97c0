use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::kv::command::{KvCommand, KvOp};
use crate::state_machine::{ApplyError, StateMachine};

/// Largest value a single `Set` may carry.
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

/// Per-client de-duplication record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSession {
    pub last_request_id: u64,
    /// Outcome of `last_request_id`, replayed for retries. Errors are kept
    /// as their message so a retried invalid request fails the same way.
    pub cached_result: Result<Vec<u8>, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KvSnapshot {
    data: BTreeMap<String, Vec<u8>>,
    sessions: HashMap<String, ClientSession>,
}

/// In-memory key-value state machine.
///
/// `Set` returns an empty result; `Delete` returns a single byte, 1 if the
/// key existed. Commands with an empty client id or request id 0 bypass
/// de-duplication.
#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, Vec<u8>>,
    sessions: HashMap<String, ClientSession>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn session(&self, client_id: &str) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    fn validate(op: &KvOp) -> Result<(), ApplyError> {
        match op {
            KvOp::Set { key, .. } | KvOp::Delete { key } if key.is_empty() => {
                Err(ApplyError::Validation("key must not be empty".to_string()))
            }
            KvOp::Set { value, .. } if value.len() > MAX_VALUE_LEN => {
                Err(ApplyError::Validation(format!(
                    "value of {} bytes exceeds the {MAX_VALUE_LEN} byte limit",
                    value.len()
                )))
            }
            _ => Ok(()),
        }
    }

    fn execute(&mut self, op: KvOp) -> Result<Vec<u8>, ApplyError> {
        Self::validate(&op)?;
        match op {
            KvOp::Set { key, value } => {
                self.data.insert(key, value);
                Ok(Vec::new())
            }
            KvOp::Delete { key } => {
                let existed = self.data.remove(&key).is_some();
                Ok(vec![existed as u8])
            }
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>, ApplyError> {
        let cmd = KvCommand::decode(command).map_err(|e| ApplyError::Malformed(e.to_string()))?;
        let tracked = !cmd.client_id.is_empty() && cmd.request_id > 0;

        if tracked {
            if let Some(session) = self.sessions.get(&cmd.client_id) {
                if cmd.request_id <= session.last_request_id {
                    tracing::debug!(
                        client_id = %cmd.client_id,
                        request_id = cmd.request_id,
                        "Duplicate request, replaying cached result"
                    );
                    return session
                        .cached_result
                        .clone()
                        .map_err(ApplyError::Validation);
                }
            }
        }

        let result = self.execute(cmd.op);

        if tracked {
            let cached_result = match &result {
                Ok(bytes) => Ok(bytes.clone()),
                Err(e) => Err(e.to_string()),
            };
            self.sessions.insert(
                cmd.client_id,
                ClientSession {
                    last_request_id: cmd.request_id,
                    cached_result,
                },
            );
        }
        result
    }

    fn snapshot(&self) -> Result<Vec<u8>, ApplyError> {
        let image = KvSnapshot {
            data: self.data.clone(),
            sessions: self.sessions.clone(),
        };
        bincode::serialize(&image).map_err(|e| ApplyError::Corrupt(e.to_string()))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError> {
        let image: KvSnapshot =
            bincode::deserialize(data).map_err(|e| ApplyError::Corrupt(e.to_string()))?;
        self.data = image.data;
        self.sessions = image.sessions;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }
}
