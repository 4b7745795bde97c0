use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// The command is well-formed but not allowed. Reported to the caller,
    /// the entry still counts as applied.
    #[error("{0}")]
    Validation(String),

    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error("Snapshot data is corrupt: {0}")]
    Corrupt(String),
}

/// The application the replicated log drives.
///
/// Entries are handed to [`apply`](StateMachine::apply) strictly in log order,
/// each exactly once per node. The consensus core never looks inside the
/// command bytes.
pub trait StateMachine: Send + Sync {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>, ApplyError>;

    /// Serialize the full state for a snapshot.
    fn snapshot(&self) -> Result<Vec<u8>, ApplyError>;

    /// Replace the full state with a snapshot blob.
    fn restore(&mut self, data: &[u8]) -> Result<(), ApplyError>;

    /// Read a single key from the local state.
    fn get(&self, key: &str) -> Option<Vec<u8>>;
}
