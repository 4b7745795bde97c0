use thiserror::Error;

use crate::raft::NodeId;

/// Failures of the durable storage layer (WAL and snapshot file).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Checksum mismatch in {0}")]
    Corrupt(&'static str),

    #[error("Storage is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader, current leader is node {0:?}")]
    NotLeader(Option<NodeId>),

    #[error("Timed out waiting for the entry to commit")]
    CommitTimeout,

    #[error("Read index timed out, leadership may have been lost")]
    ReadTimeout,

    #[error("Leadership lost before the entry committed")]
    LeadershipLost,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Node stopped")]
    Stopped,

    #[error("A membership change is already in progress")]
    ConfigChangeInProgress,

    #[error("Node {0} is already a member")]
    AlreadyMember(NodeId),

    #[error("Node {0} is not a member")]
    UnknownMember(NodeId),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("State machine error: {0}")]
    StateMachine(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<bincode::Error> for RaftError {
    fn from(err: bincode::Error) -> Self {
        RaftError::Storage(StorageError::Codec(err))
    }
}

impl From<crate::state_machine::ApplyError> for RaftError {
    fn from(err: crate::state_machine::ApplyError) -> Self {
        match err {
            crate::state_machine::ApplyError::Validation(msg) => RaftError::Validation(msg),
            other => RaftError::StateMachine(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
