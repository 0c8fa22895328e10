use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Command was dropped before it committed")]
    CommandDropped,

    #[error("Raft node is shut down")]
    Shutdown,

    #[error("Persistence error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RaftError>;
