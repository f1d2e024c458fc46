use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Signature rejected: {0}")]
    SignatureRejected(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Conversation is closed")]
    ConversationClosed,

    #[error("Message content is empty")]
    EmptyMessage,

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Message cannot be retried: {0}")]
    NotRetryable(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
