use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Relay offline")]
    RelayOffline,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("No identity announced for {0}")]
    UnknownRecipient(String),

    #[error("Relay does not hold event {0}")]
    UnknownEvent(String),

    #[error("Cannot publish as {0}")]
    ForeignSender(String),

    #[error("Bad page token: {0}")]
    BadPageToken(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),
}

/// Everything that goes wrong on the relay side is a transport failure to the core.
impl From<Error> for walletchat::Error {
    fn from(err: Error) -> Self {
        walletchat::Error::TransportFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
