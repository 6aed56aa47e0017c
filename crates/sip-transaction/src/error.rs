use thiserror::Error;

/// Errors surfaced by the transaction layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport sink rejected a send. The owning transaction terminates
    /// and reports a timeout-equivalent failure to its creator.
    #[error("transport rejected send: {0}")]
    Transport(#[source] std::io::Error),

    /// Timer B/F/H expired without a matching response/ACK.
    #[error("transaction timed out waiting for a response")]
    RequestTimedOut,

    #[error(transparent)]
    Message(#[from] sip_message::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
