use thiserror::Error;

/// Errors raised by the UA/dialog layer.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Message(#[from] sip_message::Error),

    #[error(transparent)]
    Transaction(#[from] sip_transaction::Error),

    #[error(transparent)]
    Auth(#[from] sip_auth::Error),

    /// e.g. a 2xx delivered to a non-INVITE transaction in Completed, or a
    /// re-INVITE arriving while not Connected. Logged and ignored by the
    /// caller; never propagated as an exception across the library
    /// boundary.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
