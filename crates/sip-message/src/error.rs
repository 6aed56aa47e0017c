use thiserror::Error;

/// Errors raised while parsing or validating a SIP message.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed {what}: {reason}")]
    Malformed {
        what: &'static str,
        reason: String,
    },

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
}
