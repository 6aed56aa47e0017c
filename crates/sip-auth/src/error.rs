use thiserror::Error;

/// Errors raised while answering a digest challenge.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported digest algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("unsupported qop option {0:?}")]
    UnsupportedQop(String),
}
