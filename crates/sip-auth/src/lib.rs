//! Digest authentication helper.
//!
//! Builds `Authorization`/`Proxy-Authorization` header values from a
//! `WWW-Authenticate`/`Proxy-Authenticate` challenge and a set of
//! credentials. Deliberately does not track "have we already tried this
//! challenge" state itself — that bookkeeping belongs to whichever caller
//! re-emits the request (the UA's request builder or the keep-alive
//! controller's retry flag).

mod digest;
mod error;

pub use digest::{respond_to_challenge, Credentials};
pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
