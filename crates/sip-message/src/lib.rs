//! Minimal SIP message, header and URI types.
//!
//! Header lexing/printing is treated as an external collaborator by the
//! transaction and dialog layers built on top of this crate: it exposes just
//! enough of RFC 3261's grammar to round-trip the fields those layers
//! inspect (Via branch, CSeq, To/From tags, Contact, Route set, Max-Forwards,
//! digest auth headers), not a complete SIP parser.

mod error;
mod headers;
mod method;
mod msg;
mod uri;

pub mod header;

pub use error::Error;
pub use header::{AddressHeader, AuthChallenge, AuthResponse, CSeq, CallId, Name, Via};
pub use headers::Headers;
pub use method::Method;
pub use msg::{Message, Request, Response};
pub use uri::Uri;
