//! The dialog/UA layer: the call state machine, digest-auth retry on the
//! dialog's own requests, the keep-alive controller and session cleanup.
//! Built on top of `sip-transaction`'s client/server transaction state
//! machines and `sip-auth`'s digest helper; knows nothing about wire
//! parsing beyond the typed header access `sip-message` exposes.

mod config;
mod error;
mod keepalive;
mod send;
mod state;
mod ua;

pub use config::Config;
pub use error::{Error, Result};
pub use keepalive::KeepaliveController;
pub use state::UaStateKind;
pub use ua::{Callbacks, Ua};
