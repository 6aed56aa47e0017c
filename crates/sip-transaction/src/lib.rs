//! RFC 3261 §17 transaction layer.
//!
//! Owns the Timer/Scheduler and Transport façades, the Transaction Manager
//! and the four client/server transaction state machines. This crate knows
//! nothing about dialogs or call state; it only matches, retransmits and
//! times out transactions, and hands responses/requests upward through the
//! handler traits each transaction type defines.

mod error;
mod key;
mod manager;
mod send;
mod timer;
mod transaction;
mod transport;

pub use error::{Error, Result};
pub use key::{generate_branch, Role, TsxKey};
pub use manager::{DialogId, DialogRequestHandler, NewInviteHandler, TransactionManager};
pub use timer::{Scheduler, SessionLock, TimerHandle, TokioScheduler};
pub use transaction::{
    build_cancel, ClientInvTsx, ClientInvTsxHandler, ClientTsx, ClientTsxHandler, ServerInvTsx,
    ServerInvTsxHandler, ServerTsx, ServerTsxHandler,
};
pub use transport::{Destination, Proto, Transport, Udp};
