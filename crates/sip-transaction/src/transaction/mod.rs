//! RFC 3261 §17 timers, shared across every transaction variant.

use std::time::Duration;

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);
pub const T4: Duration = Duration::from_secs(5);

pub mod client;
pub mod client_inv;
pub mod server;
pub mod server_inv;

pub use client::{ClientTsx, ClientTsxHandler};
pub use client_inv::{build_cancel, ClientInvTsx, ClientInvTsxHandler};
pub use server::{ServerTsx, ServerTsxHandler};
pub use server_inv::{ServerInvTsx, ServerInvTsxHandler};
