//! Shared "send it and forget it" helper: no callback blocks on I/O, since
//! the transport sink is fire-and-forget.
//!
//! Every transaction state machine in this crate is fully synchronous so it
//! can be driven directly from a timer callback running under the session
//! lock. The actual network write still needs an executor, so it is
//! spawned as a detached
//! task; a failure is folded back into the owning transaction through the
//! scheduler (a zero-delay, lock-protected callback), so state mutation
//! from the async result still happens under the same lock as everything
//! else.

use crate::timer::{Scheduler, SessionLock};
use crate::transport::{Destination, Transport};
use sip_message::Message;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn fire_and_forget(
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<SessionLock>,
    msg: Message,
    dest: Destination,
    on_failure: impl FnOnce() + Send + 'static,
) {
    tokio::spawn(async move {
        if let Err(err) = transport.send(&msg, &dest).await {
            log::warn!("transport send to {dest} failed: {err}");
            scheduler.start_timeout(Duration::ZERO, lock, Box::new(on_failure));
        }
    });
}
