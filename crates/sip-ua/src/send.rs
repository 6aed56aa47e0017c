//! End-to-end sends that fall outside any transaction: the ACK to a 2xx
//! response is never retransmitted and is not owned by the INVITE client
//! transaction, so it goes straight to the transport.

use sip_message::Message;
use sip_transaction::{Destination, Transport};
use std::sync::Arc;

pub(crate) fn fire_and_forget(transport: Arc<dyn Transport>, msg: Message, dest: Destination) {
    tokio::spawn(async move {
        if let Err(err) = transport.send(&msg, &dest).await {
            log::warn!("end-to-end send to {dest} failed: {err}");
        }
    });
}
