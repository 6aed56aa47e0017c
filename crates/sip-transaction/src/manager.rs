//! Transaction Manager: demultiplexes inbound messages to existing
//! transactions, matches in-dialog requests to registered UAs, and spawns
//! server transactions (+ surfaces new UAs) for INVITEs that start a new
//! dialog.

use crate::error::{Error, Result};
use crate::key::{Role, TsxKey};
use crate::timer::{Scheduler, SessionLock};
use crate::transaction::{
    ClientInvTsx, ClientInvTsxHandler, ClientTsx, ClientTsxHandler, ServerInvTsx,
    ServerInvTsxHandler, ServerTsx, ServerTsxHandler,
};
use crate::transport::{Destination, Transport};
use parking_lot::Mutex;
use sip_message::header::Name;
use sip_message::{Message, Method, Request};
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies a dialog for in-dialog request matching: Call-ID plus
/// From-tag plus To-tag. `from_tag` and `to_tag` are recorded as they
/// appear on the *wire* for requests sent to us, i.e. the peer's tag and
/// our own tag respectively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

/// Registered per dialog so the TM can route in-dialog requests (re-INVITE,
/// BYE, ...) straight to the owning UA instead of spawning a fresh one.
pub trait DialogRequestHandler: Send + Sync {
    fn on_in_dialog_request(&self, request: Request, source: Destination);
}

/// Invoked for an inbound INVITE that does not match any registered dialog:
/// the TM has already spawned the server transaction; the handler (the
/// application/UA layer) owns turning it into a UA.
///
/// `lock` is the session lock the TM minted for this transaction's timers;
/// the application MUST build the new UA around this same lock rather than
/// a fresh one, or the ST's auto-`100 Trying` timer and the UA's own
/// callbacks would run under different locks.
pub trait NewInviteHandler: Send + Sync {
    fn on_new_invite(
        &self,
        request: Request,
        source: Destination,
        tsx: Arc<ServerInvTsx>,
        lock: Arc<SessionLock>,
    );
}

enum Entry {
    ClientInv(Arc<ClientInvTsx>),
    Client(Arc<ClientTsx>),
    ServerInv(Arc<ServerInvTsx>),
    Server(Arc<ServerTsx>),
}

/// Owns the transaction table (a key maps to at most one transaction at
/// any time; on Terminated it is removed) and the dialog registry. The
/// table lock is always released before dispatching into a transaction or
/// UA: the TM mutex is never held while acquiring a UA's session lock.
pub struct TransactionManager {
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    table: Mutex<HashMap<TsxKey, Entry>>,
    dialogs: Mutex<HashMap<DialogId, Arc<dyn DialogRequestHandler>>>,
    new_invite_handler: Mutex<Option<Arc<dyn NewInviteHandler>>>,
}

impl TransactionManager {
    pub fn new(transport: Arc<dyn Transport>, scheduler: Arc<dyn Scheduler>) -> Arc<Self> {
        Arc::new(TransactionManager {
            transport,
            scheduler,
            table: Mutex::new(HashMap::new()),
            dialogs: Mutex::new(HashMap::new()),
            new_invite_handler: Mutex::new(None),
        })
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    /// Installs the handler invoked for dialog-establishing INVITEs. There
    /// is exactly one per TM instance (one application using this core).
    pub fn set_new_invite_handler(&self, handler: Arc<dyn NewInviteHandler>) {
        *self.new_invite_handler.lock() = Some(handler);
    }

    pub fn register_dialog(&self, id: DialogId, handler: Arc<dyn DialogRequestHandler>) {
        self.dialogs.lock().insert(id, handler);
    }

    pub fn unregister_dialog(&self, id: &DialogId) {
        self.dialogs.lock().remove(id);
    }

    /// Begins a client transaction for a non-INVITE request. Inserts a
    /// `Via` with a freshly generated branch and a default
    /// `Max-Forwards: 70` if absent, sends the request and registers the
    /// transaction under its key.
    pub fn begin_client_transaction(
        self: &Arc<Self>,
        mut request: Request,
        destination: Destination,
        via_sent_by: sip_message::header::HostPort,
        via_transport: &str,
        handler: Arc<dyn ClientTsxHandler>,
        lock: Arc<SessionLock>,
        reliable: bool,
    ) -> Arc<ClientTsx> {
        assert!(!matches!(request.method, Method::Invite | Method::Ack));

        let key = TsxKey::new_client(&request.method);
        prepare_outgoing(&mut request, &key, via_sent_by, via_transport);

        let tsx = ClientTsx::new(
            key.clone(),
            request,
            destination,
            self.transport.clone(),
            self.scheduler.clone(),
            lock,
            handler,
            reliable,
        );

        self.table.lock().insert(key, Entry::Client(tsx.clone()));
        tsx
    }

    /// Begins a client transaction for an INVITE.
    pub fn begin_client_invite_transaction(
        self: &Arc<Self>,
        mut request: Request,
        destination: Destination,
        via_sent_by: sip_message::header::HostPort,
        via_transport: &str,
        handler: Arc<dyn ClientInvTsxHandler>,
        lock: Arc<SessionLock>,
        reliable: bool,
    ) -> Arc<ClientInvTsx> {
        assert_eq!(request.method, Method::Invite);

        let key = TsxKey::new_client(&request.method);
        prepare_outgoing(&mut request, &key, via_sent_by, via_transport);

        let tsx = ClientInvTsx::new(
            key.clone(),
            request,
            destination,
            self.transport.clone(),
            self.scheduler.clone(),
            lock,
            handler,
            reliable,
        );

        self.table.lock().insert(key, Entry::ClientInv(tsx.clone()));
        tsx
    }

    pub fn remove(&self, key: &TsxKey) {
        self.table.lock().remove(key);
    }

    /// Number of transactions currently in the table. Exposed so dependent
    /// crates can assert the table-emptiness invariant (spec.md §8 property
    /// 6: "after Dead the TM table contains none of its transactions")
    /// without reaching into a private field.
    pub fn transaction_count(&self) -> usize {
        self.table.lock().len()
    }

    /// Spawns a server transaction for an in-dialog request the UA matched
    /// itself (re-INVITE, BYE, ...) via its [`DialogRequestHandler`], using
    /// the same branch the request arrived with so a retransmit of it is
    /// caught by the ordinary table lookup in [`Self::incoming_request`]
    /// before it ever reaches the dialog handler again. `lock` must be the
    /// owning UA's session lock.
    pub fn new_server_inv_transaction(
        &self,
        key: TsxKey,
        destination: Destination,
        lock: Arc<SessionLock>,
        handler: Arc<dyn ServerInvTsxHandler>,
    ) -> Arc<ServerInvTsx> {
        let tsx = ServerInvTsx::new(
            key.clone(),
            destination,
            self.transport.clone(),
            self.scheduler.clone(),
            lock,
            handler,
        );
        self.table.lock().insert(key, Entry::ServerInv(tsx.clone()));
        tsx
    }

    /// Non-INVITE counterpart of [`Self::new_server_inv_transaction`], used
    /// by the UA to answer in-dialog BYE/etc. requests.
    pub fn new_server_transaction(
        &self,
        key: TsxKey,
        destination: Destination,
        lock: Arc<SessionLock>,
        handler: Arc<dyn ServerTsxHandler>,
    ) -> Arc<ServerTsx> {
        let tsx = ServerTsx::new(
            key.clone(),
            destination,
            self.transport.clone(),
            self.scheduler.clone(),
            lock,
            handler,
        );
        self.table.lock().insert(key, Entry::Server(tsx.clone()));
        tsx
    }

    /// The sole entry point transports call once a full `Message` has been
    /// decoded off the wire.
    pub fn incoming_message(self: &Arc<Self>, msg: Message, source: Destination) -> Result<()> {
        match msg {
            Message::Response(response) => self.incoming_response(response),
            Message::Request(request) => self.incoming_request(request, source),
        }
    }

    fn incoming_response(self: &Arc<Self>, response: sip_message::Response) -> Result<()> {
        let via = response
            .headers
            .via()
            .map_err(Error::Message)?
            .ok_or(Error::Message(sip_message::Error::MissingHeader("Via")))?;
        let cseq = response
            .headers
            .cseq()
            .map_err(Error::Message)?
            .ok_or(Error::Message(sip_message::Error::MissingHeader("CSeq")))?;

        let Some(branch) = via.branch() else {
            log::warn!("dropping response with no Via branch (RFC2543 matching unsupported)");
            return Ok(());
        };

        let key = TsxKey::from_wire(branch, &cseq.method, Role::Client);

        let entry = {
            let table = self.table.lock();
            match table.get(&key) {
                Some(Entry::Client(tsx)) => Some(Entry::Client(tsx.clone())),
                Some(Entry::ClientInv(tsx)) => Some(Entry::ClientInv(tsx.clone())),
                _ => None,
            }
        };

        match entry {
            Some(Entry::Client(tsx)) => tsx.on_response(response),
            Some(Entry::ClientInv(tsx)) => tsx.on_response(response),
            _ => {
                log::debug!(
                    "dropping stray response, no matching client transaction for branch {branch}"
                );
            }
        }

        Ok(())
    }

    fn incoming_request(self: &Arc<Self>, request: Request, source: Destination) -> Result<()> {
        let via = request
            .headers
            .via()
            .map_err(Error::Message)?
            .ok_or(Error::Message(sip_message::Error::MissingHeader("Via")))?;

        let Some(branch) = via.branch() else {
            log::warn!("dropping request with no Via branch (RFC2543 matching unsupported)");
            return Ok(());
        };

        let key = TsxKey::from_wire(branch, &request.method, Role::Server);

        let entry = {
            let table = self.table.lock();
            match table.get(&key) {
                Some(Entry::Server(tsx)) => Some(Entry::Server(tsx.clone())),
                Some(Entry::ServerInv(tsx)) => Some(Entry::ServerInv(tsx.clone())),
                _ => None,
            }
        };

        // CANCEL keys its own method (it is not folded with INVITE/ACK, see
        // `TsxKey::fold_method`) but matches the server transaction of the
        // request it cancels, per RFC 3261 §9.2: fall back to the
        // INVITE-folded key when the direct lookup misses.
        let entry = entry.or_else(|| {
            if request.method != Method::Cancel {
                return None;
            }
            let invite_key = TsxKey::from_wire(branch, &Method::Invite, Role::Server);
            match self.table.lock().get(&invite_key) {
                Some(Entry::ServerInv(tsx)) => Some(Entry::ServerInv(tsx.clone())),
                _ => None,
            }
        });

        if let Some(entry) = entry {
            match (entry, &request.method) {
                (Entry::ServerInv(tsx), Method::Ack) => tsx.on_ack(),
                (Entry::ServerInv(tsx), Method::Invite) => tsx.on_request_retransmit(),
                (Entry::ServerInv(tsx), Method::Cancel) => tsx.on_cancel(&request),
                (Entry::Server(tsx), _) => tsx.on_request_retransmit(),
                _ => {}
            }
            return Ok(());
        }

        // No existing transaction: try an established dialog first.
        if let Some(dialog_id) = dialog_id_for(&request) {
            let handler = self.dialogs.lock().get(&dialog_id).cloned();
            if let Some(handler) = handler {
                handler.on_in_dialog_request(request, source);
                return Ok(());
            }
        }

        if request.method == Method::Invite {
            let lock = SessionLock::new();
            let st = ServerInvTsx::new(
                key.clone(),
                source.clone(),
                self.transport.clone(),
                self.scheduler.clone(),
                lock.clone(),
                Arc::new(NoopAckTimeoutHandler),
            );
            self.table.lock().insert(key, Entry::ServerInv(st.clone()));

            let handler = self.new_invite_handler.lock().clone();
            match handler {
                Some(handler) => handler.on_new_invite(request, source, st, lock),
                None => log::warn!("no new-invite handler installed, dropping INVITE"),
            }
        } else {
            log::debug!(
                "dropping {} with no matching dialog or transaction",
                request.method
            );
        }

        Ok(())
    }
}

/// Placeholder handler used for the brief window between a `ServerInvTsx`
/// being spawned by the TM and the application wiring a real UA-backed
/// handler onto it; real ACK-timeout reporting flows through the UA's own
/// handler once [`NewInviteHandler::on_new_invite`] attaches it.
struct NoopAckTimeoutHandler;
impl ServerInvTsxHandler for NoopAckTimeoutHandler {
    fn on_ack_timeout(&self) {}
}

fn dialog_id_for(request: &Request) -> Option<DialogId> {
    let call_id = request.headers.call_id().ok()??.0;
    let from = request.headers.from().ok()??;
    let to = request.headers.to().ok()??;

    Some(DialogId {
        call_id,
        from_tag: from.tag()?.to_owned(),
        to_tag: to.tag()?.to_owned(),
    })
}


fn prepare_outgoing(
    request: &mut Request,
    key: &TsxKey,
    via_sent_by: sip_message::header::HostPort,
    via_transport: &str,
) {
    use sip_message::header::Via;

    if request.headers.max_forwards().ok().flatten().is_none() {
        request.headers.push(Name::MaxForwards, "70");
    }

    let via = Via::new(via_transport, via_sent_by, key.branch().to_owned());
    let mut with_via = sip_message::Headers::new();
    with_via.push(Name::Via, via.to_string());
    for (name, value) in request.headers.iter() {
        with_via.push(name.clone(), value);
    }
    request.headers = with_via;
}
