//! The dialog/UA state machine.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::keepalive::KeepaliveController;
use crate::send::fire_and_forget;
use crate::state::UaStateKind;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_auth::{respond_to_challenge, Credentials};
use sip_message::header::{AddressHeader, HostPort, Name, Via};
use sip_message::{AuthChallenge, Headers, Message, Method, Request, Response, Uri};
use sip_transaction::{
    build_cancel, ClientInvTsx, ClientInvTsxHandler, ClientTsxHandler, Destination, DialogId,
    DialogRequestHandler, Role, ServerInvTsx, ServerInvTsxHandler, ServerTsxHandler, SessionLock,
    TransactionManager, TsxKey,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Application-supplied notification hooks, each invoked exactly once per
/// dialog except `on_ringing` which may fire zero, one or several times
/// (once per distinct provisional).
#[derive(Default)]
pub struct Callbacks {
    pub on_ringing: Option<Box<dyn FnMut(&Response) + Send>>,
    pub on_connected: Option<Box<dyn FnOnce(Bytes) + Send>>,
    pub on_disconnected: Option<Box<dyn FnOnce(&str) + Send>>,
    pub on_dead: Option<Box<dyn FnOnce() + Send>>,
}

/// A single SIP dialog/call. Built either by
/// [`Ua::place_call`] (UAC) or [`Ua::new_uas`] (UAS, from a TM-surfaced
/// INVITE); from there both roles drive the same state machine.
pub struct Ua {
    tm: Arc<TransactionManager>,
    config: Config,
    lock: Arc<SessionLock>,
    self_weak: Mutex<Weak<Ua>>,

    call_id: String,
    local_tag: String,
    remote_tag: Mutex<Option<String>>,
    local_uri: Uri,
    remote_uri: Uri,
    remote_target: Mutex<Option<Uri>>,
    route_set: Mutex<Vec<AddressHeader>>,
    destination: Mutex<Destination>,
    via_transport: String,
    reliable: bool,

    local_cseq: AtomicU32,
    remote_cseq: Mutex<Option<u32>>,

    local_sdp: Mutex<Bytes>,
    remote_sdp: Mutex<Option<Bytes>>,

    credentials: Option<Credentials>,
    auth_tried: AtomicBool,
    ka_interval: Option<Duration>,

    state: Mutex<UaStateKind>,
    dialog_registered: AtomicBool,

    /// The INVITE this UA last sent (initial or auth-retried), kept around
    /// to build the end-to-end ACK once its 2xx arrives.
    sent_request: Mutex<Option<Request>>,
    /// For UAS: the headers of the request that created this dialog, used
    /// to build every response (`ring`/`accept`/`reject`) before any
    /// re-INVITE updates things.
    initial_request_headers: Headers,

    inv_tsx: Mutex<Option<Arc<ClientInvTsx>>>,
    server_inv_tsx: Mutex<Option<Arc<ServerInvTsx>>>,
    keepalive: Mutex<Option<Arc<KeepaliveController>>>,

    callbacks: Mutex<Callbacks>,
}

impl Ua {
    /// UAC role: place an outbound call, moving Idle -> Trying. Arms the
    /// client INVITE transaction immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn place_call(
        tm: Arc<TransactionManager>,
        config: Config,
        lock: Arc<SessionLock>,
        destination: Destination,
        local_uri: Uri,
        remote_uri: Uri,
        local_sdp: Bytes,
        credentials: Option<Credentials>,
        ka_interval: Option<Duration>,
        callbacks: Callbacks,
    ) -> Result<Arc<Ua>> {
        let reliable = destination.proto.reliable();

        let ua = Arc::new(Ua {
            tm: tm.clone(),
            config,
            lock: lock.clone(),
            self_weak: Mutex::new(Weak::new()),
            call_id: generate_id(),
            local_tag: generate_id(),
            remote_tag: Mutex::new(None),
            local_uri,
            remote_uri: remote_uri.clone(),
            remote_target: Mutex::new(Some(remote_uri)),
            route_set: Mutex::new(Vec::new()),
            destination: Mutex::new(destination.clone()),
            via_transport: "UDP".to_owned(),
            reliable,
            local_cseq: AtomicU32::new(0),
            remote_cseq: Mutex::new(None),
            local_sdp: Mutex::new(local_sdp),
            remote_sdp: Mutex::new(None),
            credentials,
            auth_tried: AtomicBool::new(false),
            ka_interval,
            state: Mutex::new(UaStateKind::Idle),
            dialog_registered: AtomicBool::new(false),
            sent_request: Mutex::new(None),
            initial_request_headers: Headers::new(),
            inv_tsx: Mutex::new(None),
            server_inv_tsx: Mutex::new(None),
            keepalive: Mutex::new(None),
            callbacks: Mutex::new(callbacks),
        });
        *ua.self_weak.lock() = Arc::downgrade(&ua);

        ua.transition_to(UaStateKind::Trying);

        let request = ua.gen_request(Method::Invite, ua.local_sdp(), None)?;
        *ua.sent_request.lock() = Some(request.clone());

        let tsx = tm.begin_client_invite_transaction(
            request,
            destination,
            ua.via_sent_by(),
            &ua.via_transport,
            ua.arc(),
            lock,
            reliable,
        );
        *ua.inv_tsx.lock() = Some(tsx);

        Ok(ua)
    }

    /// UAS role: build a UA around an INVITE the TM already spawned a
    /// [`ServerInvTsx`] for. The caller must pass the exact `lock` the TM
    /// minted for `tsx`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_uas(
        tm: Arc<TransactionManager>,
        config: Config,
        lock: Arc<SessionLock>,
        source: Destination,
        request: Request,
        tsx: Arc<ServerInvTsx>,
        local_sdp: Bytes,
        credentials: Option<Credentials>,
        ka_interval: Option<Duration>,
        callbacks: Callbacks,
    ) -> Result<Arc<Ua>> {
        let call_id = request
            .headers
            .call_id()?
            .ok_or_else(|| Error::ProtocolViolation("INVITE missing Call-ID".into()))?
            .0;
        let from = request
            .headers
            .from()?
            .ok_or_else(|| Error::ProtocolViolation("INVITE missing From".into()))?;
        let to = request
            .headers
            .to()?
            .ok_or_else(|| Error::ProtocolViolation("INVITE missing To".into()))?;
        let remote_cseq = request.headers.cseq()?.map(|c| c.number);
        let route_set = request.headers.record_route()?;
        let remote_target = request.headers.contact()?.map(|c| c.uri);

        let ua = Arc::new(Ua {
            tm: tm.clone(),
            config,
            lock,
            self_weak: Mutex::new(Weak::new()),
            call_id,
            local_tag: generate_id(),
            remote_tag: Mutex::new(from.tag().map(str::to_owned)),
            local_uri: to.uri,
            remote_uri: from.uri,
            remote_target: Mutex::new(remote_target),
            route_set: Mutex::new(route_set),
            destination: Mutex::new(source),
            via_transport: "UDP".to_owned(),
            reliable: false,
            local_cseq: AtomicU32::new(0),
            remote_cseq: Mutex::new(remote_cseq),
            local_sdp: Mutex::new(local_sdp),
            remote_sdp: Mutex::new(None),
            credentials,
            auth_tried: AtomicBool::new(false),
            ka_interval,
            state: Mutex::new(UaStateKind::Idle),
            dialog_registered: AtomicBool::new(false),
            sent_request: Mutex::new(None),
            initial_request_headers: request.headers,
            inv_tsx: Mutex::new(None),
            server_inv_tsx: Mutex::new(Some(tsx.clone())),
            keepalive: Mutex::new(None),
            callbacks: Mutex::new(callbacks),
        });
        *ua.self_weak.lock() = Arc::downgrade(&ua);

        tsx.set_handler(ua.arc() as Arc<dyn ServerInvTsxHandler>);
        ua.transition_to(UaStateKind::Trying);
        ua.ensure_dialog_registered();

        Ok(ua)
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn state(&self) -> UaStateKind {
        *self.state.lock()
    }

    pub fn local_sdp(&self) -> Bytes {
        self.local_sdp.lock().clone()
    }

    pub fn remote_sdp(&self) -> Option<Bytes> {
        self.remote_sdp.lock().clone()
    }

    /// UAS: answer an in-progress INVITE with a provisional, moving
    /// Trying -> Ringing.
    pub fn ring(&self, reason: &str) {
        if self.state() != UaStateKind::Trying {
            return;
        }
        if let Some(tsx) = self.server_inv_tsx.lock().clone() {
            let mut response = self.build_response(&self.initial_request_headers, 180, reason, Bytes::new());
            response.headers.push(Name::Contact, self.local_contact().to_string());
            tsx.respond_provisional(response);
        }
        self.transition_to(UaStateKind::Ringing);
    }

    /// UAS: accept the call, moving into Connected.
    pub fn accept(&self, local_sdp: Bytes) {
        if !matches!(self.state(), UaStateKind::Trying | UaStateKind::Ringing) {
            return;
        }
        *self.local_sdp.lock() = local_sdp.clone();

        if let Some(tsx) = self.server_inv_tsx.lock().take() {
            let mut response = self.build_response(&self.initial_request_headers, 200, "OK", local_sdp);
            response.headers.push(Name::Contact, self.local_contact().to_string());
            tsx.respond_final(response);
            self.tm.remove(tsx.key());
        }

        self.transition_to(UaStateKind::Connected);

        if let Some(interval) = self.ka_interval {
            self.start_keepalive(interval);
        }
    }

    /// UAS: reject the call, moving into Disconnected.
    pub fn reject(&self, status: u16, reason: &str) {
        if !matches!(self.state(), UaStateKind::Trying | UaStateKind::Ringing) {
            return;
        }
        if let Some(tsx) = self.server_inv_tsx.lock().clone() {
            let response = self.build_response(&self.initial_request_headers, status, reason, Bytes::new());
            tsx.respond_final(response);
        }
        self.disconnect_and_die(reason);
    }

    /// UAC: cancel an in-progress outbound call while Trying/Ringing, per
    /// RFC 3261 §9.1. No-op once Connected or later — use a BYE to tear
    /// down an established dialog instead.
    pub fn cancel(&self, reason: &str) {
        if !matches!(self.state(), UaStateKind::Trying | UaStateKind::Ringing) {
            return;
        }
        self.disconnect_and_die(reason);
    }

    /// Builds an in-dialog request: current route set, remote target,
    /// incremented local CSeq, identity headers
    /// and, if `challenge` is supplied, a digest `Authorization` computed
    /// from it.
    pub fn gen_request(&self, method: Method, body: Bytes, challenge: Option<&AuthChallenge>) -> Result<Request> {
        let cseq = self.local_cseq.fetch_add(1, Ordering::SeqCst) + 1;
        let uri = self
            .remote_target
            .lock()
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone());

        let mut headers = Headers::new();

        let mut from = AddressHeader::new(self.local_uri.clone());
        from.set_tag(self.local_tag.clone());
        headers.push(Name::From, from.to_string());

        let mut to = AddressHeader::new(self.remote_uri.clone());
        if let Some(tag) = self.remote_tag.lock().clone() {
            to.set_tag(tag);
        }
        headers.push(Name::To, to.to_string());

        headers.push(Name::CallId, self.call_id.clone());
        headers.push(Name::CSeq, format!("{cseq} {method}"));
        headers.push(Name::MaxForwards, "70");
        headers.push(Name::Contact, self.local_contact().to_string());
        headers.push(Name::Other("User-Agent".to_owned()), self.config.my_uaname.clone());

        for route in self.route_set.lock().iter() {
            headers.push(Name::Route, route.to_string());
        }

        if let (Some(challenge), Some(credentials)) = (challenge, &self.credentials) {
            let auth = respond_to_challenge(challenge, credentials, &method, &uri.to_string(), &body)?;
            headers.push(Name::Authorization, auth.to_string());
        }

        Ok(Request { method, uri, headers, body })
    }

    /// Exposed to [`KeepaliveController`], which needs to re-send a probing
    /// re-INVITE through the same transaction manager, destination and
    /// session lock as every other request this UA sends.
    pub(crate) fn tm(&self) -> Arc<TransactionManager> {
        self.tm.clone()
    }

    pub(crate) fn lock_handle(&self) -> Arc<SessionLock> {
        self.lock.clone()
    }

    pub(crate) fn destination(&self) -> Destination {
        self.destination.lock().clone()
    }

    pub(crate) fn reliable(&self) -> bool {
        self.reliable
    }

    pub(crate) fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn local_contact(&self) -> Uri {
        Uri::sip(self.config.advertised_address().to_owned())
            .with_user(self.local_uri.user.clone().unwrap_or_default())
            .with_port(self.config.advertised_port())
    }

    pub(crate) fn via_sent_by(&self) -> HostPort {
        HostPort {
            host: self.config.advertised_address().to_owned(),
            port: Some(self.config.advertised_port()),
        }
    }

    pub(crate) fn via_transport(&self) -> &str {
        &self.via_transport
    }

    fn build_response(&self, request_headers: &Headers, status: u16, reason: &str, body: Bytes) -> Response {
        let mut headers = Headers::new();

        for (name, value) in request_headers.iter() {
            if *name == Name::Via {
                headers.push(name.clone(), value);
            }
        }

        if let Ok(Some(from)) = request_headers.from() {
            headers.push(Name::From, from.to_string());
        }

        let mut to = request_headers
            .to()
            .ok()
            .flatten()
            .unwrap_or_else(|| AddressHeader::new(self.local_uri.clone()));
        if to.tag().is_none() {
            to.set_tag(self.local_tag.clone());
        }
        headers.push(Name::To, to.to_string());

        if let Ok(Some(call_id)) = request_headers.call_id() {
            headers.push(Name::CallId, call_id.to_string());
        }

        if let Ok(Some(cseq)) = request_headers.cseq() {
            headers.push(Name::CSeq, cseq.to_string());
        }

        headers.push(Name::Other("Server".to_owned()), self.config.my_uaname.clone());

        Response {
            status,
            reason: reason.to_owned(),
            headers,
            body,
        }
    }

    fn note_remote_tag(&self, response: &Response) {
        if self.remote_tag.lock().is_some() {
            return;
        }
        if let Ok(Some(to)) = response.headers.to() {
            if let Some(tag) = to.tag() {
                *self.remote_tag.lock() = Some(tag.to_owned());
            }
        }
    }

    fn update_remote_target(&self, response: &Response) {
        if let Ok(Some(contact)) = response.headers.contact() {
            *self.remote_target.lock() = Some(contact.uri);
        }
    }

    /// Route set is fixed at dialog establishment: only the first
    /// Record-Route set seen is kept, reversed per the UAC convention.
    fn update_route_set(&self, response: &Response) {
        let mut route_set = self.route_set.lock();
        if !route_set.is_empty() {
            return;
        }
        if let Ok(mut rr) = response.headers.record_route() {
            rr.reverse();
            *route_set = rr;
        }
    }

    fn arc(&self) -> Arc<Ua> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("ua handlers only run while the Arc<Ua> that installed them is alive")
    }

    fn ensure_dialog_registered(&self) {
        if self.dialog_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.dialog_id() {
            Some(id) => {
                let handler: Arc<dyn DialogRequestHandler> = self.arc();
                self.tm.register_dialog(id, handler);
            }
            None => self.dialog_registered.store(false, Ordering::SeqCst),
        }
    }

    fn dialog_id(&self) -> Option<DialogId> {
        let remote_tag = self.remote_tag.lock().clone()?;
        Some(DialogId {
            call_id: self.call_id.clone(),
            from_tag: remote_tag,
            to_tag: self.local_tag.clone(),
        })
    }

    pub(crate) fn send_ack_for_2xx(&self, request: &Request, response: &Response) {
        let mut headers = Headers::new();

        let via = Via::new(&self.via_transport, self.via_sent_by(), sip_transaction::generate_branch());
        headers.push(Name::Via, via.to_string());

        for (name, value) in request.headers.iter() {
            if matches!(name, Name::From | Name::CallId | Name::MaxForwards) {
                headers.push(name.clone(), value);
            }
        }

        if let Some(to) = response.headers.get(&Name::To) {
            headers.push(Name::To, to);
        }

        if let Ok(Some(cseq)) = request.headers.cseq() {
            headers.push(Name::CSeq, format!("{} {}", cseq.number, Method::Ack));
        }

        for route in self.route_set.lock().iter() {
            headers.push(Name::Route, route.to_string());
        }

        let ack = Request {
            method: Method::Ack,
            uri: request.uri.clone(),
            headers,
            body: Bytes::new(),
        };

        fire_and_forget(self.tm.transport(), Message::Request(ack), self.destination.lock().clone());
    }

    fn retry_invite_with_auth(&self, challenge: AuthChallenge) -> Result<()> {
        let request = self.gen_request(Method::Invite, self.local_sdp(), Some(&challenge))?;
        *self.sent_request.lock() = Some(request.clone());

        let destination = self.destination.lock().clone();
        let tsx = self.tm.begin_client_invite_transaction(
            request,
            destination,
            self.via_sent_by(),
            &self.via_transport,
            self.arc(),
            self.lock.clone(),
            self.reliable,
        );
        if let Some(old) = self.inv_tsx.lock().take() {
            self.tm.remove(old.key());
        }
        *self.inv_tsx.lock() = Some(tsx);
        Ok(())
    }

    /// Sends a CANCEL for `tsx`'s original INVITE as a separate non-INVITE
    /// client transaction, per RFC 3261 §9.1.
    fn send_cancel(&self, tsx: &Arc<ClientInvTsx>) {
        let cancel = build_cancel(tsx.request());
        self.tm.begin_client_transaction(
            cancel,
            self.destination.lock().clone(),
            self.via_sent_by(),
            &self.via_transport,
            Arc::new(NoopCancelHandler),
            self.lock.clone(),
            self.reliable,
        );
    }

    fn start_keepalive(&self, interval: Duration) {
        let controller = KeepaliveController::new(Arc::downgrade(&self.arc()), self.tm.clone(), self.lock.clone(), interval);
        controller.start();
        *self.keepalive.lock() = Some(controller);
    }

    /// Enters Disconnected then immediately Dead: the disconnected
    /// callback fires as Disconnected's activation, then Dead's activation
    /// runs the dead callback before cleanup.
    fn disconnect_and_die(&self, reason: &str) {
        if self.state() == UaStateKind::Dead {
            return;
        }
        self.transition_to(UaStateKind::Disconnected);
        if let Some(cb) = self.callbacks.lock().on_disconnected.take() {
            cb(reason);
        }
        self.transition_to(UaStateKind::Dead);
    }

    /// Public for [`KeepaliveController`], which reports peer-unreachable
    /// keep-alive failures the same way any other disconnect reason is
    /// reported.
    pub(crate) fn disconnect(&self, reason: &str) {
        self.disconnect_and_die(reason);
    }

    fn transition_to(&self, next: UaStateKind) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            log::warn!("ua {}: unusual state transition {state} -> {next}", self.call_id);
        }
        *state = next;
        drop(state);

        if next == UaStateKind::Dead {
            if let Some(cb) = self.callbacks.lock().on_dead.take() {
                cb();
            }
            self.cleanup();
        }
    }

    /// Cancels every timer and transaction this UA owns, unregisters its
    /// dialog, and releases the keep-alive controller.
    fn cleanup(&self) {
        if let Some(tsx) = self.inv_tsx.lock().take() {
            if tsx.cancel() {
                self.send_cancel(&tsx);
            }
            self.tm.remove(tsx.key());
        }
        if let Some(tsx) = self.server_inv_tsx.lock().take() {
            tsx.cancel();
            self.tm.remove(tsx.key());
        }
        if let Some(ka) = self.keepalive.lock().take() {
            ka.stop();
        }
        if self.dialog_registered.swap(false, Ordering::SeqCst) {
            if let Some(id) = self.dialog_id() {
                self.tm.unregister_dialog(&id);
            }
        }
    }

    fn handle_reinvite(&self, request: Request, source: Destination) {
        if self.state() != UaStateKind::Connected {
            log::warn!("ua {}: re-INVITE while not Connected, ignoring", self.call_id);
            return;
        }
        let Ok(Some(via)) = request.headers.via() else {
            return;
        };
        let Some(branch) = via.branch() else {
            return;
        };
        let key = TsxKey::from_wire(branch, &Method::Invite, Role::Server);

        let tsx = self
            .tm
            .new_server_inv_transaction(key.clone(), source, self.lock.clone(), self.arc() as Arc<dyn ServerInvTsxHandler>);

        // The 200 OK carries our current local SDP; the new remote SDP
        // only lands once the ACK (carrying the answer) arrives.
        let local_sdp = self.local_sdp();
        let response = self.build_response(&request.headers, 200, "OK", local_sdp);
        tsx.respond_final(response);
        self.tm.remove(&key);
    }

    fn handle_reinvite_ack(&self, request: &Request) {
        if !request.body.is_empty() {
            *self.remote_sdp.lock() = Some(request.body.clone());
        }
    }

    fn handle_bye(&self, request: Request, source: Destination) {
        let Ok(Some(via)) = request.headers.via() else {
            return;
        };
        let Some(branch) = via.branch() else {
            return;
        };
        let key = TsxKey::from_wire(branch, &Method::Bye, Role::Server);

        let handler: Arc<dyn ServerTsxHandler> = Arc::new(());
        let tsx = self.tm.new_server_transaction(key.clone(), source, self.lock.clone(), handler);
        let response = self.build_response(&request.headers, 200, "OK", Bytes::new());
        tsx.respond(response);
        self.tm.remove(&key);

        self.disconnect_and_die("bye");
    }
}

impl ClientInvTsxHandler for Ua {
    fn on_provisional(&self, response: Response) {
        self.note_remote_tag(&response);
        self.ensure_dialog_registered();
        self.transition_to(UaStateKind::Ringing);

        if let Some(cb) = self.callbacks.lock().on_ringing.as_mut() {
            cb(&response);
        }
    }

    fn on_success(&self, response: Response) {
        self.note_remote_tag(&response);
        self.ensure_dialog_registered();
        self.update_remote_target(&response);
        self.update_route_set(&response);
        *self.remote_sdp.lock() = Some(response.body.clone());

        if let Some(request) = self.sent_request.lock().clone() {
            self.send_ack_for_2xx(&request, &response);
        }

        self.transition_to(UaStateKind::Connected);

        if let Some(cb) = self.callbacks.lock().on_connected.take() {
            cb(response.body);
        }

        if let Some(interval) = self.ka_interval {
            self.start_keepalive(interval);
        }
    }

    fn on_failure(&self, response: Response) {
        if matches!(response.status, 401 | 407) && self.credentials.is_some() && !self.auth_tried.swap(true, Ordering::SeqCst) {
            let challenge = response
                .headers
                .www_authenticate()
                .ok()
                .flatten()
                .or_else(|| response.headers.proxy_authenticate().ok().flatten());

            match challenge {
                Some(challenge) => {
                    if let Err(err) = self.retry_invite_with_auth(challenge) {
                        log::warn!("ua {}: failed to build digest response: {err}", self.call_id);
                        self.disconnect_and_die("authentication failed");
                    }
                    return;
                }
                None => {
                    log::warn!("ua {}: {} with no challenge header", self.call_id, response.status);
                }
            }
        }

        if matches!(response.status, 401 | 407) {
            self.disconnect_and_die("authentication failed");
            return;
        }

        self.disconnect_and_die(&format!("{} {}", response.status, response.reason));
    }

    fn on_timeout(&self) {
        self.disconnect_and_die("timeout");
    }
}

impl ServerInvTsxHandler for Ua {
    fn on_ack_timeout(&self) {
        self.disconnect_and_die("ack timeout");
    }

    /// The peer CANCELed the initial INVITE before we sent a final
    /// response: answer it with 487 and tear down, per RFC 3261 §9.2 /
    /// spec §4.6's `Ringing -CANCEL-> Disconnected`.
    fn on_cancel(&self) {
        if !matches!(self.state(), UaStateKind::Trying | UaStateKind::Ringing) {
            return;
        }
        if let Some(tsx) = self.server_inv_tsx.lock().clone() {
            let response = self.build_response(&self.initial_request_headers, 487, "Request Terminated", Bytes::new());
            tsx.respond_final(response);
        }
        self.disconnect_and_die("cancelled");
    }
}

impl DialogRequestHandler for Ua {
    fn on_in_dialog_request(&self, request: Request, source: Destination) {
        match request.method {
            Method::Invite => self.handle_reinvite(request, source),
            Method::Ack => self.handle_reinvite_ack(&request),
            Method::Bye => self.handle_bye(request, source),
            ref other => log::debug!("ua {}: ignoring in-dialog {other}", self.call_id),
        }
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// The CANCEL's own non-INVITE transaction is fire-and-forget: the
/// outcome of the call is decided by the race on the original INVITE's
/// transaction (487 vs 2xx), not by this 200.
struct NoopCancelHandler;
impl ClientTsxHandler for NoopCancelHandler {
    fn on_provisional(&self, _response: Response) {}
    fn on_final(&self, _response: Response) {}
    fn on_timeout(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use sip_transaction::{Proto, TokioScheduler};
    use std::sync::atomic::AtomicBool;

    #[derive(Default, Clone)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<Message>>>,
    }

    #[async_trait]
    impl sip_transaction::Transport for RecordingTransport {
        async fn send(&self, msg: &Message, _dest: &Destination) -> std::io::Result<()> {
            self.sent.lock().push(msg.clone());
            Ok(())
        }
    }

    fn dest() -> Destination {
        Destination {
            host: "192.0.2.50".into(),
            port: 5060,
            proto: Proto::Udp,
        }
    }

    fn sent_branch(msg: &Message) -> String {
        match msg {
            Message::Request(r) => r.headers.via().unwrap().unwrap().branch().unwrap().to_owned(),
            Message::Response(_) => panic!("expected request"),
        }
    }

    fn sent_from_tag(msg: &Message) -> String {
        match msg {
            Message::Request(r) => r.headers.from().unwrap().unwrap().tag().unwrap().to_owned(),
            Message::Response(_) => panic!("expected request"),
        }
    }

    /// Builds a response as the peer would send it back for `branch`, with
    /// a `To` tag if the dialog is already established.
    fn response(branch: &str, status: u16, reason: &str, to_tag: Option<&str>, body: Bytes) -> Response {
        let mut headers = Headers::new();
        let via = Via::new("UDP", HostPort { host: "192.0.2.50".into(), port: Some(5060) }, branch.to_owned());
        headers.push(Name::Via, via.to_string());

        let mut to = AddressHeader::new(Uri::sip("example.com").with_user("bob"));
        if let Some(tag) = to_tag {
            to.set_tag(tag.to_owned());
        }
        headers.push(Name::To, to.to_string());
        headers.push(Name::CSeq, "1 INVITE");

        Response {
            status,
            reason: reason.to_owned(),
            headers,
            body,
        }
    }

    struct PlaceholderHandler;
    impl ServerInvTsxHandler for PlaceholderHandler {
        fn on_ack_timeout(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn s1_happy_path_rings_then_connects_with_remote_sdp() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let rang = Arc::new(AtomicBool::new(false));
        let connected_sdp = Arc::new(Mutex::new(None));
        let rang_cb = rang.clone();
        let connected_cb = connected_sdp.clone();

        let callbacks = Callbacks {
            on_ringing: Some(Box::new(move |_r: &Response| {
                rang_cb.store(true, Ordering::SeqCst);
            })),
            on_connected: Some(Box::new(move |sdp: Bytes| {
                *connected_cb.lock() = Some(sdp);
            })),
            on_disconnected: None,
            on_dead: None,
        };

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::from_static(b"v=0\r\n"),
            None,
            None,
            callbacks,
        )
        .unwrap();

        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 1);
        let branch = sent_branch(&transport.sent.lock()[0]);

        tm.incoming_message(
            Message::Response(response(&branch, 180, "Ringing", Some("totag"), Bytes::new())),
            dest(),
        )
        .unwrap();
        assert!(rang.load(Ordering::SeqCst));
        assert_eq!(ua.state(), UaStateKind::Ringing);

        let sdp = Bytes::from_static(b"v=0\r\na=rtpmap:0 PCMU/8000\r\n");
        tm.incoming_message(
            Message::Response(response(&branch, 200, "OK", Some("totag"), sdp.clone())),
            dest(),
        )
        .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(ua.state(), UaStateKind::Connected);
        assert_eq!(connected_sdp.lock().clone(), Some(sdp));
        assert_eq!(ua.remote_sdp(), Some(Bytes::from_static(b"v=0\r\na=rtpmap:0 PCMU/8000\r\n")));

        // original INVITE + end-to-end ACK
        assert_eq!(transport.sent.lock().len(), 2);
        assert!(matches!(
            transport.sent.lock()[1],
            Message::Request(ref r) if r.method == Method::Ack
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn s2_auth_challenge_retries_invite_with_digest_and_incremented_cseq() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::new(),
            Some(Credentials::new("u", "p")),
            None,
            Callbacks::default(),
        )
        .unwrap();

        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 1);
        let branch = sent_branch(&transport.sent.lock()[0]);

        let mut challenge = response(&branch, 401, "Unauthorized", None, Bytes::new());
        challenge
            .headers
            .push(Name::WwwAuthenticate, r#"Digest realm="x", nonce="n1""#);

        tm.incoming_message(Message::Response(challenge), dest()).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(transport.sent.lock().len(), 2);
        match &transport.sent.lock()[1] {
            Message::Request(r) => {
                assert_eq!(r.headers.cseq().unwrap().unwrap().number, 2);
                let auth = r.headers.authorization().unwrap().unwrap();
                assert_eq!(auth.username, "u");
                assert_eq!(auth.realm, "x");
                assert_eq!(auth.nonce, "n1");
            }
            Message::Response(_) => panic!("expected retried INVITE"),
        }
        assert_eq!(ua.state(), UaStateKind::Trying);
    }

    #[tokio::test(start_paused = true)]
    async fn s6_mid_dialog_reinvite_updates_remote_sdp_and_stays_connected() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::from_static(b"v=0\r\n"),
            None,
            None,
            Callbacks::default(),
        )
        .unwrap();

        tokio::task::yield_now().await;
        let our_tag = sent_from_tag(&transport.sent.lock()[0]);
        let branch = sent_branch(&transport.sent.lock()[0]);

        tm.incoming_message(
            Message::Response(response(&branch, 200, "OK", Some("totag"), Bytes::from_static(b"v=0\r\n"))),
            dest(),
        )
        .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(ua.state(), UaStateKind::Connected);

        let sent_before = transport.sent.lock().len();

        // Peer re-INVITEs with new SDP, on a fresh branch.
        let mut headers = Headers::new();
        let via = Via::new(
            "UDP",
            HostPort { host: "192.0.2.50".into(), port: Some(5060) },
            sip_transaction::generate_branch(),
        );
        headers.push(Name::Via, via.to_string());

        let mut from = AddressHeader::new(Uri::sip("example.com").with_user("bob"));
        from.set_tag("totag");
        headers.push(Name::From, from.to_string());

        let mut to = AddressHeader::new(Uri::sip("example.com").with_user("alice"));
        to.set_tag(our_tag.clone());
        headers.push(Name::To, to.to_string());

        headers.push(Name::CallId, ua.call_id().to_owned());
        headers.push(Name::CSeq, "2 INVITE");

        let new_remote_sdp = Bytes::from_static(b"v=0\r\na=rtpmap:8 PCMA/8000\r\n");
        let reinvite = Request {
            method: Method::Invite,
            uri: Uri::sip("example.com").with_user("alice"),
            headers,
            body: new_remote_sdp.clone(),
        };

        tm.incoming_message(Message::Request(reinvite.clone()), dest()).unwrap();
        tokio::task::yield_now().await;

        // A 200 OK was sent for the re-INVITE.
        assert_eq!(transport.sent.lock().len(), sent_before + 1);
        assert!(matches!(
            transport.sent.lock()[sent_before],
            Message::Response(ref r) if r.status == 200
        ));
        assert_eq!(ua.state(), UaStateKind::Connected);

        // The ACK (carrying the answer) lands straight on the dialog handler.
        let mut ack_headers = Headers::new();
        let mut ack_from = AddressHeader::new(Uri::sip("example.com").with_user("bob"));
        ack_from.set_tag("totag");
        ack_headers.push(Name::From, ack_from.to_string());
        let mut ack_to = AddressHeader::new(Uri::sip("example.com").with_user("alice"));
        ack_to.set_tag(our_tag);
        ack_headers.push(Name::To, ack_to.to_string());
        ack_headers.push(Name::CallId, ua.call_id().to_owned());
        ack_headers.push(Name::CSeq, "2 ACK");
        let ack_via = Via::new(
            "UDP",
            HostPort { host: "192.0.2.50".into(), port: Some(5060) },
            sip_transaction::generate_branch(),
        );
        ack_headers.push(Name::Via, ack_via.to_string());

        let ack = Request {
            method: Method::Ack,
            uri: Uri::sip("example.com").with_user("alice"),
            headers: ack_headers,
            body: new_remote_sdp.clone(),
        };
        tm.incoming_message(Message::Request(ack), dest()).unwrap();

        assert_eq!(ua.remote_sdp(), Some(new_remote_sdp));
        assert_eq!(ua.state(), UaStateKind::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_probe_fires_after_interval_and_success_reschedules() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::from_static(b"v=0\r\n"),
            None,
            Some(Duration::from_secs(30)),
            Callbacks::default(),
        )
        .unwrap();

        tokio::task::yield_now().await;
        let branch = sent_branch(&transport.sent.lock()[0]);
        tm.incoming_message(
            Message::Response(response(&branch, 200, "OK", Some("totag"), Bytes::from_static(b"v=0\r\n"))),
            dest(),
        )
        .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(ua.state(), UaStateKind::Connected);

        // original INVITE + ACK sent so far; nothing probed yet.
        assert_eq!(transport.sent.lock().len(), 2);

        tokio::time::advance(Duration::from_secs(30) + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        // a re-INVITE probe went out.
        assert_eq!(transport.sent.lock().len(), 3);
        let probe_branch = sent_branch(&transport.sent.lock()[2]);
        assert!(matches!(
            transport.sent.lock()[2],
            Message::Request(ref r) if r.method == Method::Invite
        ));

        tm.incoming_message(
            Message::Response(response(&probe_branch, 200, "OK", Some("totag"), Bytes::from_static(b"v=0\r\n"))),
            dest(),
        )
        .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(ua.state(), UaStateKind::Connected);

        tokio::time::advance(Duration::from_secs(30) + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        // the successful probe rearmed another one 30s later.
        assert_eq!(transport.sent.lock().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_unanswered_first_probe_disconnects_after_grace_period() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let disconnected = Arc::new(AtomicBool::new(false));
        let disconnected_cb = disconnected.clone();
        let callbacks = Callbacks {
            on_ringing: None,
            on_connected: None,
            on_disconnected: Some(Box::new(move |_reason: &str| {
                disconnected_cb.store(true, Ordering::SeqCst);
            })),
            on_dead: None,
        };

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::from_static(b"v=0\r\n"),
            None,
            Some(Duration::from_secs(30)),
            callbacks,
        )
        .unwrap();

        tokio::task::yield_now().await;
        let branch = sent_branch(&transport.sent.lock()[0]);
        tm.incoming_message(
            Message::Response(response(&branch, 200, "OK", Some("totag"), Bytes::from_static(b"v=0\r\n"))),
            dest(),
        )
        .unwrap();
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(30) + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 3);

        // The probe's own client INVITE transaction times out (timer B, 64*T1).
        tokio::time::advance(Duration::from_secs(33)).await;
        tokio::task::yield_now().await;

        // disabled after the first unanswered probe; UA stays Connected for
        // the 600s grace period rather than tearing down immediately.
        assert_eq!(ua.state(), UaStateKind::Connected);
        assert!(!disconnected.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(600) + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(ua.state(), UaStateKind::Dead);
        assert!(disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn s2_retry_then_teardown_leaves_no_orphaned_invite_transaction() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::new(),
            Some(Credentials::new("u", "p")),
            None,
            Callbacks::default(),
        )
        .unwrap();

        tokio::task::yield_now().await;
        let first_branch = sent_branch(&transport.sent.lock()[0]);

        let mut challenge = response(&first_branch, 401, "Unauthorized", None, Bytes::new());
        challenge
            .headers
            .push(Name::WwwAuthenticate, r#"Digest realm="x", nonce="n1""#);
        tm.incoming_message(Message::Response(challenge), dest()).unwrap();
        tokio::task::yield_now().await;

        // the original (pre-auth) client INVITE transaction must not be left
        // behind once the retry replaces it.
        assert_eq!(tm.transaction_count(), 1);

        let retried_branch = sent_branch(&transport.sent.lock()[1]);
        tm.incoming_message(
            Message::Response(response(&retried_branch, 486, "Busy Here", Some("totag"), Bytes::new())),
            dest(),
        )
        .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(ua.state(), UaStateKind::Dead);
        assert_eq!(tm.transaction_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_cancels_server_inv_transaction_timers_and_clears_table() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let branch = "z9hG4bKrejectcase";
        let mut headers = Headers::new();
        let via = Via::new("UDP", HostPort { host: "192.0.2.50".into(), port: Some(5060) }, branch.to_owned());
        headers.push(Name::Via, via.to_string());
        let mut from = AddressHeader::new(Uri::sip("example.com").with_user("bob"));
        from.set_tag("peertag");
        headers.push(Name::From, from.to_string());
        headers.push(Name::To, AddressHeader::new(Uri::sip("example.com").with_user("alice")).to_string());
        headers.push(Name::CallId, "reject-case@example.com");
        headers.push(Name::CSeq, "1 INVITE");
        let invite = Request {
            method: Method::Invite,
            uri: Uri::sip("example.com").with_user("alice"),
            headers,
            body: Bytes::new(),
        };

        let key = TsxKey::from_wire(branch, &Method::Invite, Role::Server);
        let tsx = tm.new_server_inv_transaction(key, dest(), lock.clone(), Arc::new(PlaceholderHandler));

        let ua = Ua::new_uas(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            invite,
            tsx,
            Bytes::new(),
            None,
            None,
            Callbacks::default(),
        )
        .unwrap();

        ua.reject(486, "Busy Here");
        tokio::task::yield_now().await;

        assert_eq!(ua.state(), UaStateKind::Dead);
        assert_eq!(tm.transaction_count(), 0);

        // timer G would retransmit the 486 at T1, and timer H would fire the
        // ack-timeout at 64*T1, if `reject` had leaked the ST instead of
        // cancelling it.
        let sent_before = transport.sent.lock().len();
        tokio::time::advance(Duration::from_secs(40)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), sent_before);
    }

    #[tokio::test(start_paused = true)]
    async fn uac_cancel_while_ringing_sends_cancel_and_tears_down() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let ua = Ua::place_call(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            Uri::sip("example.com").with_user("alice"),
            Uri::sip("example.com").with_user("bob"),
            Bytes::from_static(b"v=0\r\n"),
            None,
            None,
            Callbacks::default(),
        )
        .unwrap();

        tokio::task::yield_now().await;
        let branch = sent_branch(&transport.sent.lock()[0]);
        tm.incoming_message(
            Message::Response(response(&branch, 180, "Ringing", Some("totag"), Bytes::new())),
            dest(),
        )
        .unwrap();
        assert_eq!(ua.state(), UaStateKind::Ringing);

        ua.cancel("user hangup");
        tokio::task::yield_now().await;

        assert_eq!(ua.state(), UaStateKind::Dead);
        assert_eq!(tm.transaction_count(), 0);
        assert_eq!(transport.sent.lock().len(), 2);
        assert!(matches!(
            transport.sent.lock()[1],
            Message::Request(ref r) if r.method == Method::Cancel
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_cancel_while_ringing_sends_487_and_disconnects() {
        let transport = Arc::new(RecordingTransport::default());
        let tm = TransactionManager::new(transport.clone(), Arc::new(TokioScheduler));
        let lock = SessionLock::new();

        let branch = "z9hG4bKuasinvite";
        let mut headers = Headers::new();
        let via = Via::new("UDP", HostPort { host: "192.0.2.50".into(), port: Some(5060) }, branch.to_owned());
        headers.push(Name::Via, via.to_string());
        let mut from = AddressHeader::new(Uri::sip("example.com").with_user("bob"));
        from.set_tag("peertag");
        headers.push(Name::From, from.to_string());
        headers.push(Name::To, AddressHeader::new(Uri::sip("example.com").with_user("alice")).to_string());
        headers.push(Name::CallId, "uas-call@example.com");
        headers.push(Name::CSeq, "1 INVITE");
        let invite = Request {
            method: Method::Invite,
            uri: Uri::sip("example.com").with_user("alice"),
            headers,
            body: Bytes::new(),
        };

        let key = TsxKey::from_wire(branch, &Method::Invite, Role::Server);
        let tsx = tm.new_server_inv_transaction(key, dest(), lock.clone(), Arc::new(PlaceholderHandler));

        let ua = Ua::new_uas(
            tm.clone(),
            Config::default(),
            lock,
            dest(),
            invite,
            tsx,
            Bytes::new(),
            None,
            None,
            Callbacks::default(),
        )
        .unwrap();

        ua.ring("Ringing");
        tokio::task::yield_now().await;
        assert_eq!(ua.state(), UaStateKind::Ringing);

        let mut cancel_headers = Headers::new();
        let cancel_via = Via::new("UDP", HostPort { host: "192.0.2.50".into(), port: Some(5060) }, branch.to_owned());
        cancel_headers.push(Name::Via, cancel_via.to_string());
        cancel_headers.push(Name::CallId, "uas-call@example.com");
        cancel_headers.push(Name::CSeq, "1 CANCEL");
        let cancel = Request {
            method: Method::Cancel,
            uri: Uri::sip("example.com").with_user("alice"),
            headers: cancel_headers,
            body: Bytes::new(),
        };

        tm.incoming_message(Message::Request(cancel), dest()).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(ua.state(), UaStateKind::Dead);
        assert_eq!(tm.transaction_count(), 0);
        // 180 Ringing, 200 to the CANCEL itself, then 487 to the INVITE
        assert_eq!(transport.sent.lock().len(), 3);
        assert!(matches!(transport.sent.lock()[1], Message::Response(ref r) if r.status == 200));
        assert!(matches!(transport.sent.lock()[2], Message::Response(ref r) if r.status == 487));
    }
}
