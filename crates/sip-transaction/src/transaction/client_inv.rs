//! Client INVITE transaction, RFC 3261 §17.1.1.

use super::T1;
use crate::key::TsxKey;
use crate::send::fire_and_forget;
use crate::timer::{Scheduler, SessionLock, TimerHandle};
use crate::transport::{Destination, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use sip_message::{Message, Request, Response};
use std::sync::Arc;
use std::time::Duration;

/// Back-handle through which the transaction reports responses and final
/// failure to its creator (the UA, or the keep-alive controller for a
/// probing re-INVITE).
pub trait ClientInvTsxHandler: Send + Sync {
    /// A 1xx arrived. May be called more than once.
    fn on_provisional(&self, response: Response);
    /// A 2xx arrived. The transaction is now Terminated; the handler (the
    /// UA) is responsible for sending the ACK end-to-end, outside this
    /// transaction.
    fn on_success(&self, response: Response);
    /// A 3xx-6xx arrived; the transaction ACKs it internally and reports
    /// the failure response upward.
    fn on_failure(&self, response: Response);
    /// Timer B fired, or the transport rejected a send: reported to the UA
    /// as a synthetic timeout.
    fn on_timeout(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Timer A is armed at most this many times: the retransmit schedule
/// (0, 0.5, 1.5, 3.5, 7.5, 15.5s) is five doublings of T1, after which
/// timer B (64·T1 = 32s) terminates the transaction without a further
/// retransmit at the theoretical 31.5s mark.
const MAX_TIMER_A_FIRES: u32 = 5;

struct Inner {
    state: State,
    retransmit_interval: Duration,
    retransmit_count: u32,
    timer_a: Option<TimerHandle>,
    timer_b: Option<TimerHandle>,
    timer_d: Option<TimerHandle>,
}

/// Owns the original INVITE and retransmits it until a response or
/// timeout.
pub struct ClientInvTsx {
    key: TsxKey,
    request: Request,
    destination: Destination,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<SessionLock>,
    handler: Arc<dyn ClientInvTsxHandler>,
    inner: Mutex<Inner>,
}

impl ClientInvTsx {
    /// Creates the transaction, sends the INVITE and arms timers A and B.
    /// Must be called with the owning UA's session lock already held.
    pub fn new(
        key: TsxKey,
        request: Request,
        destination: Destination,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<SessionLock>,
        handler: Arc<dyn ClientInvTsxHandler>,
        reliable: bool,
    ) -> Arc<Self> {
        let tsx = Arc::new(ClientInvTsx {
            key,
            request,
            destination,
            transport,
            scheduler,
            lock,
            handler,
            inner: Mutex::new(Inner {
                state: State::Calling,
                retransmit_interval: T1,
                retransmit_count: 0,
                timer_a: None,
                timer_b: None,
                timer_d: None,
            }),
        });

        tsx.send_request();

        if !reliable {
            tsx.arm_timer_a();
        }
        tsx.arm_timer_b();

        tsx
    }

    pub fn key(&self) -> &TsxKey {
        &self.key
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    fn send_request(self: &Arc<Self>) {
        let tsx = self.clone();
        fire_and_forget(
            self.transport.clone(),
            self.scheduler.clone(),
            self.lock.clone(),
            Message::Request(self.request.clone()),
            self.destination.clone(),
            move || tsx.handle_transport_error(),
        );
    }

    fn arm_timer_a(self: &Arc<Self>) {
        let tsx = self.clone();
        let interval = self.inner.lock().retransmit_interval;
        let handle = self
            .scheduler
            .start_timeout(interval, self.lock.clone(), Box::new(move || tsx.on_timer_a()));
        self.inner.lock().timer_a = Some(handle);
    }

    fn arm_timer_b(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(T1 * 64, self.lock.clone(), Box::new(move || tsx.on_timer_b()));
        self.inner.lock().timer_b = Some(handle);
    }

    fn arm_timer_d(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(Duration::from_secs(32), self.lock.clone(), Box::new(move || tsx.on_timer_d()));
        self.inner.lock().timer_d = Some(handle);
    }

    fn on_timer_a(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != State::Calling {
            return;
        }
        inner.retransmit_count += 1;
        let rearm = inner.retransmit_count < MAX_TIMER_A_FIRES;
        if rearm {
            inner.retransmit_interval *= 2;
        }
        drop(inner);

        self.send_request();

        if rearm {
            self.arm_timer_a();
        }
    }

    fn on_timer_b(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Completed | State::Terminated) {
            return;
        }
        inner.state = State::Terminated;
        drop(inner);

        self.handler.on_timeout();
    }

    fn on_timer_d(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.state = State::Terminated;
    }

    fn handle_transport_error(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return;
        }
        inner.state = State::Terminated;
        if let Some(t) = inner.timer_a.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_b.take() {
            t.cancel();
        }
        drop(inner);

        self.handler.on_timeout();
    }

    /// Deliver an inbound response matched to this transaction by the TM.
    pub fn on_response(self: &Arc<Self>, response: Response) {
        let mut inner = self.inner.lock();

        match inner.state {
            State::Terminated => return,
            State::Completed if response.is_provisional() || response.is_success() => return,
            _ => {}
        }

        if response.is_provisional() {
            if inner.state == State::Calling {
                if let Some(t) = inner.timer_a.take() {
                    t.cancel();
                }
            }
            inner.state = State::Proceeding;
            drop(inner);
            self.handler.on_provisional(response);
            return;
        }

        if response.is_success() {
            inner.state = State::Terminated;
            if let Some(t) = inner.timer_a.take() {
                t.cancel();
            }
            if let Some(t) = inner.timer_b.take() {
                t.cancel();
            }
            drop(inner);
            self.handler.on_success(response);
            return;
        }

        // 3xx-6xx: ACK within the transaction, arm timer D, report upward.
        if let Some(t) = inner.timer_a.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_b.take() {
            t.cancel();
        }
        inner.state = State::Completed;
        drop(inner);

        self.send_ack(&response);
        self.arm_timer_d();
        self.handler.on_failure(response);
    }

    /// A retransmit of the same final response while Completed: resend ACK.
    pub fn on_retransmit(self: &Arc<Self>, response: &Response) {
        let inner = self.inner.lock();
        if inner.state != State::Completed {
            return;
        }
        drop(inner);
        self.send_ack(response);
    }

    fn send_ack(self: &Arc<Self>, response: &Response) {
        let ack = build_ack(&self.request, response);
        let tsx = self.clone();
        fire_and_forget(
            self.transport.clone(),
            self.scheduler.clone(),
            self.lock.clone(),
            Message::Request(ack),
            self.destination.clone(),
            move || {
                let _ = &tsx;
            },
        );
    }

    /// Cancels this transaction. In Calling this becomes Terminated
    /// silently; in Proceeding the caller is expected to emit a CANCEL
    /// request as a separate non-INVITE client transaction keyed to the
    /// same branch — that request is built by the caller (UA) via
    /// [`build_cancel`] since it needs its own `Via`/`CSeq`.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Calling => {
                inner.state = State::Terminated;
                if let Some(t) = inner.timer_a.take() {
                    t.cancel();
                }
                if let Some(t) = inner.timer_b.take() {
                    t.cancel();
                }
                false
            }
            State::Proceeding => true,
            State::Completed | State::Terminated => false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().state == State::Terminated
    }
}

fn build_ack(request: &Request, response: &Response) -> Request {
    use sip_message::header::Name;

    let mut headers = sip_message::Headers::new();

    for (name, value) in request.headers.iter() {
        if matches!(name, Name::Via | Name::From | Name::CallId | Name::MaxForwards) {
            headers.push(name.clone(), value);
        }
    }

    if let Some(to) = response.headers.get(&Name::To) {
        headers.push(Name::To, to);
    }

    if let Ok(Some(cseq)) = request.headers.cseq() {
        headers.push(Name::CSeq, format!("{} {}", cseq.number, sip_message::Method::Ack));
    }

    Request {
        method: sip_message::Method::Ack,
        uri: request.uri.clone(),
        headers,
        body: Bytes::new(),
    }
}

/// Builds a CANCEL request for an in-progress INVITE, matching its branch,
/// Call-ID, From/To and CSeq number. The CANCEL itself is sent as a
/// distinct non-INVITE client transaction.
pub fn build_cancel(request: &Request) -> Request {
    use sip_message::header::Name;

    let mut headers = sip_message::Headers::new();

    for (name, value) in request.headers.iter() {
        if matches!(name, Name::Via | Name::From | Name::To | Name::CallId | Name::MaxForwards) {
            headers.push(name.clone(), value);
        }
    }

    if let Ok(Some(cseq)) = request.headers.cseq() {
        headers.push(Name::CSeq, format!("{} {}", cseq.number, sip_message::Method::Cancel));
    }

    Request {
        method: sip_message::Method::Cancel,
        uri: request.uri.clone(),
        headers,
        body: Bytes::new(),
    }
}
