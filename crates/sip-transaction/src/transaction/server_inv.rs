//! Server INVITE transaction, RFC 3261 §17.2.1.

use super::{T1, T2, T4};
use crate::key::TsxKey;
use crate::send::fire_and_forget;
use crate::timer::{Scheduler, SessionLock, TimerHandle};
use crate::transport::{Destination, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use sip_message::{Message, Request, Response};
use std::sync::Arc;
use std::time::Duration;

/// Back-handle through which a stalled ACK wait (timer H) is reported.
pub trait ServerInvTsxHandler: Send + Sync {
    /// Timer H fired in Completed without an ACK: surfaced to the UA as a
    /// protocol failure.
    fn on_ack_timeout(&self);
    /// A CANCEL matched this transaction while it was still Proceeding, per
    /// RFC 3261 §9.2. Default no-op: the brief placeholder handler the TM
    /// wires in before the application attaches a real one has nothing to
    /// react with.
    fn on_cancel(&self) {}
}

/// Auto-`100 Trying` delay if the UA has not produced its own provisional.
const AUTO_TRYING_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

struct Inner {
    state: State,
    last_response: Option<Response>,
    retransmit_interval: Duration,
    auto_trying_sent: bool,
    timer_auto_trying: Option<TimerHandle>,
    timer_g: Option<TimerHandle>,
    timer_h: Option<TimerHandle>,
    timer_i: Option<TimerHandle>,
}

/// Owns the inbound INVITE's response lifecycle: auto-`100 Trying`,
/// provisional replay, final-response retransmission until ACK, and the
/// absorption period afterward.
pub struct ServerInvTsx {
    key: TsxKey,
    destination: Destination,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<SessionLock>,
    handler: Mutex<Arc<dyn ServerInvTsxHandler>>,
    inner: Mutex<Inner>,
}

impl ServerInvTsx {
    pub fn new(
        key: TsxKey,
        destination: Destination,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<SessionLock>,
        handler: Arc<dyn ServerInvTsxHandler>,
    ) -> Arc<Self> {
        let tsx = Arc::new(ServerInvTsx {
            key,
            destination,
            transport,
            scheduler,
            lock,
            handler: Mutex::new(handler),
            inner: Mutex::new(Inner {
                state: State::Proceeding,
                last_response: None,
                retransmit_interval: T1,
                auto_trying_sent: false,
                timer_auto_trying: None,
                timer_g: None,
                timer_h: None,
                timer_i: None,
            }),
        });

        tsx.arm_auto_trying();

        tsx
    }

    pub fn key(&self) -> &TsxKey {
        &self.key
    }

    /// Rebinds the handler notified on ACK-timeout. The TM spawns the
    /// transaction for a dialog-establishing INVITE before the application
    /// has built the UA around it, so it wires a no-op handler at
    /// construction; the UA replaces it with itself once it exists, same
    /// session lock already in force.
    pub fn set_handler(&self, handler: Arc<dyn ServerInvTsxHandler>) {
        *self.handler.lock() = handler;
    }

    fn arm_auto_trying(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self.scheduler.start_timeout(
            AUTO_TRYING_DELAY,
            self.lock.clone(),
            Box::new(move || tsx.on_auto_trying()),
        );
        self.inner.lock().timer_auto_trying = Some(handle);
    }

    fn on_auto_trying(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != State::Proceeding || inner.last_response.is_some() {
            return;
        }
        inner.auto_trying_sent = true;
        drop(inner);

        self.send(Response {
            status: 100,
            reason: "Trying".to_owned(),
            headers: sip_message::Headers::new(),
            body: Bytes::new(),
        });
    }

    /// A retransmit of the original INVITE arrived: replay whatever was
    /// last sent.
    pub fn on_request_retransmit(self: &Arc<Self>) {
        let inner = self.inner.lock();
        if let Some(response) = inner.last_response.clone() {
            drop(inner);
            self.send(response);
        }
    }

    /// The UA supplies a provisional (1xx) response.
    pub fn respond_provisional(self: &Arc<Self>, response: Response) {
        let mut inner = self.inner.lock();
        if inner.state != State::Proceeding {
            return;
        }
        inner.last_response = Some(response.clone());
        if let Some(t) = inner.timer_auto_trying.take() {
            t.cancel();
        }
        drop(inner);
        self.send(response);
    }

    /// The UA supplies a final response (2xx terminates immediately and
    /// relies on the UA ACKing end-to-end; non-2xx arms G/H).
    pub fn respond_final(self: &Arc<Self>, response: Response) {
        let mut inner = self.inner.lock();
        if inner.state != State::Proceeding {
            return;
        }
        if let Some(t) = inner.timer_auto_trying.take() {
            t.cancel();
        }

        inner.last_response = Some(response.clone());

        if response.is_success() {
            inner.state = State::Terminated;
            drop(inner);
            self.send(response);
            return;
        }

        inner.state = State::Completed;
        drop(inner);
        self.send(response);
        self.arm_timer_g();
        self.arm_timer_h();
    }

    fn arm_timer_g(self: &Arc<Self>) {
        let tsx = self.clone();
        let interval = self.inner.lock().retransmit_interval;
        let handle = self
            .scheduler
            .start_timeout(interval, self.lock.clone(), Box::new(move || tsx.on_timer_g()));
        self.inner.lock().timer_g = Some(handle);
    }

    fn on_timer_g(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != State::Completed {
            return;
        }
        inner.retransmit_interval = (inner.retransmit_interval * 2).min(T2);
        let response = inner.last_response.clone();
        drop(inner);

        if let Some(response) = response {
            self.send(response);
        }
        self.arm_timer_g();
    }

    fn arm_timer_h(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(T1 * 64, self.lock.clone(), Box::new(move || tsx.on_timer_h()));
        self.inner.lock().timer_h = Some(handle);
    }

    fn on_timer_h(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != State::Completed {
            return;
        }
        inner.state = State::Terminated;
        drop(inner);

        self.handler.lock().clone().on_ack_timeout();
    }

    fn arm_timer_i(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(T4, self.lock.clone(), Box::new(move || tsx.on_timer_i()));
        self.inner.lock().timer_i = Some(handle);
    }

    fn on_timer_i(self: &Arc<Self>) {
        self.inner.lock().state = State::Terminated;
    }

    /// An ACK for the final non-2xx response arrived: cancel G/H, arm I.
    pub fn on_ack(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state != State::Completed {
            return;
        }
        inner.state = State::Confirmed;
        if let Some(t) = inner.timer_g.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_h.take() {
            t.cancel();
        }
        drop(inner);

        self.arm_timer_i();
    }

    fn send(self: &Arc<Self>, response: Response) {
        fire_and_forget(
            self.transport.clone(),
            self.scheduler.clone(),
            self.lock.clone(),
            Message::Response(response),
            self.destination.clone(),
            || {},
        );
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().state == State::Terminated
    }

    /// An inbound CANCEL matched this transaction (RFC 3261 §9.2): answers
    /// it with 200 and, if no final response had been sent yet, notifies
    /// the handler to terminate the INVITE with a 487. A CANCEL arriving
    /// after Completed/Confirmed/Terminated has no further effect beyond
    /// the 200 — the UAS had already made its decision.
    pub fn on_cancel(self: &Arc<Self>, cancel_request: &Request) {
        let was_proceeding = self.inner.lock().state == State::Proceeding;
        self.send(cancel_response(cancel_request));
        if was_proceeding {
            self.handler.lock().clone().on_cancel();
        }
    }

    /// Cancels any armed timers and forces Terminated, for UA teardown
    /// paths (`Ua::cleanup`) that need to drop a transaction still holding
    /// G/H/I regardless of where it is in its own lifecycle.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock();
        if let Some(t) = inner.timer_auto_trying.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_g.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_h.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_i.take() {
            t.cancel();
        }
        inner.state = State::Terminated;
    }
}

/// Builds the 200 response to a CANCEL itself (distinct from the 487 the
/// original INVITE gets), echoing the CANCEL's own Via/From/To/Call-ID/CSeq.
fn cancel_response(cancel_request: &Request) -> Response {
    use sip_message::header::Name;

    let mut headers = sip_message::Headers::new();
    for (name, value) in cancel_request.headers.iter() {
        if matches!(name, Name::Via | Name::From | Name::To | Name::CallId | Name::CSeq) {
            headers.push(name.clone(), value);
        }
    }

    Response {
        status: 200,
        reason: "OK".to_owned(),
        headers,
        body: Bytes::new(),
    }
}
