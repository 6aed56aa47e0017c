//! Client non-INVITE transaction, RFC 3261 §17.1.2.

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

/// Back-handle through which the transaction reports the final response or
/// timeout to its creator.
pub trait ClientTsxHandler: Send + Sync {
    /// A 1xx arrived. May be called more than once.
    fn on_provisional(&self, response: Response);
    /// A final (2xx-6xx) response arrived; the transaction is now Completed.
    fn on_final(&self, response: Response);
    /// Timer F fired, or the transport rejected a send.
    fn on_timeout(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

struct Inner {
    state: State,
    retransmit_interval: std::time::Duration,
    timer_e: Option<TimerHandle>,
    timer_f: Option<TimerHandle>,
    timer_k: Option<TimerHandle>,
}

/// Owns a sent non-INVITE request and retransmits it until a final response
/// or timeout.
pub struct ClientTsx {
    key: TsxKey,
    request: Request,
    destination: Destination,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<SessionLock>,
    handler: Arc<dyn ClientTsxHandler>,
    inner: Mutex<Inner>,
}

impl ClientTsx {
    pub fn new(
        key: TsxKey,
        request: Request,
        destination: Destination,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<SessionLock>,
        handler: Arc<dyn ClientTsxHandler>,
        reliable: bool,
    ) -> Arc<Self> {
        let tsx = Arc::new(ClientTsx {
            key,
            request,
            destination,
            transport,
            scheduler,
            lock,
            handler,
            inner: Mutex::new(Inner {
                state: State::Trying,
                retransmit_interval: T1,
                timer_e: None,
                timer_f: None,
                timer_k: None,
            }),
        });

        tsx.send_request();

        if !reliable {
            tsx.arm_timer_e();
        }
        tsx.arm_timer_f();

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

    fn arm_timer_e(self: &Arc<Self>) {
        let tsx = self.clone();
        let interval = self.inner.lock().retransmit_interval;
        let handle = self
            .scheduler
            .start_timeout(interval, self.lock.clone(), Box::new(move || tsx.on_timer_e()));
        self.inner.lock().timer_e = Some(handle);
    }

    fn arm_timer_f(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(T1 * 64, self.lock.clone(), Box::new(move || tsx.on_timer_f()));
        self.inner.lock().timer_f = Some(handle);
    }

    fn arm_timer_k(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(T4, self.lock.clone(), Box::new(move || tsx.on_timer_k()));
        self.inner.lock().timer_k = Some(handle);
    }

    fn on_timer_e(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if !matches!(inner.state, State::Trying | State::Proceeding) {
            return;
        }
        inner.retransmit_interval = (inner.retransmit_interval * 2).min(T2);
        drop(inner);

        self.send_request();
        self.arm_timer_e();
    }

    fn on_timer_f(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Completed | State::Terminated) {
            return;
        }
        inner.state = State::Terminated;
        drop(inner);

        self.handler.on_timeout();
    }

    fn on_timer_k(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.state = State::Terminated;
    }

    fn handle_transport_error(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return;
        }
        inner.state = State::Terminated;
        if let Some(t) = inner.timer_e.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_f.take() {
            t.cancel();
        }
        drop(inner);

        self.handler.on_timeout();
    }

    /// Deliver an inbound response matched to this transaction by the TM.
    pub fn on_response(self: &Arc<Self>, response: Response) {
        let mut inner = self.inner.lock();

        if matches!(inner.state, State::Completed | State::Terminated) {
            return;
        }

        if response.is_provisional() {
            inner.state = State::Proceeding;
            drop(inner);
            self.handler.on_provisional(response);
            return;
        }

        if let Some(t) = inner.timer_e.take() {
            t.cancel();
        }
        if let Some(t) = inner.timer_f.take() {
            t.cancel();
        }
        inner.state = State::Completed;
        drop(inner);

        self.arm_timer_k();
        self.handler.on_final(response);
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.lock().state == State::Terminated
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::timer::TokioScheduler;
    use crate::transport::test_support::RecordingTransport;
    use crate::transport::Proto;
    use parking_lot::Mutex as PLMutex;
    use sip_message::Headers;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dest() -> Destination {
        Destination {
            host: "192.0.2.30".into(),
            port: 5060,
            proto: Proto::Udp,
        }
    }

    fn register() -> Request {
        let mut headers = Headers::new();
        headers.push(sip_message::header::Name::Via, "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKreg");
        headers.push(sip_message::header::Name::From, "<sip:alice@example.com>;tag=1");
        headers.push(sip_message::header::Name::CallId, "reg@example.com");
        headers.push(sip_message::header::Name::CSeq, "1 REGISTER");
        headers.push(sip_message::header::Name::MaxForwards, "70");
        Request {
            method: sip_message::Method::Register,
            uri: sip_message::Uri::sip("example.com"),
            headers,
            body: Bytes::new(),
        }
    }

    fn response(status: u16) -> Response {
        Response {
            status,
            reason: String::new(),
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    #[derive(Default)]
    struct CountingHandler {
        provisionals: AtomicUsize,
        finals: PLMutex<Vec<u16>>,
        timeouts: AtomicUsize,
    }

    impl ClientTsxHandler for CountingHandler {
        fn on_provisional(&self, _response: Response) {
            self.provisionals.fetch_add(1, Ordering::SeqCst);
        }
        fn on_final(&self, response: Response) {
            self.finals.lock().push(response.status);
        }
        fn on_timeout(&self) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn s1_happy_path_terminates_on_2xx() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(CountingHandler::default());

        let tsx = ClientTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            register(),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            handler.clone(),
            false,
        );

        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 1);

        tsx.on_response(response(200));
        assert_eq!(handler.finals.lock().as_slice(), &[200]);
        // timer K still pending, transaction lingers until it fires
        assert!(!tsx.is_terminated());

        tokio::time::advance(T4 + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert!(tsx.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn provisional_moves_to_proceeding_and_does_not_stop_retransmission() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(CountingHandler::default());

        let tsx = ClientTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            register(),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            handler.clone(),
            false,
        );

        tsx.on_response(response(100));
        assert_eq!(handler.provisionals.load(Ordering::SeqCst), 1);

        // E still arms every interval while Proceeding.
        tokio::time::advance(T1 + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retransmits_double_capped_at_t2_then_times_out_at_timer_f() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(CountingHandler::default());

        let _tsx = ClientTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            register(),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            handler.clone(),
            false,
        );

        // Sends at t=0, 0.5, 1.5, 3.5, then every 4s (capped at T2) until F
        // fires at 64*T1=32s: 0, .5, 1.5, 3.5, 7.5, 11.5, ..., last before 32.
        tokio::time::advance(Duration::from_secs(33)).await;
        tokio::task::yield_now().await;

        assert!(transport.sent.lock().len() >= 6);
        assert_eq!(handler.timeouts.load(Ordering::SeqCst), 1);
        assert!(handler.finals.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reliable_transport_skips_timer_e_retransmission() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(CountingHandler::default());

        let _tsx = ClientTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            register(),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            handler.clone(),
            true,
        );

        tokio::time::advance(T1 * 4).await;
        tokio::task::yield_now().await;

        // only the initial send; no retransmits on a reliable transport
        assert_eq!(transport.sent.lock().len(), 1);
    }
}
