//! Server non-INVITE transaction, RFC 3261 §17.2.2.

use super::T1;
use crate::key::TsxKey;
use crate::send::fire_and_forget;
use crate::timer::{Scheduler, SessionLock, TimerHandle};
use crate::transport::{Destination, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use sip_message::{Message, Response};
use std::sync::Arc;
use std::time::Duration;

/// Notifies the transaction's owner once it reaches Terminated, so the TM
/// can drop it from the transaction table.
pub trait ServerTsxHandler: Send + Sync {
    fn on_terminated(&self) {}
}

impl ServerTsxHandler for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

struct Inner {
    state: State,
    last_response: Option<Response>,
    timer_j: Option<TimerHandle>,
}

/// Absorbs retransmits of the original request, replaying the last response
/// sent, until timer J (64·T1) fires.
pub struct ServerTsx {
    key: TsxKey,
    destination: Destination,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    lock: Arc<SessionLock>,
    handler: Arc<dyn ServerTsxHandler>,
    inner: Mutex<Inner>,
}

impl ServerTsx {
    pub fn new(
        key: TsxKey,
        destination: Destination,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
        lock: Arc<SessionLock>,
        handler: Arc<dyn ServerTsxHandler>,
    ) -> Arc<Self> {
        Arc::new(ServerTsx {
            key,
            destination,
            transport,
            scheduler,
            lock,
            handler,
            inner: Mutex::new(Inner {
                state: State::Trying,
                last_response: None,
                timer_j: None,
            }),
        })
    }

    pub fn key(&self) -> &TsxKey {
        &self.key
    }

    /// A retransmit of the original request arrived: replay the last sent
    /// response, if any.
    pub fn on_request_retransmit(self: &Arc<Self>) {
        let inner = self.inner.lock();
        if let Some(response) = inner.last_response.clone() {
            drop(inner);
            self.send(response);
        }
    }

    /// The UA supplies a response (provisional or final).
    pub fn respond(self: &Arc<Self>, response: Response) {
        let mut inner = self.inner.lock();
        if inner.state == State::Terminated {
            return;
        }

        inner.last_response = Some(response.clone());

        if response.is_provisional() {
            inner.state = State::Proceeding;
            drop(inner);
            self.send(response);
            return;
        }

        inner.state = State::Completed;
        drop(inner);
        self.send(response);
        self.arm_timer_j();
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

    fn arm_timer_j(self: &Arc<Self>) {
        let tsx = self.clone();
        let handle = self
            .scheduler
            .start_timeout(T1 * 64, self.lock.clone(), Box::new(move || tsx.on_timer_j()));
        self.inner.lock().timer_j = Some(handle);
    }

    fn on_timer_j(self: &Arc<Self>) {
        self.inner.lock().state = State::Terminated;
        self.handler.on_terminated();
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
    use sip_message::Headers;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dest() -> Destination {
        Destination {
            host: "192.0.2.31".into(),
            port: 5060,
            proto: Proto::Udp,
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
        terminated: AtomicUsize,
    }

    impl ServerTsxHandler for CountingHandler {
        fn on_terminated(&self) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retransmit_of_original_request_replays_last_response() {
        let transport = Arc::new(RecordingTransport::default());
        let tsx = ServerTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            Arc::new(CountingHandler::default()),
        );

        tsx.respond(response(200));
        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 1);

        tsx.on_request_retransmit();
        tokio::task::yield_now().await;
        assert_eq!(transport.sent.lock().len(), 2);
        match &transport.sent.lock()[1].0 {
            Message::Response(r) => assert_eq!(r.status, 200),
            _ => panic!("expected response"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn request_retransmit_before_any_response_is_a_noop() {
        let transport = Arc::new(RecordingTransport::default());
        let tsx = ServerTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            Arc::new(CountingHandler::default()),
        );

        tsx.on_request_retransmit();
        tokio::task::yield_now().await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn final_response_arms_timer_j_and_terminates_after_64_t1() {
        let transport = Arc::new(RecordingTransport::default());
        let handler = Arc::new(CountingHandler::default());
        let tsx = ServerTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            handler.clone(),
        );

        tsx.respond(response(404));
        assert!(!tsx.is_terminated());

        tokio::time::advance(T1 * 64 + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert!(tsx.is_terminated());
        assert_eq!(handler.terminated.load(Ordering::SeqCst), 1);
        // no retransmits of the 404 absent a matching request retransmit
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn responding_after_terminated_is_a_noop() {
        let transport = Arc::new(RecordingTransport::default());
        let tsx = ServerTsx::new(
            TsxKey::new_client(&sip_message::Method::Register),
            dest(),
            transport.clone(),
            Arc::new(TokioScheduler),
            SessionLock::new(),
            Arc::new(CountingHandler::default()),
        );

        tsx.respond(response(200));
        tokio::time::advance(T1 * 64 + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        assert!(tsx.is_terminated());

        tsx.respond(response(500));
        tokio::task::yield_now().await;
        // still just the original 200, the late 500 never got sent
        assert_eq!(transport.sent.lock().len(), 1);
    }
}
