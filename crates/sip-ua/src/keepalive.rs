//! Keep-alive controller: periodic re-INVITE probing of a Connected
//! dialog, with auth retry and a disconnect policy tuned by whether the
//! peer has ever answered a probe.

use crate::state::UaStateKind;
use crate::ua::Ua;
use parking_lot::Mutex;
use sip_message::{AuthChallenge, Method, Request, Response};
use sip_transaction::{ClientInvTsx, ClientInvTsxHandler, Scheduler, SessionLock, TimerHandle, TransactionManager};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Grace period before giving up on a peer that answered the first
/// keep-alive probe with 408/481/486.
const DISABLE_AFTER_FIRST_FAILURE: Duration = Duration::from_secs(600);

struct Inner {
    tsx: Option<Arc<ClientInvTsx>>,
    probe_timer: Option<TimerHandle>,
    disable_timer: Option<TimerHandle>,
    /// The probe request currently in flight, kept around to build the
    /// end-to-end ACK once its 2xx arrives.
    last_request: Option<Request>,
}

/// Wholly owned by its [`Ua`]; holds only a weak back-reference to the UA
/// so that cycle breaks the moment the UA drops its own handle to this
/// controller in [`Ua::cleanup`].
pub struct KeepaliveController {
    self_weak: Mutex<Weak<KeepaliveController>>,
    ua: Weak<Ua>,
    tm: Arc<TransactionManager>,
    lock: Arc<SessionLock>,
    interval: Duration,
    /// Probes sent so far in this dialog; distinguishes "first keep-alive
    /// unanswered" from "a later one".
    probe_count: AtomicU32,
    tried_auth_this_probe: AtomicBool,
    disabled: AtomicBool,
    stopped: AtomicBool,
    inner: Mutex<Inner>,
}

impl KeepaliveController {
    pub fn new(ua: Weak<Ua>, tm: Arc<TransactionManager>, lock: Arc<SessionLock>, interval: Duration) -> Arc<Self> {
        let controller = Arc::new(KeepaliveController {
            self_weak: Mutex::new(Weak::new()),
            ua,
            tm,
            lock,
            interval,
            probe_count: AtomicU32::new(0),
            tried_auth_this_probe: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                tsx: None,
                probe_timer: None,
                disable_timer: None,
                last_request: None,
            }),
        });
        *controller.self_weak.lock() = Arc::downgrade(&controller);
        controller
    }

    fn arc(&self) -> Arc<Self> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("keepalive handlers only run while the Arc<KeepaliveController> that installed them is alive")
    }

    /// Arms the first probe, `interval` seconds from dialog establishment.
    pub fn start(&self) {
        self.arm_next_probe(self.interval);
    }

    /// Stops all scheduled probes and cancels any in-flight probe
    /// transaction, for when the UA leaves Connected.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if let Some(t) = inner.probe_timer.take() {
            t.cancel();
        }
        if let Some(t) = inner.disable_timer.take() {
            t.cancel();
        }
        if let Some(tsx) = inner.tsx.take() {
            tsx.cancel();
        }
    }

    fn arm_next_probe(&self, after: Duration) {
        if self.stopped.load(Ordering::SeqCst) || self.disabled.load(Ordering::SeqCst) {
            return;
        }
        let controller = self.arc();
        let handle = self
            .tm
            .scheduler()
            .start_timeout(after, self.lock.clone(), Box::new(move || controller.fire_probe()));
        self.inner.lock().probe_timer = Some(handle);
    }

    fn fire_probe(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(ua) = self.ua.upgrade() else {
            return;
        };
        if ua.state() != UaStateKind::Connected {
            return;
        }

        self.tried_auth_this_probe.store(false, Ordering::SeqCst);
        self.send_probe(&ua, None);
    }

    fn send_probe(&self, ua: &Arc<Ua>, challenge: Option<&AuthChallenge>) {
        let request = match ua.gen_request(Method::Invite, ua.local_sdp(), challenge) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("keepalive: failed to build re-INVITE: {err}");
                return;
            }
        };

        self.probe_count.fetch_add(1, Ordering::SeqCst);

        let tsx = self.tm.begin_client_invite_transaction(
            request.clone(),
            ua.destination(),
            ua.via_sent_by(),
            ua.via_transport(),
            self.arc() as Arc<dyn ClientInvTsxHandler>,
            self.lock.clone(),
            ua.reliable(),
        );
        let mut inner = self.inner.lock();
        inner.tsx = Some(tsx);
        inner.last_request = Some(request);
    }

    /// A probe got 408/481/486 or timed out: the first occurrence
    /// disables further probing and schedules a graceful
    /// disconnect in 600s; any later occurrence disconnects immediately.
    fn handle_peer_unreachable(&self, reason: &str) {
        if self.probe_count.load(Ordering::SeqCst) <= 1 {
            self.disabled.store(true, Ordering::SeqCst);
            let controller = self.arc();
            let handle = self.tm.scheduler().start_timeout(
                DISABLE_AFTER_FIRST_FAILURE,
                self.lock.clone(),
                Box::new(move || controller.fire_disable_disconnect()),
            );
            self.inner.lock().disable_timer = Some(handle);
        } else if let Some(ua) = self.ua.upgrade() {
            ua.disconnect(reason);
        }
    }

    fn fire_disable_disconnect(&self) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Some(ua) = self.ua.upgrade() {
            ua.disconnect("keep-alive unanswered");
        }
    }
}

impl ClientInvTsxHandler for KeepaliveController {
    fn on_provisional(&self, _response: Response) {
        // Ignore; wait for the final response.
    }

    fn on_success(&self, response: Response) {
        if let Some(ua) = self.ua.upgrade() {
            if let Some(request) = self.inner.lock().last_request.take() {
                ua.send_ack_for_2xx(&request, &response);
            }
        }
        self.arm_next_probe(self.interval);
    }

    fn on_failure(&self, response: Response) {
        if matches!(response.status, 401 | 407) && !self.tried_auth_this_probe.swap(true, Ordering::SeqCst) {
            if let Some(ua) = self.ua.upgrade() {
                if ua.credentials().is_some() {
                    let challenge = response
                        .headers
                        .www_authenticate()
                        .ok()
                        .flatten()
                        .or_else(|| response.headers.proxy_authenticate().ok().flatten());
                    if let Some(challenge) = challenge {
                        self.send_probe(&ua, Some(&challenge));
                        return;
                    }
                }
            }
        }

        if matches!(response.status, 408 | 481 | 486) {
            self.handle_peer_unreachable(&format!("{} {}", response.status, response.reason));
            return;
        }

        self.arm_next_probe(self.interval);
    }

    fn on_timeout(&self) {
        self.handle_peer_unreachable("keep-alive timeout");
    }
}
