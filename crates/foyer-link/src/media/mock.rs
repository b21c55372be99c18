//! Scripted media sessions for exercising negotiation without a network.
//!
//! Offers are numbered `offer-1`, `offer-2`, ... and answers echo the offer
//! they answer (`answer:offer-1`), so tests can assert exactly which SDP won
//! a glare round. Every call is recorded on a handle the test keeps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use foyer_proto::IceCandidate;

use super::{LocalMedia, MediaConnector, MediaEvent, MediaSession, TrackSource};
use crate::error::LinkError;

#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    ProduceOffer,
    AcceptOffer(String),
    AcceptAnswer(String),
    AbandonOffer,
    AddCandidate(String),
    ReplaceTrack(TrackSource),
    Close,
}

#[derive(Default)]
struct Failures {
    produce_offer: AtomicBool,
    accept_offer: AtomicBool,
    accept_answer: AtomicBool,
}

/// Test-side view of one created session: inspect calls, inject events.
#[derive(Clone)]
pub struct MockSessionHandle {
    pub initiator: bool,
    calls: Arc<Mutex<Vec<MockCall>>>,
    failures: Arc<Failures>,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl MockSessionHandle {
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Push an event as if the transport raised it.
    pub fn push_event(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_next_produce_offer(&self) {
        self.failures.produce_offer.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_accept_offer(&self) {
        self.failures.accept_offer.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_accept_answer(&self) {
        self.failures.accept_answer.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    auto_ready: bool,
    renegotiate_on_replace: bool,
    fail_creates: bool,
    handles: Mutex<Vec<MockSessionHandle>>,
}

impl MockConnector {
    /// Sessions report `Ready` as soon as an exchange commits, so links march
    /// straight to `Connected`.
    pub fn new() -> Self {
        Self {
            auto_ready: true,
            renegotiate_on_replace: false,
            fail_creates: false,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Keep sessions silent after an exchange; the test raises `Ready` itself.
    pub fn manual_ready(mut self) -> Self {
        self.auto_ready = false;
        self
    }

    /// Have every track replacement demand a renegotiation cycle.
    pub fn renegotiate_on_replace(mut self) -> Self {
        self.renegotiate_on_replace = true;
        self
    }

    /// Refuse to build sessions at all.
    pub fn fail_creates(mut self) -> Self {
        self.fail_creates = true;
        self
    }

    /// Handles for every session created so far, in creation order.
    pub fn sessions(&self) -> Vec<MockSessionHandle> {
        self.handles.lock().clone()
    }

    pub fn session(&self, index: usize) -> Option<MockSessionHandle> {
        self.handles.lock().get(index).cloned()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaConnector for MockConnector {
    async fn create(
        &self,
        initiator: bool,
        _media: &LocalMedia,
    ) -> Result<(Box<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), LinkError> {
        if self.fail_creates {
            return Err(LinkError::Media("scripted create failure".to_string()));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Failures::default());
        self.handles.lock().push(MockSessionHandle {
            initiator,
            calls: calls.clone(),
            failures: failures.clone(),
            events: events_tx.clone(),
        });
        let session = MockSession {
            auto_ready: self.auto_ready,
            renegotiate_on_replace: self.renegotiate_on_replace,
            offers: AtomicU64::new(0),
            calls,
            failures,
            events: events_tx,
            closed: AtomicBool::new(false),
        };
        Ok((Box::new(session), events_rx))
    }
}

struct MockSession {
    auto_ready: bool,
    renegotiate_on_replace: bool,
    offers: AtomicU64,
    calls: Arc<Mutex<Vec<MockCall>>>,
    failures: Arc<Failures>,
    events: mpsc::UnboundedSender<MediaEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaSession for MockSession {
    async fn produce_offer(&self) -> Result<String, LinkError> {
        self.calls.lock().push(MockCall::ProduceOffer);
        if self.failures.produce_offer.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Media("scripted produce_offer failure".to_string()));
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("offer-{n}"))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, LinkError> {
        self.calls.lock().push(MockCall::AcceptOffer(sdp.to_string()));
        if self.failures.accept_offer.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Media("scripted accept_offer failure".to_string()));
        }
        if self.auto_ready {
            let _ = self.events.send(MediaEvent::Ready);
        }
        Ok(format!("answer:{sdp}"))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), LinkError> {
        self.calls.lock().push(MockCall::AcceptAnswer(sdp.to_string()));
        if self.failures.accept_answer.swap(false, Ordering::SeqCst) {
            return Err(LinkError::Media("scripted accept_answer failure".to_string()));
        }
        if self.auto_ready {
            let _ = self.events.send(MediaEvent::Ready);
        }
        Ok(())
    }

    async fn abandon_offer(&self) {
        self.calls.lock().push(MockCall::AbandonOffer);
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.calls.lock().push(MockCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn replace_outgoing_track(&self, source: TrackSource) -> Result<(), LinkError> {
        self.calls.lock().push(MockCall::ReplaceTrack(source));
        if self.renegotiate_on_replace {
            let _ = self.events.send(MediaEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.calls.lock().push(MockCall::Close);
        }
    }
}
