//! Per-peer negotiation state machine.
//!
//! One `PeerLink` exists per remote user. Its driver task owns the media
//! session exclusively and applies commands and media events one at a time,
//! so negotiation transitions are never reentrant. Roles come from join
//! order: whoever was already in the room initiates toward the newcomer,
//! which yields exactly one initial offer per pair with no coordination.
//!
//! Renegotiation breaks that asymmetry, so glare is settled by the
//! polite/impolite rule fixed at creation: the initiator is impolite and its
//! in-flight offer wins a collision; the responder is polite and abandons
//! its own offer to accept the remote one. Nothing in here is fatal: a
//! malformed or out-of-state signal is logged and ignored, because the relay
//! never redelivers.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use foyer_proto::{IceCandidate, SignalPayload};

use crate::media::{LocalMedia, MediaConnector, MediaEvent, MediaSession, TrackSource};
use crate::room::RoomEvent;
use crate::signaling::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Was already in the room; sends the first offer; impolite under glare.
    Initiator,
    /// Joined later; waits for the first offer; polite under glare.
    Responder,
}

impl LinkRole {
    pub fn is_initiator(&self) -> bool {
        matches!(self, LinkRole::Initiator)
    }

    pub fn is_polite(&self) -> bool {
        matches!(self, LinkRole::Responder)
    }
}

pub(crate) struct LinkSettings {
    pub remote_user_id: String,
    pub role: LinkRole,
    pub connector: Arc<dyn MediaConnector>,
    pub media: LocalMedia,
    pub sink: SignalSink,
    pub events: mpsc::UnboundedSender<RoomEvent>,
    pub candidate_cap: usize,
}

enum LinkCommand {
    Signal(SignalPayload),
    ReplaceMedia(TrackSource),
    Close,
}

/// Handle to one remote peer's negotiation driver.
pub struct PeerLink {
    remote_user_id: String,
    role: LinkRole,
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<LinkState>,
}

impl PeerLink {
    pub(crate) fn spawn(settings: LinkSettings) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Idle);
        let remote_user_id = settings.remote_user_id.clone();
        let role = settings.role;
        tokio::spawn(run_link(settings, cmd_rx, state_tx));
        Self {
            remote_user_id,
            role,
            commands: cmd_tx,
            state: state_rx,
        }
    }

    pub fn remote_user_id(&self) -> &str {
        &self.remote_user_id
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub(crate) fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Hand a relayed signal to the driver. Returns false if the driver is
    /// gone, which callers treat as a stale-link signal and drop.
    pub(crate) fn deliver(&self, signal: SignalPayload) -> bool {
        self.commands.send(LinkCommand::Signal(signal)).is_ok()
    }

    pub(crate) fn replace_media(&self, source: TrackSource) {
        let _ = self.commands.send(LinkCommand::ReplaceMedia(source));
    }

    /// Idempotent; the driver also dies when the last handle is dropped.
    pub(crate) fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

async fn run_link(
    settings: LinkSettings,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    state_tx: watch::Sender<LinkState>,
) {
    let LinkSettings {
        remote_user_id,
        role,
        connector,
        media,
        sink,
        events,
        candidate_cap,
    } = settings;

    let (session, mut media_events) = match connector.create(role.is_initiator(), &media).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(
                target: "link",
                peer = %remote_user_id,
                error = %err,
                "failed to build media session"
            );
            state_tx.send_replace(LinkState::Closed);
            let _ = events.send(RoomEvent::LinkState {
                user_id: remote_user_id,
                state: LinkState::Closed,
            });
            return;
        }
    };

    let mut driver = LinkDriver {
        remote_user_id,
        role,
        session,
        sink,
        events,
        state_tx,
        state: LinkState::Idle,
        making_offer: false,
        sdp_settled: false,
        ever_settled: false,
        renegotiate_when_settled: false,
        remote_desc_set: false,
        transport_ready: false,
        closed: false,
        pending_candidates: Vec::new(),
        candidate_cap,
    };

    driver.publish(LinkState::Negotiating);
    if driver.role.is_initiator() {
        driver.start_offer().await;
    }

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Signal(signal)) => driver.apply_signal(signal).await,
                Some(LinkCommand::ReplaceMedia(source)) => driver.replace_media(source).await,
                Some(LinkCommand::Close) | None => break,
            },
            event = media_events.recv() => match event {
                Some(event) => driver.handle_media_event(event).await,
                None => break,
            },
        }
        if driver.closed {
            break;
        }
    }

    driver.shutdown().await;
}

struct LinkDriver {
    remote_user_id: String,
    role: LinkRole,
    session: Box<dyn MediaSession>,
    sink: SignalSink,
    events: mpsc::UnboundedSender<RoomEvent>,
    state_tx: watch::Sender<LinkState>,
    state: LinkState,
    /// A local offer is outstanding and uncommitted.
    making_offer: bool,
    /// The current offer/answer pair has been fully applied.
    sdp_settled: bool,
    /// At least one exchange has ever settled on this link.
    ever_settled: bool,
    /// A renegotiation request arrived mid-exchange; run it once settled.
    renegotiate_when_settled: bool,
    remote_desc_set: bool,
    transport_ready: bool,
    closed: bool,
    pending_candidates: Vec<IceCandidate>,
    candidate_cap: usize,
}

impl LinkDriver {
    async fn start_offer(&mut self) {
        match self.session.produce_offer().await {
            Ok(sdp) => {
                self.making_offer = true;
                self.sdp_settled = false;
                self.publish(LinkState::Negotiating);
                self.sink
                    .send(&self.remote_user_id, &SignalPayload::Offer { sdp });
            }
            Err(err) => warn!(
                target: "link",
                peer = %self.remote_user_id,
                error = %err,
                "failed to produce offer"
            ),
        }
    }

    async fn apply_signal(&mut self, signal: SignalPayload) {
        match signal {
            SignalPayload::Offer { sdp } => self.handle_offer(sdp).await,
            SignalPayload::Answer { sdp } => self.handle_answer(sdp).await,
            SignalPayload::IceCandidate(candidate) => self.handle_candidate(candidate).await,
        }
    }

    async fn handle_offer(&mut self, sdp: String) {
        if self.making_offer {
            if self.role.is_polite() {
                debug!(
                    target: "link",
                    peer = %self.remote_user_id,
                    "offer collision, yielding to the remote offer"
                );
                self.session.abandon_offer().await;
                self.making_offer = false;
            } else {
                debug!(
                    target: "link",
                    peer = %self.remote_user_id,
                    "offer collision, keeping the local offer"
                );
                return;
            }
        }
        match self.session.accept_offer(&sdp).await {
            Ok(answer) => {
                self.remote_desc_set = true;
                self.settle();
                self.sink
                    .send(&self.remote_user_id, &SignalPayload::Answer { sdp: answer });
                self.flush_candidates().await;
                self.maybe_renegotiate().await;
            }
            Err(err) => warn!(
                target: "link",
                peer = %self.remote_user_id,
                error = %err,
                "failed to apply remote offer"
            ),
        }
    }

    async fn handle_answer(&mut self, sdp: String) {
        if !self.making_offer {
            warn!(
                target: "link",
                peer = %self.remote_user_id,
                "answer with no outstanding offer, ignoring"
            );
            return;
        }
        match self.session.accept_answer(&sdp).await {
            Ok(()) => {
                self.remote_desc_set = true;
                self.settle();
                self.flush_candidates().await;
                self.maybe_renegotiate().await;
            }
            Err(err) => {
                warn!(
                    target: "link",
                    peer = %self.remote_user_id,
                    error = %err,
                    "failed to apply remote answer"
                );
                self.making_offer = false;
            }
        }
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) {
        if !self.remote_desc_set {
            if self.pending_candidates.len() >= self.candidate_cap {
                warn!(
                    target: "link",
                    peer = %self.remote_user_id,
                    cap = self.candidate_cap,
                    "candidate queue full, dropping candidate"
                );
                return;
            }
            self.pending_candidates.push(candidate);
            return;
        }
        if let Err(err) = self.session.add_remote_candidate(candidate).await {
            warn!(
                target: "link",
                peer = %self.remote_user_id,
                error = %err,
                "failed to apply remote candidate"
            );
        }
    }

    async fn replace_media(&mut self, source: TrackSource) {
        if let Err(err) = self.session.replace_outgoing_track(source).await {
            warn!(
                target: "link",
                peer = %self.remote_user_id,
                error = %err,
                "failed to replace outgoing track"
            );
        }
    }

    async fn handle_media_event(&mut self, event: MediaEvent) {
        match event {
            MediaEvent::Candidate(candidate) => {
                self.sink
                    .send(&self.remote_user_id, &SignalPayload::IceCandidate(candidate));
            }
            MediaEvent::RemoteMedia(media) => {
                let _ = self.events.send(RoomEvent::RemoteMedia {
                    user_id: self.remote_user_id.clone(),
                    media,
                });
            }
            MediaEvent::Ready => {
                self.transport_ready = true;
                self.refresh_state();
            }
            MediaEvent::Failed => {
                warn!(target: "link", peer = %self.remote_user_id, "media transport failed");
                self.transport_ready = false;
                self.refresh_state();
            }
            MediaEvent::Closed => {
                debug!(target: "link", peer = %self.remote_user_id, "media session closed");
                self.closed = true;
            }
            MediaEvent::NegotiationNeeded => {
                if !self.ever_settled {
                    // The initial exchange is already owed by role.
                    trace!(
                        target: "link",
                        peer = %self.remote_user_id,
                        "negotiation needed before first exchange, ignoring"
                    );
                } else if self.sdp_settled && !self.making_offer {
                    self.start_offer().await;
                } else {
                    self.renegotiate_when_settled = true;
                }
            }
        }
    }

    fn settle(&mut self) {
        self.making_offer = false;
        self.sdp_settled = true;
        self.ever_settled = true;
        self.refresh_state();
    }

    async fn flush_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(err) = self.session.add_remote_candidate(candidate).await {
                warn!(
                    target: "link",
                    peer = %self.remote_user_id,
                    error = %err,
                    "failed to apply queued candidate"
                );
            }
        }
    }

    async fn maybe_renegotiate(&mut self) {
        if self.renegotiate_when_settled && self.sdp_settled && !self.making_offer {
            self.renegotiate_when_settled = false;
            self.start_offer().await;
        }
    }

    fn refresh_state(&mut self) {
        let next = if self.closed {
            LinkState::Closed
        } else if self.sdp_settled && self.transport_ready {
            LinkState::Connected
        } else {
            LinkState::Negotiating
        };
        self.publish(next);
    }

    fn publish(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        debug!(
            target: "link",
            peer = %self.remote_user_id,
            from = ?self.state,
            to = ?next,
            "link state changed"
        );
        self.state = next;
        self.state_tx.send_replace(next);
        let _ = self.events.send(RoomEvent::LinkState {
            user_id: self.remote_user_id.clone(),
            state: next,
        });
    }

    async fn shutdown(&mut self) {
        self.session.close().await;
        self.pending_candidates.clear();
        self.closed = true;
        self.publish(LinkState::Closed);
    }
}
