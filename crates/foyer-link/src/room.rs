//! Room membership from the client's side: join, track peers, wire one
//! `PeerLink` per remote user, and forward room happenings to the
//! application.
//!
//! A single coordinator task consumes the signaling stream, so membership
//! changes and signal routing for one room are applied in a total order.
//! Media negotiation itself happens inside each link's own driver; the
//! coordinator only decides which link (or the pending buffer) gets each
//! signal.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use foyer_proto::{RoomUser, SignalPayload};

use crate::buffer::PendingSignalBuffer;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::media::{LocalMedia, MediaConnector, RemoteMedia, TrackSource};
use crate::peer::{LinkRole, LinkSettings, LinkState, PeerLink};
use crate::signaling::{SignalingClient, SignalingEvent};

/// Everything needed to enter a room.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub server_url: String,
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub media: LocalMedia,
    pub config: LinkConfig,
}

/// Room happenings surfaced to the application.
#[derive(Debug)]
pub enum RoomEvent {
    PeerJoined {
        user_id: String,
        display_name: String,
    },
    PeerLeft {
        user_id: String,
    },
    LinkState {
        user_id: String,
        state: LinkState,
    },
    RemoteMedia {
        user_id: String,
        media: RemoteMedia,
    },
    Chat {
        from_user_id: String,
        display_name: String,
        text: String,
    },
    /// The signaling connection died; no further events will arrive.
    SignalingLost,
}

pub(crate) enum RoomCommand {
    ReplaceMedia(TrackSource),
    Chat(String),
    Leave,
}

pub struct RoomClient;

impl RoomClient {
    /// Join a room and start negotiating with everyone already in it.
    /// Returns a handle for local actions and the stream of room events.
    pub async fn join(
        options: JoinOptions,
        connector: Arc<dyn MediaConnector>,
    ) -> Result<(RoomHandle, mpsc::UnboundedReceiver<RoomEvent>), LinkError> {
        let (signaling, ack, signal_events) = SignalingClient::connect(
            &options.server_url,
            &options.room_id,
            &options.user_id,
            &options.display_name,
            options.config.heartbeat(),
        )
        .await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let pending_cap = options.config.pending_signal_cap;
        let mut coordinator = Coordinator {
            signaling,
            connector,
            media: options.media,
            config: options.config,
            links: HashMap::new(),
            buffer: PendingSignalBuffer::new(pending_cap),
            events: event_tx,
        };

        // Whoever was here first initiates toward us; we answer. Links are in
        // place before the first queued signal is processed.
        for user in ack.existing {
            coordinator.announce_and_adopt(user, LinkRole::Responder);
        }

        let task = tokio::spawn(coordinator.run(signal_events, control_rx));

        Ok((
            RoomHandle {
                room_id: options.room_id,
                user_id: options.user_id,
                control: control_tx,
                task,
            },
            event_rx,
        ))
    }
}

/// Handle for the local participant's actions in a joined room.
pub struct RoomHandle {
    room_id: String,
    user_id: String,
    control: mpsc::UnboundedSender<RoomCommand>,
    task: JoinHandle<()>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Swap the outgoing video source on every link, current and future.
    pub fn replace_media(&self, source: TrackSource) {
        let _ = self.control.send(RoomCommand::ReplaceMedia(source));
    }

    pub fn send_chat(&self, text: impl Into<String>) {
        let _ = self.control.send(RoomCommand::Chat(text.into()));
    }

    /// Leave the room and wait for teardown to finish.
    pub async fn leave(self) {
        let _ = self.control.send(RoomCommand::Leave);
        let _ = self.task.await;
    }
}

struct Coordinator {
    signaling: SignalingClient,
    connector: Arc<dyn MediaConnector>,
    media: LocalMedia,
    config: LinkConfig,
    links: HashMap<String, PeerLink>,
    buffer: PendingSignalBuffer,
    events: mpsc::UnboundedSender<RoomEvent>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        mut control: mpsc::UnboundedReceiver<RoomCommand>,
    ) {
        loop {
            tokio::select! {
                event = signals.recv() => match event {
                    Some(event) => {
                        if !self.handle_signaling(event) {
                            break;
                        }
                    }
                    None => break,
                },
                command = control.recv() => match command {
                    Some(RoomCommand::Leave) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }
        self.teardown();
    }

    /// Returns false when the room is over and the coordinator should stop.
    fn handle_signaling(&mut self, event: SignalingEvent) -> bool {
        match event {
            SignalingEvent::UserJoined(user) => {
                if let Some(old) = self.links.remove(&user.user_id) {
                    // Same userId, new incarnation: the old link and anything
                    // buffered for it are stale.
                    info!(
                        target: "link",
                        user = %user.user_id,
                        "peer rejoined, resetting its link"
                    );
                    self.buffer.discard(&user.user_id);
                    old.close();
                }
                self.announce_and_adopt(user, LinkRole::Initiator);
            }
            SignalingEvent::Signal {
                from_user_id,
                payload,
            } => {
                let signal = match SignalPayload::from_value(&payload) {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!(
                            target: "link",
                            from = %from_user_id,
                            error = %err,
                            "malformed signal payload, dropping"
                        );
                        return true;
                    }
                };
                match self.links.get(&from_user_id) {
                    Some(link) => {
                        if !link.deliver(signal) {
                            debug!(
                                target: "link",
                                from = %from_user_id,
                                "link already closed, dropping signal"
                            );
                        }
                    }
                    None => self.buffer.push(&from_user_id, signal),
                }
            }
            SignalingEvent::UserLeft { user_id } => {
                self.buffer.discard(&user_id);
                if let Some(link) = self.links.remove(&user_id) {
                    link.close();
                }
                let _ = self.events.send(RoomEvent::PeerLeft { user_id });
            }
            SignalingEvent::Chat {
                from_user_id,
                display_name,
                text,
            } => {
                let _ = self.events.send(RoomEvent::Chat {
                    from_user_id,
                    display_name,
                    text,
                });
            }
            SignalingEvent::Closed => {
                let _ = self.events.send(RoomEvent::SignalingLost);
                return false;
            }
        }
        true
    }

    fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::ReplaceMedia(source) => {
                self.media.video = Some(source);
                for link in self.links.values() {
                    link.replace_media(source);
                }
            }
            RoomCommand::Chat(text) => {
                if self.signaling.send_chat(&text).is_err() {
                    debug!(target: "link", "signaling closed, chat dropped");
                }
            }
            RoomCommand::Leave => {}
        }
    }

    /// Tell the application about a peer, spawn its link, and feed the link
    /// anything that arrived early.
    fn announce_and_adopt(&mut self, user: RoomUser, role: LinkRole) {
        let _ = self.events.send(RoomEvent::PeerJoined {
            user_id: user.user_id.clone(),
            display_name: user.display_name,
        });
        let link = PeerLink::spawn(LinkSettings {
            remote_user_id: user.user_id.clone(),
            role,
            connector: self.connector.clone(),
            media: self.media.clone(),
            sink: self.signaling.sink(),
            events: self.events.clone(),
            candidate_cap: self.config.candidate_queue_cap,
        });
        for payload in self.buffer.drain(&user.user_id) {
            if !link.deliver(payload) {
                break;
            }
        }
        self.links.insert(user.user_id, link);
    }

    fn teardown(&mut self) {
        for (_, link) in self.links.drain() {
            link.close();
        }
        self.buffer.clear();
        self.signaling.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;

    use foyer_proto::ClientMessage;

    use crate::media::mock::{MockCall, MockConnector, MockSessionHandle};

    struct RoomFixture {
        coordinator: Coordinator,
        connector: Arc<MockConnector>,
        outbound: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<RoomEvent>,
    }

    fn fixture() -> RoomFixture {
        let connector = Arc::new(MockConnector::new());
        let (signaling, outbound) = SignalingClient::stub("r1", "me");
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            signaling,
            connector: connector.clone(),
            media: LocalMedia::default(),
            config: LinkConfig::default(),
            links: HashMap::new(),
            buffer: PendingSignalBuffer::new(8),
            events: event_tx,
        };
        RoomFixture {
            coordinator,
            connector,
            outbound,
            events: event_rx,
        }
    }

    fn bob() -> RoomUser {
        RoomUser {
            user_id: "bob".to_string(),
            display_name: "Bob".to_string(),
        }
    }

    fn offer(sdp: &str) -> serde_json::Value {
        SignalPayload::Offer {
            sdp: sdp.to_string(),
        }
        .to_value()
        .expect("encodable payload")
    }

    async fn wait_session(connector: &MockConnector, index: usize) -> MockSessionHandle {
        for _ in 0..200 {
            if let Some(handle) = connector.session(index) {
                return handle;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("media session {index} was never created");
    }

    async fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn expect_peer_left(events: &mut mpsc::UnboundedReceiver<RoomEvent>, user: &str) {
        loop {
            match events.recv().await.expect("event channel closed") {
                RoomEvent::PeerLeft { user_id } if user_id == user => return,
                _ => continue,
            }
        }
    }

    #[test_deadline::tokio_deadline_test]
    async fn a_new_peer_gets_an_initiating_link() {
        let mut fx = fixture();
        assert!(fx.coordinator.handle_signaling(SignalingEvent::UserJoined(bob())));

        match fx.events.try_recv() {
            Ok(RoomEvent::PeerJoined {
                user_id,
                display_name,
            }) => {
                assert_eq!(user_id, "bob");
                assert_eq!(display_name, "Bob");
            }
            other => panic!("expected the peer announcement, got {other:?}"),
        }
        let session = wait_session(&fx.connector, 0).await;
        assert!(session.initiator);
        // Its opening offer goes out through signaling.
        wait_until(
            || matches!(fx.outbound.try_recv(), Ok(ClientMessage::Signal { .. })),
            "the opening offer",
        )
        .await;
    }

    #[test_deadline::tokio_deadline_test]
    async fn an_existing_peer_gets_a_responding_link() {
        let mut fx = fixture();
        fx.coordinator.announce_and_adopt(bob(), LinkRole::Responder);

        assert!(matches!(
            fx.events.try_recv(),
            Ok(RoomEvent::PeerJoined { .. })
        ));
        let session = wait_session(&fx.connector, 0).await;
        assert!(!session.initiator);
        // The existing member offers first; we only answer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.calls().is_empty());
    }

    #[test_deadline::tokio_deadline_test]
    async fn early_signals_replay_into_the_link_that_adopts_them() {
        let mut fx = fixture();
        assert!(fx.coordinator.handle_signaling(SignalingEvent::Signal {
            from_user_id: "bob".to_string(),
            payload: offer("early"),
        }));
        assert_eq!(fx.coordinator.buffer.pending("bob"), 1);

        fx.coordinator.announce_and_adopt(bob(), LinkRole::Responder);
        assert_eq!(fx.coordinator.buffer.pending("bob"), 0);
        let session = wait_session(&fx.connector, 0).await;
        wait_until(
            || {
                session
                    .calls()
                    .contains(&MockCall::AcceptOffer("early".to_string()))
            },
            "the buffered offer to replay",
        )
        .await;
    }

    #[test_deadline::tokio_deadline_test]
    async fn signals_for_a_live_link_skip_the_buffer() {
        let mut fx = fixture();
        fx.coordinator.announce_and_adopt(bob(), LinkRole::Responder);
        let session = wait_session(&fx.connector, 0).await;

        assert!(fx.coordinator.handle_signaling(SignalingEvent::Signal {
            from_user_id: "bob".to_string(),
            payload: offer("direct"),
        }));
        assert_eq!(fx.coordinator.buffer.pending("bob"), 0);
        wait_until(
            || {
                session
                    .calls()
                    .contains(&MockCall::AcceptOffer("direct".to_string()))
            },
            "the delivered offer",
        )
        .await;
    }

    #[test_deadline::tokio_deadline_test]
    async fn malformed_signals_are_dropped_not_buffered() {
        let mut fx = fixture();
        assert!(fx.coordinator.handle_signaling(SignalingEvent::Signal {
            from_user_id: "bob".to_string(),
            payload: json!({"kind": "bogus"}),
        }));
        assert_eq!(fx.coordinator.buffer.pending("bob"), 0);
    }

    #[test_deadline::tokio_deadline_test]
    async fn departure_closes_the_link_and_discards_the_buffer() {
        let mut fx = fixture();
        fx.coordinator.announce_and_adopt(bob(), LinkRole::Responder);
        let session = wait_session(&fx.connector, 0).await;

        // A stale buffered signal from someone who then leaves.
        assert!(fx.coordinator.handle_signaling(SignalingEvent::Signal {
            from_user_id: "carol".to_string(),
            payload: offer("stale"),
        }));
        assert_eq!(fx.coordinator.buffer.pending("carol"), 1);
        assert!(fx.coordinator.handle_signaling(SignalingEvent::UserLeft {
            user_id: "carol".to_string(),
        }));
        assert_eq!(fx.coordinator.buffer.pending("carol"), 0);
        expect_peer_left(&mut fx.events, "carol").await;

        assert!(fx.coordinator.handle_signaling(SignalingEvent::UserLeft {
            user_id: "bob".to_string(),
        }));
        assert!(fx.coordinator.links.is_empty());
        expect_peer_left(&mut fx.events, "bob").await;
        wait_until(
            || session.calls().contains(&MockCall::Close),
            "the departed peer's link to close",
        )
        .await;
    }

    #[test_deadline::tokio_deadline_test]
    async fn a_rejoining_peer_gets_a_fresh_link() {
        let mut fx = fixture();
        assert!(fx.coordinator.handle_signaling(SignalingEvent::UserJoined(bob())));
        let first = wait_session(&fx.connector, 0).await;

        assert!(fx.coordinator.handle_signaling(SignalingEvent::UserJoined(bob())));
        let second = wait_session(&fx.connector, 1).await;
        assert!(second.initiator);
        assert_eq!(fx.coordinator.links.len(), 1);
        wait_until(
            || first.calls().contains(&MockCall::Close),
            "the stale link to close",
        )
        .await;
    }

    #[test_deadline::tokio_deadline_test]
    async fn replacing_media_updates_current_and_future_links() {
        let mut fx = fixture();
        fx.coordinator.announce_and_adopt(bob(), LinkRole::Responder);
        let session = wait_session(&fx.connector, 0).await;

        fx.coordinator
            .handle_command(RoomCommand::ReplaceMedia(TrackSource::Screen));
        wait_until(
            || {
                session
                    .calls()
                    .contains(&MockCall::ReplaceTrack(TrackSource::Screen))
            },
            "the track swap",
        )
        .await;
        assert_eq!(fx.coordinator.media.video, Some(TrackSource::Screen));
    }

    #[test_deadline::tokio_deadline_test]
    async fn chat_goes_out_through_signaling() {
        let mut fx = fixture();
        fx.coordinator
            .handle_command(RoomCommand::Chat("hello".to_string()));
        match fx.outbound.try_recv() {
            Ok(ClientMessage::Chat { text }) => assert_eq!(text, "hello"),
            other => panic!("expected the chat to go out, got {other:?}"),
        }
    }

    #[test_deadline::tokio_deadline_test]
    async fn losing_signaling_stops_the_room() {
        let mut fx = fixture();
        assert!(!fx.coordinator.handle_signaling(SignalingEvent::Closed));
        assert!(matches!(
            fx.events.try_recv(),
            Ok(RoomEvent::SignalingLost)
        ));
    }

    #[test_deadline::tokio_deadline_test]
    async fn teardown_closes_links_and_says_goodbye() {
        let mut fx = fixture();
        fx.coordinator.announce_and_adopt(bob(), LinkRole::Responder);
        let session = wait_session(&fx.connector, 0).await;
        assert!(fx.coordinator.handle_signaling(SignalingEvent::Signal {
            from_user_id: "carol".to_string(),
            payload: offer("stale"),
        }));

        fx.coordinator.teardown();
        assert!(fx.coordinator.links.is_empty());
        assert_eq!(fx.coordinator.buffer.pending("carol"), 0);
        wait_until(
            || session.calls().contains(&MockCall::Close),
            "the link to close",
        )
        .await;
        match fx.outbound.try_recv() {
            Ok(ClientMessage::LeaveRoom { room_id, user_id }) => {
                assert_eq!(room_id, "r1");
                assert_eq!(user_id, "me");
            }
            other => panic!("expected the goodbye, got {other:?}"),
        }
    }
}
