//! Signaling client behavior against a scripted in-process switchboard.
//! The fake server acknowledges a join with whatever the script says,
//! optionally pushes follow-up messages, and records everything it receives.

use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use foyer_proto::{ClientMessage, RoomUser, ServerMessage, SignalPayload};

use crate::error::LinkError;
use crate::signaling::{SignalingClient, SignalingEvent};

// Long enough that no heartbeat fires mid-test.
const HEARTBEAT: Duration = Duration::from_secs(600);

#[derive(Clone)]
struct Script {
    ack: ServerMessage,
    after_ack: Vec<ServerMessage>,
    close_after_ack: bool,
    seen: mpsc::UnboundedSender<ClientMessage>,
}

impl Script {
    fn new(ack: ServerMessage) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (seen, seen_rx) = mpsc::unbounded_channel();
        (
            Self {
                ack,
                after_ack: Vec::new(),
                close_after_ack: false,
                seen,
            },
            seen_rx,
        )
    }

    fn then_push(mut self, message: ServerMessage) -> Self {
        self.after_ack.push(message);
        self
    }

    fn then_close(mut self) -> Self {
        self.close_after_ack = true;
        self
    }
}

async fn serve(script: Script) -> String {
    let app = Router::new().route(
        "/ws",
        get(move |ws: WebSocketUpgrade| {
            let script = script.clone();
            async move { ws.on_upgrade(move |socket| run_script(socket, script)) }
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake switchboard");
    let addr = listener.local_addr().expect("fake switchboard address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}")
}

async fn run_script(mut socket: WebSocket, script: Script) {
    while let Some(Ok(frame)) = socket.recv().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
            continue;
        };
        let is_join = matches!(message, ClientMessage::JoinRoom { .. });
        let _ = script.seen.send(message);
        if is_join {
            send_json(&mut socket, &script.ack).await;
            for push in &script.after_ack {
                send_json(&mut socket, push).await;
            }
            if script.close_after_ack {
                return;
            }
        }
    }
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage) {
    let json = serde_json::to_string(message).expect("encodable server message");
    let _ = socket.send(WsMessage::Text(json)).await;
}

fn user(user_id: &str, display_name: &str) -> RoomUser {
    RoomUser {
        user_id: user_id.to_string(),
        display_name: display_name.to_string(),
    }
}

#[test_deadline::tokio_deadline_test]
async fn join_is_acknowledged_with_the_existing_roster() {
    let (script, mut seen) = Script::new(ServerMessage::ExistingUsers {
        users: vec![user("bob", "Bob")],
    });
    let url = serve(script).await;

    let (client, ack, _events) = SignalingClient::connect(&url, "r1", "me", "Me", HEARTBEAT)
        .await
        .expect("join should succeed");
    assert!(!ack.is_first);
    assert_eq!(ack.existing.len(), 1);
    assert_eq!(ack.existing[0].user_id, "bob");
    assert_eq!(client.room_id(), "r1");
    assert_eq!(client.user_id(), "me");

    match seen.recv().await.expect("server saw nothing") {
        ClientMessage::JoinRoom {
            room_id,
            user_id,
            display_name,
        } => {
            assert_eq!(room_id, "r1");
            assert_eq!(user_id, "me");
            assert_eq!(display_name, "Me");
        }
        other => panic!("expected a join, got {other:?}"),
    }
}

#[test_deadline::tokio_deadline_test]
async fn first_joiner_learns_the_room_is_new() {
    let (script, _seen) = Script::new(ServerMessage::RoomCreated {
        room_id: "r1".to_string(),
    });
    let url = serve(script).await;

    let (_client, ack, _events) = SignalingClient::connect(&url, "r1", "me", "Me", HEARTBEAT)
        .await
        .expect("join should succeed");
    assert!(ack.is_first);
    assert!(ack.existing.is_empty());
}

#[test_deadline::tokio_deadline_test]
async fn join_rejection_surfaces_the_server_error() {
    let (script, _seen) = Script::new(ServerMessage::Error {
        message: "userId must not be empty".to_string(),
    });
    let url = serve(script).await;

    let err = SignalingClient::connect(&url, "r1", "", "Me", HEARTBEAT)
        .await
        .expect_err("join should be rejected");
    match err {
        LinkError::JoinRejected(message) => assert!(message.contains("userId")),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[test_deadline::tokio_deadline_test]
async fn server_pushes_become_events_in_order() {
    let offer = SignalPayload::Offer {
        sdp: "remote-offer".to_string(),
    };
    let (script, _seen) = Script::new(ServerMessage::RoomCreated {
        room_id: "r1".to_string(),
    });
    let script = script
        .then_push(ServerMessage::UserJoined {
            user_id: "carol".to_string(),
            display_name: "Carol".to_string(),
        })
        .then_push(ServerMessage::Signal {
            from_user_id: "carol".to_string(),
            payload: offer.to_value().expect("encodable payload"),
        })
        .then_push(ServerMessage::Chat {
            from_user_id: "carol".to_string(),
            display_name: "Carol".to_string(),
            text: "hi".to_string(),
        })
        .then_push(ServerMessage::UserLeft {
            user_id: "carol".to_string(),
        });
    let url = serve(script).await;

    let (_client, _ack, mut events) = SignalingClient::connect(&url, "r1", "me", "Me", HEARTBEAT)
        .await
        .expect("join should succeed");

    match events.recv().await.expect("no first event") {
        SignalingEvent::UserJoined(joined) => assert_eq!(joined.user_id, "carol"),
        other => panic!("unexpected event: {other:?}"),
    }
    match events.recv().await.expect("no second event") {
        SignalingEvent::Signal {
            from_user_id,
            payload,
        } => {
            assert_eq!(from_user_id, "carol");
            assert_eq!(
                SignalPayload::from_value(&payload).expect("decodable payload"),
                offer
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match events.recv().await.expect("no third event") {
        SignalingEvent::Chat {
            from_user_id, text, ..
        } => {
            assert_eq!(from_user_id, "carol");
            assert_eq!(text, "hi");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    match events.recv().await.expect("no fourth event") {
        SignalingEvent::UserLeft { user_id } => assert_eq!(user_id, "carol"),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test_deadline::tokio_deadline_test]
async fn relayed_signals_carry_room_and_target() {
    let (script, mut seen) = Script::new(ServerMessage::RoomCreated {
        room_id: "r1".to_string(),
    });
    let url = serve(script).await;

    let (client, _ack, _events) = SignalingClient::connect(&url, "r1", "me", "Me", HEARTBEAT)
        .await
        .expect("join should succeed");
    client.sink().send(
        "bob",
        &SignalPayload::Offer {
            sdp: "local-offer".to_string(),
        },
    );

    // First the join announcement, then our signal.
    seen.recv().await.expect("server saw no join");
    match seen.recv().await.expect("server saw no signal") {
        ClientMessage::Signal {
            room_id,
            target_user_id,
            payload,
        } => {
            assert_eq!(room_id, "r1");
            assert_eq!(target_user_id, "bob");
            assert_eq!(
                SignalPayload::from_value(&payload).expect("decodable payload"),
                SignalPayload::Offer {
                    sdp: "local-offer".to_string()
                }
            );
        }
        other => panic!("expected a signal, got {other:?}"),
    }
}

#[test_deadline::tokio_deadline_test]
async fn server_close_surfaces_as_a_closed_event() {
    let (script, _seen) = Script::new(ServerMessage::RoomCreated {
        room_id: "r1".to_string(),
    });
    let url = serve(script.then_close()).await;

    let (_client, _ack, mut events) = SignalingClient::connect(&url, "r1", "me", "Me", HEARTBEAT)
        .await
        .expect("join should succeed");
    match events.recv().await.expect("event stream ended early") {
        SignalingEvent::Closed => {}
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test_deadline::tokio_deadline_test]
async fn leaving_announces_the_departure() {
    let (script, mut seen) = Script::new(ServerMessage::RoomCreated {
        room_id: "r1".to_string(),
    });
    let url = serve(script).await;

    let (client, _ack, _events) = SignalingClient::connect(&url, "r1", "me", "Me", HEARTBEAT)
        .await
        .expect("join should succeed");
    client.leave();

    seen.recv().await.expect("server saw no join");
    match seen.recv().await.expect("server saw no leave") {
        ClientMessage::LeaveRoom { room_id, user_id } => {
            assert_eq!(room_id, "r1");
            assert_eq!(user_id, "me");
        }
        other => panic!("expected a leave, got {other:?}"),
    }
}
