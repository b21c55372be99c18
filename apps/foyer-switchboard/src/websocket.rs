//! Websocket signaling endpoint: accepts client connections, tracks their
//! room membership, and relays negotiation payloads between members.
//!
//! Each connection gets an unbounded outbound channel drained by a writer
//! task, so routing never waits on a slow socket. Membership mutation and
//! message fan-out are computed synchronously from in-memory state; the only
//! awaits happen on the sockets themselves.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

use foyer_proto::{ClientMessage, RoomUser, ServerMessage};

use crate::config::Config;
use crate::registry::{generate_connection_id, RoomRegistry};

/// The room and user a connection most recently joined as.
#[derive(Debug, Clone)]
struct RoomIdentity {
    room_id: String,
    user_id: String,
}

/// Server-side state for one live websocket.
struct ConnectionHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_seen: Arc<RwLock<Instant>>,
    identity: Option<RoomIdentity>,
    /// Dropped with the handle. The reader loop watches for that drop, so
    /// removing a connection from the map also hangs up its socket.
    hangup: watch::Sender<()>,
}

/// A signal in flight from one member toward another.
struct SignalEnvelope {
    from_user_id: String,
    target_user_id: String,
    room_id: String,
    payload: Value,
}

#[derive(Clone)]
pub struct SwitchboardState {
    pub registry: RoomRegistry,
    connections: Arc<DashMap<String, ConnectionHandle>>,
    config: Config,
}

impl SwitchboardState {
    pub fn new(config: Config) -> Self {
        let state = Self {
            registry: RoomRegistry::new(),
            connections: Arc::new(DashMap::new()),
            config,
        };
        state.spawn_monitor();
        state
    }

    /// Periodically drop connections that stopped sending pings, running
    /// their departures through the same path as a closed socket.
    fn spawn_monitor(&self) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(state.config.heartbeat_interval));
            let timeout = Duration::from_secs(state.config.heartbeat_timeout);
            loop {
                interval.tick().await;
                // Snapshot the clocks so no map guard is held across an await.
                let clocks: Vec<(String, Arc<RwLock<Instant>>)> = state
                    .connections
                    .iter()
                    .map(|entry| (entry.key().clone(), entry.value().last_seen.clone()))
                    .collect();
                let mut stale = Vec::new();
                for (connection_id, last_seen) in clocks {
                    if last_seen.read().await.elapsed() > timeout {
                        stale.push(connection_id);
                    }
                }
                for connection_id in stale {
                    info!("dropping idle connection: {}", connection_id);
                    state.cleanup_connection(&connection_id);
                }
            }
        });
    }

    /// Forget a connection and broadcast `user-left` for every membership it
    /// held. Shared by socket teardown and the idle monitor.
    fn cleanup_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        for departure in self.registry.remove_by_connection(connection_id) {
            info!(
                "user {} disconnected from room {}",
                departure.user_id, departure.room_id
            );
            self.broadcast_to_room(
                &departure.room_id,
                None,
                ServerMessage::UserLeft {
                    user_id: departure.user_id.clone(),
                },
            );
        }
    }

    fn broadcast_to_room(&self, room_id: &str, except_user: Option<&str>, message: ServerMessage) {
        for member in self.registry.members(room_id) {
            if except_user.is_some_and(|skip| skip == member.user_id) {
                continue;
            }
            self.send_to_connection(&member.connection_id, message.clone());
        }
    }

    fn send_to_connection(&self, connection_id: &str, message: ServerMessage) {
        match self.connections.get(connection_id) {
            Some(handle) => {
                if handle.tx.send(message).is_err() {
                    debug!("outbound channel closed for connection {}", connection_id);
                }
            }
            None => debug!("no live connection {}", connection_id),
        }
    }

    /// Forward a signal to its target, preferring the claimed room and then
    /// searching globally. An unreachable target is dropped quietly: the
    /// sender will hear about the departure through `user-left` instead.
    fn route_signal(&self, envelope: SignalEnvelope) {
        match self
            .registry
            .find_member(&envelope.room_id, &envelope.target_user_id)
        {
            Some(member) => self.send_to_connection(
                &member.connection_id,
                ServerMessage::Signal {
                    from_user_id: envelope.from_user_id,
                    payload: envelope.payload,
                },
            ),
            None => debug!(
                "dropping signal from {} to unknown user {}",
                envelope.from_user_id, envelope.target_user_id
            ),
        }
    }

    fn identity_of(&self, connection_id: &str) -> Option<RoomIdentity> {
        self.connections
            .get(connection_id)
            .and_then(|handle| handle.identity.clone())
    }
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<SwitchboardState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SwitchboardState) {
    let connection_id = generate_connection_id();
    info!("websocket connected: {}", connection_id);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (hangup, mut hung_up) = watch::channel(());
    state.connections.insert(
        connection_id.clone(),
        ConnectionHandle {
            tx: tx.clone(),
            last_seen: Arc::new(RwLock::new(Instant::now())),
            identity: None,
            hangup,
        },
    );

    // Writer task: drains the outbound channel until every sender is gone,
    // then completes the closing handshake.
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => error!("failed to serialize server message: {}", err),
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        // Reaping the handle drops its hangup watch, which ends this loop
        // even when the client never closes its side.
        let incoming = tokio::select! {
            next = ws_rx.next() => next,
            _ = hung_up.changed() => {
                debug!("connection {} reaped, hanging up", connection_id);
                None
            }
        };
        let Some(result) = incoming else { break };
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    if let Err(err) =
                        handle_client_message(message, &connection_id, &state, &tx).await
                    {
                        error!("error handling message from {}: {}", connection_id, err);
                    }
                }
                Err(err) => {
                    warn!("unparseable message from {}: {}", connection_id, err);
                    let _ = tx.send(ServerMessage::Error {
                        message: format!("unparseable message: {err}"),
                    });
                }
            },
            Ok(Message::Close(_)) => {
                debug!("close frame from {}", connection_id);
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!("websocket error from {}: {}", connection_id, err);
                break;
            }
        }
    }

    state.cleanup_connection(&connection_id);
    drop(tx);
    info!("websocket disconnected: {}", connection_id);
}

async fn handle_client_message(
    message: ClientMessage,
    connection_id: &str,
    state: &SwitchboardState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::JoinRoom {
            room_id,
            user_id,
            display_name,
        } => {
            match state
                .registry
                .join(&room_id, &user_id, connection_id, &display_name)
            {
                Ok(outcome) => {
                    match state.connections.get_mut(connection_id) {
                        Some(mut handle) => {
                            handle.identity = Some(RoomIdentity {
                                room_id: room_id.clone(),
                                user_id: user_id.clone(),
                            });
                        }
                        None => {
                            // The idle monitor can reap a connection between
                            // frames. Undo the join so peers never learn about
                            // a member nothing can route to.
                            warn!("dropping join from reaped connection {}", connection_id);
                            if state.registry.leave(&room_id, &user_id) {
                                state.broadcast_to_room(
                                    &room_id,
                                    None,
                                    ServerMessage::UserLeft { user_id },
                                );
                            }
                            return Ok(());
                        }
                    }
                    info!(
                        "user {} joined room {} ({} already present)",
                        user_id,
                        room_id,
                        outcome.existing.len()
                    );
                    if outcome.created_room {
                        tx.send(ServerMessage::RoomCreated {
                            room_id: room_id.clone(),
                        })?;
                    } else {
                        tx.send(ServerMessage::ExistingUsers {
                            users: outcome
                                .existing
                                .iter()
                                .map(|member| RoomUser {
                                    user_id: member.user_id.clone(),
                                    display_name: member.display_name.clone(),
                                })
                                .collect(),
                        })?;
                    }
                    state.broadcast_to_room(
                        &room_id,
                        Some(&user_id),
                        ServerMessage::UserJoined {
                            user_id: user_id.clone(),
                            display_name,
                        },
                    );
                }
                Err(err) => {
                    warn!("rejected join of room {}: {}", room_id, err);
                    tx.send(ServerMessage::Error {
                        message: err.to_string(),
                    })?;
                }
            }
        }
        ClientMessage::Signal {
            room_id,
            target_user_id,
            payload,
        } => {
            let Some(identity) = state.identity_of(connection_id) else {
                debug!(
                    "dropping signal from connection {} with no membership",
                    connection_id
                );
                return Ok(());
            };
            state.route_signal(SignalEnvelope {
                from_user_id: identity.user_id,
                target_user_id,
                room_id,
                payload,
            });
        }
        ClientMessage::LeaveRoom { room_id, user_id } => {
            if state.registry.leave(&room_id, &user_id) {
                info!("user {} left room {}", user_id, room_id);
                if let Some(mut handle) = state.connections.get_mut(connection_id) {
                    let owned = handle
                        .identity
                        .as_ref()
                        .is_some_and(|id| id.room_id == room_id && id.user_id == user_id);
                    if owned {
                        handle.identity = None;
                    }
                }
                state.broadcast_to_room(&room_id, None, ServerMessage::UserLeft { user_id });
            }
        }
        ClientMessage::Chat { text } => {
            let Some(identity) = state.identity_of(connection_id) else {
                debug!(
                    "dropping chat from connection {} with no membership",
                    connection_id
                );
                return Ok(());
            };
            let Some(member) = state
                .registry
                .member_in_room(&identity.room_id, &identity.user_id)
            else {
                return Ok(());
            };
            state.broadcast_to_room(
                &identity.room_id,
                Some(&identity.user_id),
                ServerMessage::Chat {
                    from_user_id: member.user_id,
                    display_name: member.display_name,
                    text,
                },
            );
        }
        ClientMessage::Ping => {
            let last_seen = state
                .connections
                .get(connection_id)
                .map(|handle| handle.last_seen.clone());
            if let Some(last_seen) = last_seen {
                *last_seen.write().await = Instant::now();
            }
            tx.send(ServerMessage::Pong)?;
        }
    }
    Ok(())
}
