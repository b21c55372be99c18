//! Websocket session with the switchboard.
//!
//! `connect` dials the server, joins the room, and hands back the join
//! acknowledgement plus a stream of everything the server pushes afterwards.
//! A writer task owns the socket sink so sends never block callers, and a
//! heartbeat task keeps the server's idle monitor satisfied.

use std::sync::Mutex;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};
use tracing::{debug, info, trace, warn};
use url::Url;

use foyer_proto::{ClientMessage, RoomUser, ServerMessage, SignalPayload};

use crate::error::LinkError;

const JOIN_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// What the switchboard said when we joined.
#[derive(Debug)]
pub struct JoinAck {
    pub is_first: bool,
    pub existing: Vec<RoomUser>,
}

/// Everything the server pushes after the join acknowledgement.
#[derive(Debug)]
pub enum SignalingEvent {
    UserJoined(RoomUser),
    Signal { from_user_id: String, payload: Value },
    UserLeft { user_id: String },
    Chat {
        from_user_id: String,
        display_name: String,
        text: String,
    },
    /// The socket closed; no further events will arrive.
    Closed,
}

#[derive(Debug)]
pub struct SignalingClient {
    local_user_id: String,
    room_id: String,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingClient {
    pub async fn connect(
        server_url: &str,
        room_id: &str,
        user_id: &str,
        display_name: &str,
        heartbeat_interval: Duration,
    ) -> Result<(Self, JoinAck, mpsc::UnboundedReceiver<SignalingEvent>), LinkError> {
        let url = derive_ws_url(server_url)?;
        debug!(target: "link", url = %url, "connecting to switchboard");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();
        let (ack_tx, ack_rx) = oneshot::channel::<Result<JoinAck, LinkError>>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(target: "link", error = %err, "failed to encode outbound message");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut ack_slot = Some(ack_tx);
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<ServerMessage>(&text) {
                            Ok(message) => {
                                dispatch_server_message(message, &mut ack_slot, &event_tx)
                            }
                            Err(err) => {
                                warn!(target: "link", error = %err, "unparseable server message")
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(target: "link", "switchboard closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(
                        tungstenite::Error::ConnectionClosed
                        | tungstenite::Error::AlreadyClosed
                        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                    ) => {
                        debug!(target: "link", "signaling socket closed");
                        break;
                    }
                    Err(err) => {
                        warn!(target: "link", error = %err, "signaling socket error");
                        break;
                    }
                }
            }
            let _ = event_tx.send(SignalingEvent::Closed);
        });

        let heartbeat = {
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(heartbeat_interval);
                // The first tick fires immediately; skip it, we just joined.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if outbound.send(ClientMessage::Ping).is_err() {
                        break;
                    }
                }
            })
        };

        let client = Self {
            local_user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            outbound,
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        };

        client
            .outbound
            .send(ClientMessage::JoinRoom {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
            })
            .map_err(|_| LinkError::SignalingClosed)?;

        let ack = match tokio::time::timeout(JOIN_ACK_TIMEOUT, ack_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(LinkError::SignalingClosed),
            Err(_) => return Err(LinkError::JoinTimeout),
        };
        info!(
            target: "link",
            room = %room_id,
            user = %user_id,
            first = ack.is_first,
            "joined room"
        );
        Ok((client, ack, event_rx))
    }

    pub fn user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn sink(&self) -> SignalSink {
        SignalSink {
            outbound: self.outbound.clone(),
            room_id: self.room_id.clone(),
        }
    }

    pub fn send_chat(&self, text: &str) -> Result<(), LinkError> {
        self.outbound
            .send(ClientMessage::Chat {
                text: text.to_string(),
            })
            .map_err(|_| LinkError::SignalingClosed)
    }

    /// Announce departure. Best effort: if the socket is already gone the
    /// server reaps us through its disconnect path instead.
    pub fn leave(&self) {
        let _ = self.outbound.send(ClientMessage::LeaveRoom {
            room_id: self.room_id.clone(),
            user_id: self.local_user_id.clone(),
        });
    }

    #[cfg(test)]
    pub(crate) fn stub(
        room_id: &str,
        user_id: &str,
    ) -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_user_id: user_id.to_string(),
                room_id: room_id.to_string(),
                outbound,
                tasks: Mutex::new(Vec::new()),
            },
            rx,
        )
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// Fire-and-forget path for negotiation payloads; cheap to clone into every
/// peer link.
#[derive(Clone)]
pub struct SignalSink {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    room_id: String,
}

impl SignalSink {
    #[cfg(test)]
    pub(crate) fn for_tests(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        room_id: &str,
    ) -> Self {
        Self {
            outbound,
            room_id: room_id.to_string(),
        }
    }

    pub fn send(&self, target_user_id: &str, payload: &SignalPayload) {
        let value = match payload.to_value() {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "link", error = %err, "failed to encode signal payload");
                return;
            }
        };
        trace!(
            target: "link",
            to = %target_user_id,
            kind = payload.kind(),
            "sending signal"
        );
        let message = ClientMessage::Signal {
            room_id: self.room_id.clone(),
            target_user_id: target_user_id.to_string(),
            payload: value,
        };
        if self.outbound.send(message).is_err() {
            debug!(target: "link", "signaling channel closed, dropping outbound signal");
        }
    }
}

fn dispatch_server_message(
    message: ServerMessage,
    ack_slot: &mut Option<oneshot::Sender<Result<JoinAck, LinkError>>>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
) {
    match message {
        ServerMessage::RoomCreated { room_id } => match ack_slot.take() {
            Some(ack) => {
                let _ = ack.send(Ok(JoinAck {
                    is_first: true,
                    existing: Vec::new(),
                }));
            }
            None => debug!(target: "link", room = %room_id, "unexpected room-created, ignoring"),
        },
        ServerMessage::ExistingUsers { users } => match ack_slot.take() {
            Some(ack) => {
                let _ = ack.send(Ok(JoinAck {
                    is_first: false,
                    existing: users,
                }));
            }
            None => debug!(target: "link", "unexpected existing-users, ignoring"),
        },
        ServerMessage::Error { message } => match ack_slot.take() {
            Some(ack) => {
                let _ = ack.send(Err(LinkError::JoinRejected(message)));
            }
            None => warn!(target: "link", message = %message, "switchboard reported an error"),
        },
        ServerMessage::UserJoined {
            user_id,
            display_name,
        } => {
            let _ = events.send(SignalingEvent::UserJoined(RoomUser {
                user_id,
                display_name,
            }));
        }
        ServerMessage::Signal {
            from_user_id,
            payload,
        } => {
            let _ = events.send(SignalingEvent::Signal {
                from_user_id,
                payload,
            });
        }
        ServerMessage::UserLeft { user_id } => {
            let _ = events.send(SignalingEvent::UserLeft { user_id });
        }
        ServerMessage::Chat {
            from_user_id,
            display_name,
            text,
        } => {
            let _ = events.send(SignalingEvent::Chat {
                from_user_id,
                display_name,
                text,
            });
        }
        ServerMessage::Pong => trace!(target: "link", "pong"),
    }
}

fn derive_ws_url(raw: &str) -> Result<Url, LinkError> {
    let mut url = Url::parse(raw)?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| LinkError::UnsupportedScheme("http".to_string()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| LinkError::UnsupportedScheme("https".to_string()))?,
        other => return Err(LinkError::UnsupportedScheme(other.to_string())),
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}
