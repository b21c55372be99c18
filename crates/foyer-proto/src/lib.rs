//! Wire protocol shared by the switchboard server and room clients.
//!
//! Every frame is a single JSON text message tagged by `type`. Signal
//! payloads travel as opaque JSON through the switchboard; only the two
//! endpoints of a peer link interpret them, via [`SignalPayload`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Messages a client sends to the switchboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Enter a room, creating it if it does not exist yet.
    JoinRoom {
        room_id: String,
        user_id: String,
        display_name: String,
    },
    /// Relay an opaque negotiation payload to one other user.
    Signal {
        room_id: String,
        target_user_id: String,
        payload: Value,
    },
    /// Exit a room without closing the connection.
    LeaveRoom { room_id: String, user_id: String },
    /// Broadcast a chat line to the rest of the sender's room.
    Chat { text: String },
    /// Heartbeat; the switchboard answers with [`ServerMessage::Pong`].
    Ping,
}

/// Messages the switchboard sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledgement for the first member of a room.
    RoomCreated { room_id: String },
    /// Join acknowledgement listing the members already present.
    ExistingUsers { users: Vec<RoomUser> },
    /// Another user entered the recipient's room.
    UserJoined {
        user_id: String,
        display_name: String,
    },
    /// A relayed negotiation payload from another user.
    Signal { from_user_id: String, payload: Value },
    /// Another user left the recipient's room.
    UserLeft { user_id: String },
    /// A chat line from another user in the room.
    Chat {
        from_user_id: String,
        display_name: String,
        text: String,
    },
    Pong,
    /// A request was rejected; the connection stays open.
    Error { message: String },
}

/// A room member as reported in join acknowledgements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUser {
    pub user_id: String,
    pub display_name: String,
}

/// The negotiation payloads peers exchange through [`ClientMessage::Signal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    /// Erase into the opaque form carried over the wire.
    pub fn to_value(&self) -> Result<Value, ProtoError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Interpret an opaque relayed payload.
    pub fn from_value(value: &Value) -> Result<Self, ProtoError> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// A trickled ICE candidate in the shape peer connections emit and accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}
