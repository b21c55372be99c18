//! Client side of a foyer room: signaling session, per-peer negotiation,
//! and the media seam. Join with [`RoomClient::join`], act through the
//! returned [`RoomHandle`], and react to the [`RoomEvent`] stream.

pub mod buffer;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod room;
pub mod signaling;

#[cfg(test)]
mod tests;

pub use config::LinkConfig;
pub use error::LinkError;
pub use media::{LocalMedia, MediaConnector, MediaEvent, MediaKind, MediaSession, RemoteMedia, TrackSource};
pub use peer::{LinkRole, LinkState, PeerLink};
pub use room::{JoinOptions, RoomClient, RoomEvent, RoomHandle};
pub use signaling::{JoinAck, SignalingClient, SignalingEvent};
