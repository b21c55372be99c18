//! Seam between negotiation logic and the media transport.
//!
//! A [`MediaConnector`] builds one [`MediaSession`] per peer link. The
//! session owns the underlying connection; negotiation state stays in the
//! link, which drives the session through these calls and reacts to the
//! session's [`MediaEvent`] stream. The production connector lives in
//! [`rtc`]; [`mock`] ships a scripted one for tests and embedders.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use foyer_proto::IceCandidate;

use crate::error::LinkError;

pub mod mock;
pub mod rtc;

/// What the local participant shares on each link.
#[derive(Debug, Clone)]
pub struct LocalMedia {
    pub audio: bool,
    pub video: Option<TrackSource>,
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(TrackSource::Camera),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Camera,
    Screen,
}

impl TrackSource {
    pub fn label(&self) -> &'static str {
        match self {
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// A remote track surfaced to the application. The rendering layer holds
/// this by reference; the link that produced it owns the connection.
#[derive(Clone)]
pub struct RemoteMedia {
    pub id: String,
    pub kind: MediaKind,
    pub track: Option<Arc<TrackRemote>>,
}

impl RemoteMedia {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            track: None,
        }
    }

    pub fn with_track(id: impl Into<String>, kind: MediaKind, track: Arc<TrackRemote>) -> Self {
        Self {
            id: id.into(),
            kind,
            track: Some(track),
        }
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Notifications a session pushes back to its link.
#[derive(Debug)]
pub enum MediaEvent {
    /// A local candidate to trickle to the remote side.
    Candidate(IceCandidate),
    /// A remote track arrived.
    RemoteMedia(RemoteMedia),
    /// The transport reached its connected state.
    Ready,
    /// The transport failed; the link stays up in case it recovers.
    Failed,
    /// The transport closed underneath the link.
    Closed,
    /// The transport wants a fresh offer/answer cycle.
    NegotiationNeeded,
}

/// One peer's media connection, exclusively owned by its link.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Create a local offer but do not commit it yet; the link commits by
    /// calling [`MediaSession::accept_answer`] or discards it with
    /// [`MediaSession::abandon_offer`] when it loses a glare round.
    async fn produce_offer(&self) -> Result<String, LinkError>;

    /// Apply a remote offer and return the local answer, committed.
    async fn accept_offer(&self, sdp: &str) -> Result<String, LinkError>;

    /// Commit the outstanding local offer, then apply the remote answer.
    async fn accept_answer(&self, sdp: &str) -> Result<(), LinkError>;

    /// Discard the outstanding local offer, if any.
    async fn abandon_offer(&self);

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError>;

    /// Swap the outgoing video track without tearing the connection down.
    async fn replace_outgoing_track(&self, source: TrackSource) -> Result<(), LinkError>;

    /// Idempotent.
    async fn close(&self);
}

/// Factory for media sessions, one per peer link.
#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn create(
        &self,
        initiator: bool,
        media: &LocalMedia,
    ) -> Result<(Box<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), LinkError>;
}
