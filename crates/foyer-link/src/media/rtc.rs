//! Production [`MediaConnector`] backed by a WebRTC peer connection.
//!
//! The session keeps negotiation out of the peer connection until the link
//! commits it: `produce_offer` parks the offer locally, and only
//! `accept_answer` sets it as the local description. Losing a glare round is
//! then just dropping the parked offer, which the underlying stack could not
//! express as a rollback.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use foyer_proto::IceCandidate;

use super::{LocalMedia, MediaConnector, MediaEvent, MediaKind, MediaSession, RemoteMedia, TrackSource};
use crate::config::LinkConfig;
use crate::error::LinkError;

pub struct RtcConnector {
    stun_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(config: &LinkConfig) -> Self {
        Self {
            stun_servers: config.stun_servers.clone(),
        }
    }
}

#[async_trait]
impl MediaConnector for RtcConnector {
    async fn create(
        &self,
        _initiator: bool,
        media: &LocalMedia,
    ) -> Result<(Box<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), LinkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Default::default(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(MediaEvent::Candidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            }));
                        }
                        Err(err) => {
                            warn!(target: "link", error = %err, "failed to serialize local candidate")
                        }
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let _ = tx.send(MediaEvent::RemoteMedia(RemoteMedia::with_track(
                    track.id(),
                    kind,
                    track.clone(),
                )));
            })
        }));

        let tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                match state {
                    RTCPeerConnectionState::Connected => {
                        let _ = tx.send(MediaEvent::Ready);
                    }
                    RTCPeerConnectionState::Failed => {
                        let _ = tx.send(MediaEvent::Failed);
                    }
                    RTCPeerConnectionState::Closed => {
                        let _ = tx.send(MediaEvent::Closed);
                    }
                    _ => {}
                }
            })
        }));

        let tx = events_tx.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(MediaEvent::NegotiationNeeded);
            })
        }));

        if media.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio".to_owned(),
                "foyer".to_owned(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
        }
        let video_sender = match media.video {
            Some(source) => Some(pc.add_track(video_track(source)).await?),
            None => None,
        };

        let session = RtcSession {
            pc,
            pending_offer: Mutex::new(None),
            video_sender: Mutex::new(video_sender),
            closed: AtomicBool::new(false),
        };
        Ok((Box::new(session), events_rx))
    }
}

fn video_track(source: TrackSource) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        source.label().to_owned(),
        "foyer".to_owned(),
    ))
}

struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    /// Offer created but not yet set as local description. Committed by
    /// `accept_answer`, discarded by `abandon_offer`.
    pending_offer: Mutex<Option<RTCSessionDescription>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    closed: AtomicBool,
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn produce_offer(&self) -> Result<String, LinkError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        *self.pending_offer.lock() = Some(offer);
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, LinkError> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())?;
        self.pc.set_remote_description(offer).await?;
        let answer = self.pc.create_answer(None).await?;
        let rendered = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        Ok(rendered)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), LinkError> {
        let pending = self
            .pending_offer
            .lock()
            .take()
            .ok_or(LinkError::NoPendingOffer)?;
        self.pc.set_local_description(pending).await?;
        let answer = RTCSessionDescription::answer(sdp.to_owned())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn abandon_offer(&self) {
        if self.pending_offer.lock().take().is_some() {
            debug!(target: "link", "discarded uncommitted local offer");
        }
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await?;
        Ok(())
    }

    async fn replace_outgoing_track(&self, source: TrackSource) -> Result<(), LinkError> {
        let sender = self.video_sender.lock().clone();
        let Some(sender) = sender else {
            return Err(LinkError::Media(
                "no outgoing video track to replace".to_string(),
            ));
        };
        sender.replace_track(Some(video_track(source))).await?;
        debug!(target: "link", source = source.label(), "replaced outgoing video track");
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.pc.close().await {
                debug!(target: "link", error = %err, "peer connection close failed");
            }
        }
    }
}
