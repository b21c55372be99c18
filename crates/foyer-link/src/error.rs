use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("join rejected by switchboard: {0}")]
    JoinRejected(String),

    #[error("timed out waiting for a join acknowledgement")]
    JoinTimeout,

    #[error("signaling connection closed")]
    SignalingClosed,

    #[error("invalid switchboard url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("no outstanding local offer to commit")]
    NoPendingOffer,

    #[error("media error: {0}")]
    Media(String),
}

impl From<webrtc::Error> for LinkError {
    fn from(err: webrtc::Error) -> Self {
        LinkError::Media(err.to_string())
    }
}
