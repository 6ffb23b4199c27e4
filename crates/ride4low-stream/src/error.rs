use tokio_tungstenite::tungstenite;

/// Failure to open or use a [`crate::TripEventStream`].
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("Event stream is already open for user {0}")]
    AlreadyOpen(String),
    #[error("Invalid event-stream URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("Failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}
