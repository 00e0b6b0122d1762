use std::time::Duration;

/// Everything that can go wrong while authorizing or calling the API.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("invalid url given")]
    InvalidUrl,
    #[error("failed to bind redirect listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no authorization redirect received within {0:?}")]
    Timeout(Duration),
    #[error("authorization denied: {reason}")]
    AuthorizationDenied { reason: String },
    #[error(
        "token exchange failed: {reason}{}",
        .description.as_deref().map(|d| format!(" ({})", d)).unwrap_or_default()
    )]
    TokenExchange {
        reason: String,
        description: Option<String>,
    },
    #[error("redirect listener has not been started")]
    ListenerNotStarted,
    #[error("redirect listener closed before a redirect was captured")]
    ListenerClosed,
    #[error("api request failed with status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("an IO error occured: {0}")]
    IO(#[from] std::io::Error),
}

/// Crate-wide result, defaulting to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
