use crate::response::Response;
use thiserror::Error;

/// Main error type for Cloud Foundry client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, timeout or other transport failure. Safe to retry.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Grant rejected by the identity service
    #[error("authentication failed ({status}): {error}{}", describe(.description))]
    Auth {
        status: u16,
        error: String,
        description: Option<String>,
    },

    /// Access token rejected and the request could not be replayed
    #[error("access token expired")]
    TokenExpired,

    /// Error status returned by the resource API
    #[error("API error {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
        response: Box<Response>,
    },

    /// Response body is not valid JSON
    #[error("failed to parse response body (status {status}): {source}")]
    Parse {
        status: u16,
        body: String,
        #[source]
        source: serde_json::Error,
    },

    /// A collection's next page points back to a page already fetched
    #[error("pagination revisits {0}")]
    PageRevisited(String),

    /// Signed token failed verification
    #[error("token verification failed: {0}")]
    TokenVerification(String),

    /// Log envelope could not be decoded
    #[error("malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Log stream transport failure
    #[error("log stream error: {0}")]
    Stream(Box<tungstenite::Error>),

    /// Operation not allowed in the current log stream state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// No token has been issued to this session yet
    #[error("session is not authenticated")]
    NotAuthenticated,

    #[error("no refresh token available and access token has expired")]
    NoRefreshToken,

    /// Request building error
    #[error("failed to build request: {0}")]
    RequestBuild(String),

    /// URL parsing error
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create an API error from a failed Response
    pub fn from_response(response: Response) -> Self {
        let status = response.status();
        let code = response.error_code();
        let message = response
            .error_message()
            .unwrap_or_else(|| format!("request failed with status {status}"));

        ClientError::Api {
            status,
            code,
            message,
            response: Box::new(response),
        }
    }

    /// Check if this error is a permission denied error (403)
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ClientError::Api { status: 403, .. })
    }

    /// Check if this error is a not found error (404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status: 404, .. })
    }

    /// Whether the caller may retry the same operation as-is
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Get the HTTP status code if the error carries one
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. }
            | ClientError::Auth { status, .. }
            | ClientError::Parse { status, .. } => Some(*status),
            ClientError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

fn describe(description: &Option<String>) -> String {
    description
        .as_deref()
        .map(|d| format!(": {d}"))
        .unwrap_or_default()
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        ClientError::Stream(Box::new(err))
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
