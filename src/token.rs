use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// An OAuth2 grant, consumed by exactly one token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// Resource owner password credentials
    Password { username: String, password: String },
    /// Client credentials only
    ClientCredentials,
    /// Refresh token exchange
    RefreshToken { refresh_token: String },
    /// Authorization code returned by the interactive login redirect
    AuthorizationCode {
        code: String,
        response_type: Option<String>,
        redirect_uri: Option<String>,
    },
}

impl Grant {
    /// Password grant
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Grant::Password {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Refresh token grant
    pub fn refresh_token(refresh_token: impl Into<String>) -> Self {
        Grant::RefreshToken {
            refresh_token: refresh_token.into(),
        }
    }

    /// Value of the `grant_type` form field
    pub fn grant_type(&self) -> &'static str {
        match self {
            Grant::Password { .. } => "password",
            Grant::ClientCredentials => "client_credentials",
            Grant::RefreshToken { .. } => "refresh_token",
            Grant::AuthorizationCode { .. } => "authorization_code",
        }
    }

    /// Form fields sent to the token endpoint
    pub(crate) fn into_form(self) -> Vec<(&'static str, String)> {
        let mut form = vec![("grant_type", self.grant_type().to_string())];
        match self {
            Grant::Password { username, password } => {
                form.push(("username", username));
                form.push(("password", password));
            }
            Grant::ClientCredentials => {}
            Grant::RefreshToken { refresh_token } => {
                form.push(("refresh_token", refresh_token));
            }
            Grant::AuthorizationCode {
                code,
                response_type,
                redirect_uri,
            } => {
                form.push(("code", code));
                if let Some(response_type) = response_type {
                    form.push(("response_type", response_type));
                }
                if let Some(redirect_uri) = redirect_uri {
                    form.push(("redirect_uri", redirect_uri));
                }
            }
        }
        form
    }
}

/// Raw token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
    pub expires_in: i64,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

/// Error body returned by the token endpoint
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Tokens held by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token for API requests
    pub access_token: String,

    /// Refresh token for renewing expired access tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// OpenID identity token, if the grant produced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Token type (usually "bearer")
    pub token_type: String,

    /// Granted scopes, space separated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Absolute expiry of the access token
    pub expires_at: DateTime<Utc>,
}

/// `issued_at` plus `expires_in` seconds, saturating at the bounds of
/// `DateTime` for lifetimes it cannot represent
fn expiry(issued_at: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    Duration::try_seconds(expires_in)
        .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
        .unwrap_or(if expires_in < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

impl TokenSet {
    /// Create a token set expiring `expires_in` seconds after `issued_at`
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
        issued_at: DateTime<Utc>,
    ) -> Self {
        TokenSet {
            access_token,
            refresh_token,
            id_token: None,
            token_type: "bearer".to_string(),
            scope: None,
            expires_at: expiry(issued_at, expires_in),
        }
    }

    pub(crate) fn from_response(response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        TokenSet {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            id_token: response.id_token,
            token_type: response.token_type,
            scope: response.scope,
            expires_at: expiry(issued_at, response.expires_in),
        }
    }

    /// Whether the token is expired at `now`, or will be within `skew`
    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: std::time::Duration) -> bool {
        let skew = Duration::from_std(skew).unwrap_or_else(|_| Duration::zero());
        self.expires_at
            .checked_sub_signed(skew)
            .map_or(true, |limit| now >= limit)
    }

    /// Check if we have a refresh token available
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Value for the `Authorization` header
    pub fn authorization(&self) -> String {
        format!("bearer {}", self.access_token)
    }
}
