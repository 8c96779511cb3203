use crate::config::{create_http_client, create_upload_client, endpoint_url, Config, Endpoints};
use crate::error::{ClientError, Result};
use crate::response::Response;
use crate::token::{Grant, TokenErrorResponse, TokenResponse, TokenSet};
use crate::verify::{extract_bearer_token, KeyCache, Verification, VerifiedToken};
use chrono::Utc;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{debug, info};
use url::Url;

/// The `GET /v2/info` discovery document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    pub authorization_endpoint: String,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub doppler_logging_endpoint: Option<String>,
    #[serde(default)]
    pub min_cli_version: Option<String>,
}

impl Info {
    /// Endpoints announced by the info document
    pub fn endpoints(&self, api: Url) -> Result<Endpoints> {
        let authorization = Url::parse(&self.authorization_endpoint)?;
        let token = match &self.token_endpoint {
            Some(token) => Url::parse(token)?,
            None => authorization.clone(),
        };
        let logging = self
            .doppler_logging_endpoint
            .as_deref()
            .map(Url::parse)
            .transpose()?;
        Ok(Endpoints {
            api,
            authorization,
            token,
            logging,
        })
    }
}

#[derive(Default)]
struct TokenState {
    tokens: Option<TokenSet>,
    /// Client credentials sessions get no refresh token and re-run the grant
    client_credentials: bool,
}

/// An authenticated session with the Cloud Controller and its identity service.
///
/// Shared between threads behind an `Arc`. The token state is the only
/// mutable part; it sits behind one mutex that is held for the whole refresh
/// exchange, so concurrent callers that find the token expired wait for a
/// single refresh and then reuse its result. Refresh tokens may be
/// single-use, so two concurrent refreshes would invalidate each other.
pub struct Session {
    config: Config,
    endpoints: Endpoints,
    info: Option<Info>,
    http: Client,
    upload_http: Client,
    state: Mutex<TokenState>,
    keys: KeyCache,
}

impl Session {
    /// Create a session, discovering endpoints from `GET /v2/info` unless the
    /// configuration already names them
    pub fn new(config: Config) -> Result<Self> {
        let http = create_http_client(&config)?;
        let (endpoints, info) = match config.endpoints.clone() {
            Some(endpoints) => (endpoints, None),
            None => {
                let info = discover(&http, &config.api_url)?;
                (info.endpoints(config.api_url.clone())?, Some(info))
            }
        };
        Self::build(config, endpoints, info, http)
    }

    /// Create a session with explicit endpoints, without any network call
    pub fn with_endpoints(config: Config, endpoints: Endpoints) -> Result<Self> {
        let http = create_http_client(&config)?;
        Self::build(config, endpoints, None, http)
    }

    fn build(config: Config, endpoints: Endpoints, info: Option<Info>, http: Client) -> Result<Self> {
        Ok(Session {
            upload_http: create_upload_client(&config)?,
            keys: KeyCache::new(config.verifier.clone()),
            config,
            endpoints,
            info,
            http,
            state: Mutex::new(TokenState::default()),
        })
    }

    /// Session configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Endpoints in use
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// The discovery document, if endpoints were discovered
    pub fn info(&self) -> Option<&Info> {
        self.info.as_ref()
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn upload_http(&self) -> &Client {
        &self.upload_http
    }

    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exchange a grant for tokens and store them in the session
    pub fn authenticate(&self, grant: Grant) -> Result<TokenSet> {
        let client_credentials = matches!(grant, Grant::ClientCredentials);
        let mut state = self.lock_state();
        let tokens = self.exchange(grant)?;
        state.tokens = Some(tokens.clone());
        state.client_credentials = client_credentials;
        Ok(tokens)
    }

    /// Restore previously issued tokens, e.g. a persisted refresh token
    pub fn set_tokens(&self, tokens: TokenSet) {
        let mut state = self.lock_state();
        state.tokens = Some(tokens);
        state.client_credentials = false;
    }

    /// Current tokens, if any
    pub fn tokens(&self) -> Option<TokenSet> {
        self.lock_state().tokens.clone()
    }

    /// Return a valid access token, refreshing it first if it is expired or
    /// within the configured skew of expiry
    pub fn ensure_valid(&self) -> Result<String> {
        let mut state = self.lock_state();
        let current = state.tokens.as_ref().ok_or(ClientError::NotAuthenticated)?;
        if !current.is_expired_at(Utc::now(), self.config.token_skew) {
            return Ok(current.access_token.clone());
        }

        debug!("access token expired, refreshing");
        let refreshed = self.renew(&state)?;
        let access_token = refreshed.access_token.clone();
        state.tokens = Some(refreshed);
        Ok(access_token)
    }

    /// Refresh after the server rejected `stale_access_token`.
    ///
    /// When another caller already replaced that token, the replacement is
    /// returned without a second refresh.
    pub fn force_refresh(&self, stale_access_token: &str) -> Result<String> {
        let mut state = self.lock_state();
        let current = state.tokens.as_ref().ok_or(ClientError::NotAuthenticated)?;
        if current.access_token != stale_access_token {
            return Ok(current.access_token.clone());
        }

        debug!("access token rejected, forcing refresh");
        let refreshed = self.renew(&state)?;
        let access_token = refreshed.access_token.clone();
        state.tokens = Some(refreshed);
        Ok(access_token)
    }

    /// Send with a valid access token. A 401 answer forces one refresh and
    /// one resend, and a second 401 becomes `ClientError::Auth`.
    ///
    /// `replayable` is asked before resending; when it says no, the 401
    /// becomes `ClientError::TokenExpired` without a refresh.
    pub(crate) fn send_authorized<T>(
        &self,
        target: &mut T,
        mut send: impl FnMut(&mut T, &str) -> Result<Response>,
        replayable: impl Fn(&T) -> bool,
    ) -> Result<Response> {
        let token = self.ensure_valid()?;
        let response = send(target, &token)?;
        if response.status() != 401 {
            return Ok(response);
        }

        if !replayable(target) {
            debug!("request rejected and its body cannot be replayed");
            return Err(ClientError::TokenExpired);
        }
        let token = self.force_refresh(&token)?;
        let response = send(target, &token)?;
        if response.status() == 401 {
            return Err(ClientError::Auth {
                status: 401,
                error: response.error_code().unwrap_or_else(|| "unauthorized".to_string()),
                description: response.error_message(),
            });
        }
        Ok(response)
    }

    /// Obtain new tokens for the current state. Called with the state lock held.
    fn renew(&self, state: &TokenState) -> Result<TokenSet> {
        let current = state.tokens.as_ref().ok_or(ClientError::NotAuthenticated)?;

        if let Some(refresh_token) = current.refresh_token.clone().filter(|t| !t.is_empty()) {
            let mut refreshed = self.exchange(Grant::refresh_token(refresh_token.clone()))?;
            // Identity providers that do not rotate keep the old refresh token valid
            if refreshed.refresh_token.is_none() {
                refreshed.refresh_token = Some(refresh_token);
            }
            info!(expires_at = %refreshed.expires_at, "refreshed access token");
            return Ok(refreshed);
        }

        if state.client_credentials {
            let renewed = self.exchange(Grant::ClientCredentials)?;
            info!(expires_at = %renewed.expires_at, "renewed client credentials token");
            return Ok(renewed);
        }

        Err(ClientError::NoRefreshToken)
    }

    /// POST a grant to the token endpoint
    fn exchange(&self, grant: Grant) -> Result<TokenSet> {
        let url = endpoint_url(&self.endpoints.authorization, "oauth/token")?;
        let grant_type = grant.grant_type();
        let mut form = grant.into_form();
        form.push(("client_id", self.config.client_id.clone()));

        let start = Instant::now();
        let issued_at = Utc::now();
        let response = self
            .http
            .post(url.clone())
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("Accept", "application/json")
            .form(&form)
            .send()?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes()?;

        debug!(
            url = %url,
            grant_type,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "token exchange"
        );

        if status.is_client_error() {
            let error: TokenErrorResponse = serde_json::from_slice(&body).unwrap_or_default();
            return Err(ClientError::Auth {
                status: status.as_u16(),
                error: error.error.unwrap_or_else(|| "unauthorized".to_string()),
                description: error.error_description,
            });
        }
        if !status.is_success() {
            let response = Response::from_parts(status.as_u16(), headers, body.to_vec())?;
            return Err(ClientError::from_response(response));
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|source| ClientError::Parse {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
            source,
        })?;
        info!(grant_type, "obtained access token");
        Ok(TokenSet::from_response(token, issued_at))
    }

    /// URL that starts an interactive login. The identity service redirects
    /// back to `redirect_uri` with a code for [`Session::exchange_authorization_code`].
    pub fn authorization_code_url(&self, response_type: &str, scope: &[&str], redirect_uri: &str) -> Result<Url> {
        let mut url = endpoint_url(&self.endpoints.authorization, "oauth/authorize")?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("response_type", response_type)
            .append_pair("redirect_uri", redirect_uri);
        if !scope.is_empty() {
            url.query_pairs_mut().append_pair("scope", &scope.join(" "));
        }
        Ok(url)
    }

    /// Exchange an authorization code; the returned tokens carry the
    /// identity token when one was issued
    pub fn exchange_authorization_code(
        &self,
        code: &str,
        response_type: &str,
        redirect_uri: &str,
    ) -> Result<TokenSet> {
        self.authenticate(Grant::AuthorizationCode {
            code: code.to_string(),
            response_type: Some(response_type.to_string()),
            redirect_uri: Some(redirect_uri.to_string()),
        })
    }

    /// Verify a signed token issued by this session's identity service:
    /// signature against the issuer's published keys, expiry and audience
    pub fn decode_and_verify(&self, token: &str, audience: &str) -> Result<VerifiedToken> {
        self.keys.decode_and_verify(&self.http, &self.endpoints, token, audience)
    }

    /// Check the `Authorization` header of an incoming request.
    ///
    /// Without an audience there is nothing to verify against and the result
    /// is [`Verification::NoAuthRequired`].
    pub fn verify_bearer(&self, authorization: Option<&str>, audience: Option<&str>) -> Verification {
        let Some(audience) = audience else {
            return Verification::NoAuthRequired;
        };
        let Some(token) = authorization.and_then(extract_bearer_token) else {
            return Verification::VerificationFailed("missing bearer token".to_string());
        };
        match self.decode_and_verify(token, audience) {
            Ok(verified) => Verification::Verified(verified),
            Err(e) => Verification::VerificationFailed(e.to_string()),
        }
    }
}

fn discover(http: &Client, api: &Url) -> Result<Info> {
    let url = endpoint_url(api, "v2/info")?;
    let response = http.get(url.clone()).header("Accept", "application/json").send()?;
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let response = Response::from_parts(status, headers, response.bytes()?.to_vec())?;
    debug!(url = %url, status, "endpoint discovery");
    if !response.is_success() {
        return Err(ClientError::from_response(response));
    }
    response.json()
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("endpoints", &self.endpoints)
            .field("client_id", &self.config.client_id)
            .field("tokens", &"<redacted>")
            .finish()
    }
}
