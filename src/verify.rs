use crate::config::{endpoint_url, Endpoints, VerifierConfig};
use crate::error::{ClientError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, DecodingKey, Header, Validation};
use reqwest::blocking::Client;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, warn};

/// A signed token whose signature, expiry, issuer and audience were checked.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// Decoded JOSE header
    pub header: Header,
    /// Verified claims
    pub claims: Map<String, Value>,
}

impl VerifiedToken {
    /// A claim by name
    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// The `sub` claim
    pub fn subject(&self) -> Option<&str> {
        self.claim("sub").and_then(Value::as_str)
    }

    /// The `user_name` claim issued by UAA for user tokens
    pub fn user_name(&self) -> Option<&str> {
        self.claim("user_name").and_then(Value::as_str)
    }

    /// Scopes from the `scope` claim
    pub fn scopes(&self) -> Vec<&str> {
        match self.claim("scope") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            Some(Value::String(s)) => s.split_whitespace().collect(),
            _ => Vec::new(),
        }
    }
}

/// Outcome of checking a request's bearer credentials.
#[derive(Debug, Clone)]
pub enum Verification {
    /// No audience is configured, so requests are not authenticated
    NoAuthRequired,
    /// The bearer token verified
    Verified(VerifiedToken),
    /// The bearer token is missing or failed verification
    VerificationFailed(String),
}

impl Verification {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Verification::VerificationFailed(_))
    }
}

/// Extract the token from an `Authorization: bearer <token>` header value
pub fn extract_bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

/// Signing keys keyed by issuer and key id, each trusted for a TTL.
pub(crate) struct KeyCache {
    config: VerifierConfig,
    keys: Mutex<HashMap<(String, String), CachedKey>>,
}

fn rejected(reason: impl Into<String>) -> ClientError {
    ClientError::TokenVerification(reason.into())
}

impl KeyCache {
    pub(crate) fn new(config: VerifierConfig) -> Self {
        KeyCache {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Verify `token` against the identity service of `endpoints`
    pub(crate) fn decode_and_verify(
        &self,
        http: &Client,
        endpoints: &Endpoints,
        token: &str,
        audience: &str,
    ) -> Result<VerifiedToken> {
        let header = decode_header(token).map_err(|e| rejected(format!("malformed token header: {e}")))?;
        if !self.config.allowed_algorithms.contains(&header.alg) {
            return Err(rejected(format!("algorithm {:?} is not accepted", header.alg)));
        }

        let issuer = unverified_issuer(token)?;
        let expected = endpoint_url(&endpoints.token, "oauth/token")?;
        if issuer != expected.as_str() {
            return Err(rejected(format!("unexpected issuer {issuer}")));
        }

        let kid = header.kid.clone().unwrap_or_default();
        let key = self.signing_key(http, endpoints, &issuer, &kid)?;

        let mut validation = Validation::new(header.alg);
        validation.set_audience(&[audience]);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        let data = decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| rejected(e.to_string()))?;

        Ok(VerifiedToken {
            header: data.header,
            claims: data.claims,
        })
    }

    fn cached(&self, issuer: &str, kid: &str) -> Option<DecodingKey> {
        let keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.get(&(issuer.to_string(), kid.to_string()))
            .filter(|cached| cached.fetched_at.elapsed() < self.config.key_ttl)
            .map(|cached| cached.key.clone())
    }

    fn signing_key(&self, http: &Client, endpoints: &Endpoints, issuer: &str, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.cached(issuer, kid) {
            return Ok(key);
        }
        self.fetch(http, endpoints, issuer)?;
        self.cached(issuer, kid)
            .ok_or_else(|| rejected(format!("no signing key with id {kid:?} for issuer {issuer}")))
    }

    fn fetch(&self, http: &Client, endpoints: &Endpoints, issuer: &str) -> Result<()> {
        let url = endpoint_url(&endpoints.token, "token_keys")?;
        debug!(url = %url, "fetching token signing keys");

        let response = http.get(url).header("Accept", "application/json").send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(rejected(format!("signing key endpoint returned {status}")));
        }
        let set: JwkSet = serde_json::from_slice(&response.bytes()?)
            .map_err(|e| rejected(format!("invalid signing key set: {e}")))?;

        let fetched_at = Instant::now();
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.retain(|(cached_issuer, _), _| cached_issuer != issuer);
        for jwk in &set.keys {
            let kid = jwk.common.key_id.clone().unwrap_or_default();
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert((issuer.to_string(), kid), CachedKey { key, fetched_at });
                }
                Err(e) => warn!(kid = %kid, error = %e, "skipping unusable signing key"),
            }
        }
        Ok(())
    }
}

/// Read the `iss` claim without verifying anything, to pick the key set
fn unverified_issuer(token: &str) -> Result<String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| rejected("token is not a three-part JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| rejected(format!("malformed token payload: {e}")))?;
    let claims: Value =
        serde_json::from_slice(&bytes).map_err(|e| rejected(format!("malformed token claims: {e}")))?;
    claims
        .get("iss")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| rejected("token has no issuer"))
}
