use crate::error::{ClientError, Result};
use jsonwebtoken::Algorithm;
use reqwest::blocking::{Client, ClientBuilder};
use std::time::Duration;
use url::Url;

/// Create the HTTP client for API and token requests
pub fn create_http_client(config: &Config) -> Result<Client> {
    let client = ClientBuilder::new()
        .pool_max_idle_per_host(50)
        .timeout(config.timeout)
        .connect_timeout(config.connect_timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .build()?;
    Ok(client)
}

/// Create the HTTP client for uploads, which have no overall deadline
pub fn create_upload_client(config: &Config) -> Result<Client> {
    let client = ClientBuilder::new()
        .pool_max_idle_per_host(50)
        .timeout(Duration::from_secs(3600)) // 1 hour
        .connect_timeout(config.connect_timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .build()?;
    Ok(client)
}

/// Append slash-separated path segments to a base URL, keeping any path
/// prefix the base already has (e.g. `https://host/uaa` + `oauth/token`)
pub fn endpoint_url(base: &Url, path: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ClientError::RequestBuild(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(path.split('/').filter(|s| !s.is_empty()));
    Ok(url)
}

/// Service endpoints used by a session.
///
/// Normally discovered from `GET /v2/info`, but can be given explicitly for
/// deployments that do not expose the info document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Cloud Controller API root
    pub api: Url,
    /// Identity service root (`authorization_endpoint`)
    pub authorization: Url,
    /// Token issuer URL (`token_endpoint`); defaults to the authorization root
    pub token: Url,
    /// Log stream root (`doppler_logging_endpoint`)
    pub logging: Option<Url>,
}

impl Endpoints {
    /// Endpoints where the token issuer is the authorization service itself
    pub fn new(api: Url, authorization: Url) -> Self {
        Endpoints {
            api,
            token: authorization.clone(),
            authorization,
            logging: None,
        }
    }

    /// Set the log stream endpoint
    pub fn with_logging(mut self, logging: Url) -> Self {
        self.logging = Some(logging);
        self
    }
}

/// Settings for signed token verification
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Signature algorithms accepted from token headers
    pub allowed_algorithms: Vec<Algorithm>,
    /// How long fetched signing keys are trusted before re-fetching
    pub key_ttl: Duration,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            allowed_algorithms: vec![Algorithm::RS256],
            key_ttl: Duration::from_secs(600),
        }
    }
}

/// Configuration for a Cloud Foundry session.
///
/// Built explicitly by the caller; reading environment variables or command
/// line flags is left to the embedding application.
#[derive(Debug, Clone)]
pub struct Config {
    /// Cloud Controller API root, e.g. `https://api.example.com`
    pub api_url: Url,
    /// OAuth2 client id
    pub client_id: String,
    /// OAuth2 client secret
    pub client_secret: String,
    /// Verify TLS certificates
    pub tls_verify: bool,
    /// Tokens this close to expiry are refreshed before use
    pub token_skew: Duration,
    /// Overall timeout for API requests
    pub timeout: Duration,
    /// Connect timeout for API requests and the log stream
    pub connect_timeout: Duration,
    /// Explicit endpoints; skips discovery when set
    pub endpoints: Option<Endpoints>,
    /// Token verification settings
    pub verifier: VerifierConfig,
}

impl Config {
    /// Create a new configuration for the given API root, using the default
    /// `cf` client with an empty secret
    pub fn new(api_url: Url) -> Self {
        Config {
            api_url,
            client_id: "cf".to_string(),
            client_secret: String::new(),
            tls_verify: true,
            token_skew: Duration::from_secs(30),
            timeout: Duration::from_secs(300), // 5 minutes
            connect_timeout: Duration::from_secs(10),
            endpoints: None,
            verifier: VerifierConfig::default(),
        }
    }

    /// Parse the API root from a string
    pub fn parse(api_url: &str) -> Result<Self> {
        Ok(Self::new(Url::parse(api_url)?))
    }

    /// Set the OAuth2 client credentials
    pub fn with_client(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self.client_secret = client_secret.into();
        self
    }

    /// Enable or disable TLS certificate verification
    pub fn with_tls_verify(mut self, tls_verify: bool) -> Self {
        self.tls_verify = tls_verify;
        self
    }

    /// Set the expiry safety margin
    pub fn with_token_skew(mut self, skew: Duration) -> Self {
        self.token_skew = skew;
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use explicit endpoints instead of discovery
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    /// Set token verification settings
    pub fn with_verifier(mut self, verifier: VerifierConfig) -> Self {
        self.verifier = verifier;
        self
    }
}
