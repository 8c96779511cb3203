//! # cfclient - Cloud Foundry API client for Rust
//!
//! A blocking client for Cloud Foundry style platforms. It talks to the Cloud
//! Controller API, obtains and refreshes OAuth2 tokens from the identity
//! service (UAA), and reads application logs from the log stream.
//!
//! ## Features
//!
//! - OAuth2 password, client credentials, refresh token and authorization
//!   code grants, with single-flight token refresh shared across threads
//! - Fluent request builder with transparent retry after a token refresh
//! - Generic navigation of v2 and v3 resources, links and paginated
//!   collections
//! - Streaming multipart uploads (application bits)
//! - Real-time and recent logs decoded from protobuf envelopes
//! - Verification of signed tokens against the identity service's keys
//!
//! ## Basic Usage
//!
//! ```no_run
//! use cfclient::{CloudController, Config, Grant, Session};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(Config::parse("https://api.example.com")?)?;
//!     session.authenticate(Grant::password("admin", "secret"))?;
//!
//!     let cc = CloudController::new(session);
//!     for app in cc.request("/v2/apps")?.all() {
//!         let app = app?;
//!         println!("{} {}", app.guid().unwrap_or("?"), app.name().unwrap_or("?"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Logs
//!
//! ```no_run
//! # use cfclient::{CloudController, Config, Grant, Session};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let cc = CloudController::new(Session::new(Config::parse("https://api.example.com")?)?);
//! let mut stream = cc.log_stream("6e7b1f2a-4f0e-4c4b-9d4a-3c1b2a0f9e8d");
//! let stop = stream.close_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(30));
//!     stop.close();
//! });
//!
//! stream.connect()?;
//! stream.watch(|envelope| {
//!     if let cfclient::Payload::Log(log) = envelope.payload() {
//!         println!("[{}] {}", envelope.origin, log.text());
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod logstream;
pub mod multipart;
pub mod pagination;
pub mod request;
pub mod resource;
pub mod response;
pub mod session;
pub mod time;
pub mod token;
pub mod verify;

// Re-export main types for convenience
pub use client::CloudController;
pub use config::{Config, Endpoints, VerifierConfig};
pub use envelope::{Envelope, EventType, Payload};
pub use error::{ClientError, Result};
pub use logstream::{CloseHandle, LogStreamClient, StreamState};
pub use multipart::{FilePart, ResourceFingerprint};
pub use pagination::ResourceIter;
pub use request::RequestBuilder;
pub use resource::Resource;
pub use response::Response;
pub use session::{Info, Session};
pub use time::Time;
pub use token::{Grant, TokenSet};
pub use verify::{Verification, VerifiedToken};

// Re-export serde_json for convenience
pub use serde_json::json;
