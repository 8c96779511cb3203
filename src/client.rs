use crate::error::Result;
use crate::logstream::LogStreamClient;
use crate::multipart::{FilePart, ResourceFingerprint};
use crate::request::RequestBuilder;
use crate::resource::Resource;
use crate::response::Response;
use crate::session::{Info, Session};
use std::sync::Arc;
use tracing::info;

/// Entry point for navigating the Cloud Controller.
///
/// Cheap to clone; every clone shares the same session and therefore the
/// same tokens.
#[derive(Debug, Clone)]
pub struct CloudController {
    session: Arc<Session>,
}

impl CloudController {
    /// Wrap an authenticated session
    pub fn new(session: Session) -> Self {
        Self::from_shared(Arc::new(session))
    }

    /// Wrap a session that is shared with other users
    pub fn from_shared(session: Arc<Session>) -> Self {
        CloudController { session }
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The discovered endpoint document, when endpoints were discovered
    pub fn info(&self) -> Option<&Info> {
        self.session.info()
    }

    /// Build a request for an absolute URL or a path under the API endpoint,
    /// e.g. `/v2/apps` or a `next_url` returned by the server
    pub fn request(&self, target: &str) -> Result<RequestBuilder> {
        RequestBuilder::to(self.session.clone(), target)
    }

    /// Build a request for a named link of a resource (`routes`,
    /// `space`, `self`, ...). `None` when the resource has no such link.
    pub fn follow(&self, resource: &Resource, link: &str) -> Option<Result<RequestBuilder>> {
        resource.link(link).map(|target| self.request(target))
    }

    /// Upload application bits as a zip archive.
    ///
    /// `fingerprints` lists files the platform may already hold; they are
    /// matched server-side and left out of the archive. With `async_job`
    /// the server answers immediately with a job resource to poll.
    pub fn upload_bits(
        &self,
        app_guid: &str,
        archive: FilePart,
        fingerprints: &[ResourceFingerprint],
        async_job: bool,
    ) -> Result<Response> {
        info!(app_guid, filename = archive.filename(), size = archive.len(), "uploading application bits");
        let mut request = self
            .request("/v2/apps")?
            .path(app_guid)
            .path("bits")
            .add_field("resources", fingerprints)
            .add_file(archive);
        if async_job {
            request = request.set_query("async", "true");
        }
        request.put()
    }

    /// A log stream client for one application
    pub fn log_stream(&self, app_guid: &str) -> LogStreamClient {
        LogStreamClient::new(self.session.clone(), app_guid)
    }
}
