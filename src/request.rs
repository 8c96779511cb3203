use crate::config::endpoint_url;
use crate::error::{ClientError, Result};
use crate::multipart::{self, FilePart};
use crate::pagination::ResourceIter;
use crate::response::Response;
use crate::session::Session;
use indexmap::IndexMap;
use reqwest::blocking::RequestBuilder as HttpRequest;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use url::Url;

/// Resolve a request target: absolute URLs are used as-is, anything else is
/// a path (with optional query) under `base`
pub(crate) fn resolve(base: &Url, target: &str) -> Result<Url> {
    match Url::parse(target) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let (path, query) = match target.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (target, None),
            };
            let mut url = endpoint_url(base, path)?;
            url.set_query(query);
            Ok(url)
        }
        Err(e) => Err(e.into()),
    }
}

/// A request under construction.
///
/// Consumed by exactly one terminal call (`get`, `post`, `put`, `patch`,
/// `delete`, `get_by_name` or `all`). Errors from the building steps are
/// held back and reported by the terminal call.
pub struct RequestBuilder {
    session: Arc<Session>,
    url: Url,
    query: BTreeMap<String, String>,
    fields: IndexMap<String, Value>,
    files: Vec<FilePart>,
    headers: Vec<(String, String)>,
    error: Option<ClientError>,
}

impl RequestBuilder {
    /// Start a request for `url`. Query pairs already on the URL become
    /// regular query parameters.
    pub fn new(session: Arc<Session>, mut url: Url) -> Self {
        let query = url.query_pairs().into_owned().collect();
        url.set_query(None);
        RequestBuilder {
            session,
            url,
            query,
            fields: IndexMap::new(),
            files: Vec::new(),
            headers: Vec::new(),
            error: None,
        }
    }

    /// Start a request for an absolute URL or a path under the API endpoint
    pub fn to(session: Arc<Session>, target: &str) -> Result<Self> {
        let url = resolve(&session.endpoints().api, target)?;
        Ok(Self::new(session, url))
    }

    /// Append path segments
    pub fn path(mut self, path: &str) -> Self {
        match endpoint_url(&self.url, path) {
            Ok(url) => self.url = url,
            Err(e) => self.fail(e),
        }
        self
    }

    /// Merge query parameters; later values replace earlier ones
    pub fn set_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set one query parameter
    pub fn set_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Add a body field. Fields are sent in insertion order.
    pub fn add_field<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.fields.insert(key.into(), value);
            }
            Err(e) => self.fail(e.into()),
        }
        self
    }

    /// Attach a file; the body is then sent as multipart/form-data
    pub fn add_file(mut self, part: FilePart) -> Self {
        self.files.push(part);
        self
    }

    /// Add a request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Add every header of `headers`, in order
    pub(crate) fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    fn fail(&mut self, error: ClientError) {
        self.error.get_or_insert(error);
    }

    /// The URL the request will be sent to
    pub fn url(&self) -> Result<Url> {
        if let Some(e) = &self.error {
            return Err(ClientError::RequestBuild(e.to_string()));
        }
        Ok(self.full_url())
    }

    fn full_url(&self) -> Url {
        let mut url = self.url.clone();
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.query {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    /// The session this request authenticates with
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Send as GET
    pub fn get(self) -> Result<Response> {
        self.send(Method::GET)
    }

    /// Send as POST, with the fields as body
    pub fn post(self) -> Result<Response> {
        self.send(Method::POST)
    }

    /// Send as PUT, with the fields as body
    pub fn put(self) -> Result<Response> {
        self.send(Method::PUT)
    }

    /// Send as PATCH, with the fields as body
    pub fn patch(self) -> Result<Response> {
        self.send(Method::PATCH)
    }

    /// Send as DELETE
    pub fn delete(self) -> Result<Response> {
        self.send(Method::DELETE)
    }

    /// List resources filtered by name (`q=name:<value>`). An empty
    /// collection is a valid answer and means no such resource.
    pub fn get_by_name(self, name: &str) -> Result<Response> {
        self.set_query("q", format!("name:{name}")).get()
    }

    /// Iterate over every resource of a collection, following pages lazily
    pub fn all(self) -> ResourceIter {
        ResourceIter::new(self)
    }

    fn send(mut self, method: Method) -> Result<Response> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let url = self.full_url();
        let session = Arc::clone(&self.session);
        let response = session.send_authorized(
            &mut self,
            |request, token| request.attempt(&method, &url, token),
            |request| request.files.iter().all(FilePart::is_replayable),
        )?;
        check(response)
    }

    fn attempt(&mut self, method: &Method, url: &Url, token: &str) -> Result<Response> {
        let http = if self.files.is_empty() {
            self.session.http()
        } else {
            self.session.upload_http()
        };

        let mut request = http
            .request(method.clone(), url.clone())
            .header("Authorization", format!("bearer {token}"))
            .header("Accept", "application/json");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let request = self.with_body(request)?;

        let start = Instant::now();
        let http_response = request.send()?;
        let status = http_response.status().as_u16();
        let headers = http_response.headers().clone();
        let body = http_response.bytes()?;

        debug!(
            method = %method,
            url = %url,
            status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "request"
        );

        Response::from_parts(status, headers, body.to_vec())
    }

    fn with_body(&mut self, request: HttpRequest) -> Result<HttpRequest> {
        if !self.files.is_empty() {
            let form = multipart::form(&self.fields, &mut self.files)?;
            return Ok(request.multipart(form));
        }
        if !self.fields.is_empty() {
            let body = serde_json::to_vec(&self.fields)?;
            return Ok(request.header("Content-Type", "application/json").body(body));
        }
        Ok(request)
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("url", &self.full_url().as_str())
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("files", &self.files)
            .finish()
    }
}

fn check(response: Response) -> Result<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(ClientError::from_response(response))
    }
}
