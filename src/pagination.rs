use crate::error::{ClientError, Result};
use crate::request::RequestBuilder;
use crate::resource::Resource;
use std::collections::{HashSet, VecDeque};
use tracing::debug;
use url::Url;

/// Lazily walks every page of a collection.
///
/// One page is fetched at a time, and only once its resources have all been
/// yielded is the next one requested. Later pages carry the headers of the
/// first request. A page URL that was already fetched is an error. After the
/// last page or the first error the iterator only returns `None`.
pub struct ResourceIter {
    next: Option<RequestBuilder>,
    visited: HashSet<Url>,
    buffer: VecDeque<Resource>,
    pages: u64,
    total_results: Option<u64>,
}

impl ResourceIter {
    pub(crate) fn new(first: RequestBuilder) -> Self {
        ResourceIter {
            next: Some(first),
            visited: HashSet::new(),
            buffer: VecDeque::new(),
            pages: 0,
            total_results: None,
        }
    }

    /// Number of pages fetched so far
    pub fn pages_fetched(&self) -> u64 {
        self.pages
    }

    /// Total reported by the last fetched page
    pub fn total_results(&self) -> Option<u64> {
        self.total_results
    }

    fn fetch(&mut self, request: RequestBuilder) -> Result<()> {
        if let Ok(url) = request.url() {
            if !self.visited.insert(url.clone()) {
                return Err(ClientError::PageRevisited(url.to_string()));
            }
        }
        let session = request.session().clone();
        let headers = request.headers().to_vec();
        let response = request.get()?;
        self.pages += 1;
        self.total_results = response.total_results();

        self.next = match response.next_url() {
            Some(next) => Some(RequestBuilder::to(session, next)?.with_headers(headers)),
            None => None,
        };
        debug!(
            page = self.pages,
            total_pages = response.total_pages(),
            more = self.next.is_some(),
            "fetched page"
        );
        self.buffer.extend(response.into_resources());
        Ok(())
    }
}

impl Iterator for ResourceIter {
    type Item = Result<Resource>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(resource) = self.buffer.pop_front() {
                return Some(Ok(resource));
            }
            let request = self.next.take()?;
            if let Err(e) = self.fetch(request) {
                self.next = None;
                return Some(Err(e));
            }
        }
    }
}

impl std::iter::FusedIterator for ResourceIter {}

impl std::fmt::Debug for ResourceIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceIter")
            .field("pages", &self.pages)
            .field("buffered", &self.buffer.len())
            .field("more", &self.next.is_some())
            .finish()
    }
}
