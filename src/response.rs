use crate::error::{ClientError, Result};
use crate::resource::{lookup, Resource};
use reqwest::header::HeaderMap;
use serde_json::Value;

/// A parsed HTTP response from the Cloud Controller.
///
/// A body carrying a `resources` array is a collection response; anything
/// else is a single-resource response.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    raw: Vec<u8>,
    body: Value,
}

impl Response {
    /// Build a response from its status, headers and raw body.
    ///
    /// An empty body parses as `null`. A body that is not JSON is a
    /// [`ClientError::Parse`] on success statuses; on failure statuses it is
    /// kept as a string so the API error still carries the server's text.
    pub fn from_parts(status: u16, headers: HeaderMap, raw: Vec<u8>) -> Result<Self> {
        let body = if raw.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            match serde_json::from_slice(&raw) {
                Ok(body) => body,
                Err(_) if status >= 400 => Value::String(String::from_utf8_lossy(&raw).into_owned()),
                Err(source) => {
                    return Err(ClientError::Parse {
                        status,
                        body: String::from_utf8_lossy(&raw).into_owned(),
                        source,
                    })
                }
            }
        };

        Ok(Response {
            status,
            headers,
            raw,
            body,
        })
    }

    /// A response whose body is not JSON; only the raw bytes are kept
    pub(crate) fn from_binary(status: u16, headers: HeaderMap, raw: Vec<u8>) -> Self {
        Response {
            status,
            headers,
            raw,
            body: Value::Null,
        }
    }

    /// HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Raw body bytes
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Parsed JSON body
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Whether the body is a resource collection
    pub fn is_collection(&self) -> bool {
        matches!(self.body.get("resources"), Some(Value::Array(_)))
    }

    /// Resources of a collection response, in server order.
    /// Empty for single-resource responses.
    pub fn resources(&self) -> Vec<Resource> {
        match self.body.get("resources") {
            Some(Value::Array(items)) => items.iter().cloned().map(Resource::new).collect(),
            _ => Vec::new(),
        }
    }

    /// The first resource of a collection, or the body itself for a
    /// single-resource response
    pub fn resource(&self) -> Option<Resource> {
        match self.body.get("resources") {
            Some(Value::Array(items)) => items.first().cloned().map(Resource::new),
            _ if self.body.is_object() => Some(Resource::new(self.body.clone())),
            _ => None,
        }
    }

    /// Consume a collection response into its resources
    pub fn into_resources(self) -> Vec<Resource> {
        match self.body {
            Value::Object(mut map) => match map.remove("resources") {
                Some(Value::Array(items)) => items.into_iter().map(Resource::new).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Structured error code of a failed response
    pub fn error_code(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        ["error_code", "errors/0/title", "error"]
            .iter()
            .find_map(|path| lookup(&self.body, path).and_then(Value::as_str))
            .map(str::to_string)
    }

    /// Human readable error message of a failed response
    pub fn error_message(&self) -> Option<String> {
        if self.is_success() {
            return None;
        }
        if let Value::String(text) = &self.body {
            return Some(text.trim().to_string()).filter(|t| !t.is_empty());
        }
        ["description", "errors/0/detail", "error_description", "message"]
            .iter()
            .find_map(|path| lookup(&self.body, path).and_then(Value::as_str))
            .map(str::to_string)
    }

    /// URL of the next page, if any (`next_url` in v2, `pagination.next.href` in v3)
    pub fn next_url(&self) -> Option<&str> {
        self.body
            .get("next_url")
            .and_then(Value::as_str)
            .or_else(|| self.body.pointer("/pagination/next/href").and_then(Value::as_str))
    }

    /// Total number of pages of the collection
    pub fn total_pages(&self) -> Option<u64> {
        self.body
            .get("total_pages")
            .or_else(|| self.body.pointer("/pagination/total_pages"))
            .and_then(Value::as_u64)
    }

    /// Total number of results of the collection
    pub fn total_results(&self) -> Option<u64> {
        self.body
            .get("total_results")
            .or_else(|| self.body.pointer("/pagination/total_results"))
            .and_then(Value::as_u64)
    }

    /// Deserialize the body into the provided type
    pub fn json<T>(&self) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        Ok(T::deserialize(&self.body)?)
    }

    /// Get a value from the body by a slash-separated path.
    /// For example, "entity/name" accesses the "name" field inside "entity".
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.body, path)
    }

    /// Get a string value from the body by a slash-separated path
    pub fn get_string(&self, path: &str) -> Option<String> {
        self.get(path).and_then(Value::as_str).map(str::to_string)
    }
}
