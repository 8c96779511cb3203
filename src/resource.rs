use crate::time::Time;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

/// One item returned by the Cloud Controller.
///
/// The schema is open-ended, so attributes stay a JSON document and every
/// accessor returns an `Option`. Both API shapes are understood:
///
/// - v2: `{"metadata": {"guid", "url", ...}, "entity": {"name", "spaces_url", ...}}`
/// - v3: `{"guid", "name", ..., "links": {"spaces": {"href": ...}}}`
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    attributes: Value,
    links: BTreeMap<String, String>,
}

impl Resource {
    /// Wrap a JSON document, extracting its link mapping
    pub fn new(attributes: Value) -> Self {
        let links = extract_links(&attributes);
        Resource { attributes, links }
    }

    /// The resource GUID
    pub fn guid(&self) -> Option<&str> {
        self.attributes
            .pointer("/metadata/guid")
            .or_else(|| self.attributes.get("guid"))
            .and_then(Value::as_str)
    }

    /// The resource name, for kinds that have one
    pub fn name(&self) -> Option<&str> {
        self.field("name").and_then(Value::as_str)
    }

    /// The resource's own URL
    pub fn url(&self) -> Option<&str> {
        self.link("self")
    }

    /// Creation time from the resource metadata
    pub fn created_at(&self) -> Option<Time> {
        self.attributes
            .pointer("/metadata/created_at")
            .or_else(|| self.attributes.get("created_at"))
            .and_then(Value::as_str)
            .and_then(Time::parse)
    }

    /// A named related-resource URL, e.g. `link("spaces")` resolves
    /// `entity.spaces_url` (v2) or `links.spaces.href` (v3)
    pub fn link(&self, name: &str) -> Option<&str> {
        self.links.get(name).map(String::as_str)
    }

    /// All related-resource URLs by name
    pub fn links(&self) -> &BTreeMap<String, String> {
        &self.links
    }

    /// A top-level attribute of the resource body: the v2 `entity` member
    /// first, then the document root
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.attributes
            .get("entity")
            .and_then(|entity| entity.get(key))
            .or_else(|| self.attributes.get(key))
    }

    /// Get a value by a slash-separated path from the document root,
    /// e.g. `attribute("entity/space_guid")` or `attribute("relationships/space/data/guid")`
    pub fn attribute(&self, path: &str) -> Option<&Value> {
        lookup(&self.attributes, path)
    }

    /// Get a string value by a slash-separated path
    pub fn attribute_str(&self, path: &str) -> Option<&str> {
        self.attribute(path).and_then(Value::as_str)
    }

    /// The underlying JSON document
    pub fn raw(&self) -> &Value {
        &self.attributes
    }

    /// Deserialize the resource into a typed structure
    pub fn apply<T>(&self) -> Result<T, crate::error::ClientError>
    where
        T: serde::de::DeserializeOwned,
    {
        Ok(T::deserialize(&self.attributes)?)
    }

    /// Consume the resource and return its JSON document
    pub fn into_inner(self) -> Value {
        self.attributes
    }
}

/// Walk a slash-separated path through objects and arrays
pub(crate) fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for part in path.split('/').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn extract_links(attributes: &Value) -> BTreeMap<String, String> {
    let mut links = BTreeMap::new();

    if let Some(url) = attributes.pointer("/metadata/url").and_then(Value::as_str) {
        links.insert("self".to_string(), url.to_string());
    }

    if let Some(Value::Object(entity)) = attributes.get("entity") {
        for (key, value) in entity {
            if let (Some(name), Some(url)) = (key.strip_suffix("_url"), value.as_str()) {
                links.insert(name.to_string(), url.to_string());
            }
        }
    }

    if let Some(Value::Object(map)) = attributes.get("links") {
        for (name, link) in map {
            if let Some(href) = link.get("href").and_then(Value::as_str) {
                links.insert(name.clone(), href.to_string());
            }
        }
    }

    links
}

impl From<Value> for Resource {
    fn from(value: Value) -> Self {
        Resource::new(value)
    }
}

impl Serialize for Resource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.attributes.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Resource::new)
    }
}
