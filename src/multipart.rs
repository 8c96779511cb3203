//! Streaming `multipart/form-data` request bodies, and splitting of
//! multipart responses into their parts.

use crate::error::{ClientError, Result};
use indexmap::IndexMap;
use reqwest::blocking::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where a file part reads its content from
enum FileSource {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
    /// One-shot stream, taken by the first body that is built
    Reader(Option<Box<dyn Read + Send>>),
}

/// A file to be sent as one part of a multipart body.
pub struct FilePart {
    field: String,
    filename: String,
    mime: String,
    len: Option<u64>,
    source: FileSource,
}

impl FilePart {
    /// A file on disk; it is opened when the body is built and read while
    /// the request is sent
    pub fn from_path(field: impl Into<String>, path: impl AsRef<Path>, mime: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let len = std::fs::metadata(path)?.len();
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(FilePart {
            field: field.into(),
            filename,
            mime: mime.into(),
            len: Some(len),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// In-memory content
    pub fn from_bytes(
        field: impl Into<String>,
        filename: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        mime: impl Into<String>,
    ) -> Self {
        let bytes: Arc<[u8]> = bytes.into().into();
        FilePart {
            field: field.into(),
            filename: filename.into(),
            mime: mime.into(),
            len: Some(bytes.len() as u64),
            source: FileSource::Bytes(bytes),
        }
    }

    /// Content from an arbitrary reader. The reader can only be sent once,
    /// so a request carrying it cannot be replayed after a token refresh.
    pub fn from_reader<R>(
        field: impl Into<String>,
        filename: impl Into<String>,
        reader: R,
        mime: impl Into<String>,
        len: Option<u64>,
    ) -> Self
    where
        R: Read + Send + 'static,
    {
        FilePart {
            field: field.into(),
            filename: filename.into(),
            mime: mime.into(),
            len,
            source: FileSource::Reader(Some(Box::new(reader))),
        }
    }

    /// Form field name
    pub fn field(&self) -> &str {
        &self.field
    }

    /// File name sent in the part headers
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Content length, if known
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// Whether the content can be read again for a retried request
    pub fn is_replayable(&self) -> bool {
        match &self.source {
            FileSource::Path(_) | FileSource::Bytes(_) => true,
            FileSource::Reader(reader) => reader.is_some(),
        }
    }

    fn open(&mut self) -> Result<Box<dyn Read + Send>> {
        match &mut self.source {
            FileSource::Path(path) => Ok(Box::new(File::open(path)?)),
            FileSource::Bytes(bytes) => Ok(Box::new(Cursor::new(Arc::clone(bytes)))),
            FileSource::Reader(reader) => reader.take().ok_or_else(|| {
                ClientError::RequestBuild(format!("content of file part {:?} was already sent", self.field))
            }),
        }
    }

    /// Open the content as a form part, sized when the length is known
    fn to_part(&mut self) -> Result<Part> {
        let reader = self.open()?;
        let part = match self.len {
            Some(len) => Part::reader_with_length(reader, len),
            None => Part::reader(reader),
        };
        part.file_name(self.filename.clone())
            .mime_str(&self.mime)
            .map_err(|e| ClientError::RequestBuild(format!("invalid content type {:?}: {e}", self.mime)))
    }
}

impl std::fmt::Debug for FilePart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePart")
            .field("field", &self.field)
            .field("filename", &self.filename)
            .field("mime", &self.mime)
            .field("len", &self.len)
            .finish()
    }
}

/// One entry of the resource-fingerprint list sent with application bits.
/// Files the platform already holds are matched by these and not uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceFingerprint {
    #[serde(rename = "fn")]
    pub path: String,
    pub size: u64,
    pub sha1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Build the multipart/form-data body for a request. Fields carry their
/// JSON encoding, except plain strings which are sent as-is. File contents
/// are streamed from their sources while the request is written.
pub(crate) fn form(fields: &IndexMap<String, Value>, files: &mut [FilePart]) -> Result<Form> {
    let mut form = Form::new();
    for (key, value) in fields {
        let text = match value {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        form = form.text(key.clone(), text);
    }
    for file in files.iter_mut() {
        let part = file.to_part()?;
        form = form.part(file.field.clone(), part);
    }
    Ok(form)
}

/// Extract the `boundary` parameter of a multipart `Content-Type`
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("boundary")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

/// Split a multipart body into the bodies of its parts, in order.
/// Part headers are dropped.
pub fn parse_parts<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut parts = Vec::new();

    let Some(mut start) = find(body, &delimiter, 0) else {
        return parts;
    };
    loop {
        let after = start + delimiter.len();
        if body[after..].starts_with(b"--") {
            break;
        }
        let Some(next) = find(body, &delimiter, after) else {
            break;
        };

        let part = &body[after..next];
        let part = part.strip_prefix(b"\r\n").unwrap_or(part);
        let part = part.strip_suffix(b"\r\n").unwrap_or(part);
        // A part without headers starts with the blank line
        let content = match part.strip_prefix(b"\r\n") {
            Some(content) => content,
            None => match find(part, b"\r\n\r\n", 0) {
                Some(end) => &part[end + 4..],
                None => part,
            },
        };
        parts.push(content);
        start = next;
    }
    parts
}
