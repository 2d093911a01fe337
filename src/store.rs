//! Object store used for the local list copy and user-editable PAC templates.
//!
//! Objects are addressed by path-like names and carry HTTP-style headers;
//! every read reports a `Last-Modified` header in [`DATE_FORMAT`].

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use hyper::header::{HeaderMap, HeaderValue, LAST_MODIFIED};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Textual date format of the `Last-Modified` header.
pub const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {0:?} not found")]
    NotFound(String),

    #[error("store I/O on {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    fn from_io(name: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(name.to_string())
        } else {
            Self::Io {
                name: name.to_string(),
                source,
            }
        }
    }
}

/// A stored object: its headers and full content.
#[derive(Debug, Clone)]
pub struct Object {
    pub headers: HeaderMap,
    pub content: Bytes,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, name: &str) -> Result<Object, StoreError>;

    /// Metadata-only read.
    async fn head(&self, name: &str) -> Result<HeaderMap, StoreError>;

    async fn put(&self, name: &str, headers: HeaderMap, content: Bytes) -> Result<(), StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

pub fn format_date(at: DateTime<Utc>) -> String {
    at.format(DATE_FORMAT).to_string()
}

pub fn parse_date(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, DATE_FORMAT).map(|naive| naive.and_utc())
}

/// Reads the `Last-Modified` header, if present.
///
/// `None` when the header is missing; `Some(Err(_))` when it does not parse.
pub fn last_modified(headers: &HeaderMap) -> Option<Result<DateTime<Utc>, String>> {
    let value = headers.get(LAST_MODIFIED)?;
    Some(
        value
            .to_str()
            .map_err(|e| e.to_string())
            .and_then(|s| parse_date(s).map_err(|e| format!("{s:?}: {e}"))),
    )
}

fn last_modified_headers(at: DateTime<Utc>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format_date(at)) {
        headers.insert(LAST_MODIFIED, value);
    }
    headers
}

/// Store backed by a directory on the local filesystem.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(name.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || relative.as_os_str().is_empty() {
            return Err(StoreError::Io {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "invalid object name"),
            });
        }
        Ok(self.root.join(relative))
    }

    async fn stat(&self, name: &str, path: &Path) -> Result<HeaderMap, StoreError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| StoreError::from_io(name, e))?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(last_modified_headers(modified))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get(&self, name: &str) -> Result<Object, StoreError> {
        let path = self.path_for(name)?;
        let headers = self.stat(name, &path).await?;
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))?;
        Ok(Object {
            headers,
            content: Bytes::from(content),
        })
    }

    async fn head(&self, name: &str) -> Result<HeaderMap, StoreError> {
        let path = self.path_for(name)?;
        self.stat(name, &path).await
    }

    async fn put(&self, name: &str, _headers: HeaderMap, content: Bytes) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::from_io(name, e))?;
        }

        // Write then rename so readers never see a half-written object.
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &content)
            .await
            .map_err(|e| StoreError::from_io(name, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::from_io(name, e))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| StoreError::from_io(name, e))
    }
}

/// In-memory store.
///
/// `put` honours a caller-supplied `Last-Modified` header, otherwise stamps
/// the current time.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<FxHashMap<String, Object>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, name: &str) -> Result<Object, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn head(&self, name: &str) -> Result<HeaderMap, StoreError> {
        self.get(name).await.map(|object| object.headers)
    }

    async fn put(&self, name: &str, mut headers: HeaderMap, content: Bytes) -> Result<(), StoreError> {
        if !headers.contains_key(LAST_MODIFIED) {
            headers.extend(last_modified_headers(Utc::now()));
        }
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects.insert(name.to_string(), Object { headers, content });
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}
