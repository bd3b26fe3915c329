//! Named stores and their entries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use http::{HeaderName, HeaderValue, Method, StatusCode};
use precache_net::{Request, Response};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::storage::StorageError;

/// Request identity inside a store: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for `method` on `url`.
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method, url))
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for an intercepted request.
    pub fn from_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    /// Key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A captured response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment stripped).
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in received order. Names may repeat.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` as the answer to `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let mut url = request.url.clone();
        url.set_fragment(None);

        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        Self {
            url,
            method: request.method.to_string(),
            status: response.status.as_u16(),
            status_text: response.status_text().to_string(),
            headers,
            body: response.body().to_vec(),
            cached_at: now_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey(format!("{} {}", self.method, self.url))
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Result<Response, StorageError> {
        let status = StatusCode::from_u16(self.status).map_err(|_| {
            StorageError::InvalidEntry(format!("{}: status {}", self.key(), self.status))
        })?;

        let mut response = Response::new(self.url.clone(), status).with_body(self.body.clone());
        for header in &self.headers {
            let name = HeaderName::try_from(header.name.as_str())
                .map_err(|e| StorageError::InvalidEntry(format!("{}: {e}", self.key())))?;
            let value = HeaderValue::from_bytes(&header.value)
                .map_err(|e| StorageError::InvalidEntry(format!("{}: {e}", self.key())))?;
            if name == http::header::CONTENT_TYPE {
                response = response.with_header(name, value);
            } else {
                response.headers.append(name, value);
            }
        }
        Ok(response)
    }
}

/// One response header. Values are raw bytes; they need not be ASCII.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "body_base64")]
    pub value: Vec<u8>,
}

/// A named store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cache {
    /// Store name (version tag).
    pub name: String,

    /// Entries by key.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty store.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request key.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key.as_str())
    }

    /// Insert or overwrite. Last write wins.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key().0, entry);
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn entry(u: &str, body: &str) -> CacheEntry {
        let request = Request::get(url(u));
        let response = Response::new(url(u), StatusCode::OK)
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/html"),
            )
            .with_body(body.to_string());
        CacheEntry::from_response(&request, &response)
    }

    #[test]
    fn test_key_ignores_fragment() {
        let a = CacheKey::get(&url("https://example.com/page#top"));
        let b = CacheKey::get(&url("https://example.com/page"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "GET https://example.com/page");
    }

    #[test]
    fn test_key_includes_method() {
        let u = url("https://example.com/page");
        assert_ne!(CacheKey::get(&u), CacheKey::new(&Method::HEAD, &u));
    }

    #[test]
    fn test_entry_key_matches_request_key() {
        let e = entry("https://example.com/auth/login#x", "<form>");
        let request = Request::get(url("https://example.com/auth/login"));
        assert_eq!(e.key(), CacheKey::from_request(&request));
    }

    #[test]
    fn test_entry_to_response_restores_snapshot() {
        let e = entry("https://example.com/", "<h1>hi</h1>");
        let response = e.to_response().unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "<h1>hi</h1>");
        assert_eq!(
            response.content_type.as_ref().map(|m| m.essence_str()),
            Some("text/html")
        );
        assert_eq!(
            response.headers.get(http::header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
    }

    #[test]
    fn test_entry_with_bad_status_is_invalid() {
        let mut e = entry("https://example.com/", "");
        e.status = 42;
        assert!(matches!(e.to_response(), Err(StorageError::InvalidEntry(_))));
    }

    #[test]
    fn test_body_serialized_as_base64() {
        let e = entry("https://example.com/icon.png", "\u{0}\u{1}png");
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["body"], "AAFwbmc=");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_cache_put_overwrites() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/", "old"));
        cache.put(entry("https://example.com/", "new"));

        assert_eq!(cache.len(), 1);
        let key = CacheKey::get(&url("https://example.com/"));
        assert_eq!(cache.match_request(&key).unwrap().body, b"new");
    }

    #[test]
    fn test_cache_entries_sorted_by_key() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/b.js", ""));
        cache.put(entry("https://example.com/a.js", ""));

        let keys: Vec<String> = cache.entries().iter().map(|e| e.key().to_string()).collect();
        assert_eq!(
            keys,
            vec!["GET https://example.com/a.js", "GET https://example.com/b.js"]
        );
    }

    #[test]
    fn test_non_ascii_header_survives_snapshot() {
        let u = url("https://example.com/static/logo_livro.webp");
        let disposition = HeaderValue::from_bytes(b"inline; filename=\"livro-\xe9.webp\"").unwrap();
        let response = Response::new(u.clone(), StatusCode::OK)
            .with_header(http::header::CONTENT_DISPOSITION, disposition.clone())
            .with_body("webp");
        let snapshot = CacheEntry::from_response(&Request::get(u), &response);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        let restored = back.to_response().unwrap();

        assert_eq!(
            restored.headers.get(http::header::CONTENT_DISPOSITION),
            Some(&disposition)
        );
    }
}
