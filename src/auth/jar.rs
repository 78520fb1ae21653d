//! Session cookie jar shared between the HTTP client and the encrypted
//! cookie file.
//!
//! `reqwest`'s built-in jar cannot be inspected, so the console session keeps
//! its own store implementing `reqwest::cookie::CookieStore`. Scoping is the
//! minimal host/path matching the console needs, not a full RFC 6265 engine.

use std::sync::RwLock;

use reqwest::header::HeaderValue;
use reqwest::Url;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Set when the cookie carried no `Domain` attribute. Host-only cookies
    /// never match subdomains (RFC 6265 §5.3 step 6).
    #[serde(default)]
    pub host_only: bool,
}

impl StoredCookie {
    fn matches(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or("");
        let host_ok = if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        };
        host_ok && path_matches(&self.path, url.path())
    }
}

/// Path-match per RFC 6265 §5.1.4: exact, or prefix ending at a '/' boundary.
fn path_matches(cookie_path: &str, request_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path[cookie_path.len()..].starts_with('/'))
}

/// Default cookie path for a request URL (RFC 6265 §5.1.4).
fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[derive(Debug, Default)]
pub struct SessionJar {
    cookies: RwLock<Vec<StoredCookie>>,
}

impl SessionJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the current cookies for serialization.
    pub fn snapshot(&self) -> Vec<StoredCookie> {
        self.read().clone()
    }

    /// Replace the jar contents with a previously saved snapshot.
    pub fn restore(&self, cookies: Vec<StoredCookie>) {
        *self.write() = cookies;
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<StoredCookie>> {
        self.cookies.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<StoredCookie>> {
        self.cookies.write().unwrap_or_else(|e| e.into_inner())
    }

    fn upsert(&self, cookie: StoredCookie) {
        let mut cookies = self.write();
        cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        cookies.push(cookie);
    }
}

/// Parse one `Set-Cookie` header value into a stored cookie scoped to `url`.
/// Returns `None` for unparseable headers and immediate expirations.
fn parse_set_cookie(header: &str, url: &Url) -> Option<StoredCookie> {
    let mut parts = header.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }

    let mut domain = url.host_str()?.to_string();
    let mut host_only = true;
    let mut path = default_path(url);
    for attr in parts {
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (attr.trim(), ""),
        };
        if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
            domain = val.trim_start_matches('.').to_string();
            host_only = false;
        } else if key.eq_ignore_ascii_case("path") && val.starts_with('/') {
            path = val.to_string();
        } else if key.eq_ignore_ascii_case("max-age") {
            if val.parse::<i64>().map(|age| age <= 0).unwrap_or(false) {
                return None;
            }
        }
    }

    Some(StoredCookie {
        name: name.to_string(),
        value: value.trim().to_string(),
        domain,
        path,
        host_only,
    })
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            let Ok(raw) = header.to_str() else { continue };
            if let Some(cookie) = parse_set_cookie(raw, url) {
                self.upsert(cookie);
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let matching: Vec<String> = self
            .read()
            .iter()
            .filter(|c| c.matches(url))
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();

        if matching.is_empty() {
            return None;
        }
        HeaderValue::from_str(&matching.join("; ")).ok()
    }
}
