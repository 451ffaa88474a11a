//! Cookie jar
//!
//! RFC-6265 storage keyed by (domain, path, name), shared by the whole
//! run. The jar is only mutated from the script queue (a request's
//! post-phase); the I/O phase reads a materialized header string
//! captured during the pre-phase, so no lock ordering subtleties exist.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cookie::Cookie;
use serde_json::Value;
use tracing::{debug, warn};

/// One stored cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    pub expires: Option<DateTime<Utc>>,
    /// True when the Domain attribute was present (enables subdomain match)
    pub host_only: bool,
}

impl StoredCookie {
    fn key(&self) -> (String, String, String) {
        (self.domain.clone(), self.path.clone(), self.name.clone())
    }

    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }

    /// RFC 6265 domain-match for a request host
    fn domain_matches(&self, host: &str) -> bool {
        if self.host_only {
            host.eq_ignore_ascii_case(&self.domain)
        } else {
            let host = host.to_ascii_lowercase();
            let domain = self.domain.to_ascii_lowercase();
            host == domain || host.ends_with(&format!(".{domain}"))
        }
    }

    /// RFC 6265 path-match for a request path
    fn path_matches(&self, request_path: &str) -> bool {
        if self.path == "/" || request_path == self.path {
            return true;
        }
        request_path.starts_with(&self.path)
            && (self.path.ends_with('/') || request_path.as_bytes().get(self.path.len()) == Some(&b'/'))
    }
}

/// The run-wide cookie store
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: BTreeMap<(String, String, String), StoredCookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and store every `Set-Cookie` value from a response. The
    /// request URL supplies defaults for domain and path. Malformed
    /// cookies are logged and dropped; `Max-Age=0` (or a past expiry)
    /// deletes a stored cookie.
    pub fn store_response_cookies(&mut self, request_url: &str, set_cookie_values: &[&str]) {
        let (default_domain, _default_path) = split_url(request_url);
        let now = Utc::now();

        for raw in set_cookie_values {
            let parsed = match Cookie::parse(raw.to_string()) {
                Ok(c) => c,
                Err(e) => {
                    warn!(cookie = %raw, error = %e, "CookieJar: dropping malformed Set-Cookie");
                    continue;
                }
            };

            let host_only = parsed.domain().is_none();
            let domain = parsed
                .domain()
                .map(|d| d.trim_start_matches('.').to_ascii_lowercase())
                .unwrap_or_else(|| default_domain.clone());
            let path = parsed.path().map(str::to_string).unwrap_or_else(|| "/".to_string());

            let expires = match (parsed.max_age(), parsed.expires_datetime()) {
                (Some(max_age), _) => {
                    let secs = max_age.whole_seconds();
                    Some(now + chrono::Duration::seconds(secs))
                }
                (None, Some(at)) => DateTime::<Utc>::from_timestamp(at.unix_timestamp(), 0),
                (None, None) => None,
            };

            let stored = StoredCookie {
                name: parsed.name().to_string(),
                value: parsed.value().to_string(),
                domain,
                path,
                secure: parsed.secure().unwrap_or(false),
                http_only: parsed.http_only().unwrap_or(false),
                expires,
                host_only,
            };

            if stored.expired(now) {
                debug!(name = %stored.name, domain = %stored.domain, "CookieJar: expiring cookie");
                self.cookies.remove(&stored.key());
            } else {
                debug!(name = %stored.name, domain = %stored.domain, path = %stored.path, "CookieJar: storing cookie");
                self.cookies.insert(stored.key(), stored);
            }
        }
    }

    /// Materialize the `Cookie:` header for a request URL. Cookies with
    /// longer paths come first, per RFC 6265 ordering.
    pub fn header_for(&self, request_url: &str) -> Option<String> {
        let (host, request_path) = split_url(request_url);
        let secure = request_url.starts_with("https://");
        let now = Utc::now();

        let mut matched: Vec<&StoredCookie> = self
            .cookies
            .values()
            .filter(|c| !c.expired(now))
            .filter(|c| c.domain_matches(&host))
            .filter(|c| c.path_matches(&request_path))
            .filter(|c| !c.secure || secure)
            .collect();

        if matched.is_empty() {
            return None;
        }
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then_with(|| a.name.cmp(&b.name)));
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Remove every cookie (the non-persistent jar does this after each
    /// request's post-phase)
    pub fn clear(&mut self) {
        debug!(count = self.cookies.len(), "CookieJar: clearing");
        self.cookies.clear();
    }

    /// Snapshot as JSON, name -> {value, domain, path}
    pub fn to_object(&self) -> Value {
        let mut map = serde_json::Map::new();
        for cookie in self.cookies.values() {
            map.insert(
                cookie.name.clone(),
                serde_json::json!({
                    "value": cookie.value,
                    "domain": cookie.domain,
                    "path": cookie.path,
                }),
            );
        }
        Value::Object(map)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

/// Extract (host, path) from a URL without a full parser; enough for
/// jar keying even when the protocol payload is not strictly HTTP.
fn split_url(url: &str) -> (String, String) {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.split_once('/') {
        Some((host, path)) => (strip_port(host).to_ascii_lowercase(), format!("/{path}")),
        None => (strip_port(rest).to_ascii_lowercase(), "/".to_string()),
    }
}

fn strip_port(host: &str) -> &str {
    host.split_once(':').map(|(h, _)| h).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_materialize() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/login", &["session=abc123; Path=/"]);
        assert_eq!(jar.len(), 1);

        let header = jar.header_for("http://api.test/users").unwrap();
        assert_eq!(header, "session=abc123");
    }

    #[test]
    fn test_domain_isolation() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://a.test/", &["k=v"]);
        assert!(jar.header_for("http://b.test/").is_none());
        assert!(jar.header_for("http://a.test/anything").is_some());
    }

    #[test]
    fn test_host_only_vs_domain_attribute() {
        let mut jar = CookieJar::new();
        // No Domain attribute: host-only
        jar.store_response_cookies("http://api.test/", &["strict=1"]);
        assert!(jar.header_for("http://sub.api.test/").is_none());

        // Domain attribute: subdomains match
        jar.store_response_cookies("http://api.test/", &["wide=1; Domain=api.test"]);
        let header = jar.header_for("http://sub.api.test/").unwrap();
        assert_eq!(header, "wide=1");
    }

    #[test]
    fn test_path_matching() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/", &["scoped=1; Path=/api"]);
        assert!(jar.header_for("http://api.test/api").is_some());
        assert!(jar.header_for("http://api.test/api/users").is_some());
        assert!(jar.header_for("http://api.test/apiary").is_none());
        assert!(jar.header_for("http://api.test/other").is_none());
    }

    #[test]
    fn test_longest_path_first() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/", &["outer=1; Path=/", "inner=2; Path=/api/users"]);
        let header = jar.header_for("http://api.test/api/users/1").unwrap();
        assert_eq!(header, "inner=2; outer=1");
    }

    #[test]
    fn test_max_age_zero_deletes() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/", &["k=v; Path=/"]);
        assert_eq!(jar.len(), 1);
        jar.store_response_cookies("http://api.test/", &["k=; Path=/; Max-Age=0"]);
        assert_eq!(jar.len(), 0);
    }

    #[test]
    fn test_secure_cookie_needs_https() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("https://api.test/", &["s=1; Secure"]);
        assert!(jar.header_for("http://api.test/").is_none());
        assert!(jar.header_for("https://api.test/").is_some());
    }

    #[test]
    fn test_clear_and_to_object() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/", &["k=v1", "t=v2"]);

        let object = jar.to_object();
        assert_eq!(object["k"]["value"], "v1");
        assert_eq!(object["t"]["domain"], "api.test");

        jar.clear();
        assert!(jar.is_empty());
        assert_eq!(jar.to_object(), serde_json::json!({}));
    }

    #[test]
    fn test_malformed_cookie_skipped() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/", &["", "ok=1"]);
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn test_same_name_different_paths_coexist() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies("http://api.test/", &["k=root; Path=/", "k=deep; Path=/api"]);
        assert_eq!(jar.len(), 2);
        let header = jar.header_for("http://api.test/api").unwrap();
        assert_eq!(header, "k=deep; k=root");
    }
}
