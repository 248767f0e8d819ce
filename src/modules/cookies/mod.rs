//! Per-client cookie jar.
//!
//! Cookies are keyed by name only: the portal scopes everything to one site,
//! so a later `Set-Cookie` for the same name replaces the earlier one
//! regardless of domain or path. Expired cookies are evicted on write and
//! invisible on read. Header grammar and date formats are handled by the
//! `cookie` crate; this module only applies the RFC 6265 storage rules.

use chrono::{DateTime, TimeDelta, Utc};
use http::HeaderMap;
use http::header::SET_COOKIE;
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// A cookie captured from a `Set-Cookie` header.
#[derive(Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    value: String,
    pub domain: String,
    pub host_only: bool,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    /// Cookie value. Values are credentials; keep them out of logs.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Parse one `Set-Cookie` header value received from `request_url`.
    ///
    /// Returns `None` for malformed headers and for cookies whose `Domain`
    /// attribute does not cover the responding host.
    pub fn parse(header: &str, request_url: &Url, now: DateTime<Utc>) -> Option<Self> {
        let raw = cookie::Cookie::parse(header).ok()?;
        let host = request_url.host_str()?.to_ascii_lowercase();

        let mut parsed = Cookie {
            name: raw.name().to_string(),
            value: raw.value().trim_matches('"').to_string(),
            domain: host.clone(),
            host_only: true,
            path: default_path(request_url),
            expires: raw
                .expires_datetime()
                .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), at.nanosecond())),
            secure: raw.secure().unwrap_or(false),
            http_only: raw.http_only().unwrap_or(false),
        };

        if let Some(domain) = raw
            .domain()
            .map(|domain| domain.trim_start_matches('.').to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
        {
            if !domain_matches(&host, &domain) {
                return None;
            }
            parsed.domain = domain;
            parsed.host_only = false;
        }
        if let Some(path) = raw.path().filter(|path| path.starts_with('/')) {
            parsed.path = path.to_string();
        }
        // Max-Age wins over Expires.
        if let Some(max_age) = raw.max_age() {
            parsed.expires = Some(expiry_after(now, max_age.whole_seconds()));
        }

        Some(parsed)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// Whether this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();

        let host_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };

        host_ok && path_matches(url.path(), &self.path) && (!self.secure || url.scheme() == "https")
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .field("domain", &self.domain)
            .field("host_only", &self.host_only)
            .field("path", &self.path)
            .field("expires", &self.expires)
            .field("secure", &self.secure)
            .field("http_only", &self.http_only)
            .finish()
    }
}

/// Cookie jar owned by one client instance.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: HashMap<String, Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture every `Set-Cookie` header of a response. Returns how many
    /// headers were applied (stored or evicting).
    pub fn store_response_cookies(&mut self, url: &Url, headers: &HeaderMap) -> usize {
        self.store_response_cookies_at(url, headers, Utc::now())
    }

    pub fn store_response_cookies_at(
        &mut self,
        url: &Url,
        headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> usize {
        let mut applied = 0;
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            match Cookie::parse(raw, url, now) {
                Some(cookie) => {
                    self.insert_at(cookie, now);
                    applied += 1;
                }
                None => log::debug!("ignoring malformed or foreign Set-Cookie from {}", url),
            }
        }
        let purged = self.purge_expired(now);
        if purged > 0 {
            log::trace!("dropped {purged} expired cookie(s)");
        }
        applied
    }

    /// Insert a cookie, replacing any cookie with the same name. A cookie that
    /// is already expired evicts the stored one instead.
    pub fn insert_at(&mut self, cookie: Cookie, now: DateTime<Utc>) {
        if cookie.is_expired_at(now) {
            self.cookies.remove(&cookie.name);
        } else {
            self.cookies.insert(cookie.name.clone(), cookie);
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Cookie> {
        self.cookies.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Cookie> {
        self.get_at(name, Utc::now())
    }

    pub fn get_at(&self, name: &str, now: DateTime<Utc>) -> Option<&Cookie> {
        self.cookies
            .get(name)
            .filter(|cookie| !cookie.is_expired_at(now))
    }

    /// Whether a non-expired cookie with this name is held.
    pub fn has_live(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// `Cookie` header value for a request to `url`, sorted by name.
    pub fn request_header(&self, url: &Url) -> Option<String> {
        self.request_header_at(url, Utc::now())
    }

    pub fn request_header_at(&self, url: &Url, now: DateTime<Utc>) -> Option<String> {
        let mut pairs: Vec<_> = self
            .cookies
            .values()
            .filter(|cookie| !cookie.is_expired_at(now) && cookie.matches(url))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by(|a, b| a.name.cmp(&b.name));
        Some(
            pairs
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Drop every expired cookie, returning how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.cookies.len();
        self.cookies.retain(|_, cookie| !cookie.is_expired_at(now));
        before - self.cookies.len()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.ends_with(domain)
            && host[..host.len() - domain.len()].ends_with('.')
            && host.parse::<std::net::IpAddr>().is_err())
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

/// Expiry for a `Max-Age` of `seconds`. Non-positive values expire
/// immediately; values past the representable range clamp to the latest date.
fn expiry_after(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    if seconds <= 0 {
        return DateTime::<Utc>::MIN_UTC;
    }
    TimeDelta::try_seconds(seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for value in values {
            map.append(SET_COOKIE, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn later_value_wins() {
        let mut jar = CookieJar::new();
        let origin = url("https://portal.test/login");
        jar.store_response_cookies(&origin, &headers(&["sid=first; Path=/"]));
        jar.store_response_cookies(&origin, &headers(&["sid=second; Path=/"]));

        assert_eq!(jar.get("sid").map(Cookie::value), Some("second"));
        assert_eq!(jar.len(), 1);
    }

    #[test]
    fn past_expiry_evicts_existing_cookie() {
        let mut jar = CookieJar::new();
        let origin = url("https://portal.test/");
        jar.store_response_cookies(&origin, &headers(&["sid=abc; Path=/"]));
        jar.store_response_cookies(
            &origin,
            &headers(&["sid=; Path=/; Expires=Thu, 01-Jan-1970 00:00:00 GMT"]),
        );

        assert!(jar.get("sid").is_none());
        assert!(jar.is_empty());
    }

    #[test]
    fn zero_max_age_evicts() {
        let mut jar = CookieJar::new();
        let origin = url("https://portal.test/");
        jar.store_response_cookies(&origin, &headers(&["sid=abc"]));
        jar.store_response_cookies(&origin, &headers(&["sid=abc; Max-Age=0"]));
        assert!(!jar.has_live("sid"));
    }

    #[test]
    fn cookie_expiring_later_becomes_invisible() {
        let mut jar = CookieJar::new();
        let origin = url("https://portal.test/");
        let now = Utc::now();
        jar.store_response_cookies_at(&origin, &headers(&["sid=abc; Max-Age=60"]), now);

        assert!(jar.get_at("sid", now).is_some());
        let later = now + TimeDelta::seconds(61);
        assert!(jar.get_at("sid", later).is_none());
        assert_eq!(jar.purge_expired(later), 1);
    }

    #[test]
    fn parses_expires_formats() {
        let origin = url("https://portal.test/");
        let now = Utc::now();
        let rfc = Cookie::parse("a=1; Expires=Wed, 21 Oct 2099 07:28:00 GMT", &origin, now)
            .unwrap();
        let netscape = Cookie::parse("a=1; Expires=Wed, 21-Oct-2099 07:28:00 GMT", &origin, now)
            .unwrap();

        assert_eq!(rfc.expires, netscape.expires);
        assert_eq!(
            rfc.expires.map(|at| at.to_rfc3339()).as_deref(),
            Some("2099-10-21T07:28:00+00:00")
        );
    }

    #[test]
    fn huge_max_age_clamps_instead_of_overflowing() {
        let origin = url("https://portal.test/");
        let mut jar = CookieJar::new();
        let max = i64::MAX.to_string();
        for max_age in ["10000000000000", max.as_str()] {
            let header = format!("sid=abc; Max-Age={max_age}; Path=/");
            jar.store_response_cookies(&origin, &headers(&[header.as_str()]));

            let cookie = jar.get("sid").unwrap();
            assert_eq!(cookie.expires, Some(DateTime::<Utc>::MAX_UTC));
            assert_eq!(jar.request_header(&origin).as_deref(), Some("sid=abc"));
        }
    }

    #[test]
    fn negative_max_age_evicts() {
        let mut jar = CookieJar::new();
        let origin = url("https://portal.test/");
        jar.store_response_cookies(&origin, &headers(&["sid=abc"]));
        jar.store_response_cookies(&origin, &headers(&["sid=abc; Max-Age=-1"]));
        assert!(jar.is_empty());
    }

    #[test]
    fn max_age_wins_over_expires() {
        let origin = url("https://portal.test/");
        let now = Utc::now();
        let cookie = Cookie::parse(
            "sid=abc; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Max-Age=60",
            &origin,
            now,
        )
        .unwrap();
        assert_eq!(cookie.expires, Some(now + TimeDelta::seconds(60)));
    }

    #[test]
    fn malformed_headers_are_skipped() {
        let mut jar = CookieJar::new();
        let applied = jar.store_response_cookies(
            &url("https://portal.test/"),
            &headers(&["=orphan", "no-equals-sign", "ok=1"]),
        );
        assert_eq!(applied, 1);
        assert!(jar.has_live("ok"));
    }

    #[test]
    fn builds_sorted_request_header() {
        let mut jar = CookieJar::new();
        let origin = url("https://portal.test/");
        jar.store_response_cookies(
            &origin,
            &headers(&["b=2; Path=/", "a=1; Path=/", ".ASPXAUTH=tok; Path=/; HttpOnly"]),
        );

        assert_eq!(
            jar.request_header(&url("https://portal.test/Tenant/Home")).as_deref(),
            Some(".ASPXAUTH=tok; a=1; b=2")
        );
    }

    #[test]
    fn respects_domain_and_path_scope() {
        let mut jar = CookieJar::new();
        let origin = url("https://www.portal.test/Tenant/Login");
        jar.store_response_cookies(
            &origin,
            &headers(&[
                "wide=1; Domain=.portal.test; Path=/",
                "narrow=2; Path=/Tenant",
                "foreign=3; Domain=evil.test",
            ]),
        );

        assert!(jar.get("foreign").is_none());
        assert_eq!(
            jar.request_header(&url("https://api.portal.test/v1/me")).as_deref(),
            Some("wide=1")
        );
        assert_eq!(
            jar.request_header(&url("https://www.portal.test/Tenant/Deliveries")).as_deref(),
            Some("narrow=2; wide=1")
        );
        assert_eq!(
            jar.request_header(&url("https://www.portal.test/TenantX")).as_deref(),
            Some("wide=1")
        );
    }

    #[test]
    fn secure_cookie_stays_off_plain_http() {
        let mut jar = CookieJar::new();
        jar.store_response_cookies(&url("https://portal.test/"), &headers(&["s=1; Secure"]));
        assert!(jar.request_header(&url("http://portal.test/")).is_none());
    }

    #[test]
    fn debug_redacts_value() {
        let cookie =
            Cookie::parse("sid=very-secret", &url("https://portal.test/"), Utc::now()).unwrap();
        let rendered = format!("{cookie:?}");
        assert!(!rendered.contains("very-secret"));
    }
}
