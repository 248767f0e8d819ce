//! Core data structures shared by the transport, handshake, and fetch layers.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, LOCATION};
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::fmt;
use url::Url;

/// Fully prepared request handed to a [`PortalTransport`](super::PortalTransport).
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body;
        self
    }
}

/// Single-hop response returned by the transport. Redirects are never
/// followed below this layer.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub url: Url,
}

impl TransportResponse {
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    /// Absolute redirect target, resolving relative `Location` values against
    /// the URL that produced this response.
    pub fn redirect_target(&self) -> Option<Url> {
        if !self.is_redirect() {
            return None;
        }
        let location = self.location()?.trim();
        if let Ok(absolute) = Url::parse(location)
            && absolute.has_host()
        {
            return Some(absolute);
        }
        self.url.join(location).ok()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Planned credential submission built from the login page.
///
/// The form carries the password, so `Debug` only lists field names.
#[derive(Clone)]
pub struct LoginSubmission {
    pub url: Url,
    pub form_fields: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

impl LoginSubmission {
    pub fn new(url: Url, form_fields: HashMap<String, String>) -> Self {
        Self {
            url,
            form_fields,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Urlencoded form body. Fields are sorted so the payload is stable.
    pub fn encoded_body(&self) -> String {
        let mut fields: Vec<_> = self.form_fields.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish()
    }
}

impl fmt::Debug for LoginSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.form_fields.keys().collect();
        names.sort();
        f.debug_struct("LoginSubmission")
            .field("url", &self.url.as_str())
            .field("form_fields", &names)
            .field("headers", &self.headers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fields_in_stable_order() {
        let submission = LoginSubmission::new(
            Url::parse("https://portal.test/login").unwrap(),
            HashMap::from([
                ("Password".to_string(), "p&ss word".to_string()),
                ("Username".to_string(), "alice".to_string()),
                ("__RequestVerificationToken".to_string(), "tok".to_string()),
            ]),
        );

        assert_eq!(
            submission.encoded_body(),
            "Password=p%26ss+word&Username=alice&__RequestVerificationToken=tok"
        );
    }

    #[test]
    fn debug_output_hides_field_values() {
        let submission = LoginSubmission::new(
            Url::parse("https://portal.test/login").unwrap(),
            HashMap::from([("Password".to_string(), "hunter2".to_string())]),
        );

        let rendered = format!("{submission:?}");
        assert!(rendered.contains("Password"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn detects_redirects_and_location() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, "/home".parse().unwrap());
        let response = TransportResponse {
            status: 302,
            headers,
            body: Bytes::new(),
            url: Url::parse("https://portal.test/login").unwrap(),
        };

        assert!(response.is_redirect());
        assert_eq!(response.location(), Some("/home"));
        assert_eq!(
            response.redirect_target().unwrap().as_str(),
            "https://portal.test/home"
        );
    }
}
