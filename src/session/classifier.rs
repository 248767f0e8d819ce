//! Session expiry classification.
//!
//! A response counts as "session expired" on exactly three signals:
//!
//! 1. HTTP 401,
//! 2. a redirect whose `Location` resolves to the login page,
//! 3. a response served from the login page URL itself.
//!
//! Everything else is either a redirect to follow, an authenticated payload
//! (2xx), or an unexpected response the caller has to see.

use url::Url;

use crate::session::core::TransportResponse;

/// Which signal marked the response as expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpirySignal {
    Unauthorized,
    RedirectToLogin,
    LoginPage,
}

impl ExpirySignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirySignal::Unauthorized => "unauthorized",
            ExpirySignal::RedirectToLogin => "redirect_to_login",
            ExpirySignal::LoginPage => "login_page",
        }
    }
}

/// Outcome of classifying one response hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionVerdict {
    Authenticated,
    Redirect(Url),
    Expired(ExpirySignal),
    Unexpected,
}

/// Classifies responses relative to the configured login page.
#[derive(Debug, Clone)]
pub struct SessionClassifier {
    login_host: Option<String>,
    login_path: String,
}

impl SessionClassifier {
    pub fn new(login_url: &Url) -> Self {
        Self {
            login_host: login_url.host_str().map(str::to_ascii_lowercase),
            login_path: normalize_path(login_url.path()),
        }
    }

    /// Whether `url` points at the login page (query string ignored).
    pub fn is_login_url(&self, url: &Url) -> bool {
        let same_host = match (&self.login_host, url.host_str()) {
            (Some(expected), Some(host)) => expected.eq_ignore_ascii_case(host),
            (None, None) => true,
            _ => false,
        };
        same_host && normalize_path(url.path()) == self.login_path
    }

    pub fn classify(&self, response: &TransportResponse) -> SessionVerdict {
        if response.status == 401 {
            return SessionVerdict::Expired(ExpirySignal::Unauthorized);
        }

        if response.is_redirect() {
            return match response.redirect_target() {
                Some(target) if self.is_login_url(&target) => {
                    SessionVerdict::Expired(ExpirySignal::RedirectToLogin)
                }
                Some(target) => SessionVerdict::Redirect(target),
                // 304 and friends carry no Location.
                None => SessionVerdict::Unexpected,
            };
        }

        if self.is_login_url(&response.url) {
            return SessionVerdict::Expired(ExpirySignal::LoginPage);
        }

        if (200..300).contains(&response.status) {
            SessionVerdict::Authenticated
        } else {
            SessionVerdict::Unexpected
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_ascii_lowercase()
    }
}
