//! Settings and configuration module
//!
//! Holds the credential store and the portal endpoints, field names and
//! timeouts the client runs with. Defaults are constants; the builder and
//! environment can override them.

use std::env;
use std::fmt;
use std::time::Duration;

use url::Url;

use crate::portal::{PortalError, PortalResult};

pub const DEFAULT_BASE_URL: &str = "https://www.buildinglink.com/V2/Tenant/";
pub const DEFAULT_LOGIN_URL: &str = "https://auth.buildinglink.com/Account/Login";
pub const DEFAULT_SESSION_COOKIE: &str = ".ASPXAUTH";
pub const DEFAULT_ANTI_FORGERY_FIELD: &str = "__RequestVerificationToken";
pub const DEFAULT_API_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
pub const DEFAULT_USER_AGENT: &str = concat!("tenant-portal/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

pub const ENV_USERNAME: &str = "PORTAL_USERNAME";
pub const ENV_PASSWORD: &str = "PORTAL_PASSWORD";
pub const ENV_API_KEY: &str = "PORTAL_API_KEY";
pub const ENV_BASE_URL: &str = "PORTAL_BASE_URL";
pub const ENV_LOGIN_URL: &str = "PORTAL_LOGIN_URL";
pub const ENV_API_BASE_URL: &str = "PORTAL_API_BASE_URL";

/// Portal account credentials. Immutable once built; `Debug` never prints the
/// secrets.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
    api_key: Option<String>,
}

impl Credentials {
    /// Blank username or password is rejected before any client exists.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> PortalResult<Self> {
        let username = username.into();
        let password = password.into();
        if username.trim().is_empty() {
            return Err(PortalError::Configuration("username is required".into()));
        }
        if password.is_empty() {
            return Err(PortalError::Configuration("password is required".into()));
        }
        Ok(Self {
            username,
            password,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.trim().is_empty()).then_some(api_key);
        self
    }

    /// Read `PORTAL_USERNAME`, `PORTAL_PASSWORD` and the optional
    /// `PORTAL_API_KEY`.
    pub fn from_env() -> PortalResult<Self> {
        let username = required_env(ENV_USERNAME)?;
        let password = required_env(ENV_PASSWORD)?;
        let credentials = Self::new(username, password)?;
        Ok(match optional_env(ENV_API_KEY) {
            Some(api_key) => credentials.with_api_key(api_key),
            None => credentials,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    pub(crate) fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn required_env(name: &str) -> PortalResult<String> {
    optional_env(name)
        .ok_or_else(|| PortalError::Configuration(format!("environment variable {name} is not set")))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Endpoints, form field names and limits used by the client.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    /// Tenant-portal root that `page()` paths are resolved against.
    pub base_url: Url,
    pub login_url: Url,
    /// Host that receives the bearer token and API key header.
    pub api_base_url: Option<Url>,
    /// Cookie whose absence means the session is gone. `None` disables the
    /// pre-flight check.
    pub session_cookie: Option<String>,
    /// Cookie carrying the bearer token, if the portal sets one.
    pub token_cookie: Option<String>,
    /// Hidden field that must be echoed back with the credentials. `None`
    /// accepts forms without an anti-forgery token.
    pub anti_forgery_field: Option<String>,
    pub username_field: Option<String>,
    pub password_field: Option<String>,
    pub api_key_header: String,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub login_timeout: Duration,
    pub max_redirects: usize,
}

impl PortalConfig {
    /// Apply `PORTAL_BASE_URL`, `PORTAL_LOGIN_URL` and `PORTAL_API_BASE_URL`
    /// when set.
    pub fn apply_env(mut self) -> PortalResult<Self> {
        if let Some(base) = optional_env(ENV_BASE_URL) {
            self.base_url = parse_base_url(&base)?;
        }
        if let Some(login) = optional_env(ENV_LOGIN_URL) {
            self.login_url = parse_url("login URL", &login)?;
        }
        if let Some(api) = optional_env(ENV_API_BASE_URL) {
            self.api_base_url = Some(parse_url("API base URL", &api)?);
        }
        Ok(self)
    }

    /// Resolve a tenant-portal path. A leading `/` stays relative to the base
    /// URL instead of jumping to the host root. Absolute URLs and paths that
    /// resolve to another origin are rejected.
    pub fn resolve_page(&self, relative_path: &str) -> PortalResult<Url> {
        let trimmed = relative_path.trim().trim_start_matches('/');
        if Url::parse(trimmed).is_ok() {
            return Err(PortalError::InvalidPagePath(relative_path.to_string()));
        }
        let resolved = self.base_url.join(trimmed)?;
        if resolved.origin() != self.base_url.origin() {
            return Err(PortalError::InvalidPagePath(relative_path.to_string()));
        }
        Ok(resolved)
    }

    /// Whether `url` is served by the configured API host.
    pub fn is_api_url(&self, url: &Url) -> bool {
        let Some(api) = &self.api_base_url else {
            return false;
        };
        api.host_str()
            .zip(url.host_str())
            .is_some_and(|(expected, host)| expected.eq_ignore_ascii_case(host))
            && api.port_or_known_default() == url.port_or_known_default()
            && within_path(url.path(), api.path())
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).unwrap_or_else(|err| {
                panic!("invalid built-in base URL `{DEFAULT_BASE_URL}`: {err}")
            }),
            login_url: Url::parse(DEFAULT_LOGIN_URL).unwrap_or_else(|err| {
                panic!("invalid built-in login URL `{DEFAULT_LOGIN_URL}`: {err}")
            }),
            api_base_url: None,
            session_cookie: Some(DEFAULT_SESSION_COOKIE.to_string()),
            token_cookie: None,
            anti_forgery_field: Some(DEFAULT_ANTI_FORGERY_FIELD.to_string()),
            username_field: None,
            password_field: None,
            api_key_header: DEFAULT_API_KEY_HEADER.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

/// Whether `path` is `prefix` itself or lies below it on a segment boundary.
fn within_path(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

pub(crate) fn parse_url(what: &str, raw: &str) -> PortalResult<Url> {
    Url::parse(raw.trim())
        .map_err(|err| PortalError::Configuration(format!("invalid {what} `{raw}`: {err}")))
}

/// Base URLs always end with `/` so that joins append instead of replacing
/// the last segment.
pub(crate) fn parse_base_url(raw: &str) -> PortalResult<Url> {
    let mut url = parse_url("base URL", raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
