//! High level portal client.
//!
//! Wires the credential store, cookie jar, session tracker and login
//! handshake together behind two entry points: [`PortalClient::fetch`] for
//! arbitrary URLs and [`PortalClient::page`] for tenant-portal pages parsed
//! into a [`ParsedDocument`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::config::{Credentials, PortalConfig, parse_base_url, parse_url};
use crate::document::{DocumentError, ParsedDocument};
use crate::modules::events::{
	ErrorEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler, RetryEvent,
	SessionEvent,
};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::state::{LoginMode, LoginTicket, SessionGrant, SessionState, SessionTracker};
use crate::session::classifier::{SessionClassifier, SessionVerdict};
use crate::session::core::{
	LoginFormError, PortalTransport, ReqwestPortalTransport, TransportError, TransportRequest,
	TransportResponse,
};
use crate::session::exchange::{FollowPolicy, HttpExchange, Traffic};
use crate::session::handshake::LoginHandshake;

/// Result alias used across the client.
pub type PortalResult<T> = Result<T, PortalError>;

/// Error surfaced by the client. `Clone` so that one handshake outcome can be
/// handed to every caller that waited on it.
#[derive(Debug, Clone, Error)]
pub enum PortalError {
	#[error("configuration error: {0}")]
	Configuration(String),
	#[error("login form could not be parsed: {0}")]
	LoginFormParse(#[from] LoginFormError),
	#[error("credentials rejected by the portal{}", detail(.message))]
	CredentialsRejected { message: Option<String> },
	#[error("login succeeded but the session cookie '{cookie}' was not set")]
	SessionCookieMissing { cookie: String },
	#[error("session expired again after re-authenticating for {url}")]
	SessionExpired { url: String },
	#[error("network error: {0}")]
	Network(#[from] TransportError),
	#[error("unexpected response {status} from {url}")]
	UnexpectedResponse { status: u16, url: String },
	#[error("login did not finish within {0:?}")]
	LoginTimeout(Duration),
	#[error("more than {limit} redirects, last target {url}")]
	TooManyRedirects { limit: usize, url: String },
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
	#[error("`{0}` is not a page of the tenant portal")]
	InvalidPagePath(String),
	#[error("response decoding failed: {0}")]
	Decode(String),
	#[error("document query failed: {0}")]
	Document(#[from] DocumentError),
}

fn detail(message: &Option<String>) -> String {
	message
		.as_deref()
		.map(|message| format!(": {message}"))
		.unwrap_or_default()
}

/// Read-only HTTP response returned by the client.
#[derive(Debug, Clone)]
pub struct PortalResponse {
	status: u16,
	headers: HeaderMap,
	body: Bytes,
	url: Url,
}

impl PortalResponse {
	fn from_transport(response: TransportResponse) -> Self {
		Self {
			status: response.status,
			headers: response.headers,
			body: response.body,
			url: response.url,
		}
	}

	pub fn status(&self) -> u16 {
		self.status
	}

	/// Final URL after redirects.
	pub fn url(&self) -> &Url {
		&self.url
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn bytes(&self) -> Bytes {
		self.body.clone()
	}

	/// Body as UTF-8 text.
	pub fn text(&self) -> PortalResult<String> {
		String::from_utf8(self.body.to_vec()).map_err(|err| PortalError::Decode(err.to_string()))
	}

	pub fn json<T: DeserializeOwned>(&self) -> PortalResult<T> {
		serde_json::from_slice(&self.body).map_err(|err| PortalError::Decode(err.to_string()))
	}

	pub fn content_type(&self) -> Option<&str> {
		self.headers
			.get(CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
	}

	/// HTML by content type, or by sniffing the body when the header is absent.
	pub fn is_html(&self) -> bool {
		match self.content_type() {
			Some(content_type) => {
				let content_type = content_type.to_ascii_lowercase();
				content_type.contains("text/html") || content_type.contains("application/xhtml")
			}
			None => {
				let head = String::from_utf8_lossy(&self.body[..self.body.len().min(256)])
					.trim_start()
					.to_ascii_lowercase();
				head.starts_with("<!doctype html") || head.starts_with("<html")
			}
		}
	}
}

/// Tenant-portal page: the response plus its parsed document when the body
/// is HTML.
#[derive(Debug, Clone)]
pub struct PortalPage {
	pub response: PortalResponse,
	pub document: Option<ParsedDocument>,
}

impl PortalPage {
	/// The parsed document, or a decode error for non-HTML responses.
	pub fn document(&self) -> PortalResult<&ParsedDocument> {
		self.document.as_ref().ok_or_else(|| {
			PortalError::Decode(format!(
				"{} is not an HTML page ({})",
				self.response.url(),
				self.response.content_type().unwrap_or("no content type")
			))
		})
	}
}

/// Per-request options for [`PortalClient::fetch_with`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
	method: Method,
	headers: Vec<(String, String)>,
	body: Option<Bytes>,
}

impl Default for FetchOptions {
	fn default() -> Self {
		Self {
			method: Method::GET,
			headers: Vec::new(),
			body: None,
		}
	}
}

impl FetchOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_method(mut self, method: Method) -> Self {
		self.method = method;
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = Some(body.into());
		self
	}

	/// POST an urlencoded form.
	pub fn with_form<I, K, V>(self, fields: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<str>,
	{
		let body = url::form_urlencoded::Serializer::new(String::new())
			.extend_pairs(fields)
			.finish();
		self.with_method(Method::POST)
			.with_header(CONTENT_TYPE.as_str(), "application/x-www-form-urlencoded")
			.with_body(body)
	}

	/// POST a JSON payload.
	pub fn with_json<T: Serialize>(self, payload: &T) -> PortalResult<Self> {
		let body =
			serde_json::to_vec(payload).map_err(|err| PortalError::Decode(err.to_string()))?;
		Ok(self
			.with_method(Method::POST)
			.with_header(CONTENT_TYPE.as_str(), "application/json")
			.with_body(body))
	}

	fn to_headers(&self) -> PortalResult<HeaderMap> {
		let mut headers = HeaderMap::new();
		for (name, value) in &self.headers {
			let header_name = HeaderName::from_bytes(name.as_bytes())
				.map_err(|err| PortalError::InvalidHeader(format!("{name}: {err}")))?;
			let header_value = HeaderValue::from_str(value)
				.map_err(|err| PortalError::InvalidHeader(format!("{name}: {err}")))?;
			headers.append(header_name, header_value);
		}
		Ok(headers)
	}
}

/// Session status exposed to the tool layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStatus {
	pub authenticated: bool,
	pub has_token: bool,
}

/// Fluent builder for [`PortalClient`].
pub struct PortalClientBuilder {
	config: PortalConfig,
	credentials: Option<Credentials>,
	base_url: Option<String>,
	login_url: Option<String>,
	api_base_url: Option<String>,
	transport: Option<Arc<dyn PortalTransport>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl PortalClientBuilder {
	pub fn new() -> Self {
		Self {
			config: PortalConfig::default(),
			credentials: None,
			base_url: None,
			login_url: None,
			api_base_url: None,
			transport: None,
			handlers: Vec::new(),
		}
	}

	/// Replace the whole configuration. URL overrides set on the builder
	/// still win.
	pub fn with_config(mut self, config: PortalConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_credentials(mut self, credentials: Credentials) -> Self {
		self.credentials = Some(credentials);
		self
	}

	pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
		self.base_url = Some(url.into());
		self
	}

	pub fn with_login_url(mut self, url: impl Into<String>) -> Self {
		self.login_url = Some(url.into());
		self
	}

	pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
		self.api_base_url = Some(url.into());
		self
	}

	pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
		self.config.session_cookie = Some(name.into());
		self
	}

	/// Trust the session state alone instead of checking the session cookie
	/// before every request.
	pub fn without_session_cookie_check(mut self) -> Self {
		self.config.session_cookie = None;
		self
	}

	pub fn with_token_cookie(mut self, name: impl Into<String>) -> Self {
		self.config.token_cookie = Some(name.into());
		self
	}

	pub fn with_anti_forgery_field(mut self, name: impl Into<String>) -> Self {
		self.config.anti_forgery_field = Some(name.into());
		self
	}

	pub fn without_anti_forgery_token(mut self) -> Self {
		self.config.anti_forgery_field = None;
		self
	}

	pub fn with_username_field(mut self, name: impl Into<String>) -> Self {
		self.config.username_field = Some(name.into());
		self
	}

	pub fn with_password_field(mut self, name: impl Into<String>) -> Self {
		self.config.password_field = Some(name.into());
		self
	}

	pub fn with_api_key_header(mut self, name: impl Into<String>) -> Self {
		self.config.api_key_header = name.into();
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.user_agent = user_agent.into();
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
		self.config.login_timeout = timeout;
		self
	}

	pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
		self.config.max_redirects = max_redirects;
		self
	}

	/// Use a custom transport. It must not follow redirects or keep cookies
	/// of its own.
	pub fn with_transport(mut self, transport: Arc<dyn PortalTransport>) -> Self {
		self.transport = Some(transport);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> PortalResult<PortalClient> {
		let mut config = self.config;
		if let Some(base) = self.base_url {
			config.base_url = parse_base_url(&base)?;
		}
		if let Some(login) = self.login_url {
			config.login_url = parse_url("login URL", &login)?;
		}
		if let Some(api) = self.api_base_url {
			config.api_base_url = Some(parse_url("API base URL", &api)?);
		}
		let credentials = self
			.credentials
			.ok_or_else(|| PortalError::Configuration("credentials are required".into()))?;

		let transport: Arc<dyn PortalTransport> = match self.transport {
			Some(transport) => transport,
			None => Arc::new(
				ReqwestPortalTransport::new(&config.user_agent, config.request_timeout).map_err(
					|err| PortalError::Configuration(format!("http client initialisation: {err}")),
				)?,
			),
		};

		PortalClient::assemble(config, credentials, transport, self.handlers)
	}
}

impl Default for PortalClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Session-authenticated portal client.
///
/// All state (cookie jar, session) is owned by the instance; clones of the
/// data it returns never expose either.
pub struct PortalClient {
	config: PortalConfig,
	credentials: Credentials,
	exchange: HttpExchange,
	tracker: SessionTracker,
	classifier: SessionClassifier,
	metrics: MetricsCollector,
}

impl PortalClient {
	/// Construct a client for the default portal endpoints.
	pub fn new(credentials: Credentials) -> PortalResult<Self> {
		Self::builder().with_credentials(credentials).build()
	}

	/// Obtain a builder to customise the client instance.
	pub fn builder() -> PortalClientBuilder {
		PortalClientBuilder::new()
	}

	/// Credentials and endpoint overrides from the `PORTAL_*` environment
	/// variables.
	pub fn from_env() -> PortalResult<Self> {
		let credentials = Credentials::from_env()?;
		let config = PortalConfig::default().apply_env()?;
		Self::builder()
			.with_config(config)
			.with_credentials(credentials)
			.build()
	}

	fn assemble(
		config: PortalConfig,
		credentials: Credentials,
		transport: Arc<dyn PortalTransport>,
		handlers: Vec<Arc<dyn EventHandler>>,
	) -> PortalResult<Self> {
		let metrics = MetricsCollector::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		for handler in handlers {
			events.register_handler(handler);
		}
		log::debug!("portal client ready with {} event handler(s)", events.len());

		let classifier = SessionClassifier::new(&config.login_url);
		let exchange = HttpExchange::new(transport, Arc::new(events), config.request_timeout);

		Ok(Self {
			config,
			credentials,
			exchange,
			tracker: SessionTracker::new(),
			classifier,
			metrics,
		})
	}

	pub fn config(&self) -> &PortalConfig {
		&self.config
	}

	/// Ensure a session exists. No network traffic when already
	/// authenticated; concurrent callers share one handshake.
	pub async fn login(&self) -> PortalResult<Option<String>> {
		self.drop_session_without_cookie();
		let grant = self.ensure_session(LoginMode::Reuse).await?;
		Ok(grant.token)
	}

	/// Replace the current session with a fresh handshake.
	pub async fn force_login(&self) -> PortalResult<Option<String>> {
		let stale_generation = self.tracker.snapshot().generation();
		let grant = self
			.ensure_session(LoginMode::Replace { stale_generation })
			.await?;
		Ok(grant.token)
	}

	pub fn login_status(&self) -> LoginStatus {
		let state = self.tracker.snapshot();
		LoginStatus {
			authenticated: state.is_authenticated(),
			has_token: state.token().is_some(),
		}
	}

	pub fn state(&self) -> SessionState {
		self.tracker.snapshot()
	}

	pub fn metrics(&self) -> MetricsSnapshot {
		self.metrics.snapshot()
	}

	/// Authenticated GET. Relative URLs resolve against the tenant-portal
	/// base URL.
	pub async fn fetch(&self, url: &str) -> PortalResult<PortalResponse> {
		self.fetch_with(url, FetchOptions::default()).await
	}

	pub async fn fetch_with(&self, url: &str, options: FetchOptions) -> PortalResult<PortalResponse> {
		let url = match Url::parse(url) {
			Ok(url) => url,
			Err(url::ParseError::RelativeUrlWithoutBase) => self.config.resolve_page(url)?,
			Err(err) => return Err(err.into()),
		};
		self.fetch_url(url, options).await
	}

	/// Fetch a tenant-portal page and parse it when it is HTML.
	pub async fn page(&self, relative_path: &str) -> PortalResult<PortalPage> {
		let url = self.config.resolve_page(relative_path)?;
		let options = FetchOptions::new().with_header(
			ACCEPT.as_str(),
			"text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
		);
		let response = self.fetch_url(url, options).await?;
		let document = response
			.is_html()
			.then(|| ParsedDocument::parse(&String::from_utf8_lossy(&response.body)));
		Ok(PortalPage { response, document })
	}

	async fn fetch_url(&self, url: Url, options: FetchOptions) -> PortalResult<PortalResponse> {
		let result = self.fetch_authenticated(&url, &options).await;
		if let Err(err) = &result {
			self.exchange.events().dispatch(SessionEvent::Error(ErrorEvent {
				url: url.to_string(),
				error: err.to_string(),
				timestamp: Utc::now(),
			}));
		}
		result
	}

	async fn fetch_authenticated(
		&self,
		url: &Url,
		options: &FetchOptions,
	) -> PortalResult<PortalResponse> {
		let base_headers = options.to_headers()?;
		self.drop_session_without_cookie();
		let mut grant = self.ensure_session(LoginMode::Reuse).await?;
		let mut attempt = 1u32;

		loop {
			let request = TransportRequest::new(options.method.clone(), url.clone())
				.with_headers(base_headers.clone())
				.with_body(options.body.clone());
			let api_headers = self.api_headers(&grant)?;
			let decorate = |hop: &mut TransportRequest| {
				if self.config.is_api_url(&hop.url) {
					for (name, value) in &api_headers {
						hop.headers.insert(name.clone(), value.clone());
					}
				}
			};
			let stop_at = |target: &Url| self.classifier.is_login_url(target);
			let policy = FollowPolicy {
				max_redirects: self.config.max_redirects,
				stop_at: &stop_at,
				decorate: &decorate,
			};

			let response = self
				.exchange
				.follow(request, Traffic::Caller, attempt, &policy)
				.await?;

			match self.classifier.classify(&response) {
				SessionVerdict::Authenticated => {
					return Ok(PortalResponse::from_transport(response));
				}
				SessionVerdict::Expired(signal) if attempt == 1 => {
					self.exchange.events().dispatch(SessionEvent::Retry(RetryEvent {
						url: url.clone(),
						attempt: attempt + 1,
						reason: signal.as_str().to_string(),
						timestamp: Utc::now(),
					}));
					grant = self
						.ensure_session(LoginMode::Replace {
							stale_generation: Some(grant.generation),
						})
						.await?;
					attempt += 1;
				}
				SessionVerdict::Expired(signal) => {
					log::warn!(
						"session still expired ({}) after re-authenticating for {}",
						signal.as_str(),
						url
					);
					self.metrics.record_session_expired();
					return Err(PortalError::SessionExpired {
						url: url.to_string(),
					});
				}
				SessionVerdict::Redirect(_) | SessionVerdict::Unexpected => {
					return Err(PortalError::UnexpectedResponse {
						status: response.status,
						url: response.url.to_string(),
					});
				}
			}
		}
	}

	/// Bearer token and API key for requests to the API host.
	fn api_headers(&self, grant: &SessionGrant) -> PortalResult<Vec<(HeaderName, HeaderValue)>> {
		let mut headers = Vec::new();
		if self.config.api_base_url.is_none() {
			return Ok(headers);
		}
		if let Some(token) = &grant.token {
			let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
				.map_err(|err| PortalError::InvalidHeader(format!("authorization: {err}")))?;
			value.set_sensitive(true);
			headers.push((AUTHORIZATION, value));
		}
		if let Some(api_key) = self.credentials.api_key() {
			let name = HeaderName::from_bytes(self.config.api_key_header.as_bytes()).map_err(
				|err| PortalError::InvalidHeader(format!("{}: {err}", self.config.api_key_header)),
			)?;
			let mut value = HeaderValue::from_str(api_key)
				.map_err(|err| PortalError::InvalidHeader(format!("api key: {err}")))?;
			value.set_sensitive(true);
			headers.push((name, value));
		}
		Ok(headers)
	}

	/// A session whose cookie is gone or expired cannot be valid any more.
	fn drop_session_without_cookie(&self) {
		let Some(cookie) = &self.config.session_cookie else {
			return;
		};
		if !self.tracker.is_authenticated() || self.exchange.jar().has_live(cookie) {
			return;
		}
		if self.tracker.invalidate() {
			log::info!("session cookie {cookie} missing or expired, re-authenticating");
		}
	}

	async fn ensure_session(&self, mode: LoginMode) -> PortalResult<SessionGrant> {
		loop {
			match self.tracker.begin(mode) {
				LoginTicket::Ready(grant) => return Ok(grant),
				LoginTicket::Wait(pending) => {
					let handshake_id = pending.id;
					match pending.wait().await {
						Some(outcome) => return outcome,
						None => log::debug!("login #{handshake_id} was abandoned, starting over"),
					}
				}
				LoginTicket::Lead(lease) => {
					self.clear_session_cookies();
					let forced = matches!(mode, LoginMode::Replace { .. });
					let handshake = LoginHandshake::new(
						&self.exchange,
						&self.config,
						&self.credentials,
						&self.classifier,
					);
					let result = handshake.run(lease.id(), forced).await;
					return lease.complete(result);
				}
			}
		}
	}

	/// Stale session cookies must not satisfy the post-login check.
	fn clear_session_cookies(&self) {
		let mut jar = self.exchange.jar();
		for name in [&self.config.session_cookie, &self.config.token_cookie]
			.into_iter()
			.flatten()
		{
			jar.remove(name);
		}
	}
}
