//! Login handshake.
//!
//! GET the login page, echo its hidden fields back together with the
//! credentials, follow the redirect chain and decide whether the portal
//! accepted the session.

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use crate::config::{Credentials, PortalConfig};
use crate::modules::events::{LoginEvent, LoginPhase, SessionEvent};
use crate::portal::{PortalError, PortalResult};
use crate::session::classifier::SessionClassifier;
use crate::session::core::{
    LoginFormHints, LoginSubmission, TransportRequest, TransportResponse, contains_login_form,
    locate_access_token, parse_login_form, validation_message,
};
use crate::session::exchange::{FollowPolicy, HttpExchange, Traffic};

/// One run of the login sequence. Borrowed from the client for the duration
/// of a single `Authenticating` period.
pub struct LoginHandshake<'a> {
    exchange: &'a HttpExchange,
    config: &'a PortalConfig,
    credentials: &'a Credentials,
    classifier: &'a SessionClassifier,
    hints: LoginFormHints,
}

impl<'a> LoginHandshake<'a> {
    pub fn new(
        exchange: &'a HttpExchange,
        config: &'a PortalConfig,
        credentials: &'a Credentials,
        classifier: &'a SessionClassifier,
    ) -> Self {
        Self {
            exchange,
            config,
            credentials,
            classifier,
            hints: LoginFormHints {
                username_field: config.username_field.clone(),
                password_field: config.password_field.clone(),
                anti_forgery_field: config.anti_forgery_field.clone(),
            },
        }
    }

    /// Run the handshake bounded by the configured login timeout. Returns the
    /// bearer token when the portal exposes one.
    pub async fn run(&self, handshake_id: u64, forced: bool) -> PortalResult<Option<String>> {
        self.emit(handshake_id, LoginPhase::Started, forced, None);

        let result =
            match tokio::time::timeout(self.config.login_timeout, self.perform(handshake_id, forced))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(PortalError::LoginTimeout(self.config.login_timeout)),
            };

        match &result {
            Ok(_) => self.emit(handshake_id, LoginPhase::Succeeded, forced, None),
            Err(err) => self.emit(handshake_id, LoginPhase::Failed, forced, Some(err.to_string())),
        }
        result
    }

    async fn perform(&self, handshake_id: u64, forced: bool) -> PortalResult<Option<String>> {
        let login_page = self
            .exchange
            .follow(
                TransportRequest::get(self.config.login_url.clone()),
                Traffic::Login,
                1,
                &self.policy(),
            )
            .await?;

        if !(200..300).contains(&login_page.status) {
            return Err(PortalError::UnexpectedResponse {
                status: login_page.status,
                url: login_page.url.to_string(),
            });
        }

        let blueprint = parse_login_form(&login_page.body_text(), &self.hints)?;
        let submission = blueprint.to_submission(
            &login_page.url,
            &self.hints,
            self.credentials.username(),
            self.credentials.password(),
        )?;
        log::debug!(
            "submitting login form to {} with fields {:?}",
            submission.url,
            submission
        );

        let request = submission_request(&submission)?;
        self.emit(handshake_id, LoginPhase::CredentialsSubmitted, forced, None);
        let landing = self
            .exchange
            .follow(request, Traffic::Login, 1, &self.policy())
            .await?;

        self.evaluate_landing(&landing)
    }

    fn evaluate_landing(&self, landing: &TransportResponse) -> PortalResult<Option<String>> {
        let body = landing.body_text();

        if self.classifier.is_login_url(&landing.url)
            || ((200..300).contains(&landing.status) && contains_login_form(&body))
        {
            return Err(PortalError::CredentialsRejected {
                message: validation_message(&body),
            });
        }

        if !(200..300).contains(&landing.status) {
            return Err(PortalError::UnexpectedResponse {
                status: landing.status,
                url: landing.url.to_string(),
            });
        }

        let jar = self.exchange.jar();
        if let Some(cookie) = &self.config.session_cookie
            && !jar.has_live(cookie)
        {
            return Err(PortalError::SessionCookieMissing {
                cookie: cookie.clone(),
            });
        }

        let token = self
            .config
            .token_cookie
            .as_deref()
            .and_then(|name| jar.get(name))
            .map(|cookie| cookie.value().to_string())
            .or_else(|| locate_access_token(&body));
        Ok(token)
    }

    fn policy(&self) -> FollowPolicy<'static> {
        FollowPolicy {
            max_redirects: self.config.max_redirects,
            stop_at: &never,
            decorate: &undecorated,
        }
    }

    fn emit(&self, handshake_id: u64, phase: LoginPhase, forced: bool, detail: Option<String>) {
        self.exchange.events().dispatch(SessionEvent::Login(LoginEvent {
            handshake_id,
            phase,
            forced,
            detail,
            timestamp: Utc::now(),
        }));
    }
}

fn never(_: &url::Url) -> bool {
    false
}

fn undecorated(_: &mut TransportRequest) {}

fn submission_request(submission: &LoginSubmission) -> PortalResult<TransportRequest> {
    let mut headers = HeaderMap::new();
    for (name, value) in &submission.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|err| PortalError::InvalidHeader(format!("{name}: {err}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|err| PortalError::InvalidHeader(format!("{name}: {err}")))?;
        headers.insert(name, value);
    }

    Ok(TransportRequest::new(Method::POST, submission.url.clone())
        .with_headers(headers)
        .with_body(Some(Bytes::from(submission.encoded_body()))))
}
