//! Single-hop exchanges and manual redirect following.
//!
//! Every hop reads the `Cookie` header fresh from the jar and writes the
//! hop's `Set-Cookie` headers back under one lock, so readers never observe a
//! half-applied response.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE};
use http::{HeaderValue, Method};
use url::Url;

use crate::modules::cookies::CookieJar;
use crate::modules::events::{EventDispatcher, RequestEvent, ResponseEvent, SessionEvent};
use crate::portal::{PortalError, PortalResult};
use crate::session::core::{
    PortalTransport, TransportError, TransportRequest, TransportResponse,
};

/// Whether a hop belongs to the login handshake or to caller traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    Login,
    Caller,
}

/// Redirect policy for one logical request.
pub struct FollowPolicy<'a> {
    pub max_redirects: usize,
    /// Redirect targets for which the redirect response itself is returned
    /// instead of being followed.
    pub stop_at: &'a (dyn Fn(&Url) -> bool + Sync),
    /// Called on every hop before it is sent, e.g. to attach per-host
    /// authorization headers.
    pub decorate: &'a (dyn Fn(&mut TransportRequest) + Sync),
}

/// Transport plus the cookie jar it feeds.
pub struct HttpExchange {
    transport: Arc<dyn PortalTransport>,
    jar: Mutex<CookieJar>,
    events: Arc<EventDispatcher>,
    request_timeout: Duration,
}

impl HttpExchange {
    pub fn new(
        transport: Arc<dyn PortalTransport>,
        events: Arc<EventDispatcher>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            jar: Mutex::new(CookieJar::new()),
            events,
            request_timeout,
        }
    }

    pub fn jar(&self) -> MutexGuard<'_, CookieJar> {
        self.jar.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Send exactly one request with the jar's matching cookies attached.
    pub async fn send(
        &self,
        mut request: TransportRequest,
        traffic: Traffic,
        attempt: u32,
    ) -> PortalResult<TransportResponse> {
        request.headers.remove(COOKIE);
        let cookie_header = self.jar().request_header(&request.url);
        if let Some(cookie_header) = cookie_header {
            let value = HeaderValue::from_str(&cookie_header)
                .map_err(|err| PortalError::InvalidHeader(format!("cookie header: {err}")))?;
            request.headers.insert(COOKIE, value);
        }

        let during_login = traffic == Traffic::Login;
        let method = request.method.clone();
        let url = request.url.clone();
        self.events.dispatch(SessionEvent::Request(RequestEvent {
            url: url.clone(),
            method: method.clone(),
            attempt,
            during_login,
            timestamp: Utc::now(),
        }));

        let started = Instant::now();
        let response = tokio::time::timeout(self.request_timeout, self.transport.execute(request))
            .await
            .map_err(|_| {
                TransportError::Timeout(format!(
                    "no response from {url} within {:?}",
                    self.request_timeout
                ))
            })??;
        let latency = started.elapsed();

        let stored = self
            .jar()
            .store_response_cookies(&response.url, &response.headers);
        if stored > 0 {
            log::trace!("captured {stored} cookie(s) from {}", response.url);
        }

        self.events.dispatch(SessionEvent::Response(ResponseEvent {
            url,
            method,
            status: response.status,
            latency,
            during_login,
            timestamp: Utc::now(),
        }));

        Ok(response)
    }

    /// Send `request` and follow its redirect chain hop by hop.
    ///
    /// 301/302/303 turn into a body-less GET (HEAD stays HEAD); 307/308 keep
    /// the method and body. Authorization is dropped when a hop leaves the
    /// original host.
    pub async fn follow(
        &self,
        request: TransportRequest,
        traffic: Traffic,
        attempt: u32,
        policy: &FollowPolicy<'_>,
    ) -> PortalResult<TransportResponse> {
        let origin_host = request.url.host_str().map(str::to_ascii_lowercase);
        let TransportRequest {
            mut method,
            mut url,
            mut headers,
            mut body,
        } = request;
        let mut redirects = 0usize;

        loop {
            let mut hop = TransportRequest::new(method.clone(), url.clone())
                .with_headers(headers.clone())
                .with_body(body.clone());
            (policy.decorate)(&mut hop);

            let response = self.send(hop, traffic, attempt).await?;
            let Some(target) = response.redirect_target() else {
                return Ok(response);
            };
            if (policy.stop_at)(&target) {
                return Ok(response);
            }
            if redirects == policy.max_redirects {
                return Err(PortalError::TooManyRedirects {
                    limit: policy.max_redirects,
                    url: target.to_string(),
                });
            }
            redirects += 1;

            if matches!(response.status, 301..=303) && method != Method::HEAD {
                method = Method::GET;
                body = None;
                headers.remove(CONTENT_TYPE);
                headers.remove(CONTENT_LENGTH);
            }
            let same_host = match (&origin_host, target.host_str()) {
                (Some(origin), Some(host)) => origin.eq_ignore_ascii_case(host),
                _ => false,
            };
            if !same_host {
                headers.remove(AUTHORIZATION);
            }
            log::debug!("following redirect {} -> {}", response.status, target);
            url = target;
        }
    }
}
