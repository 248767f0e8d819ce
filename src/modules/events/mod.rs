//! Event system for session activity.
//!
//! Provides hooks for metrics, logging, and custom reactions around requests,
//! login handshakes, and re-authentication retries.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;

/// Structured pre-request event. One per transport exchange, redirect hops
/// included.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub url: Url,
    pub method: Method,
    pub attempt: u32,
    pub during_login: bool,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub during_login: bool,
    pub timestamp: DateTime<Utc>,
}

/// Phase reached by a login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPhase {
    Started,
    CredentialsSubmitted,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct LoginEvent {
    pub handshake_id: u64,
    pub phase: LoginPhase,
    pub forced: bool,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub url: Url,
    pub attempt: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub url: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Login(LoginEvent),
    Retry(RetryEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &SessionEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: SessionEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Logs events using the `log` crate. Only URLs, statuses and error texts are
/// logged; cookies, tokens and credentials never reach an event.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Request(request) => {
                log::debug!(
                    "-> {} {}{}",
                    request.method,
                    request.url,
                    if request.during_login { " (login)" } else { "" }
                );
            }
            SessionEvent::Response(response) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    response.method,
                    response.url,
                    response.status,
                    response.latency.as_secs_f64()
                );
            }
            SessionEvent::Login(login) => match login.phase {
                LoginPhase::Started => {
                    log::info!("login #{} started (forced={})", login.handshake_id, login.forced);
                }
                LoginPhase::CredentialsSubmitted => {
                    log::debug!("login #{} credentials submitted", login.handshake_id);
                }
                LoginPhase::Succeeded => {
                    log::info!("login #{} succeeded", login.handshake_id);
                }
                LoginPhase::Failed => {
                    log::warn!(
                        "login #{} failed: {}",
                        login.handshake_id,
                        login.detail.as_deref().unwrap_or("unknown error")
                    );
                }
            },
            SessionEvent::Retry(retry) => {
                log::info!(
                    "session expired ({}), retrying {} (attempt {})",
                    retry.reason,
                    retry.url,
                    retry.attempt
                );
            }
            SessionEvent::Error(error) => {
                log::warn!("request {} failed: {}", error.url, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Request(request) => {
                self.metrics.record_request(request.during_login);
            }
            SessionEvent::Response(response) => {
                self.metrics.record_response(response.status, response.latency);
            }
            SessionEvent::Login(login) => self.metrics.record_login(login.phase, login.forced),
            SessionEvent::Retry(_) => self.metrics.record_reauthentication(),
            SessionEvent::Error(_) => self.metrics.record_failure(),
        }
    }
}
