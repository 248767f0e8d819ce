//! Metrics collection utilities.
//!
//! Aggregates request, status-class, login and retry counters plus latency
//! percentiles for one portal client.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::events::LoginPhase;

/// Point-in-time copy of the collected metrics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub started_at: DateTime<Utc>,
    /// Transport exchanges, redirect hops and login traffic included.
    pub total_requests: u64,
    pub login_requests: u64,
    pub status_2xx: u64,
    pub status_3xx: u64,
    pub status_4xx: u64,
    pub status_5xx: u64,
    pub failed_requests: u64,
    pub login_handshakes: u64,
    pub forced_logins: u64,
    pub credential_submissions: u64,
    pub login_successes: u64,
    pub login_failures: u64,
    pub reauthentications: u64,
    pub session_expired: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl MetricsSnapshot {
    /// Responses received, all status classes.
    pub fn total_responses(&self) -> u64 {
        self.status_2xx + self.status_3xx + self.status_4xx + self.status_5xx
    }
}

#[derive(Debug)]
struct MetricsState {
    started_at: DateTime<Utc>,
    total_requests: u64,
    login_requests: u64,
    status_classes: [u64; 4],
    failed_requests: u64,
    login_handshakes: u64,
    forced_logins: u64,
    credential_submissions: u64,
    login_successes: u64,
    login_failures: u64,
    reauthentications: u64,
    session_expired: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            started_at: Utc::now(),
            total_requests: 0,
            login_requests: 0,
            status_classes: [0; 4],
            failed_requests: 0,
            login_handshakes: 0,
            forced_logins: 0,
            credential_submissions: 0,
            login_successes: 0,
            login_failures: 0,
            reauthentications: 0,
            session_expired: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
        }
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        let p95 = samples[p95_index];
        (Some(Duration::from_secs_f64(avg)), Some(p95))
    }
}

/// Thread-safe metrics collector shared by the client and its handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    /// Keep the last `window` latency samples (at least 16).
    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_request(&self, during_login: bool) {
        let mut guard = self.lock();
        guard.total_requests += 1;
        if during_login {
            guard.login_requests += 1;
        }
    }

    pub fn record_response(&self, status: u16, latency: Duration) {
        let mut guard = self.lock();
        let class = match status {
            200..=299 => Some(0),
            300..=399 => Some(1),
            400..=499 => Some(2),
            500..=599 => Some(3),
            _ => None,
        };
        if let Some(class) = class {
            guard.status_classes[class] += 1;
        }

        if guard.latencies.len() == guard.max_window {
            guard.latencies.pop_front();
        }
        guard.latencies.push_back(latency);
    }

    pub fn record_login(&self, phase: LoginPhase, forced: bool) {
        let mut guard = self.lock();
        match phase {
            LoginPhase::Started => {
                guard.login_handshakes += 1;
                if forced {
                    guard.forced_logins += 1;
                }
            }
            LoginPhase::CredentialsSubmitted => guard.credential_submissions += 1,
            LoginPhase::Succeeded => guard.login_successes += 1,
            LoginPhase::Failed => guard.login_failures += 1,
        }
    }

    pub fn record_reauthentication(&self) {
        self.lock().reauthentications += 1;
    }

    pub fn record_session_expired(&self) {
        self.lock().session_expired += 1;
    }

    pub fn record_failure(&self) {
        self.lock().failed_requests += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let (average_latency, p95_latency) = guard.latency_stats();
        let [status_2xx, status_3xx, status_4xx, status_5xx] = guard.status_classes;
        MetricsSnapshot {
            started_at: guard.started_at,
            total_requests: guard.total_requests,
            login_requests: guard.login_requests,
            status_2xx,
            status_3xx,
            status_4xx,
            status_5xx,
            failed_requests: guard.failed_requests,
            login_handshakes: guard.login_handshakes,
            forced_logins: guard.forced_logins,
            credential_submissions: guard.credential_submissions,
            login_successes: guard.login_successes,
            login_failures: guard.login_failures,
            reauthentications: guard.reauthentications,
            session_expired: guard.session_expired,
            average_latency,
            p95_latency,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
