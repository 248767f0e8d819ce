//! Cross-cutting services module
//!
//! Cookie storage, session state, events and metrics used by the portal
//! client.

pub mod cookies;
pub mod events;
pub mod metrics;
pub mod state;

pub use cookies::{Cookie, CookieJar};
pub use events::{
    ErrorEvent, EventDispatcher, EventHandler, LoggingHandler, LoginEvent, LoginPhase,
    MetricsHandler, RequestEvent, ResponseEvent, RetryEvent, SessionEvent,
};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use state::{
    LoginLease, LoginMode, LoginOutcome, LoginTicket, PendingLogin, SessionGrant, SessionState,
    SessionTracker,
};
