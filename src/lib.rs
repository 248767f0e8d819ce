//! # tenant-portal
//!
//! Async client for a property-management tenant portal that only offers an
//! HTML login form and no public API.
//!
//! The client logs in through the portal's form, keeps the resulting cookies
//! in its own jar, and transparently re-authenticates when the session
//! expires. Every data accessor goes through one of two entry points:
//!
//! - [`PortalClient::fetch`] for an arbitrary URL,
//! - [`PortalClient::page`] for a tenant-portal page parsed into a
//!   [`ParsedDocument`].
//!
//! ## Features
//!
//! - Login handshake with anti-forgery token echo and manual redirect following
//! - At most one login in flight, shared by every concurrent caller
//! - Exactly one retry after re-authenticating, never a loop
//! - Per-client cookie jar with expiry handling
//! - Request and login events feeding `log` and a metrics collector
//!
//! ## Example
//!
//! ```no_run
//! use tenant_portal::PortalClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = PortalClient::from_env()?;
//!     let page = client.page("Deliveries/Deliveries.aspx").await?;
//!     for row in page.document()?.select("table tr")? {
//!         println!("{}", row.text);
//!     }
//!     Ok(())
//! }
//! ```

mod portal;

pub mod config;
pub mod document;
pub mod modules;
pub mod session;

pub use crate::portal::{
    FetchOptions,
    LoginStatus,
    PortalClient,
    PortalClientBuilder,
    PortalError,
    PortalPage,
    PortalResponse,
    PortalResult,
};

pub use crate::config::{Credentials, PortalConfig};

pub use crate::document::{DocumentError, ElementSnapshot, ParsedDocument};

pub use crate::session::core::{
    LoginFormError,
    PortalTransport,
    ReqwestPortalTransport,
    TransportError,
    TransportRequest,
    TransportResponse,
};

pub use crate::session::{ExpirySignal, SessionClassifier, SessionVerdict};

pub use crate::modules::{
    Cookie,
    CookieJar,
    ErrorEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    LoginEvent,
    LoginPhase,
    MetricsCollector,
    MetricsHandler,
    MetricsSnapshot,
    RequestEvent,
    ResponseEvent,
    RetryEvent,
    SessionEvent,
    SessionState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
