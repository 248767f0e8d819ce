//! Core utilities shared by the handshake, classifier, and fetch layers.

pub mod analysis;
pub mod transport;
pub mod types;

pub use analysis::{
    LoginFormBlueprint, LoginFormError, LoginFormHints, contains_login_form, locate_access_token,
    origin_from_url, parse_login_form, validation_message,
};
pub use transport::{PortalTransport, ReqwestPortalTransport, TransportError};
pub use types::{LoginSubmission, TransportRequest, TransportResponse};
