//! Session layer: transport seam, login handshake, redirect following and
//! expiry classification.

pub mod classifier;
pub mod core;
pub mod exchange;
pub mod handshake;

pub use classifier::{ExpirySignal, SessionClassifier, SessionVerdict};
pub use exchange::{FollowPolicy, HttpExchange, Traffic};
pub use handshake::LoginHandshake;
