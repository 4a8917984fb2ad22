//! # specter-h3
//!
//! HTTP/3 client protocol engine.
//!
//! Turns `http::Request`s into HTTP/3 exchanges over a multiplexed QUIC
//! connection: SETTINGS negotiation on the control stream, dispatch of
//! server-initiated streams (with hijack callbacks for unknown types), the
//! request/response exchange with per-request cancellation, and response
//! bodies with transparent gzip.
//!
//! The QUIC connection itself sits behind [`transport::Connection`]; the
//! crate ships a quiche-backed dialer and an in-process pair.

pub mod config;
pub mod context;
pub mod error;
pub mod h3;
pub mod response;
pub mod transport;

// Re-exports
pub use config::ClientOptions;
pub use context::{CancelHandle, Context};
pub use error::{Error, Result};
pub use h3::{Client, RequestBody, RoundTripOpt, RoundTripper};
pub use response::{ContentLength, Response};
