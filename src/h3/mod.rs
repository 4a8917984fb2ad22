//! HTTP/3 (RFC 9114) client engine.
//!
//! - `varint`, `frame`: wire codec for stream framing and SETTINGS
//! - `qpack`: static-table-only header compression
//! - `dispatcher`: handling of peer-initiated streams
//! - `client`: dial-once connection manager and the request exchange
//! - `round_tripper`: one client per destination

pub mod body;
pub mod client;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod qpack;
pub mod request;
pub mod round_tripper;
pub mod varint;

pub use body::Body;
pub use client::{Client, METHOD_GET_0RTT};
pub use dispatcher::StreamType;
pub use error::{ErrorCode, ErrorScope};
pub use frame::{Frame, FrameType, Hijack, Settings};
pub use request::RequestBody;
pub use round_tripper::{RoundTripOpt, RoundTripper};
