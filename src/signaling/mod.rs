//! Signaling for WebRTC connection establishment.
//!
//! - WHIP Server: HTTP POST offer/answer, one request per peer (RFC 9725)
//! - WHIP Client: opens one session against a WHIP server

pub mod whip;
pub mod whip_client;

pub use whip::*;
pub use whip_client::*;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Response, StatusCode};

/// Build a response without panicking on bad header values.
///
/// Headers whose value cannot be encoded are dropped.
pub(crate) fn build_response(
    status: StatusCode,
    headers: &[(HeaderName, &str)],
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    for (name, value) in headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            response.headers_mut().insert(name.clone(), value);
        }
    }
    response
}
