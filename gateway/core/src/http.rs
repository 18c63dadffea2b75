use bytes::Bytes;
use http::{header, Response, StatusCode};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The body type of every response served by the gateway.
pub type BoxBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn empty() -> BoxBody {
    Empty::new().map_err(|never| match never {}).boxed_unsync()
}

pub fn full(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Builds a plain-text response carrying only the status' canonical reason.
///
/// Used for every failure the gateway reports to clients, so no internal error
/// detail ever leaks into a response body.
pub fn status(status: StatusCode) -> Response<BoxBody> {
    let reason = status.canonical_reason().unwrap_or("Error");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(full(format!("{reason}\n")))
        .expect("status response must be valid")
}
