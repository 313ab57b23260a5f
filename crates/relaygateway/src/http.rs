use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use once_cell::sync::Lazy;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = BoxBody<Bytes, BoxError>;
pub type Request<B = Body> = ::http::Request<B>;
pub type Response<B = Body> = ::http::Response<B>;

pub use ::http::uri::{Authority, Scheme};
pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri};

/// Refusal signal the relay attaches to a blocked CONNECT target.
pub const FORBIDDEN_HOST_HEADER: HeaderName = HeaderName::from_static("x-hola-error");
pub const FORBIDDEN_HOST_VALUE: &str = "Forbidden Host";

/// Hop-by-hop headers. These are removed both on the way to the relay and on
/// the way back to the client.
pub static HOP_BY_HOP_HEADERS: Lazy<[HeaderName; 8]> = Lazy::new(|| {
	[
		header::CONNECTION,
		HeaderName::from_static("keep-alive"),
		header::PROXY_AUTHENTICATE,
		HeaderName::from_static("proxy-connection"),
		header::TE,
		HeaderName::from_static("trailers"),
		header::TRANSFER_ENCODING,
		header::UPGRADE,
	]
});

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
	for h in HOP_BY_HOP_HEADERS.iter() {
		headers.remove(h);
	}
}

pub fn is_forbidden_host(status: StatusCode, headers: &HeaderMap) -> bool {
	status == StatusCode::FORBIDDEN
		&& headers
			.get(&FORBIDDEN_HOST_HEADER)
			.and_then(|v| v.to_str().ok())
			.map(|v| v == FORBIDDEN_HOST_VALUE)
			.unwrap_or(false)
}

pub fn full(data: impl Into<Bytes>) -> Body {
	Full::new(data.into()).map_err(|e| match e {}).boxed()
}

pub fn empty() -> Body {
	Empty::new().map_err(|e| match e {}).boxed()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strips_entire_hop_by_hop_set() {
		let mut headers = HeaderMap::new();
		headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
		headers.insert("keep-alive", "timeout=5".parse().unwrap());
		headers.insert(header::PROXY_AUTHENTICATE, "Basic".parse().unwrap());
		headers.insert("proxy-connection", "keep-alive".parse().unwrap());
		headers.insert(header::TE, "trailers".parse().unwrap());
		headers.insert("trailers", "x-checksum".parse().unwrap());
		headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());
		headers.insert(header::UPGRADE, "websocket".parse().unwrap());
		headers.insert(header::HOST, "example.com".parse().unwrap());

		strip_hop_by_hop(&mut headers);
		assert_eq!(headers.len(), 1);
		assert!(headers.contains_key(header::HOST));
	}

	#[test]
	fn forbidden_host_requires_status_and_header() {
		let mut headers = HeaderMap::new();
		assert!(!is_forbidden_host(StatusCode::FORBIDDEN, &headers));
		headers.insert(&FORBIDDEN_HOST_HEADER, "Forbidden Host".parse().unwrap());
		assert!(is_forbidden_host(StatusCode::FORBIDDEN, &headers));
		assert!(!is_forbidden_host(StatusCode::OK, &headers));
		headers.insert(&FORBIDDEN_HOST_HEADER, "Other".parse().unwrap());
		assert!(!is_forbidden_host(StatusCode::FORBIDDEN, &headers));
	}
}
