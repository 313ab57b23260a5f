pub mod handler;
pub mod splice;

use crate::http::{Body, Response, StatusCode, full};
use crate::transport::DialError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("upstream dial failed: {0}")]
	Dial(#[from] DialError),
	#[error("upstream request failed: {0}")]
	Upstream(#[from] hyper_util::client::legacy::Error),
	#[error("upstream response failed: {0}")]
	UpstreamResponse(#[from] hyper::Error),
	#[error("destination {0} could not be resolved")]
	Resolve(String),
	#[error("invalid request")]
	InvalidRequest,
	#[error("request processing failed: {0}")]
	Processing(String),
}

impl ProxyError {
	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::Dial(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
			ProxyError::UpstreamResponse(_) => StatusCode::BAD_GATEWAY,
			ProxyError::Resolve(_) => StatusCode::BAD_GATEWAY,
			ProxyError::InvalidRequest => StatusCode::BAD_REQUEST,
			ProxyError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn into_response(self) -> Response<Body> {
		let msg = self.to_string();
		::http::Response::builder()
			.status(self.status())
			.header(::http::header::CONTENT_TYPE, "text/plain")
			.body(full(msg))
			.expect("static response must build")
	}
}
