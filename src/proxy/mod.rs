pub mod context;
pub mod gateway;
pub mod llm;
pub mod mcp;
pub mod mq;
pub mod preprocess;
pub mod rest;
pub mod router;
pub mod write;
pub mod ws;

pub use gateway::Gateway;
use serde_json::json;

use crate::client::ClientError;
use crate::http::{Body, HeaderValue, Response, StatusCode, header, x_headers};

/// Everything the data plane can fail with. Each variant carries its HTTP
/// mapping; bodies are the uniform JSON error envelope.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
	#[error("route not found")]
	RouteNotFound,
	#[error("{0}")]
	Validation(String),
	#[error("{0}")]
	Unauthorized(String),
	#[error("{0}")]
	NotFound(String),
	#[error("rate limit exceeded")]
	RateLimited,
	#[error("preprocess timed out")]
	PreprocessTimeout,
	#[error("upstream call failed: {0}")]
	Upstream(ClientError),
	#[error("processing failed: {0}")]
	Internal(#[from] anyhow::Error),
}

impl GatewayError {
	pub fn status(&self) -> StatusCode {
		match self {
			GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
			GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
			GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
			GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
			GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
			GatewayError::PreprocessTimeout => StatusCode::GATEWAY_TIMEOUT,
			GatewayError::Upstream(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
			GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
			GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn error_type(&self) -> &'static str {
		match self {
			GatewayError::RouteNotFound | GatewayError::NotFound(_) => "not_found",
			GatewayError::Validation(_) => "validation",
			GatewayError::Unauthorized(_) => "unauthorized",
			GatewayError::RateLimited => "rate_limited",
			GatewayError::PreprocessTimeout => "timeout",
			GatewayError::Upstream(e) if e.is_timeout() => "timeout",
			GatewayError::Upstream(e) if e.is_canceled() => "canceled",
			GatewayError::Upstream(_) => "upstream",
			GatewayError::Internal(_) => "internal",
		}
	}

	pub fn into_response(self, request_id: &str) -> Response {
		let status = self.status();
		error_response(status, self.error_type(), &self.to_string(), request_id)
	}
}

/// `{"error":{"message","type","code"}}` with the request id echoed back.
pub fn error_response(
	status: StatusCode,
	error_type: &str,
	message: &str,
	request_id: &str,
) -> Response {
	let body = json!({
		"error": {
			"message": message,
			"type": error_type,
			"code": status.as_u16(),
		}
	});
	let mut resp = ::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("static response builds");
	if let Ok(v) = HeaderValue::try_from(request_id) {
		resp.headers_mut().insert(x_headers::X_REQUEST_ID, v);
	}
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn statuses_match_categories() {
		assert_eq!(GatewayError::RouteNotFound.status(), StatusCode::NOT_FOUND);
		assert_eq!(
			GatewayError::Validation("x".into()).status(),
			StatusCode::BAD_REQUEST
		);
		assert_eq!(
			GatewayError::Unauthorized("x".into()).status(),
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			GatewayError::Upstream(ClientError::Network("r".into())).status(),
			StatusCode::BAD_GATEWAY
		);
		assert_eq!(
			GatewayError::Upstream(ClientError::TimedOut {
				stage: crate::client::TimeoutStage::Call
			})
			.status(),
			StatusCode::GATEWAY_TIMEOUT
		);
	}

	#[tokio::test]
	async fn envelope_shape() {
		use http_body_util::BodyExt;
		let resp = GatewayError::Validation("missing model".into()).into_response("req-1");
		assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
		assert_eq!(
			resp.headers().get(x_headers::X_REQUEST_ID).unwrap(),
			"req-1"
		);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(v["error"]["message"], "missing model");
		assert_eq!(v["error"]["type"], "validation");
		assert_eq!(v["error"]["code"], 400);
	}
}
