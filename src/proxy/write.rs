use anyhow::Context as _;
use bytes::Bytes;
use http_body_util::BodyExt;

use super::GatewayError;
use crate::http::{Body, HeaderValue, Response, header};
use crate::types::asset::StreamMode;

/// Emit `upstream` in the asset's configured mode. Buffered responses carry
/// an exact Content-Length; chunked responses stream the body through
/// frame-by-frame (each chunk is flushed as it arrives) with no length.
pub async fn respond(mode: StreamMode, upstream: Response) -> Result<Response, GatewayError> {
	match mode {
		StreamMode::Buffered => buffered(upstream).await,
		StreamMode::Chunked => Ok(chunked(upstream)),
	}
}

pub async fn buffered(upstream: Response) -> Result<Response, GatewayError> {
	let (mut parts, body) = upstream.into_parts();
	let bytes = body
		.collect()
		.await
		.map_err(|e| GatewayError::Internal(anyhow::anyhow!(e).context("buffering upstream body")))?
		.to_bytes();
	parts.headers.remove(header::TRANSFER_ENCODING);
	parts
		.headers
		.insert(header::CONTENT_LENGTH, HeaderValue::from(bytes.len() as u64));
	Ok(Response::from_parts(parts, Body::from(bytes)))
}

pub fn chunked(upstream: Response) -> Response {
	let (mut parts, body) = upstream.into_parts();
	parts.headers.remove(header::CONTENT_LENGTH);
	Response::from_parts(parts, body)
}

/// A JSON payload in the requested mode.
pub fn json_response(
	mode: StreamMode,
	status: crate::http::StatusCode,
	value: &serde_json::Value,
) -> Result<Response, GatewayError> {
	let bytes = Bytes::from(serde_json::to_vec(value).context("serializing response")?);
	let mut builder = ::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "application/json");
	if matches!(mode, StreamMode::Buffered) {
		builder = builder.header(header::CONTENT_LENGTH, bytes.len());
	}
	builder
		.body(Body::from(bytes))
		.map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))
}
