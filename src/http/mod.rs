pub mod timeout;

pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;
pub use ::http::uri::{Authority, Scheme};
pub use ::http::{
	HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, status, uri,
};
use bytes::Bytes;
use http_body_util::BodyExt;

pub mod x_headers {
	use http::HeaderName;

	pub const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
	pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
	pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
	pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
}

pub fn modify_req(
	req: &mut Request,
	f: impl FnOnce(&mut ::http::request::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	f(&mut head)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

pub fn modify_req_uri(
	req: &mut Request,
	f: impl FnOnce(&mut uri::Parts) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
	let nreq = std::mem::take(req);
	let (mut head, body) = nreq.into_parts();
	let mut parts = head.uri.into_parts();
	f(&mut parts)?;
	head.uri = Uri::from_parts(parts)?;
	*req = Request::from_parts(head, body);
	Ok(())
}

#[derive(Debug)]
pub enum WellKnownContentTypes {
	Json,
	Sse,
	Form,
	Multipart,
	Unknown,
}

pub fn classify_content_type(h: &HeaderMap) -> WellKnownContentTypes {
	if let Some(content_type) = h.get(header::CONTENT_TYPE)
		&& let Ok(content_type_str) = content_type.to_str()
		&& let Ok(mime) = content_type_str.parse::<mime::Mime>()
	{
		match (mime.type_(), mime.subtype()) {
			(mime::APPLICATION, mime::JSON) => return WellKnownContentTypes::Json,
			(mime::APPLICATION, mime::WWW_FORM_URLENCODED) => return WellKnownContentTypes::Form,
			(mime::MULTIPART, mime::FORM_DATA) => return WellKnownContentTypes::Multipart,
			(mime::TEXT, mime::EVENT_STREAM) => {
				return WellKnownContentTypes::Sse;
			},
			_ => {},
		}
	}
	WellKnownContentTypes::Unknown
}

const MAX_BUFFERED_BODY: usize = 2_097_152;

/// Buffer the whole body in memory, replacing it with a replayable copy.
pub async fn inspect_body(body: &mut Body) -> anyhow::Result<Bytes> {
	let orig = std::mem::replace(body, Body::empty());
	let bytes = orig.collect().await?.to_bytes();
	if bytes.len() > MAX_BUFFERED_BODY {
		anyhow::bail!("body too large to buffer ({} bytes)", bytes.len());
	}
	*body = Body::from(bytes.clone());
	Ok(bytes)
}

/// Hop-by-hop headers are connection-scoped and must not be forwarded.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
	matches!(
		name.as_str(),
		"connection"
			| "keep-alive"
			| "proxy-authenticate"
			| "proxy-authorization"
			| "te"
			| "trailer"
			| "transfer-encoding"
			| "upgrade"
	)
}
