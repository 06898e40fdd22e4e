use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use rand::Rng;

use crate::http::{Body, HeaderMap, Method, WellKnownContentTypes, classify_content_type, x_headers};
use crate::proxy::GatewayError;
use crate::types::asset::Asset;

/// An uploaded file captured from a multipart request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
	pub name: String,
	pub filename: String,
	pub content_type: String,
	pub data: Bytes,
}

/// Per-request mutable state: created by routing, mutated by preprocessors,
/// read by the backend routers. Lives exactly as long as one request.
#[derive(Debug)]
pub struct Context {
	pub request_id: String,
	pub client_ip: IpAddr,
	pub method: Method,
	pub asset: Arc<Asset>,
	/// Decoded query + form + path parameters, flattened into one map.
	pub params: HashMap<String, String>,
	/// Names that came from ingress route captures, so routers can keep them
	/// out of outbound queries and form bodies.
	pub path_param_names: std::collections::HashSet<String>,
	pub file_parts: Vec<UploadedFile>,
	/// Inbound request headers, for forwarding.
	pub headers: HeaderMap,
	/// Extra headers preprocessors want forwarded upstream.
	pub forward_headers: HashMap<String, String>,
	/// The raw request body; present until a router consumes it.
	pub body: Option<Body>,
	/// Raw body bytes when the pipeline buffered them during param parsing.
	pub raw_body: Option<Bytes>,
	// Set by the LLM router.
	pub model_name: Option<String>,
	pub project_api_key: Option<String>,
}

impl Context {
	pub fn take_body(&mut self) -> Body {
		if let Some(raw) = &self.raw_body {
			return Body::from(raw.clone());
		}
		self.body.take().unwrap_or_else(Body::empty)
	}

	pub fn param(&self, name: &str) -> Option<&str> {
		self.params.get(name).map(|s| s.as_str())
	}
}

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn base32(mut value: u128, chars: usize) -> String {
	let mut out = vec![b'0'; chars];
	for slot in out.iter_mut().rev() {
		*slot = CROCKFORD[(value & 0x1f) as usize];
		value >>= 5;
	}
	String::from_utf8(out).expect("crockford alphabet is ascii")
}

/// ULID-like id: 48-bit millisecond timestamp, then a monotonic counter mixed
/// with randomness. Lexicographic order follows arrival order.
pub fn next_request_id() -> String {
	let millis = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
		& 0xffff_ffff_ffff;
	let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
	let noise: u64 = rand::rng().random();
	let low = ((count as u128) << 64) | noise as u128;
	format!("{}{}", base32(millis as u128, 10), base32(low, 16))
}

/// Walk the trusted-proxy headers. `X-Forwarded-For` is believed only when
/// the immediate peer is a configured trusted proxy; `X-Real-IP` likewise;
/// otherwise the transport peer wins.
pub fn extract_client_ip(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
	if !trusted_proxies.contains(&peer) {
		return peer;
	}
	if let Some(xff) = headers.get(x_headers::X_FORWARDED_FOR)
		&& let Ok(value) = xff.to_str()
		&& let Some(first) = value.split(',').next()
		&& let Ok(ip) = first.trim().parse()
	{
		return ip;
	}
	if let Some(real) = headers.get(x_headers::X_REAL_IP)
		&& let Ok(value) = real.to_str()
		&& let Ok(ip) = value.trim().parse()
	{
		return ip;
	}
	peer
}

/// Build the request context: id, client ip, flattened decoded parameters
/// (query, then form or multipart fields, then path captures) and file parts.
pub async fn build_context(
	req: crate::http::Request,
	peer: IpAddr,
	asset: Arc<Asset>,
	path_params: HashMap<String, String>,
	trusted_proxies: &[IpAddr],
) -> Result<Context, GatewayError> {
	let (parts, body) = req.into_parts();
	let method = parts.method.clone();
	let headers = parts.headers;

	let request_id = headers
		.get(x_headers::X_REQUEST_ID)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.unwrap_or_else(next_request_id);
	let client_ip = extract_client_ip(peer, &headers, trusted_proxies);

	let mut params: HashMap<String, String> = HashMap::new();
	if let Some(query) = parts.uri.query() {
		let pairs: Vec<(String, String)> =
			serde_urlencoded::from_str(query).unwrap_or_default();
		params.extend(pairs);
	}

	let mut file_parts = Vec::new();
	let mut raw_body: Option<Bytes> = None;
	let mut body = Some(body);

	match classify_content_type(&headers) {
		WellKnownContentTypes::Form => {
			let bytes = buffer_body(&mut body).await?;
			let pairs: Vec<(String, String)> =
				serde_urlencoded::from_bytes(&bytes).unwrap_or_default();
			params.extend(pairs);
			raw_body = Some(bytes);
		},
		WellKnownContentTypes::Multipart => {
			let boundary = headers
				.get(crate::http::header::CONTENT_TYPE)
				.and_then(|v| v.to_str().ok())
				.and_then(|ct| multer::parse_boundary(ct).ok())
				.ok_or_else(|| GatewayError::Validation("malformed multipart boundary".to_string()))?;
			let bytes = buffer_body(&mut body).await?;
			raw_body = Some(bytes.clone());
			let stream = futures_util::stream::once(async move {
				Ok::<Bytes, std::io::Error>(bytes)
			});
			let mut multipart = multer::Multipart::new(stream, boundary);
			while let Some(field) = multipart
				.next_field()
				.await
				.map_err(|e| GatewayError::Validation(format!("malformed multipart body: {e}")))?
			{
				let name = field.name().unwrap_or_default().to_string();
				match field.file_name() {
					Some(filename) => {
						let filename = filename.to_string();
						let content_type = field
							.content_type()
							.map(|m| m.to_string())
							.unwrap_or_else(|| "application/octet-stream".to_string());
						let data = field
							.bytes()
							.await
							.map_err(|e| GatewayError::Validation(format!("multipart read: {e}")))?;
						file_parts.push(UploadedFile {
							name,
							filename,
							content_type,
							data,
						});
					},
					None => {
						let value = field
							.text()
							.await
							.map_err(|e| GatewayError::Validation(format!("multipart read: {e}")))?;
						params.insert(name, value);
					},
				}
			}
		},
		_ => {},
	}

	// Path captures win over query/form duplicates.
	let path_param_names: std::collections::HashSet<String> =
		path_params.keys().cloned().collect();
	params.extend(path_params);

	Ok(Context {
		request_id,
		client_ip,
		method,
		asset,
		params,
		path_param_names,
		file_parts,
		headers,
		forward_headers: HashMap::new(),
		body,
		raw_body,
		model_name: None,
		project_api_key: None,
	})
}

async fn buffer_body(body: &mut Option<Body>) -> Result<Bytes, GatewayError> {
	use http_body_util::BodyExt;
	let b = body.take().unwrap_or_else(Body::empty);
	let bytes = b
		.collect()
		.await
		.map_err(|e| GatewayError::Validation(format!("unreadable request body: {e}")))?
		.to_bytes();
	Ok(bytes)
}
