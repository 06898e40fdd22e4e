use std::collections::HashSet;

use tracing::debug;

use super::GatewayError;
use super::context::Context;
use super::write;
use crate::client::{BodyPara, BodyType, FileSource, HttpClient, RequestBuilder};
use crate::http::{Method, Response, WellKnownContentTypes, classify_content_type, header, is_hop_by_hop};

/// Names of `{tokens}` appearing in a URL template.
fn template_tokens(template: &str) -> HashSet<String> {
	let mut out = HashSet::new();
	let mut rest = template;
	while let Some(open) = rest.find('{') {
		let after = &rest[open + 1..];
		let Some(close) = after.find('}') else { break };
		out.insert(after[..close].to_string());
		rest = &after[close + 1..];
	}
	out
}

fn forwardable(name: &crate::http::HeaderName) -> bool {
	!is_hop_by_hop(name)
		&& !matches!(
			name.as_str(),
			"host" | "content-length" | "content-type" | "expect"
		)
}

/// Proxy to the downstream HTTP service described by the asset. The response
/// streams back in the asset's configured mode.
pub async fn route(client: &HttpClient, ctx: &mut Context) -> Result<Response, GatewayError> {
	let asset = ctx.asset.clone();
	let template = asset.target_template();
	let tokens = template_tokens(&template);
	let method = ctx.method.clone();

	let mut builder = client.request(method.clone(), &template);
	for (name, value) in &ctx.params {
		builder = builder.add_path_para(name, value);
	}
	// Ingress route captures and template tokens are routing inputs, not
	// payload parameters.
	if method == Method::GET {
		for (name, value) in &ctx.params {
			if !tokens.contains(name) && !ctx.path_param_names.contains(name) {
				builder = builder.add_url_para(name, value);
			}
		}
	}

	// Forward inbound headers minus Host, the content-length family and
	// hop-by-hop headers; the body branch below decides Content-Type.
	for (name, value) in &ctx.headers {
		if !forwardable(name) {
			continue;
		}
		let Ok(value) = value.to_str() else { continue };
		builder = builder
			.add_header(name.as_str(), value)
			.map_err(|e| GatewayError::Validation(e.to_string()))?;
	}
	for (name, value) in &ctx.forward_headers {
		builder = builder
			.add_header(name, value)
			.map_err(|e| GatewayError::Validation(e.to_string()))?;
	}

	let has_body = !matches!(method, Method::GET | Method::HEAD);
	if has_body {
		builder = attach_body(builder, ctx, &tokens).await?;
	}

	builder = builder
		.timeout(asset.timeout_duration())
		.tag(&ctx.request_id)
		.nothrow();

	let call = builder
		.new_call()
		.map_err(|e| GatewayError::Validation(e.to_string()))?;
	debug!(asset = %asset.method, target = %template, "proxying");
	let mut resp = call.execute().await.map_err(GatewayError::Upstream)?;

	// The writer decides the framing; inbound lengths no longer apply.
	resp.headers_mut().remove(header::CONTENT_LENGTH);
	let hop: Vec<crate::http::HeaderName> = resp
		.headers()
		.keys()
		.filter(|n| is_hop_by_hop(n))
		.cloned()
		.collect();
	for name in hop {
		resp.headers_mut().remove(name);
	}
	write::respond(asset.stream, resp).await
}

async fn attach_body(
	mut builder: RequestBuilder,
	ctx: &mut Context,
	tokens: &HashSet<String>,
) -> Result<RequestBuilder, GatewayError> {
	if !ctx.file_parts.is_empty() {
		for (name, value) in &ctx.params {
			if !tokens.contains(name) && !ctx.path_param_names.contains(name) {
				builder = builder.add_body_para(name, value);
			}
		}
		for file in &ctx.file_parts {
			builder = builder.add_file_para(
				&file.name,
				&file.filename,
				&file.content_type,
				FileSource::Bytes(file.data.clone()),
			);
		}
		return Ok(builder);
	}

	match classify_content_type(&ctx.headers) {
		WellKnownContentTypes::Json => {
			let inbound_ct = ctx
				.headers
				.get(header::CONTENT_TYPE)
				.and_then(|v| v.to_str().ok())
				.unwrap_or("application/json")
				.to_string();
			let raw = match ctx.raw_body.clone() {
				Some(b) => b,
				None => {
					use http_body_util::BodyExt;
					let body = ctx.body.take().unwrap_or_else(crate::http::Body::empty);
					let bytes = body
						.collect()
						.await
						.map_err(|e| GatewayError::Validation(format!("unreadable body: {e}")))?
						.to_bytes();
					ctx.raw_body = Some(bytes.clone());
					bytes
				},
			};
			builder = builder
				.add_header(header::CONTENT_TYPE.as_str(), &inbound_ct)
				.map_err(|e| GatewayError::Validation(e.to_string()))?
				.set_body_para(BodyPara::Bytes(raw));
			Ok(builder)
		},
		_ => {
			// Form-encoded and unknown content types re-encode the flat params.
			builder = builder.body_type(BodyType::Form);
			for (name, value) in &ctx.params {
				if !tokens.contains(name) && !ctx.path_param_names.contains(name) {
					builder = builder.add_body_para(name, value);
				}
			}
			Ok(builder)
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tokens_are_extracted() {
		let t = template_tokens("http://h/u/{id}/f/{name}");
		assert!(t.contains("id"));
		assert!(t.contains("name"));
		assert_eq!(t.len(), 2);
	}

	#[test]
	fn hop_by_hop_and_host_are_not_forwarded() {
		assert!(!forwardable(&header::HOST));
		assert!(!forwardable(&header::CONTENT_LENGTH));
		assert!(!forwardable(&header::TRANSFER_ENCODING));
		assert!(!forwardable(&header::CONNECTION));
		assert!(forwardable(&header::ACCEPT));
		assert!(forwardable(&crate::http::x_headers::X_REQUEST_ID));
	}
}
