use super::GatewayError;
use super::context::Context;
use crate::http::{Response, x_headers};
use crate::llm::LlmExecutor;

/// The LLM router: `/router/llm/{model}` with the project key in `X-API-Key`.
/// The path model and project key land on the context; the executor picks the
/// upstream provider and its credentials from the asset metadata.
pub async fn route(executor: &LlmExecutor, ctx: &mut Context) -> Result<Response, GatewayError> {
	let model = ctx
		.param("model")
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.ok_or_else(|| GatewayError::Validation("missing model".to_string()))?;

	let project_key = ctx
		.headers
		.get(x_headers::X_API_KEY)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.filter(|s| !s.is_empty())
		.ok_or_else(|| GatewayError::Unauthorized("missing X-API-Key".to_string()))?;

	// When the asset pins project keys, enforce membership.
	if let Some(allowed) = ctx.asset.metadata_get("projectKeys")
		&& !allowed.split(',').any(|k| k.trim() == project_key)
	{
		return Err(GatewayError::Unauthorized("unknown project key".to_string()));
	}

	ctx.model_name = Some(model);
	ctx.project_api_key = Some(project_key);
	executor.execute(ctx).await
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::Arc;

	use super::*;
	use crate::client::HttpClient;
	use crate::http::Body;
	use crate::proxy::context::build_context;
	use crate::types::asset::Asset;

	async fn llm_ctx(model: Option<&str>, key: Option<&str>, metadata: &str) -> Context {
		let asset: Asset = serde_json::from_str(&format!(
			r#"{{"method":"llm","kind":"llm","stream":2,"timeout":2000,"metadata":{metadata}}}"#
		))
		.unwrap();
		let mut builder = ::http::Request::builder()
			.method(crate::http::Method::POST)
			.uri("/router/llm/x");
		if let Some(k) = key {
			builder = builder.header("x-api-key", k);
		}
		let req = builder.body(Body::from(r#"{"messages":[]}"#)).unwrap();
		let mut path = HashMap::new();
		if let Some(m) = model {
			path.insert("model".to_string(), m.to_string());
		}
		build_context(
			req,
			"127.0.0.1".parse().unwrap(),
			Arc::new(asset),
			path,
			&[],
		)
		.await
		.unwrap()
	}

	fn executor() -> LlmExecutor {
		LlmExecutor::new(HttpClient::builder().build())
	}

	#[tokio::test]
	async fn missing_model_is_400() {
		let mut ctx = llm_ctx(None, Some("proj_xyz"), "{}").await;
		assert!(matches!(
			route(&executor(), &mut ctx).await,
			Err(GatewayError::Validation(_))
		));
	}

	#[tokio::test]
	async fn missing_key_is_401() {
		let mut ctx = llm_ctx(Some("gpt-4o"), None, "{}").await;
		assert!(matches!(
			route(&executor(), &mut ctx).await,
			Err(GatewayError::Unauthorized(_))
		));
	}

	#[tokio::test]
	async fn unknown_project_key_is_401() {
		let mut ctx = llm_ctx(
			Some("gpt-4o"),
			Some("stranger"),
			r#"{"projectKeys":"proj_a,proj_b"}"#,
		)
		.await;
		assert!(matches!(
			route(&executor(), &mut ctx).await,
			Err(GatewayError::Unauthorized(_))
		));
	}

	#[tokio::test]
	async fn unknown_model_is_404() {
		let mut ctx = llm_ctx(
			Some("mystery-model"),
			Some("proj_xyz"),
			r#"{"openaiApiKey":"sk-test"}"#,
		)
		.await;
		assert!(matches!(
			route(&executor(), &mut ctx).await,
			Err(GatewayError::NotFound(_))
		));
	}
}
