pub mod anthropic;
pub mod openai;

use anyhow::anyhow;
use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::debug;

use crate::client::{BodyPara, HttpClient, RequestBuilder};
use crate::http::{Method, Response, header};
use crate::proxy::GatewayError;
use crate::proxy::context::Context;
use crate::proxy::write;

/// The upstream providers the gateway can front. The provider is selected by
/// model name; its API key comes from the asset metadata, never from the
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
	OpenAi,
	Anthropic,
}

impl Provider {
	/// Model → provider. Unknown models have no provider; the router turns
	/// that into a 404 naming the model.
	pub fn for_model(model: &str) -> Option<Provider> {
		if openai::serves_model(model) {
			Some(Provider::OpenAi)
		} else if anthropic::serves_model(model) {
			Some(Provider::Anthropic)
		} else {
			None
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Provider::OpenAi => openai::NAME,
			Provider::Anthropic => anthropic::NAME,
		}
	}

	pub fn default_host(&self) -> &'static str {
		match self {
			Provider::OpenAi => openai::DEFAULT_HOST,
			Provider::Anthropic => anthropic::DEFAULT_HOST,
		}
	}

	pub fn default_path(&self) -> &'static str {
		match self {
			Provider::OpenAi => openai::DEFAULT_PATH,
			Provider::Anthropic => anthropic::DEFAULT_PATH,
		}
	}

	pub fn api_key_metadata(&self) -> &'static str {
		match self {
			Provider::OpenAi => openai::API_KEY,
			Provider::Anthropic => anthropic::API_KEY,
		}
	}

	pub fn host_override_metadata(&self) -> &'static str {
		match self {
			Provider::OpenAi => openai::HOST_OVERRIDE,
			Provider::Anthropic => anthropic::HOST_OVERRIDE,
		}
	}

	/// Provider-specific auth and version headers.
	fn apply_headers(
		&self,
		builder: RequestBuilder,
		api_key: &str,
	) -> Result<RequestBuilder, GatewayError> {
		let map_err = |e: crate::client::ClientError| GatewayError::Internal(anyhow!("{e}"));
		match self {
			Provider::OpenAi => builder
				.add_header("Authorization", &format!("Bearer {api_key}"))
				.map_err(map_err),
			Provider::Anthropic => builder
				.add_header("x-api-key", api_key)
				.map_err(map_err)?
				.add_header(anthropic::VERSION_HEADER, anthropic::VERSION)
				.map_err(map_err),
		}
	}
}

/// Executes one LLM exchange against the provider selected by the model on
/// the context, streaming or buffering per the asset's mode.
pub struct LlmExecutor {
	http: HttpClient,
}

impl LlmExecutor {
	pub fn new(http: HttpClient) -> LlmExecutor {
		LlmExecutor { http }
	}

	pub async fn execute(&self, ctx: &mut Context) -> Result<Response, GatewayError> {
		let asset = ctx.asset.clone();
		let model = ctx
			.model_name
			.clone()
			.ok_or_else(|| GatewayError::Validation("missing model".to_string()))?;
		let provider = Provider::for_model(&model)
			.ok_or_else(|| GatewayError::NotFound(format!("unknown model: {model}")))?;
		let api_key = asset
			.metadata_get(provider.api_key_metadata())
			.ok_or_else(|| {
				GatewayError::Internal(anyhow!(
					"no {} api key configured for asset {}",
					provider.name(),
					asset.method
				))
			})?
			.to_string();

		// A host override may carry a full base URL (scheme included) for
		// self-hosted or proxied providers.
		let base = match asset.metadata_get(provider.host_override_metadata()) {
			Some(h) if h.contains("://") => h.trim_end_matches('/').to_string(),
			Some(h) => format!("https://{h}"),
			None => format!("https://{}", provider.default_host()),
		};
		let url = format!("{base}{}", provider.default_path());

		let body: Bytes = match ctx.raw_body.clone() {
			Some(b) => b,
			None => ctx
				.take_body()
				.collect()
				.await
				.map_err(|e| GatewayError::Validation(format!("unreadable body: {e}")))?
				.to_bytes(),
		};

		let mut builder = self
			.http
			.request(Method::POST, &url)
			.set_body_para(BodyPara::Bytes(body))
			.timeout(asset.timeout_duration())
			.tag(&ctx.request_id)
			.nothrow();
		builder = builder
			.add_header("Content-Type", "application/json")
			.map_err(|e| GatewayError::Internal(anyhow!("{e}")))?;
		builder = provider.apply_headers(builder, &api_key)?;

		debug!(model, provider = provider.name(), url, "llm call");
		let call = builder
			.new_call()
			.map_err(|e| GatewayError::Internal(anyhow!("{e}")))?;
		let mut resp = call.execute().await.map_err(GatewayError::Upstream)?;

		resp.headers_mut().remove(header::CONTENT_LENGTH);
		write::respond(asset.stream, resp).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn provider_selection_by_model() {
		assert_eq!(Provider::for_model("gpt-4o"), Some(Provider::OpenAi));
		assert_eq!(
			Provider::for_model("claude-sonnet-4"),
			Some(Provider::Anthropic)
		);
		assert_eq!(Provider::for_model("llama-3"), None);
	}

	#[test]
	fn provider_surfaces() {
		let p = Provider::OpenAi;
		assert_eq!(p.default_host(), "api.openai.com");
		assert_eq!(p.api_key_metadata(), "openaiApiKey");
		let p = Provider::Anthropic;
		assert_eq!(p.default_path(), "/v1/messages");
	}
}
