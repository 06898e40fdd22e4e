use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::GatewayError;
use super::context::Context;
use crate::http::{HeaderMap, Method, Response, x_headers};
use crate::types::asset::Asset;

/// What a serial preprocessor decided.
pub enum PreprocDecision {
	Continue,
	/// Stop the pipeline and answer with this response.
	ShortCircuit(Response),
}

/// Runs in registration order; may mutate the context, short-circuit, or fail.
#[async_trait]
pub trait SerialPreprocessor: Send + Sync {
	fn name(&self) -> &'static str;
	async fn process(&self, ctx: &mut Context) -> Result<PreprocDecision, GatewayError>;
}

/// Fire-and-forget observers; the pipeline does not wait for them.
#[async_trait]
pub trait ParallelPreprocessor: Send + Sync {
	fn name(&self) -> &'static str;
	async fn observe(&self, ctx: ContextView);
}

/// Immutable snapshot handed to parallel preprocessors.
#[derive(Debug, Clone)]
pub struct ContextView {
	pub request_id: String,
	pub client_ip: IpAddr,
	pub method: Method,
	pub asset: Arc<Asset>,
	pub params: HashMap<String, String>,
	pub headers: HeaderMap,
}

impl ContextView {
	fn of(ctx: &Context) -> ContextView {
		ContextView {
			request_id: ctx.request_id.clone(),
			client_ip: ctx.client_ip,
			method: ctx.method.clone(),
			asset: ctx.asset.clone(),
			params: ctx.params.clone(),
			headers: ctx.headers.clone(),
		}
	}
}

/// The two registries plus the serial deadline.
#[derive(Default)]
pub struct PreprocessorChain {
	serial: Vec<Arc<dyn SerialPreprocessor>>,
	parallel: Vec<Arc<dyn ParallelPreprocessor>>,
	timeout: Option<Duration>,
}

impl PreprocessorChain {
	pub fn new(timeout: Duration) -> Self {
		PreprocessorChain {
			serial: Vec::new(),
			parallel: Vec::new(),
			timeout: Some(timeout),
		}
	}

	pub fn register_serial(&mut self, p: Arc<dyn SerialPreprocessor>) {
		self.serial.push(p);
	}

	pub fn register_parallel(&mut self, p: Arc<dyn ParallelPreprocessor>) {
		self.parallel.push(p);
	}

	/// Run the chain. Parallel preprocessors are spawned and forgotten; serial
	/// ones run in order under the chain deadline. Returns a short-circuit
	/// response if any preprocessor produced one.
	pub async fn run(
		&self,
		ctx: &mut Context,
		skip_serial: bool,
		skip_all: bool,
	) -> Result<Option<Response>, GatewayError> {
		if skip_all {
			return Ok(None);
		}

		for p in &self.parallel {
			let p = p.clone();
			let view = ContextView::of(ctx);
			tokio::spawn(async move { p.observe(view).await });
		}

		if skip_serial || self.serial.is_empty() {
			return Ok(None);
		}

		let work = async {
			for p in &self.serial {
				debug!(preprocessor = p.name(), "running");
				match p.process(ctx).await? {
					PreprocDecision::Continue => {},
					PreprocDecision::ShortCircuit(resp) => return Ok(Some(resp)),
				}
			}
			Ok(None)
		};
		match self.timeout {
			Some(t) => tokio::time::timeout(t, work)
				.await
				.map_err(|_| GatewayError::PreprocessTimeout)?,
			None => work.await,
		}
	}
}

/// Serial key auth: when the asset's metadata carries `apiKeys` (comma
/// separated), `X-API-Key` must match one of them.
pub struct KeyAuthPreprocessor;

#[async_trait]
impl SerialPreprocessor for KeyAuthPreprocessor {
	fn name(&self) -> &'static str {
		"key-auth"
	}

	async fn process(&self, ctx: &mut Context) -> Result<PreprocDecision, GatewayError> {
		let Some(allowed) = ctx.asset.metadata_get("apiKeys") else {
			return Ok(PreprocDecision::Continue);
		};
		let presented = ctx
			.headers
			.get(x_headers::X_API_KEY)
			.and_then(|v| v.to_str().ok())
			.unwrap_or_default();
		let ok = !presented.is_empty()
			&& allowed.split(',').any(|k| k.trim() == presented);
		if ok {
			Ok(PreprocDecision::Continue)
		} else {
			Err(GatewayError::Unauthorized("invalid api key".to_string()))
		}
	}
}

/// Serial fixed-window rate limit from asset metadata `rateLimit: "N/secs"`.
pub struct RateLimitPreprocessor {
	windows: Mutex<HashMap<String, (u64, u32)>>,
}

impl RateLimitPreprocessor {
	pub fn new() -> Self {
		RateLimitPreprocessor {
			windows: Mutex::new(HashMap::new()),
		}
	}

	fn parse(spec: &str) -> Option<(u32, u64)> {
		let (limit, period) = spec.split_once('/')?;
		Some((limit.trim().parse().ok()?, period.trim().parse().ok()?))
	}
}

impl Default for RateLimitPreprocessor {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl SerialPreprocessor for RateLimitPreprocessor {
	fn name(&self) -> &'static str {
		"rate-limit"
	}

	async fn process(&self, ctx: &mut Context) -> Result<PreprocDecision, GatewayError> {
		let Some(spec) = ctx.asset.metadata_get("rateLimit") else {
			return Ok(PreprocDecision::Continue);
		};
		let Some((limit, period)) = Self::parse(spec) else {
			warn!(asset = %ctx.asset.method, "unparseable rateLimit metadata: {spec}");
			return Ok(PreprocDecision::Continue);
		};
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0);
		let window = now / period.max(1);
		let mut windows = self.windows.lock();
		let slot = windows.entry(ctx.asset.method.clone()).or_insert((window, 0));
		if slot.0 != window {
			*slot = (window, 0);
		}
		slot.1 += 1;
		if slot.1 > limit {
			return Err(GatewayError::RateLimited);
		}
		Ok(PreprocDecision::Continue)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;
	use crate::http::Body;
	use crate::proxy::context::build_context;

	async fn ctx_for(asset_json: &str, api_key: Option<&str>) -> Context {
		let asset: Asset = serde_json::from_str(asset_json).unwrap();
		let mut builder = ::http::Request::builder().uri("/api/t");
		if let Some(k) = api_key {
			builder = builder.header("x-api-key", k);
		}
		let req = builder.body(Body::empty()).unwrap();
		build_context(
			req,
			"127.0.0.1".parse().unwrap(),
			Arc::new(asset),
			HashMap::new(),
			&[],
		)
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn key_auth_passes_and_rejects() {
		let json = r#"{"method":"t","kind":"rest","host":"h","metadata":{"apiKeys":"k1, k2"}}"#;
		let p = KeyAuthPreprocessor;

		let mut good = ctx_for(json, Some("k2")).await;
		assert!(matches!(
			p.process(&mut good).await.unwrap(),
			PreprocDecision::Continue
		));

		let mut bad = ctx_for(json, Some("nope")).await;
		assert!(matches!(
			p.process(&mut bad).await,
			Err(GatewayError::Unauthorized(_))
		));

		let mut missing = ctx_for(json, None).await;
		assert!(matches!(
			p.process(&mut missing).await,
			Err(GatewayError::Unauthorized(_))
		));
	}

	#[tokio::test]
	async fn key_auth_is_a_noop_without_metadata() {
		let json = r#"{"method":"t","kind":"rest","host":"h"}"#;
		let mut ctx = ctx_for(json, None).await;
		assert!(matches!(
			KeyAuthPreprocessor.process(&mut ctx).await.unwrap(),
			PreprocDecision::Continue
		));
	}

	#[tokio::test]
	async fn rate_limit_enforces_window() {
		let json = r#"{"method":"t","kind":"rest","host":"h","metadata":{"rateLimit":"2/60"}}"#;
		let p = RateLimitPreprocessor::new();
		let mut ctx = ctx_for(json, None).await;
		assert!(p.process(&mut ctx).await.is_ok());
		assert!(p.process(&mut ctx).await.is_ok());
		assert!(matches!(
			p.process(&mut ctx).await,
			Err(GatewayError::RateLimited)
		));
	}

	#[tokio::test]
	async fn serial_timeout_surfaces() {
		struct Slow;
		#[async_trait]
		impl SerialPreprocessor for Slow {
			fn name(&self) -> &'static str {
				"slow"
			}
			async fn process(&self, _ctx: &mut Context) -> Result<PreprocDecision, GatewayError> {
				tokio::time::sleep(Duration::from_secs(60)).await;
				Ok(PreprocDecision::Continue)
			}
		}
		let mut chain = PreprocessorChain::new(Duration::from_millis(20));
		chain.register_serial(Arc::new(Slow));
		let mut ctx = ctx_for(r#"{"method":"t","kind":"rest","host":"h"}"#, None).await;
		let err = chain.run(&mut ctx, false, false).await.unwrap_err();
		assert!(matches!(err, GatewayError::PreprocessTimeout));
	}

	#[tokio::test]
	async fn skip_flags_bypass_serial() {
		struct Deny;
		#[async_trait]
		impl SerialPreprocessor for Deny {
			fn name(&self) -> &'static str {
				"deny"
			}
			async fn process(&self, _ctx: &mut Context) -> Result<PreprocDecision, GatewayError> {
				Err(GatewayError::Unauthorized("always".to_string()))
			}
		}
		let mut chain = PreprocessorChain::new(Duration::from_secs(1));
		chain.register_serial(Arc::new(Deny));
		let mut ctx = ctx_for(r#"{"method":"t","kind":"rest","host":"h"}"#, None).await;
		assert!(chain.run(&mut ctx, true, false).await.unwrap().is_none());
		assert!(chain.run(&mut ctx, false, true).await.unwrap().is_none());
		assert!(chain.run(&mut ctx, false, false).await.is_err());
	}

	#[tokio::test]
	async fn parallel_preprocessors_do_not_block_the_pipeline() {
		struct SlowObserver {
			seen: Arc<tokio::sync::Notify>,
		}
		#[async_trait]
		impl ParallelPreprocessor for SlowObserver {
			fn name(&self) -> &'static str {
				"slow-observer"
			}
			async fn observe(&self, ctx: ContextView) {
				assert!(!ctx.request_id.is_empty());
				tokio::time::sleep(Duration::from_millis(50)).await;
				self.seen.notify_waiters();
			}
		}
		let seen = Arc::new(tokio::sync::Notify::new());
		let mut chain = PreprocessorChain::new(Duration::from_secs(1));
		chain.register_parallel(Arc::new(SlowObserver { seen: seen.clone() }));

		let mut ctx = ctx_for(r#"{"method":"t","kind":"rest","host":"h"}"#, None).await;
		let notified = seen.notified();
		let started = std::time::Instant::now();
		assert!(chain.run(&mut ctx, false, false).await.unwrap().is_none());
		// The chain returned well before the observer finished.
		assert!(started.elapsed() < Duration::from_millis(50));
		notified.await;
	}

	#[tokio::test]
	async fn short_circuit_response_is_returned() {
		struct Answer;
		#[async_trait]
		impl SerialPreprocessor for Answer {
			fn name(&self) -> &'static str {
				"answer"
			}
			async fn process(&self, _ctx: &mut Context) -> Result<PreprocDecision, GatewayError> {
				let resp = ::http::Response::builder()
					.status(418)
					.body(Body::empty())
					.unwrap();
				Ok(PreprocDecision::ShortCircuit(resp))
			}
		}
		let mut chain = PreprocessorChain::new(Duration::from_secs(1));
		chain.register_serial(Arc::new(Answer));
		let mut ctx = ctx_for(r#"{"method":"t","kind":"rest","host":"h"}"#, None).await;
		let resp = chain.run(&mut ctx, false, false).await.unwrap().unwrap();
		assert_eq!(resp.status(), 418);
	}
}
