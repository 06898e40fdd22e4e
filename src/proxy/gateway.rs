use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::context::{build_context, next_request_id};
use super::preprocess::{KeyAuthPreprocessor, PreprocessorChain, RateLimitPreprocessor};
use super::router::RouteTable;
use super::{GatewayError, llm, mcp, rest, ws};
use crate::client::HttpClient;
use crate::config::Config;
use crate::http::{Body, HeaderValue, Method, Request, Response, StatusCode, x_headers};
use crate::llm::LlmExecutor;
use crate::mcp::McpClientManager;
use crate::proxy::mq::{Broker, LogBroker, MqRouter};
use crate::types::asset::{Asset, AssetKind};

/// The ingress surfaces the gateway serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoutePattern {
	Api,
	Llm,
	Mcp,
	Ws,
	Mq,
	Health,
}

/// The data plane: one routing table, one preprocessor chain, one client
/// engine, and the five backend routers.
#[derive(Clone)]
pub struct Gateway {
	inner: Arc<GatewayInner>,
}

struct GatewayInner {
	config: Config,
	client: HttpClient,
	routes: RouteTable<RoutePattern>,
	preproc: PreprocessorChain,
	mcp: McpClientManager,
	llm: LlmExecutor,
	mq: MqRouter,
}

impl Gateway {
	pub fn new(config: Config) -> Gateway {
		Gateway::with_broker(config, Arc::new(LogBroker))
	}

	pub fn with_broker(config: Config, broker: Arc<dyn Broker>) -> Gateway {
		let mut client = HttpClient::builder()
			.max_requests(config.client.max_requests)
			.max_requests_per_host(config.client.max_requests_per_host)
			.keep_alive(config.client.keep_alive);
		if let Some(t) = config.client.call_timeout {
			client = client.call_timeout(t);
		}
		if let Some(cache) = &config.cache {
			client = client.cache(cache.directory.clone(), cache.max_size);
		}
		let client = client.build();

		let mut routes = RouteTable::new();
		routes.add(None, "/api/{name}", RoutePattern::Api);
		routes.add(None, "/router/llm/{model}", RoutePattern::Llm);
		routes.add(None, "/router/mcp", RoutePattern::Mcp);
		routes.add(None, "/router/ws/{name}", RoutePattern::Ws);
		routes.add(None, "/router/mq/{name}", RoutePattern::Mq);
		routes.add(Some(Method::GET), "/healthz", RoutePattern::Health);

		let mut preproc = PreprocessorChain::new(config.preproc_timeout);
		preproc.register_serial(Arc::new(KeyAuthPreprocessor));
		preproc.register_serial(Arc::new(RateLimitPreprocessor::new()));

		let mcp = McpClientManager::from_config(&config.mcp_services, client.clone());
		let llm = LlmExecutor::new(client.clone());
		let mq = MqRouter::new(broker);

		Gateway {
			inner: Arc::new(GatewayInner {
				config,
				client,
				routes,
				preproc,
				mcp,
				llm,
				mq,
			}),
		}
	}

	pub fn client(&self) -> &HttpClient {
		&self.inner.client
	}

	/// Bind the configured address and run the accept loop.
	pub async fn serve(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
		let listener = TcpListener::bind(self.inner.config.bind).await?;
		self.serve_listener(listener, shutdown).await
	}

	/// Accept loop on an existing listener. Returns when `shutdown` resolves;
	/// in-flight calls are then canceled through the tag registry.
	pub async fn serve_listener(
		&self,
		listener: TcpListener,
		shutdown: impl Future<Output = ()>,
	) -> anyhow::Result<()> {
		info!(bind = %listener.local_addr()?, "gateway listening");
		let mut shutdown = std::pin::pin!(shutdown);
		loop {
			tokio::select! {
				_ = &mut shutdown => break,
				accepted = listener.accept() => {
					let (stream, peer) = match accepted {
						Ok(a) => a,
						Err(e) => {
							warn!("accept failed: {e}");
							continue;
						},
					};
					let gateway = self.clone();
					tokio::spawn(async move {
						let service = service_fn(move |req| {
							let gateway = gateway.clone();
							async move {
								Ok::<_, std::convert::Infallible>(gateway.handle(req.map(Body::new), peer).await)
							}
						});
						let conn = http1::Builder::new()
							.serve_connection(TokioIo::new(stream), service)
							.with_upgrades();
						if let Err(e) = conn.await {
							debug!(%peer, "connection ended: {e}");
						}
					});
				},
			}
		}
		info!("gateway draining");
		let canceled = self.inner.client.cancel_all();
		if canceled > 0 {
			info!(canceled, "canceled in-flight calls");
		}
		self.inner.client.shutdown();
		Ok(())
	}

	/// The per-request pipeline: route match, context, preprocessors, backend
	/// router, response mode.
	pub async fn handle(&self, req: Request, peer: SocketAddr) -> Response {
		let started = Instant::now();
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let request_id = req
			.headers()
			.get(x_headers::X_REQUEST_ID)
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string())
			.unwrap_or_else(next_request_id);

		let result = self.dispatch(req, peer, &request_id).await;
		let mut resp = match result {
			Ok(resp) => resp,
			Err(e) => {
				debug!(%method, path, request_id, "request failed: {e}");
				e.into_response(&request_id)
			},
		};
		if !resp.headers().contains_key(x_headers::X_REQUEST_ID)
			&& let Ok(v) = HeaderValue::try_from(request_id.as_str())
		{
			resp.headers_mut().insert(x_headers::X_REQUEST_ID, v);
		}
		info!(
			target: "access",
			%method,
			path,
			status = resp.status().as_u16(),
			request_id,
			duration_ms = started.elapsed().as_millis() as u64,
			"request"
		);
		resp
	}

	async fn dispatch(
		&self,
		req: Request,
		peer: SocketAddr,
		request_id: &str,
	) -> Result<Response, GatewayError> {
		let method = req.method().clone();
		let path = req.uri().path().to_string();
		let Some((pattern, path_params)) = self.inner.routes.matches(&method, &path) else {
			return Err(GatewayError::RouteNotFound);
		};
		let pattern = *pattern;

		if pattern == RoutePattern::Health {
			return Ok(
				::http::Response::builder()
					.status(StatusCode::OK)
					.body(Body::from("ok"))
					.expect("static response builds"),
			);
		}

		let asset = self.resolve_asset(pattern, &path_params)?;

		// WebSocket upgrades keep the raw request for the handshake; the
		// preprocessors see a bodiless head-only context.
		if pattern == RoutePattern::Ws {
			let (head, body) = req.into_parts();
			let head_req = Request::from_parts(head.clone(), Body::empty());
			let mut ctx = build_context(
				head_req,
				peer.ip(),
				asset.clone(),
				path_params,
				&self.inner.config.trusted_proxies,
			)
			.await?;
			ctx.request_id = request_id.to_string();
			if let Some(short_circuit) = self.inner.preproc.run(&mut ctx, false, false).await? {
				return Ok(short_circuit);
			}
			let req = Request::from_parts(head, body);
			return Ok(ws::route(req, asset, request_id.to_string()));
		}

		let mut ctx = build_context(
			req,
			peer.ip(),
			asset,
			path_params,
			&self.inner.config.trusted_proxies,
		)
		.await?;
		ctx.request_id = request_id.to_string();

		if let Some(short_circuit) = self.inner.preproc.run(&mut ctx, false, false).await? {
			return Ok(short_circuit);
		}

		match pattern {
			RoutePattern::Api => rest::route(&self.inner.client, &mut ctx).await,
			RoutePattern::Mq => self.inner.mq.route(&mut ctx).await,
			RoutePattern::Mcp => mcp::route(&self.inner.mcp, &mut ctx).await,
			RoutePattern::Llm => llm::route(&self.inner.llm, &mut ctx).await,
			RoutePattern::Ws | RoutePattern::Health => unreachable!("handled above"),
		}
	}

	fn resolve_asset(
		&self,
		pattern: RoutePattern,
		path_params: &HashMap<String, String>,
	) -> Result<Arc<Asset>, GatewayError> {
		let assets = &self.inner.config.assets;
		let by_name = |name: &str, kind: AssetKind| -> Result<Arc<Asset>, GatewayError> {
			assets
				.get(name)
				.filter(|a| a.kind == kind)
				.cloned()
				.ok_or(GatewayError::RouteNotFound)
		};
		match pattern {
			RoutePattern::Api => by_name(
				path_params.get("name").map(|s| s.as_str()).unwrap_or(""),
				AssetKind::Rest,
			),
			RoutePattern::Ws => by_name(
				path_params.get("name").map(|s| s.as_str()).unwrap_or(""),
				AssetKind::Ws,
			),
			RoutePattern::Mq => by_name(
				path_params.get("name").map(|s| s.as_str()).unwrap_or(""),
				AssetKind::Mq,
			),
			RoutePattern::Llm => assets
				.values()
				.find(|a| a.kind == AssetKind::Llm)
				.cloned()
				.ok_or(GatewayError::RouteNotFound),
			RoutePattern::Mcp => assets
				.values()
				.find(|a| a.kind == AssetKind::Mcp)
				.cloned()
				.ok_or(GatewayError::RouteNotFound),
			RoutePattern::Health => unreachable!("health has no asset"),
		}
	}
}
