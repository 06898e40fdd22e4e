pub mod body;
pub mod call;
pub mod dispatcher;
pub mod dns;
pub mod pool;
pub mod request;
pub mod route;
pub mod tags;
pub mod url;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use body::{BodyType, FilePart, FileSource, Progress, ProgressStep};
pub use call::{Call, CallState};
pub use request::{BodyPara, PreparedRequest, RequestBuilder};

use crate::cache::HttpCache;
use crate::http::Method;
use dispatcher::Dispatcher;
use dns::CachedResolver;
use pool::ConnectionPool;
use tags::TagRegistry;

/// Which stage a deadline expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
	DispatchQueue,
	Dns,
	Connect,
	Call,
	Preprocess,
}

impl std::fmt::Display for TimeoutStage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let s = match self {
			TimeoutStage::DispatchQueue => "dispatch queue",
			TimeoutStage::Dns => "dns resolution",
			TimeoutStage::Connect => "connect",
			TimeoutStage::Call => "call",
			TimeoutStage::Preprocess => "preprocess",
		};
		f.write_str(s)
	}
}

/// Failure taxonomy of the client engine. Transport-level success is not
/// application-level success: HTTP 4xx/5xx arrive as responses, not errors.
#[derive(Debug, Error)]
pub enum ClientError {
	#[error("call canceled")]
	Canceled,
	#[error("{stage} timed out")]
	TimedOut { stage: TimeoutStage },
	#[error("network error: {0}")]
	Network(String),
	#[error("protocol error: {0}")]
	Protocol(String),
	#[error("tls error: {0}")]
	Tls(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("invalid url: {0}")]
	Url(#[from] url::UrlError),
	#[error("invalid request: {0}")]
	Config(String),
}

impl ClientError {
	pub fn is_canceled(&self) -> bool {
		matches!(self, ClientError::Canceled)
	}

	pub fn is_timeout(&self) -> bool {
		matches!(self, ClientError::TimedOut { .. })
	}
}

/// Engine-wide tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	pub max_requests: usize,
	pub max_requests_per_host: usize,
	pub keep_alive: Duration,
	pub call_timeout: Option<Duration>,
	/// Bound on the serial interceptor pass of each call.
	pub preproc_timeout: Duration,
	/// Forward proxy for plain-http origins.
	pub proxy: Option<SocketAddr>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		ClientConfig {
			max_requests: 64,
			max_requests_per_host: 5,
			keep_alive: Duration::from_secs(300),
			call_timeout: None,
			preproc_timeout: Duration::from_secs(5),
			proxy: None,
		}
	}
}

/// Engine-level request interceptor. Serial interceptors run in order before
/// dispatch and may rewrite the prepared request or fail the call; parallel
/// interceptors observe a copy without delaying the call. The builder's
/// `skip_preproc`/`skip_serial_preproc` flags bypass them per request.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
	fn name(&self) -> &'static str;
	async fn intercept(&self, request: &mut PreparedRequest) -> Result<(), ClientError>;
}

/// Client TLS with native roots and ALPN h2 / http1.1.
pub fn tls_connector() -> TlsConnector {
	let mut roots = rustls::RootCertStore::empty();
	let loaded = rustls_native_certs::load_native_certs();
	for e in &loaded.errors {
		warn!("failed loading native root: {e}");
	}
	for cert in loaded.certs {
		roots.add(cert).ok();
	}
	let mut config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
	TlsConnector::from(Arc::new(config))
}

/// The HTTP client execution engine: dispatcher, connection pool, tag
/// registry, resolver and optional response cache behind one handle.
#[derive(Clone)]
pub struct HttpClient {
	pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
	pub config: ClientConfig,
	pub dispatcher: Dispatcher,
	pub pool: ConnectionPool,
	pub tags: TagRegistry,
	pub resolver: CachedResolver,
	pub cache: Option<Arc<HttpCache>>,
	pub serial_interceptors: Vec<Arc<dyn RequestInterceptor>>,
	pub parallel_interceptors: Vec<Arc<dyn RequestInterceptor>>,
	pub next_call_id: AtomicU64,
	pub shutdown: CancellationToken,
}

#[derive(Default)]
pub struct HttpClientBuilder {
	config: ClientConfig,
	cache: Option<(PathBuf, u64)>,
	serial_interceptors: Vec<Arc<dyn RequestInterceptor>>,
	parallel_interceptors: Vec<Arc<dyn RequestInterceptor>>,
}

impl HttpClientBuilder {
	pub fn max_requests(mut self, n: usize) -> Self {
		self.config.max_requests = n;
		self
	}

	pub fn max_requests_per_host(mut self, n: usize) -> Self {
		self.config.max_requests_per_host = n;
		self
	}

	pub fn keep_alive(mut self, d: Duration) -> Self {
		self.config.keep_alive = d;
		self
	}

	pub fn call_timeout(mut self, d: Duration) -> Self {
		self.config.call_timeout = Some(d);
		self
	}

	/// Enable the on-disk response cache.
	pub fn cache(mut self, directory: PathBuf, max_size: u64) -> Self {
		self.cache = Some((directory, max_size));
		self
	}

	pub fn preproc_timeout(mut self, d: Duration) -> Self {
		self.config.preproc_timeout = d;
		self
	}

	pub fn http_proxy(mut self, addr: SocketAddr) -> Self {
		self.config.proxy = Some(addr);
		self
	}

	pub fn serial_interceptor(mut self, i: Arc<dyn RequestInterceptor>) -> Self {
		self.serial_interceptors.push(i);
		self
	}

	pub fn parallel_interceptor(mut self, i: Arc<dyn RequestInterceptor>) -> Self {
		self.parallel_interceptors.push(i);
		self
	}

	pub fn build(self) -> HttpClient {
		let cache = self.cache.and_then(|(dir, max_size)| {
			match HttpCache::open(&dir, 1, max_size) {
				Ok(c) => Some(c),
				Err(e) => {
					warn!("response cache disabled: {e}");
					None
				},
			}
		});
		let shutdown = CancellationToken::new();
		let pool = ConnectionPool::new(self.config.keep_alive, tls_connector());
		let client = HttpClient {
			inner: Arc::new(ClientInner {
				dispatcher: Dispatcher::new(
					self.config.max_requests,
					self.config.max_requests_per_host,
				),
				pool,
				tags: TagRegistry::new(),
				resolver: CachedResolver::system(),
				cache,
				serial_interceptors: self.serial_interceptors,
				parallel_interceptors: self.parallel_interceptors,
				next_call_id: AtomicU64::new(1),
				shutdown,
				config: self.config,
			}),
		};
		client
			.inner
			.pool
			.start_eviction(client.inner.shutdown.clone());
		client
	}
}

impl HttpClient {
	pub fn builder() -> HttpClientBuilder {
		HttpClientBuilder::default()
	}

	/// Start assembling a request.
	pub fn request(&self, method: Method, url_template: &str) -> RequestBuilder {
		RequestBuilder::new(self.clone(), method, url_template)
	}

	pub fn get(&self, url_template: &str) -> RequestBuilder {
		self.request(Method::GET, url_template)
	}

	pub fn post(&self, url_template: &str) -> RequestBuilder {
		self.request(Method::POST, url_template)
	}

	pub(crate) fn new_call(&self, prepared: PreparedRequest) -> Call {
		let id = self.inner.next_call_id.fetch_add(1, Ordering::Relaxed);
		Call::new(self.clone(), prepared, id)
	}

	/// Cancel every call whose tag contains `tag`.
	pub fn cancel_tag(&self, tag: &str) -> usize {
		self.inner.tags.cancel(tag)
	}

	pub fn cancel_all(&self) -> usize {
		self.inner.tags.cancel_all()
	}

	pub fn queued_calls(&self) -> Vec<dispatcher::Entry> {
		self.inner.dispatcher.queued_calls()
	}

	pub fn running_calls(&self) -> Vec<dispatcher::Entry> {
		self.inner.dispatcher.running_calls()
	}

	pub fn cache(&self) -> Option<&Arc<HttpCache>> {
		self.inner.cache.as_ref()
	}

	/// Stop background maintenance (pool eviction).
	pub fn shutdown(&self) {
		self.inner.shutdown.cancel();
	}
}
