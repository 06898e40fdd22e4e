use std::fs::File;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use http_body_util::BodyExt;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, event};

use super::body::{ProgressBody, RequestBodySpec, build_multipart, new_boundary};
use super::pool::{Connection, ReleaseBody, Sender};
use super::request::PreparedRequest;
use super::route::{Address, Proxy, Route};
use super::{ClientError, HttpClient, TimeoutStage};
use crate::cache::{
	self, CacheWritingBody, EntryMetadata, Lookup, RECEIVED_MILLIS, SENT_MILLIS,
};
use crate::http::{self, Body, HeaderValue, Method, Response, StatusCode, header};
use crate::http::timeout::{BodyTimeout, TimeoutBody};

/// Monotonic timestamps of the exchange, attached as a response extension.
#[derive(Debug, Clone, Copy)]
pub struct CallTiming {
	pub sent_at_millis: u64,
	pub received_at_millis: u64,
}

/// Marks a response that was served from the cache.
#[derive(Debug, Clone, Copy)]
pub struct FromCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
	New = 0,
	Executing = 1,
	Enqueued = 2,
	Completed = 3,
	Failed = 4,
	Canceled = 5,
}

impl CallState {
	fn from_u8(v: u8) -> CallState {
		match v {
			1 => CallState::Executing,
			2 => CallState::Enqueued,
			3 => CallState::Completed,
			4 => CallState::Failed,
			5 => CallState::Canceled,
			_ => CallState::New,
		}
	}
}

/// One prepared, at-most-once HTTP exchange.
#[derive(Clone)]
pub struct Call {
	inner: Arc<CallInner>,
}

struct CallInner {
	id: u64,
	client: HttpClient,
	request: PreparedRequest,
	state: AtomicU8,
	token: CancellationToken,
	timed_out: AtomicBool,
	/// Close handle of the connection currently carrying this call.
	active_conn: Mutex<Option<CancellationToken>>,
}

impl Call {
	pub(crate) fn new(client: HttpClient, request: PreparedRequest, id: u64) -> Call {
		Call {
			inner: Arc::new(CallInner {
				id,
				client,
				request,
				state: AtomicU8::new(CallState::New as u8),
				token: CancellationToken::new(),
				timed_out: AtomicBool::new(false),
				active_conn: Mutex::new(None),
			}),
		}
	}

	pub fn id(&self) -> u64 {
		self.inner.id
	}

	pub fn state(&self) -> CallState {
		CallState::from_u8(self.inner.state.load(Ordering::Acquire))
	}

	pub fn request(&self) -> &PreparedRequest {
		&self.inner.request
	}

	/// The call-wide deadline: explicit per-request, else the client default.
	pub fn timeout(&self) -> Option<Duration> {
		self
			.inner
			.request
			.timeout
			.or(self.inner.client.inner.config.call_timeout)
	}

	pub fn is_canceled(&self) -> bool {
		self.inner.token.is_cancelled()
	}

	/// Idempotent; a no-op after completion. A running call has its socket
	/// closed, a queued call is dropped from the queue.
	pub fn cancel(&self) {
		self.inner.token.cancel();
		if let Some(conn) = self.inner.active_conn.lock().as_ref() {
			conn.cancel();
		}
	}

	/// A fresh call with the same prepared request, for retries.
	pub fn clone_call(&self) -> Call {
		self.inner.client.new_call(self.inner.request.clone())
	}

	/// Run the exchange, waiting for the response headers. The returned
	/// response body remains bounded by the call deadline and cancelable.
	pub async fn execute(&self) -> Result<Response, ClientError> {
		self.transition_start(CallState::Executing)?;
		let result = self.run().await;
		self.finish(&result);
		result
	}

	/// Schedule via the dispatcher; the callback fires exactly once.
	pub fn enqueue<F>(&self, callback: F)
	where
		F: FnOnce(Result<Response, ClientError>) + Send + 'static,
	{
		if let Err(e) = self.transition_start(CallState::Enqueued) {
			callback(Err(e));
			return;
		}
		let call = self.clone();
		tokio::spawn(async move {
			let result = call.run().await;
			call.finish(&result);
			if let Err(e) = &result
				&& !call.inner.request.nothrow
				&& !e.is_canceled()
			{
				tracing::error!(call = call.inner.id, "call failed: {e}");
			}
			callback(result);
		});
	}

	fn transition_start(&self, to: CallState) -> Result<(), ClientError> {
		self
			.inner
			.state
			.compare_exchange(
				CallState::New as u8,
				to as u8,
				Ordering::AcqRel,
				Ordering::Acquire,
			)
			.map(|_| ())
			.map_err(|_| ClientError::Config("call already executed".to_string()))
	}

	fn finish(&self, result: &Result<Response, ClientError>) {
		let state = match result {
			Ok(_) => CallState::Completed,
			Err(e) if e.is_canceled() => CallState::Canceled,
			Err(_) => CallState::Failed,
		};
		self.inner.state.store(state as u8, Ordering::Release);
		self.inner.active_conn.lock().take();
		if self.inner.request.tag.is_some() {
			self.inner.client.inner.tags.remove_task(self.inner.id);
		}
	}

	async fn run(&self) -> Result<Response, ClientError> {
		if let Some(tag) = &self.inner.request.tag {
			self
				.inner
				.client
				.inner
				.tags
				.add_task(tag, self.inner.token.clone(), self.inner.id);
		}
		if self.inner.token.is_cancelled() {
			return Err(ClientError::Canceled);
		}

		// Engine interceptors: parallel ones observe a copy without delaying
		// the call, serial ones rewrite the request under the preprocess
		// deadline. The builder's skip flags bypass one or both.
		let mut request = self.inner.request.clone();
		if !request.skip_preproc {
			for i in &self.inner.client.inner.parallel_interceptors {
				let i = i.clone();
				let mut copy = request.clone();
				tokio::spawn(async move {
					if let Err(e) = i.intercept(&mut copy).await {
						debug!(interceptor = i.name(), "parallel interceptor failed: {e}");
					}
				});
			}
			if !request.skip_serial_preproc
				&& !self.inner.client.inner.serial_interceptors.is_empty()
			{
				let interceptors = self.inner.client.inner.serial_interceptors.clone();
				let serial = async {
					for i in &interceptors {
						i.intercept(&mut request).await?;
					}
					Ok::<(), ClientError>(())
				};
				match tokio::time::timeout(
					self.inner.client.inner.config.preproc_timeout,
					serial,
				)
				.await
				{
					Ok(r) => r?,
					Err(_) => {
						// Cancels the pending call and surfaces the stage.
						self.inner.token.cancel();
						return Err(ClientError::TimedOut {
							stage: TimeoutStage::Preprocess,
						});
					},
				}
			}
		}

		let deadline = self.timeout().map(|t| Instant::now() + t);
		let token = self.inner.token.clone();

		let work = self.run_inner(&request, deadline);
		let result = match deadline {
			Some(d) => {
				tokio::select! {
					_ = token.cancelled() => Err(self.cancel_error()),
					r = tokio::time::timeout_at(d, work) => match r {
						Ok(r) => r,
						Err(_) => {
							self.inner.timed_out.store(true, Ordering::Release);
							// Kill any in-flight socket so the cancel is prompt.
							self.cancel();
							Err(ClientError::TimedOut {
								stage: TimeoutStage::Call,
							})
						},
					},
				}
			},
			None => {
				tokio::select! {
					_ = token.cancelled() => Err(self.cancel_error()),
					r = work => r,
				}
			},
		};
		result
	}

	fn cancel_error(&self) -> ClientError {
		if self.inner.timed_out.load(Ordering::Acquire) {
			ClientError::TimedOut {
				stage: TimeoutStage::Call,
			}
		} else {
			ClientError::Canceled
		}
	}

	async fn run_inner(
		&self,
		request: &PreparedRequest,
		deadline: Option<Instant>,
	) -> Result<Response, ClientError> {
		let inner = &self.inner;
		let url = &request.url;
		let start = std::time::Instant::now();

		let _permit = inner
			.client
			.inner
			.dispatcher
			.acquire(inner.id, url.host(), &inner.token)
			.await
			.map_err(|_| self.cancel_error())?;

		// Consult the cache for GETs before any network work.
		let mut conditional: Option<(EntryMetadata, File, u64)> = None;
		let mut extra_headers: Vec<(http::HeaderName, HeaderValue)> = Vec::new();
		if request.method == Method::GET
			&& let Some(c) = inner.client.cache().cloned()
		{
			c.stats.request_count.fetch_add(1, Ordering::Relaxed);
			let url_string = url.to_string();
			let req_headers = request.headers.clone();
			let lookup = tokio::task::spawn_blocking(move || {
				let l = c.lookup(&url_string, &req_headers);
				(c, l)
			})
			.await
			.map_err(|e| ClientError::Config(e.to_string()))?;
			let (c, lookup) = lookup;
			match lookup {
				Lookup::Fresh(meta, body, length) => {
					c.stats.hit_count.fetch_add(1, Ordering::Relaxed);
					debug!(url = %url, "cache hit (fresh)");
					return cached_response(meta, body, length);
				},
				Lookup::Stale {
					meta,
					body,
					length,
					etag,
					last_modified,
				} => {
					if let Some(etag) = etag {
						extra_headers.push((
							header::IF_NONE_MATCH,
							HeaderValue::try_from(etag)
								.map_err(|_| ClientError::Protocol("bad etag".to_string()))?,
						));
					}
					if let Some(lm) = last_modified {
						extra_headers.push((
							header::IF_MODIFIED_SINCE,
							HeaderValue::try_from(lm)
								.map_err(|_| ClientError::Protocol("bad last-modified".to_string()))?,
						));
					}
					conditional = Some((meta, body, length));
				},
				Lookup::Miss => {},
			}
		}

		// The exchange loop: one connection per attempt, with redirects
		// followed under the same call deadline.
		let mut current_url = url.clone();
		let mut method = request.method.clone();
		let mut body_spec = request.body.clone();
		let mut redirects = 0usize;
		let (resp, conn, sent_at_millis, received_at_millis) = loop {
			let address = Address::from_url(&current_url);
			let mut conn = match inner.client.inner.pool.checkout(&address) {
				Some(c) => c,
				None => self.connect(&address).await?,
			};
			*inner.active_conn.lock() = Some(conn.close.clone());

			let sent_at_millis = cache::now_millis();
			let req = build_request(
				request,
				&current_url,
				&method,
				&body_spec,
				&address,
				&conn,
				&extra_headers,
			)
			.await?;
			let resp = conn.sender.send(req).await.map_err(map_hyper_error)?;
			let received_at_millis = cache::now_millis();
			if let Some(c) = inner.client.cache() {
				c.stats.network_count.fetch_add(1, Ordering::Relaxed);
			}

			event!(
				target: "upstream request",
				tracing::Level::DEBUG,
				http.method = %method,
				http.host = %address.host_header(),
				http.path = %current_url.encoded_path(),
				http.status = resp.status().as_u16(),
				duration = format!("{}ms", start.elapsed().as_millis()),
			);

			let status = resp.status();
			if is_redirect(status)
				&& let Some(location) = resp
					.headers()
					.get(header::LOCATION)
					.and_then(|v| v.to_str().ok())
			{
				redirects += 1;
				if redirects > MAX_REDIRECTS {
					return Err(ClientError::Protocol("too many redirects".to_string()));
				}
				let next = current_url.resolve(location).map_err(ClientError::Url)?;
				debug!(from = %current_url, to = %next, "following redirect");
				// Drain the redirect body so the connection is reusable.
				let release =
					ReleaseBody::new(resp.into_body(), inner.client.inner.pool.clone(), conn);
				tokio::spawn(async move {
					let _ = release.collect().await;
				});
				*inner.active_conn.lock() = None;
				// 303 always demotes to GET; 301/302 do so for POST.
				if status == StatusCode::SEE_OTHER
					|| (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
						&& method == Method::POST)
				{
					method = Method::GET;
					body_spec = RequestBodySpec::Empty;
				}
				current_url = next;
				continue;
			}
			break (resp, conn, sent_at_millis, received_at_millis);
		};

		// 304 refreshes the stored metadata and serves the cached body.
		if resp.status() == StatusCode::NOT_MODIFIED
			&& let Some((meta, body, length)) = conditional
		{
			let refreshed = refresh_metadata(meta, resp.headers(), sent_at_millis, received_at_millis);
			if let Some(c) = inner.client.cache().cloned() {
				c.stats.hit_count.fetch_add(1, Ordering::Relaxed);
				let m = refreshed.clone();
				tokio::task::spawn_blocking(move || c.update(&m));
			}
			// Drain the (empty) 304 body so the connection returns to the pool.
			let incoming = resp.into_body();
			let release = ReleaseBody::new(incoming, inner.client.inner.pool.clone(), conn);
			tokio::spawn(async move {
				let _ = release.collect().await;
			});
			*inner.active_conn.lock() = None;
			return cached_response(refreshed, body, length);
		}

		let (mut parts, incoming) = resp.into_parts();
		let handshake = conn.handshake.clone();
		let body = ReleaseBody::new(incoming, inner.client.inner.pool.clone(), conn);
		let mut body = Body::new(body);

		// Tee cacheable responses into the cache as they stream.
		if request.method == Method::GET
			&& let Some(c) = inner.client.cache().cloned()
			&& cache_headers_allow(request, &parts)
		{
			let meta = EntryMetadata {
				url: url.to_string(),
				method: request.method.to_string(),
				vary_headers: cache::vary_snapshot(&request.headers, &header_pairs(&parts.headers)),
				status_line: format!("HTTP/1.1 {}", parts.status),
				response_headers: with_timestamps(
					header_pairs(&parts.headers),
					sent_at_millis,
					received_at_millis,
				),
				handshake: handshake.clone(),
			};
			if let Some(writer) = c.put(&meta) {
				body = Body::new(CacheWritingBody::new(body, writer));
			}
		}

		// The same deadline keeps bounding the body read.
		if let Some(d) = deadline {
			body = Body::new(TimeoutBody::new(BodyTimeout::Deadline(d), body));
		}
		body = Body::new(CancelBody {
			body,
			cancelled: self.inner.token.clone().cancelled_owned(),
		});

		parts.extensions.insert(CallTiming {
			sent_at_millis,
			received_at_millis,
		});
		if let Some(hs) = handshake {
			parts.extensions.insert(hs);
		}
		Ok(Response::from_parts(parts, body))
	}

	async fn connect(&self, address: &Address) -> Result<Connection, ClientError> {
		let inner = &self.inner;
		// A configured forward proxy takes plain-http traffic; TLS origins
		// still dial direct.
		if !address.tls
			&& let Some(p) = inner.client.inner.config.proxy
		{
			let route = Route {
				address: address.clone(),
				proxy: Proxy::Http(p),
				socket_addr: p,
			};
			return inner.client.inner.pool.connect(&route).await;
		}
		let ips = inner
			.client
			.inner
			.resolver
			.resolve(&address.host)
			.await
			.map_err(|e| ClientError::Network(format!("dns: {e}")))?;
		let mut last_err = ClientError::Network(format!("no routes for {}", address.host));
		for ip in ips.iter() {
			let route = Route {
				address: address.clone(),
				proxy: Proxy::Direct,
				socket_addr: (*ip, address.port).into(),
			};
			match inner.client.inner.pool.connect(&route).await {
				Ok(conn) => return Ok(conn),
				Err(e) => {
					debug!(route = %route.address, addr = %route.socket_addr, "connect failed: {e}");
					last_err = e;
				},
			}
		}
		Err(last_err)
	}

}

const MAX_REDIRECTS: usize = 20;

fn is_redirect(status: StatusCode) -> bool {
	matches!(
		status,
		StatusCode::MOVED_PERMANENTLY
			| StatusCode::FOUND
			| StatusCode::SEE_OTHER
			| StatusCode::TEMPORARY_REDIRECT
			| StatusCode::PERMANENT_REDIRECT
	)
}

async fn build_request(
	request: &PreparedRequest,
	url: &super::url::Url,
	method: &Method,
	body_spec: &RequestBodySpec,
	address: &Address,
	conn: &Connection,
	extra_headers: &[(http::HeaderName, HeaderValue)],
) -> Result<hyper::Request<Body>, ClientError> {
	// HTTP/2 and proxied requests carry the full URL; plain HTTP/1.1 uses
	// origin-form plus a Host header.
	let h2 = matches!(conn.sender, Sender::H2(_));
	let absolute = h2 || matches!(conn.route.proxy, Proxy::Http(_));
	let uri: http::Uri = if absolute {
		url
			.to_string()
			.parse()
			.map_err(|_| ClientError::Protocol("unrepresentable url".to_string()))?
	} else {
		url
			.encoded_path_and_query()
			.parse()
			.map_err(|_| ClientError::Protocol("unrepresentable path".to_string()))?
	};

	let builder = hyper::Request::builder().method(method.clone()).uri(uri);

	let (body, content_type, content_length) = match body_spec.clone() {
		RequestBodySpec::Empty => (Body::empty(), None, None),
		RequestBodySpec::Bytes { data, content_type } => {
			let len = data.len() as u64;
			(Body::from(data), Some(content_type), Some(len))
		},
		RequestBodySpec::Multipart { parts } => {
			let (body, len, content_type) = build_multipart(parts, new_boundary()).await?;
			(body, Some(content_type), Some(len))
		},
	};

	let mut req = builder
		.body(Body::empty())
		.map_err(|e| ClientError::Config(e.to_string()))?;
	*req.headers_mut() = request.headers.clone();
	for (name, value) in extra_headers {
		req.headers_mut().insert(name.clone(), value.clone());
	}
	if !h2 && !req.headers().contains_key(header::HOST) {
		let host = HeaderValue::try_from(address.host_header())
			.map_err(|_| ClientError::Config("unrepresentable host".to_string()))?;
		req.headers_mut().insert(header::HOST, host);
	}
	if let Some(ct) = content_type
		&& !req.headers().contains_key(header::CONTENT_TYPE)
	{
		req.headers_mut().insert(
			header::CONTENT_TYPE,
			HeaderValue::try_from(ct)
				.map_err(|_| ClientError::Config("bad content type".to_string()))?,
		);
	}
	if let Some(len) = content_length {
		req
			.headers_mut()
			.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
	}

	let body = match &request.progress {
		Some((callback, step)) => Body::new(ProgressBody::new(
			body,
			callback.clone(),
			*step,
			content_length,
		)),
		None => body,
	};
	Ok(req.map(|_| body))
}

fn map_hyper_error(e: hyper::Error) -> ClientError {
	if e.is_parse() || e.is_parse_status() || e.is_incomplete_message() {
		ClientError::Protocol(e.to_string())
	} else if e.is_canceled() {
		ClientError::Canceled
	} else {
		ClientError::Network(e.to_string())
	}
}

fn header_pairs(headers: &http::HeaderMap) -> Vec<(String, String)> {
	headers
		.iter()
		.filter_map(|(name, value)| {
			value
				.to_str()
				.ok()
				.map(|v| (name.as_str().to_string(), v.to_string()))
		})
		.collect()
}

fn with_timestamps(
	mut headers: Vec<(String, String)>,
	sent: u64,
	received: u64,
) -> Vec<(String, String)> {
	headers.retain(|(n, _)| n != SENT_MILLIS && n != RECEIVED_MILLIS);
	headers.push((SENT_MILLIS.to_string(), sent.to_string()));
	headers.push((RECEIVED_MILLIS.to_string(), received.to_string()));
	headers
}

fn cache_headers_allow(request: &PreparedRequest, parts: &::http::response::Parts) -> bool {
	cache::is_cacheable(
		&request.method,
		&request.headers,
		parts.status.as_u16(),
		&header_pairs(&parts.headers),
	)
}

/// Merge 304 headers over the stored ones and refresh the timestamps.
fn refresh_metadata(
	mut meta: EntryMetadata,
	network: &http::HeaderMap,
	sent: u64,
	received: u64,
) -> EntryMetadata {
	for (name, value) in network {
		let n = name.as_str();
		if matches!(n, "content-length" | "transfer-encoding" | "connection") {
			continue;
		}
		let Ok(v) = value.to_str() else { continue };
		meta.response_headers.retain(|(k, _)| !k.eq_ignore_ascii_case(n));
		meta.response_headers.push((n.to_string(), v.to_string()));
	}
	meta.response_headers = with_timestamps(meta.response_headers, sent, received);
	meta
}

/// Build a response whose body streams from a cache snapshot file.
fn cached_response(meta: EntryMetadata, body: File, length: u64) -> Result<Response, ClientError> {
	let status =
		StatusCode::from_u16(meta.status_code()).unwrap_or(StatusCode::OK);
	let mut builder = hyper::Response::builder().status(status);
	for (name, value) in &meta.response_headers {
		if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding")
		{
			continue;
		}
		builder = builder.header(name.as_str(), value.as_str());
	}
	builder = builder.header(header::CONTENT_LENGTH, length);
	let file = tokio::fs::File::from_std(body);
	let stream = tokio_util::io::ReaderStream::new(file);
	let mut resp = builder
		.body(Body::from_stream(stream))
		.map_err(|e| ClientError::Protocol(e.to_string()))?;
	resp.extensions_mut().insert(FromCache);
	resp.extensions_mut().insert(CallTiming {
		sent_at_millis: meta.sent_millis(),
		received_at_millis: meta.received_millis(),
	});
	Ok(resp)
}

pin_project_lite::pin_project! {
	/// Body reads fail once the owning call is canceled.
	struct CancelBody {
		#[pin]
		body: Body,
		#[pin]
		cancelled: tokio_util::sync::WaitForCancellationFutureOwned,
	}
}

impl http_body::Body for CancelBody {
	type Data = bytes::Bytes;
	type Error = axum_core::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		if this.cancelled.poll(cx).is_ready() {
			return Poll::Ready(Some(Err(axum_core::Error::new(ClientError::Canceled))));
		}
		let frame = ready!(this.body.poll_frame(cx));
		Poll::Ready(frame)
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.body.size_hint()
	}
}
