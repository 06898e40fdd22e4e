use std::collections::HashMap;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::{Duration, Instant};

use hyper::client::conn::{http1, http2};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls_pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::ClientError;
use super::route::{Address, Route};

/// TLS details captured at handshake time, attached to responses so the cache
/// can persist them.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeInfo {
	pub cipher_suite: String,
	pub tls_version: String,
	pub peer_certs: Vec<Vec<u8>>,
	pub local_certs: Vec<Vec<u8>>,
}

pub enum Sender {
	H1(http1::SendRequest<crate::http::Body>),
	H2(http2::SendRequest<crate::http::Body>),
}

impl Sender {
	fn is_open(&self) -> bool {
		match self {
			Sender::H1(s) => !s.is_closed(),
			Sender::H2(s) => !s.is_closed(),
		}
	}

	pub async fn send(
		&mut self,
		req: hyper::Request<crate::http::Body>,
	) -> hyper::Result<hyper::Response<hyper::body::Incoming>> {
		match self {
			Sender::H1(s) => s.send_request(req).await,
			Sender::H2(s) => s.send_request(req).await,
		}
	}
}

/// One established keep-alive connection.
pub struct Connection {
	pub id: u64,
	pub route: Route,
	pub sender: Sender,
	pub handshake: Option<HandshakeInfo>,
	/// Cancelling this aborts the connection driver, closing the socket.
	pub close: CancellationToken,
	idle_since: Instant,
}

impl Connection {
	fn reusable(&self) -> bool {
		self.sender.is_open() && !self.close.is_cancelled()
	}
}

/// Keep-alive connections keyed by Address. Checkout removes a connection
/// (HTTP/1 connections carry one exchange at a time); release returns it.
/// Idle connections past `keep_alive` are evicted by a periodic sweep.
#[derive(Clone)]
pub struct ConnectionPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	idle: Mutex<HashMap<Address, VecDeque<Connection>>>,
	keep_alive: Duration,
	next_id: AtomicU64,
	tls: TlsConnector,
}

impl ConnectionPool {
	pub fn new(keep_alive: Duration, tls: TlsConnector) -> ConnectionPool {
		ConnectionPool {
			inner: Arc::new(PoolInner {
				idle: Mutex::new(HashMap::new()),
				keep_alive,
				next_id: AtomicU64::new(1),
				tls,
			}),
		}
	}

	/// Spawn the idle-eviction sweep; stops when `stop` fires. Without a
	/// running runtime (engine built before the executor) the sweep is skipped
	/// and eviction happens opportunistically on checkout.
	pub fn start_eviction(&self, stop: CancellationToken) {
		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			return;
		};
		let pool = self.clone();
		let period = pool.inner.keep_alive.max(Duration::from_secs(1)) / 2;
		handle.spawn(async move {
			loop {
				tokio::select! {
					_ = stop.cancelled() => return,
					_ = tokio::time::sleep(period) => pool.evict_idle(),
				}
			}
		});
	}

	pub fn evict_idle(&self) {
		let Some(cutoff) = Instant::now().checked_sub(self.inner.keep_alive) else {
			return;
		};
		let mut evicted = 0usize;
		let mut idle = self.inner.idle.lock();
		idle.retain(|_, conns| {
			conns.retain(|c| {
				let keep = c.reusable() && c.idle_since > cutoff;
				if !keep {
					c.close.cancel();
					evicted += 1;
				}
				keep
			});
			!conns.is_empty()
		});
		if evicted > 0 {
			trace!(evicted, "evicted idle connections");
		}
	}

	pub fn checkout(&self, address: &Address) -> Option<Connection> {
		let mut idle = self.inner.idle.lock();
		let conns = idle.get_mut(address)?;
		while let Some(conn) = conns.pop_front() {
			if conn.reusable() {
				trace!(conn = conn.id, %address, "reusing pooled connection");
				return Some(conn);
			}
			conn.close.cancel();
		}
		None
	}

	pub fn release(&self, mut conn: Connection) {
		if !conn.reusable() {
			conn.close.cancel();
			return;
		}
		conn.idle_since = Instant::now();
		let mut idle = self.inner.idle.lock();
		idle
			.entry(conn.route.address.clone())
			.or_default()
			.push_back(conn);
	}

	pub fn idle_count(&self, address: &Address) -> usize {
		self
			.inner
			.idle
			.lock()
			.get(address)
			.map(|c| c.len())
			.unwrap_or(0)
	}

	/// Establish a new connection along `route`.
	pub async fn connect(&self, route: &Route) -> Result<Connection, ClientError> {
		let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
		let dial = route.dial_addr();
		let stream = TcpStream::connect(dial)
			.await
			.map_err(|e| ClientError::Network(format!("connect {dial}: {e}")))?;
		stream.set_nodelay(true).ok();

		let close = CancellationToken::new();
		if route.address.tls {
			let server_name = ServerName::try_from(route.address.host.clone())
				.map_err(|_| ClientError::Tls(format!("invalid server name {}", route.address.host)))?;
			let tls_stream = self
				.inner
				.tls
				.connect(server_name, stream)
				.await
				.map_err(|e| ClientError::Tls(e.to_string()))?;

			let (_, session) = tls_stream.get_ref();
			let handshake = HandshakeInfo {
				cipher_suite: session
					.negotiated_cipher_suite()
					.map(|cs| format!("{:?}", cs.suite()))
					.unwrap_or_default(),
				tls_version: session
					.protocol_version()
					.map(|v| format!("{v:?}"))
					.unwrap_or_default(),
				peer_certs: session
					.peer_certificates()
					.map(|certs| certs.iter().map(|c| c.to_vec()).collect())
					.unwrap_or_default(),
				local_certs: Vec::new(),
			};
			let h2 = session.alpn_protocol() == Some(b"h2");

			let sender = if h2 {
				let (sender, conn) =
					http2::handshake(TokioExecutor::new(), TokioIo::new(tls_stream))
						.await
						.map_err(map_handshake_err)?;
				drive(conn, close.clone(), id);
				Sender::H2(sender)
			} else {
				let (sender, conn) = http1::handshake(TokioIo::new(tls_stream))
					.await
					.map_err(map_handshake_err)?;
				drive(conn, close.clone(), id);
				Sender::H1(sender)
			};
			debug!(conn = id, route = %route.address, h2, "established TLS connection");
			Ok(Connection {
				id,
				route: route.clone(),
				sender,
				handshake: Some(handshake),
				close,
				idle_since: Instant::now(),
			})
		} else {
			let (sender, conn) = http1::handshake(TokioIo::new(stream))
				.await
				.map_err(map_handshake_err)?;
			drive(conn, close.clone(), id);
			debug!(conn = id, route = %route.address, "established connection");
			Ok(Connection {
				id,
				route: route.clone(),
				sender: Sender::H1(sender),
				handshake: None,
				close,
				idle_since: Instant::now(),
			})
		}
	}
}

fn map_handshake_err(e: hyper::Error) -> ClientError {
	if e.is_parse() {
		ClientError::Protocol(e.to_string())
	} else {
		ClientError::Network(e.to_string())
	}
}

fn drive<F>(conn: F, close: CancellationToken, id: u64)
where
	F: std::future::Future + Send + 'static,
	F::Output: std::fmt::Debug,
{
	tokio::spawn(async move {
		tokio::select! {
			r = conn => trace!(conn = id, "connection finished: {r:?}"),
			_ = close.cancelled() => trace!(conn = id, "connection closed"),
		}
	});
}

pin_project_lite::pin_project! {
	/// Returns the connection to the pool once the body is fully consumed;
	/// a drop before end-of-stream closes the connection instead.
	pub struct ReleaseBody<B> {
		#[pin]
		body: B,
		pool: ConnectionPool,
		conn: Option<Connection>,
		done: bool,
	}

	impl<B> PinnedDrop for ReleaseBody<B> {
		fn drop(this: Pin<&mut Self>) {
			let this = this.project();
			if let Some(conn) = this.conn.take() {
				if *this.done {
					this.pool.release(conn);
				} else {
					conn.close.cancel();
				}
			}
		}
	}
}

impl<B> ReleaseBody<B> {
	pub fn new(body: B, pool: ConnectionPool, conn: Connection) -> Self {
		ReleaseBody {
			body,
			pool,
			conn: Some(conn),
			done: false,
		}
	}
}

impl<B> http_body::Body for ReleaseBody<B>
where
	B: http_body::Body,
{
	type Data = B::Data;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let frame = ready!(this.body.poll_frame(cx));
		if frame.is_none() && !*this.done {
			*this.done = true;
			if let Some(conn) = this.conn.take() {
				this.pool.release(conn);
			}
		}
		Poll::Ready(frame)
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> http_body::SizeHint {
		self.body.size_hint()
	}
}
