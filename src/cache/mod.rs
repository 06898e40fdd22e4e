pub mod disklru;

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, ready};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::pool::HandshakeInfo;
use crate::http::{HeaderMap, Method, header};
use disklru::{DiskLruCache, Editor};

#[derive(Debug, Error)]
pub enum CacheError {
	#[error("cache io: {0}")]
	Io(#[from] std::io::Error),
	#[error("corrupt cache: {0}")]
	Corrupt(&'static str),
}

/// Synthetic headers recording the exchange timestamps inside stored entries.
pub const SENT_MILLIS: &str = "Vortex-Sent-Millis";
pub const RECEIVED_MILLIS: &str = "Vortex-Received-Millis";

/// Cache keys are the hex MD5 of the canonical request URL.
pub fn key_for(url: &str) -> String {
	let mut hasher = Md5::new();
	hasher.update(url.as_bytes());
	hex::encode(hasher.finalize())
}

pub fn now_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

/// The text metadata stored in slot 0 of each entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryMetadata {
	pub url: String,
	pub method: String,
	/// Request header values the response varies on, snapshotted at put time.
	pub vary_headers: Vec<(String, String)>,
	pub status_line: String,
	pub response_headers: Vec<(String, String)>,
	pub handshake: Option<HandshakeInfo>,
}

impl EntryMetadata {
	pub fn status_code(&self) -> u16 {
		self
			.status_line
			.split(' ')
			.nth(1)
			.and_then(|s| s.parse().ok())
			.unwrap_or(0)
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.response_headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}

	pub fn sent_millis(&self) -> u64 {
		self.header(SENT_MILLIS).and_then(|v| v.parse().ok()).unwrap_or(0)
	}

	pub fn received_millis(&self) -> u64 {
		self
			.header(RECEIVED_MILLIS)
			.and_then(|v| v.parse().ok())
			.unwrap_or(0)
	}

	/// Names listed in the stored `Vary` response header.
	pub fn vary_names(&self) -> Vec<String> {
		self
			.response_headers
			.iter()
			.filter(|(n, _)| n.eq_ignore_ascii_case("vary"))
			.flat_map(|(_, v)| v.split(','))
			.map(|s| s.trim().to_ascii_lowercase())
			.filter(|s| !s.is_empty())
			.collect()
	}

	pub fn write(&self, w: &mut impl Write) -> std::io::Result<()> {
		writeln!(w, "{}", self.url)?;
		writeln!(w, "{}", self.method)?;
		writeln!(w, "{}", self.vary_headers.len())?;
		for (name, value) in &self.vary_headers {
			writeln!(w, "{name}: {value}")?;
		}
		writeln!(w, "{}", self.status_line)?;
		writeln!(w, "{}", self.response_headers.len())?;
		for (name, value) in &self.response_headers {
			writeln!(w, "{name}: {value}")?;
		}
		if let Some(handshake) = &self.handshake {
			writeln!(w)?;
			writeln!(w, "{}", handshake.cipher_suite)?;
			writeln!(w, "{}", handshake.peer_certs.len())?;
			for cert in &handshake.peer_certs {
				writeln!(w, "{}", BASE64.encode(cert))?;
			}
			writeln!(w, "{}", handshake.local_certs.len())?;
			for cert in &handshake.local_certs {
				writeln!(w, "{}", BASE64.encode(cert))?;
			}
			writeln!(w, "{}", handshake.tls_version)?;
		}
		Ok(())
	}

	pub fn read(r: impl Read) -> Result<EntryMetadata, CacheError> {
		let mut lines = BufReader::new(r).lines();
		let mut next = move || -> Result<String, CacheError> {
			Ok(
				lines
					.next()
					.ok_or(CacheError::Corrupt("truncated metadata"))??,
			)
		};

		let url = next()?;
		let method = next()?;
		let vary_count: usize = next()?
			.parse()
			.map_err(|_| CacheError::Corrupt("bad vary count"))?;
		let mut vary_headers = Vec::with_capacity(vary_count);
		for _ in 0..vary_count {
			vary_headers.push(split_header_line(&next()?)?);
		}
		let status_line = next()?;
		let header_count: usize = next()?
			.parse()
			.map_err(|_| CacheError::Corrupt("bad header count"))?;
		let mut response_headers = Vec::with_capacity(header_count);
		for _ in 0..header_count {
			response_headers.push(split_header_line(&next()?)?);
		}

		// HTTPS entries continue with a blank line and the handshake block.
		let handshake = match next() {
			Ok(blank) if blank.is_empty() => {
				let cipher_suite = next()?;
				let mut read_certs = |next: &mut dyn FnMut() -> Result<String, CacheError>| -> Result<Vec<Vec<u8>>, CacheError> {
					let count: usize = next()?
						.parse()
						.map_err(|_| CacheError::Corrupt("bad cert count"))?;
					let mut certs = Vec::with_capacity(count);
					for _ in 0..count {
						certs.push(
							BASE64
								.decode(next()?.as_bytes())
								.map_err(|_| CacheError::Corrupt("bad cert base64"))?,
						);
					}
					Ok(certs)
				};
				let peer_certs = read_certs(&mut next)?;
				let local_certs = read_certs(&mut next)?;
				let tls_version = next()?;
				Some(HandshakeInfo {
					cipher_suite,
					tls_version,
					peer_certs,
					local_certs,
				})
			},
			_ => None,
		};

		Ok(EntryMetadata {
			url,
			method,
			vary_headers,
			status_line,
			response_headers,
			handshake,
		})
	}
}

fn split_header_line(line: &str) -> Result<(String, String), CacheError> {
	let (name, value) = line
		.split_once(": ")
		.ok_or(CacheError::Corrupt("bad header line"))?;
	Ok((name.to_string(), value.to_string()))
}

/// A stored response applies only when every Vary-listed request header
/// matches the stored snapshot byte-for-byte.
pub fn vary_matches(meta: &EntryMetadata, request_headers: &HeaderMap) -> bool {
	for name in meta.vary_names() {
		if name == "*" {
			return false;
		}
		let current = join_header_values(request_headers, &name);
		let stored = meta
			.vary_headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(&name))
			.map(|(_, v)| v.clone())
			.unwrap_or_default();
		if current != stored {
			return false;
		}
	}
	true
}

pub fn join_header_values(headers: &HeaderMap, name: &str) -> String {
	headers
		.get_all(name)
		.iter()
		.filter_map(|v| v.to_str().ok())
		.collect::<Vec<_>>()
		.join(", ")
}

/// Snapshot the request header values named by the response's Vary header.
pub fn vary_snapshot(
	request_headers: &HeaderMap,
	response_headers: &[(String, String)],
) -> Vec<(String, String)> {
	let names: Vec<String> = response_headers
		.iter()
		.filter(|(n, _)| n.eq_ignore_ascii_case("vary"))
		.flat_map(|(_, v)| v.split(','))
		.map(|s| s.trim().to_ascii_lowercase())
		.filter(|s| !s.is_empty())
		.collect();
	names
		.into_iter()
		.map(|name| {
			let value = join_header_values(request_headers, &name);
			(name, value)
		})
		.collect()
}

fn cache_control_has(value: Option<&str>, directive: &str) -> bool {
	value
		.map(|v| {
			v.split(',')
				.any(|d| d.trim().eq_ignore_ascii_case(directive) || d.trim().starts_with(directive))
		})
		.unwrap_or(false)
}

fn max_age_seconds(value: Option<&str>) -> Option<u64> {
	value?.split(',').find_map(|d| {
		let d = d.trim();
		d.strip_prefix("max-age=")?.parse().ok()
	})
}

/// A response is stored only when the method is GET, nothing forbids caching,
/// and the response is either revalidatable or has freshness information.
pub fn is_cacheable(method: &Method, request_headers: &HeaderMap, status: u16, response_headers: &[(String, String)]) -> bool {
	if method != Method::GET {
		return false;
	}
	if !matches!(status, 200 | 203 | 300 | 301 | 308) {
		return false;
	}
	let req_cc = request_headers
		.get(header::CACHE_CONTROL)
		.and_then(|v| v.to_str().ok());
	if cache_control_has(req_cc, "no-store") {
		return false;
	}
	let find = |name: &str| {
		response_headers
			.iter()
			.find(|(n, _)| n.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	};
	if cache_control_has(find("cache-control"), "no-store") {
		return false;
	}
	if find("vary").map(|v| v.trim() == "*").unwrap_or(false) {
		return false;
	}
	let has_validator = find("etag").is_some() || find("last-modified").is_some();
	let has_freshness = max_age_seconds(find("cache-control")).is_some() || find("expires").is_some();
	has_validator || has_freshness
}

/// What the cache can do for one request.
pub enum Lookup {
	Miss,
	/// Still fresh; serve without network.
	Fresh(EntryMetadata, File, u64),
	/// Needs revalidation with the stored validators.
	Stale {
		meta: EntryMetadata,
		body: File,
		length: u64,
		etag: Option<String>,
		last_modified: Option<String>,
	},
}

#[derive(Debug, Default)]
pub struct CacheStats {
	pub request_count: AtomicU64,
	pub network_count: AtomicU64,
	pub hit_count: AtomicU64,
	pub write_success_count: AtomicU64,
	pub write_abort_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStatsSnapshot {
	pub request_count: u64,
	pub network_count: u64,
	pub hit_count: u64,
	pub write_success_count: u64,
	pub write_abort_count: u64,
}

impl CacheStats {
	pub fn snapshot(&self) -> CacheStatsSnapshot {
		CacheStatsSnapshot {
			request_count: self.request_count.load(Ordering::Relaxed),
			network_count: self.network_count.load(Ordering::Relaxed),
			hit_count: self.hit_count.load(Ordering::Relaxed),
			write_success_count: self.write_success_count.load(Ordering::Relaxed),
			write_abort_count: self.write_abort_count.load(Ordering::Relaxed),
		}
	}
}

/// The response cache: content-addressed entries in a [`DiskLruCache`], HTTP
/// semantics (vary matching, freshness, conditional revalidation) on top.
pub struct HttpCache {
	lru: Mutex<DiskLruCache>,
	pub stats: CacheStats,
}

impl HttpCache {
	pub fn open(directory: &Path, app_version: u32, max_size: u64) -> Result<Arc<HttpCache>, CacheError> {
		Ok(Arc::new(HttpCache {
			lru: Mutex::new(DiskLruCache::open(directory, app_version, max_size)?),
			stats: CacheStats::default(),
		}))
	}

	/// Look up a stored response for `url`, honoring vary and freshness.
	pub fn lookup(&self, url: &str, request_headers: &HeaderMap) -> Lookup {
		let key = key_for(url);
		let snapshot = {
			let mut lru = self.lru.lock();
			match lru.get(&key) {
				Ok(s) => s,
				Err(e) => {
					warn!("cache lookup failed: {e}");
					None
				},
			}
		};
		let Some(mut snapshot) = snapshot else {
			return Lookup::Miss;
		};
		let meta = match EntryMetadata::read(&mut snapshot.files[0]) {
			Ok(m) => m,
			Err(e) => {
				debug!("cache entry metadata unreadable: {e}");
				self.remove(url);
				return Lookup::Miss;
			},
		};
		if meta.url != url || !vary_matches(&meta, request_headers) {
			return Lookup::Miss;
		}
		let [_, body] = snapshot.files;
		let length = snapshot.lengths[1];

		let age_millis = now_millis().saturating_sub(meta.received_millis());
		let fresh_millis = max_age_seconds(meta.header("cache-control"))
			.map(|s| s * 1000)
			.unwrap_or(0);
		if age_millis < fresh_millis {
			return Lookup::Fresh(meta, body, length);
		}
		let etag = meta.header("etag").map(|s| s.to_string());
		let last_modified = meta.header("last-modified").map(|s| s.to_string());
		if etag.is_some() || last_modified.is_some() {
			return Lookup::Stale {
				meta,
				body,
				length,
				etag,
				last_modified,
			};
		}
		// Expired with no validator: nothing usable remains.
		Lookup::Miss
	}

	/// Start writing an entry: metadata lands in slot 0 immediately, the body
	/// streams through the returned writer and the entry becomes visible only
	/// on commit. `None` when another editor is open for the key.
	pub fn put(self: &Arc<Self>, meta: &EntryMetadata) -> Option<CacheWriter> {
		let key = key_for(&meta.url);
		let mut lru = self.lru.lock();
		let mut editor = match lru.edit(&key) {
			Ok(Some(e)) => e,
			Ok(None) => return None,
			Err(e) => {
				warn!("cache edit failed: {e}");
				return None;
			},
		};
		let write_meta = |editor: &mut Editor| -> Result<File, CacheError> {
			let mut sink = editor.new_sink(0)?;
			meta.write(&mut sink)?;
			sink.flush()?;
			editor.new_sink(1)
		};
		match write_meta(&mut editor) {
			Ok(body_sink) => Some(CacheWriter {
				cache: self.clone(),
				editor: Some(editor),
				sink: Some(body_sink),
				failed: false,
			}),
			Err(e) => {
				warn!("cache put failed: {e}");
				lru.abort(editor).ok();
				None
			},
		}
	}

	/// Rewrite only the metadata of the stored entry (304 revalidation).
	pub fn update(&self, meta: &EntryMetadata) {
		let key = key_for(&meta.url);
		let mut lru = self.lru.lock();
		let editor = match lru.edit(&key) {
			Ok(Some(e)) => e,
			_ => return,
		};
		let mut editor = editor;
		let result: Result<(), CacheError> = (|| {
			let mut sink = editor.new_sink(0)?;
			meta.write(&mut sink)?;
			sink.flush()?;
			Ok(())
		})();
		match result {
			Ok(()) => {
				if let Err(e) = lru.commit(editor) {
					warn!("cache update commit failed: {e}");
				}
			},
			Err(e) => {
				warn!("cache update failed: {e}");
				lru.abort(editor).ok();
			},
		}
	}

	pub fn remove(&self, url: &str) {
		let key = key_for(url);
		let mut lru = self.lru.lock();
		if let Err(e) = lru.remove(&key) {
			warn!("cache remove failed: {e}");
		}
	}

	/// Stored entry keys, least-recently-used first.
	pub fn keys(&self) -> Vec<String> {
		self.lru.lock().keys()
	}

	/// The stored request URLs, least-recently-used first. The listing is a
	/// snapshot; `remove` may be called while iterating it.
	pub fn urls(&self) -> Vec<String> {
		let paths: Vec<std::path::PathBuf> = {
			let lru = self.lru.lock();
			lru
				.keys()
				.into_iter()
				.filter_map(|key| lru.peek_file(&key, 0))
				.collect()
		};
		paths
			.into_iter()
			.filter_map(|path| {
				let file = File::open(path).ok()?;
				let mut line = String::new();
				BufReader::new(file).read_line(&mut line).ok()?;
				let url = line.trim_end_matches('\n');
				(!url.is_empty()).then(|| url.to_string())
			})
			.collect()
	}

	pub fn size(&self) -> u64 {
		self.lru.lock().size()
	}

	pub fn max_size(&self) -> u64 {
		self.lru.lock().max_size()
	}

	fn finish_write(&self, editor: Editor, ok: bool) {
		let mut lru = self.lru.lock();
		let result = if ok {
			self.stats.write_success_count.fetch_add(1, Ordering::Relaxed);
			lru.commit(editor)
		} else {
			self.stats.write_abort_count.fetch_add(1, Ordering::Relaxed);
			lru.abort(editor)
		};
		if let Err(e) = result {
			warn!("cache write completion failed: {e}");
		}
	}
}

/// Streams a response body into an entry's body slot. Dropping the writer
/// without `commit` aborts the edit and discards the staged files.
pub struct CacheWriter {
	cache: Arc<HttpCache>,
	editor: Option<Editor>,
	sink: Option<File>,
	failed: bool,
}

impl CacheWriter {
	pub fn write(&mut self, data: &[u8]) {
		if self.failed {
			return;
		}
		if let Some(sink) = self.sink.as_mut()
			&& let Err(e) = sink.write_all(data)
		{
			debug!("cache body write failed, aborting entry: {e}");
			self.failed = true;
		}
	}

	pub fn commit(mut self) {
		let ok = !self.failed && self.sink.take().map(|mut s| s.flush().is_ok()).unwrap_or(false);
		if let Some(editor) = self.editor.take() {
			self.cache.finish_write(editor, ok);
		}
	}

	pub fn abort(mut self) {
		self.sink.take();
		if let Some(editor) = self.editor.take() {
			self.cache.finish_write(editor, false);
		}
	}
}

impl Drop for CacheWriter {
	fn drop(&mut self) {
		self.sink.take();
		if let Some(editor) = self.editor.take() {
			self.cache.finish_write(editor, false);
		}
	}
}

pin_project_lite::pin_project! {
	/// Tee of a network response body into the cache. Commits when the
	/// upstream body ends cleanly; an early drop or error aborts the entry.
	pub struct CacheWritingBody<B> {
		#[pin]
		body: B,
		writer: Option<CacheWriter>,
	}
}

impl<B> CacheWritingBody<B> {
	pub fn new(body: B, writer: CacheWriter) -> Self {
		CacheWritingBody {
			body,
			writer: Some(writer),
		}
	}
}

impl<B> http_body::Body for CacheWritingBody<B>
where
	B: http_body::Body<Data = bytes::Bytes>,
{
	type Data = bytes::Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let frame = ready!(this.body.poll_frame(cx));
		match &frame {
			Some(Ok(f)) => {
				if let (Some(writer), Some(data)) = (this.writer.as_mut(), f.data_ref()) {
					writer.write(data);
				}
			},
			Some(Err(_)) => {
				if let Some(writer) = this.writer.take() {
					writer.abort();
				}
			},
			None => {
				if let Some(writer) = this.writer.take() {
					writer.commit();
				}
			},
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
