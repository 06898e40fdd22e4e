use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http_body::{Frame, SizeHint};
use pin_project_lite::pin_project;
use rand::Rng;
use tokio::io::AsyncReadExt;

use crate::client::ClientError;

pub const DEFAULT_PROGRESS_STEP: u64 = 8 * 1024;

/// Serialization applied to structured body parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyType {
	#[default]
	Json,
	Form,
}

impl BodyType {
	pub fn media_type(&self, charset: &str) -> String {
		match self {
			BodyType::Json => format!("application/json; charset={charset}"),
			BodyType::Form => format!("application/x-www-form-urlencoded; charset={charset}"),
		}
	}

	pub fn serialize_value(&self, value: &serde_json::Value) -> Result<Bytes, ClientError> {
		match self {
			BodyType::Json => Ok(Bytes::from(
				serde_json::to_vec(value).map_err(|e| ClientError::Config(e.to_string()))?,
			)),
			BodyType::Form => {
				let obj = value
					.as_object()
					.ok_or_else(|| ClientError::Config("form body requires an object".to_string()))?;
				let pairs: Vec<(String, String)> = obj
					.iter()
					.map(|(k, v)| (k.clone(), json_scalar_to_string(v)))
					.collect();
				let s = serde_urlencoded::to_string(&pairs)
					.map_err(|e| ClientError::Config(e.to_string()))?;
				Ok(Bytes::from(s))
			},
		}
	}

	pub fn serialize_params(&self, params: &[(String, String)]) -> Result<Bytes, ClientError> {
		match self {
			BodyType::Json => {
				let map: serde_json::Map<String, serde_json::Value> = params
					.iter()
					.map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
					.collect();
				Ok(Bytes::from(
					serde_json::to_vec(&map).map_err(|e| ClientError::Config(e.to_string()))?,
				))
			},
			BodyType::Form => {
				let s = serde_urlencoded::to_string(params)
					.map_err(|e| ClientError::Config(e.to_string()))?;
				Ok(Bytes::from(s))
			},
		}
	}
}

fn json_scalar_to_string(v: &serde_json::Value) -> String {
	match v {
		serde_json::Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}

#[derive(Debug, Clone)]
pub enum FileSource {
	Bytes(Bytes),
	Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FilePart {
	pub name: String,
	pub filename: String,
	pub content_type: String,
	pub source: FileSource,
}

/// One part of a multipart/form-data body.
#[derive(Debug, Clone)]
pub enum Part {
	Field { name: String, value: String },
	File(FilePart),
}

/// The body a prepared request will send.
#[derive(Debug, Clone, Default)]
pub enum RequestBodySpec {
	#[default]
	Empty,
	Bytes {
		data: Bytes,
		content_type: String,
	},
	Multipart {
		parts: Vec<Part>,
	},
}

impl RequestBodySpec {
	pub fn is_empty(&self) -> bool {
		matches!(self, RequestBodySpec::Empty)
	}
}

pub fn new_boundary() -> String {
	let mut rng = rand::rng();
	format!("vortex-{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}

fn part_headers(part: &Part, boundary: &str, len: u64) -> String {
	match part {
		Part::Field { name, .. } => format!(
			"--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\nContent-Length: {len}\r\n\r\n"
		),
		Part::File(f) => format!(
			"--{boundary}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\nContent-Length: {len}\r\n\r\n",
			f.name, f.filename, f.content_type
		),
	}
}

async fn part_len(part: &Part) -> Result<u64, ClientError> {
	Ok(match part {
		Part::Field { value, .. } => value.len() as u64,
		Part::File(f) => match &f.source {
			FileSource::Bytes(b) => b.len() as u64,
			FileSource::Path(p) => tokio::fs::metadata(p)
				.await
				.map_err(ClientError::Io)?
				.len(),
		},
	})
}

/// Assemble a streaming multipart/form-data body. Returns the body, its total
/// length, and the Content-Type (with boundary).
pub async fn build_multipart(
	parts: Vec<Part>,
	boundary: String,
) -> Result<(crate::http::Body, u64, String), ClientError> {
	let content_type = format!("multipart/form-data; boundary={boundary}");
	let mut total: u64 = 0;
	let mut lens = Vec::with_capacity(parts.len());
	for part in &parts {
		let len = part_len(part).await?;
		total += part_headers(part, &boundary, len).len() as u64;
		total += len + 2; // trailing CRLF
		lens.push(len);
	}
	let closer = format!("--{boundary}--\r\n");
	total += closer.len() as u64;

	let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(4);
	tokio::spawn(async move {
		for (part, len) in parts.into_iter().zip(lens) {
			let head = part_headers(&part, &boundary, len);
			if tx.send(Ok(Bytes::from(head))).await.is_err() {
				return;
			}
			let sent = match part {
				Part::Field { value, .. } => tx.send(Ok(Bytes::from(value))).await.is_ok(),
				Part::File(f) => match f.source {
					FileSource::Bytes(b) => tx.send(Ok(b)).await.is_ok(),
					FileSource::Path(p) => stream_file(&tx, p).await,
				},
			};
			if !sent || tx.send(Ok(Bytes::from_static(b"\r\n"))).await.is_err() {
				return;
			}
		}
		let _ = tx.send(Ok(Bytes::from(closer))).await;
	});
	let body =
		crate::http::Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
	Ok((body, total, content_type))
}

async fn stream_file(
	tx: &tokio::sync::mpsc::Sender<Result<Bytes, std::io::Error>>,
	path: PathBuf,
) -> bool {
	let mut file = match tokio::fs::File::open(&path).await {
		Ok(f) => f,
		Err(e) => {
			let _ = tx.send(Err(e)).await;
			return false;
		},
	};
	let mut buf = vec![0u8; 64 * 1024];
	loop {
		match file.read(&mut buf).await {
			Ok(0) => return true,
			Ok(n) => {
				if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
					return false;
				}
			},
			Err(e) => {
				let _ = tx.send(Err(e)).await;
				return false;
			},
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct Progress {
	pub bytes_sent: u64,
	pub content_length: Option<u64>,
	pub done: bool,
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub enum ProgressStep {
	Bytes(u64),
	/// Fraction of the content length per callback; falls back to the default
	/// byte step when the length is unknown.
	Rate(f64),
}

impl ProgressStep {
	fn step_bytes(&self, content_length: Option<u64>) -> u64 {
		match (self, content_length) {
			(ProgressStep::Bytes(b), _) => (*b).max(1),
			(ProgressStep::Rate(r), Some(len)) => (((*r) * len as f64) as u64).max(1),
			(ProgressStep::Rate(_), None) => DEFAULT_PROGRESS_STEP,
		}
	}
}

pin_project! {
	/// Counts outgoing data frames and fires the callback every `step` bytes
	/// and once more at end of stream.
	pub struct ProgressBody<B> {
		#[pin]
		body: B,
		callback: ProgressCallback,
		step: u64,
		content_length: Option<u64>,
		sent: u64,
		last_fired: u64,
		finished: bool,
	}
}

impl<B> ProgressBody<B> {
	pub fn new(
		body: B,
		callback: ProgressCallback,
		step: ProgressStep,
		content_length: Option<u64>,
	) -> Self {
		ProgressBody {
			body,
			callback,
			step: step.step_bytes(content_length),
			content_length,
			sent: 0,
			last_fired: 0,
			finished: false,
		}
	}
}

impl<B> http_body::Body for ProgressBody<B>
where
	B: http_body::Body<Data = Bytes>,
{
	type Data = Bytes;
	type Error = B::Error;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
		let this = self.project();
		let frame = ready!(this.body.poll_frame(cx));
		match &frame {
			Some(Ok(f)) => {
				if let Some(data) = f.data_ref() {
					*this.sent += data.len() as u64;
					if *this.sent - *this.last_fired >= *this.step {
						*this.last_fired = *this.sent;
						(this.callback)(Progress {
							bytes_sent: *this.sent,
							content_length: *this.content_length,
							done: false,
						});
					}
				}
			},
			None => {
				if !*this.finished {
					*this.finished = true;
					(this.callback)(Progress {
						bytes_sent: *this.sent,
						content_length: *this.content_length,
						done: true,
					});
				}
			},
			Some(Err(_)) => {},
		}
		Poll::Ready(frame)
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}
