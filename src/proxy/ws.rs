use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tracing::{debug, warn};

use super::error_response;
use crate::http::{
	Body, HeaderValue, Request, Response, StatusCode, header,
};
use crate::types::asset::Asset;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Frames (and whole messages) up to 64 MiB pass both legs of the bridge.
const MAX_FRAME_BYTES: usize = 64 << 20;

fn ws_config() -> WebSocketConfig {
	WebSocketConfig::default()
		.max_message_size(Some(MAX_FRAME_BYTES))
		.max_frame_size(Some(MAX_FRAME_BYTES))
}

/// RFC 6455 accept token for an upgrade key.
fn accept_key(key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(key.as_bytes());
	hasher.update(WS_GUID.as_bytes());
	BASE64.encode(hasher.finalize())
}

fn header_contains(headers: &crate::http::HeaderMap, name: header::HeaderName, needle: &str) -> bool {
	headers
		.get(name)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains(needle))
		.unwrap_or(false)
}

/// A valid upgrade has `Upgrade: websocket`, `Connection: upgrade` and a
/// `Sec-WebSocket-Key`.
pub fn is_upgrade(req: &Request) -> bool {
	header_contains(req.headers(), header::UPGRADE, "websocket")
		&& header_contains(req.headers(), header::CONNECTION, "upgrade")
		&& req.headers().contains_key(header::SEC_WEBSOCKET_KEY)
}

/// Upgrade the client connection and bridge it to the asset's upstream
/// WebSocket. Frames are forwarded verbatim per direction; ping/pong are
/// terminated locally; a close frame is forwarded and shuts both directions.
pub fn route(mut req: Request, asset: Arc<Asset>, request_id: String) -> Response {
	if !is_upgrade(&req) {
		return error_response(
			StatusCode::BAD_REQUEST,
			"validation",
			"websocket upgrade required (Upgrade/Connection/Sec-WebSocket-Key)",
			&request_id,
		);
	}
	let key = req
		.headers()
		.get(header::SEC_WEBSOCKET_KEY)
		.and_then(|v| v.to_str().ok())
		.unwrap_or_default();
	let accept = accept_key(key);

	let upgrade = hyper::upgrade::on(&mut req);
	tokio::spawn(async move {
		let upgraded = match upgrade.await {
			Ok(u) => u,
			Err(e) => {
				warn!(request_id, "client upgrade failed: {e}");
				return;
			},
		};
		let client = WebSocketStream::from_raw_socket(
			TokioIo::new(upgraded),
			Role::Server,
			Some(ws_config()),
		)
		.await;

		let scheme = if asset.metadata_get("https") == Some("true") {
			"wss"
		} else {
			"ws"
		};
		let mut target = format!("{scheme}://{}", asset.host);
		if asset.port != 0 {
			target.push_str(&format!(":{}", asset.port));
		}
		if !asset.path.starts_with('/') {
			target.push('/');
		}
		target.push_str(&asset.path);

		let upstream = match tokio_tungstenite::connect_async_with_config(
			target.as_str(),
			Some(ws_config()),
			true,
		)
		.await
		{
			Ok((ws, _)) => ws,
			Err(e) => {
				warn!(request_id, target, "upstream websocket connect failed: {e}");
				let mut client = client;
				let _ = client.close(None).await;
				return;
			},
		};
		debug!(request_id, target, "websocket bridge established");
		bridge(client, upstream).await;
		debug!(request_id, "websocket bridge closed");
	});

	::http::Response::builder()
		.status(StatusCode::SWITCHING_PROTOCOLS)
		.header(header::UPGRADE, "websocket")
		.header(header::CONNECTION, "Upgrade")
		.header(
			header::SEC_WEBSOCKET_ACCEPT,
			HeaderValue::try_from(accept).expect("base64 is a valid header value"),
		)
		.body(Body::empty())
		.expect("static upgrade response builds")
}

/// Forward each direction independently until either side closes.
async fn bridge<C, U>(client: WebSocketStream<C>, upstream: WebSocketStream<U>)
where
	C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
	U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
	let (client_sink, client_stream) = client.split();
	let (upstream_sink, upstream_stream) = upstream.split();

	let c2u = tokio::spawn(forward(client_stream, upstream_sink, "client→upstream"));
	let u2c = tokio::spawn(forward(upstream_stream, client_sink, "upstream→client"));
	let _ = tokio::join!(c2u, u2c);
}

async fn forward<S, K>(mut from: S, mut to: K, direction: &'static str)
where
	S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
	K: futures_util::Sink<Message> + Unpin,
	K::Error: std::fmt::Display,
{
	while let Some(msg) = from.next().await {
		let msg = match msg {
			Ok(m) => m,
			Err(e) => {
				debug!(direction, "websocket read ended: {e}");
				break;
			},
		};
		match msg {
			// Ping/pong stay local to each hop; the protocol layer answers
			// pings on flush.
			Message::Ping(_) | Message::Pong(_) => continue,
			Message::Close(frame) => {
				let _ = to.send(Message::Close(frame)).await;
				break;
			},
			m @ (Message::Text(_) | Message::Binary(_)) => {
				if let Err(e) = to.send(m).await {
					debug!(direction, "websocket write failed: {e}");
					break;
				}
			},
			Message::Frame(_) => continue,
		}
	}
	let _ = to.close().await;
}
