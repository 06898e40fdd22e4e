use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use vortex::client::HttpClient;
use vortex::config::parse_config;
use vortex::http::Body;
use vortex::proxy::Gateway;

type Handler =
	Arc<dyn Fn(::http::request::Parts, Bytes) -> ::http::Response<Full<Bytes>> + Send + Sync>;

/// A local HTTP/1.1 upstream on 127.0.0.1:0 driven by a plain closure.
async fn spawn_upstream(handler: Handler) -> SocketAddr {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		loop {
			let Ok((stream, _)) = listener.accept().await else {
				break;
			};
			let handler = handler.clone();
			tokio::spawn(async move {
				let service = service_fn(move |req: hyper::Request<Incoming>| {
					let handler = handler.clone();
					async move {
						let (parts, body) = req.into_parts();
						let bytes = body.collect().await.unwrap().to_bytes();
						Ok::<_, std::convert::Infallible>(handler(parts, bytes))
					}
				});
				let _ = hyper::server::conn::http1::Builder::new()
					.serve_connection(TokioIo::new(stream), service)
					.await;
			});
		}
	});
	addr
}

fn peer() -> SocketAddr {
	"127.0.0.1:55555".parse().unwrap()
}

fn request(uri: &str) -> ::http::request::Builder {
	::http::Request::builder().uri(uri)
}

#[tokio::test]
async fn simple_get_proxy_buffered() {
	let upstream = spawn_upstream(Arc::new(|parts, _| {
		assert_eq!(parts.uri.path(), "/hello");
		::http::Response::builder()
			.status(200)
			.header("content-type", "text/plain")
			.body(Full::new(Bytes::from_static(b"hi")))
			.unwrap()
	}))
	.await;

	let yaml = format!(
		r#"
assets:
  - method: hello
    kind: rest
    host: 127.0.0.1
    port: {}
    path: /hello
    stream: 1
    timeout: 5000
"#,
		upstream.port()
	);
	let gateway = Gateway::new(parse_config(&yaml).unwrap());
	let resp = gateway
		.handle(request("/api/hello").body(Body::empty()).unwrap(), peer())
		.await;
	assert_eq!(resp.status(), 200);
	assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
	assert_eq!(resp.headers().get("content-length").unwrap(), "2");
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"hi");
}

#[tokio::test]
async fn json_body_passes_through_byte_identical() {
	let upstream = spawn_upstream(Arc::new(|parts, body| {
		let ct = parts.headers.get("content-type").unwrap().to_str().unwrap();
		assert!(ct.starts_with("application/json"));
		::http::Response::builder()
			.status(200)
			.header("content-type", "application/json")
			.body(Full::new(body))
			.unwrap()
	}))
	.await;

	let yaml = format!(
		r#"
assets:
  - method: echo
    kind: rest
    host: 127.0.0.1
    port: {}
    path: /echo
    stream: 1
"#,
		upstream.port()
	);
	let gateway = Gateway::new(parse_config(&yaml).unwrap());
	let payload = r#"{"nested":{"a":[1,2,3]},"s":"é"}"#.as_bytes();
	let resp = gateway
		.handle(
			request("/api/echo")
				.method("POST")
				.header("content-type", "application/json")
				.body(Body::from(&payload[..]))
				.unwrap(),
			peer(),
		)
		.await;
	assert_eq!(resp.status(), 200);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], payload);
}

#[tokio::test]
async fn multipart_upload_reconstructs_parts() {
	let upstream = spawn_upstream(Arc::new(|parts, body| {
		let ct = parts.headers.get("content-type").unwrap().to_str().unwrap();
		assert!(ct.starts_with("multipart/form-data; boundary="));
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.contains("Content-Disposition: form-data; name=\"x\""));
		assert!(
			text.contains("Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"")
		);
		assert!(text.contains("Content-Type: text/plain\r\nContent-Length: 2\r\n\r\nAB\r\n"));
		// The ingress route capture does not become a part.
		assert!(!text.contains("name=\"name\""));
		::http::Response::builder()
			.status(200)
			.body(Full::new(Bytes::from_static(b"ok")))
			.unwrap()
	}))
	.await;

	let yaml = format!(
		r#"
assets:
  - method: upload
    kind: rest
    host: 127.0.0.1
    port: {}
    path: /u
    stream: 1
"#,
		upstream.port()
	);
	let gateway = Gateway::new(parse_config(&yaml).unwrap());

	let ingress_body = "--B\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\n1\r\n--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nAB\r\n--B--\r\n";
	let resp = gateway
		.handle(
			request("/api/upload")
				.method("POST")
				.header("content-type", "multipart/form-data; boundary=B")
				.body(Body::from(ingress_body))
				.unwrap(),
			peer(),
		)
		.await;
	assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn llm_chunked_streaming() {
	let upstream = spawn_upstream(Arc::new(|parts, body| {
		// The gateway must authenticate with the provider key from metadata,
		// not the caller's project key.
		assert_eq!(
			parts.headers.get("authorization").unwrap(),
			"Bearer sk-upstream"
		);
		let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(v["stream"], true);
		::http::Response::builder()
			.status(200)
			.header("content-type", "text/event-stream")
			.body(Full::new(Bytes::from_static(
				b"data: {\"delta\":\"hel\"}\n\ndata: {\"delta\":\"lo\"}\n\ndata: [DONE]\n\n",
			)))
			.unwrap()
	}))
	.await;

	let yaml = format!(
		r#"
assets:
  - method: llm
    kind: llm
    stream: 2
    timeout: 5000
    metadata:
      openaiApiKey: sk-upstream
      openaiHost: http://127.0.0.1:{}
"#,
		upstream.port()
	);
	let gateway = Gateway::new(parse_config(&yaml).unwrap());
	let resp = gateway
		.handle(
			request("/router/llm/gpt-4o")
				.method("POST")
				.header("x-api-key", "proj_xyz")
				.header("content-type", "application/json")
				.body(Body::from(r#"{"messages":[],"stream":true}"#))
				.unwrap(),
			peer(),
		)
		.await;
	assert_eq!(resp.status(), 200);
	// Chunked mode: no Content-Length on the egress.
	assert!(resp.headers().get("content-length").is_none());
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	let text = std::str::from_utf8(&body).unwrap();
	assert!(text.contains(r#"{"delta":"hel"}"#));
	assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn cache_hit_with_conditional_revalidation() {
	let hits = Arc::new(AtomicUsize::new(0));
	let hits2 = hits.clone();
	let upstream = spawn_upstream(Arc::new(move |parts, _| {
		let n = hits2.fetch_add(1, Ordering::SeqCst);
		if n == 0 {
			assert!(parts.headers.get("if-none-match").is_none());
			::http::Response::builder()
				.status(200)
				.header("content-type", "text/plain")
				.header("etag", "\"abc\"")
				.header("cache-control", "max-age=0")
				.body(Full::new(Bytes::from_static(b"cached-payload")))
				.unwrap()
		} else {
			assert_eq!(parts.headers.get("if-none-match").unwrap(), "\"abc\"");
			::http::Response::builder()
				.status(304)
				.header("etag", "\"abc\"")
				.body(Full::new(Bytes::new()))
				.unwrap()
		}
	}))
	.await;

	let dir = tempfile::tempdir().unwrap();
	let client = HttpClient::builder()
		.cache(dir.path().to_path_buf(), 1 << 20)
		.build();
	let url = format!("http://127.0.0.1:{}/data", upstream.port());

	// First request populates the cache.
	let call = client.get(&url).new_call().unwrap();
	let resp = call.execute().await.unwrap();
	assert_eq!(resp.status(), 200);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"cached-payload");
	// The write-through commit races the body read completing; give it a beat.
	tokio::time::sleep(Duration::from_millis(100)).await;

	// Second request revalidates and serves the stored body.
	let call = client.get(&url).new_call().unwrap();
	let resp = call.execute().await.unwrap();
	assert_eq!(resp.status(), 200);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"cached-payload");

	assert_eq!(hits.load(Ordering::SeqCst), 2);
	let stats = client.cache().unwrap().stats.snapshot();
	assert_eq!(stats.request_count, 2);
	assert_eq!(stats.network_count, 2);
	assert_eq!(stats.hit_count, 1);
	assert_eq!(stats.write_success_count, 1);
}

#[tokio::test]
async fn tag_cancel_covers_queued_and_running_calls() {
	// An upstream that accepts connections and never answers.
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let port = listener.local_addr().unwrap().port();
	tokio::spawn(async move {
		let mut held = Vec::new();
		while let Ok((stream, _)) = listener.accept().await {
			held.push(stream);
		}
	});

	let client = HttpClient::builder()
		.max_requests(2)
		.max_requests_per_host(2)
		.build();
	let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
	for _ in 0..4 {
		let call = client
			.get(&format!("http://127.0.0.1:{port}/slow"))
			.tag("job-7")
			.nothrow()
			.new_call()
			.unwrap();
		let tx = tx.clone();
		call.enqueue(move |result| {
			let _ = tx.send(result.map(|_| ()));
		});
	}

	// Let two calls start and two queue up.
	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(client.running_calls().len(), 2);
	assert_eq!(client.queued_calls().len(), 2);

	// Substring cancel: "job" matches "job-7".
	let canceled = client.cancel_tag("job");
	assert_eq!(canceled, 4);

	let mut outcomes = Vec::new();
	for _ in 0..4 {
		let r = tokio::time::timeout(Duration::from_secs(5), rx.recv())
			.await
			.expect("callback fired")
			.expect("channel open");
		outcomes.push(r);
	}
	for r in &outcomes {
		let err = r.as_ref().expect_err("no response may be produced");
		assert!(err.is_canceled(), "expected cancellation, got {err}");
	}
	assert_eq!(client.running_calls().len(), 0);
	assert_eq!(client.queued_calls().len(), 0);
}

#[tokio::test]
async fn rest_url_template_substitutes_params() {
	let upstream = spawn_upstream(Arc::new(|parts, _| {
		assert_eq!(parts.uri.path(), "/u/42");
		// The substituted parameter stays out of the query string.
		assert_eq!(parts.uri.query(), None);
		::http::Response::builder()
			.status(200)
			.body(Full::new(Bytes::from_static(b"ok")))
			.unwrap()
	}))
	.await;

	let yaml = format!(
		r#"
assets:
  - method: thing
    kind: rest
    host: 127.0.0.1
    port: {}
    url: /u/{{id}}
    stream: 1
"#,
		upstream.port()
	);
	let gateway = Gateway::new(parse_config(&yaml).unwrap());
	let resp = gateway
		.handle(
			request("/api/thing?id=42").body(Body::empty()).unwrap(),
			peer(),
		)
		.await;
	assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn upload_progress_fires() {
	use std::sync::atomic::AtomicU64;

	use vortex::client::{Progress, ProgressStep};

	let upstream = spawn_upstream(Arc::new(|_, body| {
		::http::Response::builder()
			.status(200)
			.body(Full::new(Bytes::from(body.len().to_string())))
			.unwrap()
	}))
	.await;

	let client = HttpClient::builder().build();
	let sent = Arc::new(AtomicU64::new(0));
	let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
	let sent2 = sent.clone();
	let done2 = done.clone();
	let callback = Arc::new(move |p: Progress| {
		sent2.store(p.bytes_sent, Ordering::SeqCst);
		if p.done {
			done2.store(true, Ordering::SeqCst);
		}
	});

	let payload = vec![b'a'; 64 * 1024];
	let call = client
		.request(
			::http::Method::POST,
			&format!("http://127.0.0.1:{}/upload", upstream.port()),
		)
		.set_body_para(vortex::client::BodyPara::Bytes(Bytes::from(payload)))
		.set_on_process(callback, ProgressStep::Bytes(8 * 1024))
		.new_call()
		.unwrap();
	let resp = call.execute().await.unwrap();
	assert_eq!(resp.status(), 200);
	let echoed = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&echoed[..], b"65536");
	assert!(done.load(Ordering::SeqCst));
	assert_eq!(sent.load(Ordering::SeqCst), 64 * 1024);
}

#[tokio::test]
async fn redirects_are_followed_under_one_call() {
	let upstream = spawn_upstream(Arc::new(|parts, _| {
		match parts.uri.path() {
			"/old" => ::http::Response::builder()
				.status(302)
				.header("location", "/new")
				.body(Full::new(Bytes::new()))
				.unwrap(),
			"/new" => ::http::Response::builder()
				.status(200)
				.body(Full::new(Bytes::from_static(b"moved")))
				.unwrap(),
			other => panic!("unexpected path {other}"),
		}
	}))
	.await;

	let client = HttpClient::builder().build();
	let resp = client
		.get(&format!("http://127.0.0.1:{}/old", upstream.port()))
		.new_call()
		.unwrap()
		.execute()
		.await
		.unwrap();
	assert_eq!(resp.status(), 200);
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"moved");
}

#[tokio::test]
async fn serial_interceptors_rewrite_requests_unless_skipped() {
	use async_trait::async_trait;
	use vortex::client::{PreparedRequest, RequestInterceptor};

	struct Stamp;
	#[async_trait]
	impl RequestInterceptor for Stamp {
		fn name(&self) -> &'static str {
			"stamp"
		}
		async fn intercept(
			&self,
			request: &mut PreparedRequest,
		) -> Result<(), vortex::client::ClientError> {
			request
				.headers
				.insert("x-stamped", ::http::HeaderValue::from_static("yes"));
			Ok(())
		}
	}

	let upstream = spawn_upstream(Arc::new(|parts, _| {
		let stamped = parts.headers.contains_key("x-stamped");
		::http::Response::builder()
			.status(200)
			.body(Full::new(Bytes::from(if stamped { "stamped" } else { "plain" })))
			.unwrap()
	}))
	.await;

	let client = HttpClient::builder()
		.serial_interceptor(Arc::new(Stamp))
		.build();
	let url = format!("http://127.0.0.1:{}/x", upstream.port());

	let resp = client.get(&url).new_call().unwrap().execute().await.unwrap();
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"stamped");

	let resp = client
		.get(&url)
		.skip_serial_preproc()
		.new_call()
		.unwrap()
		.execute()
		.await
		.unwrap();
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	assert_eq!(&body[..], b"plain");
}

#[tokio::test]
async fn websocket_bridge_echoes_frames() {
	use futures_util::{SinkExt, StreamExt};
	use tokio_tungstenite::tungstenite::Message;

	// Upstream: a websocket echo server.
	let upstream = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let up_port = upstream.local_addr().unwrap().port();
	tokio::spawn(async move {
		while let Ok((stream, _)) = upstream.accept().await {
			tokio::spawn(async move {
				let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
				while let Some(Ok(msg)) = ws.next().await {
					match msg {
						Message::Text(_) | Message::Binary(_) => {
							if ws.send(msg).await.is_err() {
								break;
							}
						},
						Message::Close(_) => break,
						_ => {},
					}
				}
			});
		}
	});

	// Gateway on an ephemeral port.
	let gw_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let gw_port = gw_listener.local_addr().unwrap().port();
	let yaml = format!(
		r#"
assets:
  - method: echo
    kind: ws
    host: 127.0.0.1
    port: {up_port}
    path: /sock
    stream: 2
"#
	);
	let gateway = Gateway::new(parse_config(&yaml).unwrap());
	let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
	let g = gateway.clone();
	tokio::spawn(async move {
		let _ = g
			.serve_listener(gw_listener, async {
				let _ = stop_rx.await;
			})
			.await;
	});

	let (mut ws, _) =
		tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{gw_port}/router/ws/echo"))
			.await
			.expect("upgrade through the gateway");
	ws.send(Message::Text("ping across the bridge".into()))
		.await
		.unwrap();
	let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
		.await
		.expect("echo arrives")
		.unwrap()
		.unwrap();
	assert_eq!(
		echoed,
		Message::Text("ping across the bridge".into())
	);
	ws.send(Message::Binary(Bytes::from_static(&[1, 2, 3]).into()))
		.await
		.unwrap();
	let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
		.await
		.expect("echo arrives")
		.unwrap()
		.unwrap();
	assert!(matches!(echoed, Message::Binary(b) if &b[..] == [1, 2, 3]));
	ws.close(None).await.unwrap();
	let _ = stop_tx.send(());
}

#[tokio::test]
async fn mq_route_forwards_and_answers_immediately() {
	let yaml = r#"
assets:
  - method: orders.created
    kind: mq
    stream: 1
"#;
	let gateway = Gateway::new(parse_config(yaml).unwrap());
	let started = std::time::Instant::now();
	let resp = gateway
		.handle(
			request("/router/mq/orders.created")
				.method("POST")
				.body(Body::from(r#"{"id":1}"#))
				.unwrap(),
			peer(),
		)
		.await;
	assert_eq!(resp.status(), 200);
	assert!(started.elapsed() < Duration::from_millis(500));
	let body = resp.into_body().collect().await.unwrap().to_bytes();
	let v: serde_json::Value = serde_json::from_slice(&body).unwrap();
	assert_eq!(v["status"], "forwarded");
}
