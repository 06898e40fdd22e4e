use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use http_body::{Body, SizeHint};
use pin_project_lite::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

/// An absolute deadline applied to a response body, so headers and every
/// subsequent frame are bounded by the same instant.
pub enum BodyTimeout {
	Deadline(Instant),
	None,
}

impl BodyTimeout {
	pub fn after(d: std::time::Duration) -> Self {
		BodyTimeout::Deadline(Instant::now() + d)
	}

	pub fn apply(self, r: crate::http::Response) -> crate::http::Response {
		match self {
			BodyTimeout::None => r,
			deadline => r.map(|b| crate::http::Body::new(TimeoutBody::new(deadline, b))),
		}
	}
}

pin_project! {
	/// Fails the body with [`DeadlineExceeded`] once the deadline passes.
	pub struct TimeoutBody<B> {
		timeout: BodyTimeout,
		#[pin]
		sleep: Option<Sleep>,
		#[pin]
		body: B,
	}
}

impl<B> TimeoutBody<B> {
	pub fn new(timeout: BodyTimeout, body: B) -> Self {
		TimeoutBody {
			timeout,
			sleep: None,
			body,
		}
	}
}

impl<B> Body for TimeoutBody<B>
where
	B: Body,
	B::Error: Into<axum_core::BoxError>,
{
	type Data = B::Data;
	type Error = Box<dyn std::error::Error + Send + Sync>;

	fn poll_frame(
		self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
		let mut this = self.project();

		if let BodyTimeout::Deadline(deadline) = this.timeout {
			// Arm the timer on the first poll, then keep it registered.
			if this.sleep.is_none() {
				this.sleep.set(Some(sleep_until(*deadline)));
			}
			let armed = this
				.sleep
				.as_mut()
				.as_pin_mut()
				.expect("timer armed above");
			if armed.poll(cx).is_ready() {
				return Poll::Ready(Some(Err(Box::new(DeadlineExceeded))));
			}
		}

		let frame = ready!(this.body.poll_frame(cx));
		Poll::Ready(frame.transpose().map_err(Into::into).transpose())
	}

	fn is_end_stream(&self) -> bool {
		self.body.is_end_stream()
	}

	fn size_hint(&self) -> SizeHint {
		self.body.size_hint()
	}
}

#[derive(Debug)]
pub struct DeadlineExceeded;

impl std::error::Error for DeadlineExceeded {}

impl std::fmt::Display for DeadlineExceeded {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "body was not received within the deadline")
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use http_body_util::BodyExt;

	use super::*;

	#[tokio::test(start_paused = true)]
	async fn body_times_out_mid_stream() {
		let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(4);
		let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
		let body = crate::http::Body::from_stream(stream);
		let timed = TimeoutBody::new(BodyTimeout::after(Duration::from_millis(100)), body);
		tx.send(Ok(bytes::Bytes::from_static(b"first"))).await.unwrap();
		let mut timed = std::pin::pin!(timed);
		let first = timed.as_mut().frame().await.unwrap().unwrap();
		assert_eq!(
			first.into_data().unwrap(),
			bytes::Bytes::from_static(b"first")
		);
		// No further data arrives; the deadline fires. Keep the sender alive so
		// the stream does not simply end.
		tokio::time::advance(Duration::from_millis(150)).await;
		let next = timed.frame().await.unwrap();
		assert!(next.is_err());
		drop(tx);
	}

	#[tokio::test]
	async fn no_deadline_passes_through() {
		let body = crate::http::Body::from("whole");
		let timed = TimeoutBody::new(BodyTimeout::None, body);
		let all = BodyExt::collect(timed).await.unwrap().to_bytes();
		assert_eq!(&all[..], b"whole");
	}
}
