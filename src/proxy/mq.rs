use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{error, info};

use super::GatewayError;
use super::context::Context;
use super::write;
use crate::http::{Response, StatusCode};

/// Send-fire-and-forget broker contract. Delivery acknowledgment downstream
/// is a broker concern, not the gateway's.
#[async_trait]
pub trait Broker: Send + Sync {
	async fn send(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;
}

/// Default broker for development: logs each message.
pub struct LogBroker;

#[async_trait]
impl Broker for LogBroker {
	async fn send(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
		info!(topic, bytes = payload.len(), "mq message");
		Ok(())
	}
}

/// The MQ router: one message per request on a bounded worker pool sized at
/// twice the core count. The 200 is returned after enqueue succeeds, without
/// waiting for the broker round-trip.
pub struct MqRouter {
	broker: Arc<dyn Broker>,
	workers: Arc<Semaphore>,
}

impl MqRouter {
	pub fn new(broker: Arc<dyn Broker>) -> MqRouter {
		MqRouter {
			broker,
			workers: Arc::new(Semaphore::new(2 * num_cpus::get())),
		}
	}

	pub async fn route(&self, ctx: &mut Context) -> Result<Response, GatewayError> {
		let asset = ctx.asset.clone();
		let topic = asset.method.clone();

		let payload = match ctx.raw_body.clone() {
			Some(b) => b,
			None => ctx
				.take_body()
				.collect()
				.await
				.map_err(|e| GatewayError::Validation(format!("unreadable body: {e}")))?
				.to_bytes(),
		};

		// The asset timeout bounds only the enqueue, never delivery.
		let enqueue_timeout = Duration::from_millis(asset.timeout.max(1));
		let permit = tokio::time::timeout(
			enqueue_timeout,
			self.workers.clone().acquire_owned(),
		)
		.await
		.map_err(|_| GatewayError::Internal(anyhow::anyhow!("mq worker pool saturated")))?
		.map_err(|_| GatewayError::Internal(anyhow::anyhow!("mq worker pool closed")))?;

		let broker = self.broker.clone();
		let request_id = ctx.request_id.clone();
		tokio::spawn(async move {
			let _permit = permit;
			if let Err(e) = broker.send(&topic, payload).await {
				error!(topic, request_id, "mq send failed: {e}");
			}
		});

		write::json_response(asset.stream, StatusCode::OK, &json!({"status": "forwarded"}))
	}
}
