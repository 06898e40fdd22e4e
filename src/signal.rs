use tokio_util::sync::CancellationToken;

/// Resolves on SIGINT/SIGTERM or an explicit trigger. A second interrupt
/// while draining exits the process immediately.
pub struct Shutdown {
	token: CancellationToken,
}

impl Shutdown {
	pub fn new() -> Self {
		Shutdown {
			token: CancellationToken::new(),
		}
	}

	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger(self.token.clone())
	}

	pub async fn wait(self) {
		imp::wait(self.token).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger(CancellationToken);

impl ShutdownTrigger {
	pub fn shutdown_now(&self) {
		self.0.cancel();
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tokio_util::sync::CancellationToken;
	use tracing::info;

	pub(super) async fn wait(token: CancellationToken) {
		let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler registers");
		let mut terminate = signal(SignalKind::terminate()).expect("signal handler registers");
		tokio::select! {
			_ = interrupt.recv() => {
				info!("received SIGINT, starting shutdown");
				tokio::spawn(async move {
					interrupt.recv().await;
					info!("second SIGINT, exiting immediately");
					std::process::exit(0);
				});
			},
			_ = terminate.recv() => info!("received SIGTERM, starting shutdown"),
			_ = token.cancelled() => info!("received explicit shutdown signal"),
		}
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio_util::sync::CancellationToken;
	use tracing::info;

	pub(super) async fn wait(token: CancellationToken) {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => info!("received interrupt, starting shutdown"),
			_ = token.cancelled() => info!("received explicit shutdown signal"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn explicit_trigger_completes_wait() {
		let shutdown = Shutdown::new();
		let trigger = shutdown.trigger();
		let waiter = tokio::spawn(shutdown.wait());
		trigger.shutdown_now();
		tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
			.await
			.expect("wait resolves")
			.unwrap();
	}
}
