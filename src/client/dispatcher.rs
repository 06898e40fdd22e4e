use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Decides when a call actually runs. Calls wait in `queued` until the global
/// and per-host limits admit them into `running`; completion re-runs the
/// promotion pass. FIFO order is preserved within one host; a host at its
/// limit does not block later entries for other hosts.
#[derive(Clone)]
pub struct Dispatcher {
	inner: Arc<Inner>,
}

struct Inner {
	max_requests: usize,
	max_requests_per_host: usize,
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	queued: VecDeque<Waiting>,
	running: Vec<Entry>,
}

struct Waiting {
	entry: Entry,
	admit: oneshot::Sender<()>,
	token: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
	pub id: u64,
	pub host: String,
}

/// Held while a call runs; dropping it releases the slot and promotes waiters.
pub struct RunPermit {
	dispatcher: Dispatcher,
	id: u64,
}

impl Drop for RunPermit {
	fn drop(&mut self) {
		self.dispatcher.finished(self.id);
	}
}

impl std::fmt::Debug for RunPermit {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RunPermit").field("id", &self.id).finish()
	}
}

impl PartialEq for RunPermit {
	fn eq(&self, other: &Self) -> bool {
		self.id == other.id
	}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("call was canceled while queued")]
pub struct QueueCanceled;

impl Dispatcher {
	pub fn new(max_requests: usize, max_requests_per_host: usize) -> Dispatcher {
		Dispatcher {
			inner: Arc::new(Inner {
				max_requests: max_requests.max(1),
				max_requests_per_host: max_requests_per_host.max(1),
				state: Mutex::new(State::default()),
			}),
		}
	}

	/// Wait until the limits admit this call. Cancellation while queued drops
	/// the queue entry and resolves with `QueueCanceled`.
	pub async fn acquire(
		&self,
		id: u64,
		host: &str,
		token: &CancellationToken,
	) -> Result<RunPermit, QueueCanceled> {
		let (admit, admitted) = oneshot::channel();
		{
			let mut state = self.inner.state.lock();
			state.queued.push_back(Waiting {
				entry: Entry {
					id,
					host: host.to_string(),
				},
				admit,
				token: token.clone(),
			});
		}
		self.promote();

		tokio::select! {
			_ = token.cancelled() => {
				self.remove_queued(id);
				Err(QueueCanceled)
			},
			r = admitted => match r {
				Ok(()) => Ok(RunPermit {
					dispatcher: self.clone(),
					id,
				}),
				Err(_) => Err(QueueCanceled),
			},
		}
	}

	fn finished(&self, id: u64) {
		{
			let mut state = self.inner.state.lock();
			state.running.retain(|e| e.id != id);
		}
		self.promote();
	}

	fn remove_queued(&self, id: u64) {
		let mut state = self.inner.state.lock();
		state.queued.retain(|w| w.entry.id != id);
	}

	fn promote(&self) {
		let mut to_admit: Vec<oneshot::Sender<()>> = Vec::new();
		{
			let mut state = self.inner.state.lock();
			let mut i = 0;
			while i < state.queued.len() {
				if state.running.len() >= self.inner.max_requests {
					break;
				}
				if state.queued[i].token.is_cancelled() {
					state.queued.remove(i);
					continue;
				}
				let host = &state.queued[i].entry.host;
				let host_running = state.running.iter().filter(|e| &e.host == host).count();
				if host_running < self.inner.max_requests_per_host {
					let w = state.queued.remove(i).unwrap();
					state.running.push(w.entry.clone());
					to_admit.push(w.admit);
				} else {
					i += 1;
				}
			}
		}
		for tx in to_admit {
			let _ = tx.send(());
		}
	}

	/// Shallow snapshot of the queue.
	pub fn queued_calls(&self) -> Vec<Entry> {
		self.inner.state.lock().queued.iter().map(|w| w.entry.clone()).collect()
	}

	/// Shallow snapshot of running calls.
	pub fn running_calls(&self) -> Vec<Entry> {
		self.inner.state.lock().running.clone()
	}
}
