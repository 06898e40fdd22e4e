use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// One cancelable unit of work, keyed by its owner id for removal.
#[derive(Debug, Clone)]
struct TagTask {
	owner: u64,
	token: CancellationToken,
}

/// Group cancellation by tag. Tags match by substring containment, so
/// hierarchical tags like `user.42.download` cancel under `user.42` or
/// `download`. Iteration takes a snapshot; a cancel racing a completion is a
/// no-op on the completed task.
#[derive(Debug, Default, Clone)]
pub struct TagRegistry {
	tasks: Arc<Mutex<HashMap<String, Vec<TagTask>>>>,
}

impl TagRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add_task(&self, tag: &str, token: CancellationToken, owner: u64) {
		let mut tasks = self.tasks.lock();
		tasks
			.entry(tag.to_string())
			.or_default()
			.push(TagTask { owner, token });
	}

	/// Remove every task registered by `owner`, regardless of tag.
	pub fn remove_task(&self, owner: u64) {
		let mut tasks = self.tasks.lock();
		tasks.retain(|_, list| {
			list.retain(|t| t.owner != owner);
			!list.is_empty()
		});
	}

	/// Cancel every task whose tag contains `tag`. Returns how many tasks were
	/// signaled.
	pub fn cancel(&self, tag: &str) -> usize {
		let snapshot: Vec<TagTask> = {
			let tasks = self.tasks.lock();
			tasks
				.iter()
				.filter(|(k, _)| k.contains(tag))
				.flat_map(|(_, list)| list.iter().cloned())
				.collect()
		};
		for task in &snapshot {
			task.token.cancel();
		}
		snapshot.len()
	}

	pub fn cancel_all(&self) -> usize {
		let snapshot: Vec<TagTask> = {
			let tasks = self.tasks.lock();
			tasks.values().flat_map(|l| l.iter().cloned()).collect()
		};
		for task in &snapshot {
			task.token.cancel();
		}
		snapshot.len()
	}

	pub fn task_count(&self) -> usize {
		self.tasks.lock().values().map(|l| l.len()).sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn substring_cancel() {
		let reg = TagRegistry::new();
		let a = CancellationToken::new();
		let b = CancellationToken::new();
		let c = CancellationToken::new();
		reg.add_task("job-7", a.clone(), 1);
		reg.add_task("job-8", b.clone(), 2);
		reg.add_task("other", c.clone(), 3);

		assert_eq!(reg.cancel("job"), 2);
		assert!(a.is_cancelled());
		assert!(b.is_cancelled());
		assert!(!c.is_cancelled());
	}

	#[test]
	fn remove_by_owner() {
		let reg = TagRegistry::new();
		let a = CancellationToken::new();
		reg.add_task("x", a.clone(), 7);
		assert_eq!(reg.task_count(), 1);
		reg.remove_task(7);
		assert_eq!(reg.task_count(), 0);
		// Cancel after removal signals nothing.
		assert_eq!(reg.cancel("x"), 0);
		assert!(!a.is_cancelled());
	}

	#[test]
	fn cancel_all_and_idempotence() {
		let reg = TagRegistry::new();
		let a = CancellationToken::new();
		reg.add_task("t", a.clone(), 1);
		assert_eq!(reg.cancel_all(), 1);
		assert!(a.is_cancelled());
		// Cancel is a no-op on already-canceled tasks.
		assert_eq!(reg.cancel_all(), 1);
	}
}
