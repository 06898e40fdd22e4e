use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::CacheError;

pub const MAGIC: &str = "libcore.io.DiskLruCache";
pub const VERSION: &str = "1";
pub const VALUE_COUNT: usize = 2;

const CLEAN: &str = "CLEAN";
const DIRTY: &str = "DIRTY";
const REMOVE: &str = "REMOVE";
const READ: &str = "READ";

const JOURNAL: &str = "journal";
const JOURNAL_TMP: &str = "journal.tmp";
const LOCK: &str = "lock";

/// Compaction threshold: the journal is rewritten once it holds this many
/// redundant records and at least as many records as live entries.
const REDUNDANT_OP_COMPACT_THRESHOLD: u64 = 2000;

#[derive(Debug)]
struct Entry {
	key: String,
	lengths: [u64; VALUE_COUNT],
	/// A readable entry has committed files on disk.
	readable: bool,
	/// At most one editor per key at a time.
	editing: bool,
}

impl Entry {
	fn new(key: &str) -> Entry {
		Entry {
			key: key.to_string(),
			lengths: [0; VALUE_COUNT],
			readable: false,
			editing: false,
		}
	}

	fn size(&self) -> u64 {
		self.lengths.iter().sum()
	}
}

/// A content-addressed, journal-backed LRU cache: one subdirectory per entry,
/// slot 0 for metadata and slot 1 for the body. The journal replays to the
/// exact in-memory LRU order; total committed bytes never exceed `max_size`.
pub struct DiskLruCache {
	directory: PathBuf,
	app_version: u32,
	max_size: u64,
	size: u64,
	journal: Option<File>,
	entries: HashMap<String, Entry>,
	/// LRU order, least-recent first.
	order: Vec<String>,
	redundant_op_count: u64,
	_lock: File,
}

/// Frozen read view of one entry. The files are opened at snapshot time, so a
/// concurrent edit or eviction does not disturb reads in flight.
pub struct Snapshot {
	pub key: String,
	pub files: [File; VALUE_COUNT],
	pub lengths: [u64; VALUE_COUNT],
}

/// Exclusive writer for one entry. Values are staged in `.tmp` files and only
/// become visible on `commit`.
pub struct Editor {
	key: String,
	entry_dir: PathBuf,
	written: [bool; VALUE_COUNT],
}

impl Editor {
	/// Open the staging file for a slot.
	pub fn new_sink(&mut self, slot: usize) -> Result<File, CacheError> {
		assert!(slot < VALUE_COUNT);
		fs::create_dir_all(&self.entry_dir)?;
		let file = File::create(self.tmp_path(slot))?;
		self.written[slot] = true;
		Ok(file)
	}

	fn tmp_path(&self, slot: usize) -> PathBuf {
		self.entry_dir.join(format!("{}.{slot}.tmp", self.key))
	}

	fn clean_path(&self, slot: usize) -> PathBuf {
		self.entry_dir.join(format!("{}.{slot}", self.key))
	}
}

impl DiskLruCache {
	pub fn open(directory: &Path, app_version: u32, max_size: u64) -> Result<DiskLruCache, CacheError> {
		fs::create_dir_all(directory)?;
		let lock_path = directory.join(LOCK);
		if lock_path.exists() {
			warn!(dir = %directory.display(), "stale cache lock file, taking over");
		}
		let mut lock = File::create(&lock_path)?;
		writeln!(lock, "{}", std::process::id())?;

		let mut cache = DiskLruCache {
			directory: directory.to_path_buf(),
			app_version,
			max_size,
			size: 0,
			journal: None,
			entries: HashMap::new(),
			order: Vec::new(),
			redundant_op_count: 0,
			_lock: lock,
		};

		let journal_path = directory.join(JOURNAL);
		if journal_path.exists() {
			match cache.read_journal(&journal_path) {
				Ok(()) => {
					cache.process_dirty_leftovers()?;
					cache.journal = Some(
						OpenOptions::new()
							.append(true)
							.open(&journal_path)?,
					);
					return Ok(cache);
				},
				Err(e) => {
					warn!("cache journal unreadable, rebuilding: {e}");
					cache.entries.clear();
					cache.order.clear();
					cache.size = 0;
				},
			}
		}
		cache.recover_from_directory()?;
		cache.rewrite_journal()?;
		Ok(cache)
	}

	fn read_journal(&mut self, path: &Path) -> Result<(), CacheError> {
		let mut reader = BufReader::new(File::open(path)?);
		let mut line = String::new();
		let mut read_line = |reader: &mut BufReader<File>| -> Result<String, CacheError> {
			line.clear();
			if reader.read_line(&mut line)? == 0 {
				return Err(CacheError::Corrupt("unexpected end of journal header"));
			}
			Ok(line.trim_end_matches('\n').to_string())
		};
		if read_line(&mut reader)? != MAGIC {
			return Err(CacheError::Corrupt("bad magic"));
		}
		if read_line(&mut reader)? != VERSION {
			return Err(CacheError::Corrupt("bad version"));
		}
		if read_line(&mut reader)? != self.app_version.to_string() {
			return Err(CacheError::Corrupt("app version changed"));
		}
		if read_line(&mut reader)? != VALUE_COUNT.to_string() {
			return Err(CacheError::Corrupt("bad value count"));
		}
		if !read_line(&mut reader)?.is_empty() {
			return Err(CacheError::Corrupt("missing blank header line"));
		}

		let mut op_count: u64 = 0;
		for line in reader.lines() {
			let line = line?;
			if line.is_empty() {
				continue;
			}
			op_count += 1;
			self.apply_journal_line(&line)?;
		}
		self.redundant_op_count = op_count.saturating_sub(self.entries.len() as u64);
		Ok(())
	}

	fn apply_journal_line(&mut self, line: &str) -> Result<(), CacheError> {
		let mut parts = line.split(' ');
		let op = parts.next().ok_or(CacheError::Corrupt("empty record"))?;
		let key = parts
			.next()
			.ok_or(CacheError::Corrupt("record missing key"))?
			.to_string();
		match op {
			CLEAN => {
				let mut lengths = [0u64; VALUE_COUNT];
				for len in lengths.iter_mut() {
					*len = parts
						.next()
						.and_then(|s| s.parse().ok())
						.ok_or(CacheError::Corrupt("bad CLEAN lengths"))?;
				}
				let entry = self
					.entries
					.entry(key.clone())
					.or_insert_with(|| Entry::new(&key));
				self.size = self.size - entry.size() + lengths.iter().sum::<u64>();
				entry.lengths = lengths;
				entry.readable = true;
				entry.editing = false;
				self.touch(&key);
			},
			DIRTY => {
				let entry = self
					.entries
					.entry(key.clone())
					.or_insert_with(|| Entry::new(&key));
				entry.editing = true;
			},
			REMOVE => {
				if let Some(entry) = self.entries.remove(&key) {
					self.size -= entry.size();
				}
				self.order.retain(|k| k != &key);
			},
			READ => {
				self.touch(&key);
			},
			_ => return Err(CacheError::Corrupt("unknown journal op")),
		}
		Ok(())
	}

	/// DIRTY entries with no matching CLEAN are edits that never committed.
	fn process_dirty_leftovers(&mut self) -> Result<(), CacheError> {
		let stale: Vec<String> = self
			.entries
			.values()
			.filter(|e| e.editing && !e.readable)
			.map(|e| e.key.clone())
			.collect();
		for key in stale {
			self.delete_entry_files(&key)?;
			self.entries.remove(&key);
			self.order.retain(|k| k != &key);
		}
		for entry in self.entries.values_mut() {
			entry.editing = false;
		}
		// Drop stray tmp files of committed entries too.
		Ok(())
	}

	/// Rebuild in-memory state by scanning entry directories.
	fn recover_from_directory(&mut self) -> Result<(), CacheError> {
		for dir in fs::read_dir(&self.directory)? {
			let dir = dir?;
			if !dir.file_type()?.is_dir() {
				continue;
			}
			let key = dir.file_name().to_string_lossy().to_string();
			let mut lengths = [0u64; VALUE_COUNT];
			let mut complete = true;
			for (slot, len) in lengths.iter_mut().enumerate() {
				match fs::metadata(dir.path().join(format!("{key}.{slot}"))) {
					Ok(m) => *len = m.len(),
					Err(_) => {
						complete = false;
						break;
					},
				}
			}
			if complete {
				let mut entry = Entry::new(&key);
				entry.lengths = lengths;
				entry.readable = true;
				self.size += entry.size();
				self.entries.insert(key.clone(), entry);
				self.order.push(key);
			} else {
				fs::remove_dir_all(dir.path()).ok();
			}
		}
		Ok(())
	}

	fn touch(&mut self, key: &str) {
		self.order.retain(|k| k != key);
		self.order.push(key.to_string());
	}

	fn journal_line(&mut self, line: String) -> Result<(), CacheError> {
		if let Some(journal) = self.journal.as_mut() {
			writeln!(journal, "{line}")?;
		}
		Ok(())
	}

	fn entry_dir(&self, key: &str) -> PathBuf {
		self.directory.join(key)
	}

	fn slot_path(&self, key: &str, slot: usize) -> PathBuf {
		self.entry_dir(key).join(format!("{key}.{slot}"))
	}

	/// Open a frozen view of a committed entry, promoting it to most-recent.
	pub fn get(&mut self, key: &str) -> Result<Option<Snapshot>, CacheError> {
		let Some(entry) = self.entries.get(key) else {
			return Ok(None);
		};
		if !entry.readable {
			return Ok(None);
		}
		let lengths = entry.lengths;
		let f0 = File::open(self.slot_path(key, 0));
		let f1 = File::open(self.slot_path(key, 1));
		let (f0, f1) = match (f0, f1) {
			(Ok(a), Ok(b)) => (a, b),
			// Files vanished underneath us; drop the entry.
			_ => {
				self.remove(key)?;
				return Ok(None);
			},
		};
		self.touch(key);
		self.redundant_op_count += 1;
		self.journal_line(format!("{READ} {key}"))?;
		self.compact_if_needed()?;
		Ok(Some(Snapshot {
			key: key.to_string(),
			files: [f0, f1],
			lengths,
		}))
	}

	/// Begin an edit; `None` while another editor is open for the key.
	pub fn edit(&mut self, key: &str) -> Result<Option<Editor>, CacheError> {
		let entry = self
			.entries
			.entry(key.to_string())
			.or_insert_with(|| Entry::new(key));
		if entry.editing {
			return Ok(None);
		}
		entry.editing = true;
		self.journal_line(format!("{DIRTY} {key}"))?;
		Ok(Some(Editor {
			key: key.to_string(),
			entry_dir: self.entry_dir(key),
			written: [false; VALUE_COUNT],
		}))
	}

	/// Promote staged slots to committed files. Slots the editor did not write
	/// keep their previous contents (metadata-only rewrites).
	pub fn commit(&mut self, editor: Editor) -> Result<(), CacheError> {
		let key = editor.key.clone();
		let was_readable = self
			.entries
			.get(&key)
			.map(|e| e.readable)
			.unwrap_or(false);

		let mut lengths = [0u64; VALUE_COUNT];
		for slot in 0..VALUE_COUNT {
			let clean = editor.clean_path(slot);
			if editor.written[slot] {
				let tmp = editor.tmp_path(slot);
				fs::rename(&tmp, &clean)?;
			} else if !was_readable {
				return Err(CacheError::Corrupt("commit with unwritten slot"));
			}
			lengths[slot] = fs::metadata(&clean)?.len();
		}

		let entry = self
			.entries
			.entry(key.clone())
			.or_insert_with(|| Entry::new(&key));
		self.size = self.size - entry.size() + lengths.iter().sum::<u64>();
		entry.lengths = lengths;
		entry.readable = true;
		entry.editing = false;
		self.touch(&key);
		if was_readable {
			self.redundant_op_count += 1;
		}
		self.journal_line(format!(
			"{CLEAN} {key} {} {}",
			lengths[0], lengths[1]
		))?;
		self.trim_to_size()?;
		self.compact_if_needed()?;
		Ok(())
	}

	/// Discard staged slots. An entry that was never readable is removed.
	pub fn abort(&mut self, editor: Editor) -> Result<(), CacheError> {
		let key = editor.key.clone();
		for slot in 0..VALUE_COUNT {
			fs::remove_file(editor.tmp_path(slot)).ok();
		}
		let remove = match self.entries.get_mut(&key) {
			Some(entry) => {
				entry.editing = false;
				!entry.readable
			},
			None => false,
		};
		if remove {
			self.entries.remove(&key);
			self.order.retain(|k| k != &key);
			fs::remove_dir_all(self.entry_dir(&key)).ok();
			self.redundant_op_count += 1;
			self.journal_line(format!("{REMOVE} {key}"))?;
		}
		Ok(())
	}

	pub fn remove(&mut self, key: &str) -> Result<bool, CacheError> {
		let Some(entry) = self.entries.get(key) else {
			return Ok(false);
		};
		if entry.editing {
			return Ok(false);
		}
		let size = entry.size();
		self.delete_entry_files(key)?;
		self.entries.remove(key);
		self.order.retain(|k| k != key);
		self.size -= size;
		self.redundant_op_count += 1;
		let line = format!("{REMOVE} {key}");
		self.journal_line(line)?;
		self.compact_if_needed()?;
		Ok(true)
	}

	fn delete_entry_files(&self, key: &str) -> Result<(), CacheError> {
		let dir = self.entry_dir(key);
		if dir.exists() {
			fs::remove_dir_all(&dir)?;
		}
		Ok(())
	}

	fn trim_to_size(&mut self) -> Result<(), CacheError> {
		while self.size > self.max_size {
			let Some(victim) = self
				.order
				.iter()
				.find(|k| {
					self
						.entries
						.get(*k)
						.map(|e| e.readable && !e.editing)
						.unwrap_or(false)
				})
				.cloned()
			else {
				break;
			};
			debug!(key = %victim, "evicting cache entry");
			self.remove(&victim)?;
		}
		Ok(())
	}

	fn compact_if_needed(&mut self) -> Result<(), CacheError> {
		let journal_entry_count = self.entries.len() as u64;
		if self.redundant_op_count >= REDUNDANT_OP_COMPACT_THRESHOLD
			&& self.redundant_op_count >= journal_entry_count
		{
			self.rewrite_journal()?;
		}
		Ok(())
	}

	fn rewrite_journal(&mut self) -> Result<(), CacheError> {
		self.journal = None;
		let tmp_path = self.directory.join(JOURNAL_TMP);
		{
			let mut w = File::create(&tmp_path)?;
			writeln!(w, "{MAGIC}")?;
			writeln!(w, "{VERSION}")?;
			writeln!(w, "{}", self.app_version)?;
			writeln!(w, "{VALUE_COUNT}")?;
			writeln!(w)?;
			for key in &self.order {
				let Some(entry) = self.entries.get(key) else {
					continue;
				};
				if entry.editing {
					writeln!(w, "{DIRTY} {key}")?;
				}
				if entry.readable {
					writeln!(w, "{CLEAN} {key} {} {}", entry.lengths[0], entry.lengths[1])?;
				}
			}
			w.sync_all()?;
		}
		fs::rename(&tmp_path, self.directory.join(JOURNAL))?;
		self.journal = Some(
			OpenOptions::new()
				.append(true)
				.open(self.directory.join(JOURNAL))?,
		);
		self.redundant_op_count = 0;
		Ok(())
	}

	/// Keys, least-recently-used first. The caller may `remove` while
	/// iterating the returned snapshot.
	pub fn keys(&self) -> Vec<String> {
		self
			.order
			.iter()
			.filter(|k| self.entries.get(*k).map(|e| e.readable).unwrap_or(false))
			.cloned()
			.collect()
	}

	/// Path of a committed slot file, for read-only peeking without promoting
	/// the entry.
	pub fn peek_file(&self, key: &str, slot: usize) -> Option<PathBuf> {
		let entry = self.entries.get(key)?;
		if !entry.readable {
			return None;
		}
		Some(self.slot_path(key, slot))
	}

	pub fn contains(&self, key: &str) -> bool {
		self.entries.get(key).map(|e| e.readable).unwrap_or(false)
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	pub fn max_size(&self) -> u64 {
		self.max_size
	}

	pub fn entry_count(&self) -> usize {
		self.entries.values().filter(|e| e.readable).count()
	}
}

impl Drop for DiskLruCache {
	fn drop(&mut self) {
		fs::remove_file(self.directory.join(LOCK)).ok();
	}
}

#[cfg(test)]
mod tests {
	use std::io::Read;

	use super::*;

	fn write_entry(cache: &mut DiskLruCache, key: &str, meta: &[u8], body: &[u8]) {
		let mut editor = cache.edit(key).unwrap().expect("editor available");
		editor.new_sink(0).unwrap().write_all(meta).unwrap();
		editor.new_sink(1).unwrap().write_all(body).unwrap();
		cache.commit(editor).unwrap();
	}

	fn read_all(file: &mut File) -> Vec<u8> {
		let mut buf = Vec::new();
		file.read_to_end(&mut buf).unwrap();
		buf
	}

	#[test]
	fn write_then_read() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		write_entry(&mut cache, "abc", b"meta", b"body");

		let mut snap = cache.get("abc").unwrap().unwrap();
		assert_eq!(read_all(&mut snap.files[0]), b"meta");
		assert_eq!(read_all(&mut snap.files[1]), b"body");
		assert_eq!(snap.lengths, [4, 4]);
		assert_eq!(cache.size(), 8);
	}

	#[test]
	fn one_editor_per_key() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		let e1 = cache.edit("k").unwrap().unwrap();
		assert!(cache.edit("k").unwrap().is_none());
		cache.abort(e1).unwrap();
		assert!(cache.edit("k").unwrap().is_some());
	}

	#[test]
	fn abort_discards() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		let mut editor = cache.edit("k").unwrap().unwrap();
		editor.new_sink(0).unwrap().write_all(b"x").unwrap();
		cache.abort(editor).unwrap();
		assert!(cache.get("k").unwrap().is_none());
		assert_eq!(cache.size(), 0);
	}

	#[test]
	fn journal_replay_restores_state_and_order() {
		let dir = tempfile::tempdir().unwrap();
		{
			let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
			write_entry(&mut cache, "a", b"1", b"11");
			write_entry(&mut cache, "b", b"2", b"22");
			write_entry(&mut cache, "c", b"3", b"33");
			// Touch "a" so the LRU order becomes b, c, a.
			cache.get("a").unwrap().unwrap();
		}
		let cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		assert_eq!(cache.entry_count(), 3);
		assert_eq!(cache.keys(), vec!["b", "c", "a"]);
		assert_eq!(cache.size(), 9);
	}

	#[test]
	fn lru_eviction_bounds_size() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DiskLruCache::open(dir.path(), 1, 20).unwrap();
		write_entry(&mut cache, "a", b"aaaaa", b"aaaaa"); // 10
		write_entry(&mut cache, "b", b"bbbbb", b"bbbbb"); // 10
		assert_eq!(cache.size(), 20);
		// Promote "a", then overflow: "b" is the LRU victim.
		cache.get("a").unwrap().unwrap();
		write_entry(&mut cache, "c", b"ccccc", b"ccccc");
		assert!(cache.size() <= 20);
		assert!(cache.contains("a"));
		assert!(!cache.contains("b"));
		assert!(cache.contains("c"));
	}

	#[test]
	fn snapshot_survives_concurrent_commit() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		write_entry(&mut cache, "k", b"old-meta", b"old-body");
		let mut snap = cache.get("k").unwrap().unwrap();
		// Overwrite while the snapshot is open.
		write_entry(&mut cache, "k", b"new-meta", b"new-body");
		assert_eq!(read_all(&mut snap.files[1]), b"old-body");
		let mut snap2 = cache.get("k").unwrap().unwrap();
		assert_eq!(read_all(&mut snap2.files[1]), b"new-body");
	}

	#[test]
	fn metadata_only_rewrite_keeps_body() {
		let dir = tempfile::tempdir().unwrap();
		let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		write_entry(&mut cache, "k", b"meta1", b"body1");
		let mut editor = cache.edit("k").unwrap().unwrap();
		editor.new_sink(0).unwrap().write_all(b"meta2!").unwrap();
		cache.commit(editor).unwrap();
		let mut snap = cache.get("k").unwrap().unwrap();
		assert_eq!(read_all(&mut snap.files[0]), b"meta2!");
		assert_eq!(read_all(&mut snap.files[1]), b"body1");
	}

	#[test]
	fn corrupt_journal_is_rebuilt() {
		let dir = tempfile::tempdir().unwrap();
		{
			let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
			write_entry(&mut cache, "a", b"1", b"11");
		}
		fs::write(dir.path().join("journal"), b"garbage\nnot a journal\n").unwrap();
		let cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		// Entry files are still on disk, so recovery finds them.
		assert!(cache.contains("a"));
		assert_eq!(cache.size(), 3);
	}

	#[test]
	fn dirty_without_clean_is_discarded_on_replay() {
		let dir = tempfile::tempdir().unwrap();
		{
			let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
			let mut e = cache.edit("half").unwrap().unwrap();
			e.new_sink(0).unwrap().write_all(b"x").unwrap();
			// Neither commit nor abort: simulates a crash mid-write.
			drop(e);
		}
		let cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
		assert!(!cache.contains("half"));
	}

	#[test]
	fn app_version_change_invalidates_journal() {
		let dir = tempfile::tempdir().unwrap();
		{
			let mut cache = DiskLruCache::open(dir.path(), 1, 1024).unwrap();
			write_entry(&mut cache, "a", b"1", b"11");
		}
		// Recovery still picks the files up, under the new version.
		let cache = DiskLruCache::open(dir.path(), 2, 1024).unwrap();
		assert!(cache.contains("a"));
	}
}
