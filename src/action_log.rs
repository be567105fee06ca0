//! Append-only log of file operations
//!
//! Every UPDATE or DELETE a device produces is recorded here, keyed by
//! `(device, seq)`. Local operations assign the next local sequence number,
//! sign the wire form and keep it verbatim so peers can re-verify the
//! original signature. Remote operations apply in strictly increasing seq
//! order per device; arrivals with a gap are buffered until their
//! predecessors land. Applying an action drives the file-state view under
//! the last-writer-wins rule and notifies the registered subscriber.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use crate::digest::Digest;
use crate::error::{db_error, DecodeError, StorageError, SyncError};
use crate::file_state::{FileState, FileStateEntry};
use crate::logging::*;
use crate::name::Name;
use crate::signer::Signer;
use crate::sync_log::SyncLog;
use crate::util::now_secs;
use crate::wire::{ActionItem, ActionType, DataPacket};

/// Key: device wire + seq (8 bytes BE). Value: serialized StoredAction.
const ACTIONS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("actions");

/// Key: device wire. Value: highest contiguously applied seq.
const APPLIED_TABLE: TableDefinition<&[u8], u64> = TableDefinition::new("applied");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAction {
	device: Name,
	seq: u64,
	item: ActionItem,
	/// Signed wire form, kept verbatim for re-serving
	content: Vec<u8>,
}

/// Receives file-state changes after an action is persisted and applied.
///
/// Callbacks run under the log's write lock and must not call back into the
/// log synchronously; hand real work to an executor.
pub trait ActionSubscriber: Send + Sync {
	fn on_file_added_or_changed(
		&self,
		_filename: &str,
		_device: &Name,
		_seq: u64,
		_hash: &Digest,
		_mtime: i64,
		_mode: u32,
		_segment_count: u64,
	) {
	}

	fn on_file_removed(&self, _filename: &str) {}

	fn on_conflict(&self, _filename: &str, _winner: &Name, _loser: &Name) {}
}

/// Subscriber that ignores all events
pub struct NullSubscriber;

impl ActionSubscriber for NullSubscriber {}

fn action_key(device: &Name, seq: u64) -> Vec<u8> {
	let mut key = device.to_wire();
	key.extend_from_slice(&seq.to_be_bytes());
	key
}

pub struct ActionLog {
	db: Arc<redb::Database>,
	file_state: FileState,
	sync_log: Arc<SyncLog>,
	shared_folder: String,
	app_name: String,
	freshness_secs: u64,
	signer: Arc<dyn Signer>,
	subscriber: RwLock<Arc<dyn ActionSubscriber>>,
	/// Remote actions that arrived before their predecessors, per device
	pending: Mutex<HashMap<Vec<u8>, BTreeMap<u64, Vec<u8>>>>,
	write_lock: Mutex<()>,
}

impl ActionLog {
	pub fn open(
		path: &Path,
		sync_log: Arc<SyncLog>,
		shared_folder: &str,
		app_name: &str,
		freshness_secs: u64,
		signer: Arc<dyn Signer>,
	) -> Result<Self, StorageError> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db = Arc::new(redb::Database::create(path).map_err(db_error)?);
		{
			let write_txn = db.begin_write().map_err(db_error)?;
			let _ = write_txn.open_table(ACTIONS_TABLE).map_err(db_error)?;
			let _ = write_txn.open_table(APPLIED_TABLE).map_err(db_error)?;
			write_txn.commit().map_err(db_error)?;
		}
		let file_state = FileState::new(Arc::clone(&db))?;
		Ok(ActionLog {
			db,
			file_state,
			sync_log,
			shared_folder: shared_folder.to_string(),
			app_name: app_name.to_string(),
			freshness_secs,
			signer,
			subscriber: RwLock::new(Arc::new(NullSubscriber)),
			pending: Mutex::new(HashMap::new()),
			write_lock: Mutex::new(()),
		})
	}

	pub fn set_subscriber(&self, subscriber: Arc<dyn ActionSubscriber>) {
		*self.subscriber.write().unwrap() = subscriber;
	}

	pub fn file_state(&self) -> &FileState {
		&self.file_state
	}

	/// `<device>/<app>/action/<folder>/<seq>`
	pub fn action_name(&self, device: &Name, seq: u64) -> Name {
		device
			.clone()
			.push_str(&self.app_name)
			.push_str("action")
			.push_str(&self.shared_folder)
			.push_number(seq)
	}

	//////////////////////////
	// Local operations     //
	//////////////////////////

	/// Record a local file create or modify. Assigns the next local seq,
	/// chains the parent pointer off the current file-state entry and bumps
	/// the version past it.
	pub fn add_local_update(
		&self,
		filename: &str,
		file_hash: Digest,
		file_size: u64,
		mtime: i64,
		mode: u32,
		segment_count: u64,
	) -> Result<(u64, ActionItem), SyncError> {
		let _guard = self.write_lock.lock().unwrap();

		let parent = self.file_state.lookup(filename)?;
		let item = ActionItem {
			action_type: ActionType::Update,
			filename: filename.to_string(),
			version: parent.as_ref().map(|p| p.version + 1).unwrap_or(1),
			timestamp: now_secs(),
			parent_device: parent.as_ref().map(|p| p.device.clone()),
			parent_seq: parent.as_ref().map(|p| p.seq),
			file_hash: Some(file_hash),
			file_size: Some(file_size),
			mtime: Some(mtime),
			mode: Some(mode),
			segment_count: Some(segment_count),
		};

		let device = self.sync_log.local_name().clone();
		let seq = self.sync_log.next_local_seq()?;
		let mut packet = DataPacket::new(
			self.action_name(&device, seq),
			item.encode(),
			self.freshness_secs,
		);
		self.signer.sign(&mut packet);

		self.persist(&device, seq, &item, &packet.encode())?;
		self.apply(&device, seq, &item, true)?;
		self.set_last_applied(&device, seq)?;

		debug!("local update {} v{} as {}/{}", filename, item.version, device, seq);
		Ok((seq, item))
	}

	/// Record a local file deletion. Returns `None` when the filename has no
	/// file-state entry (nothing to delete).
	pub fn add_local_delete(
		&self,
		filename: &str,
	) -> Result<Option<(u64, ActionItem)>, SyncError> {
		let _guard = self.write_lock.lock().unwrap();

		let parent = match self.file_state.lookup_live(filename)? {
			Some(parent) => parent,
			None => return Ok(None),
		};
		let item = ActionItem {
			action_type: ActionType::Delete,
			filename: filename.to_string(),
			version: parent.version + 1,
			timestamp: now_secs(),
			parent_device: Some(parent.device.clone()),
			parent_seq: Some(parent.seq),
			file_hash: None,
			file_size: None,
			mtime: None,
			mode: None,
			segment_count: None,
		};

		let device = self.sync_log.local_name().clone();
		let seq = self.sync_log.next_local_seq()?;
		let mut packet = DataPacket::new(
			self.action_name(&device, seq),
			item.encode(),
			self.freshness_secs,
		);
		self.signer.sign(&mut packet);

		self.persist(&device, seq, &item, &packet.encode())?;
		self.apply(&device, seq, &item, true)?;
		self.set_last_applied(&device, seq)?;

		debug!("local delete {} as {}/{}", filename, device, seq);
		Ok(Some((seq, item)))
	}

	//////////////////////////
	// Remote operations    //
	//////////////////////////

	/// Add a remote action from its signed wire form. Idempotent: a
	/// re-delivered `(device, seq)` is a no-op that still returns the parsed
	/// action. An action arriving before its predecessor is buffered and
	/// applied once the gap closes.
	pub fn add_remote(
		&self,
		device: &Name,
		seq: u64,
		action_data: &[u8],
	) -> Result<ActionItem, SyncError> {
		let packet = DataPacket::decode(action_data)?;
		let item = ActionItem::decode(&packet.content)?;

		let _guard = self.write_lock.lock().unwrap();

		if self.contains(device, seq)? {
			return Ok(item);
		}

		let expected = self.last_applied(device)? + 1;
		if seq > expected {
			trace!("buffering {}/{} (expecting {})", device, seq, expected);
			let mut pending = self.pending.lock().unwrap();
			pending
				.entry(device.to_wire())
				.or_insert_with(BTreeMap::new)
				.insert(seq, action_data.to_vec());
			return Ok(item);
		}

		self.persist(device, seq, &item, action_data)?;
		self.apply(device, seq, &item, false)?;
		self.set_last_applied(device, seq)?;

		// drain any buffered successors that are now contiguous
		loop {
			let next_seq = self.last_applied(device)? + 1;
			let buffered = {
				let mut pending = self.pending.lock().unwrap();
				match pending.get_mut(&device.to_wire()) {
					Some(queue) => queue.remove(&next_seq),
					None => None,
				}
			};
			let bytes = match buffered {
				Some(bytes) => bytes,
				None => break,
			};
			let packet = DataPacket::decode(&bytes)?;
			let next_item = ActionItem::decode(&packet.content)?;
			self.persist(device, next_seq, &next_item, &bytes)?;
			self.apply(device, next_seq, &next_item, false)?;
			self.set_last_applied(device, next_seq)?;
		}

		Ok(item)
	}

	//////////////////////////
	// Internals            //
	//////////////////////////

	fn persist(
		&self,
		device: &Name,
		seq: u64,
		item: &ActionItem,
		content: &[u8],
	) -> Result<(), StorageError> {
		let stored = StoredAction {
			device: device.clone(),
			seq,
			item: item.clone(),
			content: content.to_vec(),
		};
		let bytes = bincode::serialize(&stored)
			.map_err(|e| StorageError::Corrupted { message: e.to_string() })?;
		let key = action_key(device, seq);
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(ACTIONS_TABLE).map_err(db_error)?;
			table.insert(key.as_slice(), bytes.as_slice()).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	/// Drive the file-state view. The incoming action wins against the
	/// current entry iff its `(version, timestamp, device)` tuple is
	/// greater; losers are archived without touching the live entry.
	fn apply(
		&self,
		device: &Name,
		seq: u64,
		item: &ActionItem,
		local: bool,
	) -> Result<(), StorageError> {
		let incoming = FileStateEntry {
			filename: item.filename.clone(),
			device: device.clone(),
			seq,
			version: item.version,
			timestamp: item.timestamp,
			file_hash: item.file_hash,
			file_size: item.file_size.unwrap_or(0),
			mtime: item.mtime.unwrap_or(item.timestamp),
			mode: item.mode.unwrap_or(0o644),
			segment_count: item.segment_count.unwrap_or(0),
			is_complete: local,
			deleted: item.action_type == ActionType::Delete,
		};

		if let Some(current) = self.file_state.lookup(&item.filename)? {
			if incoming.conflict_key() <= current.conflict_key() {
				// conflict loser: recorded in the log, archived, live entry untouched
				self.file_state.archive(&incoming)?;
				warn!(
					"conflict on {}: {}/{} loses to {}/{}",
					item.filename, device, seq, current.device, current.seq
				);
				let subscriber = self.subscriber.read().unwrap().clone();
				subscriber.on_conflict(&item.filename, &current.device, device);
				return Ok(());
			}
			// superseded entry goes onto the archive chain
			self.file_state.archive(&current)?;
		}

		self.file_state.upsert(&incoming)?;

		let subscriber = self.subscriber.read().unwrap().clone();
		match item.action_type {
			ActionType::Update => {
				if let Some(hash) = item.file_hash.as_ref() {
					subscriber.on_file_added_or_changed(
						&item.filename,
						device,
						seq,
						hash,
						incoming.mtime,
						incoming.mode,
						incoming.segment_count,
					);
				}
			}
			ActionType::Delete => {
				subscriber.on_file_removed(&item.filename);
			}
		}
		Ok(())
	}

	fn last_applied(&self, device: &Name) -> Result<u64, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(APPLIED_TABLE).map_err(db_error)?;
		Ok(table
			.get(device.to_wire().as_slice())
			.map_err(db_error)?
			.map(|v| v.value())
			.unwrap_or(0))
	}

	fn set_last_applied(&self, device: &Name, seq: u64) -> Result<(), StorageError> {
		let key = device.to_wire();
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(APPLIED_TABLE).map_err(db_error)?;
			table.insert(key.as_slice(), seq).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	fn read_stored(&self, device: &Name, seq: u64) -> Result<Option<StoredAction>, StorageError> {
		let key = action_key(device, seq);
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(ACTIONS_TABLE).map_err(db_error)?;
		match table.get(key.as_slice()).map_err(db_error)? {
			Some(value) => {
				let stored: StoredAction =
					bincode::deserialize(value.value()).map_err(|e| StorageError::Corrupted {
						message: format!("stored action: {}", e),
					})?;
				Ok(Some(stored))
			}
			None => Ok(None),
		}
	}

	fn all_stored(&self) -> Result<Vec<StoredAction>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(ACTIONS_TABLE).map_err(db_error)?;
		let mut actions = Vec::new();
		let mut iter = table.iter().map_err(db_error)?;
		loop {
			match iter.next() {
				Some(Ok((_, value))) => {
					let stored: StoredAction = bincode::deserialize(value.value()).map_err(
						|e| StorageError::Corrupted { message: format!("stored action: {}", e) },
					)?;
					actions.push(stored);
				}
				Some(Err(e)) => return Err(db_error(e)),
				None => break,
			}
		}
		Ok(actions)
	}

	//////////////////////////
	// Queries              //
	//////////////////////////

	pub fn contains(&self, device: &Name, seq: u64) -> Result<bool, StorageError> {
		Ok(self.read_stored(device, seq)?.is_some())
	}

	pub fn lookup_action(
		&self,
		device: &Name,
		seq: u64,
	) -> Result<Option<ActionItem>, StorageError> {
		Ok(self.read_stored(device, seq)?.map(|s| s.item))
	}

	/// Look up by full action name `<device>/<app>/action/<folder>/<seq>`
	pub fn lookup_action_by_name(&self, name: &Name) -> Result<Option<ActionItem>, SyncError> {
		let (device, seq) = self.parse_action_name(name)?;
		Ok(self.lookup_action(&device, seq)?)
	}

	/// The exact signed bytes the originator produced; never a re-serialization
	pub fn lookup_action_data(
		&self,
		device: &Name,
		seq: u64,
	) -> Result<Option<Vec<u8>>, StorageError> {
		Ok(self.read_stored(device, seq)?.map(|s| s.content))
	}

	pub fn parse_action_name(&self, name: &Name) -> Result<(Name, u64), DecodeError> {
		if name.len() < 5 || name.get_back(2) != Some(b"action") {
			return Err(DecodeError::BadName {
				message: format!("not an action name: {}", name),
			});
		}
		let seq = name.number_at_back(0)?;
		let device = name.sub_name(0, name.len() - 4);
		Ok((device, seq))
	}

	/// Up to `limit` actions in `folder`, newest first, starting at `offset`.
	/// The second member reports whether more actions remain.
	pub fn lookup_actions_in_folder(
		&self,
		folder: &str,
		offset: usize,
		limit: usize,
	) -> Result<(Vec<(Name, u64, ActionItem)>, bool), StorageError> {
		if folder != self.shared_folder {
			return Ok((Vec::new(), false));
		}
		let mut actions = self.all_stored()?;
		actions.sort_by(|a, b| b.item.timestamp.cmp(&a.item.timestamp));
		let total = actions.len();
		let page: Vec<(Name, u64, ActionItem)> = actions
			.into_iter()
			.skip(offset)
			.take(limit)
			.map(|s| (s.device, s.seq, s.item))
			.collect();
		let has_more = total > offset + page.len();
		Ok((page, has_more))
	}

	/// Actions touching one filename, newest first
	pub fn lookup_actions_for_file(
		&self,
		filename: &str,
		offset: usize,
		limit: usize,
	) -> Result<(Vec<(Name, u64, ActionItem)>, bool), StorageError> {
		let mut actions = self.all_stored()?;
		actions.retain(|s| s.item.filename == filename);
		actions.sort_by(|a, b| b.item.timestamp.cmp(&a.item.timestamp));
		let total = actions.len();
		let page: Vec<(Name, u64, ActionItem)> = actions
			.into_iter()
			.skip(offset)
			.take(limit)
			.map(|s| (s.device, s.seq, s.item))
			.collect();
		let has_more = total > offset + page.len();
		Ok((page, has_more))
	}

	/// Most recently acted-on filenames, for status displays
	pub fn lookup_recent_file_actions(
		&self,
		limit: usize,
	) -> Result<Vec<(String, Name, u64)>, StorageError> {
		let mut actions = self.all_stored()?;
		actions.sort_by(|a, b| b.item.timestamp.cmp(&a.item.timestamp));
		let mut seen = Vec::new();
		let mut out = Vec::new();
		for stored in actions {
			if seen.contains(&stored.item.filename) {
				continue;
			}
			seen.push(stored.item.filename.clone());
			out.push((stored.item.filename, stored.device, stored.seq));
			if out.len() >= limit {
				break;
			}
		}
		Ok(out)
	}

	/// Total number of recorded actions (test helper)
	pub fn log_size(&self) -> Result<u64, StorageError> {
		Ok(self.all_stored()?.len() as u64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::signer::NullSigner;
	use tempfile::TempDir;

	fn open_logs(tmp: &TempDir, local: &str) -> (Arc<SyncLog>, ActionLog) {
		let sync_log = Arc::new(
			SyncLog::open(&tmp.path().join("sync-log.db"), Name::parse(local).unwrap()).unwrap(),
		);
		let action_log = ActionLog::open(
			&tmp.path().join("action-log.db"),
			Arc::clone(&sync_log),
			"shared",
			"namesync",
			2,
			Arc::new(NullSigner),
		)
		.unwrap();
		(sync_log, action_log)
	}

	fn update(log: &ActionLog, filename: &str, content: &[u8]) -> (u64, ActionItem) {
		log.add_local_update(
			filename,
			Digest::of(content),
			content.len() as u64,
			now_secs(),
			0o644,
			1,
		)
		.unwrap()
	}

	#[test]
	fn test_local_update_versions_chain() {
		let tmp = TempDir::new().unwrap();
		let (_, log) = open_logs(&tmp, "/alice");

		let (seq1, item1) = update(&log, "a.txt", b"one");
		assert_eq!(seq1, 1);
		assert_eq!(item1.version, 1);
		assert_eq!(item1.parent_seq, None);

		let (seq2, item2) = update(&log, "a.txt", b"two");
		assert_eq!(seq2, 2);
		assert_eq!(item2.version, 2);
		assert_eq!(item2.parent_device, Some(Name::parse("/alice").unwrap()));
		assert_eq!(item2.parent_seq, Some(1));
	}

	#[test]
	fn test_local_delete_tombstones() {
		let tmp = TempDir::new().unwrap();
		let (_, log) = open_logs(&tmp, "/alice");

		update(&log, "tmp.bin", b"data");
		let (seq, item) = log.add_local_delete("tmp.bin").unwrap().unwrap();
		assert_eq!(seq, 2);
		assert_eq!(item.action_type, ActionType::Delete);
		assert_eq!(item.parent_seq, Some(1));

		assert!(log.file_state().lookup_live("tmp.bin").unwrap().is_none());
		assert_eq!(log.log_size().unwrap(), 2);

		// deleting an unknown file is a no-op
		assert!(log.add_local_delete("ghost").unwrap().is_none());
	}

	#[test]
	fn test_update_after_delete_revives() {
		let tmp = TempDir::new().unwrap();
		let (_, log) = open_logs(&tmp, "/alice");

		update(&log, "a.txt", b"one");
		log.add_local_delete("a.txt").unwrap().unwrap();
		let (_, item) = update(&log, "a.txt", b"back");
		assert_eq!(item.version, 3);
		assert!(log.file_state().lookup_live("a.txt").unwrap().is_some());
	}

	#[test]
	fn test_remote_round_trip_and_idempotence() {
		let tmp_a = TempDir::new().unwrap();
		let tmp_b = TempDir::new().unwrap();
		let (_, log_a) = open_logs(&tmp_a, "/alice");
		let (_, log_b) = open_logs(&tmp_b, "/bob");
		let alice = Name::parse("/alice").unwrap();

		let (seq, item) = update(&log_a, "a.txt", b"payload");
		let data = log_a.lookup_action_data(&alice, seq).unwrap().unwrap();

		let applied = log_b.add_remote(&alice, seq, &data).unwrap();
		assert_eq!(applied, item);
		assert!(log_b.file_state().lookup_live("a.txt").unwrap().is_some());

		// re-delivery is a no-op that still returns the action
		let again = log_b.add_remote(&alice, seq, &data).unwrap();
		assert_eq!(again, item);
		assert_eq!(log_b.log_size().unwrap(), 1);

		// byte-exact immutability of the stored wire form
		assert_eq!(log_b.lookup_action_data(&alice, seq).unwrap().unwrap(), data);
	}

	#[test]
	fn test_remote_gap_is_buffered_until_contiguous() {
		let tmp_a = TempDir::new().unwrap();
		let tmp_b = TempDir::new().unwrap();
		let (_, log_a) = open_logs(&tmp_a, "/alice");
		let (_, log_b) = open_logs(&tmp_b, "/bob");
		let alice = Name::parse("/alice").unwrap();

		let (s1, _) = update(&log_a, "a.txt", b"one");
		let (s2, _) = update(&log_a, "a.txt", b"two");
		let (s3, _) = update(&log_a, "a.txt", b"three");
		let d1 = log_a.lookup_action_data(&alice, s1).unwrap().unwrap();
		let d2 = log_a.lookup_action_data(&alice, s2).unwrap().unwrap();
		let d3 = log_a.lookup_action_data(&alice, s3).unwrap().unwrap();

		// deliver out of order: 3, 2, 1
		log_b.add_remote(&alice, s3, &d3).unwrap();
		assert_eq!(log_b.log_size().unwrap(), 0);
		log_b.add_remote(&alice, s2, &d2).unwrap();
		assert_eq!(log_b.log_size().unwrap(), 0);
		log_b.add_remote(&alice, s1, &d1).unwrap();

		// the gap closed: all three applied in order
		assert_eq!(log_b.log_size().unwrap(), 3);
		let live = log_b.file_state().lookup_live("a.txt").unwrap().unwrap();
		assert_eq!(live.version, 3);
		assert_eq!(live.seq, 3);
	}

	#[test]
	fn test_conflict_totality() {
		// A and B concurrently write the same file with the same version and
		// timestamp; the lexicographically greater device must win on both.
		let tmp_a = TempDir::new().unwrap();
		let tmp_b = TempDir::new().unwrap();
		let (_, log_a) = open_logs(&tmp_a, "/A");
		let (_, log_b) = open_logs(&tmp_b, "/B");
		let a = Name::parse("/A").unwrap();
		let b = Name::parse("/B").unwrap();

		let (seq_a, mut item_a) = update(&log_a, "readme.md", b"from A");
		let (seq_b, mut item_b) = update(&log_b, "readme.md", b"from B");
		// force identical version and timestamp
		item_a.timestamp = 100;
		item_b.timestamp = 100;
		let packet_a = DataPacket::new(log_a.action_name(&a, seq_a), item_a.encode(), 2);
		let packet_b = DataPacket::new(log_b.action_name(&b, seq_b), item_b.encode(), 2);

		// cross-deliver into fresh logs so both see both actions
		let tmp_1 = TempDir::new().unwrap();
		let tmp_2 = TempDir::new().unwrap();
		let (_, obs_1) = open_logs(&tmp_1, "/observer1");
		let (_, obs_2) = open_logs(&tmp_2, "/observer2");

		obs_1.add_remote(&a, 1, &packet_a.encode()).unwrap();
		obs_1.add_remote(&b, 1, &packet_b.encode()).unwrap();
		// opposite arrival order
		obs_2.add_remote(&b, 1, &packet_b.encode()).unwrap();
		obs_2.add_remote(&a, 1, &packet_a.encode()).unwrap();

		for obs in [&obs_1, &obs_2].iter() {
			let live = obs.file_state().lookup_live("readme.md").unwrap().unwrap();
			assert_eq!(live.device, b, "lexicographically greater device wins");
			assert_eq!(obs.log_size().unwrap(), 2, "both actions recorded");
			assert_eq!(obs.file_state().list_archived("readme.md").unwrap().len(), 1);
		}
	}

	#[test]
	fn test_lookup_by_name() {
		let tmp = TempDir::new().unwrap();
		let (_, log) = open_logs(&tmp, "/alice/laptop");

		let (seq, item) = update(&log, "a.txt", b"x");
		let name = log.action_name(&Name::parse("/alice/laptop").unwrap(), seq);
		assert_eq!(name.to_string(), "/alice/laptop/namesync/action/shared/1");

		let found = log.lookup_action_by_name(&name).unwrap().unwrap();
		assert_eq!(found, item);

		assert!(log.lookup_action_by_name(&Name::parse("/way/too/short").unwrap()).is_err());
	}

	#[test]
	fn test_folder_and_file_queries() {
		let tmp = TempDir::new().unwrap();
		let (_, log) = open_logs(&tmp, "/alice");

		update(&log, "a.txt", b"1");
		update(&log, "b.txt", b"2");
		update(&log, "a.txt", b"3");

		let (page, has_more) = log.lookup_actions_in_folder("shared", 0, 2).unwrap();
		assert_eq!(page.len(), 2);
		assert!(has_more);
		let (rest, has_more) = log.lookup_actions_in_folder("shared", 2, 10).unwrap();
		assert_eq!(rest.len(), 1);
		assert!(!has_more);

		let (for_a, _) = log.lookup_actions_for_file("a.txt", 0, 10).unwrap();
		assert_eq!(for_a.len(), 2);

		let (other, _) = log.lookup_actions_in_folder("elsewhere", 0, 10).unwrap();
		assert!(other.is_empty());

		let recent = log.lookup_recent_file_actions(5).unwrap();
		assert_eq!(recent.len(), 2);
	}
}

// vim: ts=4
