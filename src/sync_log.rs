//! Sync log: authoritative per-device state and digest history
//!
//! Holds the set of known sync nodes (device, latest seq, locator) and a
//! bounded history of root digests over that set. The history answers
//! "have we ever seen this digest" recovery questions and yields state
//! diffs between any two remembered states.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::digest::{digest_node_set, Digest};
use crate::error::{db_error, StorageError};
use crate::logging::*;
use crate::name::Name;
use crate::util::now_secs;
use crate::wire::{StateType, SyncState, SyncStateMsg};

/// Remembered states beyond this count are pruned, oldest first
const MAX_HISTORY: usize = 100;

/// Key: wire-encoded device name. Value: serialized NodeRecord.
const NODES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sync_nodes");

/// Key: 32-byte digest. Value: serialized StateRecord.
const HISTORY_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sync_log");

/// Key: counter name. Value: next value.
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
	seq: u64,
	locator: Option<Name>,
	last_update: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRecord {
	state_id: u64,
	timestamp: i64,
	/// device -> seq at this state, keyed by wire-encoded name
	snapshot: Vec<(Name, u64)>,
}

pub struct SyncLog {
	db: redb::Database,
	local_name: Name,
	// serializes remember_state and the update_* family
	write_lock: Mutex<()>,
}

impl SyncLog {
	pub fn open(path: &Path, local_name: Name) -> Result<Self, StorageError> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db = redb::Database::create(path).map_err(db_error)?;
		{
			let write_txn = db.begin_write().map_err(db_error)?;
			let _ = write_txn.open_table(NODES_TABLE).map_err(db_error)?;
			let _ = write_txn.open_table(HISTORY_TABLE).map_err(db_error)?;
			let _ = write_txn.open_table(META_TABLE).map_err(db_error)?;
			write_txn.commit().map_err(db_error)?;
		}

		let log = SyncLog { db, local_name, write_lock: Mutex::new(()) };

		// the local device is always a sync node, starting at seq 0
		if log.read_node(&log.local_name.clone())?.is_none() {
			let local = log.local_name.clone();
			log.write_node(&local, NodeRecord { seq: 0, locator: None, last_update: now_secs() })?;
		}
		Ok(log)
	}

	pub fn local_name(&self) -> &Name {
		&self.local_name
	}

	fn read_node(&self, device: &Name) -> Result<Option<NodeRecord>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(NODES_TABLE).map_err(db_error)?;
		match table.get(device.to_wire().as_slice()).map_err(db_error)? {
			Some(value) => {
				let record: NodeRecord =
					bincode::deserialize(value.value()).map_err(|e| StorageError::Corrupted {
						message: format!("sync node: {}", e),
					})?;
				Ok(Some(record))
			}
			None => Ok(None),
		}
	}

	fn write_node(&self, device: &Name, record: NodeRecord) -> Result<(), StorageError> {
		let bytes = bincode::serialize(&record)
			.map_err(|e| StorageError::Corrupted { message: e.to_string() })?;
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(NODES_TABLE).map_err(db_error)?;
			table.insert(device.to_wire().as_slice(), bytes.as_slice()).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	fn all_nodes(&self) -> Result<Vec<(Name, NodeRecord)>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(NODES_TABLE).map_err(db_error)?;
		let mut nodes = Vec::new();
		let mut iter = table.iter().map_err(db_error)?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					let name = Name::from_wire(key.value()).map_err(|e| {
						StorageError::Corrupted { message: format!("node key: {}", e) }
					})?;
					let record: NodeRecord = bincode::deserialize(value.value()).map_err(|e| {
						StorageError::Corrupted { message: format!("sync node: {}", e) }
					})?;
					nodes.push((name, record));
				}
				Some(Err(e)) => return Err(db_error(e)),
				None => break,
			}
		}
		Ok(nodes)
	}

	/// Increment and return the local sequence counter
	pub fn next_local_seq(&self) -> Result<u64, StorageError> {
		let _guard = self.write_lock.lock().unwrap();
		let local = self.local_name.clone();
		let mut record = self
			.read_node(&local)?
			.unwrap_or(NodeRecord { seq: 0, locator: None, last_update: now_secs() });
		record.seq += 1;
		record.last_update = now_secs();
		let seq = record.seq;
		self.write_node(&local, record)?;
		Ok(seq)
	}

	/// Record that `device` is at least at `seq`; never regresses
	pub fn update_device_seq(&self, device: &Name, seq: u64) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().unwrap();
		let existing = self.read_node(device)?;
		if let Some(ref record) = existing {
			if seq <= record.seq {
				return Ok(());
			}
		}
		let mut record =
			existing.unwrap_or(NodeRecord { seq: 0, locator: None, last_update: 0 });
		record.seq = seq;
		record.last_update = now_secs();
		self.write_node(device, record)?;
		Ok(())
	}

	pub fn update_locator(&self, device: &Name, locator: &Name) -> Result<(), StorageError> {
		let _guard = self.write_lock.lock().unwrap();
		let mut record = self
			.read_node(device)?
			.unwrap_or(NodeRecord { seq: 0, locator: None, last_update: now_secs() });
		record.locator = Some(locator.clone());
		record.last_update = now_secs();
		self.write_node(device, record)?;
		Ok(())
	}

	pub fn lookup_locator(&self, device: &Name) -> Result<Option<Name>, StorageError> {
		Ok(self.read_node(device)?.and_then(|r| r.locator))
	}

	pub fn update_local_locator(&self, locator: &Name) -> Result<(), StorageError> {
		let local = self.local_name.clone();
		self.update_locator(&local, locator)
	}

	pub fn lookup_local_locator(&self) -> Result<Option<Name>, StorageError> {
		let local = self.local_name.clone();
		self.lookup_locator(&local)
	}

	/// Latest observed seq for `device`; 0 when unknown
	pub fn seq_no(&self, device: &Name) -> Result<u64, StorageError> {
		Ok(self.read_node(device)?.map(|r| r.seq).unwrap_or(0))
	}

	/// Compute the root digest over the current node set and remember it in
	/// the state history. Re-remembering an already-known state is a no-op
	/// that returns the same digest.
	pub fn remember_state(&self) -> Result<Digest, StorageError> {
		let _guard = self.write_lock.lock().unwrap();

		let nodes = self.all_nodes()?;
		let pairs: Vec<(Name, u64)> =
			nodes.iter().map(|(name, record)| (name.clone(), record.seq)).collect();
		let digest = digest_node_set(&pairs);

		if self.lookup_sync_log_inner(&digest)?.is_some() {
			return Ok(digest);
		}

		let write_txn = self.db.begin_write().map_err(db_error)?;
		let state_id;
		{
			let mut meta = write_txn.open_table(META_TABLE).map_err(db_error)?;
			state_id = meta.get("next_state_id").map_err(db_error)?.map(|v| v.value()).unwrap_or(1);
			meta.insert("next_state_id", state_id + 1).map_err(db_error)?;

			let record =
				StateRecord { state_id, timestamp: now_secs(), snapshot: pairs.clone() };
			let bytes = bincode::serialize(&record)
				.map_err(|e| StorageError::Corrupted { message: e.to_string() })?;
			let mut history = write_txn.open_table(HISTORY_TABLE).map_err(db_error)?;
			history.insert(digest.as_bytes().as_slice(), bytes.as_slice()).map_err(db_error)?;

			// bounded retention: drop the oldest entries beyond MAX_HISTORY
			let mut entries: Vec<(Vec<u8>, u64)> = Vec::new();
			let mut iter = history.iter().map_err(db_error)?;
			loop {
				match iter.next() {
					Some(Ok((key, value))) => {
						let record: StateRecord = bincode::deserialize(value.value())
							.map_err(|e| StorageError::Corrupted { message: e.to_string() })?;
						entries.push((key.value().to_vec(), record.state_id));
					}
					Some(Err(e)) => return Err(db_error(e)),
					None => break,
				}
			}
			drop(iter);
			if entries.len() > MAX_HISTORY {
				entries.sort_by_key(|(_, id)| *id);
				let excess = entries.len() - MAX_HISTORY;
				for (key, _) in entries.into_iter().take(excess) {
					history.remove(key.as_slice()).map_err(db_error)?;
				}
			}
		}
		write_txn.commit().map_err(db_error)?;

		trace!("remembered state {} (id {})", digest.short(), state_id);
		Ok(digest)
	}

	fn lookup_sync_log_inner(&self, digest: &Digest) -> Result<Option<u64>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(HISTORY_TABLE).map_err(db_error)?;
		match table.get(digest.as_bytes().as_slice()).map_err(db_error)? {
			Some(value) => {
				let record: StateRecord =
					bincode::deserialize(value.value()).map_err(|e| StorageError::Corrupted {
						message: format!("state record: {}", e),
					})?;
				Ok(Some(record.state_id))
			}
			None => Ok(None),
		}
	}

	/// State id under which `digest` was remembered, if ever
	pub fn lookup_sync_log(&self, digest: &Digest) -> Result<Option<u64>, StorageError> {
		self.lookup_sync_log_inner(digest)
	}

	fn snapshot_of(&self, digest: &Digest) -> Result<BTreeMap<Vec<u8>, (Name, u64)>, StorageError> {
		if digest.is_origin() {
			return Ok(BTreeMap::new());
		}
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(HISTORY_TABLE).map_err(db_error)?;
		let value = table
			.get(digest.as_bytes().as_slice())
			.map_err(db_error)?
			.ok_or_else(|| StorageError::Missing { what: format!("state {}", digest.short()) })?;
		let record: StateRecord = bincode::deserialize(value.value())
			.map_err(|e| StorageError::Corrupted { message: format!("state record: {}", e) })?;
		Ok(record
			.snapshot
			.into_iter()
			.map(|(name, seq)| (name.to_wire(), (name, seq)))
			.collect())
	}

	/// Devices whose seq numbers differ between two remembered states.
	/// With `include_old_seq`, each UPDATE carries the old seq (0 when the
	/// device was unknown in the old state), which callers turn into fetch
	/// ranges.
	pub fn find_state_differences(
		&self,
		old_digest: &Digest,
		new_digest: &Digest,
		include_old_seq: bool,
	) -> Result<SyncStateMsg, StorageError> {
		let old = self.snapshot_of(old_digest)?;
		let new = self.snapshot_of(new_digest)?;

		let mut msg = SyncStateMsg::default();
		for (key, (device, new_seq)) in &new {
			let old_seq = old.get(key).map(|(_, seq)| *seq);
			if old_seq == Some(*new_seq) {
				continue;
			}
			msg.states.push(SyncState {
				device: device.clone(),
				state_type: StateType::Update,
				seq: *new_seq,
				old_seq: if include_old_seq { Some(old_seq.unwrap_or(0)) } else { None },
				locator: self.lookup_locator(device)?,
			});
		}
		for (key, (device, old_seq)) in &old {
			if !new.contains_key(key) {
				msg.states.push(SyncState {
					device: device.clone(),
					state_type: StateType::Delete,
					seq: *old_seq,
					old_seq: None,
					locator: None,
				});
			}
		}
		Ok(msg)
	}

	/// Number of remembered states (test helper)
	pub fn log_size(&self) -> Result<u64, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(HISTORY_TABLE).map_err(db_error)?;
		let mut count = 0u64;
		let mut iter = table.iter().map_err(db_error)?;
		loop {
			match iter.next() {
				Some(Ok(_)) => count += 1,
				Some(Err(e)) => return Err(db_error(e)),
				None => break,
			}
		}
		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn open_log(tmp: &TempDir, local: &str) -> SyncLog {
		SyncLog::open(&tmp.path().join("sync-log.db"), Name::parse(local).unwrap()).unwrap()
	}

	#[test]
	fn test_local_node_exists_at_open() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		assert_eq!(log.seq_no(&Name::parse("/alice").unwrap()).unwrap(), 0);
	}

	#[test]
	fn test_next_local_seq_is_dense() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		assert_eq!(log.next_local_seq().unwrap(), 1);
		assert_eq!(log.next_local_seq().unwrap(), 2);
		assert_eq!(log.next_local_seq().unwrap(), 3);
	}

	#[test]
	fn test_update_device_seq_is_monotonic() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		let bob = Name::parse("/bob").unwrap();

		log.update_device_seq(&bob, 5).unwrap();
		assert_eq!(log.seq_no(&bob).unwrap(), 5);

		log.update_device_seq(&bob, 3).unwrap();
		assert_eq!(log.seq_no(&bob).unwrap(), 5);

		log.update_device_seq(&bob, 9).unwrap();
		assert_eq!(log.seq_no(&bob).unwrap(), 9);
	}

	#[test]
	fn test_locator_round_trip() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		let bob = Name::parse("/bob").unwrap();
		let hub = Name::parse("/isp/hub").unwrap();

		assert_eq!(log.lookup_locator(&bob).unwrap(), None);
		log.update_locator(&bob, &hub).unwrap();
		assert_eq!(log.lookup_locator(&bob).unwrap(), Some(hub.clone()));

		log.update_local_locator(&hub).unwrap();
		assert_eq!(log.lookup_local_locator().unwrap(), Some(hub));
	}

	#[test]
	fn test_remember_state_determinism() {
		let tmp1 = TempDir::new().unwrap();
		let tmp2 = TempDir::new().unwrap();
		// both logs end with identical device -> seq mappings
		let log1 = open_log(&tmp1, "/alice");
		log1.update_device_seq(&Name::parse("/bob").unwrap(), 7).unwrap();
		log1.update_device_seq(&Name::parse("/alice").unwrap(), 2).unwrap();

		let log2 = open_log(&tmp2, "/bob");
		log2.update_device_seq(&Name::parse("/alice").unwrap(), 2).unwrap();
		log2.update_device_seq(&Name::parse("/bob").unwrap(), 7).unwrap();

		assert_eq!(log1.remember_state().unwrap(), log2.remember_state().unwrap());
	}

	#[test]
	fn test_remember_state_is_idempotent() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		let d1 = log.remember_state().unwrap();
		let d2 = log.remember_state().unwrap();
		assert_eq!(d1, d2);
		assert_eq!(log.log_size().unwrap(), 1);
	}

	#[test]
	fn test_lookup_sync_log() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		let digest = log.remember_state().unwrap();
		assert!(log.lookup_sync_log(&digest).unwrap().is_some());
		assert!(log.lookup_sync_log(&Digest::of(b"unknown")).unwrap().is_none());
	}

	#[test]
	fn test_find_state_differences() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		let old = log.remember_state().unwrap();

		log.update_device_seq(&Name::parse("/bob").unwrap(), 4).unwrap();
		log.update_device_seq(&Name::parse("/alice").unwrap(), 1).unwrap();
		let new = log.remember_state().unwrap();

		let diff = log.find_state_differences(&old, &new, true).unwrap();
		assert_eq!(diff.states.len(), 2);
		for state in &diff.states {
			assert_eq!(state.state_type, StateType::Update);
			match state.device.to_string().as_str() {
				"/alice" => {
					assert_eq!(state.seq, 1);
					assert_eq!(state.old_seq, Some(0));
				}
				"/bob" => {
					assert_eq!(state.seq, 4);
					assert_eq!(state.old_seq, Some(0));
				}
				other => panic!("unexpected device {}", other),
			}
		}

		// diff against origin covers the full state
		let full = log.find_state_differences(&Digest::ORIGIN, &new, false).unwrap();
		assert_eq!(full.states.len(), 2);
		assert!(full.states.iter().all(|s| s.old_seq.is_none()));

		// identical states yield an empty diff
		let none = log.find_state_differences(&new, &new, true).unwrap();
		assert!(none.is_empty());
	}

	#[test]
	fn test_find_state_differences_unknown_digest() {
		let tmp = TempDir::new().unwrap();
		let log = open_log(&tmp, "/alice");
		let known = log.remember_state().unwrap();
		let unknown = Digest::of(b"never remembered");
		assert!(log.find_state_differences(&unknown, &known, false).is_err());
	}
}

// vim: ts=4
