//! Materialized per-file view of the action log
//!
//! At most one live entry exists per filename; superseded and
//! conflict-losing entries move to an archive chain. Deletes keep a
//! tombstoned entry around so later updates can record their parent
//! pointer against it.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::digest::Digest;
use crate::error::{db_error, StorageError};
use crate::name::Name;

/// Key: filename. Value: serialized FileStateEntry (live or tombstoned).
const FILE_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("file_state");

/// Key: filename + 0x00 + device wire + seq (8 bytes BE). Value: entry.
const ARCHIVE_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("file_state_archive");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStateEntry {
	pub filename: String,
	pub device: Name,
	pub seq: u64,
	pub version: u64,
	pub timestamp: i64,
	pub file_hash: Option<Digest>,
	pub file_size: u64,
	pub mtime: i64,
	pub mode: u32,
	pub segment_count: u64,
	pub is_complete: bool,
	pub deleted: bool,
}

impl FileStateEntry {
	/// Total order used for last-writer-wins conflict resolution
	pub fn conflict_key(&self) -> (u64, i64, Vec<u8>) {
		(self.version, self.timestamp, self.device.to_wire())
	}
}

fn archive_key(filename: &str, device: &Name, seq: u64) -> Vec<u8> {
	let mut key = filename.as_bytes().to_vec();
	key.push(0);
	key.extend_from_slice(&device.to_wire());
	key.extend_from_slice(&seq.to_be_bytes());
	key
}

fn decode_entry(bytes: &[u8]) -> Result<FileStateEntry, StorageError> {
	bincode::deserialize(bytes)
		.map_err(|e| StorageError::Corrupted { message: format!("file state: {}", e) })
}

fn encode_entry(entry: &FileStateEntry) -> Result<Vec<u8>, StorageError> {
	bincode::serialize(entry).map_err(|e| StorageError::Corrupted { message: e.to_string() })
}

/// File-state tables, sharing the action log's database
pub struct FileState {
	db: Arc<redb::Database>,
}

impl FileState {
	pub fn new(db: Arc<redb::Database>) -> Result<Self, StorageError> {
		{
			let write_txn = db.begin_write().map_err(db_error)?;
			let _ = write_txn.open_table(FILE_STATE_TABLE).map_err(db_error)?;
			let _ = write_txn.open_table(ARCHIVE_TABLE).map_err(db_error)?;
			write_txn.commit().map_err(db_error)?;
		}
		Ok(FileState { db })
	}

	/// Current entry for a filename, tombstoned or not
	pub fn lookup(&self, filename: &str) -> Result<Option<FileStateEntry>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(FILE_STATE_TABLE).map_err(db_error)?;
		match table.get(filename).map_err(db_error)? {
			Some(value) => Ok(Some(decode_entry(value.value())?)),
			None => Ok(None),
		}
	}

	/// Current live (not tombstoned) entry for a filename
	pub fn lookup_live(&self, filename: &str) -> Result<Option<FileStateEntry>, StorageError> {
		Ok(self.lookup(filename)?.filter(|e| !e.deleted))
	}

	/// Replace the entry for `entry.filename`
	pub fn upsert(&self, entry: &FileStateEntry) -> Result<(), StorageError> {
		let bytes = encode_entry(entry)?;
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(FILE_STATE_TABLE).map_err(db_error)?;
			table.insert(entry.filename.as_str(), bytes.as_slice()).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	/// Move an entry onto the archive chain
	pub fn archive(&self, entry: &FileStateEntry) -> Result<(), StorageError> {
		let key = archive_key(&entry.filename, &entry.device, entry.seq);
		let bytes = encode_entry(entry)?;
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(ARCHIVE_TABLE).map_err(db_error)?;
			table.insert(key.as_slice(), bytes.as_slice()).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	pub fn set_complete(&self, filename: &str, complete: bool) -> Result<(), StorageError> {
		if let Some(mut entry) = self.lookup(filename)? {
			entry.is_complete = complete;
			self.upsert(&entry)?;
		}
		Ok(())
	}

	/// All live entries
	pub fn list_live(&self) -> Result<Vec<FileStateEntry>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(FILE_STATE_TABLE).map_err(db_error)?;
		let mut entries = Vec::new();
		let mut iter = table.iter().map_err(db_error)?;
		loop {
			match iter.next() {
				Some(Ok((_, value))) => {
					let entry = decode_entry(value.value())?;
					if !entry.deleted {
						entries.push(entry);
					}
				}
				Some(Err(e)) => return Err(db_error(e)),
				None => break,
			}
		}
		Ok(entries)
	}

	/// Archived entries for a filename (conflict losers and history)
	pub fn list_archived(&self, filename: &str) -> Result<Vec<FileStateEntry>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(ARCHIVE_TABLE).map_err(db_error)?;
		let mut prefix = filename.as_bytes().to_vec();
		prefix.push(0);
		let mut entries = Vec::new();
		let mut iter = table.iter().map_err(db_error)?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					if key.value().starts_with(&prefix) {
						entries.push(decode_entry(value.value())?);
					}
				}
				Some(Err(e)) => return Err(db_error(e)),
				None => break,
			}
		}
		Ok(entries)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn state(tmp: &TempDir) -> FileState {
		let db = Arc::new(redb::Database::create(tmp.path().join("state.db")).unwrap());
		FileState::new(db).unwrap()
	}

	fn entry(filename: &str, device: &str, seq: u64, version: u64) -> FileStateEntry {
		FileStateEntry {
			filename: filename.to_string(),
			device: Name::parse(device).unwrap(),
			seq,
			version,
			timestamp: 100,
			file_hash: Some(Digest::of(filename.as_bytes())),
			file_size: 10,
			mtime: 100,
			mode: 0o644,
			segment_count: 1,
			is_complete: false,
			deleted: false,
		}
	}

	#[test]
	fn test_upsert_and_lookup() {
		let tmp = TempDir::new().unwrap();
		let state = state(&tmp);

		assert!(state.lookup("a.txt").unwrap().is_none());
		state.upsert(&entry("a.txt", "/alice", 1, 1)).unwrap();
		let found = state.lookup_live("a.txt").unwrap().unwrap();
		assert_eq!(found.seq, 1);
		assert_eq!(found.version, 1);
	}

	#[test]
	fn test_tombstone_hides_from_live() {
		let tmp = TempDir::new().unwrap();
		let state = state(&tmp);

		state.upsert(&entry("a.txt", "/alice", 1, 1)).unwrap();
		let mut tomb = entry("a.txt", "/alice", 2, 2);
		tomb.deleted = true;
		state.upsert(&tomb).unwrap();

		assert!(state.lookup_live("a.txt").unwrap().is_none());
		// the tombstone is still visible for parent-pointer lookups
		let found = state.lookup("a.txt").unwrap().unwrap();
		assert!(found.deleted);
		assert_eq!(found.seq, 2);
	}

	#[test]
	fn test_update_revives_tombstone() {
		let tmp = TempDir::new().unwrap();
		let state = state(&tmp);

		let mut tomb = entry("a.txt", "/alice", 2, 2);
		tomb.deleted = true;
		state.upsert(&tomb).unwrap();
		state.upsert(&entry("a.txt", "/bob", 1, 3)).unwrap();

		let live = state.lookup_live("a.txt").unwrap().unwrap();
		assert_eq!(live.version, 3);
	}

	#[test]
	fn test_archive_chain() {
		let tmp = TempDir::new().unwrap();
		let state = state(&tmp);

		state.archive(&entry("a.txt", "/alice", 1, 1)).unwrap();
		state.archive(&entry("a.txt", "/bob", 1, 1)).unwrap();
		state.archive(&entry("aa.txt", "/alice", 2, 1)).unwrap();

		assert_eq!(state.list_archived("a.txt").unwrap().len(), 2);
		assert_eq!(state.list_archived("aa.txt").unwrap().len(), 1);
		assert_eq!(state.list_archived("other").unwrap().len(), 0);
	}

	#[test]
	fn test_set_complete() {
		let tmp = TempDir::new().unwrap();
		let state = state(&tmp);

		state.upsert(&entry("a.txt", "/alice", 1, 1)).unwrap();
		state.set_complete("a.txt", true).unwrap();
		assert!(state.lookup("a.txt").unwrap().unwrap().is_complete);
	}

	#[test]
	fn test_conflict_key_ordering() {
		let a = entry("f", "/alice", 1, 1);
		let b = entry("f", "/bob", 1, 1);
		// same version and timestamp: the lexicographically greater device wins
		assert!(b.conflict_key() > a.conflict_key());

		let newer = entry("f", "/alice", 2, 2);
		assert!(newer.conflict_key() > b.conflict_key());
	}

	#[test]
	fn test_list_live() {
		let tmp = TempDir::new().unwrap();
		let state = state(&tmp);

		state.upsert(&entry("a.txt", "/alice", 1, 1)).unwrap();
		let mut tomb = entry("b.txt", "/alice", 2, 1);
		tomb.deleted = true;
		state.upsert(&tomb).unwrap();

		let live = state.list_live().unwrap();
		assert_eq!(live.len(), 1);
		assert_eq!(live[0].filename, "a.txt");
	}
}

// vim: ts=4
