//! Content-addressed segment storage
//!
//! Each content hash gets its own small database under
//! `objects/<hh>/<rest>`, mapping `(origin_device, segment)` to segment
//! bytes. A hash is complete when all segments `0..segment_count` are stored
//! for some device. Open handles are cached in memory and evicted after 60
//! seconds of idleness by a periodic sweep; opening thousands of per-hash
//! databases would otherwise dominate serving cost.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::SEGMENT_SIZE;
use crate::digest::Digest;
use crate::error::{db_error, StorageError, SyncError};
use crate::logging::*;
use crate::name::Name;

/// Idle time after which a cached handle is closed
pub const HANDLE_TTL_SECS: u64 = 60;

/// Key: wire-encoded origin device followed by the segment index (8 bytes BE)
/// Value: raw segment bytes
const SEGMENTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("segments");

fn segment_key(device: &Name, segment: u64) -> Vec<u8> {
	let mut key = device.to_wire();
	key.extend_from_slice(&segment.to_be_bytes());
	key
}

fn db_path(objects_dir: &Path, hash_hex: &str) -> PathBuf {
	objects_dir.join(&hash_hex[..2]).join(&hash_hex[2..])
}

/// Open handle to one per-hash database
pub struct ObjectDb {
	db: redb::Database,
	last_used: Mutex<Instant>,
}

impl ObjectDb {
	fn open(objects_dir: &Path, hash_hex: &str) -> Result<Self, StorageError> {
		let path = db_path(objects_dir, hash_hex);
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}
		let db = redb::Database::create(&path).map_err(db_error)?;
		{
			let write_txn = db.begin_write().map_err(db_error)?;
			let _ = write_txn.open_table(SEGMENTS_TABLE).map_err(db_error)?;
			write_txn.commit().map_err(db_error)?;
		}
		Ok(ObjectDb { db, last_used: Mutex::new(Instant::now()) })
	}

	fn touch(&self) {
		*self.last_used.lock().unwrap() = Instant::now();
	}

	pub fn idle_for(&self) -> Duration {
		self.last_used.lock().unwrap().elapsed()
	}

	/// Store one segment. Idempotent: re-storing the same key overwrites
	/// with identical content.
	pub fn put(&self, device: &Name, segment: u64, bytes: &[u8]) -> Result<(), StorageError> {
		let key = segment_key(device, segment);
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(SEGMENTS_TABLE).map_err(db_error)?;
			table.insert(key.as_slice(), bytes).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		self.touch();
		Ok(())
	}

	pub fn get(&self, device: &Name, segment: u64) -> Result<Option<Vec<u8>>, StorageError> {
		let key = segment_key(device, segment);
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(SEGMENTS_TABLE).map_err(db_error)?;
		let value = table.get(key.as_slice()).map_err(db_error)?.map(|v| v.value().to_vec());
		self.touch();
		Ok(value)
	}

	/// True when all segments `0..segment_count` are stored for `device`
	pub fn is_complete(&self, device: &Name, segment_count: u64) -> Result<bool, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(SEGMENTS_TABLE).map_err(db_error)?;
		for segment in 0..segment_count {
			let key = segment_key(device, segment);
			if table.get(key.as_slice()).map_err(db_error)?.is_none() {
				return Ok(false);
			}
		}
		Ok(true)
	}
}

/// The store: per-hash databases plus the in-memory handle cache
pub struct ObjectStore {
	objects_dir: PathBuf,
	cache: Mutex<HashMap<String, Arc<ObjectDb>>>,
}

impl ObjectStore {
	pub fn new(objects_dir: PathBuf) -> Self {
		ObjectStore { objects_dir, cache: Mutex::new(HashMap::new()) }
	}

	/// Whether a database for `hash` exists on disk
	pub fn exists(&self, hash: &Digest) -> bool {
		db_path(&self.objects_dir, &hash.to_hex()).exists()
	}

	/// Cached handle for `hash`, opening (and caching) it if needed
	pub fn open(&self, hash: &Digest) -> Result<Arc<ObjectDb>, StorageError> {
		let hex = hash.to_hex();
		let mut cache = self.cache.lock().unwrap();
		if let Some(db) = cache.get(&hex) {
			return Ok(Arc::clone(db));
		}
		let db = Arc::new(ObjectDb::open(&self.objects_dir, &hex)?);
		cache.insert(hex, Arc::clone(&db));
		Ok(db)
	}

	pub fn put(
		&self,
		hash: &Digest,
		device: &Name,
		segment: u64,
		bytes: &[u8],
	) -> Result<(), StorageError> {
		self.open(hash)?.put(device, segment, bytes)
	}

	pub fn get(
		&self,
		hash: &Digest,
		device: &Name,
		segment: u64,
	) -> Result<Option<Vec<u8>>, StorageError> {
		if !self.exists(hash) {
			return Ok(None);
		}
		self.open(hash)?.get(device, segment)
	}

	pub fn is_complete(
		&self,
		hash: &Digest,
		device: &Name,
		segment_count: u64,
	) -> Result<bool, StorageError> {
		if segment_count > 0 && !self.exists(hash) {
			return Ok(false);
		}
		if segment_count == 0 {
			return Ok(true);
		}
		self.open(hash)?.is_complete(device, segment_count)
	}

	/// Stream segments `0..segment_count` to `destination`, verifying that
	/// the assembled content hashes to `hash`.
	pub fn assemble(
		&self,
		hash: &Digest,
		device: &Name,
		segment_count: u64,
		destination: &Path,
	) -> Result<(), SyncError> {
		let mut out = fs::File::create(destination).map_err(StorageError::Io)?;
		let mut hasher = blake3::Hasher::new();

		if segment_count > 0 {
			let db = self.open(hash)?;
			for segment in 0..segment_count {
				let bytes = db.get(device, segment)?.ok_or_else(|| {
					StorageError::Missing {
						what: format!("segment {} of {}", segment, hash.short()),
					}
				})?;
				hasher.update(&bytes);
				out.write_all(&bytes).map_err(StorageError::Io)?;
			}
		}
		out.flush().map_err(StorageError::Io)?;

		let actual = Digest::from_bytes(hasher.finalize().as_bytes()).expect("blake3 is 32 bytes");
		if &actual != hash {
			return Err(SyncError::IntegrityMismatch {
				expected: hash.to_hex(),
				actual: actual.to_hex(),
			});
		}
		Ok(())
	}

	/// Split a local file into fixed-size segments stored under `device`.
	/// Returns the content hash, the segment count and the file size.
	pub fn import_file(
		&self,
		path: &Path,
		device: &Name,
	) -> Result<(Digest, u64, u64), SyncError> {
		// first pass: hash
		let mut hasher = blake3::Hasher::new();
		let mut size: u64 = 0;
		{
			let mut f = fs::File::open(path).map_err(StorageError::Io)?;
			let mut buf = vec![0u8; SEGMENT_SIZE];
			loop {
				let n = f.read(&mut buf).map_err(StorageError::Io)?;
				if n == 0 {
					break;
				}
				hasher.update(&buf[..n]);
				size += n as u64;
			}
		}
		let hash = Digest::from_bytes(hasher.finalize().as_bytes()).expect("blake3 is 32 bytes");

		// second pass: store segments
		let db = self.open(&hash)?;
		let mut f = fs::File::open(path).map_err(StorageError::Io)?;
		let mut buf = vec![0u8; SEGMENT_SIZE];
		let mut segment: u64 = 0;
		loop {
			let n = f.read(&mut buf).map_err(StorageError::Io)?;
			if n == 0 {
				break;
			}
			db.put(device, segment, &buf[..n])?;
			segment += 1;
		}

		debug!("imported {} as {} ({} segments)", path.display(), hash.short(), segment);
		Ok((hash, segment, size))
	}

	/// Close handles idle for at least `ttl`
	pub fn evict_idle(&self, ttl: Duration) {
		let mut cache = self.cache.lock().unwrap();
		let before = cache.len();
		cache.retain(|_, db| db.idle_for() < ttl);
		let evicted = before - cache.len();
		if evicted > 0 {
			debug!("evicted {} idle object handles", evicted);
		}
	}

	pub fn cached_handles(&self) -> usize {
		self.cache.lock().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	fn store(tmp: &TempDir) -> ObjectStore {
		ObjectStore::new(tmp.path().join("objects"))
	}

	fn device() -> Name {
		Name::parse("/alice/laptop").unwrap()
	}

	#[test]
	fn test_put_get_round_trip() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		let hash = Digest::of(b"whatever");

		store.put(&hash, &device(), 0, b"segment zero").unwrap();
		assert_eq!(store.get(&hash, &device(), 0).unwrap().unwrap(), b"segment zero");
		assert_eq!(store.get(&hash, &device(), 1).unwrap(), None);
	}

	#[test]
	fn test_put_is_idempotent() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		let hash = Digest::of(b"x");

		store.put(&hash, &device(), 0, b"data").unwrap();
		store.put(&hash, &device(), 0, b"data").unwrap();
		assert_eq!(store.get(&hash, &device(), 0).unwrap().unwrap(), b"data");
	}

	#[test]
	fn test_get_missing_hash_is_none() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		assert_eq!(store.get(&Digest::of(b"nope"), &device(), 0).unwrap(), None);
		// probing must not create a database on disk
		assert!(!store.exists(&Digest::of(b"nope")));
	}

	#[test]
	fn test_completeness() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		let hash = Digest::of(b"abc");

		store.put(&hash, &device(), 0, b"a").unwrap();
		store.put(&hash, &device(), 2, b"c").unwrap();
		assert!(!store.is_complete(&hash, &device(), 3).unwrap());

		store.put(&hash, &device(), 1, b"b").unwrap();
		assert!(store.is_complete(&hash, &device(), 3).unwrap());
	}

	#[test]
	fn test_import_and_assemble_matches_hash() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);

		let src = tmp.path().join("input.bin");
		let content: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
		fs::write(&src, &content).unwrap();

		let (hash, segments, size) = store.import_file(&src, &device()).unwrap();
		assert_eq!(segments, 4);
		assert_eq!(size, 4096);
		assert_eq!(hash, Digest::of(&content));
		assert!(store.is_complete(&hash, &device(), segments).unwrap());

		let dest = tmp.path().join("output.bin");
		store.assemble(&hash, &device(), segments, &dest).unwrap();
		assert_eq!(fs::read(&dest).unwrap(), content);
	}

	#[test]
	fn test_import_empty_file() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);

		let src = tmp.path().join("empty");
		fs::write(&src, b"").unwrap();
		let (hash, segments, size) = store.import_file(&src, &device()).unwrap();
		assert_eq!(segments, 0);
		assert_eq!(size, 0);
		assert!(store.is_complete(&hash, &device(), 0).unwrap());

		let dest = tmp.path().join("empty.out");
		store.assemble(&hash, &device(), 0, &dest).unwrap();
		assert_eq!(fs::read(&dest).unwrap(), b"");
	}

	#[test]
	fn test_assemble_detects_corruption() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		let hash = Digest::of(b"expected content");

		store.put(&hash, &device(), 0, b"tampered content").unwrap();
		let err = store.assemble(&hash, &device(), 1, &tmp.path().join("out")).unwrap_err();
		assert!(matches!(err, SyncError::IntegrityMismatch { .. }));
	}

	#[test]
	fn test_assemble_incomplete_fails() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		let hash = Digest::of(b"partial");

		store.put(&hash, &device(), 0, b"only segment zero").unwrap();
		let err = store.assemble(&hash, &device(), 2, &tmp.path().join("out")).unwrap_err();
		assert!(matches!(err, SyncError::Storage(StorageError::Missing { .. })));
	}

	#[test]
	fn test_handle_cache_eviction() {
		let tmp = TempDir::new().unwrap();
		let store = store(&tmp);
		let hash = Digest::of(b"cached");

		store.put(&hash, &device(), 0, b"x").unwrap();
		assert_eq!(store.cached_handles(), 1);

		// nothing is idle long enough yet
		store.evict_idle(Duration::from_secs(60));
		assert_eq!(store.cached_handles(), 1);

		// zero TTL evicts everything
		store.evict_idle(Duration::from_millis(0));
		assert_eq!(store.cached_handles(), 0);

		// data survives eviction
		assert_eq!(store.get(&hash, &device(), 0).unwrap().unwrap(), b"x");
	}
}

// vim: ts=4
