//! Fetch queue with bounded parallelism and durable tasks
//!
//! Keeps a queue of fetch tasks of which at most `parallel_fetches` run at
//! once. A task that stalls rotates its forwarding hint (locator, then
//! direct, then broadcast) and is re-queued after an exponentially growing
//! pause capped at 300 seconds. A completed task lingers in a 10-second
//! timed wait so duplicate late data cannot re-spawn it, then disappears.
//! Tasks are persisted on enqueue and removed on completion, so an
//! interrupted fetch resumes on the next run.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::error::{db_error, StorageError};
use crate::face::Face;
use crate::fetcher::{
	FetchOutcome, FetchStatus, Fetcher, FetcherConfig, FinishCallback, SegmentCallback,
};
use crate::logging::*;
use crate::name::Name;
use crate::scheduler::Scheduler;

pub const PRIORITY_NORMAL: i32 = 0;
pub const PRIORITY_HIGH: i32 = 1;

/// Longest pause between retry rounds of a stalled task
const MAX_RETRY_PAUSE_SECS: u64 = 300;

/// How long a completed task lingers before removal
const TIMED_WAIT_SECS: u64 = 10;

/// Resolves a device name to its current forwarding hint
pub type LocatorLookup = Arc<dyn Fn(&Name) -> Option<Name> + Send + Sync>;

/// Key: device wire + base-name wire. Value: serialized TaskRecord.
const TASKS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("fetch_tasks");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
	pub device: Name,
	pub base_name: Name,
	pub min_seq: u64,
	pub max_seq: u64,
	pub priority: i32,
}

fn task_key(device: &Name, base_name: &Name) -> Vec<u8> {
	let mut key = device.to_wire();
	key.extend_from_slice(&base_name.to_wire());
	key
}

/// Durable record of in-flight fetch tasks
pub struct FetchTaskDb {
	db: redb::Database,
}

impl FetchTaskDb {
	pub fn open(path: &Path) -> Result<Self, StorageError> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db = redb::Database::create(path).map_err(db_error)?;
		{
			let write_txn = db.begin_write().map_err(db_error)?;
			let _ = write_txn.open_table(TASKS_TABLE).map_err(db_error)?;
			write_txn.commit().map_err(db_error)?;
		}
		Ok(FetchTaskDb { db })
	}

	pub fn add_task(&self, record: &TaskRecord) -> Result<(), StorageError> {
		let key = task_key(&record.device, &record.base_name);
		let bytes = bincode::serialize(record)
			.map_err(|e| StorageError::Corrupted { message: e.to_string() })?;
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(TASKS_TABLE).map_err(db_error)?;
			table.insert(key.as_slice(), bytes.as_slice()).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	pub fn delete_task(&self, device: &Name, base_name: &Name) -> Result<(), StorageError> {
		let key = task_key(device, base_name);
		let write_txn = self.db.begin_write().map_err(db_error)?;
		{
			let mut table = write_txn.open_table(TASKS_TABLE).map_err(db_error)?;
			table.remove(key.as_slice()).map_err(db_error)?;
		}
		write_txn.commit().map_err(db_error)?;
		Ok(())
	}

	pub fn all_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
		let read_txn = self.db.begin_read().map_err(db_error)?;
		let table = read_txn.open_table(TASKS_TABLE).map_err(db_error)?;
		let mut tasks = Vec::new();
		let mut iter = table.iter().map_err(db_error)?;
		loop {
			match iter.next() {
				Some(Ok((_, value))) => {
					let record: TaskRecord =
						bincode::deserialize(value.value()).map_err(|e| {
							StorageError::Corrupted { message: format!("fetch task: {}", e) }
						})?;
					tasks.push(record);
				}
				Some(Err(e)) => return Err(db_error(e)),
				None => break,
			}
		}
		Ok(tasks)
	}
}

struct ManagerInner {
	queue: Vec<Arc<Fetcher>>,
	active: usize,
	handles: Vec<JoinHandle<()>>,
}

pub struct FetchManager {
	face: Arc<dyn Face>,
	locator: LocatorLookup,
	broadcast_hint: Name,
	max_parallel: usize,
	config: FetcherConfig,
	segment_callback: SegmentCallback,
	finish_callback: FinishCallback,
	task_db: Option<FetchTaskDb>,
	scheduler: Arc<Scheduler>,
	/// Distinguishes this manager's scheduler tags from its siblings'
	label: String,
	inner: Mutex<ManagerInner>,
	closed: AtomicBool,
	me: std::sync::Weak<FetchManager>,
}

impl FetchManager {
	pub fn new(
		face: Arc<dyn Face>,
		locator: LocatorLookup,
		broadcast_hint: Name,
		max_parallel: usize,
		config: FetcherConfig,
		segment_callback: SegmentCallback,
		finish_callback: FinishCallback,
		task_db: Option<FetchTaskDb>,
		scheduler: Arc<Scheduler>,
		label: &str,
	) -> Arc<Self> {
		Arc::new_cyclic(|me| FetchManager {
			face,
			locator,
			broadcast_hint,
			max_parallel,
			config,
			segment_callback,
			finish_callback,
			task_db,
			scheduler,
			label: label.to_string(),
			inner: Mutex::new(ManagerInner { queue: Vec::new(), active: 0, handles: Vec::new() }),
			closed: AtomicBool::new(false),
			me: me.clone(),
		})
	}

	/// Re-enqueue every task persisted by a previous run
	pub fn resume(&self) -> Result<usize, StorageError> {
		let tasks = match self.task_db.as_ref() {
			Some(db) => db.all_tasks()?,
			None => return Ok(0),
		};
		let count = tasks.len();
		for record in tasks {
			self.enqueue_internal(record, false);
		}
		if count > 0 {
			info!("[{}] resumed {} persisted fetch tasks", self.label, count);
		}
		Ok(count)
	}

	pub fn enqueue(
		&self,
		device: &Name,
		base_name: &Name,
		min_seq: u64,
		max_seq: u64,
		priority: i32,
	) {
		if min_seq > max_seq {
			return;
		}
		let record = TaskRecord {
			device: device.clone(),
			base_name: base_name.clone(),
			min_seq,
			max_seq,
			priority,
		};
		self.enqueue_internal(record, true);
	}

	/// Enqueue even when an identical task lingers in timed-wait; used when
	/// fetched content failed verification and must be pulled again.
	pub fn requeue(
		&self,
		device: &Name,
		base_name: &Name,
		min_seq: u64,
		max_seq: u64,
		priority: i32,
	) {
		{
			let mut inner = self.inner.lock().unwrap();
			inner.queue.retain(|f| {
				f.is_active() || f.device != *device || f.base_name != *base_name
			});
		}
		self.enqueue(device, base_name, min_seq, max_seq, priority);
	}

	fn enqueue_internal(&self, record: TaskRecord, persist: bool) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}

		{
			let inner = self.inner.lock().unwrap();
			let duplicate = inner.queue.iter().any(|f| {
				f.device == record.device
					&& f.base_name == record.base_name
					&& f.min_seq == record.min_seq
					&& f.max_seq == record.max_seq
			});
			if duplicate {
				return;
			}
		}

		if persist {
			if let Some(db) = self.task_db.as_ref() {
				if let Err(e) = db.add_task(&record) {
					error!("[{}] cannot persist fetch task: {}", self.label, e);
				}
			}
		}

		let hint = (self.locator)(&record.device).unwrap_or_else(Name::empty);
		let fetcher = Arc::new(Fetcher::new(
			record.device,
			record.base_name,
			record.min_seq,
			record.max_seq,
			hint,
			self.config,
		));

		trace!("[{}] ++++ enqueue fetcher: {}", self.label, fetcher.base_name);
		{
			let mut inner = self.inner.lock().unwrap();
			if record.priority == PRIORITY_HIGH {
				inner.queue.insert(0, fetcher);
			} else {
				inner.queue.push(fetcher);
			}
		}
		self.schedule_fetches();
	}

	/// Start queued tasks while below the parallelism bound; arrange a
	/// wake-up for the earliest delayed retry.
	fn schedule_fetches(&self) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		let now = Instant::now();
		let mut earliest_retry: Option<Instant> = None;

		let mut to_start: Vec<Arc<Fetcher>> = Vec::new();
		{
			let mut inner = self.inner.lock().unwrap();
			let mut available = self.max_parallel.saturating_sub(inner.active);
			for fetcher in inner.queue.iter() {
				if available == 0 {
					break;
				}
				if fetcher.is_active() || fetcher.is_timed_wait() {
					continue;
				}
				{
					let state = fetcher.state.lock().unwrap();
					if let Some(at) = state.next_retry_at {
						if at > now {
							earliest_retry =
								Some(earliest_retry.map_or(at, |cur: Instant| cur.min(at)));
							continue;
						}
					}
				}
				fetcher.state.lock().unwrap().status = FetchStatus::Active;
				to_start.push(Arc::clone(fetcher));
				available -= 1;
			}
			inner.active += to_start.len();
			inner.handles.retain(|h| !h.is_finished());
		}

		for fetcher in to_start {
			debug!("[{}] start fetching of {}", self.label, fetcher.base_name);
			let manager = match self.me.upgrade() {
				Some(manager) => manager,
				None => return,
			};
			let face = Arc::clone(&self.face);
			let segment_callback = Arc::clone(&self.segment_callback);
			let handle = tokio::spawn(async move {
				let outcome =
					Arc::clone(&fetcher).run(face, segment_callback).await;
				match outcome {
					FetchOutcome::Complete => manager.did_fetch_complete(&fetcher),
					FetchOutcome::Stalled => manager.did_no_data_timeout(&fetcher),
					FetchOutcome::Aborted => {
						let mut inner = manager.inner.lock().unwrap();
						inner.active = inner.active.saturating_sub(1);
					}
				}
			});
			self.inner.lock().unwrap().handles.push(handle);
		}

		if let Some(at) = earliest_retry {
			let manager = match self.me.upgrade() {
				Some(manager) => manager,
				None => return,
			};
			let tag = format!("schedule-fetches-{}", self.label);
			self.scheduler.schedule(&tag, at.saturating_duration_since(now), move || {
				manager.schedule_fetches();
			});
		}
	}

	fn did_fetch_complete(&self, fetcher: &Arc<Fetcher>) {
		{
			let mut inner = self.inner.lock().unwrap();
			inner.active = inner.active.saturating_sub(1);
			fetcher.state.lock().unwrap().status = FetchStatus::TimedWait;
		}
		if let Some(db) = self.task_db.as_ref() {
			if let Err(e) = db.delete_task(&fetcher.device, &fetcher.base_name) {
				error!("[{}] cannot delete fetch task: {}", self.label, e);
			}
		}

		(self.finish_callback)(&fetcher.device, &fetcher.base_name);

		// like TCP timed-wait: keep the entry around to absorb late data
		let manager = match self.me.upgrade() {
			Some(manager) => manager,
			None => return,
		};
		let target = Arc::clone(fetcher);
		let tag = format!("timed-wait-{}-{}", self.label, target.base_name);
		self.scheduler.schedule(&tag, Duration::from_secs(TIMED_WAIT_SECS), move || {
			trace!("[{}] +++++ removing fetcher: {}", manager.label, target.base_name);
			{
				let mut inner = manager.inner.lock().unwrap();
				inner.queue.retain(|f| !Arc::ptr_eq(f, &target));
			}
			manager.schedule_fetches();
		});
		self.schedule_fetches();
	}

	/// Persistent-failure path: rotate the forwarding hint and back off.
	/// Rotation order: locator, then direct (no hint), then broadcast, then
	/// locator again.
	fn did_no_data_timeout(&self, fetcher: &Arc<Fetcher>) {
		debug!(
			"[{}] no data timeout for {} with hint {}",
			self.label,
			fetcher.base_name,
			fetcher.forwarding_hint()
		);
		{
			let mut inner = self.inner.lock().unwrap();
			inner.active = inner.active.saturating_sub(1);
		}

		let current = fetcher.forwarding_hint();
		let next = if current.is_empty() {
			// direct failed, try broadcast
			self.broadcast_hint.clone()
		} else if current == self.broadcast_hint {
			// broadcast failed, back to the locator (or direct when unknown)
			match (self.locator)(&fetcher.device) {
				Some(locator) if !locator.is_empty() => locator,
				_ => Name::empty(),
			}
		} else {
			// locator failed, try direct
			Name::empty()
		};

		{
			let mut state = fetcher.state.lock().unwrap();
			state.forwarding_hint = next;
			state.status = FetchStatus::Queued;
			state.retry_pause_secs =
				(state.retry_pause_secs * 2).max(1).min(MAX_RETRY_PAUSE_SECS);
			state.next_retry_at =
				Some(Instant::now() + Duration::from_secs(state.retry_pause_secs));
		}
		self.schedule_fetches();
	}

	/// Pending (non-completed) tasks currently known to the manager
	pub fn queue_len(&self) -> usize {
		self.inner.lock().unwrap().queue.len()
	}

	/// Cancel everything; durable tasks stay on disk for the next run
	pub fn shutdown(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.scheduler.cancel(&format!("schedule-fetches-{}", self.label));
		let mut inner = self.inner.lock().unwrap();
		for handle in inner.handles.drain(..) {
			handle.abort();
		}
		inner.queue.clear();
		inner.active = 0;
	}
}


// vim: ts=4
