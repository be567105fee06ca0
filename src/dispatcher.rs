//! Wires the core components into one synchronized folder
//!
//! Owns the logs, the stores, the two fetch managers (actions at high
//! priority, file segments at normal), the content server and the sync
//! core, and routes events between them:
//!
//! - a local file event appends to the action log and bumps the sync state;
//! - a state diff from the sync core enqueues action fetches;
//! - a fetched action applies to the log, which triggers file fetches;
//! - completed file fetches assemble, verify and materialize the file.
//!
//! Entry points are called by an external watcher and by the network; both
//! hand real work to spawned jobs and return quickly.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::UNIX_EPOCH;

use crate::action_log::{ActionLog, ActionSubscriber};
use crate::config::Config;
use crate::content_server::ContentServer;
use crate::digest::Digest;
use crate::error::{StorageError, SyncError};
use crate::face::Face;
use crate::fetch_manager::{FetchManager, FetchTaskDb, PRIORITY_HIGH, PRIORITY_NORMAL};
use crate::fetcher::FetcherConfig;
use crate::file_state::FileStateEntry;
use crate::logging::*;
use crate::name::Name;
use crate::object_store::ObjectStore;
use crate::scheduler::Scheduler;
use crate::signer::Signer;
use crate::sync_core::SyncCore;
use crate::sync_log::SyncLog;
use crate::util::now_secs;
use crate::wire::{StateType, SyncStateMsg};

const TMP_SUFFIX: &str = ".namesync-tmp";

type LateInner = Arc<RwLock<Option<Arc<DispatcherInner>>>>;

/// The assembled core for one shared folder
pub struct Dispatcher {
	inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
	config: Config,
	root_dir: PathBuf,
	local_name: Name,
	scheduler: Arc<Scheduler>,
	sync_log: Arc<SyncLog>,
	action_log: Arc<ActionLog>,
	object_store: Arc<ObjectStore>,
	content_server: Arc<ContentServer>,
	core: Arc<SyncCore>,
	action_fetcher: Arc<FetchManager>,
	file_fetcher: Arc<FetchManager>,
	exclude: GlobSet,
}

struct DispatcherSubscriber {
	inner: Weak<DispatcherInner>,
}

impl ActionSubscriber for DispatcherSubscriber {
	fn on_file_added_or_changed(
		&self,
		filename: &str,
		device: &Name,
		seq: u64,
		_hash: &Digest,
		_mtime: i64,
		_mode: u32,
		_segment_count: u64,
	) {
		let inner = match self.inner.upgrade() {
			Some(inner) => inner,
			None => return,
		};
		let filename = filename.to_string();
		let device = device.clone();
		tokio::spawn(async move {
			inner.handle_file_changed(&filename, &device, seq);
		});
	}

	fn on_file_removed(&self, filename: &str) {
		let inner = match self.inner.upgrade() {
			Some(inner) => inner,
			None => return,
		};
		let filename = filename.to_string();
		tokio::spawn(async move {
			inner.handle_file_removed(&filename);
		});
	}

	fn on_conflict(&self, filename: &str, winner: &Name, loser: &Name) {
		info!("conflict on {}: {} wins over {}", filename, winner, loser);
	}
}

impl Dispatcher {
	pub fn new(
		config: Config,
		root_dir: &Path,
		face: Arc<dyn Face>,
		signer: Arc<dyn Signer>,
	) -> Result<Self, SyncError> {
		config.validate()?;
		fs::create_dir_all(config.state_dir(root_dir)).map_err(StorageError::Io)?;

		let mut exclude_builder = GlobSetBuilder::new();
		for pattern in &config.exclude_patterns {
			let glob = Glob::new(pattern).map_err(|e| SyncError::InvalidConfig {
				message: format!("bad exclude pattern {}: {}", pattern, e),
			})?;
			exclude_builder.add(glob);
		}
		let exclude = exclude_builder.build().map_err(|e| SyncError::InvalidConfig {
			message: format!("bad exclude set: {}", e),
		})?;

		let local_name = config.device();
		let scheduler = Scheduler::new();
		let sync_log =
			Arc::new(SyncLog::open(&config.sync_log_path(root_dir), local_name.clone())?);
		let action_log = Arc::new(ActionLog::open(
			&config.action_log_path(root_dir),
			Arc::clone(&sync_log),
			&config.shared_folder,
			&config.app_name,
			config.freshness_secs,
			Arc::clone(&signer),
		)?);
		let object_store = Arc::new(ObjectStore::new(config.objects_dir(root_dir)));

		let fetcher_config = FetcherConfig {
			window_cap: config.pipeline_window,
			interest_lifetime: std::time::Duration::from_millis(config.interest_lifetime_ms),
			max_no_activity: std::time::Duration::from_secs(config.max_no_activity_secs),
		};
		let locator_log = Arc::clone(&sync_log);
		let locator = Arc::new(move |device: &Name| {
			locator_log.lookup_locator(device).ok().and_then(|l| l)
		});

		// callbacks that need the assembled dispatcher bind to it later
		let late: LateInner = Arc::new(RwLock::new(None));

		// fetched actions go straight into the action log
		let remote_log = Arc::clone(&action_log);
		let action_segment = Arc::new(
			move |device: &Name, _base: &Name, seq: u64, data: crate::wire::DataPacket| {
				match remote_log.add_remote(device, seq, &data.content) {
					Ok(item) => {
						trace!("applied remote action {}/{}: {}", device, seq, item.filename)
					}
					Err(SyncError::Decode(e)) => {
						// adversarial or stale packet: drop it
						warn!("undecodable action {}/{}: {}", device, seq, e);
					}
					Err(e) => error!("cannot apply remote action {}/{}: {}", device, seq, e),
				}
			},
		);
		let action_finish = Arc::new(move |device: &Name, base: &Name| {
			trace!("action fetch finished: {} under {}", device, base);
		});

		// fetched segments land in the object store; the base name carries
		// the hash as its last component
		let segment_store = Arc::clone(&object_store);
		let file_segment = Arc::new(
			move |device: &Name, base: &Name, seq: u64, data: crate::wire::DataPacket| {
				let hash = match base.get_back(0).and_then(|b| Digest::from_bytes(b).ok()) {
					Some(hash) => hash,
					None => {
						warn!("file fetch base without hash: {}", base);
						return;
					}
				};
				if let Err(e) = segment_store.put(&hash, device, seq, &data.content) {
					error!("cannot store segment {} of {}: {}", seq, hash.short(), e);
				}
			},
		);
		let finish_late = Arc::clone(&late);
		let file_finish = Arc::new(move |device: &Name, base: &Name| {
			let inner = finish_late.read().unwrap().clone();
			if let Some(inner) = inner {
				let device = device.clone();
				let base = base.clone();
				tokio::spawn(async move {
					inner.handle_file_fetch_complete(&device, &base);
				});
			}
		});

		let action_fetcher = FetchManager::new(
			Arc::clone(&face),
			locator.clone(),
			config.broadcast_hint_name(),
			config.parallel_fetches,
			fetcher_config,
			action_segment,
			action_finish,
			Some(FetchTaskDb::open(&config.fetch_task_path(root_dir))?),
			Arc::clone(&scheduler),
			"actions",
		);
		let file_fetcher = FetchManager::new(
			Arc::clone(&face),
			locator,
			config.broadcast_hint_name(),
			config.parallel_fetches,
			fetcher_config,
			file_segment,
			file_finish,
			Some(FetchTaskDb::open(
				&config.state_dir(root_dir).join("fetch-task-files.db"),
			)?),
			Arc::clone(&scheduler),
			"files",
		);

		let content_server = ContentServer::new(
			Arc::clone(&face),
			Arc::clone(&action_log),
			Arc::clone(&object_store),
			Arc::clone(&scheduler),
			local_name.clone(),
			&config.shared_folder,
			&config.app_name,
			config.freshness_secs,
			Arc::clone(&signer),
		);
		content_server.register_prefix(&local_name);
		content_server.register_prefix(&config.broadcast_hint_name());
		let local_locator = config.locator_name();
		if !local_locator.is_empty() {
			content_server.register_prefix(&local_locator);
		}

		let core = SyncCore::new(
			Arc::clone(&face),
			Arc::clone(&sync_log),
			Arc::clone(&scheduler),
			config.sync_prefix_name(),
			if local_locator.is_empty() { None } else { Some(local_locator) },
			config.sync_interval_secs(),
			config.freshness_secs,
		)?;

		// a state diff becomes one action-fetch range per updated device
		let fetcher_for_states = Arc::clone(&action_fetcher);
		let app_name = config.app_name.clone();
		let shared_folder = config.shared_folder.clone();
		core.set_state_callback(Arc::new(move |msg: SyncStateMsg| {
			for state in &msg.states {
				if state.state_type != StateType::Update {
					continue;
				}
				let old_seq = state.old_seq.unwrap_or(0);
				if state.seq <= old_seq {
					continue;
				}
				let base = state
					.device
					.clone()
					.push_str(&app_name)
					.push_str("action")
					.push_str(&shared_folder);
				fetcher_for_states.enqueue(
					&state.device,
					&base,
					old_seq + 1,
					state.seq,
					PRIORITY_HIGH,
				);
			}
		}));

		let inner = Arc::new(DispatcherInner {
			config,
			root_dir: root_dir.to_path_buf(),
			local_name,
			scheduler,
			sync_log,
			action_log,
			object_store,
			content_server,
			core,
			action_fetcher,
			file_fetcher,
			exclude,
		});
		*late.write().unwrap() = Some(Arc::clone(&inner));
		inner
			.action_log
			.set_subscriber(Arc::new(DispatcherSubscriber { inner: Arc::downgrade(&inner) }));

		// resume fetches interrupted by the previous run
		inner.action_fetcher.resume()?;
		inner.file_fetcher.resume()?;

		info!("dispatcher up for {} as {}", root_dir.display(), inner.local_name);
		Ok(Dispatcher { inner })
	}

	/// Watcher entry point: a file under the shared folder was created or
	/// modified.
	pub fn local_file_changed(&self, relative_path: &str) -> Result<(), SyncError> {
		self.inner.local_file_changed(relative_path)
	}

	/// Watcher entry point: a file under the shared folder disappeared.
	pub fn local_file_deleted(&self, relative_path: &str) -> Result<(), SyncError> {
		self.inner.local_file_deleted(relative_path)
	}

	/// Current root digest (test and status surface)
	pub fn sync_root(&self) -> Digest {
		self.inner.core.root()
	}

	pub fn action_log(&self) -> &Arc<ActionLog> {
		&self.inner.action_log
	}

	pub fn sync_log(&self) -> &Arc<SyncLog> {
		&self.inner.sync_log
	}

	pub fn object_store(&self) -> &Arc<ObjectStore> {
		&self.inner.object_store
	}

	pub fn shutdown(&self) {
		self.inner.core.shutdown();
		self.inner.content_server.shutdown();
		self.inner.action_fetcher.shutdown();
		self.inner.file_fetcher.shutdown();
		self.inner.scheduler.shutdown();
	}
}

impl DispatcherInner {
	fn is_excluded(&self, relative_path: &str) -> bool {
		self.exclude.is_match(relative_path)
	}

	fn local_file_changed(&self, relative_path: &str) -> Result<(), SyncError> {
		if self.is_excluded(relative_path) {
			return Ok(());
		}
		let absolute = self.root_dir.join(relative_path);
		let metadata = fs::metadata(&absolute).map_err(StorageError::Io)?;

		let (hash, segment_count, file_size) =
			self.object_store.import_file(&absolute, &self.local_name)?;

		// unchanged content is not a new action
		if let Some(current) = self.action_log.file_state().lookup_live(relative_path)? {
			if current.file_hash == Some(hash) && current.device == self.local_name {
				trace!("{} unchanged, skipping", relative_path);
				return Ok(());
			}
		}

		let mtime = metadata
			.modified()
			.ok()
			.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
			.map(|d| d.as_secs() as i64)
			.unwrap_or_else(now_secs);
		let mode = file_mode(&metadata);

		let (seq, _item) = self.action_log.add_local_update(
			relative_path,
			hash,
			file_size,
			mtime,
			mode,
			segment_count,
		)?;
		self.core.update_local_state(seq);
		Ok(())
	}

	fn local_file_deleted(&self, relative_path: &str) -> Result<(), SyncError> {
		if self.is_excluded(relative_path) {
			return Ok(());
		}
		if let Some((seq, _item)) = self.action_log.add_local_delete(relative_path)? {
			self.core.update_local_state(seq);
		}
		Ok(())
	}

	/// A remote action landed: fetch its content unless we already hold it
	fn handle_file_changed(&self, filename: &str, device: &Name, _seq: u64) {
		if device == &self.local_name {
			return;
		}
		let entry = match self.action_log.file_state().lookup_live(filename) {
			Ok(Some(entry)) => entry,
			Ok(None) => return,
			Err(e) => {
				error!("file state lookup failed for {}: {}", filename, e);
				return;
			}
		};
		let hash = match entry.file_hash {
			Some(hash) => hash,
			None => return,
		};

		match self.object_store.is_complete(&hash, &entry.device, entry.segment_count) {
			Ok(true) => self.materialize(&entry),
			Ok(false) => {
				let base = entry
					.device
					.clone()
					.push_str(&self.config.app_name)
					.push_str("file")
					.push(hash.as_bytes());
				self.file_fetcher.enqueue(
					&entry.device,
					&base,
					0,
					entry.segment_count.saturating_sub(1),
					PRIORITY_NORMAL,
				);
			}
			Err(e) => error!("completeness check failed for {}: {}", hash.short(), e),
		}
	}

	fn handle_file_removed(&self, filename: &str) {
		let path = self.root_dir.join(filename);
		match fs::remove_file(&path) {
			Ok(()) => info!("removed {}", filename),
			Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => warn!("cannot remove {}: {}", filename, e),
		}
	}

	/// All segments of one hash arrived: materialize every file that
	/// currently references it
	fn handle_file_fetch_complete(&self, _device: &Name, base: &Name) {
		let hash = match base.get_back(0).and_then(|b| Digest::from_bytes(b).ok()) {
			Some(hash) => hash,
			None => return,
		};
		let entries = match self.action_log.file_state().list_live() {
			Ok(entries) => entries,
			Err(e) => {
				error!("file state listing failed: {}", e);
				return;
			}
		};
		for entry in entries {
			if entry.file_hash == Some(hash) && !entry.is_complete {
				self.materialize(&entry);
			}
		}
	}

	/// Assemble from the object store into a temp file, verify, stamp
	/// metadata and move into place. An integrity failure marks the entry
	/// incomplete and re-enqueues the fetch.
	fn materialize(&self, entry: &FileStateEntry) {
		let hash = match entry.file_hash {
			Some(hash) => hash,
			None => return,
		};
		// the entry may have been superseded or tombstoned while the fetch ran
		match self.action_log.file_state().lookup_live(&entry.filename) {
			Ok(Some(current)) if current.file_hash == Some(hash) => {}
			_ => return,
		}
		let final_path = self.root_dir.join(&entry.filename);
		let tmp_path = self.root_dir.join(format!("{}{}", entry.filename, TMP_SUFFIX));

		if let Some(parent) = final_path.parent() {
			if let Err(e) = fs::create_dir_all(parent) {
				error!("cannot create {}: {}", parent.display(), e);
				return;
			}
		}

		match self.object_store.assemble(&hash, &entry.device, entry.segment_count, &tmp_path)
		{
			Ok(()) => {}
			Err(SyncError::IntegrityMismatch { expected, actual }) => {
				warn!(
					"integrity failure on {}: expected {}, got {}; refetching",
					entry.filename, expected, actual
				);
				let _ = fs::remove_file(&tmp_path);
				if let Err(e) =
					self.action_log.file_state().set_complete(&entry.filename, false)
				{
					error!("cannot mark {} incomplete: {}", entry.filename, e);
				}
				let base = entry
					.device
					.clone()
					.push_str(&self.config.app_name)
					.push_str("file")
					.push(hash.as_bytes());
				self.file_fetcher.requeue(
					&entry.device,
					&base,
					0,
					entry.segment_count.saturating_sub(1),
					PRIORITY_NORMAL,
				);
				return;
			}
			Err(e) => {
				error!("cannot assemble {}: {}", entry.filename, e);
				let _ = fs::remove_file(&tmp_path);
				return;
			}
		}

		set_file_mode(&tmp_path, entry.mode);
		let _ = filetime::set_file_mtime(
			&tmp_path,
			filetime::FileTime::from_unix_time(entry.mtime, 0),
		);
		if let Err(e) = fs::rename(&tmp_path, &final_path) {
			error!("cannot move {} into place: {}", entry.filename, e);
			let _ = fs::remove_file(&tmp_path);
			return;
		}
		if let Err(e) = self.action_log.file_state().set_complete(&entry.filename, true) {
			error!("cannot mark {} complete: {}", entry.filename, e);
		}
		info!("materialized {} ({} segments)", entry.filename, entry.segment_count);
	}
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
	use std::os::unix::fs::PermissionsExt;
	metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
	0o644
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) {
	use std::os::unix::fs::PermissionsExt;
	let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) {}

// vim: ts=4
