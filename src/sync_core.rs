//! Set-reconciliation protocol
//!
//! Peers compare root digests over their sync-node sets. A sync interest
//! names the sender's current root; whoever recognizes that digest as an
//! older state replies with the diff to its own state. An unrecognized
//! digest triggers a recovery interest after a randomized wait (so that of
//! many confused peers only one asks), answered with the full state. All
//! replies are gzip-compressed state messages. Periodic sync interests keep
//! the exchange alive; every data-driven event reschedules rather than
//! stacks them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::digest::Digest;
use crate::face::Face;
use crate::logging::*;
use crate::name::Name;
use crate::scheduler::Scheduler;
use crate::sync_log::SyncLog;
use crate::util::now_nanos;
use crate::wire::{StateType, SyncStateMsg};
use crate::wire::DataPacket;

const RECOVER: &str = "RECOVER";

/// Base wait before sending a recovery interest, in milliseconds
const WAIT_MS: u64 = 50;

/// The randomized wait spans [WAIT, WAIT * (1 + RANDOM_PERCENT)]
const RANDOM_PERCENT: f64 = 0.5;

const SYNC_INTEREST_TAG: &str = "send-sync-interest";
const LOCAL_STATE_DELAYED_TAG: &str = "local-state-changed";

/// Receives the effective state diff after remote updates are absorbed;
/// the owning layer turns it into fetches from `old_seq + 1` to `seq`.
pub type StateMsgCallback = Arc<dyn Fn(SyncStateMsg) + Send + Sync>;

pub struct SyncCore {
	face: Arc<dyn Face>,
	log: Arc<SyncLog>,
	scheduler: Arc<Scheduler>,
	sync_prefix: Name,
	root: Mutex<Digest>,
	state_callback: RwLock<Option<StateMsgCallback>>,
	interval: Duration,
	freshness_secs: u64,
	closed: AtomicBool,
	me: std::sync::Weak<SyncCore>,
}

impl SyncCore {
	pub fn new(
		face: Arc<dyn Face>,
		log: Arc<SyncLog>,
		scheduler: Arc<Scheduler>,
		sync_prefix: Name,
		local_locator: Option<Name>,
		interval_secs: u64,
		freshness_secs: u64,
	) -> Result<Arc<Self>, crate::error::SyncError> {
		let root = log.remember_state()?;
		if let Some(ref locator) = local_locator {
			log.update_local_locator(locator)?;
		}

		let core = Arc::new_cyclic(|me| SyncCore {
			face,
			log,
			scheduler,
			sync_prefix,
			root: Mutex::new(root),
			state_callback: RwLock::new(None),
			interval: Duration::from_secs(interval_secs),
			freshness_secs,
			closed: AtomicBool::new(false),
			me: me.clone(),
		});

		let handler = Arc::clone(&core);
		core.face.register_prefix(
			&core.sync_prefix,
			Arc::new(move |interest: Name| {
				let core = Arc::clone(&handler);
				tokio::spawn(async move {
					core.handle_interest(interest);
				});
			}),
		);

		// first sync interest goes out almost immediately
		core.schedule_sync_interest(Duration::from_millis(100));
		Ok(core)
	}

	pub fn set_state_callback(&self, callback: StateMsgCallback) {
		*self.state_callback.write().unwrap() = Some(callback);
	}

	/// Current root digest
	pub fn root(&self) -> Digest {
		*self.root.lock().unwrap()
	}

	/// Called by the action log's owner after a local append: bump our seq,
	/// publish the diff under the previous root and refresh the sync
	/// interest schedule.
	pub fn update_local_state(&self, seq: u64) {
		if let Err(e) = self.log.update_device_seq(&self.log.local_name().clone(), seq) {
			error!("cannot record local seq {}: {}", seq, e);
			return;
		}
		self.local_state_changed();
	}

	/// Coalescing variant: many calls within half a second fold into one
	pub fn update_local_state_delayed(&self, seq: u64) {
		if let Err(e) = self.log.update_device_seq(&self.log.local_name().clone(), seq) {
			error!("cannot record local seq {}: {}", seq, e);
			return;
		}
		let core = match self.me.upgrade() {
			Some(core) => core,
			None => return,
		};
		self.scheduler.schedule(
			LOCAL_STATE_DELAYED_TAG,
			Duration::from_millis(500),
			move || {
				core.local_state_changed();
			},
		);
	}

	fn local_state_changed(&self) {
		let (old_root, new_root) = {
			let mut root = self.root.lock().unwrap();
			let old = *root;
			match self.log.remember_state() {
				Ok(new) => {
					*root = new;
					(old, new)
				}
				Err(e) => {
					error!("remember_state failed: {}", e);
					return;
				}
			}
		};

		if old_root != new_root {
			// answer the sync interests currently outstanding for our old root
			match self.log.find_state_differences(&old_root, &new_root, false) {
				Ok(diff) => {
					let name = self.sync_prefix.clone().push(old_root.as_bytes());
					let mut packet =
						DataPacket::new(name, diff.encode_gzip(), self.freshness_secs);
					packet.signature = None;
					self.face.publish(packet);
					debug!(
						"[{}] local state changed: {} -> {}",
						self.log.local_name(),
						old_root.short(),
						new_root.short()
					);
				}
				Err(e) => error!("cannot diff {} -> {}: {}", old_root, new_root, e),
			}
		}

		// no hurry for the next sync interest; receivers learn the new root
		// from the data we just published
		self.schedule_sync_interest(Duration::from_millis(50));
	}

	fn schedule_sync_interest(&self, delay: Duration) {
		let core = match self.me.upgrade() {
			Some(core) => core,
			None => return,
		};
		self.scheduler.schedule(SYNC_INTEREST_TAG, delay, move || {
			core.send_sync_interest();
		});
	}

	fn send_sync_interest(&self) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		let root = self.root();
		let name = self.sync_prefix.clone().push(root.as_bytes());
		debug!("[{}] >>> SYNC interest for {}", self.log.local_name(), root.short());

		let core = match self.me.upgrade() {
			Some(core) => core,
			None => return,
		};
		let lifetime = self.interval;
		tokio::spawn(async move {
			match core.face.express_interest(&name, lifetime).await {
				Ok(data) => core.handle_state_data(&data.content),
				Err(_) => {
					// timeouts are normal; the periodic schedule resends
				}
			}
		});
		self.schedule_sync_interest(self.interval);
	}

	fn handle_interest(&self, interest: Name) {
		if self.closed.load(Ordering::SeqCst) {
			return;
		}
		let prefix_len = self.sync_prefix.len();
		if interest.len() == prefix_len + 1 {
			self.handle_sync_interest(interest);
		} else if interest.len() == prefix_len + 2
			&& interest.get(prefix_len) == Some(RECOVER.as_bytes())
		{
			self.handle_recover_interest(interest);
		}
	}

	fn handle_sync_interest(&self, interest: Name) {
		let digest = match interest.get_back(0).and_then(|b| Digest::from_bytes(b).ok()) {
			Some(digest) => digest,
			None => return,
		};
		let root = self.root();
		if digest == root {
			// in sync; nothing to do
			return;
		}

		match self.log.lookup_sync_log(&digest) {
			Ok(Some(_)) => {
				// we know strictly more: reply with the difference
				match self.log.find_state_differences(&digest, &root, false) {
					Ok(diff) => {
						trace!(
							"[{}] sync reply {} -> {}",
							self.log.local_name(),
							digest.short(),
							root.short()
						);
						let packet = DataPacket::new(
							interest,
							diff.encode_gzip(),
							self.freshness_secs,
						);
						self.face.publish(packet);
					}
					Err(e) => error!("cannot diff for sync reply: {}", e),
				}
			}
			Ok(None) => {
				// unknown digest: recover after a randomized wait unless we
				// learn it in the meantime
				let wait = self.recovery_wait(&digest);
				trace!(
					"[{}] unknown digest {}, recovery in {:?}",
					self.log.local_name(),
					digest.short(),
					wait
				);
				let core = match self.me.upgrade() {
					Some(core) => core,
					None => return,
				};
				let tag = format!("recover-{}", digest.to_hex());
				self.scheduler.schedule(&tag, wait, move || {
					core.recover(digest);
				});
			}
			Err(e) => error!("sync log lookup failed: {}", e),
		}
	}

	/// Randomized wait in [WAIT, WAIT * (1 + RANDOM_PERCENT)]; the jitter is
	/// derived by hashing so no RNG state is needed
	fn recovery_wait(&self, digest: &Digest) -> Duration {
		let mut hasher = blake3::Hasher::new();
		hasher.update(&self.log.local_name().to_wire());
		hasher.update(digest.as_bytes());
		hasher.update(&now_nanos().to_le_bytes());
		let bytes = hasher.finalize();
		let mut raw = [0u8; 8];
		raw.copy_from_slice(&bytes.as_bytes()[..8]);
		let span = (WAIT_MS as f64 * RANDOM_PERCENT) as u64;
		let jitter = u64::from_le_bytes(raw) % (span + 1);
		Duration::from_millis(WAIT_MS + jitter)
	}

	fn recover(&self, digest: Digest) {
		if digest == self.root() {
			return;
		}
		match self.log.lookup_sync_log(&digest) {
			Ok(Some(_)) => {
				// learned it while waiting; no recovery needed
			}
			Ok(None) => {
				let name = self
					.sync_prefix
					.clone()
					.push_str(RECOVER)
					.push(digest.as_bytes());
				debug!(
					"[{}] >>> RECOVER interest for {}",
					self.log.local_name(),
					digest.short()
				);
				let core = match self.me.upgrade() {
					Some(core) => core,
					None => return,
				};
				let lifetime = self.interval;
				tokio::spawn(async move {
					match core.face.express_interest(&name, lifetime).await {
						Ok(data) => core.handle_state_data(&data.content),
						Err(_) => {
							// not re-expressed; the next sync interest will
							// trigger recovery again if the gap persists
						}
					}
				});
			}
			Err(e) => error!("sync log lookup failed: {}", e),
		}
	}

	fn handle_recover_interest(&self, interest: Name) {
		let digest = match interest.get_back(0).and_then(|b| Digest::from_bytes(b).ok()) {
			Some(digest) => digest,
			None => return,
		};
		match self.log.lookup_sync_log(&digest) {
			Ok(Some(_)) => {
				// we know the hash: reply with everything we know
				let root = self.root();
				match self.log.find_state_differences(&Digest::ORIGIN, &root, false) {
					Ok(diff) => {
						debug!(
							"[{}] recovery reply for {}",
							self.log.local_name(),
							digest.short()
						);
						let packet = DataPacket::new(
							interest,
							diff.encode_gzip(),
							self.freshness_secs,
						);
						self.face.publish(packet);
					}
					Err(e) => error!("cannot diff for recovery reply: {}", e),
				}
			}
			Ok(None) => {
				// we do not recognize the digest; we cannot help
			}
			Err(e) => error!("sync log lookup failed: {}", e),
		}
	}

	fn handle_state_data(&self, content: &[u8]) {
		let msg = match SyncStateMsg::decode_gzip(content) {
			Ok(msg) => msg,
			Err(e) => {
				// misformed replies are dropped; the protocol assumes stale
				// and adversarial inputs
				error!("misformed sync data: {}", e);
				return;
			}
		};

		for state in &msg.states {
			match state.state_type {
				StateType::Update => {
					if let Err(e) = self.log.update_device_seq(&state.device, state.seq) {
						error!("cannot update seq for {}: {}", state.device, e);
						continue;
					}
					if let Some(ref locator) = state.locator {
						if let Err(e) = self.log.update_locator(&state.device, locator) {
							error!("cannot update locator for {}: {}", state.device, e);
						}
					}
				}
				StateType::Delete => {
					// peer deregistration is acknowledged but unimplemented
					warn!("ignoring SYNC DELETE for {}", state.device);
				}
			}
		}

		// remember the absorbed state and surface the effective difference
		let (old_root, new_root) = {
			let mut root = self.root.lock().unwrap();
			let old = *root;
			match self.log.remember_state() {
				Ok(new) => {
					*root = new;
					(old, new)
				}
				Err(e) => {
					error!("remember_state failed: {}", e);
					return;
				}
			}
		};

		if old_root != new_root {
			match self.log.find_state_differences(&old_root, &new_root, true) {
				Ok(diff) => {
					if !diff.is_empty() {
						let callback = self.state_callback.read().unwrap().clone();
						if let Some(callback) = callback {
							callback(diff);
						}
					}
				}
				Err(e) => error!("cannot diff absorbed state: {}", e),
			}
		}

		self.schedule_sync_interest(Duration::from_millis(0));
	}

	pub fn shutdown(&self) {
		self.closed.store(true, Ordering::SeqCst);
		self.scheduler.cancel(SYNC_INTEREST_TAG);
		self.scheduler.cancel(LOCAL_STATE_DELAYED_TAG);
		self.face.unregister_prefix(&self.sync_prefix);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::face::MemoryBus;
	use std::time::Instant;
	use tempfile::TempDir;

	fn core_on(
		bus: &Arc<MemoryBus>,
		tmp: &TempDir,
		local: &str,
	) -> (Arc<SyncCore>, Arc<SyncLog>) {
		let log = Arc::new(
			SyncLog::open(
				&tmp.path().join(format!("sync-log-{}.db", local.replace('/', "_"))),
				Name::parse(local).unwrap(),
			)
			.unwrap(),
		);
		let face: Arc<dyn Face> = bus.face();
		let core = SyncCore::new(
			face,
			Arc::clone(&log),
			Scheduler::new(),
			Name::parse("/broadcast/namesync/sync").unwrap(),
			None,
			1,
			2,
		)
		.unwrap();
		(core, log)
	}

	async fn wait_until<F: Fn() -> bool>(cond: F, timeout_ms: u64) -> bool {
		let deadline = Instant::now() + Duration::from_millis(timeout_ms);
		while Instant::now() < deadline {
			if cond() {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
		cond()
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_two_peers_converge_on_local_change() {
		let bus = MemoryBus::new();
		let tmp = TempDir::new().unwrap();
		let (core_a, log_a) = core_on(&bus, &tmp, "/alice");
		let (core_b, log_b) = core_on(&bus, &tmp, "/bob");

		// alice appends three actions
		for seq in 1..=3 {
			log_a.next_local_seq().unwrap();
			core_a.update_local_state(seq);
		}

		// bob learns alice's seq and both roots agree
		let alice = Name::parse("/alice").unwrap();
		assert!(
			wait_until(|| log_b.seq_no(&alice).unwrap() == 3, 10000).await,
			"bob never learned alice's seq"
		);
		assert!(wait_until(|| core_a.root() == core_b.root(), 10000).await);

		core_a.shutdown();
		core_b.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_state_callback_reports_fetch_ranges() {
		let bus = MemoryBus::new();
		let tmp = TempDir::new().unwrap();
		let (core_a, log_a) = core_on(&bus, &tmp, "/alice");
		let (core_b, _log_b) = core_on(&bus, &tmp, "/bob");

		let seen: Arc<Mutex<Vec<(String, u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		core_b.set_state_callback(Arc::new(move |msg: SyncStateMsg| {
			let mut seen = sink.lock().unwrap();
			for state in msg.states {
				seen.push((
					state.device.to_string(),
					state.old_seq.unwrap_or(0),
					state.seq,
				));
			}
		}));

		for seq in 1..=2 {
			log_a.next_local_seq().unwrap();
			core_a.update_local_state(seq);
		}

		assert!(
			wait_until(
				|| seen.lock().unwrap().iter().any(|(d, _, s)| d == "/alice" && *s == 2),
				10000
			)
			.await
		);
		// the callback carried old seq for the fetch range
		let entries = seen.lock().unwrap();
		let last = entries.iter().filter(|(d, _, _)| d == "/alice").last().unwrap();
		assert!(last.1 < last.2);

		core_a.shutdown();
		core_b.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_third_peer_recovers_full_state() {
		let bus = MemoryBus::new();
		let tmp = TempDir::new().unwrap();
		let (core_a, log_a) = core_on(&bus, &tmp, "/alice");
		let (core_b, log_b) = core_on(&bus, &tmp, "/bob");

		for seq in 1..=2 {
			log_a.next_local_seq().unwrap();
			core_a.update_local_state(seq);
		}
		let alice = Name::parse("/alice").unwrap();
		assert!(wait_until(|| log_b.seq_no(&alice).unwrap() == 2, 10000).await);

		// carol joins late with empty state; her sync interest carries an
		// unknown digest, so recovery brings her the union
		let (core_c, log_c) = core_on(&bus, &tmp, "/carol");
		assert!(
			wait_until(|| log_c.seq_no(&alice).unwrap() == 2, 10000).await,
			"carol never recovered alice's state"
		);
		assert!(wait_until(
			|| log_c.seq_no(&Name::parse("/bob").unwrap()).unwrap() == 0
				&& core_c.root() == core_a.root(),
			10000
		)
		.await);

		core_a.shutdown();
		core_b.shutdown();
		core_c.shutdown();
	}

	#[test]
	fn test_recovery_wait_is_within_bounds() {
		// direct check of the jitter window without any network
		let tmp = TempDir::new().unwrap();
		let log = Arc::new(
			SyncLog::open(&tmp.path().join("s.db"), Name::parse("/x").unwrap()).unwrap(),
		);
		let rt = tokio::runtime::Runtime::new().unwrap();
		let _guard = rt.enter();
		let bus = MemoryBus::new();
		let face: Arc<dyn Face> = bus.face();
		let core = SyncCore::new(
			face,
			log,
			Scheduler::new(),
			Name::parse("/sync").unwrap(),
			None,
			1,
			2,
		)
		.unwrap();

		for i in 0..32u32 {
			let digest = Digest::of(&i.to_le_bytes());
			let wait = core.recovery_wait(&digest);
			assert!(wait >= Duration::from_millis(WAIT_MS));
			assert!(wait <= Duration::from_millis(WAIT_MS + (WAIT_MS as f64 * RANDOM_PERCENT) as u64));
		}
		core.shutdown();
	}
}

// vim: ts=4
