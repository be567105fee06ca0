//! Serves actions and file segments to the network
//!
//! Registers forwarding-hint prefixes and answers
//! `<hint>/<device>/<app>/{action|file}/...` interests from the action log
//! and the object store. Serving runs on a single worker task fed by a
//! bounded channel, so the network callback never blocks; a full queue
//! drops the interest and relies on the requester's retry. Misses are
//! silently dropped for the same reason. The server also owns the periodic
//! sweep of the object store's open-handle cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::action_log::ActionLog;
use crate::digest::Digest;
use crate::face::Face;
use crate::logging::*;
use crate::name::Name;
use crate::object_store::{ObjectStore, HANDLE_TTL_SECS};
use crate::scheduler::Scheduler;
use crate::signer::Signer;
use crate::wire::DataPacket;

const SERVE_QUEUE_DEPTH: usize = 128;
const SWEEP_TAG: &str = "flush-stale-db-cache";

struct ServeJob {
	/// Hint under which the interest arrived; empty for direct
	hint: Name,
	/// Interest with the hint stripped
	name: Name,
	/// Full interest name, echoed on the reply
	interest: Name,
}

pub struct ContentServer {
	face: Arc<dyn Face>,
	action_log: Arc<ActionLog>,
	object_store: Arc<ObjectStore>,
	scheduler: Arc<Scheduler>,
	local_device: Name,
	shared_folder: String,
	app_name: String,
	freshness_secs: u64,
	signer: Arc<dyn Signer>,
	tx: mpsc::Sender<ServeJob>,
	registered: Mutex<Vec<Name>>,
	worker: Mutex<Option<JoinHandle<()>>>,
	me: std::sync::Weak<ContentServer>,
}

impl ContentServer {
	pub fn new(
		face: Arc<dyn Face>,
		action_log: Arc<ActionLog>,
		object_store: Arc<ObjectStore>,
		scheduler: Arc<Scheduler>,
		local_device: Name,
		shared_folder: &str,
		app_name: &str,
		freshness_secs: u64,
		signer: Arc<dyn Signer>,
	) -> Arc<Self> {
		let (tx, mut rx) = mpsc::channel::<ServeJob>(SERVE_QUEUE_DEPTH);
		let server = Arc::new_cyclic(|me| ContentServer {
			face,
			action_log,
			object_store,
			scheduler,
			local_device,
			shared_folder: shared_folder.to_string(),
			app_name: app_name.to_string(),
			freshness_secs,
			signer,
			tx,
			registered: Mutex::new(Vec::new()),
			worker: Mutex::new(None),
			me: me.clone(),
		});

		let worker = Arc::clone(&server);
		let handle = tokio::spawn(async move {
			while let Some(job) = rx.recv().await {
				worker.serve(job);
			}
		});
		*server.worker.lock().unwrap() = Some(handle);

		server.schedule_sweep();
		server
	}

	/// Listen for interests under a forwarding hint (empty = direct names)
	pub fn register_prefix(&self, forwarding_hint: &Name) {
		debug!(">> content server: register {}", forwarding_hint);
		let server = match self.me.upgrade() {
			Some(server) => server,
			None => return,
		};
		let hint = forwarding_hint.clone();
		self.face.register_prefix(
			forwarding_hint,
			Arc::new(move |interest: Name| {
				server.filter_and_serve(&hint, interest);
			}),
		);
		self.registered.lock().unwrap().push(forwarding_hint.clone());
	}

	fn filter_and_serve(&self, forwarding_hint: &Name, interest: Name) {
		// when the hint prefixes our own device name the interest may really
		// be a direct name; try it both ways
		if !forwarding_hint.is_empty() && self.local_device.starts_with(forwarding_hint) {
			self.submit(ServeJob {
				hint: Name::empty(),
				name: interest.clone(),
				interest: interest.clone(),
			});
		}
		if let Some(name) = interest.strip_prefix(forwarding_hint) {
			self.submit(ServeJob { hint: forwarding_hint.clone(), name, interest });
		}
	}

	fn submit(&self, job: ServeJob) {
		if let Err(e) = self.tx.try_send(job) {
			warn!("serve queue full, dropping interest: {}", e);
		}
	}

	fn serve(&self, job: ServeJob) {
		let name = &job.name;
		if name.len() < 5 || name.get_back(3) != Some(self.app_name.as_bytes()) {
			return;
		}
		match name.get_back(2) {
			Some(b"file") => self.serve_file(&job),
			Some(b"action") => {
				if name.get_back(1) == Some(self.shared_folder.as_bytes()) {
					self.serve_action(&job);
				}
			}
			_ => {}
		}
	}

	/// `<device>/<app>/action/<folder>/<seq>`: reply with the verbatim
	/// signed action bytes
	fn serve_action(&self, job: &ServeJob) {
		let (device, seq) = match self.action_log.parse_action_name(&job.name) {
			Ok(parsed) => parsed,
			Err(e) => {
				debug!("unparsable action interest {}: {}", job.interest, e);
				return;
			}
		};
		debug!("serving ACTION for {} seq {}", device, seq);

		let bytes = match self.action_log.lookup_action_data(&device, seq) {
			Ok(Some(bytes)) => bytes,
			Ok(None) => {
				trace!("no action {} / {}", device, seq);
				return;
			}
			Err(e) => {
				error!("action lookup failed: {}", e);
				return;
			}
		};
		let packet = match DataPacket::decode(&bytes) {
			Ok(packet) => packet,
			Err(e) => {
				error!("stored action does not decode: {}", e);
				return;
			}
		};

		if job.hint.is_empty() {
			// the stored packet is already named and signed for direct serving
			self.face.publish(packet);
		} else {
			let mut reply = packet;
			reply.name = job.interest.clone();
			reply.freshness_secs = self.freshness_secs;
			self.signer.sign(&mut reply);
			self.face.publish(reply);
		}
	}

	/// `<device>/<app>/file/<hash>/<segment>`: reply with segment bytes
	/// from the object store
	fn serve_file(&self, job: &ServeJob) {
		let name = &job.name;
		let segment = match name.number_at_back(0) {
			Ok(segment) => segment,
			Err(e) => {
				debug!("unparsable file interest {}: {}", job.interest, e);
				return;
			}
		};
		let hash = match name.get_back(1).and_then(|h| Digest::from_bytes(h).ok()) {
			Some(hash) => hash,
			None => {
				debug!("bad hash component in {}", job.interest);
				return;
			}
		};
		let device = name.sub_name(0, name.len() - 4);
		trace!("serving FILE {} segment {} for {}", hash.short(), segment, device);

		match self.object_store.get(&hash, &device, segment) {
			Ok(Some(bytes)) => {
				let mut reply =
					DataPacket::new(job.interest.clone(), bytes, self.freshness_secs);
				self.signer.sign(&mut reply);
				self.face.publish(reply);
			}
			Ok(None) => {
				trace!("no segment {} of {} for {}", segment, hash.short(), device);
			}
			Err(e) => {
				error!("segment lookup failed: {}", e);
			}
		}
	}

	fn schedule_sweep(&self) {
		let server = match self.me.upgrade() {
			Some(server) => server,
			None => return,
		};
		self.scheduler.schedule(
			SWEEP_TAG,
			Duration::from_secs(HANDLE_TTL_SECS),
			move || {
				server.object_store.evict_idle(Duration::from_secs(HANDLE_TTL_SECS));
				server.schedule_sweep();
			},
		);
	}

	pub fn shutdown(&self) {
		self.scheduler.cancel(SWEEP_TAG);
		for prefix in self.registered.lock().unwrap().drain(..) {
			self.face.unregister_prefix(&prefix);
		}
		if let Some(handle) = self.worker.lock().unwrap().take() {
			handle.abort();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::face::MemoryBus;
	use crate::signer::NullSigner;
	use crate::sync_log::SyncLog;
	use tempfile::TempDir;

	fn setup(tmp: &TempDir, bus: &Arc<MemoryBus>) -> (Arc<ContentServer>, Arc<ActionLog>, Arc<ObjectStore>) {
		let local = Name::parse("/alice/laptop").unwrap();
		let sync_log = Arc::new(
			SyncLog::open(&tmp.path().join("sync-log.db"), local.clone()).unwrap(),
		);
		let action_log = Arc::new(
			ActionLog::open(
				&tmp.path().join("action-log.db"),
				sync_log,
				"shared",
				"namesync",
				2,
				Arc::new(NullSigner),
			)
			.unwrap(),
		);
		let object_store = Arc::new(ObjectStore::new(tmp.path().join("objects")));
		let face: Arc<dyn Face> = bus.face();
		let server = ContentServer::new(
			face,
			Arc::clone(&action_log),
			Arc::clone(&object_store),
			Scheduler::new(),
			local,
			"shared",
			"namesync",
			2,
			Arc::new(NullSigner),
		);
		(server, action_log, object_store)
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_serves_action_verbatim() {
		let tmp = TempDir::new().unwrap();
		let bus = MemoryBus::new();
		let (server, action_log, _) = setup(&tmp, &bus);

		let (seq, _) = action_log
			.add_local_update("a.txt", Digest::of(b"x"), 1, 0, 0o644, 1)
			.unwrap();
		let device = Name::parse("/alice/laptop").unwrap();
		let stored = action_log.lookup_action_data(&device, seq).unwrap().unwrap();

		server.register_prefix(&device);

		let consumer = bus.face();
		let name = action_log.action_name(&device, seq);
		let data = consumer
			.express_interest(&name, Duration::from_millis(500))
			.await
			.unwrap();
		// direct serving republishes the stored packet byte-identically
		assert_eq!(data.encode(), stored);
		server.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_serves_action_under_hint() {
		let tmp = TempDir::new().unwrap();
		let bus = MemoryBus::new();
		let (server, action_log, _) = setup(&tmp, &bus);

		let (seq, _) = action_log
			.add_local_update("a.txt", Digest::of(b"x"), 1, 0, 0o644, 1)
			.unwrap();
		let device = Name::parse("/alice/laptop").unwrap();
		let hint = Name::parse("/hub").unwrap();
		server.register_prefix(&hint);

		let consumer = bus.face();
		let name = hint.join(&action_log.action_name(&device, seq));
		let data = consumer
			.express_interest(&name, Duration::from_millis(500))
			.await
			.unwrap();
		// the reply echoes the hinted interest name
		assert_eq!(data.name, name);
		server.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_serves_file_segment() {
		let tmp = TempDir::new().unwrap();
		let bus = MemoryBus::new();
		let (server, _, object_store) = setup(&tmp, &bus);

		let device = Name::parse("/alice/laptop").unwrap();
		let hash = Digest::of(b"content");
		object_store.put(&hash, &device, 3, b"segment three").unwrap();

		server.register_prefix(&device);

		let consumer = bus.face();
		let name = device
			.clone()
			.push_str("namesync")
			.push_str("file")
			.push(hash.as_bytes())
			.push_number(3);
		let data = consumer
			.express_interest(&name, Duration::from_millis(500))
			.await
			.unwrap();
		assert_eq!(data.content, b"segment three");
		server.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_missing_content_is_silently_dropped() {
		let tmp = TempDir::new().unwrap();
		let bus = MemoryBus::new();
		let (server, _, _) = setup(&tmp, &bus);

		let device = Name::parse("/alice/laptop").unwrap();
		server.register_prefix(&device);

		let consumer = bus.face();
		let name = device.clone().push_str("namesync").push_str("action").push_str("shared").push_number(99);
		let result = consumer.express_interest(&name, Duration::from_millis(200)).await;
		assert!(result.is_err());
		server.shutdown();
	}

	#[tokio::test(flavor = "multi_thread")]
	async fn test_foreign_app_names_are_ignored() {
		let tmp = TempDir::new().unwrap();
		let bus = MemoryBus::new();
		let (server, _, _) = setup(&tmp, &bus);

		let device = Name::parse("/alice/laptop").unwrap();
		server.register_prefix(&device);

		let consumer = bus.face();
		let name = device.clone().push_str("otherapp").push_str("action").push_str("shared").push_number(1);
		let result = consumer.express_interest(&name, Duration::from_millis(200)).await;
		assert!(result.is_err());
		server.shutdown();
	}
}

// vim: ts=4
