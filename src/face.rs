//! Network face abstraction
//!
//! The core talks to the network through the `Face` trait: register a prefix
//! and get incoming interests, express an interest and wait for data or a
//! timeout, publish a data packet. `MemoryBus` provides an in-process
//! implementation connecting any number of faces, with a content store that
//! honors data freshness; it backs the test topologies and the
//! single-process demo mode.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::FaceError;
use crate::logging::*;
use crate::name::Name;
use crate::wire::DataPacket;

/// Incoming-interest callback. Must not block: hand real work to an executor.
pub type InterestHandler = Arc<dyn Fn(Name) + Send + Sync>;

#[async_trait]
pub trait Face: Send + Sync {
	/// Register a prefix; the handler is invoked for every interest whose
	/// name starts with `prefix`.
	fn register_prefix(&self, prefix: &Name, handler: InterestHandler);

	/// Remove a registration added by this face for `prefix`.
	fn unregister_prefix(&self, prefix: &Name);

	/// Express an interest and wait for matching data within `lifetime`.
	async fn express_interest(
		&self,
		name: &Name,
		lifetime: Duration,
	) -> Result<DataPacket, FaceError>;

	/// Publish a data packet, satisfying pending interests for its name.
	fn publish(&self, data: DataPacket);
}

struct Registration {
	face_id: u64,
	prefix: Name,
	handler: InterestHandler,
}

struct StoredData {
	packet: DataPacket,
	expires: Instant,
}

#[derive(Default)]
struct BusState {
	registrations: Vec<Registration>,
	pending: HashMap<Name, Vec<oneshot::Sender<DataPacket>>>,
	store: HashMap<Name, StoredData>,
	closed: bool,
}

/// In-process message bus connecting `MemoryFace`s
pub struct MemoryBus {
	state: Mutex<BusState>,
	next_face_id: AtomicU64,
	me: Weak<MemoryBus>,
}

impl MemoryBus {
	pub fn new() -> Arc<Self> {
		Arc::new_cyclic(|me| MemoryBus {
			state: Mutex::new(BusState::default()),
			next_face_id: AtomicU64::new(1),
			me: me.clone(),
		})
	}

	pub fn face(&self) -> Arc<MemoryFace> {
		let id = self.next_face_id.fetch_add(1, Ordering::SeqCst);
		Arc::new(MemoryFace { bus: self.me.clone(), face_id: id })
	}

	/// Close the bus: pending interests fail, further expressions fail
	pub fn shutdown(&self) {
		let mut state = self.state.lock().unwrap();
		state.closed = true;
		state.pending.clear();
		state.registrations.clear();
	}

	fn prune(state: &mut BusState) {
		let now = Instant::now();
		state.store.retain(|_, d| d.expires > now);
		for senders in state.pending.values_mut() {
			senders.retain(|tx| !tx.is_closed());
		}
		state.pending.retain(|_, senders| !senders.is_empty());
	}
}

/// One participant's attachment to a `MemoryBus`
pub struct MemoryFace {
	bus: Weak<MemoryBus>,
	face_id: u64,
}

#[async_trait]
impl Face for MemoryFace {
	fn register_prefix(&self, prefix: &Name, handler: InterestHandler) {
		let bus = match self.bus.upgrade() {
			Some(bus) => bus,
			None => return,
		};
		let mut state = bus.state.lock().unwrap();
		if state.closed {
			return;
		}
		trace!("face {} registers prefix {}", self.face_id, prefix);
		state.registrations.push(Registration {
			face_id: self.face_id,
			prefix: prefix.clone(),
			handler,
		});
	}

	fn unregister_prefix(&self, prefix: &Name) {
		let bus = match self.bus.upgrade() {
			Some(bus) => bus,
			None => return,
		};
		let mut state = bus.state.lock().unwrap();
		let face_id = self.face_id;
		state.registrations.retain(|r| !(r.face_id == face_id && &r.prefix == prefix));
	}

	async fn express_interest(
		&self,
		name: &Name,
		lifetime: Duration,
	) -> Result<DataPacket, FaceError> {
		let bus = match self.bus.upgrade() {
			Some(bus) => bus,
			None => return Err(FaceError::Closed),
		};
		let (rx, handlers) = {
			let mut state = bus.state.lock().unwrap();
			if state.closed {
				return Err(FaceError::Closed);
			}
			MemoryBus::prune(&mut state);

			if let Some(stored) = state.store.get(name) {
				return Ok(stored.packet.clone());
			}

			let (tx, rx) = oneshot::channel();
			state.pending.entry(name.clone()).or_insert_with(Vec::new).push(tx);

			let handlers: Vec<InterestHandler> = state
				.registrations
				.iter()
				.filter(|r| name.starts_with(&r.prefix))
				.map(|r| Arc::clone(&r.handler))
				.collect();
			(rx, handlers)
		};

		// invoke handlers outside the bus lock; they enqueue work and return
		for handler in handlers {
			handler(name.clone());
		}

		match tokio::time::timeout(lifetime, rx).await {
			Ok(Ok(data)) => Ok(data),
			Ok(Err(_)) => Err(FaceError::Closed),
			Err(_) => Err(FaceError::Timeout),
		}
	}

	fn publish(&self, data: DataPacket) {
		let bus = match self.bus.upgrade() {
			Some(bus) => bus,
			None => return,
		};
		let mut state = bus.state.lock().unwrap();
		if state.closed {
			return;
		}
		MemoryBus::prune(&mut state);

		if let Some(senders) = state.pending.remove(&data.name) {
			for tx in senders {
				let _ = tx.send(data.clone());
			}
		}

		if data.freshness_secs > 0 {
			let expires = Instant::now() + Duration::from_secs(data.freshness_secs);
			state.store.insert(data.name.clone(), StoredData { packet: data, expires });
		}
	}
}


// vim: ts=4
