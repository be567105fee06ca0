//! Single pipelined fetch over a sequence range
//!
//! A fetcher pulls `<hint>/<base_name>/<seq>` for every seq in
//! `[min_seq, max_seq]`, keeping a bounded window of outstanding interests.
//! The window grows by one per received segment up to a cap and halves on
//! loss. Segments may arrive out of order; the segment callback fires once
//! per segment. When no data at all arrives within the no-activity period
//! the fetcher reports a stall and the manager decides on hint rotation and
//! retry pause.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::FaceError;
use crate::face::Face;
use crate::logging::*;
use crate::name::Name;
use crate::wire::DataPacket;

/// Invoked once per received segment, in network-arrival order
pub type SegmentCallback = Arc<dyn Fn(&Name, &Name, u64, DataPacket) + Send + Sync>;

/// Invoked exactly once when a task completes its whole range
pub type FinishCallback = Arc<dyn Fn(&Name, &Name) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct FetcherConfig {
	/// Cap on outstanding interests per task
	pub window_cap: usize,

	/// Lifetime of each expressed interest
	pub interest_lifetime: Duration,

	/// No data for this long means the task is stalled
	pub max_no_activity: Duration,
}

impl Default for FetcherConfig {
	fn default() -> Self {
		FetcherConfig {
			window_cap: 6,
			interest_lifetime: Duration::from_secs(4),
			max_no_activity: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
	Queued,
	Active,
	TimedWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
	Complete,
	Stalled,
	Aborted,
}

pub(crate) struct FetcherState {
	pub status: FetchStatus,
	pub forwarding_hint: Name,
	pub retry_pause_secs: u64,
	pub next_retry_at: Option<Instant>,
}

/// One fetch task: the durable range plus in-memory pipeline state
pub struct Fetcher {
	pub device: Name,
	pub base_name: Name,
	pub min_seq: u64,
	pub max_seq: u64,
	pub(crate) state: Mutex<FetcherState>,
	/// Segments already delivered to the callback; survives stall cycles
	seen: Mutex<BTreeSet<u64>>,
	config: FetcherConfig,
}

type SegmentFuture = Pin<Box<dyn Future<Output = (u64, Result<DataPacket, FaceError>)> + Send>>;

impl Fetcher {
	pub fn new(
		device: Name,
		base_name: Name,
		min_seq: u64,
		max_seq: u64,
		forwarding_hint: Name,
		config: FetcherConfig,
	) -> Self {
		Fetcher {
			device,
			base_name,
			min_seq,
			max_seq,
			state: Mutex::new(FetcherState {
				status: FetchStatus::Queued,
				forwarding_hint,
				retry_pause_secs: 0,
				next_retry_at: None,
			}),
			seen: Mutex::new(BTreeSet::new()),
			config,
		}
	}

	pub fn is_active(&self) -> bool {
		self.state.lock().unwrap().status == FetchStatus::Active
	}

	pub fn is_timed_wait(&self) -> bool {
		self.state.lock().unwrap().status == FetchStatus::TimedWait
	}

	pub fn forwarding_hint(&self) -> Name {
		self.state.lock().unwrap().forwarding_hint.clone()
	}

	pub fn set_forwarding_hint(&self, hint: Name) {
		self.state.lock().unwrap().forwarding_hint = hint;
	}

	pub fn segments_received(&self) -> usize {
		self.seen.lock().unwrap().len()
	}

	fn total_segments(&self) -> u64 {
		self.max_seq - self.min_seq + 1
	}

	fn missing_segments(&self) -> Vec<u64> {
		let seen = self.seen.lock().unwrap();
		(self.min_seq..=self.max_seq).filter(|s| !seen.contains(s)).collect()
	}

	fn interest_for(&self, seq: u64) -> Name {
		let hint = self.forwarding_hint();
		let base = if hint.is_empty() { self.base_name.clone() } else { hint.join(&self.base_name) };
		base.push_number(seq)
	}

	fn express(
		&self,
		face: &Arc<dyn Face>,
		seq: u64,
		delay: Duration,
	) -> SegmentFuture {
		let face = Arc::clone(face);
		let name = self.interest_for(seq);
		let lifetime = self.config.interest_lifetime;
		Box::pin(async move {
			if delay > Duration::from_millis(0) {
				tokio::time::sleep(delay).await;
			}
			let result = face.express_interest(&name, lifetime).await;
			(seq, result)
		})
	}

	/// Run the pipeline until the range completes or the task stalls
	pub async fn run(
		self: Arc<Self>,
		face: Arc<dyn Face>,
		segment_callback: SegmentCallback,
	) -> FetchOutcome {
		let mut pending: VecDeque<u64> = self.missing_segments().into();
		if pending.is_empty() {
			return FetchOutcome::Complete;
		}

		let mut window: usize = 1;
		let mut retries: HashMap<u64, u32> = HashMap::new();
		let mut last_activity = Instant::now();
		let mut inflight: FuturesUnordered<SegmentFuture> = FuturesUnordered::new();

		trace!(
			"pipeline start: {} [{}..{}], hint {}",
			self.base_name,
			self.min_seq,
			self.max_seq,
			self.forwarding_hint()
		);

		loop {
			while inflight.len() < window {
				let seq = match pending.pop_front() {
					Some(seq) => seq,
					None => break,
				};
				let attempt = retries.get(&seq).copied().unwrap_or(0);
				let delay = if attempt == 0 {
					Duration::from_millis(0)
				} else {
					// bounded per-segment retry backoff
					Duration::from_millis(100u64.saturating_mul(1u64 << attempt.min(5)))
				};
				inflight.push(self.express(&face, seq, delay));
			}

			let (seq, result) = match inflight.next().await {
				Some(outcome) => outcome,
				None => {
					// nothing in flight and nothing pending: all segments seen
					return FetchOutcome::Complete;
				}
			};

			match result {
				Ok(data) => {
					let fresh = self.seen.lock().unwrap().insert(seq);
					if fresh {
						segment_callback(&self.device, &self.base_name, seq, data);
					}
					last_activity = Instant::now();
					retries.remove(&seq);
					if window < self.config.window_cap {
						window += 1;
					}
					if self.segments_received() as u64 == self.total_segments() {
						return FetchOutcome::Complete;
					}
				}
				Err(FaceError::Timeout) => {
					if self.seen.lock().unwrap().contains(&seq) {
						continue;
					}
					if last_activity.elapsed() >= self.config.max_no_activity {
						debug!(
							"no data for {:?} on {}, stalling",
							self.config.max_no_activity, self.base_name
						);
						return FetchOutcome::Stalled;
					}
					*retries.entry(seq).or_insert(0) += 1;
					window = (window / 2).max(1);
					pending.push_back(seq);
				}
				Err(FaceError::Closed) => {
					return FetchOutcome::Aborted;
				}
			}
		}
	}
}


// vim: ts=4
