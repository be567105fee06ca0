//! Tag-addressed delayed tasks
//!
//! Every delayed action in the core is addressed by a stable string tag
//! (tags show up in logs). Scheduling an already-scheduled tag replaces the
//! pending instance, so bursts of near-simultaneous wake-ups coalesce into
//! one. Periodic behavior is built by having the fired closure reschedule
//! its own tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::logging::*;

pub struct Scheduler {
	tasks: Mutex<HashMap<String, JoinHandle<()>>>,
	closed: AtomicBool,
	me: Weak<Scheduler>,
}

impl Scheduler {
	pub fn new() -> Arc<Self> {
		Arc::new_cyclic(|me| Scheduler {
			tasks: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
			me: me.clone(),
		})
	}

	/// Run `f` after `delay`. An existing task under the same tag is
	/// replaced (its timer is dropped).
	pub fn schedule<F>(&self, tag: &str, delay: Duration, f: F)
	where
		F: FnOnce() + Send + 'static,
	{
		if self.closed.load(Ordering::SeqCst) {
			return;
		}

		let me = self.me.clone();
		let task_tag = tag.to_string();
		let handle = tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			let scheduler = match me.upgrade() {
				Some(scheduler) => scheduler,
				None => return,
			};
			{
				let mut tasks = scheduler.tasks.lock().unwrap();
				tasks.remove(&task_tag);
			}
			if scheduler.closed.load(Ordering::SeqCst) {
				return;
			}
			trace!("scheduler fires: {}", task_tag);
			f();
		});

		let mut tasks = self.tasks.lock().unwrap();
		if let Some(old) = tasks.insert(tag.to_string(), handle) {
			old.abort();
		}
	}

	/// Drop a pending task; returns whether one was pending
	pub fn cancel(&self, tag: &str) -> bool {
		let mut tasks = self.tasks.lock().unwrap();
		match tasks.remove(tag) {
			Some(handle) => {
				handle.abort();
				true
			}
			None => false,
		}
	}

	pub fn is_scheduled(&self, tag: &str) -> bool {
		self.tasks.lock().unwrap().contains_key(tag)
	}

	/// Abort everything pending and refuse new work
	pub fn shutdown(&self) {
		self.closed.store(true, Ordering::SeqCst);
		let mut tasks = self.tasks.lock().unwrap();
		for (_, handle) in tasks.drain() {
			handle.abort();
		}
	}
}


// vim: ts=4
