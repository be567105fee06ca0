//! Unified configuration for namesync
//!
//! A single `Config` struct carries every tunable of the core. The priority
//! chain is: built-in defaults, then an optional TOML file
//! (`<folder>/.namesync/config.toml`).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::name::Name;

/// Fixed segment size for file content (bytes)
pub const SEGMENT_SIZE: usize = 1024;

/// Name of the state directory inside the shared folder
pub const STATE_DIR: &str = ".namesync";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Device name of this participant (URI form, globally unique)
	pub device_name: String,

	/// Name of the shared folder as used on the wire
	pub shared_folder: String,

	/// Application component of wire names
	pub app_name: String,

	/// Broadcast prefix under which sync interests travel
	pub sync_prefix: String,

	/// Broadcast forwarding hint tried when a locator goes stale
	pub broadcast_hint: String,

	/// Initial locator (forwarding hint) of this device; empty means direct
	pub locator: String,

	/// Seconds between periodic sync interests; clamped to (0, 30]
	pub sync_interest_interval_secs: u64,

	/// Freshness period stamped on outbound data packets
	pub freshness_secs: u64,

	/// Fetch tasks running in parallel per fetch manager
	pub parallel_fetches: usize,

	/// Cap on the per-task pipeline window
	pub pipeline_window: usize,

	/// Interest lifetime for fetches, in milliseconds
	pub interest_lifetime_ms: u64,

	/// Seconds without any data before a fetch task is considered stalled
	pub max_no_activity_secs: u64,

	/// Glob patterns excluded from local-event processing
	pub exclude_patterns: Vec<String>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			device_name: format!("/namesync/device/{}", uuid::Uuid::new_v4()),
			shared_folder: "shared".to_string(),
			app_name: "namesync".to_string(),
			sync_prefix: "/broadcast/namesync/sync".to_string(),
			broadcast_hint: "/broadcast".to_string(),
			locator: String::new(),
			sync_interest_interval_secs: 4,
			freshness_secs: 2,
			parallel_fetches: 3,
			pipeline_window: 6,
			interest_lifetime_ms: 4000,
			max_no_activity_secs: 30,
			exclude_patterns: vec![format!("{}/**", STATE_DIR), "*.namesync-tmp".to_string()],
		}
	}
}

impl Config {
	/// Load configuration for a shared folder rooted at `root`: defaults
	/// overridden by `<root>/.namesync/config.toml` when present.
	pub fn load(root: &Path) -> Result<Self, SyncError> {
		let path = root.join(STATE_DIR).join("config.toml");
		if !path.exists() {
			return Ok(Config::default());
		}
		let contents = fs::read_to_string(&path)?;
		let config: Config = toml::from_str(&contents).map_err(|e| SyncError::InvalidConfig {
			message: format!("{}: {}", path.display(), e),
		})?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), SyncError> {
		if self.device_name.trim_matches('/').is_empty() {
			return Err(SyncError::InvalidConfig { message: "empty device name".to_string() });
		}
		if self.shared_folder.is_empty() {
			return Err(SyncError::InvalidConfig { message: "empty shared folder".to_string() });
		}
		if self.parallel_fetches == 0 || self.pipeline_window == 0 {
			return Err(SyncError::InvalidConfig {
				message: "parallelism settings must be positive".to_string(),
			});
		}
		Ok(())
	}

	/// The effective sync interval: out-of-range values fall back to 4s
	pub fn sync_interval_secs(&self) -> u64 {
		if self.sync_interest_interval_secs > 0 && self.sync_interest_interval_secs <= 30 {
			self.sync_interest_interval_secs
		} else {
			4
		}
	}

	pub fn device(&self) -> Name {
		Name::parse(&self.device_name).unwrap_or_else(|_| Name::empty())
	}

	pub fn sync_prefix_name(&self) -> Name {
		Name::parse(&self.sync_prefix).unwrap_or_else(|_| Name::empty())
	}

	pub fn broadcast_hint_name(&self) -> Name {
		Name::parse(&self.broadcast_hint).unwrap_or_else(|_| Name::empty())
	}

	pub fn locator_name(&self) -> Name {
		Name::parse(&self.locator).unwrap_or_else(|_| Name::empty())
	}

	pub fn state_dir(&self, root: &Path) -> PathBuf {
		root.join(STATE_DIR)
	}

	pub fn sync_log_path(&self, root: &Path) -> PathBuf {
		self.state_dir(root).join("sync-log.db")
	}

	pub fn action_log_path(&self, root: &Path) -> PathBuf {
		self.state_dir(root).join("action-log.db")
	}

	pub fn fetch_task_path(&self, root: &Path) -> PathBuf {
		self.state_dir(root).join("fetch-task.db")
	}

	pub fn objects_dir(&self, root: &Path) -> PathBuf {
		self.state_dir(root).join("objects")
	}
}


// vim: ts=4
