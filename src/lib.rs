//! # Namesync - Peer-to-Peer Folder Synchronization over Named Data
//!
//! Namesync keeps replicas of a shared folder convergent by exchanging
//! per-device action logs and content-addressed file segments over a
//! content-centric request/response network (interests and data with
//! hierarchical names).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use namesync::config::Config;
//! use namesync::dispatcher::Dispatcher;
//! use namesync::face::MemoryBus;
//! use namesync::signer::NullSigner;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bus = MemoryBus::new();
//!     let config = Config::load(std::path::Path::new("./folder"))?;
//!     let dispatcher = Dispatcher::new(
//!         config,
//!         std::path::Path::new("./folder"),
//!         bus.face(),
//!         Arc::new(NullSigner),
//!     )?;
//!     dispatcher.local_file_changed("notes.txt")?;
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod action_log;
pub mod config;
pub mod content_server;
pub mod digest;
pub mod dispatcher;
pub mod error;
pub mod face;
pub mod fetch_manager;
pub mod fetcher;
pub mod file_state;
pub mod logging;
pub mod name;
pub mod object_store;
pub mod scheduler;
pub mod signer;
pub mod sync_core;
pub mod sync_log;
pub mod util;
pub mod wire;

// Re-export commonly used types and functions
pub use action_log::{ActionLog, ActionSubscriber, NullSubscriber};
pub use config::Config;
pub use digest::Digest;
pub use dispatcher::Dispatcher;
pub use error::{DecodeError, FaceError, StorageError, SyncError};
pub use face::{Face, MemoryBus, MemoryFace};
pub use fetch_manager::{FetchManager, FetchTaskDb};
pub use file_state::{FileState, FileStateEntry};
pub use name::Name;
pub use object_store::ObjectStore;
pub use signer::{MacSigner, NullSigner, Signer};
pub use sync_core::SyncCore;
pub use sync_log::SyncLog;
pub use wire::{ActionItem, ActionType, DataPacket, SyncState, SyncStateMsg};

// vim: ts=4
