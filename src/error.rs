//! Error types for namesync operations

use std::error::Error;
use std::fmt;
use std::io;

/// Helper function to reduce Box::new() boilerplate when wrapping errors
#[inline]
pub fn boxed_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
	Box::new(e)
}

/// Wrap any database error into a StorageError
#[inline]
pub fn db_error<E: Error + Send + Sync + 'static>(e: E) -> StorageError {
	StorageError::Db { source: boxed_error(e) }
}

/// Persistent-storage errors: disk full, corruption, permission problems.
///
/// Fatal to the current operation, never fatal to the process; callers may retry.
#[derive(Debug)]
pub enum StorageError {
	/// Database operation failed
	Db { source: Box<dyn Error + Send + Sync> },

	/// I/O error
	Io(io::Error),

	/// On-disk state does not decode
	Corrupted { message: String },

	/// A required record is missing (only raised where an empty optional is not expressible)
	Missing { what: String },
}

impl fmt::Display for StorageError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StorageError::Db { source } => write!(f, "Database error: {}", source),
			StorageError::Io(e) => write!(f, "I/O error: {}", e),
			StorageError::Corrupted { message } => write!(f, "Storage corrupted: {}", message),
			StorageError::Missing { what } => write!(f, "Missing record: {}", what),
		}
	}
}

impl Error for StorageError {}

impl From<io::Error> for StorageError {
	fn from(e: io::Error) -> Self {
		StorageError::Io(e)
	}
}

/// Decode errors: malformed actions, bad state messages, unparsable names.
///
/// The protocol assumes adversarial or stale inputs; these are logged and the
/// offending packet is dropped. Never fatal.
#[derive(Debug)]
pub enum DecodeError {
	/// A hierarchical name did not parse or had the wrong shape
	BadName { message: String },

	/// An action payload did not deserialize
	BadAction { message: String },

	/// A sync-state message did not decompress or deserialize
	BadStateMsg { message: String },

	/// A digest component had the wrong length
	BadDigest { len: usize },
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DecodeError::BadName { message } => write!(f, "Bad name: {}", message),
			DecodeError::BadAction { message } => write!(f, "Bad action: {}", message),
			DecodeError::BadStateMsg { message } => write!(f, "Bad sync-state message: {}", message),
			DecodeError::BadDigest { len } => {
				write!(f, "Bad digest: expected 32 bytes, got {}", len)
			}
		}
	}
}

impl Error for DecodeError {}

/// Network-face errors
#[derive(Debug)]
pub enum FaceError {
	/// No data arrived within the interest lifetime
	Timeout,

	/// The face (or its bus) has been shut down
	Closed,
}

impl fmt::Display for FaceError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FaceError::Timeout => write!(f, "Interest timed out"),
			FaceError::Closed => write!(f, "Face closed"),
		}
	}
}

impl Error for FaceError {}

/// Main error type for sync operations
///
/// Unified error type encompassing all core errors. Decode and not-found
/// conditions are swallowed at component boundaries; storage and integrity
/// errors propagate to the owner of the originating operation.
#[derive(Debug)]
pub enum SyncError {
	/// Storage error (nested)
	Storage(StorageError),

	/// Decode error (nested)
	Decode(DecodeError),

	/// Face error (nested)
	Face(FaceError),

	/// Assembled content hash does not match the expected hash
	IntegrityMismatch { expected: String, actual: String },

	/// Invalid configuration
	InvalidConfig { message: String },

	/// I/O error
	Io(io::Error),

	/// Generic error message
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Storage(e) => write!(f, "Storage error: {}", e),
			SyncError::Decode(e) => write!(f, "Decode error: {}", e),
			SyncError::Face(e) => write!(f, "Face error: {}", e),
			SyncError::IntegrityMismatch { expected, actual } => {
				write!(f, "Integrity mismatch: expected {}, got {}", expected, actual)
			}
			SyncError::InvalidConfig { message } => {
				write!(f, "Invalid configuration: {}", message)
			}
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<StorageError> for SyncError {
	fn from(e: StorageError) -> Self {
		SyncError::Storage(e)
	}
}

impl From<DecodeError> for SyncError {
	fn from(e: DecodeError) -> Self {
		SyncError::Decode(e)
	}
}

impl From<FaceError> for SyncError {
	fn from(e: FaceError) -> Self {
		SyncError::Face(e)
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}

// vim: ts=4
