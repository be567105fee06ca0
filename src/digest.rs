//! Root digests over the sync-node set
//!
//! A digest summarizes the `device -> seq_no` mapping known to a peer. Two
//! peers with identical mappings compute bit-identical digests, which is what
//! the set-reconciliation protocol compares.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DecodeError;
use crate::name::Name;

/// A 32-byte content digest
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; 32]);

impl Digest {
	/// Sentinel digest of the empty node set ("origin")
	pub const ORIGIN: Digest = Digest([0u8; 32]);

	pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
		if bytes.len() != 32 {
			return Err(DecodeError::BadDigest { len: bytes.len() });
		}
		let mut buf = [0u8; 32];
		buf.copy_from_slice(bytes);
		Ok(Digest(buf))
	}

	pub fn of(data: &[u8]) -> Self {
		Digest(*blake3::hash(data).as_bytes())
	}

	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.0)
	}

	/// First bytes of the hex form, for logs
	pub fn short(&self) -> String {
		hex::encode(&self.0[..4])
	}

	pub fn is_origin(&self) -> bool {
		*self == Digest::ORIGIN
	}
}

impl fmt::Display for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.to_hex())
	}
}

impl fmt::Debug for Digest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.short())
	}
}

/// Compute the root digest over a set of `(device, seq_no)` pairs.
///
/// Nodes are sorted by the wire encoding of the device name; the hash covers
/// each node's wire-encoded name followed by its seq_no as 8 little-endian
/// bytes. The empty set yields `Digest::ORIGIN`.
pub fn digest_node_set(nodes: &[(Name, u64)]) -> Digest {
	if nodes.is_empty() {
		return Digest::ORIGIN;
	}

	let mut sorted: Vec<(Vec<u8>, u64)> =
		nodes.iter().map(|(name, seq)| (name.to_wire(), *seq)).collect();
	sorted.sort();

	let mut hasher = blake3::Hasher::new();
	for (wire, seq) in &sorted {
		hasher.update(wire);
		hasher.update(&seq.to_le_bytes());
	}
	Digest(*hasher.finalize().as_bytes())
}


// vim: ts=4
