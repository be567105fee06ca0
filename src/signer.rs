//! Signing of outbound data packets
//!
//! The core calls a signer on every data packet it publishes. Key management
//! and verification policy live outside the core; the provided impls cover
//! "no signing" and a keyed-MAC scheme sufficient for closed deployments.

use crate::wire::DataPacket;

/// Signs a data packet in place
pub trait Signer: Send + Sync {
	fn sign(&self, data: &mut DataPacket);
}

/// Signer that leaves packets unsigned
pub struct NullSigner;

impl Signer for NullSigner {
	fn sign(&self, _data: &mut DataPacket) {}
}

/// Keyed-BLAKE3 MAC over name and content
pub struct MacSigner {
	key: [u8; 32],
}

impl MacSigner {
	pub fn new(key: [u8; 32]) -> Self {
		MacSigner { key }
	}

	fn mac(&self, data: &DataPacket) -> Vec<u8> {
		let mut hasher = blake3::Hasher::new_keyed(&self.key);
		hasher.update(&data.name.to_wire());
		hasher.update(&data.content);
		hasher.finalize().as_bytes().to_vec()
	}
}

impl Signer for MacSigner {
	fn sign(&self, data: &mut DataPacket) {
		data.signature = Some(self.mac(data));
	}
}


// vim: ts=4
