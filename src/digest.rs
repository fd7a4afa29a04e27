//! Incremental SHA-256 over the transferred payload.
//!
//! The sender feeds chunks in file order while streaming; the receiver feeds
//! its reassembled buffers in ascending index order when the END packet
//! arrives. Both sides must therefore hash identical byte sequences for a
//! clean transfer.

use sha2::{Digest, Sha256};

use crate::packet::HASH_SIZE;

#[derive(Default)]
pub struct TransferDigest {
    hasher: Sha256,
}

impl TransferDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Consume the accumulator and return the final digest.
    pub fn finalize(self) -> [u8; HASH_SIZE] {
        self.hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        let mut digest = TransferDigest::new();
        digest.update(b"abc");
        let expected =
            hex::decode("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
                .unwrap();
        assert_eq!(digest.finalize().as_slice(), expected.as_slice());
    }

    #[test]
    fn chunked_updates_match_single_update() {
        let data = vec![0x42u8; 2500];

        let mut whole = TransferDigest::new();
        whole.update(&data);

        let mut chunked = TransferDigest::new();
        for chunk in data.chunks(1000) {
            chunked.update(chunk);
        }

        assert_eq!(whole.finalize(), chunked.finalize());
    }
}
