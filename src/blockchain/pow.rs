use log::debug;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::Block;

/// Difficulty of the mining puzzle, expressed as the number of bits the
/// target is shifted down from 2^256. Fixed for the lifetime of a chain;
/// there is no retargeting.
pub const DIFFICULTY_BITS: u32 = 16;

const MAX_NONCE: u64 = u64::MAX;

/// Errors that can occur while sealing a block
#[derive(Debug, Error)]
pub enum PowError {
    #[error("nonce space exhausted without meeting the difficulty target")]
    NonceExhausted,
}

/// Brute-force proof-of-work over a block header
///
/// The header digest covers the previous block hash, the flat transaction
/// digest, the timestamp, the difficulty and the nonce, each serialized as
/// fixed-width big-endian bytes. A block is sealed by the first nonce whose
/// digest, read as a big-endian 256-bit integer, falls strictly below
/// `2^(256 - DIFFICULTY_BITS)`.
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: [u8; 32],
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        ProofOfWork {
            block,
            target: target_bytes(DIFFICULTY_BITS),
        }
    }

    /// Assembles the header preimage for a given nonce
    fn header_bytes(&self, nonce: u64) -> Vec<u8> {
        let tx_digest = self.block.transactions_digest();

        let mut data = Vec::with_capacity(self.block.prev_hash.len() + tx_digest.len() + 24);
        data.extend_from_slice(&self.block.prev_hash);
        data.extend_from_slice(&tx_digest);
        data.extend_from_slice(&self.block.timestamp.to_be_bytes());
        data.extend_from_slice(&u64::from(DIFFICULTY_BITS).to_be_bytes());
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    fn hash_attempt(&self, nonce: u64) -> [u8; 32] {
        Sha256::digest(self.header_bytes(nonce)).into()
    }

    fn meets_target(&self, hash: &[u8; 32]) -> bool {
        // Big-endian numeric comparison of equal-length arrays
        hash[..] < self.target[..]
    }

    /// Searches for a winning nonce starting at zero
    ///
    /// Returns the nonce and the resulting block hash. Exhausting the nonce
    /// space is fatal to the mining attempt; no block is produced.
    pub fn run(&self) -> Result<(u64, Vec<u8>), PowError> {
        let mut nonce = 0u64;

        while nonce < MAX_NONCE {
            let hash = self.hash_attempt(nonce);
            if self.meets_target(&hash) {
                debug!("sealed block with nonce {} -> {}", nonce, hex::encode(hash));
                return Ok((nonce, hash.to_vec()));
            }
            nonce += 1;
        }

        Err(PowError::NonceExhausted)
    }

    /// Recomputes the header digest from the block's stored nonce and
    /// reports whether it meets the target. This is the sole admission
    /// check for a block's work.
    pub fn is_valid(&self) -> bool {
        let hash = self.hash_attempt(self.block.nonce);
        self.meets_target(&hash)
    }
}

/// `2^(256 - bits)` as a 32-byte big-endian integer
fn target_bytes(bits: u32) -> [u8; 32] {
    debug_assert!(bits > 0 && bits < 256);

    let mut target = [0u8; 32];
    let bit = 256 - bits;
    let byte = 31 - (bit / 8) as usize;
    target[byte] = 1 << (bit % 8);
    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;
    use crate::wallet::Wallet;

    fn unsealed_block() -> Block {
        let wallet = Wallet::new().unwrap();
        let coinbase = Transaction::new_coinbase(&wallet.address(), b"pow test").unwrap();

        Block {
            timestamp: 1_700_000_000,
            transactions: vec![coinbase],
            prev_hash: Vec::new(),
            hash: Vec::new(),
            nonce: 0,
        }
    }

    #[test]
    fn test_target_bytes() {
        // 2^248: the single set bit lands in the most significant byte
        let target = target_bytes(8);
        assert_eq!(target[0], 1);
        assert!(target[1..].iter().all(|&b| b == 0));

        // 2^240
        let target = target_bytes(16);
        assert_eq!(target[0], 0);
        assert_eq!(target[1], 1);
        assert!(target[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_run_finds_valid_nonce() {
        let mut block = unsealed_block();

        let (nonce, hash) = ProofOfWork::new(&block).run().unwrap();
        block.nonce = nonce;
        block.hash = hash;

        assert!(ProofOfWork::new(&block).is_valid());
    }

    #[test]
    fn test_tampered_nonce_is_invalid() {
        let mut block = unsealed_block();

        let (nonce, hash) = ProofOfWork::new(&block).run().unwrap();
        block.nonce = nonce;
        block.hash = hash;

        // Any nonce below the winner is invalid: run() returns the first hit
        block.nonce = if nonce > 0 {
            nonce - 1
        } else {
            let mut n = 1;
            loop {
                block.nonce = n;
                if !ProofOfWork::new(&block).is_valid() {
                    break n;
                }
                n += 1;
            }
        };
        assert!(!ProofOfWork::new(&block).is_valid());
    }

    #[test]
    fn test_tampered_transaction_is_invalid() {
        let mut block = unsealed_block();

        let (nonce, hash) = ProofOfWork::new(&block).run().unwrap();
        block.nonce = nonce;
        block.hash = hash;

        // Flipping a single byte of a transaction id changes the tx digest
        block.transactions[0].id[0] ^= 0x01;
        assert!(!ProofOfWork::new(&block).is_valid());
    }
}
