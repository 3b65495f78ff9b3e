use chrono::Utc;
use serde::{Deserialize, Serialize};

use std::fmt;

use super::hashing::sha256_concat;
use super::pow::{PowError, ProofOfWork};
use super::transaction::Transaction;

/// A single entry in the chain: an ordered set of transactions plus the
/// headers linking it to its predecessor. Immutable once sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Unix timestamp taken when mining began
    pub timestamp: i64,

    /// Transactions recorded by this block, in order
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block; empty only for the genesis block
    pub prev_hash: Vec<u8>,

    /// Header hash found by proof-of-work
    pub hash: Vec<u8>,

    /// Winning proof-of-work nonce
    pub nonce: u64,
}

impl Block {
    /// Builds and seals a new block on top of `prev_hash`
    ///
    /// Runs the proof-of-work search; the block is returned with its winning
    /// nonce and hash already set.
    pub fn mine(transactions: Vec<Transaction>, prev_hash: Vec<u8>) -> Result<Block, PowError> {
        let mut block = Block {
            timestamp: Utc::now().timestamp(),
            transactions,
            prev_hash,
            hash: Vec::new(),
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run()?;
        block.nonce = nonce;
        block.hash = hash;
        Ok(block)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Flat SHA-256 over the concatenation of all transaction ids in block
    /// order (not a Merkle tree)
    pub fn transactions_digest(&self) -> Vec<u8> {
        sha256_concat(self.transactions.iter().map(|tx| tx.id.as_slice()))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==== block {} ====", hex::encode(&self.hash))?;
        if !self.prev_hash.is_empty() {
            writeln!(f, "prev hash: {}", hex::encode(&self.prev_hash))?;
        }
        writeln!(f, "tx digest: {}", hex::encode(self.transactions_digest()))?;
        writeln!(f, "timestamp: {}  nonce: {}", self.timestamp, self.nonce)?;
        writeln!(f, "transactions:")?;
        for tx in &self.transactions {
            writeln!(f, "{}", tx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    #[test]
    fn test_mine_seals_block() {
        let wallet = Wallet::new().unwrap();
        let coinbase = Transaction::new_coinbase(&wallet.address(), b"genesis").unwrap();

        let block = Block::mine(vec![coinbase], Vec::new()).unwrap();

        assert!(!block.hash.is_empty());
        assert!(block.is_genesis());
        assert!(ProofOfWork::new(&block).is_valid());
    }

    #[test]
    fn test_transactions_digest_depends_on_order() {
        let wallet = Wallet::new().unwrap();
        let a = Transaction::new_coinbase(&wallet.address(), b"first").unwrap();
        let b = Transaction::new_coinbase(&wallet.address(), b"second").unwrap();

        let forward = Block {
            timestamp: 0,
            transactions: vec![a.clone(), b.clone()],
            prev_hash: Vec::new(),
            hash: Vec::new(),
            nonce: 0,
        };
        let reversed = Block {
            timestamp: 0,
            transactions: vec![b, a],
            prev_hash: Vec::new(),
            hash: Vec::new(),
            nonce: 0,
        };

        assert_ne!(forward.transactions_digest(), reversed.transactions_digest());
    }
}
