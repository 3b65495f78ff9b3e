use std::sync::Arc;

use super::block::Block;
use super::storage::{StorageError, Store};

/// Lazy backward cursor over the chain, from the tip towards genesis
///
/// Strictly single-pass: each step fetches the block under the current hash
/// and advances to that block's predecessor. The empty hash is the terminal
/// sentinel, reached once the genesis block has been fetched.
pub struct ChainIterator {
    current_hash: Vec<u8>,
    store: Arc<Store>,
}

impl ChainIterator {
    pub(crate) fn new(tip: Vec<u8>, store: Arc<Store>) -> Self {
        ChainIterator {
            current_hash: tip,
            store,
        }
    }

    /// Whether the cursor has moved past the genesis block
    pub fn at_genesis(&self) -> bool {
        self.current_hash.is_empty()
    }

    /// Fetches the block under the current hash and steps backward
    pub fn next_block(&mut self) -> Result<Option<Block>, StorageError> {
        if self.current_hash.is_empty() {
            return Ok(None);
        }

        let block = self.store.get_block(&self.current_hash)?;
        self.current_hash = block.prev_hash.clone();
        Ok(Some(block))
    }
}

impl Iterator for ChainIterator {
    type Item = Result<Block, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;
    use crate::wallet::Wallet;

    #[test]
    fn test_walks_back_to_genesis() {
        let store = Arc::new(Store::temporary().unwrap());
        let wallet = Wallet::new().unwrap();

        let genesis = Block::mine(
            vec![Transaction::new_coinbase(&wallet.address(), b"one").unwrap()],
            Vec::new(),
        )
        .unwrap();
        store.commit_block(&genesis, &Vec::new()).unwrap();

        let second = Block::mine(
            vec![Transaction::new_coinbase(&wallet.address(), b"two").unwrap()],
            genesis.hash.clone(),
        )
        .unwrap();
        store.commit_block(&second, &Vec::new()).unwrap();

        let mut iter = ChainIterator::new(second.hash.clone(), Arc::clone(&store));
        assert!(!iter.at_genesis());

        let first_visited = iter.next_block().unwrap().unwrap();
        assert_eq!(first_visited.hash, second.hash);

        let second_visited = iter.next_block().unwrap().unwrap();
        assert_eq!(second_visited.hash, genesis.hash);
        assert!(second_visited.is_genesis());

        assert!(iter.at_genesis());
        assert!(iter.next_block().unwrap().is_none());
    }

    #[test]
    fn test_iterator_adapter_counts_blocks() {
        let store = Arc::new(Store::temporary().unwrap());
        let wallet = Wallet::new().unwrap();

        let genesis = Block::mine(
            vec![Transaction::new_coinbase(&wallet.address(), b"solo").unwrap()],
            Vec::new(),
        )
        .unwrap();
        store.commit_block(&genesis, &Vec::new()).unwrap();

        let iter = ChainIterator::new(genesis.hash.clone(), store);
        assert_eq!(iter.count(), 1);
    }
}
