use log::debug;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use std::collections::HashMap;
use std::path::Path;

use super::block::Block;
use super::utxo::{UtxoDelta, UtxoEntry};

const BLOCKS_TREE: &str = "blocks";
const TX_INDEX_TREE: &str = "transactions";
const UTXO_TREE: &str = "utxoset";

/// Reserved key in the blocks tree holding the hash of the chain tip
const TIP_KEY: &[u8] = b"lasthash";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("storage transaction aborted")]
    TransactionAborted,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("item not found: {0}")]
    NotFound(String),
}

/// The ledger's persistent store
///
/// Wraps a sled database with one tree per bucket: sealed blocks (plus the
/// tip pointer under a reserved key), the transaction-id location index and
/// the unspent-output set. Constructed once and injected into every
/// component that needs persistence.
pub struct Store {
    db: Db,
    blocks: Tree,
    tx_index: Tree,
    utxos: Tree,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

impl Store {
    /// Opens (or creates) the store under the given directory
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens a throwaway store backed by a temporary directory
    #[cfg(test)]
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let tx_index = db.open_tree(TX_INDEX_TREE)?;
        let utxos = db.open_tree(UTXO_TREE)?;

        Ok(Store {
            db,
            blocks,
            tx_index,
            utxos,
        })
    }

    /// Hash of the most recently committed block, if any chain exists
    pub fn tip(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(TIP_KEY)?.map(|value| value.to_vec()))
    }

    /// Loads the block stored under the given hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        let value = self
            .blocks
            .get(hash)?
            .ok_or_else(|| StorageError::NotFound(format!("block {}", hex::encode(hash))))?;

        bincode::deserialize(&value).map_err(|e| StorageError::Deserialization(e.to_string()))
    }

    /// Commits a sealed block: block body, tip advance, transaction-location
    /// index entries and the unspent-output delta, all in one atomic
    /// multi-tree transaction. A crash can never leave the tip pointing at
    /// an unpersisted block or the index half-updated.
    pub fn commit_block(&self, block: &Block, utxo_delta: &UtxoDelta) -> Result<(), StorageError> {
        let block_bytes = bincode::serialize(block)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let mut serialized_delta: Vec<(&[u8], Option<Vec<u8>>)> =
            Vec::with_capacity(utxo_delta.len());
        for (tx_id, entry) in utxo_delta {
            let value = match entry {
                Some(outputs) => Some(
                    bincode::serialize(outputs)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?,
                ),
                None => None,
            };
            serialized_delta.push((tx_id.as_slice(), value));
        }

        (&self.blocks, &self.tx_index, &self.utxos)
            .transaction(|(blocks, tx_index, utxos)| {
                blocks.insert(block.hash.as_slice(), block_bytes.as_slice())?;
                blocks.insert(TIP_KEY, block.hash.as_slice())?;

                for tx in &block.transactions {
                    tx_index.insert(tx.id.as_slice(), block.hash.as_slice())?;
                }

                for (tx_id, value) in &serialized_delta {
                    match value {
                        Some(bytes) => {
                            utxos.insert(*tx_id, bytes.as_slice())?;
                        }
                        None => {
                            utxos.remove(*tx_id)?;
                        }
                    }
                }

                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(()) => StorageError::TransactionAborted,
                TransactionError::Storage(e) => StorageError::Database(e),
            })?;

        self.db.flush()?;
        debug!("committed block {}", hex::encode(&block.hash));
        Ok(())
    }

    /// Hash of the block containing the given transaction, from the
    /// secondary location index
    pub fn transaction_location(&self, tx_id: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tx_index.get(tx_id)?.map(|value| value.to_vec()))
    }

    /// The unspent-output entry recorded for a transaction, if any
    pub fn get_utxo_entry(&self, tx_id: &[u8]) -> Result<Option<UtxoEntry>, StorageError> {
        match self.utxos.get(tx_id)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .map_err(|e| StorageError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// All unspent-output entries, in storage key order
    pub fn utxo_entries(&self) -> Result<Vec<(Vec<u8>, UtxoEntry)>, StorageError> {
        let mut entries = Vec::new();
        for item in self.utxos.iter() {
            let (key, value) = item?;
            let entry: UtxoEntry = bincode::deserialize(&value)
                .map_err(|e| StorageError::Deserialization(e.to_string()))?;
            entries.push((key.to_vec(), entry));
        }
        Ok(entries)
    }

    /// Applies an unspent-output delta on its own, as one atomic transaction
    pub fn apply_utxo_delta(&self, utxo_delta: &UtxoDelta) -> Result<(), StorageError> {
        let mut serialized: Vec<(&[u8], Option<Vec<u8>>)> = Vec::with_capacity(utxo_delta.len());
        for (tx_id, entry) in utxo_delta {
            let value = match entry {
                Some(outputs) => Some(
                    bincode::serialize(outputs)
                        .map_err(|e| StorageError::Serialization(e.to_string()))?,
                ),
                None => None,
            };
            serialized.push((tx_id.as_slice(), value));
        }

        self.utxos
            .transaction(|utxos| {
                for (tx_id, value) in &serialized {
                    match value {
                        Some(bytes) => {
                            utxos.insert(*tx_id, bytes.as_slice())?;
                        }
                        None => {
                            utxos.remove(*tx_id)?;
                        }
                    }
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(()) => StorageError::TransactionAborted,
                TransactionError::Storage(e) => StorageError::Database(e),
            })?;

        self.db.flush()?;
        Ok(())
    }

    /// Replaces the whole unspent-output set with a freshly computed one,
    /// atomically
    pub fn replace_utxos(
        &self,
        entries: &HashMap<Vec<u8>, UtxoEntry>,
    ) -> Result<(), StorageError> {
        let mut stale: Vec<Vec<u8>> = Vec::new();
        for key in self.utxos.iter().keys() {
            stale.push(key?.to_vec());
        }

        let mut fresh: Vec<(&[u8], Vec<u8>)> = Vec::with_capacity(entries.len());
        for (tx_id, entry) in entries {
            let bytes = bincode::serialize(entry)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            fresh.push((tx_id.as_slice(), bytes));
        }

        self.utxos
            .transaction(|utxos| {
                for key in &stale {
                    utxos.remove(key.as_slice())?;
                }
                for (tx_id, bytes) in &fresh {
                    utxos.insert(*tx_id, bytes.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(()) => StorageError::TransactionAborted,
                TransactionError::Storage(e) => StorageError::Database(e),
            })?;

        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Transaction;
    use crate::wallet::Wallet;

    fn sealed_block() -> Block {
        let wallet = Wallet::new().unwrap();
        let coinbase = Transaction::new_coinbase(&wallet.address(), b"storage test").unwrap();
        Block::mine(vec![coinbase], Vec::new()).unwrap()
    }

    #[test]
    fn test_commit_and_get_block() {
        let store = Store::temporary().unwrap();
        assert!(store.tip().unwrap().is_none());

        let block = sealed_block();
        store.commit_block(&block, &Vec::new()).unwrap();

        assert_eq!(store.tip().unwrap().unwrap(), block.hash);
        let loaded = store.get_block(&block.hash).unwrap();
        assert_eq!(loaded.transactions[0].id, block.transactions[0].id);
    }

    #[test]
    fn test_commit_records_transaction_locations() {
        let store = Store::temporary().unwrap();
        let block = sealed_block();
        store.commit_block(&block, &Vec::new()).unwrap();

        let location = store
            .transaction_location(&block.transactions[0].id)
            .unwrap();
        assert_eq!(location.unwrap(), block.hash);
    }

    #[test]
    fn test_missing_block_is_not_found() {
        let store = Store::temporary().unwrap();
        let err = store.get_block(b"no such hash").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_utxo_delta_roundtrip() {
        let store = Store::temporary().unwrap();
        let block = sealed_block();
        let tx = &block.transactions[0];

        let entry: UtxoEntry = vec![(0, tx.outputs()[0].clone())];
        store
            .apply_utxo_delta(&vec![(tx.id.clone(), Some(entry.clone()))])
            .unwrap();
        assert_eq!(store.get_utxo_entry(&tx.id).unwrap().unwrap(), entry);

        store.apply_utxo_delta(&vec![(tx.id.clone(), None)]).unwrap();
        assert!(store.get_utxo_entry(&tx.id).unwrap().is_none());
    }

    #[test]
    fn test_replace_utxos_drops_stale_entries() {
        let store = Store::temporary().unwrap();
        let block = sealed_block();
        let tx = &block.transactions[0];

        store
            .apply_utxo_delta(&vec![(
                b"stale".to_vec(),
                Some(vec![(0, tx.outputs()[0].clone())]),
            )])
            .unwrap();

        let mut fresh = HashMap::new();
        fresh.insert(tx.id.clone(), vec![(0u32, tx.outputs()[0].clone())]);
        store.replace_utxos(&fresh).unwrap();

        assert!(store.get_utxo_entry(b"stale").unwrap().is_none());
        assert!(store.get_utxo_entry(&tx.id).unwrap().is_some());
    }
}
