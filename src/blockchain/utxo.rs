use log::{info, warn};
use thiserror::Error;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use super::block::Block;
use super::storage::{StorageError, Store};
use super::transaction::TxOutput;

/// Unspent outputs of one transaction, each tagged with its original output
/// index so references stay stable as the entry shrinks
pub type UtxoEntry = Vec<(u32, TxOutput)>;

/// A batch of index mutations: `Some` replaces an entry, `None` deletes it
pub type UtxoDelta = Vec<(Vec<u8>, Option<UtxoEntry>)>;

/// Errors that can occur while maintaining the unspent-output index
#[derive(Debug, Error)]
pub enum UtxoError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("utxo index diverges from chain state")]
    IndexDiverged,
}

/// Queryable cache of currently-unspent outputs
///
/// Derived state: the index must always equal what a full rebuild from the
/// chain would produce. It exists so balance and payment lookups do not
/// rescan the whole chain.
#[derive(Debug)]
pub struct UtxoIndex {
    store: Arc<Store>,
}

impl UtxoIndex {
    pub fn new(store: Arc<Store>) -> Self {
        UtxoIndex { store }
    }

    /// Computes the index mutations a committed block implies
    ///
    /// Outputs referenced by the block's inputs are removed from their
    /// source entries (entries left empty are deleted) and every transaction
    /// in the block gets a fresh entry covering all of its outputs. The
    /// returned delta is applied atomically by the caller, either standalone
    /// or folded into the block commit.
    pub fn plan_block_update(&self, block: &Block) -> Result<UtxoDelta, UtxoError> {
        // Entries touched by spends, keyed by source transaction. Worked on
        // in memory so several transactions spending from the same source
        // compose into one final entry state.
        let mut touched: HashMap<Vec<u8>, UtxoEntry> = HashMap::new();

        for tx in &block.transactions {
            for input in tx.inputs() {
                let entry = match touched.entry(input.prev_tx_id.clone()) {
                    Entry::Occupied(occupied) => occupied.into_mut(),
                    Entry::Vacant(vacant) => {
                        let current = match self.store.get_utxo_entry(&input.prev_tx_id)? {
                            Some(entry) => entry,
                            None => {
                                warn!(
                                    "input references {} which has no live index entry",
                                    hex::encode(&input.prev_tx_id)
                                );
                                Vec::new()
                            }
                        };
                        vacant.insert(current)
                    }
                };
                entry.retain(|(index, _)| *index != input.output_index);
            }
        }

        let mut delta: UtxoDelta = Vec::with_capacity(touched.len() + block.transactions.len());
        for (tx_id, entry) in touched {
            let value = if entry.is_empty() { None } else { Some(entry) };
            delta.push((tx_id, value));
        }

        for tx in &block.transactions {
            let outputs: UtxoEntry = tx
                .outputs()
                .iter()
                .enumerate()
                .map(|(index, output)| (index as u32, output.clone()))
                .collect();
            delta.push((tx.id.clone(), Some(outputs)));
        }

        Ok(delta)
    }

    /// Incremental maintenance after a block commit, as its own atomic
    /// storage transaction
    pub fn update(&self, block: &Block) -> Result<(), UtxoError> {
        let delta = self.plan_block_update(block)?;
        self.store.apply_utxo_delta(&delta)?;
        Ok(())
    }

    /// Replaces the whole persisted index, returning the number of entries
    pub fn replace(&self, entries: HashMap<Vec<u8>, UtxoEntry>) -> Result<usize, UtxoError> {
        let count = entries.len();
        self.store.replace_utxos(&entries)?;
        info!("utxo index replaced: {} entries", count);
        Ok(count)
    }

    /// The live index as a map, for consistency comparison against a rebuild
    pub fn snapshot(&self) -> Result<HashMap<Vec<u8>, UtxoEntry>, UtxoError> {
        Ok(self.store.utxo_entries()?.into_iter().collect())
    }

    /// Greedily accumulates outputs spendable by `pub_key_hash` until the
    /// requested amount is reached
    ///
    /// Entries are scanned in storage order; selection is first-found, not
    /// fewest-inputs. Returns the accumulated total (which may fall short of
    /// `amount` — the caller decides that means insufficient funds) and the
    /// selected `(transaction id, output index)` pairs.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<Vec<u8>, Vec<u32>>), UtxoError> {
        let mut accumulated = 0u64;
        let mut selected: HashMap<Vec<u8>, Vec<u32>> = HashMap::new();

        'scan: for (tx_id, entry) in self.store.utxo_entries()? {
            for (index, output) in &entry {
                if output.is_locked_with(pub_key_hash) {
                    accumulated += output.value;
                    selected.entry(tx_id.clone()).or_default().push(*index);

                    if accumulated >= amount {
                        break 'scan;
                    }
                }
            }
        }

        Ok((accumulated, selected))
    }

    /// All outputs currently spendable by `pub_key_hash`, for balance
    /// computation
    pub fn unspent_outputs_for(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, UtxoError> {
        let mut outputs = Vec::new();

        for (_, entry) in self.store.utxo_entries()? {
            for (_, output) in entry {
                if output.is_locked_with(pub_key_hash) {
                    outputs.push(output);
                }
            }
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::{Transaction, TxInput, COINBASE_REWARD};
    use crate::wallet::{hash_public_key, Wallet};

    fn index() -> UtxoIndex {
        UtxoIndex::new(Arc::new(Store::temporary().unwrap()))
    }

    fn genesis_block(wallet: &Wallet) -> Block {
        let coinbase = Transaction::new_coinbase(&wallet.address(), b"utxo test").unwrap();
        Block::mine(vec![coinbase], Vec::new()).unwrap()
    }

    #[test]
    fn test_update_inserts_new_outputs() {
        let wallet = Wallet::new().unwrap();
        let utxos = index();

        let block = genesis_block(&wallet);
        utxos.update(&block).unwrap();

        let key_hash = hash_public_key(wallet.public_key());
        let outputs = utxos.unspent_outputs_for(&key_hash).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].value, COINBASE_REWARD);
    }

    #[test]
    fn test_update_removes_spent_outputs_and_empty_entries() {
        let owner = Wallet::new().unwrap();
        let recipient = Wallet::new().unwrap();
        let utxos = index();

        let genesis = genesis_block(&owner);
        utxos.update(&genesis).unwrap();
        let coinbase = &genesis.transactions[0];

        // Spend the whole coinbase into the recipient
        let input = TxInput {
            prev_tx_id: coinbase.id.clone(),
            output_index: 0,
            signature: Vec::new(),
            public_key: owner.public_key().to_vec(),
        };
        let output = crate::blockchain::transaction::TxOutput::locked_to(
            COINBASE_REWARD,
            &recipient.address(),
        )
        .unwrap();
        let spend = Transaction::new_standard(vec![input], vec![output]).unwrap();
        let block = Block::mine(vec![spend.clone()], genesis.hash.clone()).unwrap();

        utxos.update(&block).unwrap();

        // The coinbase entry is deleted outright, not left empty
        let snapshot = utxos.snapshot().unwrap();
        assert!(!snapshot.contains_key(&coinbase.id));
        assert!(snapshot.contains_key(&spend.id));

        let owner_hash = hash_public_key(owner.public_key());
        assert!(utxos.unspent_outputs_for(&owner_hash).unwrap().is_empty());

        let recipient_hash = hash_public_key(recipient.public_key());
        let outputs = utxos.unspent_outputs_for(&recipient_hash).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].value, COINBASE_REWARD);
    }

    #[test]
    fn test_find_spendable_outputs_accumulates_to_amount() {
        let wallet = Wallet::new().unwrap();
        let utxos = index();

        // Two separate coinbase rewards to the same owner
        let first = genesis_block(&wallet);
        utxos.update(&first).unwrap();
        let second = Block::mine(
            vec![Transaction::new_coinbase(&wallet.address(), b"again").unwrap()],
            first.hash.clone(),
        )
        .unwrap();
        utxos.update(&second).unwrap();

        let key_hash = hash_public_key(wallet.public_key());

        // One reward is enough: selection stops once the total is reached
        let (total, selected) = utxos
            .find_spendable_outputs(&key_hash, COINBASE_REWARD)
            .unwrap();
        assert_eq!(total, COINBASE_REWARD);
        assert_eq!(selected.values().map(|v| v.len()).sum::<usize>(), 1);

        // Both rewards are needed for anything above one reward
        let (total, selected) = utxos
            .find_spendable_outputs(&key_hash, COINBASE_REWARD + 1)
            .unwrap();
        assert_eq!(total, 2 * COINBASE_REWARD);
        assert_eq!(selected.values().map(|v| v.len()).sum::<usize>(), 2);
    }

    #[test]
    fn test_find_spendable_outputs_reports_shortfall() {
        let wallet = Wallet::new().unwrap();
        let utxos = index();

        let block = genesis_block(&wallet);
        utxos.update(&block).unwrap();

        let key_hash = hash_public_key(wallet.public_key());
        let (total, _) = utxos
            .find_spendable_outputs(&key_hash, 10 * COINBASE_REWARD)
            .unwrap();
        assert!(total < 10 * COINBASE_REWARD);
        assert_eq!(total, COINBASE_REWARD);
    }
}
