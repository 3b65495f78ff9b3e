use log::info;
use p256::ecdsa::SigningKey;
use thiserror::Error;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::block::Block;
use super::iterator::ChainIterator;
use super::pow::{PowError, ProofOfWork};
use super::storage::{StorageError, Store};
use super::transaction::{Transaction, TransactionError, TxInput, TxOutput};
use super::utxo::{UtxoEntry, UtxoError, UtxoIndex};
use crate::wallet::{self, WalletError, Wallets};

/// Memo recorded by the genesis coinbase
const GENESIS_MEMO: &[u8] = b"ferrocoin genesis block";

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("utxo index error: {0}")]
    Utxo(#[from] UtxoError),

    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("proof of work error: {0}")]
    Pow(#[from] PowError),

    #[error("a ledger already exists in this store")]
    AlreadyExists,

    #[error("no ledger exists in this store")]
    NotInitialized,

    #[error("transaction {0} not found in chain history")]
    TransactionNotFound(String),

    #[error("block {0} fails proof of work validation")]
    InvalidProofOfWork(String),
}

/// The authoritative, persisted, append-only chain of blocks
///
/// Owns the tip pointer and orchestrates mining: signature verification
/// against chain history, proof-of-work sealing, and the atomic commit of
/// block, tip and unspent-output index.
#[derive(Debug)]
pub struct Ledger {
    store: Arc<Store>,
    utxos: UtxoIndex,
    tip: Vec<u8>,
}

impl Ledger {
    /// Creates a fresh ledger whose genesis coinbase rewards the given
    /// address
    ///
    /// Fails if the store already holds a chain.
    pub fn create(store: Arc<Store>, reward_address: &str) -> Result<Self, LedgerError> {
        if store.tip()?.is_some() {
            return Err(LedgerError::AlreadyExists);
        }

        let coinbase = Transaction::new_coinbase(reward_address, GENESIS_MEMO)?;
        let genesis = Block::mine(vec![coinbase], Vec::new())?;

        let utxos = UtxoIndex::new(Arc::clone(&store));
        let delta = utxos.plan_block_update(&genesis)?;
        store.commit_block(&genesis, &delta)?;

        info!("created ledger, genesis block {}", hex::encode(&genesis.hash));
        Ok(Ledger {
            tip: genesis.hash.clone(),
            store,
            utxos,
        })
    }

    /// Opens an existing ledger; fails if the store holds no chain
    pub fn open(store: Arc<Store>) -> Result<Self, LedgerError> {
        let tip = store.tip()?.ok_or(LedgerError::NotInitialized)?;
        let utxos = UtxoIndex::new(Arc::clone(&store));
        Ok(Ledger { store, utxos, tip })
    }

    /// Hash of the most recently committed block
    pub fn tip(&self) -> &[u8] {
        &self.tip
    }

    pub fn utxos(&self) -> &UtxoIndex {
        &self.utxos
    }

    /// Backward cursor from the current tip
    pub fn iterator(&self) -> ChainIterator {
        ChainIterator::new(self.tip.clone(), Arc::clone(&self.store))
    }

    /// Verifies, seals and commits a new block of transactions
    ///
    /// Every standard transaction is verified against resolved chain
    /// history first; any failure aborts the attempt with nothing
    /// persisted. The sealed block, the advanced tip, the transaction
    /// location index and the unspent-output delta are committed as one
    /// atomic storage transaction.
    pub fn mine_block(&mut self, transactions: Vec<Transaction>) -> Result<Block, LedgerError> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(LedgerError::Transaction(TransactionError::InvalidSignature));
            }
        }

        let block = Block::mine(transactions, self.tip.clone())?;
        if !ProofOfWork::new(&block).is_valid() {
            return Err(LedgerError::InvalidProofOfWork(hex::encode(&block.hash)));
        }

        let delta = self.utxos.plan_block_update(&block)?;
        self.store.commit_block(&block, &delta)?;
        self.tip = block.hash.clone();

        info!(
            "mined block {} with {} transactions",
            hex::encode(&block.hash),
            block.transactions.len()
        );
        Ok(block)
    }

    /// Locates a transaction anywhere in chain history by id
    ///
    /// The secondary location index is consulted first; a full backward
    /// scan from the tip remains the authoritative fallback, and not-found
    /// is only reported once that scan has reached genesis.
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, LedgerError> {
        if let Some(block_hash) = self.store.transaction_location(id)? {
            let block = self.store.get_block(&block_hash)?;
            if let Some(tx) = block.transactions.iter().find(|tx| tx.id == id) {
                return Ok(tx.clone());
            }
        }

        for block in self.iterator() {
            let block = block?;
            if let Some(tx) = block.transactions.iter().find(|tx| tx.id == id) {
                return Ok(tx.clone());
            }
        }

        Err(LedgerError::TransactionNotFound(hex::encode(id)))
    }

    /// Resolves, for every input, the prior transaction that produced the
    /// referenced output
    fn resolve_prior_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<String, Transaction>, LedgerError> {
        let mut prev_txs = HashMap::new();
        for input in tx.inputs() {
            let prev = self.find_transaction(&input.prev_tx_id)?;
            prev_txs.insert(hex::encode(&input.prev_tx_id), prev);
        }
        Ok(prev_txs)
    }

    /// Signs a transaction's inputs against their resolved prior outputs
    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        signing_key: &SigningKey,
    ) -> Result<(), LedgerError> {
        let prev_txs = self.resolve_prior_transactions(tx)?;
        tx.sign(signing_key, &prev_txs)?;
        Ok(())
    }

    /// Verifies a transaction's signatures against chain history; coinbase
    /// transactions are always valid
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, LedgerError> {
        if tx.is_coinbase() {
            return Ok(true);
        }

        let prev_txs = self.resolve_prior_transactions(tx)?;
        Ok(tx.verify(&prev_txs)?)
    }

    /// Sum of all unspent outputs locked to the given address
    pub fn get_balance(&self, address: &str) -> Result<u64, LedgerError> {
        let pub_key_hash = wallet::pub_key_hash_from_address(address)?;
        let outputs = self.utxos.unspent_outputs_for(&pub_key_hash)?;
        Ok(outputs.iter().map(|output| output.value).sum())
    }

    /// Builds and signs a payment of `amount` from one address to another
    ///
    /// Sources are selected greedily from the unspent-output index; any
    /// excess over `amount` is returned to the sender as a change output.
    /// Rejects a zero amount and insufficient funds before any state is
    /// touched.
    pub fn new_transaction(
        &self,
        wallets: &Wallets,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<Transaction, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::Transaction(TransactionError::InvalidAmount(
                "send amount must be positive".to_string(),
            )));
        }

        let sender = wallets.get(from)?;
        let pub_key_hash = wallet::hash_public_key(sender.public_key());

        let (accumulated, selected) = self.utxos.find_spendable_outputs(&pub_key_hash, amount)?;
        if accumulated < amount {
            return Err(LedgerError::Transaction(
                TransactionError::InsufficientFunds {
                    required: amount,
                    available: accumulated,
                },
            ));
        }

        let mut inputs = Vec::new();
        for (prev_tx_id, indices) in selected {
            for index in indices {
                inputs.push(TxInput {
                    prev_tx_id: prev_tx_id.clone(),
                    output_index: index,
                    signature: Vec::new(),
                    public_key: sender.public_key().to_vec(),
                });
            }
        }

        let mut outputs = vec![TxOutput::locked_to(amount, to)?];
        if accumulated > amount {
            // Change back to the sender
            outputs.push(TxOutput::locked_to(accumulated - amount, from)?);
        }

        let mut tx = Transaction::new_standard(inputs, outputs)?;
        self.sign_transaction(&mut tx, sender.signing_key())?;
        Ok(tx)
    }

    /// Computes the unspent-output map from a full backward chain walk
    ///
    /// The chain is visited tip-first, so every spend is recorded before
    /// the transaction that produced the spent output is reached.
    fn collect_unspent_outputs(&self) -> Result<HashMap<Vec<u8>, UtxoEntry>, LedgerError> {
        let mut spent: HashMap<Vec<u8>, HashSet<u32>> = HashMap::new();
        let mut unspent: HashMap<Vec<u8>, UtxoEntry> = HashMap::new();

        for block in self.iterator() {
            let block = block?;
            for tx in &block.transactions {
                let spent_here = spent.get(&tx.id);
                let outputs: UtxoEntry = tx
                    .outputs()
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| {
                        spent_here.map_or(true, |s| !s.contains(&(*index as u32)))
                    })
                    .map(|(index, output)| (index as u32, output.clone()))
                    .collect();

                if !outputs.is_empty() {
                    unspent.insert(tx.id.clone(), outputs);
                }

                for input in tx.inputs() {
                    spent
                        .entry(input.prev_tx_id.clone())
                        .or_default()
                        .insert(input.output_index);
                }
            }
        }

        Ok(unspent)
    }

    /// Rebuilds the persisted unspent-output index from the chain
    ///
    /// Replaces the whole index; used at recovery time and as the arbiter
    /// of index correctness.
    pub fn reindex_utxos(&self) -> Result<usize, LedgerError> {
        let unspent = self.collect_unspent_outputs()?;
        let count = self.utxos.replace(unspent)?;
        info!("reindexed utxo set, {} entries", count);
        Ok(count)
    }

    /// Compares the live index against a fresh rebuild
    ///
    /// Divergence means the index missed an update; the remedy is a full
    /// `reindex_utxos`, never incremental repair.
    pub fn check_utxo_consistency(&self) -> Result<(), LedgerError> {
        let rebuilt = self.collect_unspent_outputs()?;
        let live = self.utxos.snapshot()?;

        if rebuilt != live {
            return Err(LedgerError::Utxo(UtxoError::IndexDiverged));
        }
        Ok(())
    }
}
