//! ferrocoin: a minimal single-node UTXO cryptocurrency ledger.
//!
//! The chain is an append-only sequence of proof-of-work sealed blocks
//! holding signed value-transfer transactions, persisted in an embedded
//! sled database and indexed by a derived unspent-output cache:
//!
//! - [`blockchain`] - blocks, transactions, proof-of-work, the UTXO index
//!   and the persisted ledger itself
//! - [`wallet`] - P-256 key pairs, base58check addresses and the wallet file
//! - [`cli`] - the command-line surface over the ledger API

pub mod blockchain;
pub mod cli;
pub mod wallet;

pub use blockchain::{Block, ChainIterator, Ledger, LedgerError, Store, Transaction};
pub use wallet::{Wallet, Wallets};
