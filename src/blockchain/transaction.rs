use log::warn;
use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::HashMap;
use std::fmt;

use super::hashing::sha256;
use crate::wallet::{self, WalletError};

/// Amount of coins awarded by a coinbase transaction
pub const COINBASE_REWARD: u64 = 1000;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("invalid input signature")]
    InvalidSignature,

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("coinbase transactions carry no signable inputs")]
    CoinbaseInput,

    #[error("referenced transaction {0} was not resolved")]
    MissingPriorTransaction(String),

    #[error("transaction {tx} has no output at index {index}")]
    MissingPriorOutput { tx: String, index: u32 },

    #[error("signing failed: {0}")]
    SigningError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("address error: {0}")]
    AddressError(#[from] WalletError),
}

/// A transaction input spending one output of a prior transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction that produced the spent output
    pub prev_tx_id: Vec<u8>,

    /// Index of the spent output within that transaction
    pub output_index: u32,

    /// ECDSA signature over the per-input signing digest, as concatenated
    /// big-endian `r || s`
    pub signature: Vec<u8>,

    /// Raw public key of the spender, as concatenated `X || Y` coordinates
    pub public_key: Vec<u8>,
}

/// A transaction output locking an amount to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,

    /// RIPEMD160(SHA256(public key)) of the owner, not the address string
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output locked to the owner of the given address
    pub fn locked_to(value: u64, address: &str) -> Result<Self, TransactionError> {
        if value == 0 {
            return Err(TransactionError::InvalidAmount(
                "output value must be positive".to_string(),
            ));
        }

        let pub_key_hash = wallet::pub_key_hash_from_address(address)?;
        Ok(TxOutput { value, pub_key_hash })
    }

    /// Whether this output can be spent by the owner of the given key hash
    pub fn is_locked_with(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// The two kinds of transaction the ledger records
///
/// The coinbase case is a distinct variant rather than a sentinel input, so
/// its exemption from signature verification and fund checks is a type-level
/// fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxPayload {
    /// A mining reward with no real input
    Coinbase { reward: TxOutput, memo: Vec<u8> },

    /// A signed value transfer
    Standard {
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
    },
}

/// A value-transfer record, identified by the hash of its own content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// SHA-256 of the serialized transaction with this field cleared
    pub id: Vec<u8>,

    pub payload: TxPayload,
}

impl Transaction {
    /// Creates a reward transaction for mining a block
    ///
    /// An empty memo is replaced with random bytes so that two rewards to
    /// the same address never collide on the same id.
    pub fn new_coinbase(to: &str, memo: &[u8]) -> Result<Self, TransactionError> {
        let memo = if memo.is_empty() {
            let mut data = [0u8; 20];
            OsRng.fill_bytes(&mut data);
            data.to_vec()
        } else {
            memo.to_vec()
        };

        let reward = TxOutput::locked_to(COINBASE_REWARD, to)?;

        let mut tx = Transaction {
            id: Vec::new(),
            payload: TxPayload::Coinbase { reward, memo },
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Creates an unsigned standard transaction from prepared inputs and
    /// outputs
    pub fn new_standard(
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
    ) -> Result<Self, TransactionError> {
        let mut tx = Transaction {
            id: Vec::new(),
            payload: TxPayload::Standard { inputs, outputs },
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.payload, TxPayload::Coinbase { .. })
    }

    /// All outputs of the transaction, the coinbase reward included
    pub fn outputs(&self) -> &[TxOutput] {
        match &self.payload {
            TxPayload::Coinbase { reward, .. } => std::slice::from_ref(reward),
            TxPayload::Standard { outputs, .. } => outputs,
        }
    }

    /// Inputs of a standard transaction; a coinbase has none
    pub fn inputs(&self) -> &[TxInput] {
        match &self.payload {
            TxPayload::Coinbase { .. } => &[],
            TxPayload::Standard { inputs, .. } => inputs,
        }
    }

    /// SHA-256 of the serialized transaction with the id field cleared
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let preimage = Transaction {
            id: Vec::new(),
            payload: self.payload.clone(),
        };
        let bytes = bincode::serialize(&preimage)
            .map_err(|e| TransactionError::SerializationError(e.to_string()))?;
        Ok(sha256(&bytes))
    }

    /// Computes the digest input `input_index` is signed against
    ///
    /// The digest covers a trimmed view of the transaction: every input's
    /// signature and public key cleared, except that the signed input
    /// carries the public key hash of the exact prior output it spends. The
    /// transaction itself is never mutated, and each input gets a distinct
    /// digest.
    fn signing_digest(
        &self,
        input_index: usize,
        prev_pub_key_hash: &[u8],
    ) -> Result<Vec<u8>, TransactionError> {
        let (inputs, outputs) = match &self.payload {
            TxPayload::Standard { inputs, outputs } => (inputs, outputs),
            TxPayload::Coinbase { .. } => return Err(TransactionError::CoinbaseInput),
        };

        let trimmed_inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| TxInput {
                prev_tx_id: input.prev_tx_id.clone(),
                output_index: input.output_index,
                signature: Vec::new(),
                public_key: if i == input_index {
                    prev_pub_key_hash.to_vec()
                } else {
                    Vec::new()
                },
            })
            .collect();

        let trimmed = Transaction {
            id: Vec::new(),
            payload: TxPayload::Standard {
                inputs: trimmed_inputs,
                outputs: outputs.clone(),
            },
        };
        trimmed.hash()
    }

    /// Signs every input against the prior transactions it spends
    ///
    /// `prev_txs` maps hex-encoded transaction ids to the resolved prior
    /// transactions; every input's referenced transaction must be present.
    /// Signing a coinbase is a no-op.
    pub fn sign(
        &mut self,
        signing_key: &SigningKey,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        // Refuse to produce any signature while a referenced transaction is
        // missing from the resolved set
        for input in self.inputs() {
            let key = hex::encode(&input.prev_tx_id);
            if !prev_txs.contains_key(&key) {
                return Err(TransactionError::MissingPriorTransaction(key));
            }
        }

        for i in 0..self.inputs().len() {
            let digest = {
                let input = &self.inputs()[i];
                let prev = &prev_txs[&hex::encode(&input.prev_tx_id)];
                let prev_output = prev.outputs().get(input.output_index as usize).ok_or(
                    TransactionError::MissingPriorOutput {
                        tx: hex::encode(&input.prev_tx_id),
                        index: input.output_index,
                    },
                )?;
                self.signing_digest(i, &prev_output.pub_key_hash)?
            };

            let signature: Signature = signing_key
                .sign_prehash(&digest)
                .map_err(|e| TransactionError::SigningError(e.to_string()))?;

            if let TxPayload::Standard { inputs, .. } = &mut self.payload {
                inputs[i].signature = signature.to_bytes().to_vec();
            }
        }

        Ok(())
    }

    /// Verifies every input signature against the resolved prior outputs
    ///
    /// Returns true for coinbase transactions. Fails closed: a single input
    /// that does not verify, or whose signature or public key bytes cannot
    /// be reconstructed, invalidates the whole transaction.
    pub fn verify(
        &self,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        for (i, input) in self.inputs().iter().enumerate() {
            let key = hex::encode(&input.prev_tx_id);
            let prev = prev_txs
                .get(&key)
                .ok_or(TransactionError::MissingPriorTransaction(key))?;
            let prev_output = prev.outputs().get(input.output_index as usize).ok_or(
                TransactionError::MissingPriorOutput {
                    tx: hex::encode(&input.prev_tx_id),
                    index: input.output_index,
                },
            )?;

            let digest = self.signing_digest(i, &prev_output.pub_key_hash)?;

            let signature = match Signature::from_slice(&input.signature) {
                Ok(signature) => signature,
                Err(_) => {
                    warn!(
                        "input {} of tx {} carries an unparseable signature",
                        i,
                        hex::encode(&self.id)
                    );
                    return Ok(false);
                }
            };

            let verifying_key = match verifying_key_from_raw(&input.public_key) {
                Some(key) => key,
                None => {
                    warn!(
                        "input {} of tx {} carries an invalid public key",
                        i,
                        hex::encode(&self.id)
                    );
                    return Ok(false);
                }
            };

            if verifying_key.verify_prehash(&digest, &signature).is_err() {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Lifts raw `X || Y` coordinate bytes back onto the P-256 curve
fn verifying_key_from_raw(raw: &[u8]) -> Option<VerifyingKey> {
    if raw.len() != 64 {
        return None;
    }

    let x = p256::FieldBytes::from_slice(&raw[..32]);
    let y = p256::FieldBytes::from_slice(&raw[32..]);
    let point = p256::EncodedPoint::from_affine_coordinates(x, y, false);
    VerifyingKey::from_encoded_point(&point).ok()
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            TxPayload::Coinbase { reward, .. } => write!(
                f,
                "{} (coinbase, reward {} to {})",
                hex::encode(&self.id),
                reward.value,
                hex::encode(&reward.pub_key_hash),
            ),
            TxPayload::Standard { inputs, outputs } => {
                writeln!(
                    f,
                    "{} ({} inputs, {} outputs)",
                    hex::encode(&self.id),
                    inputs.len(),
                    outputs.len(),
                )?;
                for (i, input) in inputs.iter().enumerate() {
                    writeln!(
                        f,
                        "  in  {}: {}[{}]",
                        i,
                        hex::encode(&input.prev_tx_id),
                        input.output_index,
                    )?;
                }
                for (i, output) in outputs.iter().enumerate() {
                    write!(
                        f,
                        "  out {}: {} to {}",
                        i,
                        output.value,
                        hex::encode(&output.pub_key_hash),
                    )?;
                    if i + 1 < outputs.len() {
                        writeln!(f)?;
                    }
                }
                Ok(())
            }
        }
    }
}
