use p256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use thiserror::Error;

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::blockchain::hashing::{double_sha256, sha256};

/// Version byte prefixed to every address payload
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address payload
const CHECKSUM_LEN: usize = 4;

/// Errors that can occur during wallet operations
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address checksum mismatch")]
    ChecksumMismatch,

    #[error("no wallet stored for address {0}")]
    UnknownAddress(String),

    #[error("invalid key encoding: {0}")]
    KeyEncoding(#[from] hex::FromHexError),

    #[error("wallet file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wallet file encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// A P-256 key pair and the address derived from it
///
/// The public key is kept as 64 raw bytes: the X and Y affine coordinates
/// concatenated, without any encoding prefix.
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    public_key: Vec<u8>,
    address: String,
}

impl Wallet {
    /// Creates a wallet with a freshly generated key pair
    pub fn new() -> Result<Self, WalletError> {
        let signing_key = SigningKey::random(&mut OsRng);
        Ok(Self::from_signing_key(signing_key))
    }

    /// Restores a wallet from raw private key bytes
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, WalletError> {
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        // Uncompressed SEC1 encoding is 0x04 || X || Y; keep the raw
        // coordinates only
        let point = verifying_key.to_encoded_point(false);
        let public_key = point.as_bytes()[1..].to_vec();
        let address = derive_address(&hash_public_key(&public_key));

        Wallet {
            signing_key,
            public_key,
            address,
        }
    }

    /// The base58check address owning this wallet's outputs
    pub fn address(&self) -> String {
        self.address.clone()
    }

    /// Raw `X || Y` public key bytes
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Raw private key bytes, for persistence
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

/// RIPEMD160(SHA256(public key)), the hash outputs are locked with
pub fn hash_public_key(public_key: &[u8]) -> Vec<u8> {
    let sha = sha256(public_key);
    let mut hasher = Ripemd160::new();
    hasher.update(&sha);
    hasher.finalize().to_vec()
}

/// First four bytes of a double SHA-256 over the payload
fn checksum(payload: &[u8]) -> Vec<u8> {
    double_sha256(payload)[..CHECKSUM_LEN].to_vec()
}

/// base58(version || pub_key_hash || checksum)
fn derive_address(pub_key_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(1 + pub_key_hash.len() + CHECKSUM_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pub_key_hash);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    bs58::encode(payload).into_string()
}

/// Decodes an address back to the public key hash it wraps, validating the
/// checksum
pub fn pub_key_hash_from_address(address: &str) -> Result<Vec<u8>, WalletError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))?;

    if decoded.len() <= 1 + CHECKSUM_LEN {
        return Err(WalletError::InvalidAddress("address too short".to_string()));
    }

    let (payload, check) = decoded.split_at(decoded.len() - CHECKSUM_LEN);
    if checksum(payload) != check {
        return Err(WalletError::ChecksumMismatch);
    }

    Ok(payload[1..].to_vec())
}

/// Whether a string is a well-formed address with a valid checksum
pub fn validate_address(address: &str) -> bool {
    pub_key_hash_from_address(address).is_ok()
}

/// Serialized form of one key pair in the wallet file
#[derive(Serialize, Deserialize)]
struct StoredKeyPair {
    secret_key: String,
    public_key: String,
}

/// A persisted collection of wallets, keyed by address
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
}

impl Wallets {
    pub fn new() -> Self {
        Wallets {
            wallets: HashMap::new(),
        }
    }

    /// Loads the collection from a JSON file; a missing file yields an
    /// empty collection
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        if !path.as_ref().exists() {
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path)?;
        let stored: HashMap<String, StoredKeyPair> = serde_json::from_str(&content)?;

        let mut wallets = HashMap::with_capacity(stored.len());
        for pair in stored.into_values() {
            let secret = hex::decode(&pair.secret_key)?;
            let wallet = Wallet::from_secret_bytes(&secret)?;
            wallets.insert(wallet.address(), wallet);
        }

        Ok(Wallets { wallets })
    }

    /// Writes the collection out as JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let stored: HashMap<&String, StoredKeyPair> = self
            .wallets
            .iter()
            .map(|(address, wallet)| {
                (
                    address,
                    StoredKeyPair {
                        secret_key: hex::encode(wallet.secret_bytes()),
                        public_key: hex::encode(wallet.public_key()),
                    },
                )
            })
            .collect();

        fs::write(path, serde_json::to_string_pretty(&stored)?)?;
        Ok(())
    }

    /// Creates a new key pair and returns its address
    pub fn create(&mut self) -> Result<String, WalletError> {
        let wallet = Wallet::new()?;
        let address = wallet.address();
        self.wallets.insert(address.clone(), wallet);
        Ok(address)
    }

    /// Looks up the key pair owning an address
    pub fn get(&self, address: &str) -> Result<&Wallet, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// All stored addresses
    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }
}

impl Default for Wallets {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let wallet = Wallet::new().unwrap();
        let address = wallet.address();

        assert!(validate_address(&address));
        let decoded = pub_key_hash_from_address(&address).unwrap();
        assert_eq!(decoded, hash_public_key(wallet.public_key()));
    }

    #[test]
    fn test_public_key_is_raw_coordinates() {
        let wallet = Wallet::new().unwrap();
        assert_eq!(wallet.public_key().len(), 64);
    }

    #[test]
    fn test_tampered_address_fails_checksum() {
        let wallet = Wallet::new().unwrap();
        let address = wallet.address();

        // Swap a character for a different base58 character
        let mut chars: Vec<char> = address.chars().collect();
        chars[4] = if chars[4] == '2' { '3' } else { '2' };
        let tampered: String = chars.into_iter().collect();

        assert!(!validate_address(&tampered));
    }

    #[test]
    fn test_garbage_address_rejected() {
        assert!(!validate_address("not an address 0OIl"));
        assert!(!validate_address(""));
    }

    #[test]
    fn test_secret_round_trip() {
        let wallet = Wallet::new().unwrap();
        let restored = Wallet::from_secret_bytes(&wallet.secret_bytes()).unwrap();
        assert_eq!(restored.address(), wallet.address());
        assert_eq!(restored.public_key(), wallet.public_key());
    }

    #[test]
    fn test_wallets_save_and_load() {
        let dir = std::env::temp_dir().join(format!("ferrocoin-wallets-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("wallets.json");

        let mut wallets = Wallets::new();
        let a = wallets.create().unwrap();
        let b = wallets.create().unwrap();
        wallets.save(&path).unwrap();

        let loaded = Wallets::open(&path).unwrap();
        let mut expected = vec![a.clone(), b.clone()];
        let mut actual = loaded.addresses();
        expected.sort();
        actual.sort();
        assert_eq!(actual, expected);

        assert_eq!(
            loaded.get(&a).unwrap().public_key(),
            wallets.get(&a).unwrap().public_key()
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_wallet_file_yields_empty_collection() {
        let wallets = Wallets::open("/nonexistent/wallets.json").unwrap();
        assert!(wallets.addresses().is_empty());
    }

    #[test]
    fn test_unknown_address_lookup_fails() {
        let wallets = Wallets::new();
        let err = wallets.get("nowhere").unwrap_err();
        assert!(matches!(err, WalletError::UnknownAddress(_)));
    }
}
