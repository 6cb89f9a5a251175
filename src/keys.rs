use bitcoin_hashes::{hash160, sha256d, Hash};
use secp256k1::{PublicKey, SecretKey};
use std::fmt;

// Version prefixes for base58check payloads on the main network.
const ADDRESS_VERSION: u8 = 0x00;
const WIF_VERSION: u8 = 0x80;

const CHECKSUM_LEN: usize = 4;

#[derive(Debug, PartialEq, Eq)]
pub enum KeyError {
    InvalidBase58,
    InvalidChecksum,
    InvalidAddress,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyError::InvalidBase58 => write!(f, "Invalid base58 string"),
            KeyError::InvalidChecksum => write!(f, "Base58check checksum mismatch"),
            KeyError::InvalidAddress => write!(f, "Invalid address"),
        }
    }
}

impl std::error::Error for KeyError {}

/// RIPEMD160(SHA256(compressed public key)).
pub fn pubkey_hash160(public_key: &PublicKey) -> [u8; 20] {
    let hash = hash160::Hash::hash(&public_key.serialize());
    hash.to_byte_array()
}

pub fn base58check_encode(payload: &[u8]) -> String {
    let mut bytes = payload.to_vec();
    let checksum = sha256d::Hash::hash(&bytes);
    bytes.extend_from_slice(&checksum[0..CHECKSUM_LEN]);
    bs58::encode(bytes).into_string()
}

pub fn base58check_decode(encoded: &str) -> Result<Vec<u8>, KeyError> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| KeyError::InvalidBase58)?;
    if bytes.len() < CHECKSUM_LEN + 1 {
        return Err(KeyError::InvalidBase58);
    }
    let (payload, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let expected = sha256d::Hash::hash(payload);
    if checksum != &expected[0..CHECKSUM_LEN] {
        return Err(KeyError::InvalidChecksum);
    }
    Ok(payload.to_vec())
}

/// Renders a hash160 as a Pay-to-PubKey-Hash address.
pub fn hash160_to_address(hash160: &[u8; 20]) -> String {
    let mut payload = vec![ADDRESS_VERSION];
    payload.extend_from_slice(hash160);
    base58check_encode(&payload)
}

pub fn address_to_hash160(addr_b58: &str) -> Result<[u8; 20], KeyError> {
    let payload = base58check_decode(addr_b58)?;
    if payload.len() != 21 || payload[0] != ADDRESS_VERSION {
        return Err(KeyError::InvalidAddress);
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Ok(hash)
}

/// WIF encoding of a secret key, compressed-pubkey flavor.
pub fn secret_to_wif(secret: &SecretKey) -> String {
    let mut payload = vec![WIF_VERSION];
    payload.extend_from_slice(&secret.secret_bytes());
    payload.push(0x01); // compression flag
    base58check_encode(&payload)
}
