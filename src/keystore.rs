use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::Zeroizing;

use crate::credentials::{Credentials, CredentialsError};
use crate::derivation::{DerivationError, DerivationPath, ExtendedKey, SERIALIZED_LEN};

// Seed retries when the HMAC left half falls outside the curve order.
const GENERATE_ATTEMPTS: usize = 4;

#[derive(Debug)]
pub enum KeystoreError {
    Credentials(CredentialsError),
    Derivation(DerivationError),
    RngUnavailable,
    NotPrivate,
    InvalidBlob,
}

impl fmt::Display for KeystoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeystoreError::Credentials(e) => write!(f, "Credentials error: {}", e),
            KeystoreError::Derivation(e) => write!(f, "Derivation error: {}", e),
            KeystoreError::RngUnavailable => write!(f, "System entropy unavailable"),
            KeystoreError::NotPrivate => write!(f, "Extended key is not private"),
            KeystoreError::InvalidBlob => write!(f, "Invalid encrypted key blob"),
        }
    }
}

impl std::error::Error for KeystoreError {}

impl From<CredentialsError> for KeystoreError {
    fn from(err: CredentialsError) -> Self {
        KeystoreError::Credentials(err)
    }
}

impl From<DerivationError> for KeystoreError {
    fn from(err: DerivationError) -> Self {
        KeystoreError::Derivation(err)
    }
}

/// Encrypts a private node into an `ext_prv_enc` blob.
fn encrypt_node(credentials: &Credentials, node: &ExtendedKey) -> Result<Vec<u8>, KeystoreError> {
    let serialized = Zeroizing::new(node.serialize_private()?);
    Ok(credentials.encrypt(&serialized)?)
}

/// Derives a master node from a seed and returns it encrypted.
pub fn derive_master(credentials: &Credentials, seed: &[u8]) -> Result<Vec<u8>, KeystoreError> {
    let node = ExtendedKey::from_seed(seed)?;
    encrypt_node(credentials, &node)
}

/// Generates a master node from fresh CSPRNG seed material.
pub fn generate_master(credentials: &Credentials) -> Result<Vec<u8>, KeystoreError> {
    for _ in 0..GENERATE_ATTEMPTS {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(seed.as_mut_slice())
            .map_err(|_| KeystoreError::RngUnavailable)?;
        match ExtendedKey::from_seed(seed.as_ref()) {
            Ok(node) => return encrypt_node(credentials, &node),
            Err(DerivationError::KeyDerivationFailed) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(KeystoreError::Derivation(
        DerivationError::KeyDerivationFailed,
    ))
}

/// Re-encrypts an imported base58 extended private key.
pub fn import_master(
    credentials: &Credentials,
    ext_prv_b58: &str,
) -> Result<Vec<u8>, KeystoreError> {
    let node = ExtendedKey::from_base58(ext_prv_b58)?;
    if !node.is_private() {
        return Err(KeystoreError::NotPrivate);
    }
    encrypt_node(credentials, &node)
}

/// Decrypts an `ext_prv_enc` blob back into a private node.
pub fn restore_private(
    credentials: &Credentials,
    ext_prv_enc: &[u8],
) -> Result<ExtendedKey, KeystoreError> {
    let serialized = credentials.decrypt(ext_prv_enc)?;
    if serialized.len() != SERIALIZED_LEN {
        return Err(KeystoreError::InvalidBlob);
    }
    let node = ExtendedKey::deserialize(&serialized)?;
    if !node.is_private() {
        return Err(KeystoreError::NotPrivate);
    }
    Ok(node)
}

/// Restores a watch-only node from its base58 public serialization.
pub fn restore_public(ext_pub_b58: &str) -> Result<ExtendedKey, KeystoreError> {
    let node = ExtendedKey::from_base58(ext_pub_b58)?;
    Ok(node.neuter())
}

/// Derives a child along `path` and returns it encrypted.
pub fn derive_child_encrypted(
    credentials: &Credentials,
    master: &ExtendedKey,
    path: &str,
) -> Result<Vec<u8>, KeystoreError> {
    let path = DerivationPath::from_str(path)?;
    let child = path.derive(master)?;
    encrypt_node(credentials, &child)
}

/// Derives a watch-only child along `path`.
pub fn derive_child_public(master: &ExtendedKey, path: &str) -> Result<String, KeystoreError> {
    let path = DerivationPath::from_str(path)?;
    let child = path.derive(master)?;
    Ok(child.to_base58_public())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked_credentials() -> Credentials {
        let mut credentials = Credentials::new();
        credentials.set_passphrase("test").unwrap();
        credentials
    }

    #[test]
    fn master_blob_round_trip() {
        let credentials = unlocked_credentials();
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();

        let blob = derive_master(&credentials, &seed).unwrap();
        let node = restore_private(&credentials, &blob).unwrap();
        assert!(node.is_private());
        assert!(node.is_master());
        assert_eq!(node.fingerprint(), [0x34, 0x42, 0x19, 0x3e]);
    }

    #[test]
    fn restore_fails_locked() {
        let mut credentials = unlocked_credentials();
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let blob = derive_master(&credentials, &seed).unwrap();

        credentials.lock();
        assert!(matches!(
            restore_private(&credentials, &blob),
            Err(KeystoreError::Credentials(CredentialsError::Locked))
        ));
    }

    #[test]
    fn generate_produces_distinct_masters() {
        let credentials = unlocked_credentials();
        let a = generate_master(&credentials).unwrap();
        let b = generate_master(&credentials).unwrap();
        let node_a = restore_private(&credentials, &a).unwrap();
        let node_b = restore_private(&credentials, &b).unwrap();
        assert_ne!(node_a.public_key, node_b.public_key);
    }

    #[test]
    fn import_rejects_public_key() {
        let credentials = unlocked_credentials();
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let node = ExtendedKey::from_seed(&seed).unwrap();
        assert!(matches!(
            import_master(&credentials, &node.to_base58_public()),
            Err(KeystoreError::NotPrivate)
        ));
        let blob = import_master(&credentials, &node.to_base58_private().unwrap()).unwrap();
        let restored = restore_private(&credentials, &blob).unwrap();
        assert_eq!(restored.public_key, node.public_key);
    }

    #[test]
    fn child_derivation_public_and_encrypted_agree() {
        let credentials = unlocked_credentials();
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let master = ExtendedKey::from_seed(&seed).unwrap();

        let blob = derive_child_encrypted(&credentials, &master, "m/0'").unwrap();
        let child = restore_private(&credentials, &blob).unwrap();
        assert_eq!(child.fingerprint(), [0x5c, 0x1b, 0xd6, 0x48]);

        // Watch-only derivation of the same non-hardened subtree lines up.
        let pub_b58 = derive_child_public(&child.neuter(), "m/0/0").unwrap();
        let prv = child.derive_child(0).unwrap().derive_child(0).unwrap();
        assert_eq!(pub_b58, prv.to_base58_public());
    }

    #[test]
    fn hardened_watch_only_fails() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let master = ExtendedKey::from_seed(&seed).unwrap().neuter();
        assert!(matches!(
            derive_child_public(&master, "m/0'"),
            Err(KeystoreError::Derivation(
                DerivationError::HardenedFromPublic
            ))
        ));
    }
}
