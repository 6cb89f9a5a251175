use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use std::fmt;

use crate::keys::{base58check_decode, base58check_encode, pubkey_hash160, KeyError};

pub const HARDENED_BIT: u32 = 0x8000_0000;

/// Serialized extended key length, checksum excluded.
pub const SERIALIZED_LEN: usize = 78;

const VERSION_PRIVATE: u32 = 0x0488_ADE4;
const VERSION_PUBLIC: u32 = 0x0488_B21E;

#[derive(Debug, PartialEq, Eq)]
pub enum DerivationError {
    InvalidSeed,
    InvalidPath,
    InvalidChildNumber,
    HardenedFromPublic,
    KeyDerivationFailed,
    NotPrivate,
    InvalidSerialization,
    InvalidChecksum,
    HmacError,
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DerivationError::InvalidSeed => write!(f, "Invalid seed"),
            DerivationError::InvalidPath => write!(f, "Invalid derivation path"),
            DerivationError::InvalidChildNumber => write!(f, "Invalid child number"),
            DerivationError::HardenedFromPublic => {
                write!(f, "Hardened derivation requires a private parent")
            }
            DerivationError::KeyDerivationFailed => write!(f, "Key derivation failed"),
            DerivationError::NotPrivate => write!(f, "Node has no private key"),
            DerivationError::InvalidSerialization => {
                write!(f, "Invalid extended key serialization")
            }
            DerivationError::InvalidChecksum => write!(f, "Extended key checksum mismatch"),
            DerivationError::HmacError => write!(f, "HMAC operation failed"),
        }
    }
}

impl std::error::Error for DerivationError {}

impl From<KeyError> for DerivationError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::InvalidChecksum => DerivationError::InvalidChecksum,
            _ => DerivationError::InvalidSerialization,
        }
    }
}

/// A BIP32 extended key. Watch-only nodes carry no secret half.
#[derive(Clone, Debug)]
pub struct ExtendedKey {
    pub private_key: Option<SecretKey>,
    pub public_key: PublicKey,
    pub chain_code: [u8; 32],
    pub depth: u8,
    pub parent_fingerprint: [u8; 4],
    pub child_number: u32,
}

impl ExtendedKey {
    /// Creates a master key from a seed via HMAC-SHA512 keyed "Bitcoin seed".
    pub fn from_seed(seed: &[u8]) -> Result<Self, DerivationError> {
        if seed.is_empty() {
            return Err(DerivationError::InvalidSeed);
        }
        let secp = Secp256k1::new();

        let mut hmac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
            .map_err(|_| DerivationError::HmacError)?;
        hmac.update(seed);
        let result = hmac.finalize().into_bytes();

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&result[32..64]);

        // Rejects a left half of zero or >= the curve order.
        let private_key = SecretKey::from_slice(&result[0..32])
            .map_err(|_| DerivationError::KeyDerivationFailed)?;
        let public_key = PublicKey::from_secret_key(&secp, &private_key);

        Ok(ExtendedKey {
            private_key: Some(private_key),
            public_key,
            chain_code,
            depth: 0,
            parent_fingerprint: [0u8; 4],
            child_number: 0,
        })
    }

    pub fn is_private(&self) -> bool {
        self.private_key.is_some()
    }

    pub fn is_master(&self) -> bool {
        self.depth == 0 && self.parent_fingerprint == [0u8; 4] && self.child_number == 0
    }

    /// First four bytes of RIPEMD160(SHA256(compressed public key)).
    pub fn fingerprint(&self) -> [u8; 4] {
        let hash = pubkey_hash160(&self.public_key);
        let mut fp = [0u8; 4];
        fp.copy_from_slice(&hash[0..4]);
        fp
    }

    /// The watch-only form of this node.
    pub fn neuter(&self) -> ExtendedKey {
        ExtendedKey {
            private_key: None,
            ..self.clone()
        }
    }

    /// Derives the child at `index`. Hardened indices need a private parent;
    /// out-of-range tweaks are reported so the caller can skip the index.
    pub fn derive_child(&self, index: u32) -> Result<Self, DerivationError> {
        let secp = Secp256k1::new();

        let mut data = Vec::with_capacity(37);
        if index & HARDENED_BIT != 0 {
            let secret = self
                .private_key
                .as_ref()
                .ok_or(DerivationError::HardenedFromPublic)?;
            data.push(0);
            data.extend_from_slice(&secret.secret_bytes());
        } else {
            data.extend_from_slice(&self.public_key.serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let mut hmac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|_| DerivationError::HmacError)?;
        hmac.update(&data);
        let result = hmac.finalize().into_bytes();

        let mut left = [0u8; 32];
        let mut chain_code = [0u8; 32];
        left.copy_from_slice(&result[0..32]);
        chain_code.copy_from_slice(&result[32..64]);

        let tweak =
            Scalar::from_be_bytes(left).map_err(|_| DerivationError::KeyDerivationFailed)?;

        let (private_key, public_key) = match &self.private_key {
            Some(secret) => {
                // child = (IL + parent) mod n; fails when the sum is zero.
                let child_secret = (*secret)
                    .add_tweak(&tweak)
                    .map_err(|_| DerivationError::KeyDerivationFailed)?;
                let child_public = PublicKey::from_secret_key(&secp, &child_secret);
                (Some(child_secret), child_public)
            }
            None => {
                // child = IL*G + parent; fails at the point at infinity.
                let tweak_key = SecretKey::from_slice(&left)
                    .map_err(|_| DerivationError::KeyDerivationFailed)?;
                let tweak_point = PublicKey::from_secret_key(&secp, &tweak_key);
                let child_public = self
                    .public_key
                    .combine(&tweak_point)
                    .map_err(|_| DerivationError::KeyDerivationFailed)?;
                (None, child_public)
            }
        };

        let depth = self
            .depth
            .checked_add(1)
            .ok_or(DerivationError::KeyDerivationFailed)?;

        Ok(ExtendedKey {
            private_key,
            public_key,
            chain_code,
            depth,
            parent_fingerprint: self.fingerprint(),
            child_number: index,
        })
    }

    fn serialize(&self, private: bool) -> Vec<u8> {
        let version = if private {
            VERSION_PRIVATE
        } else {
            VERSION_PUBLIC
        };
        let mut out = Vec::with_capacity(SERIALIZED_LEN);
        out.extend_from_slice(&version.to_be_bytes());
        out.push(self.depth);
        out.extend_from_slice(&self.parent_fingerprint);
        out.extend_from_slice(&self.child_number.to_be_bytes());
        out.extend_from_slice(&self.chain_code);
        if private {
            out.push(0);
            out.extend_from_slice(&self.private_key.as_ref().unwrap().secret_bytes());
        } else {
            out.extend_from_slice(&self.public_key.serialize());
        }
        out
    }

    /// The 78-byte public serialization.
    pub fn serialize_public(&self) -> Vec<u8> {
        self.serialize(false)
    }

    /// The 78-byte private serialization. Callers own wiping the result.
    pub fn serialize_private(&self) -> Result<Vec<u8>, DerivationError> {
        if !self.is_private() {
            return Err(DerivationError::NotPrivate);
        }
        Ok(self.serialize(true))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, DerivationError> {
        if data.len() != SERIALIZED_LEN {
            return Err(DerivationError::InvalidSerialization);
        }
        let secp = Secp256k1::new();

        let version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let depth = data[4];
        let mut parent_fingerprint = [0u8; 4];
        parent_fingerprint.copy_from_slice(&data[5..9]);
        let child_number = u32::from_be_bytes([data[9], data[10], data[11], data[12]]);
        if depth == 0 && (parent_fingerprint != [0u8; 4] || child_number != 0) {
            return Err(DerivationError::InvalidSerialization);
        }
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&data[13..45]);

        let (private_key, public_key) = match version {
            VERSION_PRIVATE => {
                if data[45] != 0 {
                    return Err(DerivationError::InvalidSerialization);
                }
                let secret = SecretKey::from_slice(&data[46..78])
                    .map_err(|_| DerivationError::InvalidSerialization)?;
                let public = PublicKey::from_secret_key(&secp, &secret);
                (Some(secret), public)
            }
            VERSION_PUBLIC => {
                let public = PublicKey::from_slice(&data[45..78])
                    .map_err(|_| DerivationError::InvalidSerialization)?;
                (None, public)
            }
            _ => return Err(DerivationError::InvalidSerialization),
        };

        Ok(ExtendedKey {
            private_key,
            public_key,
            chain_code,
            depth,
            parent_fingerprint,
            child_number,
        })
    }

    pub fn to_base58_public(&self) -> String {
        base58check_encode(&self.serialize_public())
    }

    pub fn to_base58_private(&self) -> Result<String, DerivationError> {
        Ok(base58check_encode(&self.serialize_private()?))
    }

    pub fn from_base58(encoded: &str) -> Result<Self, DerivationError> {
        let payload = base58check_decode(encoded)?;
        ExtendedKey::deserialize(&payload)
    }
}

/// A parsed derivation path, applied left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationPath {
    indices: Vec<u32>,
}

impl DerivationPath {
    /// Parses paths like `m/0'/1/2147483647`. The leading `m` is optional;
    /// `'` or `h` marks a hardened index.
    pub fn from_str(path: &str) -> Result<Self, DerivationError> {
        let indices: Result<Vec<u32>, _> = path
            .split('/')
            .enumerate()
            .filter(|(i, s)| !(*i == 0 && *s == "m") && !s.is_empty())
            .map(|(_, component)| {
                let hardened = component.ends_with('\'') || component.ends_with('h');
                let index_str = if hardened {
                    &component[..component.len() - 1]
                } else {
                    component
                };

                let index: u32 = index_str
                    .parse()
                    .map_err(|_| DerivationError::InvalidChildNumber)?;
                if index & HARDENED_BIT != 0 {
                    return Err(DerivationError::InvalidChildNumber);
                }
                Ok(if hardened { index | HARDENED_BIT } else { index })
            })
            .collect();

        indices.map(|indices| DerivationPath { indices })
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Walks the path starting from `root`.
    pub fn derive(&self, root: &ExtendedKey) -> Result<ExtendedKey, DerivationError> {
        let mut key = root.clone();
        for &index in &self.indices {
            key = key.derive_child(index)?;
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_from_hex(seed_hex: &str) -> ExtendedKey {
        ExtendedKey::from_seed(&hex::decode(seed_hex).unwrap()).unwrap()
    }

    // BIP32 test vector 1.
    #[test]
    fn vector1_master() {
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");
        assert_eq!(
            master.to_base58_public(),
            "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8"
        );
        assert_eq!(
            master.to_base58_private().unwrap(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(master.fingerprint(), [0x34, 0x42, 0x19, 0x3e]);
        assert!(master.is_master());
        assert_eq!(master.depth, 0);
    }

    #[test]
    fn vector1_children() {
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");

        let m0h = master.derive_child(HARDENED_BIT).unwrap();
        assert_eq!(m0h.fingerprint(), [0x5c, 0x1b, 0xd6, 0x48]);
        assert_eq!(m0h.depth, 1);
        assert_eq!(m0h.parent_fingerprint, master.fingerprint());
        assert_eq!(
            m0h.to_base58_private().unwrap(),
            "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7"
        );
        assert_eq!(
            m0h.to_base58_public(),
            "xpub68Gmy5EdvgibQVfPdqkBBCHxA5htiqg55crXYuXoQRKfDBFA1WEjWgP6LHhwBZeNK1VTsfTFUHCdrfp1bgwQ9xv5ski8PX9rL2dZXvgGDnw"
        );

        let m0h1 = m0h.derive_child(1).unwrap();
        assert_eq!(
            m0h1.to_base58_public(),
            "xpub6ASuArnXKPbfEwhqN6e3mwBcDTgzisQN1wXN9BJcM47sSikHjJf3UFHKkNAWbWMiGj7Wf5uMash7SyYq527Hqck2AxYysAA7xmALppuCkwQ"
        );

        let m0h1_2h = m0h1.derive_child(HARDENED_BIT + 2).unwrap();
        assert_eq!(
            m0h1_2h.to_base58_private().unwrap(),
            "xprv9z4pot5VBttmtdRTWfWQmoH1taj2axGVzFqSb8C9xaxKymcFzXBDptWmT7FwuEzG3ryjH4ktypQSAewRiNMjANTtpgP4mLTj34bhnZX7UiM"
        );
    }

    // BIP32 test vector 2 exercises large non-hardened indices.
    #[test]
    fn vector2_children() {
        let master = master_from_hex(
            "fffcf9f6f3f0edeae7e4e1dedbd8d5d2cfccc9c6c3c0bdbab7b4b1aeaba8a5a2\
             9f9c999693908d8a8784817e7b7875726f6c696663605d5a5754514e4b484542",
        );
        assert_eq!(
            master.to_base58_public(),
            "xpub661MyMwAqRbcFW31YEwpkMuc5THy2PSt5bDMsktWQcFF8syAmRUapSCGu8ED9W6oDMSgv6Zz8idoc4a6mr8BDzTJY47LJhkJ8UB7WEGuduB"
        );
        let m0 = master.derive_child(0).unwrap();
        let m0_h = m0.derive_child(HARDENED_BIT + 2147483647).unwrap();
        assert_eq!(
            m0_h.to_base58_public(),
            "xpub6ASAVgeehLbnwdqV6UKMHVzgqAG8Gr6riv3Fxxpj8ksbH9ebxaEyBLZ85ySDhKiLDBrQSARLq1uNRts8RuJiHjaDMBU4Zn9h8LZNnBC5y4a"
        );
    }

    #[test]
    fn public_derivation_matches_private() {
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");
        let account = master.derive_child(HARDENED_BIT).unwrap();
        let watch_only = account.neuter();
        assert!(!watch_only.is_private());

        for index in [0u32, 1, 2, 1000] {
            let private_child = account.derive_child(index).unwrap();
            let public_child = watch_only.derive_child(index).unwrap();
            assert_eq!(private_child.public_key, public_child.public_key);
            assert_eq!(private_child.chain_code, public_child.chain_code);
            assert_eq!(private_child.fingerprint(), public_child.fingerprint());
        }
    }

    #[test]
    fn hardened_from_watch_only_fails() {
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");
        let watch_only = master.neuter();
        assert_eq!(
            watch_only.derive_child(HARDENED_BIT).unwrap_err(),
            DerivationError::HardenedFromPublic
        );
    }

    #[test]
    fn serialization_round_trip() {
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");
        let node = master.derive_child(HARDENED_BIT + 44).unwrap();

        let restored = ExtendedKey::deserialize(&node.serialize_private().unwrap()).unwrap();
        assert_eq!(restored.private_key, node.private_key);
        assert_eq!(restored.public_key, node.public_key);
        assert_eq!(restored.chain_code, node.chain_code);
        assert_eq!(restored.depth, node.depth);
        assert_eq!(restored.parent_fingerprint, node.parent_fingerprint);
        assert_eq!(restored.child_number, node.child_number);

        let public = ExtendedKey::from_base58(&node.to_base58_public()).unwrap();
        assert!(!public.is_private());
        assert_eq!(public.public_key, node.public_key);
    }

    #[test]
    fn deserialize_rejects_malformed() {
        assert_eq!(
            ExtendedKey::deserialize(&[0u8; 10]).unwrap_err(),
            DerivationError::InvalidSerialization
        );
        // Valid b58 but mangled checksum.
        assert_eq!(
            ExtendedKey::from_base58(
                "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHz"
            )
            .unwrap_err(),
            DerivationError::InvalidChecksum
        );
        // Zero depth with a nonzero parent fingerprint.
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");
        let mut bytes = master.serialize_public();
        bytes[5] = 1;
        assert!(ExtendedKey::deserialize(&bytes).is_err());
    }

    #[test]
    fn empty_seed_rejected() {
        assert_eq!(
            ExtendedKey::from_seed(&[]).unwrap_err(),
            DerivationError::InvalidSeed
        );
    }

    #[test]
    fn path_parsing() {
        let path = DerivationPath::from_str("m/0'/1/2147483647").unwrap();
        assert_eq!(path.indices(), &[HARDENED_BIT, 1, 2147483647]);

        let no_prefix = DerivationPath::from_str("0h/1").unwrap();
        assert_eq!(no_prefix.indices(), &[HARDENED_BIT, 1]);

        let identity = DerivationPath::from_str("m").unwrap();
        assert!(identity.indices().is_empty());

        assert_eq!(
            DerivationPath::from_str("m/abc").unwrap_err(),
            DerivationError::InvalidChildNumber
        );
        assert_eq!(
            DerivationPath::from_str("m/2147483648").unwrap_err(),
            DerivationError::InvalidChildNumber
        );
    }

    #[test]
    fn path_derivation_matches_manual_walk() {
        let master = master_from_hex("000102030405060708090a0b0c0d0e0f");
        let path = DerivationPath::from_str("m/0'/1").unwrap();
        let derived = path.derive(&master).unwrap();
        let manual = master
            .derive_child(HARDENED_BIT)
            .unwrap()
            .derive_child(1)
            .unwrap();
        assert_eq!(derived.public_key, manual.public_key);
        assert_eq!(derived.depth, 2);
    }
}
