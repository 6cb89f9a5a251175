use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use bitcoin_hashes::{sha256, Hash};
use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use std::fmt;
use zeroize::Zeroizing;

/// PBKDF2-HMAC-SHA512 rounds for the passphrase KDF.
pub const KDF_ROUNDS: u32 = 32_768;

const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

// Plaintext of the check blob: a fixed digest that only the right KEK
// can recover.
const CHECK_TEXT: &[u8] = b"hdwallet-core passphrase check";

#[derive(Debug, PartialEq, Eq)]
pub enum CredentialsError {
    Locked,
    NotConfigured,
    AuthFailed,
    RngUnavailable,
    EncryptionFailed,
    DecryptionFailed,
}

impl fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CredentialsError::Locked => write!(f, "Credentials are locked"),
            CredentialsError::NotConfigured => write!(f, "No passphrase has been set"),
            CredentialsError::AuthFailed => write!(f, "Passphrase check failed"),
            CredentialsError::RngUnavailable => write!(f, "System entropy unavailable"),
            CredentialsError::EncryptionFailed => write!(f, "Failed to encrypt data"),
            CredentialsError::DecryptionFailed => write!(f, "Failed to decrypt data"),
        }
    }
}

impl std::error::Error for CredentialsError {}

/// The secrets that lock, unlock, and encrypt everything else.
///
/// The passphrase-derived KEK never touches user data; it wraps a random
/// ephemeral key, and the ephemeral key encrypts extended private keys at
/// rest. Both transient keys exist only between unlock and lock.
#[derive(Default)]
pub struct Credentials {
    salt: Vec<u8>,
    check: Vec<u8>,
    ephemeral_key_encrypted: Vec<u8>,
    ephemeral_key: Option<Zeroizing<[u8; KEY_LEN]>>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_configured(&self) -> bool {
        !self.check.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.ephemeral_key.is_none()
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    pub fn check(&self) -> &[u8] {
        &self.check
    }

    pub fn ephemeral_key_encrypted(&self) -> &[u8] {
        &self.ephemeral_key_encrypted
    }

    /// Sets a new passphrase and unlocks.
    ///
    /// A configured-but-locked vault refuses the change; the old
    /// passphrase has to be proven via `unlock` first. When unlocked, the
    /// existing ephemeral key is kept and rewrapped so previously
    /// encrypted blobs stay readable.
    pub fn set_passphrase(&mut self, new_passphrase: &str) -> Result<(), CredentialsError> {
        if self.is_configured() && self.is_locked() {
            return Err(CredentialsError::Locked);
        }

        let mut salt = vec![0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|_| CredentialsError::RngUnavailable)?;

        let ephemeral_key = match &self.ephemeral_key {
            Some(key) => key.clone(),
            None => {
                let mut key = Zeroizing::new([0u8; KEY_LEN]);
                OsRng
                    .try_fill_bytes(key.as_mut_slice())
                    .map_err(|_| CredentialsError::RngUnavailable)?;
                key
            }
        };

        let kek = derive_kek(new_passphrase, &salt);
        let check = encrypt_with_key(&kek, &check_constant())?;
        let ephemeral_key_encrypted = encrypt_with_key(&kek, ephemeral_key.as_ref())?;

        self.salt = salt;
        self.check = check;
        self.ephemeral_key_encrypted = ephemeral_key_encrypted;
        self.ephemeral_key = Some(ephemeral_key);
        Ok(())
    }

    /// Installs a previously exported (salt, check, ekey_enc) triple and
    /// enters the locked state. No cryptographic validation happens here.
    pub fn load(&mut self, salt: Vec<u8>, check: Vec<u8>, ephemeral_key_encrypted: Vec<u8>) {
        self.salt = salt;
        self.check = check;
        self.ephemeral_key_encrypted = ephemeral_key_encrypted;
        self.ephemeral_key = None;
    }

    pub fn unlock(&mut self, passphrase: &str) -> Result<(), CredentialsError> {
        if !self.is_configured() {
            return Err(CredentialsError::NotConfigured);
        }
        let kek = derive_kek(passphrase, &self.salt);

        let plain =
            decrypt_with_key(&kek, &self.check).map_err(|_| CredentialsError::AuthFailed)?;
        if plain.as_slice() != check_constant().as_slice() {
            return Err(CredentialsError::AuthFailed);
        }

        let recovered = decrypt_with_key(&kek, &self.ephemeral_key_encrypted)
            .map_err(|_| CredentialsError::AuthFailed)?;
        if recovered.len() != KEY_LEN {
            return Err(CredentialsError::DecryptionFailed);
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&recovered);
        self.ephemeral_key = Some(key);
        Ok(())
    }

    /// Wipes the transient keys.
    pub fn lock(&mut self) {
        self.ephemeral_key = None;
    }

    /// Encrypts under the ephemeral key. Unlocked only.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CredentialsError> {
        let key = self.ephemeral_key.as_ref().ok_or(CredentialsError::Locked)?;
        encrypt_with_key(key, plaintext)
    }

    /// Decrypts under the ephemeral key. Unlocked only; the result wipes
    /// itself when dropped.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CredentialsError> {
        let key = self.ephemeral_key.as_ref().ok_or(CredentialsError::Locked)?;
        decrypt_with_key(key, ciphertext)
    }
}

fn check_constant() -> [u8; 32] {
    sha256::Hash::hash(CHECK_TEXT).to_byte_array()
}

fn derive_kek(passphrase: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, KDF_ROUNDS, kek.as_mut_slice());
    kek
}

// Blob layout: nonce(12) || ciphertext+tag. AES-256-GCM, so tampering
// fails decryption instead of yielding garbage.
fn encrypt_with_key(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CredentialsError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CredentialsError::EncryptionFailed)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|_| CredentialsError::RngUnavailable)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CredentialsError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_with_key(
    key: &[u8; KEY_LEN],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CredentialsError> {
    if data.len() < NONCE_LEN {
        return Err(CredentialsError::DecryptionFailed);
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|_| CredentialsError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(&data[0..NONCE_LEN]);
    let plaintext = cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|_| CredentialsError::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}
