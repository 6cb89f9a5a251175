use bip39::Mnemonic;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;

pub enum MnemonicStrength {
    Words12,
    Words15,
    Words18,
    Words21,
    Words24,
}

impl MnemonicStrength {
    fn entropy_bytes(&self) -> usize {
        match self {
            MnemonicStrength::Words12 => 16,
            MnemonicStrength::Words15 => 20,
            MnemonicStrength::Words18 => 24,
            MnemonicStrength::Words21 => 28,
            MnemonicStrength::Words24 => 32,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MnemonicError {
    InvalidCode,
    EntropyUnavailable,
}

impl fmt::Display for MnemonicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MnemonicError::InvalidCode => write!(f, "Invalid code phrase"),
            MnemonicError::EntropyUnavailable => write!(f, "System entropy unavailable"),
        }
    }
}

impl std::error::Error for MnemonicError {}

/// A BIP39 code phrase; the human-transcribable form of a wallet seed.
#[derive(Debug)]
pub struct CodePhrase {
    mnemonic: Mnemonic,
}

impl CodePhrase {
    pub fn generate(strength: MnemonicStrength) -> Result<Self, MnemonicError> {
        let entropy = generate_entropy(strength.entropy_bytes())?;
        let mnemonic =
            Mnemonic::from_entropy(&entropy).map_err(|_| MnemonicError::InvalidCode)?;
        Ok(Self { mnemonic })
    }

    /// Parses and checksum-validates a phrase.
    pub fn from_phrase(phrase: &str) -> Result<Self, MnemonicError> {
        match Mnemonic::parse_normalized(phrase) {
            Ok(mnemonic) => Ok(Self { mnemonic }),
            Err(_) => Err(MnemonicError::InvalidCode),
        }
    }

    pub fn phrase(&self) -> String {
        let mut result = String::new();
        for (i, word) in self.mnemonic.word_iter().enumerate() {
            if i > 0 {
                result.push(' ');
            }
            result.push_str(word);
        }
        result
    }

    /// The 64-byte seed: PBKDF2-HMAC-SHA512 over the phrase with the
    /// passphrase as salt suffix.
    pub fn to_seed(&self, passphrase: &str) -> [u8; 64] {
        self.mnemonic.to_seed(passphrase)
    }
}

pub fn generate_entropy(byte_length: usize) -> Result<Vec<u8>, MnemonicError> {
    let mut bytes = vec![0u8; byte_length];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| MnemonicError::EntropyUnavailable)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR_PHRASE: &str = "abandon abandon abandon abandon abandon abandon \
                                 abandon abandon abandon abandon abandon about";

    // BIP39 test vector: all-zero entropy, empty passphrase.
    #[test]
    fn vector_seed() {
        let code = CodePhrase::from_phrase(VECTOR_PHRASE).unwrap();
        let seed = code.to_seed("");
        assert_eq!(
            hex::encode(seed),
            "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc1\
             9a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4"
        );
    }

    #[test]
    fn passphrase_changes_seed() {
        let code = CodePhrase::from_phrase(VECTOR_PHRASE).unwrap();
        assert_ne!(code.to_seed(""), code.to_seed("TREZOR"));
    }

    #[test]
    fn rejects_bad_checksum() {
        let phrase = "abandon abandon abandon abandon abandon abandon \
                      abandon abandon abandon abandon abandon abandon";
        assert_eq!(
            CodePhrase::from_phrase(phrase).unwrap_err(),
            MnemonicError::InvalidCode
        );
    }

    #[test]
    fn generated_phrase_round_trips() {
        let code = CodePhrase::generate(MnemonicStrength::Words12).unwrap();
        let phrase = code.phrase();
        assert_eq!(phrase.split(' ').count(), 12);
        let reparsed = CodePhrase::from_phrase(&phrase).unwrap();
        assert_eq!(reparsed.to_seed(""), code.to_seed(""));
    }
}
