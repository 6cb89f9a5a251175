pub mod api;
pub mod blockchain;
pub mod credentials;
pub mod derivation;
pub mod keys;
pub mod keystore;
pub mod mnemonic;
pub mod transaction;
pub mod wallet;

pub use api::{Engine, ErrorCode};
pub use blockchain::{Blockchain, HistoryItem};
pub use credentials::{Credentials, CredentialsError};
pub use derivation::{DerivationError, DerivationPath, ExtendedKey};
pub use mnemonic::{generate_entropy, CodePhrase, MnemonicError, MnemonicStrength};
pub use transaction::{Transaction, TxInput, TxOutput, UnspentTxo};
pub use wallet::Wallet;
