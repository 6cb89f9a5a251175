use bitcoin_hashes::{sha256d, Hash};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use std::fmt;

use crate::blockchain::{AddressSet, Blockchain, Hash160, HistoryItem};
use crate::credentials::Credentials;
use crate::derivation::{DerivationError, ExtendedKey};
use crate::keys::pubkey_hash160;
use crate::keystore::{self, KeystoreError};
use crate::transaction::{p2pkh_script, Transaction, TxInput, TxOutput, UnspentTxo, SIGHASH_ALL};

pub const EXTERNAL_CHAIN: u32 = 0;
pub const INTERNAL_CHAIN: u32 = 1;

/// Fixed watch window per chain. A proper gap-limit scan is future work;
/// larger wallets outgrow this.
pub const EXTERNAL_WINDOW: u32 = 8;
pub const INTERNAL_WINDOW: u32 = 8;

#[derive(Debug)]
pub enum WalletError {
    InsufficientFunds,
    MissingKey,
    Locked,
    ValueOverflow,
    SigningFailed,
    Derivation(DerivationError),
    Keystore(KeystoreError),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WalletError::InsufficientFunds => write!(f, "Insufficient funds"),
            WalletError::MissingKey => write!(f, "No signing key for a selected output"),
            WalletError::Locked => write!(f, "Credentials are locked"),
            WalletError::ValueOverflow => write!(f, "Output value overflow"),
            WalletError::SigningFailed => write!(f, "Signing failed"),
            WalletError::Derivation(e) => write!(f, "Derivation error: {}", e),
            WalletError::Keystore(e) => write!(f, "Keystore error: {}", e),
        }
    }
}

impl std::error::Error for WalletError {}

impl From<DerivationError> for WalletError {
    fn from(err: DerivationError) -> Self {
        WalletError::Derivation(err)
    }
}

impl From<KeystoreError> for WalletError {
    fn from(err: KeystoreError) -> Self {
        WalletError::Keystore(err)
    }
}

/// One watched address with its chain-derived statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub hash160: Hash160,
    pub child_num: u32,
    pub is_public_chain: bool,
    pub balance: u64,
    pub tx_count: u32,
}

/// A spend target, already resolved to a hash160.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub hash160: Hash160,
    pub value: u64,
}

struct WatchedAddress {
    hash160: Hash160,
    chain: u32,
    index: u32,
}

/// A wallet bound to one account node. Leaf addresses come from the
/// watch-only subtree `account/chain/index`; signing walks the same
/// subtree of the decrypted private account key.
pub struct Wallet {
    account: ExtendedKey,
    ext_prv_enc: Vec<u8>,
    watched: Vec<WatchedAddress>,
}

impl Wallet {
    pub fn new(account: ExtendedKey, ext_prv_enc: Vec<u8>) -> Result<Self, WalletError> {
        let account = account.neuter();
        let mut watched = Vec::new();
        for (chain, window) in [
            (EXTERNAL_CHAIN, EXTERNAL_WINDOW),
            (INTERNAL_CHAIN, INTERNAL_WINDOW),
        ] {
            let chain_node = account.derive_child(chain)?;
            for index in 0..window {
                let leaf = chain_node.derive_child(index)?;
                watched.push(WatchedAddress {
                    hash160: pubkey_hash160(&leaf.public_key),
                    chain,
                    index,
                });
            }
        }
        Ok(Wallet {
            account,
            ext_prv_enc,
            watched,
        })
    }

    pub fn has_private_key(&self) -> bool {
        !self.ext_prv_enc.is_empty()
    }

    pub fn watched_addresses(&self) -> AddressSet {
        self.watched.iter().map(|a| a.hash160).collect()
    }

    /// The watched window, external chain first, with balances and
    /// transaction counts read from the blockchain view.
    pub fn get_addresses(&self, chain: &Blockchain) -> Vec<AddressRecord> {
        self.watched
            .iter()
            .map(|address| AddressRecord {
                hash160: address.hash160,
                child_num: address.index,
                is_public_chain: address.chain == EXTERNAL_CHAIN,
                balance: chain.get_address_balance(&address.hash160),
                tx_count: chain.get_address_tx_count(&address.hash160),
            })
            .collect()
    }

    /// Wallet history, unconfirmed first, then newest confirmations.
    pub fn get_history(&self, chain: &Blockchain) -> Vec<HistoryItem> {
        let addresses = self.watched_addresses();
        let mut items: Vec<HistoryItem> = chain
            .get_transactions_for_addresses(&addresses)
            .into_iter()
            .map(|tx| chain.transaction_to_history_item(&addresses, tx))
            .collect();
        items.sort_by_key(|item| {
            std::cmp::Reverse(if item.timestamp == 0 {
                u64::MAX
            } else {
                item.timestamp
            })
        });
        items
    }

    fn derive_address(&self, chain: u32, index: u32) -> Result<Hash160, WalletError> {
        let leaf = self.account.derive_child(chain)?.derive_child(index)?;
        Ok(pubkey_hash160(&leaf.public_key))
    }

    /// The first internal index with no transaction history, or 0 when
    /// the whole window is untouched.
    fn next_change_index(&self, chain: &Blockchain) -> u32 {
        self.watched
            .iter()
            .filter(|a| a.chain == INTERNAL_CHAIN)
            .find(|a| chain.get_address_tx_count(&a.hash160) == 0)
            .map(|a| a.index)
            .unwrap_or(0)
    }

    /// Assembles (and optionally signs) a spend of the wallet's unspent
    /// outputs. Deterministic for a given blockchain state: selection is
    /// greedy over the unspent list in reverse insertion order, change
    /// goes to the next unused internal address.
    pub fn create_tx(
        &self,
        chain: &Blockchain,
        credentials: &Credentials,
        recipients: &[Recipient],
        fee: u64,
        should_sign: bool,
    ) -> Result<Vec<u8>, WalletError> {
        let mut required = fee;
        for recipient in recipients {
            required = required
                .checked_add(recipient.value)
                .ok_or(WalletError::ValueOverflow)?;
        }

        let unspent = chain.get_unspent_txos(&self.watched_addresses());
        let mut selected: Vec<UnspentTxo> = Vec::new();
        let mut total: u64 = 0;
        for txo in unspent.iter().rev() {
            if total >= required {
                break;
            }
            total = total
                .checked_add(txo.value)
                .ok_or(WalletError::ValueOverflow)?;
            selected.push(txo.clone());
        }
        if total < required {
            return Err(WalletError::InsufficientFunds);
        }
        let change_value = total - required;

        let mut outputs: Vec<TxOutput> = recipients
            .iter()
            .map(|recipient| TxOutput {
                value: recipient.value,
                script_pubkey: p2pkh_script(&recipient.hash160),
            })
            .collect();
        if change_value > 0 {
            let change = self.derive_address(INTERNAL_CHAIN, self.next_change_index(chain))?;
            outputs.push(TxOutput {
                value: change_value,
                script_pubkey: p2pkh_script(&change),
            });
        }

        let inputs = selected
            .iter()
            .map(|txo| TxInput {
                prev_tx_hash: txo.tx_hash,
                prev_index: txo.output_index,
                script_sig: Vec::new(),
                sequence: 0xffff_ffff,
            })
            .collect();

        let mut tx = Transaction {
            version: 1,
            inputs,
            outputs,
            lock_time: 0,
        };

        if should_sign {
            self.sign(&mut tx, &selected, credentials)?;
        }
        Ok(tx.serialize())
    }

    fn sign(
        &self,
        tx: &mut Transaction,
        selected: &[UnspentTxo],
        credentials: &Credentials,
    ) -> Result<(), WalletError> {
        if credentials.is_locked() {
            return Err(WalletError::Locked);
        }
        if self.ext_prv_enc.is_empty() {
            return Err(WalletError::MissingKey);
        }
        let account = keystore::restore_private(credentials, &self.ext_prv_enc)?;

        let mut signing_keys = Vec::with_capacity(selected.len());
        for txo in selected {
            let target = txo.signing_address().ok_or(WalletError::MissingKey)?;
            signing_keys.push(self.find_signing_key(&account, &target)?);
        }

        let secp = Secp256k1::new();
        for index in 0..tx.inputs.len() {
            let sighash = legacy_sighash(tx, index, &selected[index].script);
            let message =
                Message::from_digest_slice(&sighash).map_err(|_| WalletError::SigningFailed)?;
            let signature = secp.sign_ecdsa(&message, &signing_keys[index]);

            let mut der = signature.serialize_der().to_vec();
            der.push(SIGHASH_ALL as u8);
            let pubkey = PublicKey::from_secret_key(&secp, &signing_keys[index]).serialize();

            let mut script_sig = Vec::with_capacity(2 + der.len() + pubkey.len());
            script_sig.push(der.len() as u8);
            script_sig.extend_from_slice(&der);
            script_sig.push(pubkey.len() as u8);
            script_sig.extend_from_slice(&pubkey);
            tx.inputs[index].script_sig = script_sig;
        }
        Ok(())
    }

    /// Walks the watch window of the private subtree looking for the key
    /// whose public hash matches `target`.
    fn find_signing_key(
        &self,
        account: &ExtendedKey,
        target: &Hash160,
    ) -> Result<SecretKey, WalletError> {
        for (chain, window) in [
            (EXTERNAL_CHAIN, EXTERNAL_WINDOW),
            (INTERNAL_CHAIN, INTERNAL_WINDOW),
        ] {
            let chain_node = account.derive_child(chain)?;
            for index in 0..window {
                let leaf = chain_node.derive_child(index)?;
                if &pubkey_hash160(&leaf.public_key) == target {
                    return leaf.private_key.ok_or(WalletError::MissingKey);
                }
            }
        }
        Err(WalletError::MissingKey)
    }
}

/// The digest signed for one input: the transaction with every scriptSig
/// blanked except `input_index`, which carries the referenced
/// scriptPubKey, followed by the little-endian sighash type.
pub fn legacy_sighash(tx: &Transaction, input_index: usize, prev_script: &[u8]) -> [u8; 32] {
    let mut copy = tx.clone();
    for input in &mut copy.inputs {
        input.script_sig.clear();
    }
    copy.inputs[input_index].script_sig = prev_script.to_vec();
    let mut preimage = copy.serialize();
    preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
    sha256d::Hash::hash(&preimage).to_byte_array()
}
