use serde::Deserialize;
use serde_json::{json, Value};

use crate::blockchain::{Blockchain, BlockchainError};
use crate::credentials::{Credentials, CredentialsError};
use crate::derivation::{DerivationError, ExtendedKey};
use crate::keys;
use crate::keystore::{self, KeystoreError};
use crate::mnemonic::{CodePhrase, MnemonicError};
use crate::wallet::{Recipient, Wallet, WalletError};

/// Numeric error codes carried in the `error.code` field. Success is the
/// absence of an `error` member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingParam = 1,
    InvalidParam = 2,
    Locked = 3,
    AuthFailed = 4,
    DerivationFailed = 5,
    MissingChildNode = 6,
    InsufficientFunds = 7,
    TransactionFailed = 8,
    PrngUnavailable = 9,
}

#[derive(Debug)]
struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        ApiError {
            code,
            message: message.into(),
        }
    }
}

type ApiResult = Result<Value, ApiError>;

impl From<CredentialsError> for ApiError {
    fn from(err: CredentialsError) -> Self {
        let code = match err {
            CredentialsError::Locked | CredentialsError::NotConfigured => ErrorCode::Locked,
            CredentialsError::AuthFailed => ErrorCode::AuthFailed,
            CredentialsError::RngUnavailable => ErrorCode::PrngUnavailable,
            CredentialsError::EncryptionFailed | CredentialsError::DecryptionFailed => {
                ErrorCode::InvalidParam
            }
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<DerivationError> for ApiError {
    fn from(err: DerivationError) -> Self {
        ApiError::new(ErrorCode::DerivationFailed, err.to_string())
    }
}

impl From<KeystoreError> for ApiError {
    fn from(err: KeystoreError) -> Self {
        match err {
            KeystoreError::Credentials(e) => e.into(),
            KeystoreError::Derivation(e) => e.into(),
            KeystoreError::RngUnavailable => {
                ApiError::new(ErrorCode::PrngUnavailable, "System entropy unavailable")
            }
            KeystoreError::NotPrivate | KeystoreError::InvalidBlob => {
                ApiError::new(ErrorCode::InvalidParam, err.to_string())
            }
        }
    }
}

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::InsufficientFunds => {
                ApiError::new(ErrorCode::InsufficientFunds, "Insufficient funds")
            }
            WalletError::Locked => ApiError::new(ErrorCode::Locked, "Credentials are locked"),
            WalletError::Derivation(e) => e.into(),
            WalletError::Keystore(e) => e.into(),
            other => ApiError::new(ErrorCode::TransactionFailed, other.to_string()),
        }
    }
}

impl From<MnemonicError> for ApiError {
    fn from(err: MnemonicError) -> Self {
        let code = match err {
            MnemonicError::InvalidCode => ErrorCode::InvalidParam,
            MnemonicError::EntropyUnavailable => ErrorCode::PrngUnavailable,
        };
        ApiError::new(code, err.to_string())
    }
}

impl From<BlockchainError> for ApiError {
    fn from(err: BlockchainError) -> Self {
        ApiError::new(ErrorCode::InvalidParam, err.to_string())
    }
}

#[derive(Deserialize)]
struct RecipientParam {
    addr_b58: String,
    value: u64,
}

/// The wallet engine: one credentials vault, one optional master node,
/// one optional account wallet, and the shared blockchain view, driven by
/// JSON commands from the host. Commands run to completion one at a time;
/// the engine keeps no other state between calls.
#[derive(Default)]
pub struct Engine {
    blockchain: Blockchain,
    credentials: Credentials,
    master_ext_pub_b58: String,
    master_ext_prv_enc: Vec<u8>,
    master_node: Option<ExtendedKey>,
    wallet: Option<Wallet>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes one command. Failures come back as
    /// `{"error": {"code", "message"}}`; nothing panics across this
    /// boundary.
    pub fn dispatch(&mut self, command: &str, args: &Value) -> Value {
        let result = match command {
            "set-passphrase" => self.handle_set_passphrase(args),
            "set-credentials" => self.handle_set_credentials(args),
            "unlock" => self.handle_unlock(args),
            "lock" => self.handle_lock(args),
            "derive-seed-from-code" => self.handle_derive_seed_from_code(args),
            "derive-master-node" => self.handle_derive_master_node(args),
            "generate-master-node" => self.handle_generate_master_node(args),
            "import-master-node" => self.handle_import_master_node(args),
            "derive-child-node" => self.handle_derive_child_node(args),
            "restore-node" => self.handle_restore_node(args),
            "describe-node" => self.handle_describe_node(args),
            "describe-private-node" => self.handle_describe_private_node(args),
            "get-addresses" => self.handle_get_addresses(args),
            "get-history" => self.handle_get_history(args),
            "report-tx-statuses" => self.handle_report_tx_statuses(args),
            "report-txs" => self.handle_report_txs(args),
            "confirm-block" => self.handle_confirm_block(args),
            "create-tx" => self.handle_create_tx(args),
            _ => Err(ApiError::new(
                ErrorCode::InvalidParam,
                format!("Unknown command: {}", command),
            )),
        };
        match result {
            Ok(value) => value,
            Err(e) => json!({"error": {"code": e.code as i64, "message": e.message}}),
        }
    }

    fn node_response(&self, node: &ExtendedKey, ext_prv_enc: &[u8], include_prv: bool) -> Value {
        let mut response = json!({
            "fp": fingerprint_hex(node.fingerprint()),
            "pfp": fingerprint_hex(node.parent_fingerprint),
            "child_num": node.child_number,
            "ext_pub_b58": node.to_base58_public(),
        });
        if !ext_prv_enc.is_empty() {
            response["ext_prv_enc"] = Value::from(hex::encode(ext_prv_enc));
        }
        if include_prv && node.is_private() && !self.credentials.is_locked() {
            if let Ok(b58) = node.to_base58_private() {
                response["ext_prv_b58"] = Value::from(b58);
            }
        }
        response
    }

    /// Rebuilds the cached master node to match the lock state: the
    /// private form while unlocked, the watch-only form while locked.
    fn refresh_master_node(&mut self) {
        if self.master_ext_prv_enc.is_empty() {
            return;
        }
        self.master_node = if self.credentials.is_locked() {
            keystore::restore_public(&self.master_ext_pub_b58).ok()
        } else {
            keystore::restore_private(&self.credentials, &self.master_ext_prv_enc).ok()
        };
    }

    fn handle_set_passphrase(&mut self, args: &Value) -> ApiResult {
        let new_passphrase = required_str(args, "new_passphrase")?;
        self.credentials.set_passphrase(new_passphrase)?;
        self.refresh_master_node();
        Ok(json!({
            "salt": hex::encode(self.credentials.salt()),
            "check": hex::encode(self.credentials.check()),
            "ekey_enc": hex::encode(self.credentials.ephemeral_key_encrypted()),
        }))
    }

    fn handle_set_credentials(&mut self, args: &Value) -> ApiResult {
        let salt = hex_bytes(args, "salt")?;
        let check = hex_bytes(args, "check")?;
        let ekey_enc = hex_bytes(args, "ekey_enc")?;
        if salt.len() < 32 || check.len() < 32 || ekey_enc.len() < 32 {
            return Err(ApiError::new(
                ErrorCode::MissingParam,
                "missing valid salt/check/ekey_enc params",
            ));
        }
        self.credentials.load(salt, check, ekey_enc);
        self.refresh_master_node();
        Ok(json!({"success": true}))
    }

    fn handle_unlock(&mut self, args: &Value) -> ApiResult {
        let passphrase = required_str(args, "passphrase")?;
        self.credentials.unlock(passphrase)?;
        self.refresh_master_node();
        Ok(json!({"success": true}))
    }

    fn handle_lock(&mut self, _args: &Value) -> ApiResult {
        self.credentials.lock();
        self.refresh_master_node();
        Ok(json!({"success": true}))
    }

    fn handle_derive_seed_from_code(&mut self, args: &Value) -> ApiResult {
        let code = required_str(args, "code")?;
        let passphrase = args
            .get("passphrase")
            .and_then(Value::as_str)
            .unwrap_or("");
        let phrase = CodePhrase::from_phrase(code)?;
        let seed = phrase.to_seed(passphrase);
        Ok(json!({"seed": hex::encode(seed)}))
    }

    fn handle_derive_master_node(&mut self, args: &Value) -> ApiResult {
        let seed = hex_bytes(args, "seed_hex")?;
        let ext_prv_enc = keystore::derive_master(&self.credentials, &seed)?;
        let node = keystore::restore_private(&self.credentials, &ext_prv_enc)?;
        Ok(self.node_response(&node, &ext_prv_enc, true))
    }

    fn handle_generate_master_node(&mut self, _args: &Value) -> ApiResult {
        let ext_prv_enc = keystore::generate_master(&self.credentials)?;
        let node = keystore::restore_private(&self.credentials, &ext_prv_enc)?;
        Ok(self.node_response(&node, &ext_prv_enc, true))
    }

    fn handle_import_master_node(&mut self, args: &Value) -> ApiResult {
        if let Some(ext_prv_b58) = args.get("ext_prv_b58").and_then(Value::as_str) {
            let ext_prv_enc = keystore::import_master(&self.credentials, ext_prv_b58)
                .map_err(|e| match e {
                    KeystoreError::Credentials(inner) => inner.into(),
                    _ => ApiError::new(ErrorCode::InvalidParam, "Extended key failed validation"),
                })?;
            let node = keystore::restore_private(&self.credentials, &ext_prv_enc)?;
            return Ok(self.node_response(&node, &ext_prv_enc, true));
        }

        if args.get("code").is_some() {
            let code = required_str(args, "code")?;
            let passphrase = args
                .get("passphrase")
                .and_then(Value::as_str)
                .unwrap_or("");
            let phrase = CodePhrase::from_phrase(code)?;
            let seed = phrase.to_seed(passphrase);
            let ext_prv_enc = keystore::derive_master(&self.credentials, &seed)?;
            let node = keystore::restore_private(&self.credentials, &ext_prv_enc)?;
            return Ok(self.node_response(&node, &ext_prv_enc, true));
        }

        Err(ApiError::new(
            ErrorCode::MissingParam,
            "Missing required ext_prv_b58 or code/passphrase param",
        ))
    }

    fn handle_derive_child_node(&mut self, args: &Value) -> ApiResult {
        let path = required_str(args, "path")?;
        let is_watch_only = args
            .get("is_watch_only")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let master = self
            .master_node
            .as_ref()
            .ok_or_else(|| ApiError::new(ErrorCode::MissingChildNode, "No master node set"))?;

        let mut response = if is_watch_only {
            let ext_pub_b58 = keystore::derive_child_public(master, path)?;
            let node = keystore::restore_public(&ext_pub_b58)?;
            self.node_response(&node, &[], false)
        } else {
            let ext_prv_enc = keystore::derive_child_encrypted(&self.credentials, master, path)?;
            let node = keystore::restore_private(&self.credentials, &ext_prv_enc)?;
            self.node_response(&node, &ext_prv_enc, false)
        };
        response["path"] = Value::from(path);
        Ok(response)
    }

    fn handle_restore_node(&mut self, args: &Value) -> ApiResult {
        let ext_pub_b58 = required_str(args, "ext_pub_b58")?;
        let node = keystore::restore_public(ext_pub_b58)
            .map_err(|_| ApiError::new(ErrorCode::InvalidParam, "ext_pub_b58 validation failed"))?;

        let ext_prv_enc = match args.get("ext_prv_enc").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => hex::decode(s).map_err(|_| {
                ApiError::new(ErrorCode::InvalidParam, "Invalid ext_prv_enc param")
            })?,
            _ => Vec::new(),
        };

        let is_master = node.is_master();
        if is_master && ext_prv_enc.is_empty() {
            return Err(ApiError::new(
                ErrorCode::MissingParam,
                "Missing ext_prv_enc param for master node",
            ));
        }

        if is_master {
            self.master_ext_pub_b58 = ext_pub_b58.to_string();
            self.master_ext_prv_enc = ext_prv_enc.clone();
            self.refresh_master_node();
        } else {
            self.wallet = Some(Wallet::new(node.clone(), ext_prv_enc.clone())?);
        }
        Ok(self.node_response(&node, &ext_prv_enc, false))
    }

    fn handle_describe_node(&mut self, args: &Value) -> ApiResult {
        let ext_pub_b58 = required_str(args, "ext_pub_b58")?;
        let node = keystore::restore_public(ext_pub_b58)
            .map_err(|_| ApiError::new(ErrorCode::InvalidParam, "ext_pub_b58 validation failed"))?;
        Ok(self.node_response(&node, &[], false))
    }

    fn handle_describe_private_node(&mut self, args: &Value) -> ApiResult {
        if self.credentials.is_locked() {
            return Err(ApiError::new(ErrorCode::Locked, "Wallet locked."));
        }
        let ext_prv_enc = hex_bytes(args, "ext_prv_enc")?;
        let node = keystore::restore_private(&self.credentials, &ext_prv_enc)
            .map_err(|_| ApiError::new(ErrorCode::InvalidParam, "ext_prv_enc validation failed"))?;
        Ok(self.node_response(&node, &ext_prv_enc, true))
    }

    fn handle_get_addresses(&mut self, _args: &Value) -> ApiResult {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| ApiError::new(ErrorCode::MissingChildNode, "No child node set"))?;
        let addresses: Vec<Value> = wallet
            .get_addresses(&self.blockchain)
            .iter()
            .map(|record| {
                json!({
                    "addr_b58": keys::hash160_to_address(&record.hash160),
                    "child_num": record.child_num,
                    "is_public": record.is_public_chain,
                    "value": record.balance,
                    "tx_count": record.tx_count,
                })
            })
            .collect();
        Ok(json!({"addresses": addresses}))
    }

    fn handle_get_history(&mut self, _args: &Value) -> ApiResult {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| ApiError::new(ErrorCode::MissingChildNode, "No child node set"))?;
        let history: Vec<Value> = wallet
            .get_history(&self.blockchain)
            .iter()
            .map(|item| {
                json!({
                    "tx_hash": hex::encode(item.tx_hash),
                    "addr_b58": keys::hash160_to_address(&item.hash160),
                    "timestamp": item.timestamp,
                    "value": item.value,
                    "fee": item.fee,
                })
            })
            .collect();
        Ok(json!({"history": history}))
    }

    fn handle_report_tx_statuses(&mut self, args: &Value) -> ApiResult {
        let statuses = args
            .get("tx_statuses")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::new(ErrorCode::MissingParam, "Missing tx_statuses param"))?;
        for status in statuses {
            let hash = tx_hash_param(status, "tx_hash")?;
            let height = status
                .get("height")
                .and_then(Value::as_u64)
                .ok_or_else(|| ApiError::new(ErrorCode::MissingParam, "Missing height param"))?;
            self.blockchain.confirm_transaction(&hash, height);
        }
        Ok(json!({}))
    }

    fn handle_report_txs(&mut self, args: &Value) -> ApiResult {
        let txs = args
            .get("txs")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::new(ErrorCode::MissingParam, "Missing txs param"))?;
        for item in txs {
            let raw = hex_bytes(item, "tx")?;
            self.blockchain.add_transaction(&raw)?;
        }
        Ok(json!({}))
    }

    fn handle_confirm_block(&mut self, args: &Value) -> ApiResult {
        let height = u64_param(args, "block_height")?;
        let timestamp = u64_param(args, "timestamp")?;
        self.blockchain.confirm_block(height, timestamp);
        Ok(json!({}))
    }

    fn handle_create_tx(&mut self, args: &Value) -> ApiResult {
        let wallet = self
            .wallet
            .as_ref()
            .ok_or_else(|| ApiError::new(ErrorCode::MissingChildNode, "No child node set"))?;

        let recipients_value = args
            .get("recipients")
            .cloned()
            .ok_or_else(|| ApiError::new(ErrorCode::MissingParam, "Missing recipients param"))?;
        let params: Vec<RecipientParam> = serde_json::from_value(recipients_value)
            .map_err(|_| ApiError::new(ErrorCode::InvalidParam, "Malformed recipients param"))?;
        if params.is_empty() {
            return Err(ApiError::new(
                ErrorCode::MissingParam,
                "Missing recipients param",
            ));
        }

        let mut recipients = Vec::with_capacity(params.len());
        for param in &params {
            let hash160 = keys::address_to_hash160(&param.addr_b58).map_err(|_| {
                ApiError::new(
                    ErrorCode::InvalidParam,
                    format!("Invalid recipient address: {}", param.addr_b58),
                )
            })?;
            recipients.push(Recipient {
                hash160,
                value: param.value,
            });
        }

        let fee = args.get("fee").and_then(Value::as_u64).unwrap_or(0);
        let should_sign = args.get("sign").and_then(Value::as_bool).unwrap_or(false);

        let raw = wallet.create_tx(
            &self.blockchain,
            &self.credentials,
            &recipients,
            fee,
            should_sign,
        )?;
        Ok(json!({"tx": hex::encode(raw)}))
    }
}

fn fingerprint_hex(fp: [u8; 4]) -> String {
    format!("0x{}", hex::encode(fp))
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ApiError> {
    match args.get(key).and_then(Value::as_str) {
        Some(s) if !s.is_empty() => Ok(s),
        _ => Err(ApiError::new(
            ErrorCode::MissingParam,
            format!("Missing {} param", key),
        )),
    }
}

fn hex_bytes(args: &Value, key: &str) -> Result<Vec<u8>, ApiError> {
    let s = required_str(args, key)?;
    hex::decode(s).map_err(|_| ApiError::new(ErrorCode::InvalidParam, format!("Invalid {} param", key)))
}

fn u64_param(args: &Value, key: &str) -> Result<u64, ApiError> {
    args.get(key).and_then(Value::as_u64).ok_or_else(|| {
        ApiError::new(ErrorCode::MissingParam, format!("Missing {} param", key))
    })
}

fn tx_hash_param(args: &Value, key: &str) -> Result<[u8; 32], ApiError> {
    let bytes = hex_bytes(args, key)?;
    if bytes.len() != 32 {
        return Err(ApiError::new(
            ErrorCode::InvalidParam,
            format!("Invalid {} param", key),
        ));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}
