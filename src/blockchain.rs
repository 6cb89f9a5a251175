use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::transaction::{extract_p2pkh_hash160, Transaction, TransactionError, UnspentTxo};

pub type TxHash = [u8; 32];
pub type Hash160 = [u8; 20];

/// Ordered set of hash160s; iteration order decides history attribution.
pub type AddressSet = BTreeSet<Hash160>;

#[derive(Debug, PartialEq, Eq)]
pub enum BlockchainError {
    Transaction(TransactionError),
}

impl fmt::Display for BlockchainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockchainError::Transaction(e) => write!(f, "Transaction error: {}", e),
        }
    }
}

impl std::error::Error for BlockchainError {}

impl From<TransactionError> for BlockchainError {
    fn from(err: TransactionError) -> Self {
        BlockchainError::Transaction(err)
    }
}

/// One wallet-relevant transaction, rendered for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryItem {
    pub tx_hash: TxHash,
    pub hash160: Hash160,
    pub timestamp: u64,
    /// Net effect on the queried addresses; negative is outgoing.
    pub value: i64,
    pub fee: u64,
    pub inputs_are_known: bool,
}

/// A local view of the chain: enough transactions and confirmations to
/// answer balance, spendability, and history queries for watched
/// addresses. Transactions may arrive in any order; every query is
/// computed from the current store, so late-arriving parents take effect
/// retroactively.
#[derive(Default)]
pub struct Blockchain {
    transactions: HashMap<TxHash, Transaction>,
    insertion_order: Vec<TxHash>,
    tx_heights: HashMap<TxHash, u64>,
    block_timestamps: BTreeMap<u64, u64>,
}

impl Blockchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a block's timestamp. Idempotent.
    pub fn confirm_block(&mut self, height: u64, timestamp: u64) {
        self.block_timestamps.insert(height, timestamp);
    }

    pub fn max_block_height(&self) -> u64 {
        self.block_timestamps
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
    }

    pub fn get_block_timestamp(&self, height: u64) -> u64 {
        self.block_timestamps.get(&height).copied().unwrap_or(0)
    }

    /// Parses and stores a transaction. Idempotent on the hash; the
    /// height stays 0 (unconfirmed) until reported.
    pub fn add_transaction(&mut self, raw: &[u8]) -> Result<TxHash, BlockchainError> {
        let tx = Transaction::parse(raw)?;
        let hash = tx.hash();
        if !self.transactions.contains_key(&hash) {
            self.insertion_order.push(hash);
            self.transactions.insert(hash, tx);
        }
        Ok(hash)
    }

    /// Sets a transaction's confirmation height. Heights never decrease;
    /// a lower report is ignored.
    pub fn confirm_transaction(&mut self, tx_hash: &TxHash, height: u64) {
        let entry = self.tx_heights.entry(*tx_hash).or_insert(0);
        if height > *entry {
            *entry = height;
        }
    }

    pub fn get_transaction_height(&self, tx_hash: &TxHash) -> u64 {
        self.tx_heights.get(tx_hash).copied().unwrap_or(0)
    }

    pub fn get_transaction(&self, tx_hash: &TxHash) -> Option<&Transaction> {
        self.transactions.get(tx_hash)
    }

    /// Every outpoint consumed by some stored transaction.
    fn spent_outpoints(&self) -> HashSet<(TxHash, u32)> {
        let mut spent = HashSet::new();
        for tx in self.transactions.values() {
            for input in &tx.inputs {
                spent.insert((input.prev_tx_hash, input.prev_index));
            }
        }
        spent
    }

    /// All unspent outputs, oldest-inserted first. A non-empty filter
    /// keeps only outputs owned by one of the given hash160s.
    pub fn get_unspent_txos(&self, filter: &AddressSet) -> Vec<UnspentTxo> {
        let spent = self.spent_outpoints();
        let mut unspent = Vec::new();
        for hash in &self.insertion_order {
            let tx = &self.transactions[hash];
            for (index, output) in tx.outputs.iter().enumerate() {
                let index = index as u32;
                if spent.contains(&(*hash, index)) {
                    continue;
                }
                if !filter.is_empty() {
                    match extract_p2pkh_hash160(&output.script_pubkey) {
                        Some(owner) if filter.contains(&owner) => {}
                        _ => continue,
                    }
                }
                unspent.push(UnspentTxo {
                    tx_hash: *hash,
                    output_index: index,
                    value: output.value,
                    script: output.script_pubkey.clone(),
                });
            }
        }
        unspent
    }

    /// Sum of unspent output values paying `hash160`.
    pub fn get_address_balance(&self, hash160: &Hash160) -> u64 {
        let mut filter = AddressSet::new();
        filter.insert(*hash160);
        self.get_unspent_txos(&filter).iter().map(|t| t.value).sum()
    }

    /// Whether `tx` pays `hash160` or spends one of its known outputs.
    fn transaction_touches(&self, tx: &Transaction, hash160: &Hash160) -> bool {
        for output in &tx.outputs {
            if extract_p2pkh_hash160(&output.script_pubkey) == Some(*hash160) {
                return true;
            }
        }
        for input in &tx.inputs {
            if let Some(prev) = self.transactions.get(&input.prev_tx_hash) {
                if let Some(output) = prev.outputs.get(input.prev_index as usize) {
                    if extract_p2pkh_hash160(&output.script_pubkey) == Some(*hash160) {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Number of stored transactions touching `hash160` as recipient or
    /// spender.
    pub fn get_address_tx_count(&self, hash160: &Hash160) -> u32 {
        self.transactions
            .values()
            .filter(|tx| self.transaction_touches(tx, hash160))
            .count() as u32
    }

    /// Union of transactions touching any of `addresses`, in insertion
    /// order.
    pub fn get_transactions_for_addresses(&self, addresses: &AddressSet) -> Vec<&Transaction> {
        self.insertion_order
            .iter()
            .map(|hash| &self.transactions[hash])
            .filter(|tx| addresses.iter().any(|a| self.transaction_touches(tx, a)))
            .collect()
    }

    pub fn transaction_to_history_item(
        &self,
        addresses: &AddressSet,
        tx: &Transaction,
    ) -> HistoryItem {
        let hash = tx.hash();

        let received: u64 = tx
            .outputs
            .iter()
            .filter(|o| {
                extract_p2pkh_hash160(&o.script_pubkey)
                    .map(|owner| addresses.contains(&owner))
                    .unwrap_or(false)
            })
            .map(|o| o.value)
            .sum();

        let mut inputs_are_known = true;
        let mut total_input_value: u64 = 0;
        let mut spent: u64 = 0;
        for input in &tx.inputs {
            match self
                .transactions
                .get(&input.prev_tx_hash)
                .and_then(|prev| prev.outputs.get(input.prev_index as usize))
            {
                Some(output) => {
                    total_input_value += output.value;
                    if let Some(owner) = extract_p2pkh_hash160(&output.script_pubkey) {
                        if addresses.contains(&owner) {
                            spent += output.value;
                        }
                    }
                }
                None => inputs_are_known = false,
            }
        }

        let fee = if inputs_are_known {
            total_input_value.saturating_sub(tx.total_output_value())
        } else {
            0
        };

        let hash160 = addresses
            .iter()
            .find(|a| self.transaction_touches(tx, a))
            .copied()
            .unwrap_or([0u8; 20]);

        HistoryItem {
            tx_hash: hash,
            hash160,
            timestamp: self.get_block_timestamp(self.get_transaction_height(&hash)),
            value: received as i64 - spent as i64,
            fee,
            inputs_are_known,
        }
    }
}
