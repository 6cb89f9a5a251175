use bitcoin_hashes::{sha256d, Hash};
use std::fmt;

/// The only sighash type the signer emits.
pub const SIGHASH_ALL: u32 = 1;

#[derive(Debug, PartialEq, Eq)]
pub enum TransactionError {
    Truncated,
    TrailingData,
    OversizedItem,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionError::Truncated => write!(f, "Transaction bytes truncated"),
            TransactionError::TrailingData => write!(f, "Trailing bytes after transaction"),
            TransactionError::OversizedItem => write!(f, "Oversized item in transaction"),
        }
    }
}

impl std::error::Error for TransactionError {}

/// `prev_tx_hash` is kept in the conventional display order; the wire
/// format stores it reversed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_tx_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

/// A legacy-format transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            let mut hash = input.prev_tx_hash;
            hash.reverse();
            out.extend_from_slice(&hash);
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }

        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, TransactionError> {
        let mut reader = Reader::new(data);

        let version = reader.read_u32_le()?;

        let input_count = reader.read_varint()?;
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            let mut prev_tx_hash = [0u8; 32];
            prev_tx_hash.copy_from_slice(reader.take(32)?);
            prev_tx_hash.reverse();
            let prev_index = reader.read_u32_le()?;
            let script_len = reader.read_varint()?;
            let script_sig = reader
                .take(usize::try_from(script_len).map_err(|_| TransactionError::OversizedItem)?)?
                .to_vec();
            let sequence = reader.read_u32_le()?;
            inputs.push(TxInput {
                prev_tx_hash,
                prev_index,
                script_sig,
                sequence,
            });
        }

        let output_count = reader.read_varint()?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            let value = reader.read_u64_le()?;
            let script_len = reader.read_varint()?;
            let script_pubkey = reader
                .take(usize::try_from(script_len).map_err(|_| TransactionError::OversizedItem)?)?
                .to_vec();
            outputs.push(TxOutput {
                value,
                script_pubkey,
            });
        }

        let lock_time = reader.read_u32_le()?;
        if !reader.is_empty() {
            return Err(TransactionError::TrailingData);
        }

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }

    /// Canonical hash: double SHA-256 of the serialization, reversed into
    /// display order.
    pub fn hash(&self) -> [u8; 32] {
        let digest = sha256d::Hash::hash(&self.serialize());
        let mut hash = digest.to_byte_array();
        hash.reverse();
        hash
    }

    pub fn total_output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

fn write_varint(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], TransactionError> {
        if self.data.len() - self.pos < len {
            return Err(TransactionError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }

    fn read_u32_le(&mut self) -> Result<u32, TransactionError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64_le(&mut self) -> Result<u64, TransactionError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_varint(&mut self) -> Result<u64, TransactionError> {
        let first = self.take(1)?[0];
        match first {
            0xfd => {
                let bytes = self.take(2)?;
                Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as u64)
            }
            0xfe => Ok(self.read_u32_le()? as u64),
            0xff => self.read_u64_le(),
            n => Ok(n as u64),
        }
    }
}

/// The canonical 25-byte Pay-to-PubKey-Hash script.
pub fn p2pkh_script(hash160: &[u8; 20]) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.push(0x76); // OP_DUP
    script.push(0xa9); // OP_HASH160
    script.push(0x14); // push 20 bytes
    script.extend_from_slice(hash160);
    script.push(0x88); // OP_EQUALVERIFY
    script.push(0xac); // OP_CHECKSIG
    script
}

/// Recognizes a standard P2PKH script; anything else yields None.
pub fn extract_p2pkh_hash160(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == 0x76
        && script[1] == 0xa9
        && script[2] == 0x14
        && script[23] == 0x88
        && script[24] == 0xac
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return Some(hash);
    }
    None
}

/// An output not yet consumed by any known input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentTxo {
    pub tx_hash: [u8; 32],
    pub output_index: u32,
    pub value: u64,
    pub script: Vec<u8>,
}

impl UnspentTxo {
    /// The hash160 that must sign to spend this output.
    pub fn signing_address(&self) -> Option<[u8; 20]> {
        extract_p2pkh_hash160(&self.script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A mainnet transaction with three outputs.
    const TX_F363: &str = "01000000012261e8c7b75726b79c204a678320e94373d0122bed8b19ac263a7f\
        949f127c26010000006b48304502200d77784a48a350eac8c41b506eb81746a5e6f3522b100634f707a2fa\
        5cf12cdb022100edb04c5de6017f4b621285ec7258100eb700d9cc6a68d1a74af131c87e530922012102e7\
        0b14967a4d0c752dbf59656ae3463e4780e2898031268341b97f54f2bd20c4ffffffff03c82b233d010000\
        001976a91486ca032feb47d375e3c82d611d0d8b76632d6b7588ac1822ef08000000001976a9142ab266d8\
        448c36c42dfaa3b2131b998fcc8578d788ac38326e18000000001976a9142ac74153f491a617a891f3f49d\
        b15ce6892e934688ac00000000";

    // Spends output 0 of TX_F363.
    const TX_C357: &str = "010000000176727e1d27e2515ed3347c983ee63c527150bef11a5d360e1ffca4ee\
        fa5763f3000000006a47304402207affb9e332bf8e0b606cd644abb5265deb67e9b9db2b24c270f663fb53\
        226592022024e33bb5ea9a0a6e5fdc451740bebe7fdd4bc84d0362819df59e42c69a16219f012102b7fa5f\
        ce24461db7f4eca4590d99b89198c7e673b15856d88ce84925f12bf59cffffffff026cad7a290100000019\
        76a91408bfbf564a1179feeeb021a7ea2fd48a3952fc1c88ac747aa813000000001976a9142d5aeacbdf11\
        4615533c16b7fe6309918ea49c8b88ac00000000";

    fn decode(tx_hex: &str) -> Vec<u8> {
        hex::decode(tx_hex).unwrap()
    }

    #[test]
    fn parse_and_hash_real_transaction() {
        let raw = decode(TX_F363);
        let tx = Transaction::parse(&raw).unwrap();
        assert_eq!(tx.version, 1);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.outputs.len(), 3);
        assert_eq!(tx.lock_time, 0);
        assert_eq!(
            hex::encode(tx.hash()),
            "f36357faeea4fc1f0e365d1af1be5071523ce63e987c34d35e51e2271d7e7276"
        );
    }

    #[test]
    fn serialize_round_trip() {
        for tx_hex in [TX_F363, TX_C357] {
            let raw = decode(tx_hex);
            let tx = Transaction::parse(&raw).unwrap();
            assert_eq!(tx.serialize(), raw);
        }
    }

    #[test]
    fn input_references_parent_hash() {
        let child = Transaction::parse(&decode(TX_C357)).unwrap();
        assert_eq!(
            hex::encode(child.inputs[0].prev_tx_hash),
            "f36357faeea4fc1f0e365d1af1be5071523ce63e987c34d35e51e2271d7e7276"
        );
        assert_eq!(child.inputs[0].prev_index, 0);
        assert_eq!(child.inputs[0].sequence, 0xffffffff);
        assert_eq!(
            hex::encode(child.hash()),
            "c357d77807368346fccc6e078bd28626a91d06f4a1ba8b891a455d23b53c9fef"
        );
    }

    #[test]
    fn parse_rejects_truncated_and_trailing() {
        let raw = decode(TX_F363);
        assert_eq!(
            Transaction::parse(&raw[..raw.len() - 1]).unwrap_err(),
            TransactionError::Truncated
        );
        let mut extra = raw.clone();
        extra.push(0);
        assert_eq!(
            Transaction::parse(&extra).unwrap_err(),
            TransactionError::TrailingData
        );
    }

    #[test]
    fn varint_boundaries() {
        for n in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x10000, 0xffff_ffff, 0x1_0000_0000] {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut reader = Reader::new(&buf);
            assert_eq!(reader.read_varint().unwrap(), n);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn p2pkh_script_recognizer() {
        let hash = [0xabu8; 20];
        let script = p2pkh_script(&hash);
        assert_eq!(script.len(), 25);
        assert_eq!(extract_p2pkh_hash160(&script), Some(hash));

        // Not P2PKH: an OP_1 script and a truncated script.
        assert_eq!(extract_p2pkh_hash160(&[0x51]), None);
        assert_eq!(extract_p2pkh_hash160(&script[..24]), None);
    }

    #[test]
    fn unspent_txo_signing_address() {
        let hash = [0x11u8; 20];
        let txo = UnspentTxo {
            tx_hash: [0u8; 32],
            output_index: 0,
            value: 1000,
            script: p2pkh_script(&hash),
        };
        assert_eq!(txo.signing_address(), Some(hash));
    }
}
