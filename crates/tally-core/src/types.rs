//! Core value types: hashes, outpoints, transactions, coins, chain entries.
//!
//! All monetary values are in base units (1 TALLY = 10^8 units).
//! Heights and times are u32, matching the on-disk record layouts.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::encoding::Reader;
use crate::error::{EncodingError, TransactionError};

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block hashes and address hashes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Used for coinbase previous outpoints.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, EncodingError> {
        let bytes = hex::decode(s).map_err(|e| EncodingError::Invalid(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EncodingError::Invalid("hash must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, index: u32) -> Self {
        Self { txid, index }
    }

    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u32::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u32::MAX
    }

    /// 36-byte key form: txid followed by big-endian index, so outpoints of
    /// one transaction sort together and in output order.
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(&self.txid.0);
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }

    /// Inverse of [`OutPoint::to_key`].
    pub fn from_key(key: &[u8]) -> Result<Self, EncodingError> {
        if key.len() != 36 {
            return Err(EncodingError::InvalidLength {
                expected: 36,
                got: key.len(),
            });
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&key[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&key[32..]);
        Ok(Self {
            txid: Hash256(txid),
            index: u32::from_be_bytes(index),
        })
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Ed25519 signature (64 bytes). Empty until signed.
    pub signature: Vec<u8>,
    /// Ed25519 public key (32 bytes). Empty until signed.
    pub public_key: Vec<u8>,
    /// Input sequence number.
    pub sequence: u32,
}

impl TxInput {
    /// An unsigned input spending `previous_output`.
    pub fn unsigned(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            signature: Vec::new(),
            public_key: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

/// A transaction output, creating a new coin.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// BLAKE3 hash of the recipient's public key (the address hash).
    pub pubkey_hash: Hash256,
}

/// A transaction transferring value between addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u32,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u32,
}

impl Transaction {
    /// Canonical raw encoding (bincode, standard config).
    pub fn to_raw(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Decode a transaction from the front of `data`, returning it with the
    /// number of bytes consumed.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize), TransactionError> {
        bincode::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))
    }

    /// Decode a transaction that must span all of `data`.
    pub fn from_raw(data: &[u8]) -> Result<Self, TransactionError> {
        let (tx, read) = Self::decode_prefix(data)?;
        if read != data.len() {
            return Err(TransactionError::Serialization(format!(
                "{} trailing bytes",
                data.len() - read
            )));
        }
        Ok(tx)
    }

    /// Compute the transaction ID (BLAKE3 hash of the canonical encoding).
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        let encoded = self.to_raw()?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Serialized size in bytes.
    pub fn size(&self) -> Result<usize, TransactionError> {
        Ok(self.to_raw()?.len())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }
}

/// An unspent output together with its origin.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub value: u64,
    pub pubkey_hash: Hash256,
    /// Height of the block that confirmed the creating transaction.
    pub height: Option<u32>,
    pub coinbase: bool,
}

/// Serialized size of a coin without its outpoint.
pub const COIN_RAW_SIZE: usize = 8 + 32 + 4 + 1;

const UNCONFIRMED_HEIGHT: u32 = u32::MAX;

impl Coin {
    /// Build the coin for output `index` of `tx`.
    pub fn from_tx(tx: &Transaction, txid: Hash256, index: u32, height: Option<u32>) -> Option<Self> {
        let output = tx.outputs.get(index as usize)?;
        Some(Self {
            outpoint: OutPoint::new(txid, index),
            value: output.value,
            pubkey_hash: output.pubkey_hash,
            height,
            coinbase: tx.is_coinbase(),
        })
    }

    /// Number of confirmations at chain height `tip`, 0 when unconfirmed.
    pub fn depth(&self, tip: u32) -> u32 {
        match self.height {
            Some(h) if tip >= h => tip - h + 1,
            _ => 0,
        }
    }

    pub fn output(&self) -> TxOutput {
        TxOutput {
            value: self.value,
            pubkey_hash: self.pubkey_hash,
        }
    }

    /// Raw form: u64 value, 32-byte hash, u32 height (all ones when
    /// unconfirmed), u8 coinbase flag. The outpoint lives in the record key.
    pub fn write_raw<B: BufMut>(&self, out: &mut B) {
        out.put_u64_le(self.value);
        out.put_slice(&self.pubkey_hash.0);
        out.put_u32_le(self.height.unwrap_or(UNCONFIRMED_HEIGHT));
        out.put_u8(u8::from(self.coinbase));
    }

    pub fn read_raw(outpoint: OutPoint, reader: &mut Reader<'_>) -> Result<Self, EncodingError> {
        let value = reader.read_u64()?;
        let pubkey_hash = reader.read_hash()?;
        let height = match reader.read_u32()? {
            UNCONFIRMED_HEIGHT => None,
            h => Some(h),
        };
        let coinbase = reader.read_bool()?;
        Ok(Self {
            outpoint,
            value,
            pubkey_hash,
            height,
            coinbase,
        })
    }
}

/// A block as announced by the chain client.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChainEntry {
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub height: u32,
    pub time: u32,
}
