//! Key layout of the wallet database.
//!
//! Every key starts with a one-byte tag. Heights, wallet ids and account
//! indexes are big-endian so range scans come back in numeric order.
//!
//! ```text
//! V                    -> version
//! O                    -> network magic
//! R                    -> chain state
//! D                    -> next wallet id
//! h[height]            -> block meta
//! b[height]            -> wids with transactions in the block
//! o[hash][index]       -> wids watching the outpoint
//! p[addr hash]         -> wids owning the address
//! T[tx hash]           -> wids holding the transaction
//! l[id]                -> wid
//! W[wid]               -> id
//! w[wid]               -> wallet
//! a[wid][acct]         -> account
//! i[wid][name]         -> account index
//! n[wid][acct]         -> account name
//! P[wid][addr hash]    -> path
//! r[wid][acct][hash]   -> empty (account address index)
//! t[wid]...            -> per-wallet ledger, see [`TxdbLayout`]
//! ```

use tally_core::error::EncodingError;
use tally_core::types::{Hash256, OutPoint};

pub const VERSION: &[u8] = b"V";
pub const OPTIONS: &[u8] = b"O";
pub const CHAIN_STATE: &[u8] = b"R";
pub const NEXT_WID: &[u8] = b"D";

pub const BLOCK_META: u8 = b'h';
pub const BLOCK_MAP: u8 = b'b';
pub const OUTPOINT_MAP: u8 = b'o';
pub const PATH_MAP: u8 = b'p';
pub const TX_MAP: u8 = b'T';
pub const WALLET_ID: u8 = b'l';
pub const WALLET_NAME: u8 = b'W';
pub const WALLET: u8 = b'w';
pub const ACCOUNT: u8 = b'a';
pub const ACCOUNT_INDEX: u8 = b'i';
pub const ACCOUNT_NAME: u8 = b'n';
pub const PATH: u8 = b'P';
pub const ACCOUNT_PATH: u8 = b'r';
pub const TXDB: u8 = b't';

fn key(tag: u8, parts: &[&[u8]]) -> Vec<u8> {
    let len = 1 + parts.iter().map(|p| p.len()).sum::<usize>();
    let mut out = Vec::with_capacity(len);
    out.push(tag);
    for part in parts {
        out.extend_from_slice(part);
    }
    out
}

pub fn block_meta(height: u32) -> Vec<u8> {
    key(BLOCK_META, &[&height.to_be_bytes()])
}

pub fn block_map(height: u32) -> Vec<u8> {
    key(BLOCK_MAP, &[&height.to_be_bytes()])
}

pub fn outpoint_map(outpoint: &OutPoint) -> Vec<u8> {
    key(OUTPOINT_MAP, &[&outpoint.to_key()])
}

pub fn path_map(hash: &Hash256) -> Vec<u8> {
    key(PATH_MAP, &[hash.as_bytes()])
}

pub fn tx_map(hash: &Hash256) -> Vec<u8> {
    key(TX_MAP, &[hash.as_bytes()])
}

pub fn wallet_id(id: &str) -> Vec<u8> {
    key(WALLET_ID, &[id.as_bytes()])
}

pub fn wallet_name(wid: u32) -> Vec<u8> {
    key(WALLET_NAME, &[&wid.to_be_bytes()])
}

pub fn wallet(wid: u32) -> Vec<u8> {
    key(WALLET, &[&wid.to_be_bytes()])
}

pub fn account(wid: u32, index: u32) -> Vec<u8> {
    key(ACCOUNT, &[&wid.to_be_bytes(), &index.to_be_bytes()])
}

pub fn account_prefix(wid: u32) -> Vec<u8> {
    key(ACCOUNT, &[&wid.to_be_bytes()])
}

pub fn account_index(wid: u32, name: &str) -> Vec<u8> {
    key(ACCOUNT_INDEX, &[&wid.to_be_bytes(), name.as_bytes()])
}

pub fn account_name(wid: u32, index: u32) -> Vec<u8> {
    key(ACCOUNT_NAME, &[&wid.to_be_bytes(), &index.to_be_bytes()])
}

pub fn account_name_prefix(wid: u32) -> Vec<u8> {
    key(ACCOUNT_NAME, &[&wid.to_be_bytes()])
}

pub fn path(wid: u32, hash: &Hash256) -> Vec<u8> {
    key(PATH, &[&wid.to_be_bytes(), hash.as_bytes()])
}

pub fn path_prefix(wid: u32) -> Vec<u8> {
    key(PATH, &[&wid.to_be_bytes()])
}

pub fn account_path(wid: u32, account: u32, hash: &Hash256) -> Vec<u8> {
    key(
        ACCOUNT_PATH,
        &[&wid.to_be_bytes(), &account.to_be_bytes(), hash.as_bytes()],
    )
}

pub fn account_path_prefix(wid: u32, account: u32) -> Vec<u8> {
    key(ACCOUNT_PATH, &[&wid.to_be_bytes(), &account.to_be_bytes()])
}

/// Big-endian u32 at `offset` of `key`.
pub fn parse_u32(key: &[u8], offset: usize) -> Result<u32, EncodingError> {
    let bytes: [u8; 4] = key
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or(EncodingError::InvalidLength {
            expected: offset + 4,
            got: key.len(),
        })?;
    Ok(u32::from_be_bytes(bytes))
}

/// 32-byte hash at `offset` of `key`.
pub fn parse_hash(key: &[u8], offset: usize) -> Result<Hash256, EncodingError> {
    let bytes: [u8; 32] = key
        .get(offset..offset + 32)
        .and_then(|b| b.try_into().ok())
        .ok_or(EncodingError::InvalidLength {
            expected: offset + 32,
            got: key.len(),
        })?;
    Ok(Hash256(bytes))
}

/// Keys of one wallet's ledger, all under `t[wid]`.
///
/// ```text
/// R                     -> wallet balance
/// r[acct]               -> account balance
/// t[hash]               -> tx record
/// c[hash][index]        -> credit
/// d[hash][index]        -> undo credit, keyed by the spending input
/// s[hash][index]        -> spending input, keyed by the spent outpoint
/// p[hash]               -> pending marker
/// m[time][hash]         -> time index
/// h[height][hash]       -> height index
/// T/P/M/H[acct]...      -> per-account variants of t/p/m/h
/// C[acct][hash][index]  -> per-account credit index
/// b[height]             -> block record
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxdbLayout {
    prefix: [u8; 5],
}

impl TxdbLayout {
    pub fn new(wid: u32) -> Self {
        let mut prefix = [TXDB; 5];
        prefix[1..].copy_from_slice(&wid.to_be_bytes());
        Self { prefix }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn key(&self, tag: u8, parts: &[&[u8]]) -> Vec<u8> {
        let len = self.prefix.len() + 1 + parts.iter().map(|p| p.len()).sum::<usize>();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&self.prefix);
        out.push(tag);
        for part in parts {
            out.extend_from_slice(part);
        }
        out
    }

    /// Offset of the first byte after the prefix and tag.
    pub fn body(&self) -> usize {
        self.prefix.len() + 1
    }

    pub fn balance(&self) -> Vec<u8> {
        self.key(b'R', &[])
    }

    pub fn account_balance(&self, account: u32) -> Vec<u8> {
        self.key(b'r', &[&account.to_be_bytes()])
    }

    pub fn tx(&self, hash: &Hash256) -> Vec<u8> {
        self.key(b't', &[hash.as_bytes()])
    }

    pub fn tx_prefix(&self) -> Vec<u8> {
        self.key(b't', &[])
    }

    pub fn credit(&self, outpoint: &OutPoint) -> Vec<u8> {
        self.key(b'c', &[&outpoint.to_key()])
    }

    pub fn credit_prefix(&self) -> Vec<u8> {
        self.key(b'c', &[])
    }

    pub fn undo(&self, spender: &OutPoint) -> Vec<u8> {
        self.key(b'd', &[&spender.to_key()])
    }

    pub fn spent(&self, outpoint: &OutPoint) -> Vec<u8> {
        self.key(b's', &[&outpoint.to_key()])
    }

    pub fn pending(&self, hash: &Hash256) -> Vec<u8> {
        self.key(b'p', &[hash.as_bytes()])
    }

    pub fn pending_prefix(&self) -> Vec<u8> {
        self.key(b'p', &[])
    }

    pub fn time(&self, time: u32, hash: &Hash256) -> Vec<u8> {
        self.key(b'm', &[&time.to_be_bytes(), hash.as_bytes()])
    }

    /// Time index bounds covering `[start, end]`.
    pub fn time_range(&self, start: u32, end: u32) -> (Vec<u8>, Option<Vec<u8>>) {
        let lo = self.key(b'm', &[&start.to_be_bytes()]);
        let hi = end
            .checked_add(1)
            .map(|e| self.key(b'm', &[&e.to_be_bytes()]))
            .unwrap_or_else(|| self.key(b'n', &[]));
        (lo, Some(hi))
    }

    pub fn height(&self, height: u32, hash: &Hash256) -> Vec<u8> {
        self.key(b'h', &[&height.to_be_bytes(), hash.as_bytes()])
    }

    pub fn account_tx(&self, account: u32, hash: &Hash256) -> Vec<u8> {
        self.key(b'T', &[&account.to_be_bytes(), hash.as_bytes()])
    }

    pub fn account_tx_prefix(&self, account: u32) -> Vec<u8> {
        self.key(b'T', &[&account.to_be_bytes()])
    }

    pub fn account_pending(&self, account: u32, hash: &Hash256) -> Vec<u8> {
        self.key(b'P', &[&account.to_be_bytes(), hash.as_bytes()])
    }

    pub fn account_pending_prefix(&self, account: u32) -> Vec<u8> {
        self.key(b'P', &[&account.to_be_bytes()])
    }

    pub fn account_time(&self, account: u32, time: u32, hash: &Hash256) -> Vec<u8> {
        self.key(
            b'M',
            &[&account.to_be_bytes(), &time.to_be_bytes(), hash.as_bytes()],
        )
    }

    /// Per-account time index bounds covering `[start, end]`.
    pub fn account_time_range(
        &self,
        account: u32,
        start: u32,
        end: u32,
    ) -> (Vec<u8>, Option<Vec<u8>>) {
        let acct = account.to_be_bytes();
        let lo = self.key(b'M', &[&acct, &start.to_be_bytes()]);
        let hi = match end.checked_add(1) {
            Some(e) => self.key(b'M', &[&acct, &e.to_be_bytes()]),
            None => match account.checked_add(1) {
                Some(next) => self.key(b'M', &[&next.to_be_bytes()]),
                None => self.key(b'N', &[]),
            },
        };
        (lo, Some(hi))
    }

    pub fn account_height(&self, account: u32, height: u32, hash: &Hash256) -> Vec<u8> {
        self.key(
            b'H',
            &[&account.to_be_bytes(), &height.to_be_bytes(), hash.as_bytes()],
        )
    }

    pub fn account_credit(&self, account: u32, outpoint: &OutPoint) -> Vec<u8> {
        self.key(b'C', &[&account.to_be_bytes(), &outpoint.to_key()])
    }

    pub fn account_credit_prefix(&self, account: u32) -> Vec<u8> {
        self.key(b'C', &[&account.to_be_bytes()])
    }

    pub fn block(&self, height: u32) -> Vec<u8> {
        self.key(b'b', &[&height.to_be_bytes()])
    }

    pub fn block_prefix(&self) -> Vec<u8> {
        self.key(b'b', &[])
    }
}
