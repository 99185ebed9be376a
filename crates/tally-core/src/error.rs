//! Error types for the Tally core types.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("unexpected end of data: needed {needed}, {remaining} remaining")] UnexpectedEof { needed: usize, remaining: usize },
    #[error("{0} trailing bytes")] TrailingBytes(usize),
    #[error("invalid length: expected {expected}, got {got}")] InvalidLength { expected: usize, got: usize },
    #[error("invalid encoding: {0}")] Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("serialization: {0}")] Serialization(String),
    #[error("value overflow")] ValueOverflow,
    #[error("missing coin for input {index}")] MissingCoin { index: usize },
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid private key bytes")] InvalidPrivateKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("pubkey hash does not match expected")] PubkeyHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error("hardened derivation requires a private key")] HardenedFromPublic,
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58: {0}")] InvalidBase58(String),
    #[error("invalid length: {0}")] InvalidLength(usize),
    #[error("unknown version byte: {0:#04x}")] UnknownVersion(u8),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BloomError {
    #[error("filter too large: {0} bytes")] FilterTooLarge(usize),
    #[error("too many hash functions: {0}")] TooManyHashFuncs(u32),
    #[error("invalid false positive rate: {0}")] InvalidRate(String),
}
