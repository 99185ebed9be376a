//! # tally-core
//! Value types, keys, and codecs shared by the Tally wallet crates.

pub mod address;
pub mod bloom;
pub mod coins;
pub mod constants;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod hd;
pub mod types;
