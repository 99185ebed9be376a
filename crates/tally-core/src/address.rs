//! Base58check addresses.
//!
//! Payload layout: `version (1) || pubkey_hash (32)`, followed by the
//! 4-byte double-SHA256 checksum appended by `bs58`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::Network;
use crate::crypto::PublicKey;
use crate::error::AddressError;
use crate::types::Hash256;

const PAYLOAD_LEN: usize = 33;

/// A pay-to-pubkey-hash address on a specific network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    network: Network,
    hash: Hash256,
}

impl Address {
    pub fn from_pubkey_hash(hash: Hash256, network: Network) -> Self {
        Self { network, hash }
    }

    pub fn from_public_key(public_key: &PublicKey, network: Network) -> Self {
        Self::from_pubkey_hash(public_key.pubkey_hash(), network)
    }

    pub fn pubkey_hash(&self) -> Hash256 {
        self.hash
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn encode(&self) -> String {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.push(self.network.address_version());
        payload.extend_from_slice(self.hash.as_bytes());
        bs58::encode(payload).with_check().into_string()
    }

    pub fn decode(s: &str) -> Result<Self, AddressError> {
        let payload = bs58::decode(s)
            .with_check(None)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        if payload.len() != PAYLOAD_LEN {
            return Err(AddressError::InvalidLength(payload.len()));
        }
        let network = Network::from_address_version(payload[0])
            .ok_or(AddressError::UnknownVersion(payload[0]))?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self {
            network,
            hash: Hash256(hash),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::decode(&s).map_err(serde::de::Error::custom)
    }
}
