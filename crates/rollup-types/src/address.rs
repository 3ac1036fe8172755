//! Addresses and message origins

use crate::hash::{decode_fixed, ParseError};
use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// Address payload length in bytes
pub const ADDRESS_LEN: usize = 20;

/// L2 side of the bridge: mints come from it, withdraw intents are sent to it
pub const L2_BRIDGE_ADDRESS: Address = Address::Contract(*b"l2-bridge-contract\0\0");

/// Account identity on either layer
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BorshSerialize, BorshDeserialize)]
pub enum Address {
    /// Externally owned account
    User([u8; ADDRESS_LEN]),
    /// Contract account
    Contract([u8; ADDRESS_LEN]),
}

impl Address {
    /// Derive a user address from a human-readable seed (genesis files, tests)
    pub fn user_from_seed(seed: &str) -> Self {
        Self::User(seed_bytes(seed))
    }

    /// Derive a contract address from a human-readable seed
    pub fn contract_from_seed(seed: &str) -> Self {
        Self::Contract(seed_bytes(seed))
    }

    pub fn bytes(&self) -> &[u8; ADDRESS_LEN] {
        match self {
            Self::User(b) | Self::Contract(b) => b,
        }
    }

    /// An all-zero payload is treated as "no address"
    pub fn is_empty(&self) -> bool {
        self.bytes().iter().all(|b| *b == 0)
    }

    pub fn is_contract(&self) -> bool {
        matches!(self, Self::Contract(_))
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::User(_) => 0,
            Self::Contract(_) => 1,
        }
    }

    pub(crate) fn hash_into(&self, hasher: &mut blake3::Hasher) {
        hasher.update(&[self.tag()]);
        hasher.update(self.bytes());
    }
}

fn seed_bytes(seed: &str) -> [u8; ADDRESS_LEN] {
    let digest = blake3::hash(seed.as_bytes());
    let mut out = [0u8; ADDRESS_LEN];
    out.copy_from_slice(&digest.as_bytes()[..ADDRESS_LEN]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::User(_) => "user",
            Self::Contract(_) => "contract",
        };
        write!(f, "{}:{}", kind, bs58::encode(self.bytes()).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, payload) = s
            .split_once(':')
            .ok_or_else(|| ParseError::AddressKind(s.to_string()))?;
        let bytes = decode_fixed::<ADDRESS_LEN>(payload)?;
        match kind {
            "user" => Ok(Self::User(bytes)),
            "contract" => Ok(Self::Contract(bytes)),
            other => Err(ParseError::AddressKind(other.to_string())),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Layer a transaction or message originated on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum Origin {
    L1,
    L2,
}

impl Origin {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Self::L1 => 1,
            Self::L2 => 2,
        }
    }
}
