//! Content and revision identifiers
//!
//! Both are SHA-256 digests. They are kept as distinct types so a revision
//! hash can never be passed where a content hash is expected.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

macro_rules! hash_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name([u8; 32]);

        impl $name {
            /// Create from raw bytes
            pub fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }

            /// SHA-256 of `data`
            pub fn from_data(data: &[u8]) -> Self {
                Self(Sha256::digest(data).into())
            }

            /// Convert to hexadecimal string
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse from hexadecimal string
            pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(hex_str)?;
                if bytes.len() != 32 {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Get raw bytes
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// First 8 hex digits, for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl std::str::FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }
    };
}

hash_type!(
    /// Identifier of an immutable byte payload, derived from its bytes
    ContentHash
);

hash_type!(
    /// Self-certifying identifier of a [`Revision`](crate::Revision)
    RevisionHash
);
