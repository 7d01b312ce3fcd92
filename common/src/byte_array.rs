use serde_with::{hex::Hex, serde_as};
use std::fmt;

macro_rules! declare_byte_array_type {
    ($name:ident, $size:expr) => {
        /// $name
        #[serde_as]
        #[derive(
            Default,
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            serde::Serialize,
            serde::Deserialize,
        )]
        pub struct $name(#[serde_as(as = "Hex")] pub [u8; $size]);

        impl From<[u8; $size]> for $name {
            fn from(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<Vec<u8>> for $name {
            type Error = Vec<u8>;
            fn try_from(vec: Vec<u8>) -> Result<Self, Self::Error> {
                Ok($name(vec.try_into()?))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }
    };
}

// Version byte, chain id, 20 byte public key hash, 4 byte checksum
declare_byte_array_type!(Address, 26);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_serialises_as_hex() {
        let address = Address([1u8; 26]);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(26)));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }

    #[test]
    fn test_address_try_from_wrong_length_fails() {
        assert!(Address::try_from(vec![0u8; 25]).is_err());
    }
}
