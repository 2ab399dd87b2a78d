//! Serde adapters for the Ethereum JSON-RPC encoding of numeric fields.

/// `u64` encoded as a `0x`-prefixed hex quantity.
///
/// Decoding also accepts plain JSON numbers and decimal strings, which some
/// providers and explorers return.
pub mod quantity {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{value:x}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => parse(&s).map_err(de::Error::custom),
        }
    }

    /// Parse a hex quantity (`0x1a`) or a decimal string (`26`).
    pub fn parse(s: &str) -> Result<u64, String> {
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some("") => Ok(0),
            Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| format!("bad quantity {s:?}: {e}")),
            None => s.parse::<u64>().map_err(|e| format!("bad quantity {s:?}: {e}")),
        }
    }
}
