pub mod file;
pub mod manifest;

use std::num::ParseIntError;

pub fn parse_hex(s: &str) -> Result<u32, ParseIntError> {
    if let Some(stripped) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(stripped, 16)
    } else {
        s.parse::<u32>()
    }
}

/// `from_str_fn` adapter for argp options that take addresses.
pub fn parse_hex_arg(value: &str) -> Result<u32, String> {
    parse_hex(value).map_err(|e| format!("invalid address '{value}': {e}"))
}

/// Serde adapter for u32 fields written as `0x...` in YAML. Accepts plain
/// integers too, since config authors mix both.
pub mod hex_u32 {
    use serde::{de, Deserializer, Serializer};

    pub fn serialize<S>(value: &u32, serializer: S) -> Result<S::Ok, S::Error>
    where S: Serializer {
        serializer.serialize_str(&format!("{value:#X}"))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u32, D::Error>
    where D: Deserializer<'de> {
        struct HexVisitor;
        impl de::Visitor<'_> for HexVisitor {
            type Value = u32;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a hex string or integer")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where E: de::Error {
                u32::try_from(v).map_err(E::custom)
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where E: de::Error {
                u32::try_from(v).map_err(E::custom)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where E: de::Error {
                super::parse_hex(v).map_err(E::custom)
            }
        }
        deserializer.deserialize_any(HexVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x1F000").unwrap(), 0x1F000);
        assert_eq!(parse_hex("4096").unwrap(), 4096);
        assert!(parse_hex("zz").is_err());
    }
}
