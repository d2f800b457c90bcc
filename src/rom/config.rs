use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::hex_u32;

/// One cross-reference to a block's address embedded in the base image.
/// Rewrite sets are enumerated explicitly per block; the allocator never
/// scans code for pointers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSpec {
    /// Where the reference lives in the image.
    #[serde(with = "hex_u32")]
    pub address: u32,
    #[serde(default)]
    pub kind: RefKind,
}

/// How a reference encodes the target address.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// Full 32-bit word holding the address.
    #[default]
    Absolute,
    /// Upper half of a split immediate pair, carry-adjusted so that
    /// `(hi << 16) + sign_extend(lo)` reproduces the address.
    Hi16,
    /// Lower half of a split immediate pair.
    Lo16,
}

impl RefKind {
    pub fn split(self, address: u32) -> u32 {
        match self {
            RefKind::Absolute => address,
            // Carry: the paired lo half is sign-extended by the target CPU.
            RefKind::Hi16 => (address >> 16).wrapping_add((address >> 15) & 1) & 0xFFFF,
            RefKind::Lo16 => address & 0xFFFF,
        }
    }
}

/// One named data block being replaced in the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,
    /// Original address of the block in the base image.
    #[serde(with = "hex_u32")]
    pub address: u32,
    /// Original occupied length.
    #[serde(with = "hex_u32")]
    pub length: u32,
    /// File holding the replacement bytes.
    pub source: PathBuf,
    #[serde(default)]
    pub refs: Vec<RefSpec>,
}

/// A master lookup table rebuilt from scratch after every successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    #[serde(with = "hex_u32")]
    pub address: u32,
}

/// Full patch-run description. Block declaration order is placement order,
/// so region layout is reproducible given the same config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Address of the first byte of the image.
    #[serde(with = "hex_u32")]
    pub base_address: u32,
    /// Hard cap on the patched image size, growth frontier included.
    #[serde(with = "hex_u32")]
    pub size_limit: u32,
    pub blocks: Vec<BlockSpec>,
    /// Final address of each block, one u32 per block in declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_table: Option<TableSpec>,
    /// Final (address, length) pair of each block in declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_table: Option<TableSpec>,
}

impl PatchConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config '{}'", path.display()))?;
        let config: PatchConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config '{}'", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_yaml() {
        let yaml = "\
base_address: 0x80000000
size_limit: 0x400000
blocks:
  - name: WorldA
    address: 0x80010000
    length: 0x100
    source: build/worlda.bin
    refs:
      - { address: 0x80001234 }
      - { address: 0x80002002, kind: hi16 }
      - { address: 0x80002006, kind: lo16 }
config_table:
  address: 0x803FF000
";
        let config: PatchConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.base_address, 0x8000_0000);
        assert_eq!(config.blocks.len(), 1);
        assert_eq!(config.blocks[0].refs[0].kind, RefKind::Absolute);
        assert_eq!(config.blocks[0].refs[1].kind, RefKind::Hi16);
        assert_eq!(config.config_table.unwrap().address, 0x803F_F000);
        assert!(config.asset_table.is_none());
    }

    #[test]
    fn test_split_immediates_reassemble() {
        // lo half 0x8123 sign-extends negative, so hi carries up by one
        let addr = 0x8045_8123u32;
        let hi = RefKind::Hi16.split(addr);
        let lo = RefKind::Lo16.split(addr);
        assert_eq!(hi, 0x8046);
        assert_eq!(lo, 0x8123);
        let rebuilt = (hi << 16).wrapping_add(lo as u16 as i16 as i32 as u32);
        assert_eq!(rebuilt, addr);
        assert_eq!(RefKind::Absolute.split(addr), addr);
    }
}
