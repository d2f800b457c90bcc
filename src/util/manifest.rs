use std::io::{BufRead, Write};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Reserved zero-length boundary rows.
pub const SENTINEL_START: &str = "Start";
pub const SENTINEL_END: &str = "End";
/// Reserved skip markers: ranges carried for layout but not editable.
pub const MARKER_PADDING: &str = "Padding";
pub const MARKER_MISSING: &str = "Missing";

pub fn is_reserved_name(name: &str) -> bool {
    matches!(name, SENTINEL_START | SENTINEL_END | MARKER_PADDING | MARKER_MISSING)
}

/// One discovered structure: the stable join key between a decode pass and
/// the next encode pass, and between old and new engine builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub type_name: String,
    pub offset: u32,
    pub address: u32,
    pub length: u32,
}

impl ManifestEntry {
    pub fn is_reserved(&self) -> bool { is_reserved_name(&self.name) }

    pub fn end_offset(&self) -> u32 { self.offset + self.length }
}

/// Plain-text table of `name | type | offset | address | length` rows,
/// offset/address/length in hex. Entries are kept in offset order.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn parse<R>(reader: R, source: &str) -> Result<Self>
    where R: BufRead {
        static MANIFEST_LINE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                "^\\s*(?P<name>[^|\\s]+)\\s*\\|\\s*(?P<type>[^|\\s]+)\\s*\\|\\s*(?P<offset>[0-9A-Fa-f]+)\\s*\\|\\s*(?P<addr>[0-9A-Fa-f]+)\\s*\\|\\s*(?P<len>[0-9A-Fa-f]+)\\s*$",
            )
            .unwrap()
        });
        let mut manifest = Manifest::default();
        for (idx, result) in reader.lines().enumerate() {
            let line = result?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(captures) = MANIFEST_LINE.captures(trimmed) else {
                bail!("{}:{}: invalid manifest line '{}'", source, idx + 1, trimmed);
            };
            manifest.entries.push(ManifestEntry {
                name: captures["name"].to_string(),
                type_name: captures["type"].to_string(),
                offset: u32::from_str_radix(&captures["offset"], 16)?,
                address: u32::from_str_radix(&captures["addr"], 16)?,
                length: u32::from_str_radix(&captures["len"], 16)?,
            });
        }
        manifest.validate(source)?;
        Ok(manifest)
    }

    pub fn write<W>(&self, w: &mut W) -> Result<()>
    where W: Write + ?Sized {
        for entry in &self.entries {
            writeln!(
                w,
                "{} | {} | {:08X} | {:08X} | {:08X}",
                entry.name, entry.type_name, entry.offset, entry.address, entry.length
            )?;
        }
        Ok(())
    }

    /// Within one manifest, addresses are unique and ranges never overlap,
    /// except for the zero-length sentinel rows.
    pub fn validate(&self, source: &str) -> Result<()> {
        let mut sorted: Vec<&ManifestEntry> =
            self.entries.iter().filter(|e| e.length > 0).collect();
        sorted.sort_by_key(|e| e.offset);
        for pair in sorted.windows(2) {
            if pair[1].offset < pair[0].end_offset() {
                bail!(
                    "{}: '{}' ({:08X}..{:08X}) overlaps '{}' @ {:08X}",
                    source,
                    pair[0].name,
                    pair[0].offset,
                    pair[0].end_offset(),
                    pair[1].name,
                    pair[1].offset
                );
            }
        }
        let mut addresses: Vec<u32> = self.entries.iter().map(|e| e.address).collect();
        addresses.sort_unstable();
        for pair in addresses.windows(2) {
            if pair[0] == pair[1] {
                // Start shares its address with the first structure; only
                // duplicate non-sentinel addresses are a defect.
                let dupes: Vec<&ManifestEntry> =
                    self.entries.iter().filter(|e| e.address == pair[0] && !e.is_reserved()).collect();
                if dupes.len() > 1 {
                    bail!("{}: duplicate address {:08X} ('{}')", source, pair[0], dupes[0].name);
                }
            }
        }
        Ok(())
    }

    /// Assembles a full manifest from structure rows: sorts by offset, adds
    /// the Start/End sentinels and Padding rows over undiscovered gaps.
    pub fn assemble(
        base_address: u32,
        mut structures: Vec<ManifestEntry>,
        end_offset: u32,
    ) -> Manifest {
        structures.sort_by_key(|e| e.offset);
        let mut manifest = Manifest::default();
        manifest.entries.push(ManifestEntry {
            name: SENTINEL_START.to_string(),
            type_name: "-".to_string(),
            offset: 0,
            address: base_address,
            length: 0,
        });
        let mut cursor = 0u32;
        for entry in structures {
            if entry.offset > cursor {
                manifest.entries.push(ManifestEntry {
                    name: MARKER_PADDING.to_string(),
                    type_name: MARKER_PADDING.to_string(),
                    offset: cursor,
                    address: base_address + cursor,
                    length: entry.offset - cursor,
                });
            }
            cursor = cursor.max(entry.end_offset());
            manifest.entries.push(entry);
        }
        if end_offset > cursor {
            manifest.entries.push(ManifestEntry {
                name: MARKER_PADDING.to_string(),
                type_name: MARKER_PADDING.to_string(),
                offset: cursor,
                address: base_address + cursor,
                length: end_offset - cursor,
            });
        }
        manifest.entries.push(ManifestEntry {
            name: SENTINEL_END.to_string(),
            type_name: "-".to_string(),
            offset: end_offset,
            address: base_address + end_offset,
            length: 0,
        });
        manifest
    }

    pub fn by_name(&self, name: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.name == name && !e.is_reserved())
    }

    /// Named entries in manifest order, skipping sentinels and skip markers.
    pub fn structures(&self) -> impl Iterator<Item = &ManifestEntry> + '_ {
        self.entries.iter().filter(|e| !e.is_reserved())
    }
}
