pub mod config;

use anyhow::{bail, ensure, Result};
use tracing::{debug, info};

use crate::{
    error::PatchError,
    graph::addr::{AddressSpace, ByteWriter, Endian},
};

use self::config::{BlockSpec, PatchConfig, TableSpec};

/// Who owns a byte range of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionState {
    Free,
    /// Untouched base-image bytes, occupied but anonymous.
    Image,
    /// Occupied by one named data block.
    Block(String),
}

/// Half-open byte range of the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u32,
    pub end: u32,
    pub state: RegionState,
}

impl Region {
    pub fn len(&self) -> u32 { self.end - self.start }

    pub fn is_empty(&self) -> bool { self.start == self.end }
}

/// Partition of the target image into free and occupied regions.
///
/// Invariants held across every operation: regions are sorted, contiguous and
/// non-empty, cover exactly `0..len()`, and no two free regions are adjacent
/// (they coalesce on release). The image may grow past its initial length up
/// to `limit`.
#[derive(Debug, Clone)]
pub struct RegionMap {
    regions: Vec<Region>,
    limit: u32,
}

impl RegionMap {
    pub fn new(image_len: u32, limit: u32) -> Result<Self> {
        ensure!(
            image_len <= limit,
            "base image ({image_len:#X} bytes) already exceeds the size limit {limit:#X}"
        );
        let mut regions = Vec::new();
        if image_len > 0 {
            regions.push(Region { start: 0, end: image_len, state: RegionState::Image });
        }
        Ok(Self { regions, limit })
    }

    /// Current image length, growth included.
    pub fn len(&self) -> u32 { self.regions.last().map_or(0, |r| r.end) }

    pub fn is_empty(&self) -> bool { self.regions.is_empty() }

    pub fn regions(&self) -> &[Region] { &self.regions }

    fn index_of_block(&self, name: &str) -> Option<usize> {
        self.regions.iter().position(|r| matches!(&r.state, RegionState::Block(n) if n == name))
    }

    /// Claims `start..start + len` out of the anonymous base image for a
    /// named block. Fails if the range crosses anything already claimed.
    pub fn carve(&mut self, name: &str, start: u32, len: u32) -> Result<()> {
        ensure!(len > 0, "block '{name}' has zero length");
        let end = start + len;
        let idx = self
            .regions
            .iter()
            .position(|r| r.state == RegionState::Image && r.start <= start && end <= r.end);
        let Some(idx) = idx else {
            bail!("block '{name}' ({start:#X}..{end:#X}) is not within unclaimed image space");
        };
        let outer = self.regions.remove(idx);
        let mut replacement = Vec::with_capacity(3);
        if outer.start < start {
            replacement.push(Region { start: outer.start, end: start, state: RegionState::Image });
        }
        replacement.push(Region { start, end, state: RegionState::Block(name.to_string()) });
        if end < outer.end {
            replacement.push(Region { start: end, end: outer.end, state: RegionState::Image });
        }
        self.regions.splice(idx..idx, replacement);
        Ok(())
    }

    fn coalesce_free_around(&mut self, idx: usize) {
        // Merge with the right neighbor first so `idx` stays valid.
        if idx + 1 < self.regions.len()
            && self.regions[idx].state == RegionState::Free
            && self.regions[idx + 1].state == RegionState::Free
        {
            self.regions[idx].end = self.regions[idx + 1].end;
            self.regions.remove(idx + 1);
        }
        if idx > 0
            && self.regions[idx - 1].state == RegionState::Free
            && self.regions[idx].state == RegionState::Free
        {
            self.regions[idx - 1].end = self.regions[idx].end;
            self.regions.remove(idx);
        }
    }

    fn release(&mut self, idx: usize) {
        self.regions[idx].state = RegionState::Free;
        self.coalesce_free_around(idx);
    }

    /// Places `size` bytes for a named block: in place when the new size fits
    /// the block's old region, else best-fit free region, else appended at
    /// the growth frontier. Returns the placed offset; the old region (minus
    /// any reused prefix) is returned to the free pool.
    pub fn place(&mut self, name: &str, size: u32) -> Result<u32, PatchError> {
        if let Some(idx) = self.index_of_block(name) {
            let old = self.regions[idx].clone();
            if size <= old.len() {
                if size < old.len() {
                    self.regions[idx].end = old.start + size;
                    self.regions.insert(idx + 1, Region {
                        start: old.start + size,
                        end: old.end,
                        state: RegionState::Free,
                    });
                    self.coalesce_free_around(idx + 1);
                }
                return Ok(old.start);
            }
            self.release(idx);
        }

        // Best fit: the smallest free region that holds the block; ties go
        // to the lowest offset so placement is deterministic.
        let best = self
            .regions
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == RegionState::Free && r.len() >= size)
            .min_by_key(|(_, r)| (r.len(), r.start))
            .map(|(idx, _)| idx);
        if let Some(idx) = best {
            let start = self.regions[idx].start;
            if self.regions[idx].len() == size {
                self.regions[idx].state = RegionState::Block(name.to_string());
            } else {
                self.regions[idx].start = start + size;
                self.regions.insert(idx, Region {
                    start,
                    end: start + size,
                    state: RegionState::Block(name.to_string()),
                });
            }
            return Ok(start);
        }

        let start = self.len();
        let needed = start + size;
        if needed > self.limit {
            return Err(PatchError::AllocationExhausted { needed, limit: self.limit });
        }
        self.regions.push(Region {
            start,
            end: needed,
            state: RegionState::Block(name.to_string()),
        });
        Ok(start)
    }
}

/// Final placement of one block after a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub name: String,
    pub address: u32,
    pub length: u32,
}

/// Applies a full patch run to a copy of the base image.
///
/// `payloads` pairs with `config.blocks` by index. Processing is sequential
/// in declaration order; any failure propagates before an output image
/// exists, so partial images are never produced. Returns the patched image
/// and the final placements.
pub fn apply(
    image: &[u8],
    config: &PatchConfig,
    payloads: &[Vec<u8>],
    endian: Endian,
) -> Result<(Vec<u8>, Vec<Placement>)> {
    ensure!(
        payloads.len() == config.blocks.len(),
        "{} payload(s) supplied for {} configured block(s)",
        payloads.len(),
        config.blocks.len()
    );
    // The space spans the whole growable image so frontier addresses map too.
    let space = AddressSpace::new(config.base_address, config.size_limit);
    let mut map = RegionMap::new(image.len() as u32, config.size_limit)?;
    for block in &config.blocks {
        let offset = space.to_offset(block.address)?;
        map.carve(&block.name, offset, block.length)?;
    }

    let mut writer = ByteWriter::from_vec(image.to_vec(), endian);
    let mut placements = Vec::with_capacity(config.blocks.len());
    for (block, payload) in config.blocks.iter().zip(payloads) {
        ensure!(!payload.is_empty(), "block '{}' has an empty payload", block.name);
        let offset = map.place(&block.name, payload.len() as u32)?;
        writer.write_bytes(offset, payload);
        let address = space.to_address(offset)?;
        if address != block.address {
            info!(
                "Relocated '{}' from {:#010X} to {:#010X}",
                block.name, block.address, address
            );
        } else {
            debug!("Placed '{}' in place @ {:#010X}", block.name, address);
        }
        placements.push(Placement {
            name: block.name.clone(),
            address,
            length: payload.len() as u32,
        });
        rewrite_refs(&mut writer, &space, block, address)?;
    }

    // Master tables are rebuilt from scratch and spliced only once every
    // block has placed, never mutated incrementally.
    if let Some(table) = &config.config_table {
        splice_table(&mut writer, &space, table, &placements, false)?;
    }
    if let Some(table) = &config.asset_table {
        splice_table(&mut writer, &space, table, &placements, true)?;
    }

    let patched = writer.into_inner();
    debug_assert_eq!(patched.len() as u32, map.len());
    Ok((patched, placements))
}

fn rewrite_refs(
    writer: &mut ByteWriter,
    space: &AddressSpace,
    block: &BlockSpec,
    address: u32,
) -> Result<()> {
    for r in &block.refs {
        let offset = space.to_offset(r.address)?;
        ensure!(
            (offset as usize) < writer.len(),
            "reference to '{}' at {:#010X} is past the image end",
            block.name,
            r.address
        );
        let value = r.kind.split(address);
        match r.kind {
            config::RefKind::Absolute => writer.write_u32(offset, value),
            config::RefKind::Hi16 | config::RefKind::Lo16 => {
                writer.write_u16(offset, value as u16)
            }
        }
    }
    Ok(())
}

fn splice_table(
    writer: &mut ByteWriter,
    space: &AddressSpace,
    table: &TableSpec,
    placements: &[Placement],
    with_lengths: bool,
) -> Result<()> {
    let entry_size = if with_lengths { 8 } else { 4 };
    let offset = space.to_offset(table.address)?;
    let size = placements.len() as u32 * entry_size;
    ensure!(
        (offset + size) as usize <= writer.len(),
        "master table at {:#010X} ({size:#X} bytes) does not fit the image",
        table.address
    );
    for (i, placement) in placements.iter().enumerate() {
        let at = offset + i as u32 * entry_size;
        writer.write_u32(at, placement.address);
        if with_lengths {
            writer.write_u32(at + 4, placement.length);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rom::config::{RefKind, RefSpec};

    fn assert_partition(map: &RegionMap) {
        let regions = map.regions();
        assert!(!regions.is_empty());
        assert_eq!(regions[0].start, 0);
        for r in regions {
            assert!(r.start < r.end, "empty region {r:?}");
        }
        for pair in regions.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "gap or overlap at {pair:?}");
            assert!(
                !(pair[0].state == RegionState::Free && pair[1].state == RegionState::Free),
                "uncoalesced free regions {pair:?}"
            );
        }
    }

    #[test]
    fn test_oversized_block_appends_at_frontier_and_frees_old_region() {
        let mut map = RegionMap::new(200, 1000).unwrap();
        map.carve("A", 50, 100).unwrap();
        assert_partition(&map);

        let offset = map.place("A", 150).unwrap();
        assert_eq!(offset, 200);
        assert_eq!(map.len(), 350);
        // The old 100 bytes reappear as a free region
        assert!(map
            .regions()
            .iter()
            .any(|r| r.state == RegionState::Free && r.start == 50 && r.end == 150));
        assert_partition(&map);
    }

    #[test]
    fn test_in_place_shrink_frees_remainder() {
        let mut map = RegionMap::new(200, 1000).unwrap();
        map.carve("A", 50, 100).unwrap();
        let offset = map.place("A", 40).unwrap();
        assert_eq!(offset, 50);
        assert!(map
            .regions()
            .iter()
            .any(|r| r.state == RegionState::Free && r.start == 90 && r.end == 150));
        assert_partition(&map);
    }

    #[test]
    fn test_best_fit_prefers_smallest_adequate_region() {
        let mut map = RegionMap::new(300, 1000).unwrap();
        map.carve("A", 0, 120).unwrap();
        map.carve("B", 150, 60).unwrap();
        // Free both by relocating them to the frontier
        map.place("A", 200).unwrap();
        map.place("B", 200).unwrap();
        assert_partition(&map);
        // Free regions are now 0..120 and 150..210; 60 bytes best-fits the latter
        let offset = map.place("C", 60).unwrap();
        assert_eq!(offset, 150);
        assert_partition(&map);
    }

    #[test]
    fn test_exhaustion_is_fatal() {
        let mut map = RegionMap::new(200, 250).unwrap();
        map.carve("A", 50, 100).unwrap();
        let err = map.place("A", 150).unwrap_err();
        match err {
            PatchError::AllocationExhausted { needed, limit } => {
                assert_eq!(needed, 350);
                assert_eq!(limit, 250);
            }
            other => panic!("expected AllocationExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_partition_invariant_across_replacements() {
        let mut map = RegionMap::new(400, 4000).unwrap();
        map.carve("A", 0, 100).unwrap();
        map.carve("B", 100, 100).unwrap();
        map.carve("C", 300, 100).unwrap();
        for (name, size) in [("A", 150), ("B", 20), ("C", 100), ("A", 30), ("B", 500)] {
            map.place(name, size).unwrap();
            assert_partition(&map);
        }
    }

    #[test]
    fn test_apply_rewrites_refs_and_rebuilds_tables() {
        const BASE: u32 = 0x8000_0000;
        let mut image = vec![0u8; 0x100];
        // Block A occupies 0x40..0x60; an absolute ref at 0x10, split pair at 0x20
        image[0x10..0x14].copy_from_slice(&(BASE + 0x40).to_le_bytes());
        let config = PatchConfig {
            base_address: BASE,
            size_limit: 0x1000,
            blocks: vec![BlockSpec {
                name: "A".to_string(),
                address: BASE + 0x40,
                length: 0x20,
                source: "a.bin".into(),
                refs: vec![
                    RefSpec { address: BASE + 0x10, kind: RefKind::Absolute },
                    RefSpec { address: BASE + 0x20, kind: RefKind::Hi16 },
                    RefSpec { address: BASE + 0x24, kind: RefKind::Lo16 },
                ],
            }],
            config_table: Some(TableSpec { address: BASE + 0x80 }),
            asset_table: Some(TableSpec { address: BASE + 0x90 }),
        };
        // Replacement is larger than the old region, so it lands at 0x100
        let payload = vec![0xABu8; 0x30];
        let (patched, placements) =
            apply(&image, &config, &[payload], Endian::Little).unwrap();
        assert_eq!(placements[0].address, BASE + 0x100);
        assert_eq!(patched.len(), 0x130);
        assert_eq!(&patched[0x100..0x130], &[0xABu8; 0x30][..]);
        // Absolute ref rewritten
        assert_eq!(
            u32::from_le_bytes(patched[0x10..0x14].try_into().unwrap()),
            BASE + 0x100
        );
        // Split pair rewritten with carry semantics
        let hi = u16::from_le_bytes(patched[0x20..0x22].try_into().unwrap());
        let lo = u16::from_le_bytes(patched[0x24..0x26].try_into().unwrap());
        assert_eq!(
            ((hi as u32) << 16).wrapping_add(lo as i16 as i32 as u32),
            BASE + 0x100
        );
        // Master tables rebuilt
        assert_eq!(
            u32::from_le_bytes(patched[0x80..0x84].try_into().unwrap()),
            BASE + 0x100
        );
        assert_eq!(
            u32::from_le_bytes(patched[0x90..0x94].try_into().unwrap()),
            BASE + 0x100
        );
        assert_eq!(u32::from_le_bytes(patched[0x94..0x98].try_into().unwrap()), 0x30);
    }

    #[test]
    fn test_oversized_base_image_is_rejected() {
        assert!(RegionMap::new(0x200, 0x100).is_err());
    }
}
