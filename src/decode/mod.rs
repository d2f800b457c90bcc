pub mod script;

use std::{
    collections::{BTreeMap, VecDeque},
    io::Write,
};

use anyhow::{anyhow, bail, Context, Result};
use itertools::Itertools;
use tracing::{debug, warn};

use crate::{
    graph::{
        addr::{AddressSpace, Cursor, Endian},
        DecodedField, FieldValue, Origin, Pointer, PointerGraph, PointerId, UNKNOWN_TYPE,
    },
    typelib::{ArrayLen, FieldKind, ScalarWidth, TypeLibrary, TypeSignature},
    util::{
        file::RenameEntry,
        manifest::{Manifest, ManifestEntry, MARKER_PADDING},
        parse_hex,
    },
};

use self::script::{Instruction, ScriptItem};

/// How many bytes of an unclassified structure are probed and carried through
/// a round trip. Clipped to the next known structure so manifests never
/// overlap.
const UNKNOWN_PROBE: u32 = 16;

/// A structure whose address is supplied externally rather than discovered
/// via another structure's field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    pub type_name: String,
    pub address: u32,
}

impl Root {
    /// Parses the CLI form `Type:0xADDRESS`.
    pub fn parse(value: &str) -> Result<Self> {
        let (type_name, addr) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid root '{value}', expected Type:ADDRESS"))?;
        Ok(Root { type_name: type_name.to_string(), address: parse_hex(addr)? })
    }
}

#[derive(Debug)]
pub struct RootFailure {
    pub root: Root,
    pub error: anyhow::Error,
}

#[derive(Debug)]
pub struct DecodeOutput {
    pub graph: PointerGraph,
    /// Roots whose decode aborted; siblings continue, failures aggregate.
    pub failures: Vec<RootFailure>,
}

struct WorkItem {
    address: u32,
    type_name: String,
    origin: Origin,
}

pub struct Decoder<'a> {
    data: &'a [u8],
    space: AddressSpace,
    endian: Endian,
    library: &'a TypeLibrary,
    renames: &'a BTreeMap<u32, RenameEntry>,
}

impl<'a> Decoder<'a> {
    pub fn new(
        data: &'a [u8],
        space: AddressSpace,
        endian: Endian,
        library: &'a TypeLibrary,
        renames: &'a BTreeMap<u32, RenameEntry>,
    ) -> Self {
        Self { data, space, endian, library, renames }
    }

    /// Discovers every structure transitively reachable from the declared
    /// roots. One root failing rolls back only its own subtree.
    pub fn decode(&self, roots: &[Root]) -> Result<DecodeOutput> {
        let mut graph = PointerGraph::default();
        let mut failures = Vec::new();
        for root in roots {
            let checkpoint = graph.len();
            match self.decode_root(&mut graph, root) {
                Ok(()) => {
                    debug!("Decoded root {} @ {:#010X}", root.type_name, root.address)
                }
                Err(e) => {
                    warn!(
                        "Decode of root {} @ {:#010X} failed: {:?}",
                        root.type_name, root.address, e
                    );
                    graph.truncate(checkpoint);
                    failures.push(RootFailure { root: root.clone(), error: e });
                }
            }
        }
        self.finalize_unknowns(&mut graph)?;
        Ok(DecodeOutput { graph, failures })
    }

    fn decode_root(&self, graph: &mut PointerGraph, root: &Root) -> Result<()> {
        let mut worklist = VecDeque::new();
        worklist.push_back(WorkItem {
            address: root.address,
            type_name: root.type_name.clone(),
            origin: Origin::Root,
        });
        while let Some(item) = worklist.pop_front() {
            self.expand(graph, &mut worklist, item)?;
        }
        Ok(())
    }

    fn expand(
        &self,
        graph: &mut PointerGraph,
        worklist: &mut VecDeque<WorkItem>,
        item: WorkItem,
    ) -> Result<()> {
        let parent = match item.origin {
            Origin::Root => None,
            Origin::Child { parent } | Origin::TableElement { parent, .. } => Some(parent),
        };
        // Dedup by address: re-converging references attach an edge and stop,
        // which keeps the traversal finite over cyclic data.
        if let Some(existing) = graph.lookup(item.address) {
            graph.add_edge(parent, existing);
            return Ok(());
        }
        let offset = self.space.to_offset(item.address)?;

        let sig = match self.library.lookup(&item.type_name) {
            Some(sig) => Some(sig),
            None if item.type_name == UNKNOWN_TYPE => None,
            None => {
                // Not an error: the field declared a type the library does
                // not know. Record a typed placeholder and probe it.
                warn!(
                    "No signature for type '{}' @ {:#010X}, decoding as unknown",
                    item.type_name, item.address
                );
                None
            }
        };

        let mut fields = Vec::new();
        let mut pending: Vec<(u32, String, Option<usize>)> = Vec::new();
        let mut annotations = Vec::new();
        let mut list_len = None;
        let mut size = 0u32;

        if let Some(sig) = sig {
            size = self.scan_fields(
                sig,
                offset,
                &mut fields,
                &mut pending,
                &mut annotations,
                &mut list_len,
            )
            .with_context(|| {
                format!("Failed to decode {} @ {:#010X}", sig.name, item.address)
            })?;
        }

        let (name, descriptor) = self.assign_name(
            if sig.is_some() { &item.type_name } else { UNKNOWN_TYPE },
            item.address,
            item.origin,
        );
        let id = graph.insert(Pointer {
            address: item.address,
            type_name: if sig.is_some() { item.type_name.clone() } else { UNKNOWN_TYPE.to_string() },
            name,
            descriptor,
            children: vec![],
            ancestors: vec![],
            list_len,
            annotations,
            fields,
            offset,
            size,
        })?;
        graph.add_edge(parent, id);

        for (address, type_name, table_index) in pending {
            let origin = match table_index {
                Some(index) => Origin::TableElement { parent: id, index },
                None => Origin::Child { parent: id },
            };
            worklist.push_back(WorkItem { address, type_name, origin });
        }
        Ok(())
    }

    /// Scans one structure's bytes field by field. Returns the structure's
    /// byte size; pointer-valued fields land in `pending` for the worklist.
    fn scan_fields(
        &self,
        sig: &TypeSignature,
        offset: u32,
        fields: &mut Vec<DecodedField>,
        pending: &mut Vec<(u32, String, Option<usize>)>,
        annotations: &mut Vec<String>,
        list_len: &mut Option<usize>,
    ) -> Result<u32> {
        let base = Cursor::new(self.data, self.space, self.endian);
        let mut end = 0u32;
        for field in &sig.fields {
            let mut cursor = base.at_offset(offset + field.offset);
            let value = match &field.kind {
                FieldKind::Scalar { width } => {
                    FieldValue::Scalar { value: self.read_scalar(&mut cursor, *width)?, width: *width }
                }
                FieldKind::Pointer { target } => {
                    let address = cursor.read_u32()?;
                    if address != 0 && self.space.is_local(address) {
                        pending.push((address, target.clone(), None));
                    }
                    FieldValue::Pointer { target: address }
                }
                FieldKind::Array { width, len } => {
                    let count = self.array_len(len, fields, sig)?;
                    let mut elems = Vec::with_capacity(count);
                    for _ in 0..count {
                        elems.push(self.read_scalar(&mut cursor, *width)?);
                    }
                    FieldValue::Array { elems, width: *width }
                }
                FieldKind::PointerArray { target, len } => {
                    let count = self.array_len(len, fields, sig)?;
                    let mut targets = Vec::with_capacity(count);
                    for index in 0..count {
                        let address = cursor.read_u32()?;
                        if address != 0 && self.space.is_local(address) {
                            pending.push((address, target.clone(), Some(index)));
                        }
                        targets.push(address);
                    }
                    *list_len = Some(count);
                    FieldValue::PointerArray { targets }
                }
                FieldKind::Script => {
                    let scan = script::scan_script(&mut cursor, self.library)?;
                    for (address, type_name) in scan.children {
                        if self.space.is_local(address) {
                            pending.push((address, type_name, None));
                        }
                    }
                    for marker in scan.markers {
                        annotations.push(format!("assigned to marker {marker}"));
                    }
                    FieldValue::Script { items: scan.items }
                }
            };
            end = end.max(cursor.offset() - offset);
            fields.push(DecodedField { name: field.name.clone(), value });
        }
        Ok(end)
    }

    fn read_scalar(&self, cursor: &mut Cursor, width: ScalarWidth) -> Result<u32> {
        Ok(match width {
            ScalarWidth::U8 => cursor.read_u8()? as u32,
            ScalarWidth::U16 => cursor.read_u16()? as u32,
            ScalarWidth::U32 => cursor.read_u32()?,
        })
    }

    fn array_len(
        &self,
        len: &ArrayLen,
        fields: &[DecodedField],
        sig: &TypeSignature,
    ) -> Result<usize> {
        match len {
            ArrayLen::Fixed(count) => Ok(*count),
            ArrayLen::Field(name) => {
                let field = fields.iter().find(|f| f.name == *name).ok_or_else(|| {
                    anyhow!("{}: length field '{}' precedes no scalar", sig.name, name)
                })?;
                match &field.value {
                    FieldValue::Scalar { value, .. } => Ok(*value as usize),
                    _ => bail!("{}: length field '{}' is not a scalar", sig.name, name),
                }
            }
        }
    }

    /// Canonical name: author override, table-derived, or address fallback.
    /// Collisions are left for the caller to resolve before serialization.
    fn assign_name(
        &self,
        type_name: &str,
        address: u32,
        origin: Origin,
    ) -> (String, Option<String>) {
        if let Some(entry) = self.renames.get(&address) {
            return (entry.name.clone(), entry.descriptor.clone());
        }
        let name = match origin {
            Origin::TableElement { index, .. } => format!("{type_name}_{index}"),
            _ => format!("{type_name}_{address:08X}"),
        };
        (name, None)
    }

    /// Unknown structures get their probe window filled in once traversal is
    /// done, clipped so they never overlap a later-discovered neighbor.
    fn finalize_unknowns(&self, graph: &mut PointerGraph) -> Result<()> {
        let nodes: Vec<(u32, PointerId)> =
            graph.iter_by_address().map(|(id, node)| (node.address, id)).collect();
        for (i, &(address, id)) in nodes.iter().enumerate() {
            if graph.get(id).type_name != UNKNOWN_TYPE {
                continue;
            }
            let range_end = self.space.address_range().end;
            let mut probe = UNKNOWN_PROBE.min(range_end - address);
            if let Some(&(next, _)) = nodes.get(i + 1) {
                probe = probe.min(next - address);
            }
            let offset = self.space.to_offset(address)?;
            let bytes =
                self.data[offset as usize..(offset + probe) as usize].to_vec();
            let node = graph.get_mut(id);
            node.size = probe;
            node.fields = vec![DecodedField {
                name: "data".to_string(),
                value: FieldValue::Raw { bytes },
            }];
        }
        Ok(())
    }
}

/// Serializes the graph to the durable, diffable text form: one block per
/// structure in address order, symbolic names wherever a field value equals a
/// known structure's address. Undiscovered gaps between structures travel as
/// verbatim Padding blocks, so a re-encode reproduces their bytes instead of
/// zero-filling.
pub fn write_text<W>(
    w: &mut W,
    graph: &PointerGraph,
    library: &TypeLibrary,
    data: &[u8],
    space: &AddressSpace,
) -> Result<()>
where W: Write + ?Sized {
    let mut cursor = 0u32;
    for (_, node) in graph.iter_by_address() {
        if node.offset > cursor {
            write_padding(w, data, cursor, node.offset)?;
        }
        cursor = cursor.max(node.offset + node.size);
        if let Some(descriptor) = &node.descriptor {
            writeln!(w, "# {descriptor}")?;
        }
        for annotation in &node.annotations {
            writeln!(w, "# note: {annotation}")?;
        }
        writeln!(w, "[{}:{}]", node.type_name, node.name)?;
        for field in &node.fields {
            match &field.value {
                FieldValue::Scalar { value, width } => {
                    writeln!(w, "{}: {}", field.name, fmt_scalar(*value, *width))?;
                }
                FieldValue::Pointer { target } => {
                    writeln!(w, "{}: {}", field.name, fmt_pointer(*target, graph))?;
                }
                FieldValue::Array { elems, width } => {
                    let body = elems.iter().map(|&v| fmt_scalar(v, *width)).join(" ");
                    writeln!(w, "{}: [{}]", field.name, body)?;
                }
                FieldValue::PointerArray { targets } => {
                    let body = targets.iter().map(|&t| fmt_pointer(t, graph)).join(" ");
                    writeln!(w, "{}: [{}]", field.name, body)?;
                }
                FieldValue::Raw { bytes } => {
                    writeln!(w, "{}: {}", field.name, hex::encode(bytes))?;
                }
                FieldValue::Script { items } => {
                    writeln!(w, "{}:", field.name)?;
                    for item in items {
                        writeln!(w, "  {}", fmt_script_item(item, graph, library))?;
                    }
                }
            }
        }
        writeln!(w)?;
    }
    if space.len() > cursor {
        write_padding(w, data, cursor, space.len())?;
    }
    Ok(())
}

fn write_padding<W>(w: &mut W, data: &[u8], start: u32, end: u32) -> Result<()>
where W: Write + ?Sized {
    writeln!(w, "[{MARKER_PADDING}:{MARKER_PADDING}]")?;
    writeln!(w, "data: {}", hex::encode(&data[start as usize..end as usize]))?;
    writeln!(w)?;
    Ok(())
}

fn fmt_scalar(value: u32, width: ScalarWidth) -> String {
    format!("{value:0digits$X}", digits = width.hex_digits())
}

fn fmt_pointer(target: u32, graph: &PointerGraph) -> String {
    if target == 0 {
        return "00000000".to_string();
    }
    match graph.lookup(target) {
        Some(id) => {
            let node = graph.get(id);
            format!("${}:{}", node.type_name, node.name)
        }
        None => format!("{target:08X}"),
    }
}

fn fmt_script_item(item: &ScriptItem, graph: &PointerGraph, library: &TypeLibrary) -> String {
    match item {
        ScriptItem::Ins(ins) => match *ins {
            Instruction::End => "end".to_string(),
            Instruction::Ret => "ret".to_string(),
            Instruction::Push(imm) => format!("push {imm:04X}"),
            Instruction::PushVar(idx) => format!("pushvar {idx:02X}"),
            Instruction::Call { target, argc } => match library.resolve_call(target) {
                Some(sig) => {
                    let params = sig
                        .matching_params(argc as usize)
                        .map(|list| list.iter().map(|p| p.name.as_str()).join(", "))
                        .unwrap_or_default();
                    format!("call $Fn:{} {argc:02X} # ({params})", sig.name)
                }
                None => format!("call {target:08X} {argc:02X}"),
            },
            Instruction::Table(addr) => format!("table {}", fmt_pointer(addr, graph)),
            Instruction::Jump(off) => format!("jump {off:04X}"),
            Instruction::Marker(id) => format!("marker {id:04X}"),
            Instruction::Wait(frames) => format!("wait {frames:04X}"),
        },
        ScriptItem::EnterExit { enter, exit } => format!("enterexit {enter:04X} {exit:04X}"),
        ScriptItem::Foliage { target } => format!("foliage {}", fmt_pointer(*target, graph)),
    }
}

/// Builds the manifest for a decoded graph: one row per structure plus the
/// Start/End sentinels, with Padding rows covering undiscovered gaps.
pub fn build_manifest(graph: &PointerGraph, space: &AddressSpace) -> Result<Manifest> {
    let mut seen = BTreeMap::<&str, u32>::new();
    for (_, node) in graph.iter_by_address() {
        if let Some(&other) = seen.get(node.name.as_str()) {
            bail!(
                "Name collision: '{}' used by both {:#010X} and {:#010X}; rename one before serializing",
                node.name,
                other,
                node.address
            );
        }
        seen.insert(&node.name, node.address);
    }

    let structures = graph
        .iter_by_address()
        .map(|(_, node)| ManifestEntry {
            name: node.name.clone(),
            type_name: node.type_name.clone(),
            offset: node.offset,
            address: node.address,
            length: node.size,
        })
        .collect();
    let manifest = Manifest::assemble(space.base_address(), structures, space.len());
    manifest.validate("decode")?;
    Ok(manifest)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::util::manifest::{SENTINEL_END, SENTINEL_START};

    pub(crate) const BASE: u32 = 0x8001_0000;

    /// Lays out a small world blob by hand:
    ///   0x00 Header  { version, flags, entities -> 0x10, init -> 0x30 }
    ///   0x10 EntityTable { count=2, models: [0x40, 0x50] }
    ///   0x30 Script  { push 1; call SetWeather(1); end }
    ///   0x40 Model   { id, radius, marker -> 0x60, next -> 0x50 }
    ///   0x50 Model   { id, radius, marker -> 0x60, next -> self }
    ///   0x60 Marker  { kind, pos[3] }
    pub(crate) fn sample_blob() -> Vec<u8> {
        let mut data = vec![0u8; 0x68];
        // Header
        data[0x00..0x02].copy_from_slice(&0x0102u16.to_le_bytes());
        data[0x02..0x04].copy_from_slice(&0x0003u16.to_le_bytes());
        data[0x04..0x08].copy_from_slice(&(BASE + 0x10).to_le_bytes());
        data[0x08..0x0C].copy_from_slice(&(BASE + 0x30).to_le_bytes());
        // EntityTable
        data[0x10..0x14].copy_from_slice(&2u32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&(BASE + 0x40).to_le_bytes());
        data[0x18..0x1C].copy_from_slice(&(BASE + 0x50).to_le_bytes());
        // Script: push 1; call SetWeather argc=1; end
        data[0x30] = 0x10;
        data[0x31..0x33].copy_from_slice(&1u16.to_le_bytes());
        data[0x33] = 0x20;
        data[0x34..0x38].copy_from_slice(&0x8004_A000u32.to_le_bytes());
        data[0x38] = 0x01;
        data[0x39] = 0x00;
        // Model 0
        data[0x40..0x42].copy_from_slice(&7u16.to_le_bytes());
        data[0x42..0x44].copy_from_slice(&32u16.to_le_bytes());
        data[0x44..0x48].copy_from_slice(&(BASE + 0x60).to_le_bytes());
        data[0x48..0x4C].copy_from_slice(&(BASE + 0x50).to_le_bytes());
        // Model 1, self-referential next
        data[0x50..0x52].copy_from_slice(&8u16.to_le_bytes());
        data[0x52..0x54].copy_from_slice(&48u16.to_le_bytes());
        data[0x54..0x58].copy_from_slice(&(BASE + 0x60).to_le_bytes());
        data[0x58..0x5C].copy_from_slice(&(BASE + 0x50).to_le_bytes());
        // Marker
        data[0x60..0x62].copy_from_slice(&3u16.to_le_bytes());
        data[0x62..0x64].copy_from_slice(&10u16.to_le_bytes());
        data[0x64..0x66].copy_from_slice(&20u16.to_le_bytes());
        data[0x66..0x68].copy_from_slice(&30u16.to_le_bytes());
        data
    }

    pub(crate) fn decode_sample(data: &[u8]) -> DecodeOutput {
        let library = TypeLibrary::builtin().unwrap();
        let space = AddressSpace::new(BASE, data.len() as u32);
        let renames = BTreeMap::new();
        let decoder = Decoder::new(data, space, Endian::Little, &library, &renames);
        decoder
            .decode(&[Root { type_name: "Header".to_string(), address: BASE }])
            .unwrap()
    }

    #[test]
    fn test_decode_discovers_reachable_graph() {
        let data = sample_blob();
        let output = decode_sample(&data);
        assert!(output.failures.is_empty());
        // Header, EntityTable, Script, Model x2, Marker
        assert_eq!(output.graph.len(), 6);
        let table = output.graph.lookup(BASE + 0x10).unwrap();
        assert_eq!(output.graph.get(table).list_len, Some(2));
        // Table elements get context-derived names
        let model0 = output.graph.lookup(BASE + 0x40).unwrap();
        assert_eq!(output.graph.get(model0).name, "Model_0");
    }

    #[test]
    fn test_dedup_two_parents_one_node() {
        let data = sample_blob();
        let output = decode_sample(&data);
        // Marker is referenced by both models but decoded once
        let marker = output.graph.lookup(BASE + 0x60).unwrap();
        assert_eq!(output.graph.get(marker).ancestors.len(), 2);
    }

    #[test]
    fn test_self_reference_terminates() {
        let data = sample_blob();
        let output = decode_sample(&data);
        let model1 = output.graph.lookup(BASE + 0x50).unwrap();
        assert!(output.graph.get(model1).ancestors.contains(&model1));
        let space = AddressSpace::new(BASE, data.len() as u32);
        let mut text = Vec::new();
        write_text(&mut text, &output.graph, &TypeLibrary::builtin().unwrap(), &data, &space)
            .unwrap();
        let text = String::from_utf8(text).unwrap();
        // The self-referential field prints its own symbolic name
        assert!(text.contains("next: $Model:Model_1"));
    }

    #[test]
    fn test_malformed_script_aborts_root_but_not_siblings() {
        let mut data = sample_blob();
        data[0x30] = 0xEE; // unknown opcode in the Header root's script
        let library = TypeLibrary::builtin().unwrap();
        let space = AddressSpace::new(BASE, data.len() as u32);
        let renames = BTreeMap::new();
        let decoder = Decoder::new(&data, space, Endian::Little, &library, &renames);
        let output = decoder
            .decode(&[
                Root { type_name: "Header".to_string(), address: BASE },
                Root { type_name: "Marker".to_string(), address: BASE + 0x60 },
            ])
            .unwrap();
        assert_eq!(output.failures.len(), 1);
        assert_eq!(output.failures[0].root.type_name, "Header");
        // The sibling root still decoded
        assert_eq!(output.graph.len(), 1);
        assert!(output.graph.lookup(BASE + 0x60).is_some());
    }

    #[test]
    fn test_manifest_rows_and_sentinels() {
        let data = sample_blob();
        let output = decode_sample(&data);
        let space = AddressSpace::new(BASE, data.len() as u32);
        let manifest = build_manifest(&output.graph, &space).unwrap();
        assert_eq!(manifest.entries.first().unwrap().name, SENTINEL_START);
        assert_eq!(manifest.entries.last().unwrap().name, SENTINEL_END);
        assert_eq!(manifest.structures().count(), 6);
        let header = manifest.by_name("Header_80010000").unwrap();
        assert_eq!(header.offset, 0);
        assert_eq!(header.length, 0x0C);
    }
}
