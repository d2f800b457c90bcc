pub mod addr;

use std::collections::BTreeMap;

use anyhow::{bail, Result};

use crate::{decode::script::ScriptItem, typelib::ScalarWidth};

/// Reserved type name for pointer targets that resolve to no registered
/// signature. Unknown structures are still carried through a round trip,
/// never corrupted, but the decoder only probes them generically.
pub const UNKNOWN_TYPE: &str = "Unknown";

/// Index into the [PointerGraph] arena. Graph edges are stored as indices,
/// not references, so re-converging and self-referential graphs need no
/// ownership gymnastics.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PointerId(pub usize);

/// How a structure's address became known to the decoder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Origin {
    /// Address supplied externally, not discovered via another structure.
    Root,
    Child { parent: PointerId },
    /// Discovered as the Nth element of a known table; drives the
    /// `<Type>_<index>` naming heuristic.
    TableElement { parent: PointerId, index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Scalar { value: u32, width: ScalarWidth },
    /// Raw 32-bit address. Printed symbolically when the target is a known
    /// local structure, as raw hex otherwise (null, foreign).
    Pointer { target: u32 },
    Array { elems: Vec<u32>, width: ScalarWidth },
    PointerArray { targets: Vec<u32> },
    Script { items: Vec<ScriptItem> },
    /// Probe window over an unknown structure, carried verbatim.
    Raw { bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedField {
    pub name: String,
    pub value: FieldValue,
}

/// An address-identified graph node standing for one decoded structure
/// (not a language pointer).
#[derive(Debug, Clone)]
pub struct Pointer {
    pub address: u32,
    pub type_name: String,
    pub name: String,
    /// Optional human hint carried from the rename map, e.g. "Trunk".
    pub descriptor: Option<String>,
    pub children: Vec<PointerId>,
    pub ancestors: Vec<PointerId>,
    /// Element count, for array-typed structures.
    pub list_len: Option<usize>,
    /// Decode-time notes, serialized as comments (ignored on re-encode).
    pub annotations: Vec<String>,
    pub fields: Vec<DecodedField>,
    pub offset: u32,
    pub size: u32,
}

/// Arena of structures indexed by address. A Pointer is a singleton per
/// address within one decode/encode session: repeated references resolve to
/// the same node, which keeps traversal finite even over cyclic data.
#[derive(Debug, Default)]
pub struct PointerGraph {
    nodes: Vec<Pointer>,
    by_address: BTreeMap<u32, PointerId>,
}

impl PointerGraph {
    pub fn len(&self) -> usize { self.nodes.len() }

    pub fn is_empty(&self) -> bool { self.nodes.is_empty() }

    pub fn get(&self, id: PointerId) -> &Pointer { &self.nodes[id.0] }

    pub fn get_mut(&mut self, id: PointerId) -> &mut Pointer { &mut self.nodes[id.0] }

    pub fn lookup(&self, address: u32) -> Option<PointerId> {
        self.by_address.get(&address).copied()
    }

    pub fn insert(&mut self, pointer: Pointer) -> Result<PointerId> {
        if self.by_address.contains_key(&pointer.address) {
            bail!("Duplicate structure @ {:#010X}", pointer.address);
        }
        let id = PointerId(self.nodes.len());
        self.by_address.insert(pointer.address, id);
        self.nodes.push(pointer);
        Ok(id)
    }

    /// Records a parent→child reference edge in both directions. Duplicate
    /// edges collapse (two fields of one parent may reference one child).
    pub fn add_edge(&mut self, parent: Option<PointerId>, child: PointerId) {
        let Some(parent) = parent else { return };
        if !self.nodes[parent.0].children.contains(&child) {
            self.nodes[parent.0].children.push(child);
        }
        if !self.nodes[child.0].ancestors.contains(&parent) {
            self.nodes[child.0].ancestors.push(parent);
        }
    }

    /// Nodes in address order, the canonical serialization order.
    pub fn iter_by_address(&self) -> impl Iterator<Item = (PointerId, &Pointer)> + '_ {
        self.by_address.values().map(move |&id| (id, &self.nodes[id.0]))
    }

    /// Rolls the arena back to `len` nodes, discarding a failed root's
    /// partial subtree. Edges into the discarded tail are unlinked.
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
        self.by_address.retain(|_, id| id.0 < len);
        for node in &mut self.nodes {
            node.children.retain(|id| id.0 < len);
            node.ancestors.retain(|id| id.0 < len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(address: u32) -> Pointer {
        Pointer {
            address,
            type_name: "Marker".to_string(),
            name: format!("Marker_{address:08X}"),
            descriptor: None,
            children: vec![],
            ancestors: vec![],
            list_len: None,
            annotations: vec![],
            fields: vec![],
            offset: 0,
            size: 8,
        }
    }

    #[test]
    fn test_singleton_per_address() {
        let mut graph = PointerGraph::default();
        let id = graph.insert(node(0x8001_0000)).unwrap();
        assert_eq!(graph.lookup(0x8001_0000), Some(id));
        assert!(graph.insert(node(0x8001_0000)).is_err());
    }

    #[test]
    fn test_two_parents_one_child() {
        let mut graph = PointerGraph::default();
        let a = graph.insert(node(0x8001_0000)).unwrap();
        let b = graph.insert(node(0x8001_0010)).unwrap();
        let c = graph.insert(node(0x8001_0020)).unwrap();
        graph.add_edge(Some(a), c);
        graph.add_edge(Some(b), c);
        graph.add_edge(Some(b), c);
        assert_eq!(graph.get(c).ancestors, vec![a, b]);
        assert_eq!(graph.get(b).children, vec![c]);
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_truncate_unlinks_edges() {
        let mut graph = PointerGraph::default();
        let a = graph.insert(node(0x8001_0000)).unwrap();
        let b = graph.insert(node(0x8001_0010)).unwrap();
        graph.add_edge(Some(a), b);
        graph.truncate(1);
        assert_eq!(graph.len(), 1);
        assert!(graph.lookup(0x8001_0010).is_none());
        assert!(graph.get(a).children.is_empty());
    }
}
