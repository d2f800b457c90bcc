use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Result;
use regex::Regex;
use tracing::{info, warn};

use crate::util::manifest::Manifest;

/// Address-keyed name table for one engine build, distilled from a manifest.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    names: BTreeMap<u32, String>,
}

impl SymbolTable {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let names = manifest
            .structures()
            .map(|entry| (entry.address, entry.name.clone()))
            .collect();
        Self { names }
    }

    pub fn len(&self) -> usize { self.names.len() }

    pub fn is_empty(&self) -> bool { self.names.is_empty() }

    pub fn name_of(&self, address: u32) -> Option<&str> {
        self.names.get(&address).map(String::as_str)
    }
}

/// What happened to one old-build symbol in the new build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolChange {
    Unchanged,
    Renamed(String),
    /// Absent from the new build; the decoder substitutes an address-based
    /// placeholder name going forward.
    Removed,
}

/// Classifies every address of the old table into exactly one change.
pub fn diff(old: &SymbolTable, new: &SymbolTable) -> BTreeMap<u32, SymbolChange> {
    old.names
        .iter()
        .map(|(&address, old_name)| {
            let change = match new.names.get(&address) {
                Some(new_name) if new_name == old_name => SymbolChange::Unchanged,
                Some(new_name) => SymbolChange::Renamed(new_name.clone()),
                None => SymbolChange::Removed,
            };
            (address, change)
        })
        .collect()
}

/// The `old -> new` rename pairs of a diff, in address order.
pub fn rename_pairs(
    old: &SymbolTable,
    changes: &BTreeMap<u32, SymbolChange>,
) -> Vec<(String, String)> {
    changes
        .iter()
        .filter_map(|(address, change)| match change {
            SymbolChange::Renamed(new_name) => old
                .name_of(*address)
                .map(|old_name| (old_name.to_string(), new_name.clone())),
            _ => None,
        })
        .collect()
}

/// Replacement counts per corpus file.
pub type RewriteReport = Vec<(PathBuf, usize)>;

/// Rewrites exact whole-word occurrences of each renamed symbol across a
/// corpus of text patches. All renames happen in one simultaneous pass, so
/// chained pairs (`Alpha -> Beta`, `Beta -> Gamma`) and swaps never feed one
/// rule's output into another. Names with zero occurrences anywhere are
/// logged and skipped, never an error; stale symbols are expected in old
/// corpora.
pub fn apply_renames(paths: &[PathBuf], pairs: &[(String, String)]) -> Result<RewriteReport> {
    if pairs.is_empty() {
        return Ok(paths.iter().map(|path| (path.clone(), 0)).collect());
    }
    let replacements: BTreeMap<&str, &str> =
        pairs.iter().map(|(old, new)| (old.as_str(), new.as_str())).collect();
    let pattern = format!(
        r"\b(?:{})\b",
        pairs.iter().map(|(old, _)| regex::escape(old)).collect::<Vec<_>>().join("|")
    );
    let regex = Regex::new(&pattern)?;

    let mut report = Vec::with_capacity(paths.len());
    let mut totals: BTreeMap<&str, usize> =
        pairs.iter().map(|(old, _)| (old.as_str(), 0)).collect();
    for path in paths {
        let text = crate::util::file::read_string(path)?;
        let mut count = 0usize;
        for found in regex.find_iter(&text) {
            count += 1;
            if let Some(total) = totals.get_mut(found.as_str()) {
                *total += 1;
            }
        }
        if count > 0 {
            let rewritten =
                regex.replace_all(&text, |captures: &regex::Captures| {
                    replacements[&captures[0]].to_string()
                });
            write_rewritten(path, &rewritten)?;
            info!("{}: {} replacement(s)", path.display(), count);
        }
        report.push((path.clone(), count));
    }
    for (old_name, total) in &totals {
        if *total == 0 {
            warn!("Rename source '{old_name}' not found anywhere in the corpus");
        }
    }
    Ok(report)
}

fn write_rewritten(path: &Path, text: &str) -> Result<()> {
    use std::io::Write;
    let mut w = crate::util::file::buf_writer(path)?;
    w.write_all(text.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn table(rows: &str) -> SymbolTable {
        SymbolTable::from_manifest(&Manifest::parse(Cursor::new(rows), "test").unwrap())
    }

    #[test]
    fn test_diff_classifies_every_address() {
        let old = table(
            "A | Header | 00000000 | 80010000 | 00000010\n\
             B | Marker | 00000010 | 80010010 | 00000008\n\
             C | Model | 00000018 | 80010018 | 0000000C\n",
        );
        let new = table(
            "A | Header | 00000000 | 80010000 | 00000010\n\
             B2 | Marker | 00000010 | 80010010 | 00000008\n",
        );
        let changes = diff(&old, &new);
        assert_eq!(changes.len(), old.len());
        assert_eq!(changes[&0x8001_0000], SymbolChange::Unchanged);
        assert_eq!(changes[&0x8001_0010], SymbolChange::Renamed("B2".to_string()));
        assert_eq!(changes[&0x8001_0018], SymbolChange::Removed);
        assert_eq!(rename_pairs(&old, &changes), vec![("B".to_string(), "B2".to_string())]);
    }

    #[test]
    fn test_rewrite_is_whole_word_and_idempotent() {
        let dir = std::env::temp_dir().join("ptk_sym_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("patch.txt");
        std::fs::write(&path, "marker: $Marker:Model_1\nnext: $Model:Model_10\n").unwrap();

        let pairs = vec![("Model_1".to_string(), "Tree".to_string())];
        let report = apply_renames(&[path.clone()], &pairs).unwrap();
        assert_eq!(report[0].1, 1);
        let text = std::fs::read_to_string(&path).unwrap();
        // Model_10 shares a prefix but is a different word
        assert_eq!(text, "marker: $Marker:Tree\nnext: $Model:Model_10\n");

        // A second run finds nothing left to rewrite
        let report = apply_renames(&[path.clone()], &pairs).unwrap();
        assert_eq!(report[0].1, 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_chained_renames_do_not_cascade() {
        let dir = std::env::temp_dir().join("ptk_sym_chain_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("patch.txt");
        std::fs::write(&path, "a: $Model:Alpha\nb: $Model:Beta\n").unwrap();

        // Alpha must end as Beta, not get picked up again by the second rule.
        let pairs = vec![
            ("Alpha".to_string(), "Beta".to_string()),
            ("Beta".to_string(), "Gamma".to_string()),
        ];
        let report = apply_renames(&[path.clone()], &pairs).unwrap();
        assert_eq!(report[0].1, 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a: $Model:Beta\nb: $Model:Gamma\n");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_swapped_renames_exchange_cleanly() {
        let dir = std::env::temp_dir().join("ptk_sym_swap_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("patch.txt");
        std::fs::write(&path, "first: $Marker:Door_A\nsecond: $Marker:Door_B\n").unwrap();

        let pairs = vec![
            ("Door_A".to_string(), "Door_B".to_string()),
            ("Door_B".to_string(), "Door_A".to_string()),
        ];
        apply_renames(&[path.clone()], &pairs).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "first: $Marker:Door_B\nsecond: $Marker:Door_A\n");
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_rename_source_is_not_an_error() {
        let dir = std::env::temp_dir().join("ptk_sym_missing_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("patch.txt");
        std::fs::write(&path, "kind: 0001\n").unwrap();
        let pairs = vec![("NoSuchName".to_string(), "Other".to_string())];
        let report = apply_renames(&[path.clone()], &pairs).unwrap();
        assert_eq!(report[0].1, 0);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
