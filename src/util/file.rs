use std::{
    collections::BTreeMap,
    fs::{DirBuilder, File},
    io::{BufRead, BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::util::parse_hex;

/// Creates a buffered writer around a file, creating parent directories.
pub fn buf_writer<P>(path: P) -> Result<BufWriter<File>>
where P: AsRef<Path> {
    if let Some(parent) = path.as_ref().parent() {
        DirBuilder::new().recursive(true).create(parent)?;
    }
    let file = File::create(&path)
        .with_context(|| format!("Failed to create file '{}'", path.as_ref().display()))?;
    Ok(BufWriter::new(file))
}

pub fn buf_reader<P>(path: P) -> Result<BufReader<File>>
where P: AsRef<Path> {
    let file = File::open(&path)
        .with_context(|| format!("Failed to open file '{}'", path.as_ref().display()))?;
    Ok(BufReader::new(file))
}

pub fn read_bytes<P>(path: P) -> Result<Vec<u8>>
where P: AsRef<Path> {
    std::fs::read(&path)
        .with_context(|| format!("Failed to read file '{}'", path.as_ref().display()))
}

pub fn read_string<P>(path: P) -> Result<String>
where P: AsRef<Path> {
    std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read file '{}'", path.as_ref().display()))
}

/// Process response files (starting with '@') and glob patterns (*).
pub fn process_globs(files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::with_capacity(files.len());
    for path in files {
        let path_str =
            path.to_str().ok_or_else(|| anyhow!("'{}' is not valid UTF-8", path.display()))?;
        if let Some(rsp_file) = path_str.strip_prefix('@') {
            for result in buf_reader(rsp_file)?.lines() {
                let line = result?;
                if !line.is_empty() {
                    out.push(PathBuf::from(line));
                }
            }
        } else if path_str.contains('*') {
            for entry in glob::glob(path_str)? {
                out.push(entry?);
            }
        } else {
            out.push(path.clone());
        }
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct RenameEntry {
    pub name: String,
    pub descriptor: Option<String>,
}

/// Parses an author-supplied rename map: one `ADDRESS = Name` per line, with
/// an optional `# descriptor` trailer. Comments and blanks are skipped.
pub fn parse_rename_map<P>(path: P) -> Result<BTreeMap<u32, RenameEntry>>
where P: AsRef<Path> {
    static RENAME_LINE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            "^\\s*(?P<addr>0[xX][0-9A-Fa-f]+|[0-9]+)\\s*=\\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*)\\s*(?:#\\s*(?P<desc>.*))?$",
        )
        .unwrap()
    });
    let mut map = BTreeMap::new();
    for (idx, result) in buf_reader(&path)?.lines().enumerate() {
        let line = result?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some(captures) = RENAME_LINE.captures(trimmed) else {
            bail!("{}:{}: invalid rename line '{}'", path.as_ref().display(), idx + 1, trimmed);
        };
        let addr = parse_hex(&captures["addr"])?;
        let entry = RenameEntry {
            name: captures["name"].to_string(),
            descriptor: captures.name("desc").map(|m| m.as_str().trim().to_string()),
        };
        map.insert(addr, entry);
    }
    Ok(map)
}
