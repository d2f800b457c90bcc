pub mod expr;

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::{
    decode::script,
    graph::{
        addr::{align4, ByteWriter, Endian},
        UNKNOWN_TYPE,
    },
    typelib::{ArrayLen, FieldKind, ScalarWidth, TypeLibrary, TypeSignature},
    util::manifest::{Manifest, ManifestEntry, MARKER_MISSING, MARKER_PADDING},
};

use self::expr::{Expr, MarkerLookup, ProjectDatabase, Resolver};

/// One value token from the textual form: raw hex, or a symbolic expression
/// deferred to pass two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Hex(u32),
    Expr(Expr),
}

impl Token {
    fn parse(s: &str, source: &str, line: usize) -> Result<Token> {
        if s.starts_with('$') {
            let expr = Expr::parse(s)
                .ok_or_else(|| anyhow!("{source}:{line}: invalid expression '{s}'"))?;
            Ok(Token::Expr(expr))
        } else {
            let value = u32::from_str_radix(s, 16)
                .map_err(|_| anyhow!("{source}:{line}: invalid hex token '{s}'"))?;
            Ok(Token::Hex(value))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    pub mnemonic: String,
    pub args: Vec<Token>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Single(Token),
    List(Vec<Token>),
    Script(Vec<Stmt>),
    /// Verbatim bytes of an unclassified structure's probe window.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: Value,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub type_name: String,
    pub name: String,
    pub fields: Vec<Field>,
    pub line: usize,
}

/// Blocks carried as verbatim bytes: unclassified probe windows and the
/// undiscovered gaps between structures.
fn is_raw_block(type_name: &str) -> bool {
    type_name == UNKNOWN_TYPE || type_name == MARKER_PADDING || type_name == MARKER_MISSING
}

/// Strips a trailing `# ...` comment. Hex tokens and expressions never
/// contain '#', so splitting on the first occurrence is safe.
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Pass one: parse the line-oriented textual form into ordered blocks,
/// deferring every `$...` expression.
pub fn parse_text(text: &str, source: &str) -> Result<Vec<Block>> {
    static BLOCK_HEADER: Lazy<Regex> = Lazy::new(|| {
        Regex::new("^\\[(?P<type>[A-Za-z_][A-Za-z0-9_]*):(?P<name>[A-Za-z_][A-Za-z0-9_]*)\\]$")
            .unwrap()
    });
    static FIELD_LINE: Lazy<Regex> = Lazy::new(|| {
        Regex::new("^(?P<name>[A-Za-z_][A-Za-z0-9_]*):\\s*(?P<value>.*)$").unwrap()
    });

    let mut blocks: Vec<Block> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let indented = raw.starts_with(' ') || raw.starts_with('\t');
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        if indented {
            // Script continuation line
            let block = blocks
                .last_mut()
                .ok_or_else(|| anyhow!("{source}:{line_no}: statement outside a block"))?;
            let field = block
                .fields
                .last_mut()
                .ok_or_else(|| anyhow!("{source}:{line_no}: statement outside a field"))?;
            let Value::Script(stmts) = &mut field.value else {
                bail!("{source}:{line_no}: unexpected indented line in field '{}'", field.name);
            };
            let mut parts = line.split_whitespace();
            let mnemonic = parts.next().unwrap().to_string();
            if script::stmt_byte_len(&mnemonic).is_none() {
                bail!("{source}:{line_no}: unknown script mnemonic '{mnemonic}'");
            }
            let args = parts
                .map(|tok| Token::parse(tok, source, line_no))
                .collect::<Result<Vec<_>>>()?;
            stmts.push(Stmt { mnemonic, args, line: line_no });
        } else if let Some(captures) = BLOCK_HEADER.captures(line) {
            blocks.push(Block {
                type_name: captures["type"].to_string(),
                name: captures["name"].to_string(),
                fields: vec![],
                line: line_no,
            });
        } else if let Some(captures) = FIELD_LINE.captures(line) {
            let block = blocks
                .last_mut()
                .ok_or_else(|| anyhow!("{source}:{line_no}: field outside a block"))?;
            let rest = captures["value"].trim();
            let value = if is_raw_block(&block.type_name) {
                let bytes = hex::decode(rest)
                    .map_err(|e| anyhow!("{source}:{line_no}: invalid raw bytes: {e}"))?;
                Value::Raw(bytes)
            } else if rest.is_empty() {
                Value::Script(vec![])
            } else if let Some(list) = rest.strip_prefix('[') {
                let list = list
                    .strip_suffix(']')
                    .ok_or_else(|| anyhow!("{source}:{line_no}: unterminated list"))?;
                let tokens = list
                    .split_whitespace()
                    .map(|tok| Token::parse(tok, source, line_no))
                    .collect::<Result<Vec<_>>>()?;
                Value::List(tokens)
            } else {
                Value::Single(Token::parse(rest, source, line_no)?)
            };
            block.fields.push(Field {
                name: captures["name"].to_string(),
                value,
                line: line_no,
            });
        } else {
            bail!("{source}:{line_no}: unparseable line '{line}'");
        }
    }
    Ok(blocks)
}

#[derive(Debug)]
pub struct EncodeOutput {
    pub blob: Vec<u8>,
    pub manifest: Manifest,
}

/// Re-assembles the textual form into a binary blob plus a refreshed
/// manifest. Pure function of (text, previous manifest, type library,
/// collaborator lookups); see module tests for the round-trip guarantee.
pub struct Encoder<'a> {
    pub library: &'a TypeLibrary,
    pub base_address: u32,
    pub endian: Endian,
    pub markers: &'a dyn MarkerLookup,
    pub database: &'a dyn ProjectDatabase,
}

impl Encoder<'_> {
    pub fn encode(
        &self,
        text: &str,
        source: &str,
        previous: Option<&Manifest>,
    ) -> Result<EncodeOutput> {
        let blocks = parse_text(text, source)?;
        if blocks.is_empty() {
            bail!("{source}: no structure blocks found");
        }

        // Address stability: a block whose name, type and ordinal position
        // match the previous manifest keeps its old offset and address, so
        // unedited regenerations are byte-identical and cross-references
        // into unedited structures stay valid. Skip markers occupy ordinal
        // slots too; the text form carries one Padding block per gap row.
        let base_address = previous
            .and_then(|m| m.entries.first().map(|e| e.address))
            .unwrap_or(self.base_address);
        let prev_rows: Vec<&ManifestEntry> = previous
            .map(|m| m.entries.iter().filter(|e| e.length > 0).collect())
            .unwrap_or_default();

        let mut sizes = Vec::with_capacity(blocks.len());
        for block in &blocks {
            sizes.push(self.block_size(block, source)?);
        }

        // The initial frontier already covers every previous entry (the End
        // sentinel included), so matched blocks never collide with fresh ones.
        let mut frontier = previous
            .map(|m| m.entries.iter().map(|e| e.end_offset()).max().unwrap_or(0))
            .unwrap_or(0);
        let mut placed: Vec<(u32, u32)> = Vec::with_capacity(blocks.len());
        for ((ordinal, block), &size) in blocks.iter().enumerate().zip(&sizes) {
            // A structure that outgrew its old slot cannot stay pinned there;
            // it relocates to the frontier like a fresh one and its old range
            // becomes padding.
            let matched = prev_rows.get(ordinal).filter(|prev| {
                prev.name == block.name
                    && prev.type_name == block.type_name
                    && size <= prev.length
            });
            match matched {
                Some(prev) => placed.push((prev.offset, prev.address)),
                None => {
                    let offset = align4(frontier);
                    placed.push((offset, base_address + offset));
                    frontier = offset + size;
                    debug!(
                        "Placing new structure '{}' @ {:#010X}",
                        block.name,
                        base_address + offset
                    );
                }
            }
        }

        let structures: Vec<ManifestEntry> = blocks
            .iter()
            .zip(&sizes)
            .zip(&placed)
            .map(|((block, &length), &(offset, address))| ManifestEntry {
                name: block.name.clone(),
                type_name: block.type_name.clone(),
                offset,
                address,
                length,
            })
            .collect();
        let end_offset = structures
            .iter()
            .map(|e| e.end_offset())
            .max()
            .unwrap_or(0)
            .max(frontier);
        let manifest = Manifest::assemble(base_address, structures, end_offset);
        manifest.validate(source)?;

        // Pass two: resolve expressions and emit bytes.
        let resolver = Resolver {
            manifest: &manifest,
            library: self.library,
            markers: self.markers,
            database: self.database,
        };
        let mut writer = ByteWriter::new(end_offset as usize, self.endian);
        for (block, &(offset, _)) in blocks.iter().zip(&placed) {
            self.emit_block(block, offset, &resolver, source, &mut writer)
                .with_context(|| format!("Failed to encode [{}:{}]", block.type_name, block.name))?;
        }

        Ok(EncodeOutput { blob: writer.into_inner(), manifest })
    }

    /// Exact byte size of one block, computable before symbol resolution.
    fn block_size(&self, block: &Block, source: &str) -> Result<u32> {
        if is_raw_block(&block.type_name) {
            let field = self.raw_field(block, source)?;
            let Value::Raw(bytes) = &field.value else {
                bail!("{source}:{}: field 'data' must be raw hex", field.line);
            };
            return Ok(bytes.len() as u32);
        }
        let sig = self.signature(block, source)?;
        let mut end = 0u32;
        for (def, field) in sig.fields.iter().zip(&block.fields) {
            let size = match (&def.kind, &field.value) {
                (FieldKind::Scalar { width }, Value::Single(_)) => width.size(),
                (FieldKind::Pointer { .. }, Value::Single(_)) => 4,
                (FieldKind::Array { width, len }, Value::List(tokens)) => {
                    self.check_fixed_len(len, tokens.len(), field, source)?;
                    width.size() * tokens.len() as u32
                }
                (FieldKind::PointerArray { len, .. }, Value::List(tokens)) => {
                    self.check_fixed_len(len, tokens.len(), field, source)?;
                    4 * tokens.len() as u32
                }
                (FieldKind::Script, Value::Script(stmts)) => {
                    let mut total = 0;
                    for stmt in stmts {
                        total += script::stmt_byte_len(&stmt.mnemonic).ok_or_else(|| {
                            anyhow!("{source}:{}: unknown mnemonic '{}'", stmt.line, stmt.mnemonic)
                        })?;
                    }
                    total
                }
                _ => bail!(
                    "{source}:{}: field '{}' does not match its declared kind",
                    field.line,
                    field.name
                ),
            };
            end = end.max(def.offset + size);
        }
        Ok(end)
    }

    fn emit_block(
        &self,
        block: &Block,
        offset: u32,
        resolver: &Resolver,
        source: &str,
        writer: &mut ByteWriter,
    ) -> Result<()> {
        if is_raw_block(&block.type_name) {
            let field = self.raw_field(block, source)?;
            let Value::Raw(bytes) = &field.value else { unreachable!() };
            writer.write_bytes(offset, bytes);
            return Ok(());
        }
        let sig = self.signature(block, source)?;
        let mut scalars = BTreeMap::new();
        for (def, field) in sig.fields.iter().zip(&block.fields) {
            let at = offset + def.offset;
            match (&def.kind, &field.value) {
                (FieldKind::Scalar { width }, Value::Single(token)) => {
                    let value = self.resolve_token(token, resolver, source, field.line)?;
                    scalars.insert(def.name.as_str(), value);
                    self.write_scalar(writer, at, value, *width);
                }
                (FieldKind::Pointer { .. }, Value::Single(token)) => {
                    let value = self.resolve_token(token, resolver, source, field.line)?;
                    writer.write_u32(at, value);
                }
                (FieldKind::Array { width, len }, Value::List(tokens)) => {
                    self.check_field_len(len, tokens.len(), &scalars, field, source)?;
                    for (i, token) in tokens.iter().enumerate() {
                        let value = self.resolve_token(token, resolver, source, field.line)?;
                        self.write_scalar(writer, at + i as u32 * width.size(), value, *width);
                    }
                }
                (FieldKind::PointerArray { len, .. }, Value::List(tokens)) => {
                    self.check_field_len(len, tokens.len(), &scalars, field, source)?;
                    for (i, token) in tokens.iter().enumerate() {
                        let value = self.resolve_token(token, resolver, source, field.line)?;
                        writer.write_u32(at + i as u32 * 4, value);
                    }
                }
                (FieldKind::Script, Value::Script(stmts)) => {
                    let mut cursor = at;
                    for stmt in stmts {
                        let args = stmt
                            .args
                            .iter()
                            .map(|t| self.resolve_token(t, resolver, source, stmt.line))
                            .collect::<Result<Vec<_>>>()?;
                        script::emit_stmt(&stmt.mnemonic, &args, writer, &mut cursor)
                            .map_err(|e| anyhow!("{source}:{}: {e}", stmt.line))?;
                    }
                }
                _ => unreachable!("validated by block_size"),
            }
        }
        Ok(())
    }

    fn resolve_token(
        &self,
        token: &Token,
        resolver: &Resolver,
        source: &str,
        line: usize,
    ) -> Result<u32> {
        match token {
            Token::Hex(value) => Ok(*value),
            Token::Expr(expr) => Ok(resolver.resolve(expr, source, line)?),
        }
    }

    fn write_scalar(&self, writer: &mut ByteWriter, offset: u32, value: u32, width: ScalarWidth) {
        match width {
            ScalarWidth::U8 => writer.write_u8(offset, value as u8),
            ScalarWidth::U16 => writer.write_u16(offset, value as u16),
            ScalarWidth::U32 => writer.write_u32(offset, value),
        }
    }

    fn signature<'b>(&'b self, block: &Block, source: &str) -> Result<&'b TypeSignature> {
        let sig = self.library.lookup(&block.type_name).ok_or_else(|| {
            anyhow!("{source}:{}: unregistered type '{}'", block.line, block.type_name)
        })?;
        if sig.fields.len() != block.fields.len() {
            bail!(
                "{source}:{}: [{}:{}] has {} field(s), signature declares {}",
                block.line,
                block.type_name,
                block.name,
                block.fields.len(),
                sig.fields.len()
            );
        }
        for (def, field) in sig.fields.iter().zip(&block.fields) {
            if def.name != field.name {
                bail!(
                    "{source}:{}: expected field '{}', found '{}'",
                    field.line,
                    def.name,
                    field.name
                );
            }
        }
        Ok(sig)
    }

    fn raw_field<'b>(&self, block: &'b Block, source: &str) -> Result<&'b Field> {
        match block.fields.as_slice() {
            [field] if field.name == "data" => Ok(field),
            _ => bail!(
                "{source}:{}: raw block [{}:{}] must have a single 'data' field",
                block.line,
                block.type_name,
                block.name
            ),
        }
    }

    fn check_fixed_len(
        &self,
        len: &ArrayLen,
        actual: usize,
        field: &Field,
        source: &str,
    ) -> Result<()> {
        if let ArrayLen::Fixed(expected) = len {
            if actual != *expected {
                bail!(
                    "{source}:{}: field '{}' expects {} element(s), got {}",
                    field.line,
                    field.name,
                    expected,
                    actual
                );
            }
        }
        Ok(())
    }

    /// A field-driven length must agree with the count scalar it names; the
    /// decoder trusts that scalar, so an inconsistent edit must not encode.
    fn check_field_len(
        &self,
        len: &ArrayLen,
        actual: usize,
        scalars: &BTreeMap<&str, u32>,
        field: &Field,
        source: &str,
    ) -> Result<()> {
        if let ArrayLen::Field(name) = len {
            let Some(&declared) = scalars.get(name.as_str()) else {
                bail!(
                    "{source}:{}: length field '{}' precedes no scalar",
                    field.line,
                    name
                );
            };
            if declared as usize != actual {
                bail!(
                    "{source}:{}: field '{}' declares {} element(s) in '{}', got {}",
                    field.line,
                    field.name,
                    declared,
                    name,
                    actual
                );
            }
        }
        Ok(())
    }
}
