use std::{collections::BTreeMap, fmt, io::BufRead};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{error::PatchError, typelib::TypeLibrary, util::manifest::Manifest, util::parse_hex};

/// Resolve a symbolic marker name to 3-D coordinates. External collaborators
/// (the map editors) expose exactly this lookup and nothing else.
pub trait MarkerLookup {
    fn marker_position(&self, name: &str) -> Option<[i32; 3]>;
}

/// Resolve enumerated constant names registered at the project level.
pub trait ProjectDatabase {
    fn enum_value(&self, name: &str) -> Option<u32>;
}

/// Stand-in when no collaborator is attached; every lookup misses.
pub struct NoLookup;

impl MarkerLookup for NoLookup {
    fn marker_position(&self, _name: &str) -> Option<[i32; 3]> { None }
}

impl ProjectDatabase for NoLookup {
    fn enum_value(&self, _name: &str) -> Option<u32> { None }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// A deferred `$...` token from the textual form, resolved in pass two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `$Type:Name`: address of a named structure. `$Fn:Name` resolves
    /// against the foreign-call registry instead.
    Symbol { type_name: String, name: String },
    /// `$Enum:NAME`: project-level enumerated constant.
    Enum { name: String },
    /// `$Marker.x:Name` (or `.y`/`.z`): one path coordinate of a marker.
    MarkerAxis { axis: Axis, name: String },
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Symbol { type_name, name } => write!(f, "${type_name}:{name}"),
            Expr::Enum { name } => write!(f, "$Enum:{name}"),
            Expr::MarkerAxis { axis, name } => {
                let axis = match axis {
                    Axis::X => "x",
                    Axis::Y => "y",
                    Axis::Z => "z",
                };
                write!(f, "$Marker.{axis}:{name}")
            }
        }
    }
}

impl Expr {
    /// Parses one `$...` token; `None` when the token is not symbolic at all.
    pub fn parse(token: &str) -> Option<Expr> {
        let rest = token.strip_prefix('$')?;
        let (kind, name) = rest.split_once(':')?;
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(match kind {
            "Enum" => Expr::Enum { name: name.to_string() },
            "Marker.x" => Expr::MarkerAxis { axis: Axis::X, name: name.to_string() },
            "Marker.y" => Expr::MarkerAxis { axis: Axis::Y, name: name.to_string() },
            "Marker.z" => Expr::MarkerAxis { axis: Axis::Z, name: name.to_string() },
            _ => Expr::Symbol { type_name: kind.to_string(), name: name.to_string() },
        })
    }
}

/// Pass-two resolution context: the working manifest plus the narrow
/// read-only collaborator interfaces.
pub struct Resolver<'a> {
    pub manifest: &'a Manifest,
    pub library: &'a TypeLibrary,
    pub markers: &'a dyn MarkerLookup,
    pub database: &'a dyn ProjectDatabase,
}

impl Resolver<'_> {
    /// Resolves one expression to a 32-bit value. There is no silent
    /// default: a miss is [PatchError::UnresolvedSymbol] naming the line.
    pub fn resolve(&self, expr: &Expr, file: &str, line: usize) -> Result<u32, PatchError> {
        let unresolved = || PatchError::UnresolvedSymbol {
            file: file.to_string(),
            line,
            symbol: expr.to_string(),
        };
        match expr {
            Expr::Symbol { type_name, name } if type_name == "Fn" => {
                self.library.call_by_name(name).map(|sig| sig.address).ok_or_else(unresolved)
            }
            Expr::Symbol { type_name, name } => {
                let entry = self.manifest.by_name(name).ok_or_else(unresolved)?;
                if entry.type_name != *type_name {
                    return Err(unresolved());
                }
                Ok(entry.address)
            }
            Expr::Enum { name } => self.database.enum_value(name).ok_or_else(unresolved),
            Expr::MarkerAxis { axis, name } => {
                let pos = self.markers.marker_position(name).ok_or_else(unresolved)?;
                Ok(match axis {
                    Axis::X => pos[0] as u32,
                    Axis::Y => pos[1] as u32,
                    Axis::Z => pos[2] as u32,
                })
            }
        }
    }
}

/// File-backed marker table: one `Name = x y z` per line.
#[derive(Debug, Default)]
pub struct MarkerTable {
    positions: BTreeMap<String, [i32; 3]>,
}

impl MarkerTable {
    pub fn parse<R>(reader: R, source: &str) -> Result<Self>
    where R: BufRead {
        static MARKER_LINE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                "^\\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*)\\s*=\\s*(?P<x>-?[0-9]+)\\s+(?P<y>-?[0-9]+)\\s+(?P<z>-?[0-9]+)\\s*$",
            )
            .unwrap()
        });
        let mut table = MarkerTable::default();
        for (idx, result) in reader.lines().enumerate() {
            let line = result?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(captures) = MARKER_LINE.captures(trimmed) else {
                bail!("{}:{}: invalid marker line '{}'", source, idx + 1, trimmed);
            };
            table.positions.insert(captures["name"].to_string(), [
                captures["x"].parse()?,
                captures["y"].parse()?,
                captures["z"].parse()?,
            ]);
        }
        Ok(table)
    }
}

impl MarkerLookup for MarkerTable {
    fn marker_position(&self, name: &str) -> Option<[i32; 3]> {
        self.positions.get(name).copied()
    }
}

/// File-backed enum table: one `NAME = value` per line, hex or decimal.
#[derive(Debug, Default)]
pub struct EnumTable {
    values: BTreeMap<String, u32>,
}

impl EnumTable {
    pub fn parse<R>(reader: R, source: &str) -> Result<Self>
    where R: BufRead {
        static ENUM_LINE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(
                "^\\s*(?P<name>[A-Za-z_][A-Za-z0-9_]*)\\s*=\\s*(?P<value>0[xX][0-9A-Fa-f]+|[0-9]+)\\s*$",
            )
            .unwrap()
        });
        let mut table = EnumTable::default();
        for (idx, result) in reader.lines().enumerate() {
            let line = result?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some(captures) = ENUM_LINE.captures(trimmed) else {
                bail!("{}:{}: invalid enum line '{}'", source, idx + 1, trimmed);
            };
            table.values.insert(captures["name"].to_string(), parse_hex(&captures["value"])?);
        }
        Ok(table)
    }
}

impl ProjectDatabase for EnumTable {
    fn enum_value(&self, name: &str) -> Option<u32> { self.values.get(name).copied() }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_parse_expr_forms() {
        assert_eq!(
            Expr::parse("$Model:Tree_01"),
            Some(Expr::Symbol { type_name: "Model".into(), name: "Tree_01".into() })
        );
        assert_eq!(Expr::parse("$Enum:WEATHER_RAIN"), Some(Expr::Enum { name: "WEATHER_RAIN".into() }));
        assert_eq!(
            Expr::parse("$Marker.y:Spawn_1"),
            Some(Expr::MarkerAxis { axis: Axis::Y, name: "Spawn_1".into() })
        );
        assert_eq!(Expr::parse("00001234"), None);
        assert_eq!(Expr::parse("$:x"), None);
    }

    #[test]
    fn test_marker_and_enum_tables() {
        let markers =
            MarkerTable::parse(Cursor::new("Spawn_1 = 10 -20 30\n"), "markers.txt").unwrap();
        assert_eq!(markers.marker_position("Spawn_1"), Some([10, -20, 30]));
        assert_eq!(markers.marker_position("Missing"), None);

        let enums =
            EnumTable::parse(Cursor::new("WEATHER_RAIN = 0x2\nMAX_LIGHTS = 8\n"), "enums.txt")
                .unwrap();
        assert_eq!(enums.enum_value("WEATHER_RAIN"), Some(2));
        assert_eq!(enums.enum_value("MAX_LIGHTS"), Some(8));
    }
}
