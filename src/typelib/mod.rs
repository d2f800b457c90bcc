use std::{collections::BTreeMap, io::Read};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{error::PatchError, util::hex_u32};

/// Signatures are scoped so that specialized subsystems (world map vs battle)
/// can register types with the same name without colliding.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryScope {
    #[default]
    General,
    World,
    Battle,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarWidth {
    U8,
    U16,
    U32,
}

impl ScalarWidth {
    pub fn size(self) -> u32 {
        match self {
            ScalarWidth::U8 => 1,
            ScalarWidth::U16 => 2,
            ScalarWidth::U32 => 4,
        }
    }

    pub fn hex_digits(self) -> usize { self.size() as usize * 2 }
}

/// Length of an array field: fixed at registration time, or taken from the
/// runtime value of a named sibling scalar field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayLen {
    Fixed(usize),
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Scalar { width: ScalarWidth },
    /// 32-bit address of another registered type.
    Pointer { target: String },
    Array { width: ScalarWidth, len: ArrayLen },
    /// Table of 32-bit addresses, all pointing at the same registered type.
    /// Elements discovered through one of these are named `<Type>_<index>`.
    PointerArray { target: String, len: ArrayLen },
    /// Embedded bytecode, decoded by the script walker.
    Script,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(with = "hex_u32")]
    pub offset: u32,
    // Nested-map YAML form (`kind: { scalar: { width: u16 } }`) rather than
    // the `!tag` form serde_yaml defaults to for enums.
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSignature {
    pub name: String,
    #[serde(default)]
    pub scope: LibraryScope,
    pub fields: Vec<FieldDef>,
}

/// Semantic category of one foreign-call parameter, used for printing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    Scalar,
    /// Named enumerated constant, resolvable through the project database.
    Enum { set: String },
    /// Address of a static structure; `len_param` optionally names the
    /// parameter index holding the element count.
    StructPtr {
        target: String,
        #[serde(default)]
        len_param: Option<usize>,
    },
    /// Variable-length or unknown trailing argument list.
    VarArgs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDef {
    pub name: String,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub kind: ParamKind,
}

/// A known engine function at a fixed foreign address. A signature may carry
/// several arg-count overloads; selection is by arity alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignature {
    pub name: String,
    #[serde(with = "hex_u32")]
    pub address: u32,
    #[serde(default)]
    pub scope: LibraryScope,
    pub overloads: Vec<Vec<ParamDef>>,
}

impl CallSignature {
    /// Selects the unique overload whose arity matches `argc`. A varargs
    /// overload matches any count at or above its fixed parameter count.
    /// Zero or multiple matches signal [PatchError::AmbiguousSignature];
    /// observed source behavior is to throw here, preserved as-is.
    pub fn matching_params(&self, argc: usize) -> Result<&[ParamDef], PatchError> {
        let mut found: Option<&[ParamDef]> = None;
        for overload in &self.overloads {
            let varargs = overload.iter().any(|p| matches!(p.kind, ParamKind::VarArgs));
            let fixed = overload.iter().filter(|p| !matches!(p.kind, ParamKind::VarArgs)).count();
            let matches = if varargs { argc >= fixed } else { argc == overload.len() };
            if matches {
                if found.is_some() {
                    return Err(PatchError::AmbiguousSignature {
                        name: self.name.clone(),
                        argc,
                    });
                }
                found = Some(overload.as_slice());
            }
        }
        found.ok_or_else(|| PatchError::AmbiguousSignature { name: self.name.clone(), argc })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    types: Vec<TypeSignature>,
    #[serde(default)]
    calls: Vec<CallSignature>,
}

/// Read-only registry of structure and foreign-function signatures. Loaded
/// once at startup from a YAML description and passed by reference into the
/// decode/encode/patch passes, never an ambient singleton.
#[derive(Debug, Default)]
pub struct TypeLibrary {
    types: IndexMap<String, TypeSignature>,
    calls: BTreeMap<u32, CallSignature>,
    call_names: BTreeMap<String, u32>,
}

impl TypeLibrary {
    pub fn load<R>(mut reader: R) -> Result<Self>
    where R: Read {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: LibraryFile = serde_yaml::from_str(text).context("Failed to parse type library")?;
        let mut library = TypeLibrary::default();
        for sig in file.types {
            if library.types.insert(sig.name.clone(), sig.clone()).is_some() {
                bail!("Duplicate type signature '{}'", sig.name);
            }
        }
        for call in file.calls {
            if library.call_names.insert(call.name.clone(), call.address).is_some() {
                bail!("Duplicate call signature '{}'", call.name);
            }
            if library.calls.insert(call.address, call.clone()).is_some() {
                bail!("Duplicate call signature @ {:#010X}", call.address);
            }
        }
        Ok(library)
    }

    /// The library shipped with the toolkit, covering the structures the
    /// shipped game builds are known to use.
    pub fn builtin() -> Result<Self> { Self::from_yaml(include_str!("../../assets/typelib.yml")) }

    pub fn lookup(&self, name: &str) -> Option<&TypeSignature> { self.types.get(name) }

    /// Foreign function lookup by absolute engine address.
    pub fn resolve_call(&self, address: u32) -> Option<&CallSignature> {
        self.calls.get(&address)
    }

    pub fn call_by_name(&self, name: &str) -> Option<&CallSignature> {
        self.call_names.get(name).and_then(|addr| self.calls.get(addr))
    }

    pub fn types_in_scope(
        &self,
        scope: LibraryScope,
    ) -> impl Iterator<Item = &TypeSignature> + '_ {
        self.types
            .values()
            .filter(move |sig| sig.scope == LibraryScope::General || sig.scope == scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_library() -> TypeLibrary {
        TypeLibrary::from_yaml(
            r#"
types:
  - name: Marker
    scope: world
    fields:
      - { name: kind, offset: 0x0, kind: { scalar: { width: u16 } } }
      - { name: pos, offset: 0x2, kind: { array: { width: u16, len: { fixed: 3 } } } }
calls:
  - name: SetWeather
    address: 0x8004A000
    overloads:
      - [ { name: mode } ]
      - [ { name: mode }, { name: duration } ]
  - name: PlayEffect
    address: 0x8004A010
    overloads:
      - [ { name: id } ]
      - [ { name: id2 } ]
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_and_resolve_call() {
        let library = test_library();
        assert!(library.lookup("Marker").is_some());
        assert!(library.lookup("DoesNotExist").is_none());
        assert_eq!(library.resolve_call(0x8004_A000).unwrap().name, "SetWeather");
        assert!(library.resolve_call(0x8004_A004).is_none());
    }

    #[test]
    fn test_overload_selection_by_arity() {
        let library = test_library();
        let sig = library.call_by_name("SetWeather").unwrap();
        assert_eq!(sig.matching_params(1).unwrap().len(), 1);
        assert_eq!(sig.matching_params(2).unwrap()[1].name, "duration");
        assert!(matches!(
            sig.matching_params(3),
            Err(PatchError::AmbiguousSignature { argc: 3, .. })
        ));
    }

    #[test]
    fn test_duplicate_arity_is_ambiguous() {
        let library = test_library();
        let sig = library.call_by_name("PlayEffect").unwrap();
        assert!(matches!(
            sig.matching_params(1),
            Err(PatchError::AmbiguousSignature { argc: 1, .. })
        ));
    }

    #[test]
    fn test_builtin_library_parses() {
        let library = TypeLibrary::builtin().unwrap();
        assert!(library.lookup("Header").is_some());
        assert!(library.types_in_scope(LibraryScope::World).count() > 0);

        // The nested-map field kinds must come through as typed variants.
        let marker = library.lookup("Marker").unwrap();
        assert_eq!(marker.fields[1].kind, FieldKind::Array {
            width: ScalarWidth::U16,
            len: ArrayLen::Fixed(3),
        });
    }

    #[test]
    fn test_builtin_varargs_overload_matches_any_trailing_count() {
        let library = TypeLibrary::builtin().unwrap();
        let sig = library.call_by_name("MovePath").unwrap();
        let params = sig.matching_params(2).unwrap();
        assert!(matches!(params[2].kind, ParamKind::VarArgs));
        assert!(sig.matching_params(7).is_ok());
        assert!(matches!(
            sig.matching_params(1),
            Err(PatchError::AmbiguousSignature { argc: 1, .. })
        ));
    }
}
