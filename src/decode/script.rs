use num_enum::TryFromPrimitive;

use crate::{
    error::PatchError,
    graph::addr::{ByteWriter, Cursor},
    typelib::TypeLibrary,
};

/// Foreign address of the stock enter/exit routine, matched as a template.
pub const CALL_ENTER_EXIT: u32 = 0x8004_B300;
/// Foreign address of the foliage spawner; its preceding table operand points
/// at an event block reachable from nowhere else.
pub const CALL_SPAWN_FOLIAGE: u32 = 0x8004_C810;
/// Type assigned to the foliage template's secondary data block.
pub const FOLIAGE_EVENT_TYPE: &str = "FoliageEvent";

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    End = 0x00,
    Ret = 0x01,
    Push = 0x10,
    PushVar = 0x11,
    Call = 0x20,
    Table = 0x21,
    Jump = 0x30,
    Marker = 0x31,
    Wait = 0x32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Instruction {
    End,
    Ret,
    Push(u16),
    PushVar(u8),
    Call { target: u32, argc: u8 },
    Table(u32),
    Jump(u16),
    Marker(u16),
    Wait(u16),
}

impl Instruction {
    pub fn byte_len(&self) -> u32 {
        match self {
            Instruction::End | Instruction::Ret => 1,
            Instruction::PushVar(_) => 2,
            Instruction::Push(_) | Instruction::Jump(_) | Instruction::Marker(_)
            | Instruction::Wait(_) => 3,
            Instruction::Table(_) => 5,
            Instruction::Call { .. } => 6,
        }
    }

    pub fn is_terminator(&self) -> bool { matches!(self, Instruction::End | Instruction::Ret) }

    pub fn emit(&self, w: &mut ByteWriter, offset: &mut u32) {
        match *self {
            Instruction::End => {
                w.write_u8(*offset, Opcode::End as u8);
            }
            Instruction::Ret => {
                w.write_u8(*offset, Opcode::Ret as u8);
            }
            Instruction::Push(imm) => {
                w.write_u8(*offset, Opcode::Push as u8);
                w.write_u16(*offset + 1, imm);
            }
            Instruction::PushVar(idx) => {
                w.write_u8(*offset, Opcode::PushVar as u8);
                w.write_u8(*offset + 1, idx);
            }
            Instruction::Call { target, argc } => {
                w.write_u8(*offset, Opcode::Call as u8);
                w.write_u32(*offset + 1, target);
                w.write_u8(*offset + 5, argc);
            }
            Instruction::Table(addr) => {
                w.write_u8(*offset, Opcode::Table as u8);
                w.write_u32(*offset + 1, addr);
            }
            Instruction::Jump(off) => {
                w.write_u8(*offset, Opcode::Jump as u8);
                w.write_u16(*offset + 1, off);
            }
            Instruction::Marker(id) => {
                w.write_u8(*offset, Opcode::Marker as u8);
                w.write_u16(*offset + 1, id);
            }
            Instruction::Wait(frames) => {
                w.write_u8(*offset, Opcode::Wait as u8);
                w.write_u16(*offset + 1, frames);
            }
        }
        *offset += self.byte_len();
    }
}

/// One printed script line: either a plain instruction or a recognized
/// multi-instruction template collapsed to a named idiom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptItem {
    Ins(Instruction),
    /// `push enter; push exit; call EnterExit(2)`
    EnterExit { enter: u16, exit: u16 },
    /// `table addr; call SpawnFoliage(0)`; `target` is a typed child.
    Foliage { target: u32 },
}

impl ScriptItem {
    pub fn expand(&self) -> Vec<Instruction> {
        match *self {
            ScriptItem::Ins(ins) => vec![ins],
            ScriptItem::EnterExit { enter, exit } => vec![
                Instruction::Push(enter),
                Instruction::Push(exit),
                Instruction::Call { target: CALL_ENTER_EXIT, argc: 2 },
            ],
            ScriptItem::Foliage { target } => vec![
                Instruction::Table(target),
                Instruction::Call { target: CALL_SPAWN_FOLIAGE, argc: 0 },
            ],
        }
    }

    pub fn byte_len(&self) -> u32 { self.expand().iter().map(Instruction::byte_len).sum() }
}

#[derive(Debug, Default)]
pub struct ScriptScan {
    pub items: Vec<ScriptItem>,
    pub byte_len: u32,
    /// Secondary data blocks implied by templates: (address, type name).
    pub children: Vec<(u32, String)>,
    /// Marker ids referenced by the stream, surfaced as annotations.
    pub markers: Vec<u16>,
}

fn malformed(cursor: &Cursor, reason: &str) -> PatchError {
    PatchError::MalformedScript { address: cursor.address(), reason: reason.to_string() }
}

/// Linearizes one variable-length instruction stream starting at the cursor,
/// stopping at the first control-flow terminator. Every embedded call target
/// is checked against the library so that an arity mismatch surfaces here,
/// during decode, rather than corrupting a later encode.
pub fn scan_script(cursor: &mut Cursor, library: &TypeLibrary) -> Result<ScriptScan, PatchError> {
    let start = cursor.offset();
    let mut instructions = Vec::new();
    loop {
        let at = *cursor;
        let byte = cursor.read_u8().map_err(|_| malformed(&at, "read past end of blob"))?;
        let opcode = Opcode::try_from(byte)
            .map_err(|_| malformed(&at, &format!("unknown opcode {byte:#04X}")))?;
        let ins = match opcode {
            Opcode::End => Instruction::End,
            Opcode::Ret => Instruction::Ret,
            Opcode::Push => Instruction::Push(read_u16(cursor, &at)?),
            Opcode::PushVar => {
                Instruction::PushVar(cursor.read_u8().map_err(|_| malformed(&at, "truncated operand"))?)
            }
            Opcode::Call => {
                let target = read_u32(cursor, &at)?;
                let argc = cursor.read_u8().map_err(|_| malformed(&at, "truncated operand"))?;
                if let Some(sig) = library.resolve_call(target) {
                    sig.matching_params(argc as usize)?;
                }
                Instruction::Call { target, argc }
            }
            Opcode::Table => Instruction::Table(read_u32(cursor, &at)?),
            Opcode::Jump => Instruction::Jump(read_u16(cursor, &at)?),
            Opcode::Marker => Instruction::Marker(read_u16(cursor, &at)?),
            Opcode::Wait => Instruction::Wait(read_u16(cursor, &at)?),
        };
        let done = ins.is_terminator();
        instructions.push(ins);
        if done {
            break;
        }
    }
    let mut scan = collapse_templates(&instructions);
    scan.byte_len = cursor.offset() - start;
    Ok(scan)
}

fn read_u16(cursor: &mut Cursor, at: &Cursor) -> Result<u16, PatchError> {
    cursor.read_u16().map_err(|_| malformed(at, "truncated operand"))
}

fn read_u32(cursor: &mut Cursor, at: &Cursor) -> Result<u32, PatchError> {
    cursor.read_u32().map_err(|_| malformed(at, "truncated operand"))
}

/// Greedy single pass over the linearized stream, longest template first.
/// Wildcard operands (the pushed values, the table address) are preserved in
/// the collapsed idiom so expansion is exact.
fn collapse_templates(instructions: &[Instruction]) -> ScriptScan {
    let mut scan = ScriptScan::default();
    let mut i = 0;
    while i < instructions.len() {
        match &instructions[i..] {
            [Instruction::Push(enter), Instruction::Push(exit), Instruction::Call { target, argc: 2 }, ..]
                if *target == CALL_ENTER_EXIT =>
            {
                scan.items.push(ScriptItem::EnterExit { enter: *enter, exit: *exit });
                i += 3;
            }
            [Instruction::Table(target), Instruction::Call { target: call, argc: 0 }, ..]
                if *call == CALL_SPAWN_FOLIAGE =>
            {
                scan.items.push(ScriptItem::Foliage { target: *target });
                scan.children.push((*target, FOLIAGE_EVENT_TYPE.to_string()));
                i += 2;
            }
            _ => {
                if let Instruction::Marker(id) = instructions[i] {
                    scan.markers.push(id);
                }
                scan.items.push(ScriptItem::Ins(instructions[i]));
                i += 1;
            }
        }
    }
    scan
}

/// Byte length of one parsed script statement, by mnemonic. Known before
/// symbol resolution, so the encoder can lay out structures in pass one.
pub fn stmt_byte_len(mnemonic: &str) -> Option<u32> {
    Some(match mnemonic {
        "end" | "ret" => 1,
        "pushvar" => 2,
        "push" | "jump" | "marker" | "wait" => 3,
        "table" => 5,
        "call" => 6,
        "enterexit" => 12,
        "foliage" => 11,
        _ => return None,
    })
}

/// Expected operand count per mnemonic (after symbol resolution).
pub fn stmt_operand_count(mnemonic: &str) -> Option<usize> {
    Some(match mnemonic {
        "end" | "ret" => 0,
        "push" | "pushvar" | "table" | "jump" | "marker" | "wait" | "foliage" => 1,
        "call" | "enterexit" => 2,
        _ => return None,
    })
}

/// Assembles one statement from resolved operands. The inverse of the
/// printed form; templates expand to their exact instruction sequence.
pub fn emit_stmt(
    mnemonic: &str,
    args: &[u32],
    w: &mut ByteWriter,
    offset: &mut u32,
) -> Result<(), String> {
    let expected = stmt_operand_count(mnemonic)
        .ok_or_else(|| format!("unknown script mnemonic '{mnemonic}'"))?;
    if args.len() != expected {
        return Err(format!(
            "'{mnemonic}' expects {expected} operand(s), got {}",
            args.len()
        ));
    }
    let items: Vec<Instruction> = match mnemonic {
        "end" => vec![Instruction::End],
        "ret" => vec![Instruction::Ret],
        "push" => vec![Instruction::Push(args[0] as u16)],
        "pushvar" => vec![Instruction::PushVar(args[0] as u8)],
        "call" => vec![Instruction::Call { target: args[0], argc: args[1] as u8 }],
        "table" => vec![Instruction::Table(args[0])],
        "jump" => vec![Instruction::Jump(args[0] as u16)],
        "marker" => vec![Instruction::Marker(args[0] as u16)],
        "wait" => vec![Instruction::Wait(args[0] as u16)],
        "enterexit" => {
            ScriptItem::EnterExit { enter: args[0] as u16, exit: args[1] as u16 }.expand()
        }
        "foliage" => ScriptItem::Foliage { target: args[0] }.expand(),
        _ => unreachable!(),
    };
    for ins in items {
        ins.emit(w, offset);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::addr::{AddressSpace, Endian};

    fn scan(bytes: &[u8]) -> Result<ScriptScan, PatchError> {
        let library = TypeLibrary::builtin().unwrap();
        let space = AddressSpace::new(0x8001_0000, bytes.len() as u32);
        let mut cursor = Cursor::new(bytes, space, Endian::Little);
        scan_script(&mut cursor, &library)
    }

    #[test]
    fn test_linearize_until_terminator() {
        // push 1; wait 30; end
        let scan = scan(&[0x10, 0x01, 0x00, 0x32, 0x1E, 0x00, 0x00, 0xFF]).unwrap();
        assert_eq!(scan.items.len(), 3);
        assert_eq!(scan.byte_len, 7);
        assert_eq!(scan.items[2], ScriptItem::Ins(Instruction::End));
    }

    #[test]
    fn test_enter_exit_template_collapses() {
        // push 3; push 5; call EnterExit argc=2; ret
        let mut bytes = vec![0x10, 0x03, 0x00, 0x10, 0x05, 0x00, 0x20];
        bytes.extend_from_slice(&CALL_ENTER_EXIT.to_le_bytes());
        bytes.extend_from_slice(&[0x02, 0x01]);
        let scan = scan(&bytes).unwrap();
        assert_eq!(scan.items[0], ScriptItem::EnterExit { enter: 3, exit: 5 });
        assert_eq!(scan.items[1], ScriptItem::Ins(Instruction::Ret));
    }

    #[test]
    fn test_foliage_template_enqueues_child() {
        // table 0x80010020; call SpawnFoliage argc=0; end
        let mut bytes = vec![0x21];
        bytes.extend_from_slice(&0x8001_0020u32.to_le_bytes());
        bytes.push(0x20);
        bytes.extend_from_slice(&CALL_SPAWN_FOLIAGE.to_le_bytes());
        bytes.extend_from_slice(&[0x00, 0x00]);
        let scan = scan(&bytes).unwrap();
        assert_eq!(scan.items[0], ScriptItem::Foliage { target: 0x8001_0020 });
        assert_eq!(scan.children, vec![(0x8001_0020, FOLIAGE_EVENT_TYPE.to_string())]);
    }

    #[test]
    fn test_runaway_script_is_malformed() {
        // push with no terminator, running off the end
        let err = scan(&[0x10, 0x01, 0x00]).unwrap_err();
        assert!(matches!(err, PatchError::MalformedScript { .. }));
    }

    #[test]
    fn test_unknown_opcode_is_malformed() {
        let err = scan(&[0xEE, 0x00]).unwrap_err();
        assert!(matches!(err, PatchError::MalformedScript { .. }));
    }

    #[test]
    fn test_emit_round_trips_templates() {
        let mut w = ByteWriter::new(0, Endian::Little);
        let mut offset = 0u32;
        emit_stmt("enterexit", &[3, 5], &mut w, &mut offset).unwrap();
        emit_stmt("end", &[], &mut w, &mut offset).unwrap();
        let bytes = w.into_inner();
        assert_eq!(offset, 13);
        let rescan = scan(&bytes).unwrap();
        assert_eq!(rescan.items[0], ScriptItem::EnterExit { enter: 3, exit: 5 });
    }
}
