//! Byte-code disassembler for the tape's embedded script VM.
//!
//! Script payloads mix opcodes (high bit set) with literal data bytes (high
//! bit clear). Opcodes are decoded through a fixed table; runs of data bytes
//! coalesce into a single node. Most of what is known about the VM comes
//! from reverse engineering, so many opcodes are unnamed and render as
//! `OP_xx`.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Inline operand policy for one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OperandSpec {
    /// Exactly this many operand bytes follow the opcode.
    Inline(usize),
    /// Operand bytes follow until a `$00` terminator (consumed, excluded).
    NulTerminated,
}

struct OpDef {
    name: &'static str,
    /// Reverse-engineering notes, kept with the table.
    #[allow(dead_code)]
    notes: &'static str,
    operands: OperandSpec,
    /// "Parameter control" byte: how the VM routes stack arguments/results.
    #[allow(dead_code)]
    ctrl: u8,
}

const fn op(name: &'static str, notes: &'static str, operands: OperandSpec, ctrl: u8) -> OpDef {
    OpDef {
        name,
        notes,
        operands,
        ctrl,
    }
}

use OperandSpec::{Inline, NulTerminated};

/// Known VM opcodes. Immutable; lookups only.
static VM_OPCODES: &[(u8, OpDef)] = &[
    (0x83, op("sync_EE", "Some sort of synchronization around $EE?", Inline(0), 0x00)),
    (0x84, op("absolute_jump", "", Inline(2), 0x00)),
    (0x85, op(
        "absolute_call",
        "Pushes the return address, then jumps to the inline operand.",
        Inline(2),
        0x00,
    )),
    (0x89, op("", "", Inline(0), 0x17)),
    (0x95, op("", "", Inline(0), 0x02)),
    (0x9D, op("", "", Inline(0), 0x04)),
    (0x9E, op("", "", Inline(0), 0x04)),
    (0xA1, op("", "", Inline(0), 0x02)),
    (0xA3, op("", "Looks like some sort of scene control.", Inline(0), 0x02)),
    (0xAE, op(
        "check_sign",
        "-1 if the argument is negative, 0 if zero, 1 if positive.",
        Inline(0),
        0x42,
    )),
    (0xB8, op("push_word", "Push the inline operand as a result.", Inline(2), 0x00)),
    (0xBB, op(
        "copy_to_stack",
        "Copy the nil-terminated inline operand to the stack.",
        NulTerminated,
        0x00,
    )),
    (0xBD, op(
        "pop_to_address",
        "Store the stack parameter at the word address given inline.",
        Inline(2),
        0x00,
    )),
    (0xC0, op("jump_zero", "Conditional absolute jump.", Inline(2), 0x02)),
    (0xC4, op("logical_or", "1 if either parameter is non-zero.", Inline(0), 0xC4)),
    (0xC6, op("compare_equal", "1 if both parameters are equal.", Inline(0), 0xC4)),
    (0xCF, op("negate", "Unary negate the argument.", Inline(0), 0xC4)),
    (0xD4, op("", "", Inline(0), 0x07)),
    (0xD5, op("", "", Inline(0), 0x02)),
    (0xDF, op("", "", Inline(0), 0x07)),
    (0xE3, op("", "", Inline(0), 0x42)),
    (0xE5, op("", "", Inline(0), 0x02)),
    (0xE6, op("", "", Inline(0), 0x02)),
    (0xE7, op("", "", Inline(0), 0x0F)),
    (0xE8, op("", "", Inline(0), 0x02)),
    (0xF2, op("halt_F2", "Jumps to itself in a tight loop.", Inline(0), 0x00)),
    (0xF9, op("", "", Inline(0), 0x40)),
    (0xFA, op("", "", Inline(0), 0x40)),
    (0xFE, op("", "", Inline(2), 0x09)),
];

fn op_def(code: u8) -> Option<&'static OpDef> {
    VM_OPCODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, def)| def)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// No script data to disassemble.
    Empty,
    /// An opcode byte with no table entry.
    UnknownOpCode { offset: usize, code: u8 },
    /// Input ended inside an opcode's inline operands.
    TruncatedOperands { offset: usize, code: u8 },
    /// Input ended before a nil-terminated operand's terminator.
    UnterminatedOperands { offset: usize, code: u8 },
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "no script data to disassemble"),
            Self::UnknownOpCode { offset, code } => {
                write!(f, "unknown OP code at offset ${offset:04X}: ${code:02X}")
            }
            Self::TruncatedOperands { offset, code } => write!(
                f,
                "script ends inside the operands of ${code:02X} at offset ${offset:04X}"
            ),
            Self::UnterminatedOperands { offset, code } => write!(
                f,
                "missing terminator for the operands of ${code:02X} at offset ${offset:04X}"
            ),
        }
    }
}

impl std::error::Error for ScriptError {}

/// One disassembled element: an opcode with its operands, or a maximal run
/// of literal data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptNode {
    OpCode {
        code: u8,
        /// Table name; empty for unnamed opcodes.
        name: &'static str,
        operands: Vec<u8>,
    },
    Data(Vec<u8>),
}

impl ScriptNode {
    /// One line of listing text.
    #[must_use]
    pub fn asm(&self) -> String {
        match self {
            Self::OpCode {
                code,
                name,
                operands,
            } => {
                let args: Vec<String> = operands.iter().map(|b| format!("${b:02X}")).collect();
                let arg_str = if args.is_empty() {
                    String::new()
                } else {
                    format!(" {}", args.join(", "))
                };
                if name.is_empty() {
                    format!("OP_{code:02X}{arg_str}")
                } else {
                    format!("{name}{arg_str}")
                }
            }
            Self::Data(data) => {
                let vals: Vec<String> = data.iter().map(|b| format!("${b:02X}")).collect();
                format!("data {}", vals.join(", "))
            }
        }
    }
}

/// A disassembled script region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    nodes: Vec<ScriptNode>,
}

impl Script {
    #[must_use]
    pub fn nodes(&self) -> &[ScriptNode] {
        &self.nodes
    }

    /// The full listing, one node per line, with a trailing newline.
    #[must_use]
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            out.push_str(&node.asm());
            out.push('\n');
        }
        out
    }

    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(self.listing().as_bytes())
    }
}

/// Disassembles a reassembled script region.
pub fn disassemble(data: &[u8]) -> Result<Script, ScriptError> {
    if data.is_empty() {
        return Err(ScriptError::Empty);
    }

    let mut nodes: Vec<ScriptNode> = Vec::new();
    let mut idx = 0;
    while idx < data.len() {
        let byte = data[idx];
        if byte & 0x80 != 0 {
            let def = op_def(byte).ok_or(ScriptError::UnknownOpCode {
                offset: idx,
                code: byte,
            })?;
            let operand_start = idx + 1;
            let operands = match def.operands {
                Inline(n) => {
                    if operand_start + n > data.len() {
                        return Err(ScriptError::TruncatedOperands {
                            offset: idx,
                            code: byte,
                        });
                    }
                    idx = operand_start + n;
                    data[operand_start..operand_start + n].to_vec()
                }
                NulTerminated => {
                    let end = data[operand_start..]
                        .iter()
                        .position(|&b| b == 0x00)
                        .map(|p| operand_start + p)
                        .ok_or(ScriptError::UnterminatedOperands {
                            offset: idx,
                            code: byte,
                        })?;
                    idx = end + 1;
                    data[operand_start..end].to_vec()
                }
            };
            nodes.push(ScriptNode::OpCode {
                code: byte,
                name: def.name,
                operands,
            });
        } else {
            // Literal data; consecutive bytes coalesce into one node.
            if let Some(ScriptNode::Data(run)) = nodes.last_mut() {
                run.push(byte);
            } else {
                nodes.push(ScriptNode::Data(vec![byte]));
            }
            idx += 1;
        }
    }

    Ok(Script { nodes })
}
