use crate::metadata::token::Token;
use std::fmt::{self, UpperHex};

/// Encoding of the operand that follows an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit operand
    Int8,
    /// Unsigned 8-bit operand
    UInt8,
    /// Signed 16-bit operand
    Int16,
    /// Unsigned 16-bit operand
    UInt16,
    /// Signed 32-bit operand
    Int32,
    /// Unsigned 32-bit operand
    UInt32,
    /// Signed 64-bit operand
    Int64,
    /// Unsigned 64-bit operand
    UInt64,
    /// 32-bit floating point operand
    Float32,
    /// 64-bit floating point operand
    Float64,
    /// Metadata token
    Token,
    /// Jump table: count followed by `count` signed 32-bit offsets
    Switch,
}

impl OperandType {
    /// Returns the operand size in bytes, `None` for the variable sized switch table.
    #[must_use]
    pub const fn size(&self) -> Option<usize> {
        match self {
            OperandType::None => Some(0),
            OperandType::Int8 | OperandType::UInt8 => Some(1),
            OperandType::Int16 | OperandType::UInt16 => Some(2),
            OperandType::Int32
            | OperandType::UInt32
            | OperandType::Float32
            | OperandType::Token => Some(4),
            OperandType::Int64 | OperandType::UInt64 | OperandType::Float64 => Some(8),
            OperandType::Switch => None,
        }
    }
}

/// An immediate operand value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Immediate {
    /// Signed 8-bit value
    Int8(i8),
    /// Unsigned 8-bit value
    UInt8(u8),
    /// Signed 16-bit value
    Int16(i16),
    /// Unsigned 16-bit value
    UInt16(u16),
    /// Signed 32-bit value
    Int32(i32),
    /// Unsigned 32-bit value
    UInt32(u32),
    /// Signed 64-bit value
    Int64(i64),
    /// Unsigned 64-bit value
    UInt64(u64),
    /// 32-bit floating point value
    Float32(f32),
    /// 64-bit floating point value
    Float64(f64),
}

impl UpperHex for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value:02X}"),
            Immediate::UInt8(value) => write!(f, "{value:02X}"),
            Immediate::Int16(value) => write!(f, "{value:04X}"),
            Immediate::UInt16(value) => write!(f, "{value:04X}"),
            Immediate::Int32(value) => write!(f, "{value:08X}"),
            Immediate::UInt32(value) => write!(f, "{value:08X}"),
            Immediate::Int64(value) => write!(f, "{value:016X}"),
            Immediate::UInt64(value) => write!(f, "{value:016X}"),
            Immediate::Float32(value) => write!(f, "{:08X}", value.to_bits()),
            Immediate::Float64(value) => write!(f, "{:016X}", value.to_bits()),
        }
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Immediate::Int8(value) => write!(f, "{value}"),
            Immediate::UInt8(value) => write!(f, "{value}"),
            Immediate::Int16(value) => write!(f, "{value}"),
            Immediate::UInt16(value) => write!(f, "{value}"),
            Immediate::Int32(value) => write!(f, "{value}"),
            Immediate::UInt32(value) => write!(f, "{value}"),
            Immediate::Int64(value) => write!(f, "{value}"),
            Immediate::UInt64(value) => write!(f, "{value}"),
            Immediate::Float32(value) => write!(f, "{value}"),
            Immediate::Float64(value) => write!(f, "{value}"),
        }
    }
}

impl From<Immediate> for i64 {
    fn from(val: Immediate) -> Self {
        match val {
            Immediate::Int8(value) => i64::from(value),
            Immediate::UInt8(value) => i64::from(value),
            Immediate::Int16(value) => i64::from(value),
            Immediate::UInt16(value) => i64::from(value),
            Immediate::Int32(value) => i64::from(value),
            Immediate::UInt32(value) => i64::from(value),
            Immediate::Int64(value) => value,
            // Reinterpret the bit pattern
            Immediate::UInt64(value) => i64::from_ne_bytes(value.to_ne_bytes()),
            Immediate::Float32(value) => i64::from(value.to_bits()),
            Immediate::Float64(value) => i64::from_ne_bytes(value.to_bits().to_ne_bytes()),
        }
    }
}

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Immediate value, also used for branch offsets and argument / local indices
    Immediate(Immediate),
    /// Metadata token
    Token(Token),
    /// Switch jump table, offsets relative to the end of the instruction
    Switch(Vec<i32>),
}

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowType {
    /// Execution continues with the next instruction
    Sequential,
    /// Branch taken depending on a condition
    ConditionalBranch,
    /// Branch always taken
    UnconditionalBranch,
    /// Method call, execution continues after it returns
    Call,
    /// Return from the method
    Return,
    /// Jump table
    Switch,
    /// Throws an exception
    Throw,
    /// Ends a finally or fault handler
    EndFinally,
    /// Leaves a protected region
    Leave,
}

/// Fixed stack effect of an instruction, as listed in the instruction table.
///
/// Calls, `newobj` and `ret` depend on the signature involved; the table lists them without
/// stack effect and consumers that need exact numbers resolve the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBehavior {
    /// Values popped
    pub pops: u8,
    /// Values pushed
    pub pushes: u8,
    /// Net change of the stack depth
    pub net_effect: i8,
}

/// Coarse classification of instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionCategory {
    /// Arithmetic operations
    Arithmetic,
    /// Bitwise and logical operations
    BitwiseLogical,
    /// Comparisons
    Comparison,
    /// Branches, calls and returns
    ControlFlow,
    /// Numeric conversions
    Conversion,
    /// Loads and stores of arguments, locals, constants and indirections
    LoadStore,
    /// Object model: fields, arrays, boxing, type tokens
    ObjectModel,
    /// Instruction prefixes
    Prefix,
    /// Everything else
    Misc,
}

/// One decoded CIL instruction.
#[derive(Clone)]
pub struct Instruction {
    /// Offset of the instruction within the method code
    pub offset: u64,
    /// Encoded size in bytes, opcode and operand included
    pub size: u64,
    /// Opcode byte, the second byte for `0xFE` prefixed opcodes
    pub opcode: u8,
    /// `0xFE` for two-byte opcodes, 0 otherwise
    pub prefix: u8,
    /// Textual mnemonic
    pub mnemonic: &'static str,
    /// Category
    pub category: InstructionCategory,
    /// Control flow behaviour
    pub flow_type: FlowType,
    /// Decoded operand
    pub operand: Operand,
    /// Fixed stack effect
    pub stack_behavior: StackBehavior,
    /// Absolute code offsets of branch and switch targets
    pub branch_targets: Vec<u64>,
}

impl Instruction {
    /// Returns `true` for branches and switches.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// Returns `true` if execution never falls through to the next instruction.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.flow_type,
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::Leave
        )
    }

    /// Offset of the instruction that follows this one.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.offset + self.size
    }

    /// Returns the operand as signed 32-bit value, for `ldc.i4` forms.
    #[must_use]
    pub fn get_i32_operand(&self) -> Option<i32> {
        match &self.operand {
            Operand::Immediate(Immediate::Int32(v)) => Some(*v),
            Operand::Immediate(Immediate::Int8(v)) => Some(i32::from(*v)),
            Operand::Immediate(Immediate::UInt8(v)) => Some(i32::from(*v)),
            Operand::Immediate(Immediate::Int16(v)) => Some(i32::from(*v)),
            Operand::Immediate(Immediate::UInt16(v)) => Some(i32::from(*v)),
            // Reinterpret u32 bits as i32 (CIL semantics)
            Operand::Immediate(Immediate::UInt32(v)) => Some(i32::from_ne_bytes(v.to_ne_bytes())),
            _ => None,
        }
    }

    /// Returns the operand as signed 64-bit value, for `ldc.i8`.
    #[must_use]
    pub fn get_i64_operand(&self) -> Option<i64> {
        match &self.operand {
            Operand::Immediate(Immediate::Float32(_) | Immediate::Float64(_)) => None,
            Operand::Immediate(imm) => Some(i64::from(*imm)),
            _ => None,
        }
    }

    /// Returns the operand as 64-bit float, for `ldc.r4` / `ldc.r8`.
    #[must_use]
    pub fn get_f64_operand(&self) -> Option<f64> {
        match &self.operand {
            Operand::Immediate(Immediate::Float64(v)) => Some(*v),
            Operand::Immediate(Immediate::Float32(v)) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Returns an argument or local index operand.
    #[must_use]
    pub fn get_index_operand(&self) -> Option<u16> {
        match &self.operand {
            Operand::Immediate(Immediate::UInt8(v)) => Some(u16::from(*v)),
            Operand::Immediate(Immediate::UInt16(v)) => Some(*v),
            _ => None,
        }
    }

    /// Returns the token operand.
    #[must_use]
    pub fn get_token_operand(&self) -> Option<Token> {
        match &self.operand {
            Operand::Token(token) => Some(*token),
            _ => None,
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X} - ", self.offset)?;

        if self.prefix != 0 {
            write!(f, "{:02X}:", self.prefix)?;
        }

        write!(f, "{:02X} - {:<12}", self.opcode, self.mnemonic)?;

        match &self.operand {
            Operand::None => {}
            Operand::Immediate(imm) => write!(f, " 0x{imm:X}")?,
            Operand::Token(token) => write!(f, " token:0x{:08X}", token.value())?,
            Operand::Switch(items) => write!(f, " switch[{}]", items.len())?,
        }

        write!(f, " | {:?}", self.category)?;
        if self.flow_type != FlowType::Sequential {
            write!(f, " | {:?}", self.flow_type)?;
        }
        write!(f, " | size:{}", self.size)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.mnemonic)?;

        if self.is_branch() {
            for (index, target) in self.branch_targets.iter().enumerate() {
                let separator = if index == 0 { " " } else { ", " };
                write!(f, "{separator}IL_{target:04x}")?;
            }
            return Ok(());
        }

        match &self.operand {
            Operand::None | Operand::Switch(_) => Ok(()),
            Operand::Immediate(imm) => write!(f, " {imm}"),
            Operand::Token(token) => write!(f, " {token}"),
        }
    }
}
