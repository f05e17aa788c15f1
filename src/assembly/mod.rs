//! CIL instruction handling.
//!
//! This module covers the instruction level of method bodies: the opcode table, decoding of
//! code blocks into [`Instruction`] values and encoding of new code through
//! [`InstructionEncoder`]. The rewriter uses the encoder to build interception prologues, the
//! verifier and the interpreter work on decoded instructions.
//!
//! # Key Components
//!
//! - [`decode_instruction`] / [`decode_stream`] - bytes to instructions
//! - [`InstructionEncoder`] - mnemonics to bytes with labels and stack tracking
//! - [`INSTRUCTIONS`] / [`INSTRUCTIONS_FE`] - the opcode table both directions share
//! - [`opcodes`] - raw opcode values

mod decoder;
mod encoder;
mod instruction;
mod instructions;
pub mod opcodes;

pub use decoder::{decode_instruction, decode_stream};
pub use encoder::InstructionEncoder;
pub use instruction::{
    FlowType, Immediate, Instruction, InstructionCategory, Operand, OperandType, StackBehavior,
};
pub use instructions::{CilInstruction, INSTRUCTIONS, INSTRUCTIONS_FE};
