//! CIL instruction decoding.
//!
//! [`decode_instruction`] reads one instruction at the parser position; [`decode_stream`]
//! decodes a complete method code block. Branch and switch operands are resolved into absolute
//! code offsets in [`Instruction::branch_targets`], computed relative to the end of the
//! instruction exactly like the runtime does.
//!
//! ```rust
//! use cilweave::assembly::decode_stream;
//!
//! // ldarg.0, ldarg.1, add, ret
//! let instructions = decode_stream(&[0x02, 0x03, 0x58, 0x2A])?;
//! assert_eq!(instructions.len(), 4);
//! assert_eq!(instructions[2].mnemonic, "add");
//! # Ok::<(), cilweave::Error>(())
//! ```

use crate::{
    assembly::{
        FlowType, Immediate, Instruction, Operand, OperandType, StackBehavior, INSTRUCTIONS,
        INSTRUCTIONS_FE,
    },
    file::parser::Parser,
    metadata::token::Token,
    Result,
};

/// Decodes all instructions of a code block.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for reserved opcodes and
/// [`crate::Error::OutOfBounds`] for truncated operands.
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();

    while parser.has_more_data() {
        instructions.push(decode_instruction(&mut parser)?);
    }

    Ok(instructions)
}

/// Decodes the instruction at the current parser position.
///
/// The parser position becomes the instruction offset; the parser is left at the start of the
/// next instruction.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for reserved or unknown opcodes and
/// [`crate::Error::OutOfBounds`] for truncated operands.
pub fn decode_instruction(parser: &mut Parser) -> Result<Instruction> {
    let offset = parser.pos() as u64;
    let first_byte = parser.read_le::<u8>()?;

    let (cil_instruction, prefix, opcode) = match first_byte {
        0xFE => {
            let second_byte = parser.read_le::<u8>()?;
            match INSTRUCTIONS_FE.get(second_byte as usize) {
                Some(instr) => (instr, 0xFE, second_byte),
                None => return Err(malformed_error!("Invalid opcode: FE {:02X}", second_byte)),
            }
        }
        _ => match INSTRUCTIONS.get(first_byte as usize) {
            Some(instr) => (instr, 0, first_byte),
            None => return Err(malformed_error!("Invalid opcode: {:02X}", first_byte)),
        },
    };

    if cil_instruction.is_reserved() {
        return Err(malformed_error!(
            "Reserved opcode {:02X}{:02X} at offset {}",
            prefix,
            opcode,
            offset
        ));
    }

    let operand = match cil_instruction.op_type {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Immediate(Immediate::Int8(parser.read_le::<i8>()?)),
        OperandType::UInt8 => Operand::Immediate(Immediate::UInt8(parser.read_le::<u8>()?)),
        OperandType::Int16 => Operand::Immediate(Immediate::Int16(parser.read_le::<i16>()?)),
        OperandType::UInt16 => Operand::Immediate(Immediate::UInt16(parser.read_le::<u16>()?)),
        OperandType::Int32 => Operand::Immediate(Immediate::Int32(parser.read_le::<i32>()?)),
        OperandType::UInt32 => Operand::Immediate(Immediate::UInt32(parser.read_le::<u32>()?)),
        OperandType::Int64 => Operand::Immediate(Immediate::Int64(parser.read_le::<i64>()?)),
        OperandType::UInt64 => Operand::Immediate(Immediate::UInt64(parser.read_le::<u64>()?)),
        OperandType::Float32 => Operand::Immediate(Immediate::Float32(parser.read_le::<f32>()?)),
        OperandType::Float64 => Operand::Immediate(Immediate::Float64(parser.read_le::<f64>()?)),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::Switch => {
            let case_count = parser.read_le::<u32>()? as usize;
            if case_count > parser.remaining() / 4 {
                return Err(malformed_error!(
                    "Switch at offset {} claims {} targets",
                    offset,
                    case_count
                ));
            }

            let mut targets = Vec::with_capacity(case_count);
            for _ in 0..case_count {
                targets.push(parser.read_le::<i32>()?);
            }
            Operand::Switch(targets)
        }
    };
    let size = parser.pos() as u64 - offset;

    let mut instruction = Instruction {
        offset,
        size,
        opcode,
        prefix,
        mnemonic: cil_instruction.instr,
        category: cil_instruction.category,
        flow_type: cil_instruction.flow,
        stack_behavior: StackBehavior {
            pops: cil_instruction.stack_pops,
            pushes: cil_instruction.stack_pushes,
            #[allow(clippy::cast_possible_wrap)]
            net_effect: cil_instruction.stack_pushes as i8 - cil_instruction.stack_pops as i8,
        },
        branch_targets: Vec::new(),
        operand,
    };

    let next_offset = instruction.next_offset();
    match (&instruction.flow_type, &instruction.operand) {
        (
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave,
            Operand::Immediate(value),
        ) => {
            let delta = i64::from(*value);
            instruction
                .branch_targets
                .push(next_offset.wrapping_add_signed(delta));
        }
        (FlowType::Switch, Operand::Switch(targets)) => {
            let resolved = targets
                .iter()
                .map(|target| next_offset.wrapping_add_signed(i64::from(*target)))
                .collect();
            instruction.branch_targets = resolved;
        }
        _ => {}
    }

    Ok(instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assembly::InstructionCategory, Error};

    #[test]
    fn single_byte() {
        let mut parser = Parser::new(&[0x11, 0x10]);
        let result = decode_instruction(&mut parser).unwrap();

        assert_eq!(result.offset, 0);
        assert_eq!(result.size, 2);
        assert_eq!(result.opcode, 0x11);
        assert_eq!(result.prefix, 0);
        assert_eq!(result.mnemonic, "ldloc.s");
        assert_eq!(result.category, InstructionCategory::LoadStore);
        assert_eq!(result.get_index_operand(), Some(0x10));
    }

    #[test]
    fn two_byte() {
        let mut parser = Parser::new(&[0xFE, 0x01]);
        let result = decode_instruction(&mut parser).unwrap();

        assert_eq!(result.opcode, 0x01);
        assert_eq!(result.prefix, 0xFE);
        assert_eq!(result.mnemonic, "ceq");
        assert_eq!(result.category, InstructionCategory::Comparison);
        assert_eq!(result.stack_behavior.net_effect, -1);
    }

    #[test]
    fn branch_targets() {
        // nop, br.s -3 (back to nop), ret
        let instructions = decode_stream(&[0x00, 0x2B, 0xFD, 0x2A]).unwrap();
        assert_eq!(instructions[1].flow_type, FlowType::UnconditionalBranch);
        assert_eq!(instructions[1].branch_targets, vec![0]);

        // brtrue 2 (long form) skips two nops
        let instructions = decode_stream(&[0x3A, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A]).unwrap();
        assert_eq!(instructions[0].branch_targets, vec![7]);
    }

    #[test]
    fn switch_targets() {
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, // switch (2 targets)
            0x00, 0x00, 0x00, 0x00, // +0
            0x01, 0x00, 0x00, 0x00, // +1
            0x00, 0x2A,
        ];
        let instructions = decode_stream(&code).unwrap();
        assert_eq!(instructions[0].size, 13);
        assert_eq!(instructions[0].branch_targets, vec![13, 14]);
    }

    #[test]
    fn token_operand() {
        let instructions = decode_stream(&[0x28, 0x01, 0x00, 0x00, 0x0A]).unwrap();
        assert_eq!(
            instructions[0].get_token_operand(),
            Some(Token::new(0x0A00_0001))
        );
    }

    #[test]
    fn invalid_input() {
        assert!(matches!(
            decode_stream(&[0x24]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            decode_stream(&[0xFE, 0x40]),
            Err(Error::Malformed { .. })
        ));
        assert!(matches!(
            decode_stream(&[0x20, 0x01]),
            Err(Error::OutOfBounds { .. })
        ));
        assert!(decode_stream(&[0x45, 0xFF, 0xFF, 0xFF, 0x7F]).is_err());
    }
}
