//! Instruction table.
//!
//! [`INSTRUCTIONS`] is indexed by the opcode byte of single-byte instructions,
//! [`INSTRUCTIONS_FE`] by the second byte of `0xFE` prefixed instructions. Reserved opcodes have
//! an empty mnemonic. Calls, `newobj` and `ret` list no stack effect; it depends on the
//! signature of the callee or the method.

use crate::assembly::instruction::{FlowType, InstructionCategory, OperandType};

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CilInstruction<'a> {
    /// Operand encoding
    pub op_type: OperandType,
    /// Mnemonic, empty for reserved opcodes
    pub instr: &'a str,
    /// Category
    pub category: InstructionCategory,
    /// Values popped
    pub stack_pops: u8,
    /// Values pushed
    pub stack_pushes: u8,
    /// Control flow behaviour
    pub flow: FlowType,
}

impl CilInstruction<'_> {
    /// Returns `true` for reserved opcodes.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        self.instr.is_empty()
    }
}

const fn op(
    instr: &'static str,
    op_type: OperandType,
    category: InstructionCategory,
    stack_pops: u8,
    stack_pushes: u8,
    flow: FlowType,
) -> CilInstruction<'static> {
    CilInstruction {
        op_type,
        instr,
        category,
        stack_pops,
        stack_pushes,
        flow,
    }
}

const fn seq(
    instr: &'static str,
    op_type: OperandType,
    category: InstructionCategory,
    stack_pops: u8,
    stack_pushes: u8,
) -> CilInstruction<'static> {
    op(
        instr,
        op_type,
        category,
        stack_pops,
        stack_pushes,
        FlowType::Sequential,
    )
}

const fn branch(
    instr: &'static str,
    op_type: OperandType,
    stack_pops: u8,
) -> CilInstruction<'static> {
    let flow = if stack_pops == 0 {
        FlowType::UnconditionalBranch
    } else {
        FlowType::ConditionalBranch
    };
    op(instr, op_type, InstructionCategory::ControlFlow, stack_pops, 0, flow)
}

const RESERVED: CilInstruction<'static> =
    seq("", OperandType::None, InstructionCategory::Misc, 0, 0);

use crate::assembly::instruction::InstructionCategory::{
    Arithmetic as AR, BitwiseLogical as BL, Comparison as CMP, ControlFlow as CF,
    Conversion as CV, LoadStore as LS, Misc as MS, ObjectModel as OM, Prefix as PF,
};
use crate::assembly::instruction::OperandType::{
    Float32 as R4, Float64 as R8, Int32 as I4, Int64 as I8, Int8 as S8, None as NO, Switch as SW,
    Token as TK, UInt16 as U2, UInt8 as U1,
};

/// Single-byte opcodes `0x00..=0xE0`.
pub const INSTRUCTIONS: [CilInstruction<'static>; 225] = [
    // 0x00
    seq("nop", NO, MS, 0, 0),
    seq("break", NO, MS, 0, 0),
    seq("ldarg.0", NO, LS, 0, 1),
    seq("ldarg.1", NO, LS, 0, 1),
    seq("ldarg.2", NO, LS, 0, 1),
    seq("ldarg.3", NO, LS, 0, 1),
    seq("ldloc.0", NO, LS, 0, 1),
    seq("ldloc.1", NO, LS, 0, 1),
    seq("ldloc.2", NO, LS, 0, 1),
    seq("ldloc.3", NO, LS, 0, 1),
    seq("stloc.0", NO, LS, 1, 0),
    seq("stloc.1", NO, LS, 1, 0),
    seq("stloc.2", NO, LS, 1, 0),
    seq("stloc.3", NO, LS, 1, 0),
    seq("ldarg.s", U1, LS, 0, 1),
    seq("ldarga.s", U1, LS, 0, 1),
    // 0x10
    seq("starg.s", U1, LS, 1, 0),
    seq("ldloc.s", U1, LS, 0, 1),
    seq("ldloca.s", U1, LS, 0, 1),
    seq("stloc.s", U1, LS, 1, 0),
    seq("ldnull", NO, LS, 0, 1),
    seq("ldc.i4.m1", NO, LS, 0, 1),
    seq("ldc.i4.0", NO, LS, 0, 1),
    seq("ldc.i4.1", NO, LS, 0, 1),
    seq("ldc.i4.2", NO, LS, 0, 1),
    seq("ldc.i4.3", NO, LS, 0, 1),
    seq("ldc.i4.4", NO, LS, 0, 1),
    seq("ldc.i4.5", NO, LS, 0, 1),
    seq("ldc.i4.6", NO, LS, 0, 1),
    seq("ldc.i4.7", NO, LS, 0, 1),
    seq("ldc.i4.8", NO, LS, 0, 1),
    seq("ldc.i4.s", S8, LS, 0, 1),
    // 0x20
    seq("ldc.i4", I4, LS, 0, 1),
    seq("ldc.i8", I8, LS, 0, 1),
    seq("ldc.r4", R4, LS, 0, 1),
    seq("ldc.r8", R8, LS, 0, 1),
    RESERVED,
    seq("dup", NO, MS, 1, 2),
    seq("pop", NO, MS, 1, 0),
    op("jmp", TK, CF, 0, 0, FlowType::Return),
    op("call", TK, CF, 0, 0, FlowType::Call),
    op("calli", TK, CF, 0, 0, FlowType::Call),
    op("ret", NO, CF, 0, 0, FlowType::Return),
    branch("br.s", S8, 0),
    branch("brfalse.s", S8, 1),
    branch("brtrue.s", S8, 1),
    branch("beq.s", S8, 2),
    branch("bge.s", S8, 2),
    // 0x30
    branch("bgt.s", S8, 2),
    branch("ble.s", S8, 2),
    branch("blt.s", S8, 2),
    branch("bne.un.s", S8, 2),
    branch("bge.un.s", S8, 2),
    branch("bgt.un.s", S8, 2),
    branch("ble.un.s", S8, 2),
    branch("blt.un.s", S8, 2),
    branch("br", I4, 0),
    branch("brfalse", I4, 1),
    branch("brtrue", I4, 1),
    branch("beq", I4, 2),
    branch("bge", I4, 2),
    branch("bgt", I4, 2),
    branch("ble", I4, 2),
    branch("blt", I4, 2),
    // 0x40
    branch("bne.un", I4, 2),
    branch("bge.un", I4, 2),
    branch("bgt.un", I4, 2),
    branch("ble.un", I4, 2),
    branch("blt.un", I4, 2),
    op("switch", SW, CF, 1, 0, FlowType::Switch),
    seq("ldind.i1", NO, LS, 1, 1),
    seq("ldind.u1", NO, LS, 1, 1),
    seq("ldind.i2", NO, LS, 1, 1),
    seq("ldind.u2", NO, LS, 1, 1),
    seq("ldind.i4", NO, LS, 1, 1),
    seq("ldind.u4", NO, LS, 1, 1),
    seq("ldind.i8", NO, LS, 1, 1),
    seq("ldind.i", NO, LS, 1, 1),
    seq("ldind.r4", NO, LS, 1, 1),
    seq("ldind.r8", NO, LS, 1, 1),
    // 0x50
    seq("ldind.ref", NO, LS, 1, 1),
    seq("stind.ref", NO, LS, 2, 0),
    seq("stind.i1", NO, LS, 2, 0),
    seq("stind.i2", NO, LS, 2, 0),
    seq("stind.i4", NO, LS, 2, 0),
    seq("stind.i8", NO, LS, 2, 0),
    seq("stind.r4", NO, LS, 2, 0),
    seq("stind.r8", NO, LS, 2, 0),
    seq("add", NO, AR, 2, 1),
    seq("sub", NO, AR, 2, 1),
    seq("mul", NO, AR, 2, 1),
    seq("div", NO, AR, 2, 1),
    seq("div.un", NO, AR, 2, 1),
    seq("rem", NO, AR, 2, 1),
    seq("rem.un", NO, AR, 2, 1),
    seq("and", NO, BL, 2, 1),
    // 0x60
    seq("or", NO, BL, 2, 1),
    seq("xor", NO, BL, 2, 1),
    seq("shl", NO, BL, 2, 1),
    seq("shr", NO, BL, 2, 1),
    seq("shr.un", NO, BL, 2, 1),
    seq("neg", NO, AR, 1, 1),
    seq("not", NO, BL, 1, 1),
    seq("conv.i1", NO, CV, 1, 1),
    seq("conv.i2", NO, CV, 1, 1),
    seq("conv.i4", NO, CV, 1, 1),
    seq("conv.i8", NO, CV, 1, 1),
    seq("conv.r4", NO, CV, 1, 1),
    seq("conv.r8", NO, CV, 1, 1),
    seq("conv.u4", NO, CV, 1, 1),
    seq("conv.u8", NO, CV, 1, 1),
    op("callvirt", TK, CF, 0, 0, FlowType::Call),
    // 0x70
    seq("cpobj", TK, OM, 2, 0),
    seq("ldobj", TK, OM, 1, 1),
    seq("ldstr", TK, OM, 0, 1),
    op("newobj", TK, OM, 0, 0, FlowType::Call),
    seq("castclass", TK, OM, 1, 1),
    seq("isinst", TK, OM, 1, 1),
    seq("conv.r.un", NO, CV, 1, 1),
    RESERVED,
    RESERVED,
    seq("unbox", TK, OM, 1, 1),
    op("throw", NO, CF, 1, 0, FlowType::Throw),
    seq("ldfld", TK, OM, 1, 1),
    seq("ldflda", TK, OM, 1, 1),
    seq("stfld", TK, OM, 2, 0),
    seq("ldsfld", TK, OM, 0, 1),
    seq("ldsflda", TK, OM, 0, 1),
    // 0x80
    seq("stsfld", TK, OM, 1, 0),
    seq("stobj", TK, OM, 2, 0),
    seq("conv.ovf.i1.un", NO, CV, 1, 1),
    seq("conv.ovf.i2.un", NO, CV, 1, 1),
    seq("conv.ovf.i4.un", NO, CV, 1, 1),
    seq("conv.ovf.i8.un", NO, CV, 1, 1),
    seq("conv.ovf.u1.un", NO, CV, 1, 1),
    seq("conv.ovf.u2.un", NO, CV, 1, 1),
    seq("conv.ovf.u4.un", NO, CV, 1, 1),
    seq("conv.ovf.u8.un", NO, CV, 1, 1),
    seq("conv.ovf.i.un", NO, CV, 1, 1),
    seq("conv.ovf.u.un", NO, CV, 1, 1),
    seq("box", TK, OM, 1, 1),
    seq("newarr", TK, OM, 1, 1),
    seq("ldlen", NO, OM, 1, 1),
    seq("ldelema", TK, OM, 2, 1),
    // 0x90
    seq("ldelem.i1", NO, OM, 2, 1),
    seq("ldelem.u1", NO, OM, 2, 1),
    seq("ldelem.i2", NO, OM, 2, 1),
    seq("ldelem.u2", NO, OM, 2, 1),
    seq("ldelem.i4", NO, OM, 2, 1),
    seq("ldelem.u4", NO, OM, 2, 1),
    seq("ldelem.i8", NO, OM, 2, 1),
    seq("ldelem.i", NO, OM, 2, 1),
    seq("ldelem.r4", NO, OM, 2, 1),
    seq("ldelem.r8", NO, OM, 2, 1),
    seq("ldelem.ref", NO, OM, 2, 1),
    seq("stelem.i", NO, OM, 3, 0),
    seq("stelem.i1", NO, OM, 3, 0),
    seq("stelem.i2", NO, OM, 3, 0),
    seq("stelem.i4", NO, OM, 3, 0),
    seq("stelem.i8", NO, OM, 3, 0),
    // 0xA0
    seq("stelem.r4", NO, OM, 3, 0),
    seq("stelem.r8", NO, OM, 3, 0),
    seq("stelem.ref", NO, OM, 3, 0),
    seq("ldelem", TK, OM, 2, 1),
    seq("stelem", TK, OM, 3, 0),
    seq("unbox.any", TK, OM, 1, 1),
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    // 0xB0
    RESERVED,
    RESERVED,
    RESERVED,
    seq("conv.ovf.i1", NO, CV, 1, 1),
    seq("conv.ovf.u1", NO, CV, 1, 1),
    seq("conv.ovf.i2", NO, CV, 1, 1),
    seq("conv.ovf.u2", NO, CV, 1, 1),
    seq("conv.ovf.i4", NO, CV, 1, 1),
    seq("conv.ovf.u4", NO, CV, 1, 1),
    seq("conv.ovf.i8", NO, CV, 1, 1),
    seq("conv.ovf.u8", NO, CV, 1, 1),
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    // 0xC0
    RESERVED,
    RESERVED,
    seq("refanyval", TK, OM, 1, 1),
    seq("ckfinite", NO, AR, 1, 1),
    RESERVED,
    RESERVED,
    seq("mkrefany", TK, OM, 1, 1),
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    RESERVED,
    // 0xD0
    seq("ldtoken", TK, OM, 0, 1),
    seq("conv.u2", NO, CV, 1, 1),
    seq("conv.u1", NO, CV, 1, 1),
    seq("conv.i", NO, CV, 1, 1),
    seq("conv.ovf.i", NO, CV, 1, 1),
    seq("conv.ovf.u", NO, CV, 1, 1),
    seq("add.ovf", NO, AR, 2, 1),
    seq("add.ovf.un", NO, AR, 2, 1),
    seq("mul.ovf", NO, AR, 2, 1),
    seq("mul.ovf.un", NO, AR, 2, 1),
    seq("sub.ovf", NO, AR, 2, 1),
    seq("sub.ovf.un", NO, AR, 2, 1),
    op("endfinally", NO, CF, 0, 0, FlowType::EndFinally),
    op("leave", I4, CF, 0, 0, FlowType::Leave),
    op("leave.s", S8, CF, 0, 0, FlowType::Leave),
    seq("stind.i", NO, LS, 2, 0),
    // 0xE0
    seq("conv.u", NO, CV, 1, 1),
];

/// Two-byte opcodes `0xFE 0x00..=0xFE 0x1E`, indexed by the second byte.
pub const INSTRUCTIONS_FE: [CilInstruction<'static>; 31] = [
    seq("arglist", NO, MS, 0, 1),
    seq("ceq", NO, CMP, 2, 1),
    seq("cgt", NO, CMP, 2, 1),
    seq("cgt.un", NO, CMP, 2, 1),
    seq("clt", NO, CMP, 2, 1),
    seq("clt.un", NO, CMP, 2, 1),
    seq("ldftn", TK, OM, 0, 1),
    seq("ldvirtftn", TK, OM, 1, 1),
    RESERVED,
    seq("ldarg", U2, LS, 0, 1),
    seq("ldarga", U2, LS, 0, 1),
    seq("starg", U2, LS, 1, 0),
    seq("ldloc", U2, LS, 0, 1),
    seq("ldloca", U2, LS, 0, 1),
    seq("stloc", U2, LS, 1, 0),
    seq("localloc", NO, MS, 1, 1),
    // 0xFE 0x10
    RESERVED,
    op("endfilter", NO, CF, 1, 0, FlowType::EndFinally),
    seq("unaligned.", U1, PF, 0, 0),
    seq("volatile.", NO, PF, 0, 0),
    seq("tail.", NO, PF, 0, 0),
    seq("initobj", TK, OM, 1, 0),
    seq("constrained.", TK, PF, 0, 0),
    seq("cpblk", NO, MS, 3, 0),
    seq("initblk", NO, MS, 3, 0),
    seq("no.", U1, PF, 0, 0),
    op("rethrow", NO, CF, 0, 0, FlowType::Throw),
    RESERVED,
    seq("sizeof", TK, OM, 0, 1),
    seq("refanytype", NO, OM, 1, 1),
    seq("readonly.", NO, PF, 0, 0),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_positions() {
        assert_eq!(INSTRUCTIONS[0x2A].instr, "ret");
        assert_eq!(INSTRUCTIONS[0x28].instr, "call");
        assert_eq!(INSTRUCTIONS[0x45].instr, "switch");
        assert_eq!(INSTRUCTIONS[0x72].instr, "ldstr");
        assert_eq!(INSTRUCTIONS[0x8C].instr, "box");
        assert_eq!(INSTRUCTIONS[0xA2].instr, "stelem.ref");
        assert_eq!(INSTRUCTIONS[0xA5].instr, "unbox.any");
        assert_eq!(INSTRUCTIONS[0xD0].instr, "ldtoken");
        assert_eq!(INSTRUCTIONS[0xDE].instr, "leave.s");
        assert_eq!(INSTRUCTIONS[0xE0].instr, "conv.u");
        assert!(INSTRUCTIONS[0x24].is_reserved());
        assert!(INSTRUCTIONS[0xA6].is_reserved());

        assert_eq!(INSTRUCTIONS_FE[0x01].instr, "ceq");
        assert_eq!(INSTRUCTIONS_FE[0x0D].instr, "ldloca");
        assert_eq!(INSTRUCTIONS_FE[0x1A].instr, "rethrow");
        assert_eq!(INSTRUCTIONS_FE[0x1E].instr, "readonly.");
    }

    #[test]
    fn branch_flow() {
        assert_eq!(INSTRUCTIONS[0x2B].flow, FlowType::UnconditionalBranch);
        assert_eq!(INSTRUCTIONS[0x2C].flow, FlowType::ConditionalBranch);
        assert_eq!(INSTRUCTIONS[0x2E].stack_pops, 2);
        assert_eq!(INSTRUCTIONS[0x38].op_type, OperandType::Int32);
    }

    #[test]
    fn mnemonics_unique() {
        let mut seen = std::collections::HashSet::new();
        for entry in INSTRUCTIONS.iter().chain(INSTRUCTIONS_FE.iter()) {
            if !entry.is_reserved() {
                assert!(seen.insert(entry.instr), "duplicate {}", entry.instr);
            }
        }
    }
}
