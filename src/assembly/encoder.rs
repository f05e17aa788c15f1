//! CIL instruction encoding.
//!
//! [`InstructionEncoder`] turns mnemonics and operands back into bytecode using the same tables
//! the decoder reads from. Branches reference named labels that are resolved in
//! [`InstructionEncoder::finalize`]; the encoder tracks the evaluation stack depth as it goes so
//! the caller gets the `max_stack` value of the emitted code for free.
//!
//! ```rust
//! use cilweave::assembly::InstructionEncoder;
//!
//! let mut encoder = InstructionEncoder::new();
//! encoder.emit_ldarg(0)?;
//! encoder.emit_branch("brfalse.s", "zero")?;
//! encoder.emit_ldc_i4(1)?;
//! encoder.emit_ret(true)?;
//! encoder.define_label("zero")?;
//! encoder.emit_ldc_i4(0)?;
//! encoder.emit_ret(true)?;
//!
//! let (bytecode, max_stack, _labels) = encoder.finalize()?;
//! assert_eq!(bytecode, vec![0x02, 0x2C, 0x02, 0x17, 0x2A, 0x16, 0x2A]);
//! assert_eq!(max_stack, 1);
//! # Ok::<(), cilweave::Error>(())
//! ```

use std::{collections::HashMap, sync::OnceLock};

use crate::{
    assembly::{
        instruction::{FlowType, Immediate, Operand, OperandType},
        instructions::{CilInstruction, INSTRUCTIONS, INSTRUCTIONS_FE},
    },
    Error, Result,
};

type OpcodeEntry = (u8, u8, &'static CilInstruction<'static>);

static MNEMONIC_TO_OPCODE: OnceLock<HashMap<&'static str, OpcodeEntry>> = OnceLock::new();

fn mnemonic_lookup() -> &'static HashMap<&'static str, OpcodeEntry> {
    MNEMONIC_TO_OPCODE.get_or_init(|| {
        let mut map = HashMap::new();

        for (opcode, instr) in (0_u8..).zip(INSTRUCTIONS.iter()) {
            if !instr.is_reserved() {
                map.insert(instr.instr, (opcode, 0, instr));
            }
        }

        for (opcode, instr) in (0_u8..).zip(INSTRUCTIONS_FE.iter()) {
            if !instr.is_reserved() {
                map.insert(instr.instr, (opcode, 0xFE, instr));
            }
        }

        map
    })
}

/// A branch operand waiting for its label.
#[derive(Debug, Clone)]
struct LabelFixup {
    label: String,
    /// Position of the offset field
    fixup_position: usize,
    /// Size of the offset field, 1 or 4
    offset_size: u8,
}

/// Bytecode emitter with label resolution and stack tracking.
pub struct InstructionEncoder {
    bytecode: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<LabelFixup>,
    current_stack_depth: i16,
    max_stack_depth: u16,
    /// Depth every path reaching a label must agree on
    label_stack_depths: HashMap<String, i16>,
    /// Set after ret, throw, unconditional branches and raw code
    unreachable: bool,
}

impl InstructionEncoder {
    /// Create an empty encoder.
    #[must_use]
    pub fn new() -> Self {
        InstructionEncoder {
            bytecode: Vec::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            current_stack_depth: 0,
            max_stack_depth: 0,
            label_stack_depths: HashMap::new(),
            unreachable: false,
        }
    }

    /// Emit an instruction with its table stack effect.
    ///
    /// Calls and `newobj` must go through [`InstructionEncoder::emit_call`] and `ret` through
    /// [`InstructionEncoder::emit_ret`], their stack effect depends on a signature.
    ///
    /// # Errors
    /// [`Error::InvalidMnemonic`] for unknown mnemonics, [`crate::Error::Malformed`] if the
    /// operand does not match the instruction or the stack underflows.
    pub fn emit_instruction(&mut self, mnemonic: &str, operand: Option<Operand>) -> Result<()> {
        let metadata = self.emit_opcode(mnemonic)?;
        self.emit_operand(operand, metadata.op_type)?;

        self.update_stack_depth(metadata.stack_pops, metadata.stack_pushes)
            .map_err(|e| malformed_error!("Stack error at instruction '{}': {}", mnemonic, e))?;

        if matches!(
            metadata.flow,
            FlowType::Return | FlowType::Throw | FlowType::EndFinally
        ) {
            self.unreachable = true;
        }

        Ok(())
    }

    /// Emit a branch to `label`.
    ///
    /// # Errors
    /// [`Error::InvalidBranch`] if the mnemonic is not a branch, plus the errors of
    /// [`InstructionEncoder::emit_instruction`].
    pub fn emit_branch(&mut self, mnemonic: &str, label: &str) -> Result<()> {
        let (_, _, metadata) = lookup(mnemonic)?;
        if !matches!(
            metadata.flow,
            FlowType::ConditionalBranch | FlowType::UnconditionalBranch | FlowType::Leave
        ) {
            return Err(Error::InvalidBranch(format!(
                "instruction '{mnemonic}' is not a branch instruction"
            )));
        }

        let offset_size = match metadata.op_type {
            OperandType::Int8 => 1,
            OperandType::Int32 => 4,
            _ => {
                return Err(Error::InvalidBranch(format!(
                    "unexpected operand type for branch '{mnemonic}'"
                )))
            }
        };

        self.emit_opcode(mnemonic)?;
        self.fixups.push(LabelFixup {
            label: label.to_string(),
            fixup_position: self.bytecode.len(),
            offset_size,
        });
        self.bytecode
            .extend(std::iter::repeat(0).take(offset_size as usize));

        if metadata.flow == FlowType::Leave {
            self.current_stack_depth = 0;
        } else {
            self.update_stack_depth(metadata.stack_pops, 0)
                .map_err(|e| malformed_error!("Stack error at branch '{}': {}", mnemonic, e))?;
        }
        self.record_label_stack_depth(label)?;

        if matches!(
            metadata.flow,
            FlowType::UnconditionalBranch | FlowType::Leave
        ) {
            self.unreachable = true;
        }

        Ok(())
    }

    /// Emit `call`, `callvirt` or `newobj` with an explicit stack effect.
    ///
    /// `num_args` counts every popped value, `this` included.
    ///
    /// # Errors
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_call(
        &mut self,
        mnemonic: &str,
        operand: Option<Operand>,
        num_args: u8,
        has_result: bool,
    ) -> Result<()> {
        let metadata = self.emit_opcode(mnemonic)?;
        self.emit_operand(operand, metadata.op_type)?;

        self.update_stack_depth(num_args, u8::from(has_result))
            .map_err(|e| malformed_error!("Stack error at call '{}': {}", mnemonic, e))
    }

    /// Emit `ret`, popping the return value if the method has one.
    ///
    /// # Errors
    /// [`crate::Error::Malformed`] on stack underflow.
    pub fn emit_ret(&mut self, has_value: bool) -> Result<()> {
        self.emit_opcode("ret")?;
        self.update_stack_depth(u8::from(has_value), 0)
            .map_err(|e| malformed_error!("Stack error at ret: {}", e))?;
        self.unreachable = true;
        Ok(())
    }

    /// Emit the most compact `ldarg` form.
    ///
    /// # Errors
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_ldarg(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("ldarg.0", None),
            1 => self.emit_instruction("ldarg.1", None),
            2 => self.emit_instruction("ldarg.2", None),
            3 => self.emit_instruction("ldarg.3", None),
            _ => self.emit_indexed("ldarg.s", "ldarg", index),
        }
    }

    /// Emit the most compact `ldloc` form.
    ///
    /// # Errors
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_ldloc(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("ldloc.0", None),
            1 => self.emit_instruction("ldloc.1", None),
            2 => self.emit_instruction("ldloc.2", None),
            3 => self.emit_instruction("ldloc.3", None),
            _ => self.emit_indexed("ldloc.s", "ldloc", index),
        }
    }

    /// Emit the most compact `stloc` form.
    ///
    /// # Errors
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_stloc(&mut self, index: u16) -> Result<()> {
        match index {
            0 => self.emit_instruction("stloc.0", None),
            1 => self.emit_instruction("stloc.1", None),
            2 => self.emit_instruction("stloc.2", None),
            3 => self.emit_instruction("stloc.3", None),
            _ => self.emit_indexed("stloc.s", "stloc", index),
        }
    }

    /// Emit `ldloca.s` or `ldloca`.
    ///
    /// # Errors
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_ldloca(&mut self, index: u16) -> Result<()> {
        self.emit_indexed("ldloca.s", "ldloca", index)
    }

    /// Emit the most compact `ldc.i4` form.
    ///
    /// # Errors
    /// Same as [`InstructionEncoder::emit_instruction`].
    pub fn emit_ldc_i4(&mut self, value: i32) -> Result<()> {
        match value {
            -1 => self.emit_instruction("ldc.i4.m1", None),
            0 => self.emit_instruction("ldc.i4.0", None),
            1 => self.emit_instruction("ldc.i4.1", None),
            2 => self.emit_instruction("ldc.i4.2", None),
            3 => self.emit_instruction("ldc.i4.3", None),
            4 => self.emit_instruction("ldc.i4.4", None),
            5 => self.emit_instruction("ldc.i4.5", None),
            6 => self.emit_instruction("ldc.i4.6", None),
            7 => self.emit_instruction("ldc.i4.7", None),
            8 => self.emit_instruction("ldc.i4.8", None),
            _ => match i8::try_from(value) {
                Ok(short) => self.emit_instruction(
                    "ldc.i4.s",
                    Some(Operand::Immediate(Immediate::Int8(short))),
                ),
                Err(_) => self.emit_instruction(
                    "ldc.i4",
                    Some(Operand::Immediate(Immediate::Int32(value))),
                ),
            },
        }
    }

    /// Append already encoded instructions verbatim.
    ///
    /// Stack tracking does not follow raw code; anything emitted afterwards has to start at a
    /// label.
    pub fn emit_raw(&mut self, code: &[u8]) {
        self.bytecode.extend_from_slice(code);
        self.unreachable = true;
    }

    /// Define `name` at the current position.
    ///
    /// # Errors
    /// [`crate::Error::Malformed`] if the label already exists or the paths reaching it disagree
    /// on the stack depth.
    pub fn define_label(&mut self, name: &str) -> Result<()> {
        if self.labels.contains_key(name) {
            return Err(malformed_error!("Label '{}' defined twice", name));
        }

        if let Some(&expected) = self.label_stack_depths.get(name) {
            if self.unreachable {
                self.current_stack_depth = expected;
            } else if self.current_stack_depth != expected {
                return Err(malformed_error!(
                    "Stack depth mismatch at label '{}': expected {}, got {}",
                    name,
                    expected,
                    self.current_stack_depth
                ));
            }
        } else if self.unreachable {
            self.current_stack_depth = 0;
        } else {
            self.label_stack_depths
                .insert(name.to_string(), self.current_stack_depth);
        }

        self.unreachable = false;
        self.labels.insert(name.to_string(), self.current_position()?);
        Ok(())
    }

    /// Current bytecode length.
    ///
    /// # Errors
    /// [`crate::Error::Malformed`] once the code exceeds the `u32` range.
    pub fn current_position(&self) -> Result<u32> {
        u32::try_from(self.bytecode.len())
            .map_err(|_| malformed_error!("Bytecode length exceeds u32 range"))
    }

    /// Offset of a defined label.
    #[must_use]
    pub fn label_offset(&self, name: &str) -> Option<u32> {
        self.labels.get(name).copied()
    }

    /// Maximum stack depth reached so far.
    #[must_use]
    pub fn max_stack_depth(&self) -> u16 {
        self.max_stack_depth
    }

    /// Stack depth at the current position.
    #[must_use]
    pub fn current_stack_depth(&self) -> i16 {
        self.current_stack_depth
    }

    /// Resolve all labels and return the bytecode, its maximum stack depth and the label map.
    ///
    /// # Errors
    /// [`Error::UndefinedLabel`] for branches to unknown labels and [`Error::InvalidBranch`] for
    /// short branches whose distance does not fit in one byte.
    pub fn finalize(mut self) -> Result<(Vec<u8>, u16, HashMap<String, u32>)> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let label_position = self
                .labels
                .get(&fixup.label)
                .ok_or_else(|| Error::UndefinedLabel(fixup.label.clone()))?;

            let next_instruction = fixup.fixup_position + fixup.offset_size as usize;
            let next_instruction = i64::try_from(next_instruction)
                .map_err(|_| malformed_error!("Instruction position exceeds i64 range"))?;
            let distance = i64::from(*label_position) - next_instruction;

            let start = fixup.fixup_position;
            if fixup.offset_size == 1 {
                let short = i8::try_from(distance).map_err(|_| {
                    Error::InvalidBranch(format!(
                        "branch to '{}' spans {} bytes, too far for a short form",
                        fixup.label, distance
                    ))
                })?;
                self.bytecode[start] = short.to_le_bytes()[0];
            } else {
                let long = i32::try_from(distance).map_err(|_| {
                    Error::InvalidBranch(format!("branch to '{}' out of range", fixup.label))
                })?;
                self.bytecode[start..start + 4].copy_from_slice(&long.to_le_bytes());
            }
        }

        Ok((self.bytecode, self.max_stack_depth, self.labels))
    }

    fn emit_indexed(&mut self, short: &str, long: &str, index: u16) -> Result<()> {
        match u8::try_from(index) {
            Ok(small) => {
                self.emit_instruction(short, Some(Operand::Immediate(Immediate::UInt8(small))))
            }
            Err(_) => {
                self.emit_instruction(long, Some(Operand::Immediate(Immediate::UInt16(index))))
            }
        }
    }

    fn emit_opcode(&mut self, mnemonic: &str) -> Result<&'static CilInstruction<'static>> {
        let (opcode, prefix, metadata) = lookup(mnemonic)?;
        if prefix != 0 {
            self.bytecode.push(prefix);
        }
        self.bytecode.push(opcode);
        Ok(metadata)
    }

    fn emit_operand(&mut self, operand: Option<Operand>, expected: OperandType) -> Result<()> {
        let operand = operand.unwrap_or(Operand::None);

        match (expected, operand) {
            (OperandType::None, Operand::None) => {}
            (OperandType::Int8, Operand::Immediate(Immediate::Int8(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::UInt8, Operand::Immediate(Immediate::UInt8(v))) => self.bytecode.push(v),
            (OperandType::Int16, Operand::Immediate(Immediate::Int16(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::UInt16, Operand::Immediate(Immediate::UInt16(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::Int32, Operand::Immediate(Immediate::Int32(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::UInt32, Operand::Immediate(Immediate::UInt32(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::Int64, Operand::Immediate(Immediate::Int64(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::UInt64, Operand::Immediate(Immediate::UInt64(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::Float32, Operand::Immediate(Immediate::Float32(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::Float64, Operand::Immediate(Immediate::Float64(v))) => {
                self.bytecode.extend_from_slice(&v.to_le_bytes());
            }
            (OperandType::Token, Operand::Token(token)) => {
                self.bytecode.extend_from_slice(&token.value().to_le_bytes());
            }
            (OperandType::Switch, Operand::Switch(targets)) => {
                let count = u32::try_from(targets.len())
                    .map_err(|_| malformed_error!("Too many switch targets"))?;
                self.bytecode.extend_from_slice(&count.to_le_bytes());
                for target in targets {
                    self.bytecode.extend_from_slice(&target.to_le_bytes());
                }
            }
            (expected, operand) => {
                return Err(malformed_error!(
                    "Operand {:?} does not match expected type {:?}",
                    operand,
                    expected
                ))
            }
        }

        Ok(())
    }

    fn update_stack_depth(&mut self, pops: u8, pushes: u8) -> Result<()> {
        if self.unreachable {
            return Ok(());
        }

        let pops = i16::from(pops);
        if self.current_stack_depth < pops {
            return Err(malformed_error!(
                "Stack underflow: depth {}, popping {}",
                self.current_stack_depth,
                pops
            ));
        }

        self.current_stack_depth = self.current_stack_depth - pops + i16::from(pushes);

        let depth = u16::try_from(self.current_stack_depth)
            .map_err(|_| malformed_error!("Negative stack depth"))?;
        self.max_stack_depth = self.max_stack_depth.max(depth);
        Ok(())
    }

    fn record_label_stack_depth(&mut self, label: &str) -> Result<()> {
        if self.unreachable {
            return Ok(());
        }

        match self.label_stack_depths.get(label) {
            Some(&expected) if expected != self.current_stack_depth => Err(malformed_error!(
                "Stack depth mismatch for branch to '{}': expected {}, got {}",
                label,
                expected,
                self.current_stack_depth
            )),
            Some(_) => Ok(()),
            None => {
                self.label_stack_depths
                    .insert(label.to_string(), self.current_stack_depth);
                Ok(())
            }
        }
    }
}

impl Default for InstructionEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup(mnemonic: &str) -> Result<OpcodeEntry> {
    mnemonic_lookup()
        .get(mnemonic)
        .copied()
        .ok_or_else(|| Error::InvalidMnemonic(mnemonic.to_string()))
}
