//! Structural verification of rewritten modules.
//!
//! Before a patched module replaces the original file, the orchestrator re-reads the staged
//! temporary file and runs it through a [`Verifier`]. The default [`StructuralVerifier`] checks
//! every method body:
//!
//! - the code decodes completely and every branch lands on an instruction boundary
//! - token operands resolve to an existing row of a table the instruction accepts
//! - argument and local indices are in range
//! - the evaluation stack never underflows, agrees at join points, stays within `max_stack`
//!   and holds exactly the return value at `ret`
//! - control never falls off the end of the code
//! - exception handler ranges lie inside the code
//!
//! The checks are structural only; types on the evaluation stack are not tracked.
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilweave::verify::{StructuralVerifier, Verifier};
//! use std::path::Path;
//!
//! StructuralVerifier.verify(Path::new("Calculator.tmp"))?;
//! # Ok::<(), cilweave::Error>(())
//! ```

use std::{collections::HashMap, path::Path};

use crate::{
    assembly::{decode_stream, opcodes, FlowType, Instruction},
    metadata::{
        method::{ExceptionHandlerFlags, MethodBody},
        module::{MemberSig, MethodDef, Module},
        signatures::MethodSignature,
        token::{TableId, Token},
    },
    Error, Result,
};

/// A check run on a staged module file before it replaces the original.
pub trait Verifier {
    /// Checks the module stored at `path`.
    ///
    /// # Errors
    /// Returns [`Error::VerificationFailure`] naming `path` and the first violation.
    fn verify(&self, path: &Path) -> Result<()>;

    /// Name used in log output.
    fn name(&self) -> &'static str;
}

/// The default [`Verifier`], see the module documentation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralVerifier;

impl Verifier for StructuralVerifier {
    fn verify(&self, path: &Path) -> Result<()> {
        let failure = |error: Error| Error::VerificationFailure {
            path: path.display().to_string(),
            message: error.to_string(),
        };

        let module = Module::from_file(path).map_err(failure)?;
        verify_module(&module).map_err(failure)?;

        log::debug!("{} passed {}", path.display(), self.name());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "structural verification"
    }
}

/// Checks every method body of `module`.
///
/// # Errors
/// Returns [`Error::Malformed`] naming the method and the first violation found.
pub fn verify_module(module: &Module) -> Result<()> {
    for method in &module.methods {
        let Some(body) = &method.body else {
            continue;
        };

        verify_body(module, method, body).map_err(|error| {
            let name = module
                .method_full_name(method.token)
                .unwrap_or_else(|| method.token.to_string());
            malformed_error!("{}: {}", name, error)
        })?;
    }
    Ok(())
}

fn verify_body(module: &Module, method: &MethodDef, body: &MethodBody) -> Result<()> {
    let instructions = decode_stream(&body.code)?;
    if instructions.is_empty() {
        return Err(malformed_error!("Empty method body"));
    }

    let boundaries = instructions
        .iter()
        .enumerate()
        .map(|(index, instruction)| (instruction.offset, index))
        .collect::<HashMap<_, _>>();
    let code_len = body.code.len() as u64;

    for instruction in &instructions {
        for target in &instruction.branch_targets {
            if !boundaries.contains_key(target) {
                return Err(malformed_error!(
                    "{} targets IL_{:04x}, which is not an instruction boundary",
                    instruction,
                    target
                ));
            }
        }
        check_operand(module, method, body, instruction)?;
    }

    let mut entries = vec![(0_usize, 0_u16)];
    for handler in &body.exception_handlers {
        let is_boundary = |offset: u64| offset == code_len || boundaries.contains_key(&offset);
        let try_end = u64::from(handler.try_offset) + u64::from(handler.try_length);
        let handler_end = u64::from(handler.handler_offset) + u64::from(handler.handler_length);
        if !is_boundary(u64::from(handler.try_offset))
            || !is_boundary(try_end)
            || !is_boundary(u64::from(handler.handler_offset))
            || !is_boundary(handler_end)
            || try_end > code_len
            || handler_end > code_len
        {
            return Err(malformed_error!(
                "Exception handler {:?} lies outside the code",
                handler
            ));
        }

        let handler_depth = u16::from(!handler.flags.intersects(
            ExceptionHandlerFlags::FINALLY | ExceptionHandlerFlags::FAULT,
        ));
        if let Some(index) = boundaries.get(&u64::from(handler.handler_offset)) {
            entries.push((*index, handler_depth));
        }
        if handler.flags.contains(ExceptionHandlerFlags::FILTER) {
            match boundaries.get(&u64::from(handler.filter_offset)) {
                Some(index) => entries.push((*index, 1)),
                None => {
                    return Err(malformed_error!(
                        "Filter at IL_{:04x} is not an instruction boundary",
                        handler.filter_offset
                    ))
                }
            }
        }
    }

    check_stack(module, method, body, &instructions, &boundaries, entries)
}

fn check_operand(
    module: &Module,
    method: &MethodDef,
    body: &MethodBody,
    instruction: &Instruction,
) -> Result<()> {
    let arg_count = method.signature.arg_count();

    if instruction.prefix == 0 && instruction.opcode == opcodes::CALLI {
        return Err(malformed_error!("{}: indirect calls are not supported", instruction));
    }

    if let Some(token) = instruction.get_token_operand() {
        let allowed: &[TableId] = match instruction.mnemonic {
            "call" | "callvirt" | "newobj" | "jmp" | "ldftn" | "ldvirtftn" => {
                &[TableId::MethodDef, TableId::MemberRef]
            }
            "ldfld" | "ldflda" | "stfld" | "ldsfld" | "ldsflda" | "stsfld" => {
                &[TableId::Field, TableId::MemberRef]
            }
            "ldstr" => &[TableId::UserString],
            "ldtoken" => &[
                TableId::TypeDef,
                TableId::TypeRef,
                TableId::TypeSpec,
                TableId::MethodDef,
                TableId::MemberRef,
                TableId::Field,
            ],
            _ => &[TableId::TypeDef, TableId::TypeRef, TableId::TypeSpec],
        };

        let table_ok = token.table_id().is_some_and(|table| allowed.contains(&table));
        if !table_ok || !module.contains_token(token) {
            return Err(malformed_error!(
                "{} references an invalid token",
                instruction
            ));
        }
    }

    match (instruction.prefix, instruction.opcode) {
        (0, opcodes::LDARG_0..=opcodes::LDARG_3) => {
            check_index(instruction, usize::from(instruction.opcode - opcodes::LDARG_0), arg_count)
        }
        (0, opcodes::LDLOC_0..=opcodes::LDLOC_3) => check_index(
            instruction,
            usize::from(instruction.opcode - opcodes::LDLOC_0),
            body.locals.len(),
        ),
        (0, opcodes::STLOC_0..=opcodes::STLOC_3) => check_index(
            instruction,
            usize::from(instruction.opcode - opcodes::STLOC_0),
            body.locals.len(),
        ),
        (0, opcodes::LDARG_S | opcodes::LDARGA_S | opcodes::STARG_S)
        | (opcodes::FE_PREFIX, opcodes::FE_LDARG | opcodes::FE_LDARGA | opcodes::FE_STARG) => {
            check_index(instruction, index_operand(instruction)?, arg_count)
        }
        (0, opcodes::LDLOC_S | opcodes::LDLOCA_S | opcodes::STLOC_S)
        | (opcodes::FE_PREFIX, opcodes::FE_LDLOC | opcodes::FE_LDLOCA | opcodes::FE_STLOC) => {
            check_index(instruction, index_operand(instruction)?, body.locals.len())
        }
        _ => Ok(()),
    }
}

fn index_operand(instruction: &Instruction) -> Result<usize> {
    instruction
        .get_index_operand()
        .map(usize::from)
        .ok_or_else(|| malformed_error!("{} lacks its index operand", instruction))
}

fn check_index(instruction: &Instruction, index: usize, count: usize) -> Result<()> {
    if index < count {
        Ok(())
    } else {
        Err(malformed_error!(
            "{} uses index {} but only {} are declared",
            instruction,
            index,
            count
        ))
    }
}

/// Signature of the method a call token refers to.
pub(crate) fn callee_signature(module: &Module, token: Token) -> Option<&MethodSignature> {
    match token.table_id()? {
        TableId::MethodDef => module.method(token).map(|m| &m.signature),
        TableId::MemberRef => match &module.member_ref(token)?.signature {
            MemberSig::Method(signature) => Some(signature),
            MemberSig::Field(_) => None,
        },
        _ => None,
    }
}

fn stack_effect(
    module: &Module,
    method: &MethodDef,
    instruction: &Instruction,
) -> Result<(u16, u16)> {
    let callee = || {
        instruction
            .get_token_operand()
            .and_then(|token| callee_signature(module, token))
            .ok_or_else(|| malformed_error!("{} does not reference a method", instruction))
    };

    match instruction.mnemonic {
        "call" | "callvirt" => {
            let signature = callee()?;
            let pops = u16::try_from(signature.arg_count())
                .map_err(|_| malformed_error!("{} takes too many arguments", instruction))?;
            Ok((pops, u16::from(!signature.ret.is_void())))
        }
        "newobj" => {
            let signature = callee()?;
            let pops = u16::try_from(signature.params.len())
                .map_err(|_| malformed_error!("{} takes too many arguments", instruction))?;
            Ok((pops, 1))
        }
        "ret" => Ok((u16::from(!method.signature.ret.is_void()), 0)),
        _ => Ok((
            u16::from(instruction.stack_behavior.pops),
            u16::from(instruction.stack_behavior.pushes),
        )),
    }
}

fn check_stack(
    module: &Module,
    method: &MethodDef,
    body: &MethodBody,
    instructions: &[Instruction],
    boundaries: &HashMap<u64, usize>,
    entries: Vec<(usize, u16)>,
) -> Result<()> {
    let mut depths: Vec<Option<u16>> = vec![None; instructions.len()];
    let mut worklist = Vec::new();

    for (index, depth) in entries {
        merge(&mut depths, &mut worklist, instructions, index, depth)?;
    }

    while let Some(index) = worklist.pop() {
        let instruction = &instructions[index];
        let depth = depths[index].unwrap_or_default();
        let (pops, pushes) = stack_effect(module, method, instruction)?;

        if depth < pops {
            return Err(malformed_error!("Stack underflow at {}", instruction));
        }
        let after = depth - pops + pushes;
        if after > body.max_stack {
            return Err(malformed_error!(
                "Stack depth {} exceeds max stack {} at {}",
                after,
                body.max_stack,
                instruction
            ));
        }
        if instruction.mnemonic == "ret" && after != 0 {
            return Err(malformed_error!(
                "{} leaves {} values on the stack",
                instruction,
                after
            ));
        }

        let successor_depth = if instruction.flow_type == FlowType::Leave {
            0
        } else {
            after
        };
        for target in &instruction.branch_targets {
            if let Some(target_index) = boundaries.get(target) {
                merge(
                    &mut depths,
                    &mut worklist,
                    instructions,
                    *target_index,
                    successor_depth,
                )?;
            }
        }

        if !instruction.is_terminal() {
            if index + 1 >= instructions.len() {
                return Err(malformed_error!(
                    "Control falls off the end of the code after {}",
                    instruction
                ));
            }
            merge(&mut depths, &mut worklist, instructions, index + 1, after)?;
        }
    }

    Ok(())
}

fn merge(
    depths: &mut [Option<u16>],
    worklist: &mut Vec<usize>,
    instructions: &[Instruction],
    index: usize,
    depth: u16,
) -> Result<()> {
    match depths[index] {
        Some(existing) if existing != depth => Err(malformed_error!(
            "Inconsistent stack depth at {}: {} and {}",
            instructions[index],
            existing,
            depth
        )),
        Some(_) => Ok(()),
        None => {
            depths[index] = Some(depth);
            worklist.push(index);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test::{calculator_module, method_token},
        weaver::{support::build_support_module, MockInjector},
    };

    fn with_code(code: Vec<u8>, max_stack: u16) -> Module {
        let mut module = calculator_module();
        let add = method_token(&module, "Demo.Calculator::Add");
        module.method_mut(add).unwrap().body = Some(MethodBody::new(code, max_stack));
        module
    }

    fn message(module: &Module) -> String {
        match verify_module(module) {
            Err(Error::Malformed { message, .. }) => message,
            other => panic!("expected a violation, got {other:?}"),
        }
    }

    #[test]
    fn fixture_and_patched_fixture_pass() {
        let mut module = calculator_module();
        verify_module(&module).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let support = build_support_module().unwrap();
        let image = support.to_bytes().unwrap();
        MockInjector::from_support(&support, &image, dir.path())
            .unwrap()
            .patch(&mut module, &[])
            .unwrap();
        verify_module(&module).unwrap();
    }

    #[test]
    fn stack_violations() {
        // ldarg.0, add, ret
        let msg = message(&with_code(vec![0x02, 0x58, 0x2A], 8));
        assert!(msg.contains("Demo.Calculator::Add"), "{msg}");
        assert!(msg.contains("underflow"), "{msg}");

        // ldarg.0, ldarg.1, ret
        assert!(message(&with_code(vec![0x02, 0x03, 0x2A], 8)).contains("leaves 1"));

        // ldarg.0, ldarg.1, add, ret with max stack 1
        assert!(message(&with_code(vec![0x02, 0x03, 0x58, 0x2A], 1)).contains("exceeds"));

        // ldarg.0, ldarg.1, add
        assert!(message(&with_code(vec![0x02, 0x03, 0x58], 8)).contains("falls off"));
    }

    #[test]
    fn join_points_must_agree() {
        // ldarg.0, brtrue.s +1, ldarg.1, ldarg.0, ret
        let msg = message(&with_code(vec![0x02, 0x2D, 0x01, 0x03, 0x02, 0x2A], 8));
        assert!(msg.contains("Inconsistent"), "{msg}");
    }

    #[test]
    fn operand_violations() {
        // br.s into the middle of ldc.i4
        let msg = message(&with_code(vec![0x2B, 0x01, 0x20, 0, 0, 0, 0, 0x2A], 8));
        assert!(msg.contains("boundary"), "{msg}");

        // ldarg.2 in a method with two parameters
        assert!(message(&with_code(vec![0x04, 0x2A], 8)).contains("index 2"));

        // ldloc.0 without locals
        assert!(message(&with_code(vec![0x06, 0x2A], 8)).contains("index 0"));

        // ldstr with a method token
        let add = method_token(&calculator_module(), "Demo.Calculator::Add");
        let mut code = vec![0x72];
        code.extend_from_slice(&add.value().to_le_bytes());
        code.push(0x2A);
        assert!(message(&with_code(code, 8)).contains("invalid token"));

        // call to a row that does not exist
        let mut code = vec![0x28];
        code.extend_from_slice(&Token::from_parts(TableId::MethodDef, 0x400).value().to_le_bytes());
        code.push(0x2A);
        assert!(message(&with_code(code, 8)).contains("invalid token"));
    }

    #[test]
    fn handler_outside_code() {
        let mut module = calculator_module();
        let guarded = method_token(&module, "Demo.Calculator::Guarded");
        let body = module.method_mut(guarded).unwrap().body.as_mut().unwrap();
        body.exception_handlers[0].handler_length = 40;
        assert!(message(&module).contains("outside the code"));
    }

    #[test]
    fn verifier_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Calculator.tmp");

        let module = with_code(vec![0x02, 0x58, 0x2A], 8);
        module.write(&path).unwrap();

        match StructuralVerifier.verify(&path) {
            Err(Error::VerificationFailure { path: reported, message }) => {
                assert_eq!(reported, path.display().to_string());
                assert!(message.contains("underflow"), "{message}");
            }
            other => panic!("unexpected result {other:?}"),
        }

        std::fs::write(&path, b"not a module").unwrap();
        assert!(matches!(
            StructuralVerifier.verify(&path),
            Err(Error::VerificationFailure { .. })
        ));
    }
}
