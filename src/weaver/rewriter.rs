//! Interception prologues.
//!
//! [`rewrite_method`] replaces a method body with a prologue followed by the original code:
//!
//! ```text
//! ldtoken      <declaring type>
//! call         Type::GetTypeFromHandle
//! ldarg.0      (ldnull for static and value type methods)
//! ldtoken      <return type>
//! call         Type::GetTypeFromHandle
//! ldloca       <new object local>
//! ldtoken      <method>
//! call         MethodBase::GetMethodFromHandle
//! ldc.i4       <parameter count>
//! newarr       object
//!   dup; ldc.i4 i; ldarg i; [box T]; stelem.ref      (per parameter)
//! call         PatchedAssemblyBridge::TryMock
//! brfalse.s    ORIGINAL
//! ldloc        <new object local>                   (not for void)
//! unbox.any    <return type>                        (not for void)
//! ret
//! ORIGINAL:
//! <original code, unchanged>
//! ```
//!
//! Existing instruction bytes are copied verbatim, so every relative branch in them stays valid;
//! only exception handler offsets move by the prologue length.

use crate::{
    assembly::{decode_stream, InstructionEncoder, Operand},
    metadata::{
        method::MethodBody,
        module::{MemberSig, Module},
        signatures::{MethodSignature, TypeSig},
        token::{TableId, Token},
    },
    weaver::support::{
        bridge_signature, SupportIdentity, BRIDGE_METHOD_NAME, BRIDGE_TYPE_NAME,
        PLACEHOLDER_TYPE_NAME, SUPPORT_NAMESPACE,
    },
    Error, Result,
};

const ORIGINAL_LABEL: &str = "original";

/// The member references a rewritten module needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeImports {
    /// `System.Object`
    pub object: Token,
    /// `System.Type::GetTypeFromHandle`
    pub get_type_from_handle: Token,
    /// `System.Reflection.MethodBase::GetMethodFromHandle`
    pub get_method_from_handle: Token,
    /// `Cilweave.Elevated.PatchedAssemblyBridge::TryMock`
    pub try_mock: Token,
    /// `Cilweave.Elevated.MockPlaceholderType`
    pub placeholder: Token,
}

impl BridgeImports {
    /// Imports the bridge members into `module`, reusing existing imports.
    pub fn import(module: &mut Module, support: &SupportIdentity) -> Self {
        let object = module.import_core_type("System", "Object");
        let system_type = module.import_core_type("System", "Type");
        let type_handle = module.import_core_type("System", "RuntimeTypeHandle");
        let method_base = module.import_core_type("System.Reflection", "MethodBase");
        let method_handle = module.import_core_type("System", "RuntimeMethodHandle");

        let get_type_from_handle = module.add_member_ref(
            system_type,
            "GetTypeFromHandle",
            MemberSig::Method(MethodSignature::new_static(
                TypeSig::Class(system_type),
                vec![TypeSig::ValueType(type_handle)],
            )),
        );
        let get_method_from_handle = module.add_member_ref(
            method_base,
            "GetMethodFromHandle",
            MemberSig::Method(MethodSignature::new_static(
                TypeSig::Class(method_base),
                vec![TypeSig::ValueType(method_handle)],
            )),
        );

        let scope = module.add_reference(&support.name, support.version, support.public_key_token);
        let bridge = module.import_type_ref(scope, SUPPORT_NAMESPACE, BRIDGE_TYPE_NAME);
        let placeholder = module.import_type_ref(scope, SUPPORT_NAMESPACE, PLACEHOLDER_TYPE_NAME);
        let try_mock = module.add_member_ref(
            bridge,
            BRIDGE_METHOD_NAME,
            MemberSig::Method(bridge_signature(
                TypeSig::Class(system_type),
                TypeSig::Class(method_base),
            )),
        );

        BridgeImports {
            object,
            get_type_from_handle,
            get_method_from_handle,
            try_mock,
            placeholder,
        }
    }
}

/// Inserts the interception prologue into the method `token`.
///
/// # Errors
/// Every failure is reported as [`Error::RewriteFailure`] naming the method and its declaring
/// type: a missing body, an undecodable instruction stream, or a body too large to extend.
pub fn rewrite_method(module: &mut Module, token: Token, imports: &BridgeImports) -> Result<()> {
    let body = build_body(module, token, imports).map_err(|error| {
        let type_name = module
            .method(token)
            .and_then(|m| module.type_full_name(m.declaring))
            .unwrap_or_else(|| "<unknown>".to_string());
        let method_name = module
            .method(token)
            .map_or_else(|| token.to_string(), |m| format!("{} ({})", m.name, token));
        error.in_method(&type_name, &method_name)
    })?;

    let method = module.method_mut(token).ok_or(Error::TokenNotFound(token))?;
    method.body = Some(body);
    log::debug!(
        "Rewrote {}",
        module
            .method_full_name(token)
            .unwrap_or_else(|| token.to_string())
    );
    Ok(())
}

/// Returns `true` if the type `token` of `module` derives from `System.ValueType` or
/// `System.Enum`.
pub(crate) fn is_value_type(module: &Module, token: Token) -> bool {
    module
        .type_def(token)
        .and_then(|t| t.extends)
        .and_then(|base| module.type_full_name(base))
        .is_some_and(|base| base == "System.ValueType" || base == "System.Enum")
}

/// How one parameter is stored in the argument array.
enum Packaging {
    Reference,
    Boxed(Token),
    Indirect { element: Token, boxed: bool },
}

fn build_body(module: &mut Module, token: Token, imports: &BridgeImports) -> Result<MethodBody> {
    let method = module.method(token).ok_or(Error::TokenNotFound(token))?;
    let original = method
        .body
        .clone()
        .ok_or_else(|| malformed_error!("Method {} has no body", token))?;
    let signature = method.signature.clone();
    let declaring = method.declaring;

    decode_stream(&original.code)?;

    let pass_instance = signature.has_this && !is_value_type(module, declaring);
    let return_type = module.import_type_sig(&signature.ret);
    let packaging = signature
        .params
        .iter()
        .map(|param| match param {
            TypeSig::ByRef(element) => Packaging::Indirect {
                element: module.import_type_sig(element),
                boxed: element.is_value_type(),
            },
            other if other.is_value_type() => Packaging::Boxed(module.import_type_sig(other)),
            _ => Packaging::Reference,
        })
        .collect::<Vec<_>>();

    let out_local = u16::try_from(original.locals.len())
        .ok()
        .filter(|index| *index < u16::MAX)
        .ok_or_else(|| malformed_error!("Method {} has too many locals", token))?;
    let param_count = i32::try_from(packaging.len())
        .map_err(|_| malformed_error!("Method {} has too many parameters", token))?;

    let mut asm = InstructionEncoder::new();

    asm.emit_instruction("ldtoken", Some(Operand::Token(declaring)))?;
    asm.emit_call(
        "call",
        Some(Operand::Token(imports.get_type_from_handle)),
        1,
        true,
    )?;
    if pass_instance {
        asm.emit_ldarg(0)?;
    } else {
        asm.emit_instruction("ldnull", None)?;
    }
    asm.emit_instruction("ldtoken", Some(Operand::Token(return_type)))?;
    asm.emit_call(
        "call",
        Some(Operand::Token(imports.get_type_from_handle)),
        1,
        true,
    )?;
    asm.emit_ldloca(out_local)?;
    asm.emit_instruction("ldtoken", Some(Operand::Token(token)))?;
    asm.emit_call(
        "call",
        Some(Operand::Token(imports.get_method_from_handle)),
        1,
        true,
    )?;

    asm.emit_ldc_i4(param_count)?;
    asm.emit_instruction("newarr", Some(Operand::Token(imports.object)))?;
    for (index, packaging) in (0_i32..).zip(packaging.iter()) {
        let arg = u16::try_from(index + i32::from(signature.has_this))
            .map_err(|_| malformed_error!("Argument index {} out of range", index))?;

        asm.emit_instruction("dup", None)?;
        asm.emit_ldc_i4(index)?;
        asm.emit_ldarg(arg)?;
        match packaging {
            Packaging::Reference => {}
            Packaging::Boxed(value_type) => {
                asm.emit_instruction("box", Some(Operand::Token(*value_type)))?;
            }
            Packaging::Indirect { element, boxed } => {
                asm.emit_instruction("ldobj", Some(Operand::Token(*element)))?;
                if *boxed {
                    asm.emit_instruction("box", Some(Operand::Token(*element)))?;
                }
            }
        }
        asm.emit_instruction("stelem.ref", None)?;
    }

    asm.emit_call("call", Some(Operand::Token(imports.try_mock)), 6, true)?;
    asm.emit_branch("brfalse.s", ORIGINAL_LABEL)?;
    if signature.ret.is_void() {
        asm.emit_ret(false)?;
    } else {
        asm.emit_ldloc(out_local)?;
        asm.emit_instruction("unbox.any", Some(Operand::Token(return_type)))?;
        asm.emit_ret(true)?;
    }

    asm.define_label(ORIGINAL_LABEL)?;
    let prologue_length = asm.current_position()?;
    asm.emit_raw(&original.code);

    let (code, prologue_stack, _) = asm.finalize()?;

    let mut locals = original.locals;
    locals.push(TypeSig::Object);

    Ok(MethodBody {
        max_stack: original.max_stack.max(prologue_stack),
        init_locals: true,
        locals,
        code,
        exception_handlers: original
            .exception_handlers
            .iter()
            .map(|handler| handler.shifted(prologue_length))
            .collect(),
    })
}

/// Returns `true` if `token` references the bridge method of the support module.
pub(crate) fn is_bridge_call(module: &Module, token: Token) -> bool {
    if !token.is_table(TableId::MemberRef) {
        return false;
    }
    module.member_ref(token).is_some_and(|member| {
        member.name == BRIDGE_METHOD_NAME
            && module
                .type_full_name(member.parent)
                .is_some_and(|name| name == format!("{SUPPORT_NAMESPACE}.{BRIDGE_TYPE_NAME}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::Instruction,
        metadata::method::ExceptionHandlerFlags,
        test::{calculator_module, method_token},
        weaver::support::{build_support_module, SupportIdentity},
    };

    fn rewritten(name: &str) -> (Module, Token, MethodBody, Vec<Instruction>) {
        let mut module = calculator_module();
        let support = SupportIdentity::of(&build_support_module().unwrap());
        let imports = BridgeImports::import(&mut module, &support);
        let token = method_token(&module, name);
        let original = module.method(token).unwrap().body.clone().unwrap();

        rewrite_method(&mut module, token, &imports).unwrap();
        let body = module.method(token).unwrap().body.clone().unwrap();
        assert!(body.code.ends_with(&original.code));
        let instructions = decode_stream(&body.code).unwrap();
        (module, token, original, instructions)
    }

    fn mnemonics(instructions: &[Instruction]) -> Vec<&'static str> {
        instructions.iter().map(|i| i.mnemonic).collect()
    }

    #[test]
    fn static_method_with_two_parameters() {
        let (module, token, original, instructions) = rewritten("Demo.Calculator::Add");
        let body = module.method(token).unwrap().body.as_ref().unwrap();

        assert_eq!(
            &mnemonics(&instructions)[..18],
            &[
                "ldtoken", "call", "ldnull", "ldtoken", "call", "ldloca.s", "ldtoken", "call",
                "ldc.i4.2", "newarr", "dup", "ldc.i4.0", "ldarg.0", "box", "stelem.ref", "dup",
                "ldc.i4.1", "ldarg.1",
            ]
        );
        assert!(is_bridge_call(
            &module,
            instructions
                .iter()
                .filter(|i| i.mnemonic == "call")
                .nth(3)
                .and_then(Instruction::get_token_operand)
                .unwrap()
        ));
        assert_eq!(instructions[6].get_token_operand(), Some(token));

        // brfalse.s jumps over the handled path to the original code
        let branch = instructions.iter().find(|i| i.mnemonic == "brfalse.s").unwrap();
        let prologue_length = (body.code.len() - original.code.len()) as u64;
        assert_eq!(branch.branch_targets, vec![prologue_length]);

        assert_eq!(body.locals, vec![TypeSig::Object]);
        assert!(body.init_locals);
        assert_eq!(body.max_stack, 9);
    }

    #[test]
    fn void_method_has_no_unbox() {
        let (_, _, _, instructions) = rewritten("Demo.Calculator::Touch");
        let names = mnemonics(&instructions);
        assert!(!names.contains(&"unbox.any"));
        assert!(names.windows(2).any(|w| w == ["ldc.i4.0", "newarr"]));
        let branch = names.iter().position(|m| *m == "brfalse.s").unwrap();
        assert_eq!(names[branch + 1], "ret");
    }

    #[test]
    fn instance_methods_pass_this() {
        let (_, _, _, instructions) = rewritten("Demo.Calculator::AddOffset");
        assert_eq!(instructions[2].mnemonic, "ldarg.0");
        // the single parameter is argument 1
        let names = mnemonics(&instructions);
        assert!(names.windows(3).any(|w| w == ["ldc.i4.0", "ldarg.1", "box"]));

        let (_, _, _, instructions) = rewritten("Demo.Point::Sum");
        assert_eq!(instructions[2].mnemonic, "ldnull");
    }

    #[test]
    fn reference_parameters_are_not_boxed() {
        let (_, _, _, instructions) = rewritten("Demo.Calculator::First");
        let names = mnemonics(&instructions);
        assert!(names.windows(2).any(|w| w == ["ldarg.0", "stelem.ref"]));
    }

    #[test]
    fn exception_handlers_move() {
        let (module, token, original, _) = rewritten("Demo.Calculator::Guarded");
        let body = module.method(token).unwrap().body.as_ref().unwrap();
        let shift = (body.code.len() - original.code.len()) as u32;

        let handler = &body.exception_handlers[0];
        assert_eq!(handler.flags, ExceptionHandlerFlags::FINALLY);
        assert_eq!(handler.try_offset, shift);
        assert_eq!(handler.try_length, 4);
        assert_eq!(handler.handler_offset, shift + 4);
        assert_eq!(body.locals, vec![TypeSig::I4, TypeSig::Object]);
    }

    #[test]
    fn undecodable_body_names_the_method() {
        let mut module = calculator_module();
        let support = SupportIdentity::of(&build_support_module().unwrap());
        let imports = BridgeImports::import(&mut module, &support);
        let token = method_token(&module, "Demo.Calculator::Add");
        // `ldc.i4` cut short
        module.method_mut(token).unwrap().body.as_mut().unwrap().code = vec![0x20, 0x01];

        match rewrite_method(&mut module, token, &imports) {
            Err(Error::RewriteFailure {
                type_name, method, ..
            }) => {
                assert_eq!(type_name, "Demo.Calculator");
                assert!(method.starts_with("Add"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn imports_are_shared() {
        let mut module = calculator_module();
        let support = SupportIdentity::of(&build_support_module().unwrap());
        let first = BridgeImports::import(&mut module, &support);
        let refs = module.member_refs.len();
        let second = BridgeImports::import(&mut module, &support);
        assert_eq!(first, second);
        assert_eq!(module.member_refs.len(), refs);
        assert!(module
            .referenced_module_names()
            .any(|name| name == "Cilweave.Elevated"));
    }
}
