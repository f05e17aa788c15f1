//! Shared fixtures for unit tests.
//!
//! [`calculator_module`] builds one module that covers every shape the weaver has to tell
//! apart: plain classes, a derived class, a value type, an interface, an enum, a delegate, an
//! explicit-layout struct, a compiler-generated closure class and a nested private type.

use crate::{
    assembly::Operand,
    metadata::{
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes},
        identity::ModuleVersion,
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBodyBuilder},
        module::{MemberSig, Module},
        signatures::{MethodSignature, TypeSig},
        token::Token,
    },
};

pub const CALCULATOR_MODULE: &str = "Calculator";
pub const CALCULATOR_TYPE: &str = "Demo.Calculator";
pub const SCIENTIFIC_TYPE: &str = "Demo.ScientificCalculator";
pub const POINT_TYPE: &str = "Demo.Point";

/// Methods of the fixture the weaver must rewrite.
pub const ELIGIBLE_METHODS: &[&str] = &[
    "Demo.Calculator::Add",
    "Demo.Calculator::AddOffset",
    "Demo.Calculator::SetOffset",
    "Demo.Calculator::Max",
    "Demo.Calculator::Touch",
    "Demo.Calculator::Describe",
    "Demo.Calculator::Guarded",
    "Demo.Calculator::First",
    "Demo.ScientificCalculator::Square",
    "Demo.Point::Sum",
];

const PUBLIC_STATIC: MethodAttributes = MethodAttributes::PUBLIC
    .union(MethodAttributes::STATIC)
    .union(MethodAttributes::HIDE_BY_SIG);
const PUBLIC_INSTANCE: MethodAttributes =
    MethodAttributes::PUBLIC.union(MethodAttributes::HIDE_BY_SIG);
const CTOR: MethodAttributes = MethodAttributes::PUBLIC
    .union(MethodAttributes::HIDE_BY_SIG)
    .union(MethodAttributes::SPECIAL_NAME)
    .union(MethodAttributes::RT_SPECIAL_NAME);

/// Looks up a method by `Namespace.Type::Name`.
pub fn method_token(module: &Module, full_name: &str) -> Token {
    module
        .methods
        .iter()
        .find(|m| module.method_full_name(m.token).as_deref() == Some(full_name))
        .map(|m| m.token)
        .unwrap_or_else(|| panic!("fixture has no method {full_name}"))
}

/// Looks up a type by full name.
pub fn type_token(module: &Module, full_name: &str) -> Token {
    module
        .find_type_by_full_name(full_name)
        .map(|t| t.token)
        .unwrap_or_else(|| panic!("fixture has no type {full_name}"))
}

fn add_simple(
    module: &mut Module,
    declaring: Token,
    name: &str,
    flags: MethodAttributes,
    signature: MethodSignature,
    f: impl FnOnce(&mut crate::assembly::InstructionEncoder) -> crate::Result<()> + 'static,
) -> Token {
    let body = MethodBodyBuilder::new().implementation(f).build().unwrap();
    module
        .add_method(
            declaring,
            name,
            flags,
            MethodImplAttributes::IL,
            signature,
            Some(body),
        )
        .unwrap()
}

/// The calculator fixture.
pub fn calculator_module() -> Module {
    let mut module = Module::new(CALCULATOR_MODULE, ModuleVersion::new(1, 0, 0, 0));

    let object = module.import_core_type("System", "Object");
    let value_type = module.import_core_type("System", "ValueType");
    let system_enum = module.import_core_type("System", "Enum");
    let multicast = module.import_core_type("System", "MulticastDelegate");
    let compiler_generated =
        module.import_core_type("System.Runtime.CompilerServices", "CompilerGeneratedAttribute");
    let object_ctor = module.add_member_ref(
        object,
        ".ctor",
        MemberSig::Method(MethodSignature::new_instance(TypeSig::Void, vec![])),
    );
    let description = module.add_user_string("calculator").unwrap();

    // Demo.Calculator
    let calc = module.add_type(
        "Demo",
        "Calculator",
        TypeAttributes::PUBLIC | TypeAttributes::BEFORE_FIELD_INIT,
        Some(object),
    );
    let offset = module
        .add_field(calc, "offset", FieldAttributes::PRIVATE, TypeSig::I4)
        .unwrap();

    let calc_ctor = add_simple(
        &mut module,
        calc,
        ".ctor",
        CTOR,
        MethodSignature::new_instance(TypeSig::Void, vec![]),
        move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_call("call", Some(Operand::Token(object_ctor)), 1, false)?;
            asm.emit_ldarg(0)?;
            asm.emit_ldc_i4(0)?;
            asm.emit_instruction("stfld", Some(Operand::Token(offset)))?;
            asm.emit_ret(false)
        },
    );
    add_simple(
        &mut module,
        calc,
        "Add",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
        |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_ldarg(1)?;
            asm.emit_instruction("add", None)?;
            asm.emit_ret(true)
        },
    );
    add_simple(
        &mut module,
        calc,
        "AddOffset",
        PUBLIC_INSTANCE,
        MethodSignature::new_instance(TypeSig::I4, vec![TypeSig::I4]),
        move |asm| {
            asm.emit_ldarg(1)?;
            asm.emit_ldarg(0)?;
            asm.emit_instruction("ldfld", Some(Operand::Token(offset)))?;
            asm.emit_instruction("add", None)?;
            asm.emit_ret(true)
        },
    );
    add_simple(
        &mut module,
        calc,
        "SetOffset",
        PUBLIC_INSTANCE,
        MethodSignature::new_instance(TypeSig::Void, vec![TypeSig::I4]),
        move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_ldarg(1)?;
            asm.emit_instruction("stfld", Some(Operand::Token(offset)))?;
            asm.emit_ret(false)
        },
    );
    add_simple(
        &mut module,
        calc,
        "Max",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
        |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_ldarg(1)?;
            asm.emit_branch("ble.s", "second")?;
            asm.emit_ldarg(0)?;
            asm.emit_ret(true)?;
            asm.define_label("second")?;
            asm.emit_ldarg(1)?;
            asm.emit_ret(true)
        },
    );
    add_simple(
        &mut module,
        calc,
        "Touch",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::Void, vec![]),
        |asm| asm.emit_ret(false),
    );
    add_simple(
        &mut module,
        calc,
        "Describe",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::String, vec![]),
        move |asm| {
            asm.emit_instruction("ldstr", Some(Operand::Token(description)))?;
            asm.emit_ret(true)
        },
    );

    // try { result = value; } finally { } return result;
    let guarded = MethodBodyBuilder::new()
        .local(TypeSig::I4)
        .exception_handler(ExceptionHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_offset: 0,
            try_length: 4,
            handler_offset: 4,
            handler_length: 1,
            filter_offset: 0,
        })
        .implementation(|asm| {
            asm.emit_ldarg(0)?;
            asm.emit_stloc(0)?;
            asm.emit_branch("leave.s", "end")?;
            asm.emit_instruction("endfinally", None)?;
            asm.define_label("end")?;
            asm.emit_ldloc(0)?;
            asm.emit_ret(true)
        })
        .build()
        .unwrap();
    module
        .add_method(
            calc,
            "Guarded",
            PUBLIC_STATIC,
            MethodImplAttributes::IL,
            MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4]),
            Some(guarded),
        )
        .unwrap();

    add_simple(
        &mut module,
        calc,
        "First",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![TypeSig::SzArray(Box::new(TypeSig::I4))]),
        |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_ldc_i4(0)?;
            asm.emit_instruction("ldelem.i4", None)?;
            asm.emit_ret(true)
        },
    );
    add_simple(
        &mut module,
        calc,
        "Hidden",
        MethodAttributes::STATIC,
        MethodSignature::new_static(TypeSig::Void, vec![]),
        |asm| asm.emit_ret(false),
    );

    // Demo.Calculator/Cache
    let cache = module
        .add_nested_type(calc, "Cache", TypeAttributes::NESTED_PRIVATE, Some(object))
        .unwrap();
    add_simple(
        &mut module,
        cache,
        "Hit",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![]),
        |asm| {
            asm.emit_ldc_i4(1)?;
            asm.emit_ret(true)
        },
    );

    // Demo.ScientificCalculator : Demo.Calculator
    let scientific = module.add_type(
        "Demo",
        "ScientificCalculator",
        TypeAttributes::PUBLIC,
        Some(calc),
    );
    add_simple(
        &mut module,
        scientific,
        ".ctor",
        CTOR,
        MethodSignature::new_instance(TypeSig::Void, vec![]),
        move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_call("call", Some(Operand::Token(calc_ctor)), 1, false)?;
            asm.emit_ret(false)
        },
    );
    add_simple(
        &mut module,
        scientific,
        "Square",
        PUBLIC_INSTANCE,
        MethodSignature::new_instance(TypeSig::I4, vec![TypeSig::I4]),
        |asm| {
            asm.emit_ldarg(1)?;
            asm.emit_instruction("dup", None)?;
            asm.emit_instruction("mul", None)?;
            asm.emit_ret(true)
        },
    );

    // Demo.Point
    let point = module.add_type(
        "Demo",
        "Point",
        TypeAttributes::PUBLIC | TypeAttributes::SEQUENTIAL_LAYOUT | TypeAttributes::SEALED,
        Some(value_type),
    );
    let x = module
        .add_field(point, "X", FieldAttributes::PUBLIC, TypeSig::I4)
        .unwrap();
    let y = module
        .add_field(point, "Y", FieldAttributes::PUBLIC, TypeSig::I4)
        .unwrap();
    add_simple(
        &mut module,
        point,
        "Sum",
        PUBLIC_INSTANCE,
        MethodSignature::new_instance(TypeSig::I4, vec![]),
        move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_instruction("ldfld", Some(Operand::Token(x)))?;
            asm.emit_ldarg(0)?;
            asm.emit_instruction("ldfld", Some(Operand::Token(y)))?;
            asm.emit_instruction("add", None)?;
            asm.emit_ret(true)
        },
    );

    // Demo.IShape
    let shape = module.add_type(
        "Demo",
        "IShape",
        TypeAttributes::PUBLIC | TypeAttributes::INTERFACE | TypeAttributes::ABSTRACT,
        None,
    );
    module
        .add_method(
            shape,
            "Area",
            PUBLIC_INSTANCE
                | MethodAttributes::VIRTUAL
                | MethodAttributes::NEW_SLOT
                | MethodAttributes::ABSTRACT,
            MethodImplAttributes::IL,
            MethodSignature::new_instance(TypeSig::I4, vec![]),
            None,
        )
        .unwrap();

    // Demo.Color
    let color = module.add_type(
        "Demo",
        "Color",
        TypeAttributes::PUBLIC | TypeAttributes::SEALED,
        Some(system_enum),
    );
    module
        .add_field(
            color,
            "value__",
            FieldAttributes::PUBLIC | FieldAttributes::SPECIAL_NAME,
            TypeSig::I4,
        )
        .unwrap();

    // Demo.Callback
    let callback = module.add_type(
        "Demo",
        "Callback",
        TypeAttributes::PUBLIC | TypeAttributes::SEALED,
        Some(multicast),
    );
    module
        .add_method(
            callback,
            "Invoke",
            PUBLIC_INSTANCE | MethodAttributes::VIRTUAL,
            MethodImplAttributes::RUNTIME,
            MethodSignature::new_instance(TypeSig::I4, vec![TypeSig::I4]),
            None,
        )
        .unwrap();

    // Demo.Overlay
    let overlay = module.add_type(
        "Demo",
        "Overlay",
        TypeAttributes::PUBLIC | TypeAttributes::EXPLICIT_LAYOUT | TypeAttributes::SEALED,
        Some(value_type),
    );
    add_simple(
        &mut module,
        overlay,
        "Zero",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![]),
        |asm| {
            asm.emit_ldc_i4(0)?;
            asm.emit_ret(true)
        },
    );

    // Demo.<>c
    let closure = module.add_type(
        "Demo",
        "<>c",
        TypeAttributes::SEALED | TypeAttributes::SERIALIZABLE,
        Some(object),
    );
    module
        .add_custom_attribute(closure, compiler_generated)
        .unwrap();
    add_simple(
        &mut module,
        closure,
        "<Run>b__0_0",
        MethodAttributes::ASSEM | MethodAttributes::HIDE_BY_SIG,
        MethodSignature::new_instance(TypeSig::I4, vec![]),
        |asm| {
            asm.emit_ldc_i4(1)?;
            asm.emit_ret(true)
        },
    );

    module
}

pub const APP_MODULE: &str = "App";

/// A root module whose `Demo.App.Program::Run` returns `Calculator.Add(2, 1)`.
pub fn app_module() -> Module {
    let mut module = Module::new(APP_MODULE, ModuleVersion::new(1, 0, 0, 0));
    let object = module.import_core_type("System", "Object");
    let scope = module.add_reference(CALCULATOR_MODULE, ModuleVersion::new(1, 0, 0, 0), None);
    let calculator = module.import_type_ref(scope, "Demo", "Calculator");
    let add = module.add_member_ref(
        calculator,
        "Add",
        MemberSig::Method(MethodSignature::new_static(
            TypeSig::I4,
            vec![TypeSig::I4, TypeSig::I4],
        )),
    );

    let program = module.add_type(
        "Demo.App",
        "Program",
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
        Some(object),
    );
    add_simple(
        &mut module,
        program,
        "Run",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![]),
        move |asm| {
            asm.emit_ldc_i4(2)?;
            asm.emit_ldc_i4(1)?;
            asm.emit_call("call", Some(Operand::Token(add)), 2, true)?;
            asm.emit_ret(true)
        },
    );

    module
}

/// Writes `App.dll`, `Calculator.dll` and the support module into `dir`, returns the root path.
pub fn write_closure(dir: &std::path::Path) -> std::path::PathBuf {
    let root = dir.join(format!("{APP_MODULE}.dll"));
    app_module().write(&root).unwrap();
    calculator_module()
        .write(&dir.join(format!("{CALCULATOR_MODULE}.dll")))
        .unwrap();
    crate::weaver::write_support_module(dir).unwrap();
    root
}
