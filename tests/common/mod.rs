//! Sample modules for the integration tests, built with the public module API.
//!
//! `Store.dll` defines `Store.PriceList` (a plain class with state) and `Store.Checkout` (a
//! sealed class with one static entry point) and `Store.Counter`, whose `Seven` passes a local
//! by reference to `Peek`. `Store.Tests.dll` is the root: its
//! `Store.Tests.Program::Run` returns `Checkout.Total(100)` and it also references a module
//! that never exists on disk.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use cilweave::prelude::*;

pub const STORE: &str = "Store";
pub const STORE_TESTS: &str = "Store.Tests";
pub const VENDOR: &str = "Vendor.Logging";

pub const PRICE_LIST: &str = "Store.PriceList";
pub const CHECKOUT: &str = "Store.Checkout";
pub const COUNTER: &str = "Store.Counter";

/// `Checkout.Total(100)` on unpatched or unsubstituted code: `(100 + 2) + 100 / 10`.
pub const TOTAL_OF_100: i32 = 112;

const PUBLIC_STATIC: MethodAttributes = MethodAttributes::PUBLIC
    .union(MethodAttributes::STATIC)
    .union(MethodAttributes::HIDE_BY_SIG);
const PUBLIC_INSTANCE: MethodAttributes =
    MethodAttributes::PUBLIC.union(MethodAttributes::HIDE_BY_SIG);
const CTOR: MethodAttributes = MethodAttributes::PUBLIC
    .union(MethodAttributes::HIDE_BY_SIG)
    .union(MethodAttributes::SPECIAL_NAME)
    .union(MethodAttributes::RT_SPECIAL_NAME);

fn method(
    module: &mut Module,
    declaring: Token,
    name: &str,
    flags: MethodAttributes,
    signature: MethodSignature,
    f: impl FnOnce(&mut InstructionEncoder) -> Result<()> + 'static,
) -> Token {
    method_with_locals(module, declaring, name, flags, signature, vec![], f)
}

fn method_with_locals(
    module: &mut Module,
    declaring: Token,
    name: &str,
    flags: MethodAttributes,
    signature: MethodSignature,
    locals: Vec<TypeSig>,
    f: impl FnOnce(&mut InstructionEncoder) -> Result<()> + 'static,
) -> Token {
    let body = locals
        .into_iter()
        .fold(MethodBodyBuilder::new(), MethodBodyBuilder::local)
        .implementation(f)
        .build()
        .unwrap();
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

pub fn store_module() -> Module {
    let mut module = Module::new(STORE, ModuleVersion::new(2, 1, 0, 0));
    let object = module.import_core_type("System", "Object");
    let object_ctor = module.add_member_ref(
        object,
        ".ctor",
        MemberSig::Method(MethodSignature::new_instance(TypeSig::Void, vec![])),
    );
    let label = module.add_user_string("standard").unwrap();

    let price_list = module.add_type(
        "Store",
        "PriceList",
        TypeAttributes::PUBLIC | TypeAttributes::BEFORE_FIELD_INIT,
        Some(object),
    );
    let markup = module
        .add_field(price_list, "markup", FieldAttributes::PRIVATE, TypeSig::I4)
        .unwrap();

    let ctor = method(
        &mut module,
        price_list,
        ".ctor",
        CTOR,
        MethodSignature::new_instance(TypeSig::Void, vec![]),
        move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_call("call", Some(Operand::Token(object_ctor)), 1, false)?;
            asm.emit_ldarg(0)?;
            asm.emit_ldc_i4(2)?;
            asm.emit_instruction("stfld", Some(Operand::Token(markup)))?;
            asm.emit_ret(false)
        },
    );
    let price = method(
        &mut module,
        price_list,
        "Price",
        PUBLIC_INSTANCE,
        MethodSignature::new_instance(TypeSig::I4, vec![TypeSig::I4]),
        move |asm| {
            asm.emit_ldarg(1)?;
            asm.emit_ldarg(0)?;
            asm.emit_instruction("ldfld", Some(Operand::Token(markup)))?;
            asm.emit_instruction("add", None)?;
            asm.emit_ret(true)
        },
    );
    let tax = method(
        &mut module,
        price_list,
        "Tax",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4]),
        |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_ldc_i4(10)?;
            asm.emit_instruction("div", None)?;
            asm.emit_ret(true)
        },
    );
    method(
        &mut module,
        price_list,
        "Label",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::String, vec![]),
        move |asm| {
            asm.emit_instruction("ldstr", Some(Operand::Token(label)))?;
            asm.emit_ret(true)
        },
    );

    let checkout = module.add_type(
        "Store",
        "Checkout",
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
        Some(object),
    );
    method(
        &mut module,
        checkout,
        "Total",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4]),
        move |asm| {
            asm.emit_call("newobj", Some(Operand::Token(ctor)), 0, true)?;
            asm.emit_ldarg(0)?;
            asm.emit_call("callvirt", Some(Operand::Token(price)), 2, true)?;
            asm.emit_ldarg(0)?;
            asm.emit_call("call", Some(Operand::Token(tax)), 1, true)?;
            asm.emit_instruction("add", None)?;
            asm.emit_ret(true)
        },
    );

    let int32 = module.import_core_type("System", "Int32");
    let counter = module.add_type(
        "Store",
        "Counter",
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
        Some(object),
    );
    let peek = method(
        &mut module,
        counter,
        "Peek",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![TypeSig::ByRef(Box::new(TypeSig::I4))]),
        move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_instruction("ldobj", Some(Operand::Token(int32)))?;
            asm.emit_ret(true)
        },
    );
    method_with_locals(
        &mut module,
        counter,
        "Seven",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![]),
        vec![TypeSig::I4],
        move |asm| {
            asm.emit_ldc_i4(7)?;
            asm.emit_stloc(0)?;
            asm.emit_ldloca(0)?;
            asm.emit_call("call", Some(Operand::Token(peek)), 1, true)?;
            asm.emit_ret(true)
        },
    );

    module
}

pub fn store_tests_module() -> Module {
    let mut module = Module::new(STORE_TESTS, ModuleVersion::new(1, 0, 0, 0));
    let object = module.import_core_type("System", "Object");
    let store = module.add_reference(STORE, ModuleVersion::new(2, 1, 0, 0), None);
    module.add_reference(VENDOR, ModuleVersion::new(3, 0, 0, 0), None);
    let checkout = module.import_type_ref(store, "Store", "Checkout");
    let total = module.add_member_ref(
        checkout,
        "Total",
        MemberSig::Method(MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4])),
    );

    let program = module.add_type(
        "Store.Tests",
        "Program",
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
        Some(object),
    );
    method(
        &mut module,
        program,
        "Run",
        PUBLIC_STATIC,
        MethodSignature::new_static(TypeSig::I4, vec![]),
        move |asm| {
            asm.emit_ldc_i4(100)?;
            asm.emit_call("call", Some(Operand::Token(total)), 1, true)?;
            asm.emit_ret(true)
        },
    );

    module
}

/// Writes the root, `Store.dll` and the support module into `dir`; returns the root path.
pub fn write_store_closure(dir: &Path) -> PathBuf {
    let root = dir.join(format!("{STORE_TESTS}.dll"));
    store_tests_module().write(&root).unwrap();
    store_module().write(&store_path(dir)).unwrap();
    write_support_module(dir).unwrap();
    root
}

pub fn store_path(dir: &Path) -> PathBuf {
    dir.join(format!("{STORE}.dll"))
}

/// Files in `dir` with the given extension.
pub fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().is_some_and(|e| e == extension))
        .collect();
    files.sort();
    files
}
