//! The support module.
//!
//! Patched modules reference two types that live in a separate module, `Cilweave.Elevated`:
//!
//! - `Cilweave.Elevated.PatchedAssemblyBridge` with the runtime-provided `TryMock` method every
//!   interception prologue calls
//! - `Cilweave.Elevated.MockPlaceholderType`, the parameter type of the constructor overload
//!   added to patched types
//!
//! The support module is strong-named, so the closure walk never tries to patch it. Its display
//! name and the MD5 of its bytes form the patch marker, see [`crate::weaver::marker`].

use std::path::{Path, PathBuf};

use crate::{
    assembly::Operand,
    metadata::{
        flags::{MethodAttributes, MethodImplAttributes, TypeAttributes},
        identity::ModuleVersion,
        method::MethodBodyBuilder,
        module::{MemberSig, Module},
        signatures::{MethodSignature, TypeSig},
    },
    utils::compute_sha1,
    weaver::MODULE_EXTENSION,
    Result,
};

/// Simple name of the support module.
pub const SUPPORT_MODULE_NAME: &str = "Cilweave.Elevated";

/// Namespace of the support types.
pub const SUPPORT_NAMESPACE: &str = "Cilweave.Elevated";

/// Type that hosts the bridge method.
pub const BRIDGE_TYPE_NAME: &str = "PatchedAssemblyBridge";

/// The bridge method called by interception prologues.
pub const BRIDGE_METHOD_NAME: &str = "TryMock";

/// Parameter type of injected placeholder constructors.
pub const PLACEHOLDER_TYPE_NAME: &str = "MockPlaceholderType";

/// Version of the support module produced by this crate.
pub const SUPPORT_VERSION: ModuleVersion = ModuleVersion::new(1, 0, 0, 0);

/// How patched modules reference the support module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportIdentity {
    /// Simple name
    pub name: String,
    /// Version
    pub version: ModuleVersion,
    /// Public key token
    pub public_key_token: Option<[u8; 8]>,
}

impl SupportIdentity {
    /// Identity of a loaded support module.
    #[must_use]
    pub fn of(module: &Module) -> Self {
        SupportIdentity {
            name: module.identity.name.clone(),
            version: module.identity.version,
            public_key_token: module.identity.public_key_token(),
        }
    }
}

/// Path of the support module inside `dir`.
#[must_use]
pub fn support_module_path(dir: &Path) -> PathBuf {
    dir.join(format!("{SUPPORT_MODULE_NAME}.{MODULE_EXTENSION}"))
}

/// The bridge signature: `bool TryMock(Type owner, object instance, Type returnType,
/// out object result, MethodBase method, object[] args)`.
pub(crate) fn bridge_signature(system_type: TypeSig, method_base: TypeSig) -> MethodSignature {
    MethodSignature::new_static(
        TypeSig::Boolean,
        vec![
            system_type.clone(),
            TypeSig::Object,
            system_type,
            TypeSig::ByRef(Box::new(TypeSig::Object)),
            method_base,
            TypeSig::SzArray(Box::new(TypeSig::Object)),
        ],
    )
}

/// Builds the support module.
///
/// The result is deterministic, every call produces the same bytes once serialised.
///
/// # Errors
/// Only fails if the module model rejects one of the rows, which indicates a bug.
pub fn build_support_module() -> Result<Module> {
    let mut module = Module::new(SUPPORT_MODULE_NAME, SUPPORT_VERSION);
    module.identity.public_key = Some(compute_sha1(SUPPORT_MODULE_NAME.as_bytes()));

    let object = module.import_core_type("System", "Object");
    let system_type = module.import_core_type("System", "Type");
    let method_base = module.import_core_type("System.Reflection", "MethodBase");
    let object_ctor = module.add_member_ref(
        object,
        ".ctor",
        MemberSig::Method(MethodSignature::new_instance(TypeSig::Void, vec![])),
    );

    let placeholder = module.add_type(
        SUPPORT_NAMESPACE,
        PLACEHOLDER_TYPE_NAME,
        TypeAttributes::PUBLIC | TypeAttributes::SEALED | TypeAttributes::BEFORE_FIELD_INIT,
        Some(object),
    );
    let ctor_body = MethodBodyBuilder::new()
        .implementation(move |asm| {
            asm.emit_ldarg(0)?;
            asm.emit_call("call", Some(Operand::Token(object_ctor)), 1, false)?;
            asm.emit_ret(false)
        })
        .build()?;
    module.add_method(
        placeholder,
        ".ctor",
        MethodAttributes::PUBLIC
            | MethodAttributes::HIDE_BY_SIG
            | MethodAttributes::SPECIAL_NAME
            | MethodAttributes::RT_SPECIAL_NAME,
        MethodImplAttributes::IL,
        MethodSignature::new_instance(TypeSig::Void, vec![]),
        Some(ctor_body),
    )?;

    let bridge = module.add_type(
        SUPPORT_NAMESPACE,
        BRIDGE_TYPE_NAME,
        TypeAttributes::PUBLIC | TypeAttributes::ABSTRACT | TypeAttributes::SEALED,
        Some(object),
    );
    module.add_method(
        bridge,
        BRIDGE_METHOD_NAME,
        MethodAttributes::PUBLIC | MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG,
        MethodImplAttributes::INTERNAL_CALL,
        bridge_signature(TypeSig::Class(system_type), TypeSig::Class(method_base)),
        None,
    )?;

    Ok(module)
}

/// Writes the support module into `dir` and returns its path.
///
/// # Errors
/// Returns [`crate::Error::FileError`] if the file cannot be written.
pub fn write_support_module(dir: &Path) -> Result<PathBuf> {
    let path = support_module_path(dir);
    build_support_module()?.write(&path)?;
    log::debug!("Wrote support module to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::TableId;

    #[test]
    fn support_types() {
        let module = build_support_module().unwrap();
        assert!(module.identity.is_strong_named());

        let bridge = module.find_type(SUPPORT_NAMESPACE, BRIDGE_TYPE_NAME).unwrap();
        let try_mock = module.find_method(bridge.token, BRIDGE_METHOD_NAME).unwrap();
        assert!(try_mock.body.is_none());
        assert!(try_mock.impl_flags.contains(MethodImplAttributes::INTERNAL_CALL));
        assert_eq!(try_mock.signature.params.len(), 6);
        assert_eq!(try_mock.signature.ret, TypeSig::Boolean);

        let placeholder = module
            .find_type(SUPPORT_NAMESPACE, PLACEHOLDER_TYPE_NAME)
            .unwrap();
        assert!(module.find_method(placeholder.token, ".ctor").is_some());
        assert!(module
            .references
            .iter()
            .all(|r| r.token.is_table(TableId::AssemblyRef)));
    }

    #[test]
    fn deterministic_bytes() {
        let first = build_support_module().unwrap().to_bytes().unwrap();
        let second = build_support_module().unwrap().to_bytes().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn written_next_to_modules() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_support_module(dir.path()).unwrap();
        assert_eq!(path, support_module_path(dir.path()));
        assert!(path.ends_with("Cilweave.Elevated.dll"));

        let loaded = Module::from_file(&path).unwrap();
        let identity = SupportIdentity::of(&loaded);
        assert_eq!(identity.name, SUPPORT_MODULE_NAME);
        assert_eq!(identity.version, SUPPORT_VERSION);
        assert!(identity.public_key_token.is_some());
    }
}
