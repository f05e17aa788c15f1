//! Per-module patching.
//!
//! [`MockInjector`] applies the interception rewrite to every eligible method of a module. For
//! each patched type it also adds two private `object` storage fields and a constructor
//! overload taking `Cilweave.Elevated.MockPlaceholderType`, which substitutes use to create
//! instances without running user constructors. Finally the module is stamped with the
//! [`PatchMarker`] of the support module it was patched against.
//!
//! # Eligibility
//!
//! Types are skipped when they are `<Module>`, interfaces, nested private, delegates, enums,
//! explicit-layout or compiler generated. Methods are skipped when they are constructors,
//! abstract, compiler-controlled, compiler generated or have no body.

use std::path::{Path, PathBuf};

use crate::{
    assembly::Operand,
    file::File,
    metadata::{
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes},
        method::MethodBodyBuilder,
        module::{MemberSig, MethodDef, Module, TypeDef, MODULE_TYPE_NAME},
        signatures::{MethodSignature, TypeSig},
        token::{TableId, Token},
    },
    weaver::{
        marker::{MarkerStatus, PatchMarker},
        rewriter::{rewrite_method, BridgeImports},
        support::{
            support_module_path, SupportIdentity, BRIDGE_METHOD_NAME, BRIDGE_TYPE_NAME,
            PLACEHOLDER_TYPE_NAME, SUPPORT_NAMESPACE,
        },
        INJECTED_INSTANCE_FIELD, INJECTED_STATIC_FIELD, MODULE_EXTENSION,
    },
    Error, Result,
};

const COMPILER_GENERATED_ATTRIBUTE: &str =
    "System.Runtime.CompilerServices.CompilerGeneratedAttribute";

/// Patches modules against one support module build.
#[derive(Debug, Clone)]
pub struct MockInjector {
    marker: PatchMarker,
    support: SupportIdentity,
    search_dir: PathBuf,
}

/// The constructor a placeholder constructor chains to. Value types chain to nothing.
struct BaseCtor {
    token: Option<Token>,
    takes_placeholder: bool,
}

impl MockInjector {
    /// Loads the support module from `dir`; base types of patched types are looked up there as
    /// well.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the support module is missing and
    /// [`Error::Malformed`] if it does not define the bridge and placeholder types.
    pub fn new(dir: &Path) -> Result<Self> {
        let file = File::from_file(&support_module_path(dir))?;
        let support = Module::parse(file.data())?;
        Self::from_support(&support, file.data(), dir)
    }

    /// Uses an already loaded support module and its serialised `image`.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the module does not define the bridge and placeholder
    /// types.
    pub fn from_support(support: &Module, image: &[u8], search_dir: &Path) -> Result<Self> {
        let bridge = support
            .find_type(SUPPORT_NAMESPACE, BRIDGE_TYPE_NAME)
            .ok_or_else(|| malformed_error!("Support module lacks {}", BRIDGE_TYPE_NAME))?;
        if support.find_method(bridge.token, BRIDGE_METHOD_NAME).is_none() {
            return Err(malformed_error!(
                "Support module lacks {}::{}",
                BRIDGE_TYPE_NAME,
                BRIDGE_METHOD_NAME
            ));
        }
        if support
            .find_type(SUPPORT_NAMESPACE, PLACEHOLDER_TYPE_NAME)
            .is_none()
        {
            return Err(malformed_error!(
                "Support module lacks {}",
                PLACEHOLDER_TYPE_NAME
            ));
        }

        Ok(MockInjector {
            marker: PatchMarker::new(support, image),
            support: SupportIdentity::of(support),
            search_dir: search_dir.to_path_buf(),
        })
    }

    /// The marker this injector stamps.
    #[must_use]
    pub fn marker(&self) -> &PatchMarker {
        &self.marker
    }

    /// Identity of the support module.
    #[must_use]
    pub fn support(&self) -> &SupportIdentity {
        &self.support
    }

    /// Marker state of `module`.
    #[must_use]
    pub fn marker_status(&self, module: &Module) -> MarkerStatus {
        self.marker.status(module)
    }

    /// Returns `true` if `module` was patched against this support module build.
    #[must_use]
    pub fn is_patched(&self, module: &Module) -> bool {
        self.marker.is_present(module)
    }

    /// Patches every eligible type of `module` and returns the number of rewritten methods.
    ///
    /// `staged` holds modules patched earlier in the same pass; they take precedence over the
    /// files on disk when a base type constructor is resolved.
    ///
    /// # Errors
    /// [`Error::RewriteFailure`] if a method cannot be rewritten, [`Error::MockCtorUnavailable`]
    /// if a type has no constructor to chain its placeholder constructor to and
    /// [`Error::InjectedFieldMismatch`] for types carrying only one storage field.
    pub fn patch(&self, module: &mut Module, staged: &[Module]) -> Result<usize> {
        let imports = BridgeImports::import(module, &self.support);

        let mut order = module
            .types
            .iter()
            .map(|t| (inheritance_depth(module, t), t.token))
            .collect::<Vec<_>>();
        order.sort_by_key(|(depth, _)| *depth);

        let mut rewritten = 0;
        for (_, type_token) in order {
            let Some(type_def) = module.type_def(type_token) else {
                continue;
            };
            if !is_eligible_type(module, type_def) || type_is_patched(module, type_def)? {
                continue;
            }

            let methods = module
                .type_methods(type_def)
                .filter(|m| is_eligible_method(module, m))
                .map(|m| m.token)
                .collect::<Vec<_>>();
            for method in methods {
                rewrite_method(module, method, &imports)?;
                rewritten += 1;
            }

            module.add_field(
                type_token,
                INJECTED_STATIC_FIELD,
                FieldAttributes::PRIVATE | FieldAttributes::STATIC,
                TypeSig::Object,
            )?;
            module.add_field(
                type_token,
                INJECTED_INSTANCE_FIELD,
                FieldAttributes::PRIVATE,
                TypeSig::Object,
            )?;
            self.add_placeholder_ctor(module, type_token, &imports, staged)?;
        }

        self.marker.stamp(module)?;
        log::info!(
            "Injected mock interception into {} methods of {}",
            rewritten,
            module.name()
        );
        Ok(rewritten)
    }

    fn add_placeholder_ctor(
        &self,
        module: &mut Module,
        type_token: Token,
        imports: &BridgeImports,
        staged: &[Module],
    ) -> Result<()> {
        let type_def = module
            .type_def(type_token)
            .ok_or(Error::TokenNotFound(type_token))?;
        if find_placeholder_ctor(module, type_def).is_some() {
            return Ok(());
        }

        let type_name = module
            .type_full_name(type_token)
            .unwrap_or_else(|| type_token.to_string());
        let base = type_def
            .extends
            .ok_or_else(|| Error::MockCtorUnavailable(type_name.clone()))?;
        let base_ctor = self
            .resolve_base_ctor(module, base, imports, staged)?
            .ok_or(Error::MockCtorUnavailable(type_name))?;

        let body = MethodBodyBuilder::new()
            .implementation(move |asm| {
                let Some(token) = base_ctor.token else {
                    return asm.emit_ret(false);
                };
                asm.emit_ldarg(0)?;
                if base_ctor.takes_placeholder {
                    asm.emit_ldarg(1)?;
                    asm.emit_call("call", Some(Operand::Token(token)), 2, false)?;
                } else {
                    asm.emit_call("call", Some(Operand::Token(token)), 1, false)?;
                }
                asm.emit_ret(false)
            })
            .build()?;

        module.add_method(
            type_token,
            ".ctor",
            MethodAttributes::PUBLIC
                | MethodAttributes::HIDE_BY_SIG
                | MethodAttributes::SPECIAL_NAME
                | MethodAttributes::RT_SPECIAL_NAME,
            MethodImplAttributes::IL,
            MethodSignature::new_instance(TypeSig::Void, vec![TypeSig::Class(imports.placeholder)]),
            Some(body),
        )?;
        Ok(())
    }

    fn resolve_base_ctor(
        &self,
        module: &mut Module,
        base: Token,
        imports: &BridgeImports,
        staged: &[Module],
    ) -> Result<Option<BaseCtor>> {
        match base.table_id() {
            Some(TableId::TypeDef) => {
                let Some(base_def) = module.type_def(base) else {
                    return Ok(None);
                };
                if let Some(ctor) = find_placeholder_ctor(module, base_def) {
                    return Ok(Some(BaseCtor {
                        token: Some(ctor),
                        takes_placeholder: true,
                    }));
                }
                Ok(find_default_ctor(module, base_def).map(|token| BaseCtor {
                    token: Some(token),
                    takes_placeholder: false,
                }))
            }
            Some(TableId::TypeRef) => {
                if module.type_ref(base).is_none() {
                    return Ok(None);
                }
                let full_name = module.type_full_name(base).unwrap_or_default();
                if full_name == "System.ValueType" {
                    return Ok(Some(BaseCtor {
                        token: None,
                        takes_placeholder: false,
                    }));
                }

                let (has_placeholder, has_default) =
                    if full_name == "System.Object" {
                        (false, true)
                    } else {
                        let scope_name = module
                            .type_ref_reference(base)
                            .map(|r| r.name.clone())
                            .unwrap_or_default();
                        match self.load_foreign(&scope_name, staged)? {
                            Some(foreign) => {
                                match foreign.find_type_by_full_name(&full_name) {
                                    Some(foreign_def) => (
                                        find_placeholder_ctor(&foreign, foreign_def).is_some(),
                                        find_default_ctor(&foreign, foreign_def).is_some(),
                                    ),
                                    None => (false, false),
                                }
                            }
                            None => {
                                log::debug!(
                                    "Cannot inspect {} in {}, assuming a parameterless constructor",
                                    full_name,
                                    scope_name
                                );
                                (false, true)
                            }
                        }
                    };

                let params = if has_placeholder {
                    vec![TypeSig::Class(imports.placeholder)]
                } else if has_default {
                    Vec::new()
                } else {
                    return Ok(None);
                };

                let token = module.add_member_ref(
                    base,
                    ".ctor",
                    MemberSig::Method(MethodSignature::new_instance(TypeSig::Void, params)),
                );
                Ok(Some(BaseCtor {
                    token: Some(token),
                    takes_placeholder: has_placeholder,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Finds a module by simple name, staged modules first, then the search directory.
    fn load_foreign(&self, name: &str, staged: &[Module]) -> Result<Option<Module>> {
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(module) = staged
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
        {
            return Ok(Some(module.clone()));
        }

        let path = self.search_dir.join(format!("{name}.{MODULE_EXTENSION}"));
        if path.is_file() {
            Module::from_file(&path).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Returns `true` if the methods of `type_def` may be rewritten.
#[must_use]
pub fn is_eligible_type(module: &Module, type_def: &TypeDef) -> bool {
    if type_def.name == MODULE_TYPE_NAME && type_def.enclosing.is_none() {
        return false;
    }
    if type_def.flags.is_interface()
        || type_def.flags.is_nested_private()
        || type_def.flags.is_explicit_layout()
    {
        return false;
    }
    if let Some(base) = type_def.extends.and_then(|b| module.type_full_name(b)) {
        if matches!(
            base.as_str(),
            "System.MulticastDelegate" | "System.Delegate" | "System.Enum"
        ) {
            return false;
        }
    }
    !is_compiler_generated(module, type_def.token)
}

/// Returns `true` if `method` may be rewritten.
#[must_use]
pub fn is_eligible_method(module: &Module, method: &MethodDef) -> bool {
    method.body.is_some()
        && !method.is_constructor()
        && !method.is_abstract()
        && !method.flags.is_compiler_controlled()
        && !method.signature.is_vararg()
        && !method.signature.ret.is_unboxable()
        && !method.signature.params.iter().any(TypeSig::is_unboxable)
        && !is_compiler_generated(module, method.token)
}

/// Returns `true` if `type_def` already carries the injected storage fields.
///
/// # Errors
/// [`Error::InjectedFieldMismatch`] if only one of the two fields is present.
pub fn type_is_patched(module: &Module, type_def: &TypeDef) -> Result<bool> {
    let has_static = module
        .type_fields(type_def)
        .any(|f| f.name == INJECTED_STATIC_FIELD && f.flags.is_static());
    let has_instance = module
        .type_fields(type_def)
        .any(|f| f.name == INJECTED_INSTANCE_FIELD && !f.flags.is_static());

    if has_static != has_instance {
        return Err(Error::InjectedFieldMismatch(
            module
                .type_full_name(type_def.token)
                .unwrap_or_else(|| type_def.name.clone()),
        ));
    }
    Ok(has_static)
}

/// Finds the `.ctor(MockPlaceholderType)` of `type_def`.
#[must_use]
pub fn find_placeholder_ctor(module: &Module, type_def: &TypeDef) -> Option<Token> {
    let placeholder = format!("{SUPPORT_NAMESPACE}.{PLACEHOLDER_TYPE_NAME}");
    module
        .type_methods(type_def)
        .find(|m| {
            m.is_constructor()
                && m.signature.has_this
                && matches!(
                    m.signature.params.as_slice(),
                    [TypeSig::Class(param)] if module.type_full_name(*param).as_deref() == Some(placeholder.as_str())
                )
        })
        .map(|m| m.token)
}

fn find_default_ctor(module: &Module, type_def: &TypeDef) -> Option<Token> {
    module
        .type_methods(type_def)
        .find(|m| m.is_constructor() && m.signature.has_this && m.signature.params.is_empty())
        .map(|m| m.token)
}

fn is_compiler_generated(module: &Module, target: Token) -> bool {
    module.has_attribute(target, COMPILER_GENERATED_ATTRIBUTE)
}

/// Number of base types of `type_def` defined in the same module, plus one for a foreign base.
fn inheritance_depth(module: &Module, type_def: &TypeDef) -> usize {
    let mut depth = 0;
    let mut current = type_def.extends;
    while let Some(base) = current {
        depth += 1;
        if depth > module.types.len() {
            break;
        }
        current = module.type_def(base).and_then(|t| t.extends);
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{flags::TypeAttributes, identity::ModuleVersion},
        test::{
            calculator_module, method_token, type_token, CALCULATOR_MODULE, CALCULATOR_TYPE,
            ELIGIBLE_METHODS, POINT_TYPE, SCIENTIFIC_TYPE,
        },
        weaver::support::build_support_module,
    };

    const LDTOKEN: u8 = 0xD0;

    fn injector(dir: &Path) -> MockInjector {
        let support = build_support_module().unwrap();
        let image = support.to_bytes().unwrap();
        MockInjector::from_support(&support, &image, dir).unwrap()
    }

    #[test]
    fn patches_eligible_methods_only() {
        let dir = tempfile::tempdir().unwrap();
        let injector = injector(dir.path());
        let original = calculator_module();
        let mut module = original.clone();

        let count = injector.patch(&mut module, &[]).unwrap();
        assert_eq!(count, ELIGIBLE_METHODS.len());

        for method in &original.methods {
            let name = original.method_full_name(method.token).unwrap();
            let patched = module.method(method.token).unwrap();
            if ELIGIBLE_METHODS.contains(&name.as_str()) {
                assert_eq!(patched.body.as_ref().unwrap().code[0], LDTOKEN, "{name}");
            } else {
                assert_eq!(patched.body, method.body, "{name}");
            }
        }

        assert!(injector.is_patched(&module));
        assert!(!injector.is_patched(&original));
    }

    #[test]
    fn storage_fields_and_placeholder_ctors() {
        let dir = tempfile::tempdir().unwrap();
        let injector = injector(dir.path());
        let mut module = calculator_module();
        injector.patch(&mut module, &[]).unwrap();

        for name in [CALCULATOR_TYPE, SCIENTIFIC_TYPE, POINT_TYPE] {
            let type_def = module.type_def(type_token(&module, name)).unwrap();
            assert!(type_is_patched(&module, type_def).unwrap(), "{name}");
            assert!(find_placeholder_ctor(&module, type_def).is_some(), "{name}");
        }
        for name in ["Demo.IShape", "Demo.Color", "Demo.Callback", "Demo.Overlay", "Demo.<>c"] {
            let type_def = module.type_def(type_token(&module, name)).unwrap();
            assert!(!type_is_patched(&module, type_def).unwrap(), "{name}");
        }

        // the derived type chains to the placeholder constructor of its base
        let calc = module.type_def(type_token(&module, CALCULATOR_TYPE)).unwrap();
        let base_ctor = find_placeholder_ctor(&module, calc).unwrap();
        let scientific = module.type_def(type_token(&module, SCIENTIFIC_TYPE)).unwrap();
        let ctor = module
            .method(find_placeholder_ctor(&module, scientific).unwrap())
            .unwrap();
        let code = &ctor.body.as_ref().unwrap().code;
        assert_eq!(&code[..3], &[0x02, 0x03, 0x28]);
        assert_eq!(&code[3..7], &base_ctor.value().to_le_bytes());

        // the root type chains to System.Object::.ctor()
        let code = &module.method(base_ctor).unwrap().body.as_ref().unwrap().code;
        assert_eq!(&code[..2], &[0x02, 0x28]);
        let target = Token::new(u32::from_le_bytes([code[2], code[3], code[4], code[5]]));
        assert_eq!(
            module.method_full_name(target).as_deref(),
            Some("System.Object::.ctor")
        );
    }

    #[test]
    fn value_type_placeholder_ctor_only_returns() {
        let dir = tempfile::tempdir().unwrap();
        let injector = injector(dir.path());
        let mut module = calculator_module();
        let member_refs = module.member_refs.len();
        injector.patch(&mut module, &[]).unwrap();

        let point = module.type_def(type_token(&module, POINT_TYPE)).unwrap();
        let ctor = module
            .method(find_placeholder_ctor(&module, point).unwrap())
            .unwrap();
        assert_eq!(ctor.body.as_ref().unwrap().code, vec![0x2A]);
        assert!(!module.member_refs[member_refs..]
            .iter()
            .any(|m| module.type_full_name(m.parent).as_deref() == Some("System.ValueType")));
    }

    #[test]
    fn eligibility() {
        let module = calculator_module();
        let eligible = module
            .types
            .iter()
            .filter(|t| is_eligible_type(&module, t))
            .map(|t| module.type_full_name(t.token).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(eligible, vec![CALCULATOR_TYPE, SCIENTIFIC_TYPE, POINT_TYPE]);

        let hidden = module.method(method_token(&module, "Demo.Calculator::Hidden")).unwrap();
        assert!(!is_eligible_method(&module, hidden));
        let add = module.method(method_token(&module, "Demo.Calculator::Add")).unwrap();
        assert!(is_eligible_method(&module, add));
    }

    #[test]
    fn single_storage_field_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = calculator_module();
        let calc = type_token(&module, CALCULATOR_TYPE);
        module
            .add_field(
                calc,
                INJECTED_STATIC_FIELD,
                FieldAttributes::PRIVATE | FieldAttributes::STATIC,
                TypeSig::Object,
            )
            .unwrap();

        match injector(dir.path()).patch(&mut module, &[]) {
            Err(Error::InjectedFieldMismatch(name)) => assert_eq!(name, CALCULATOR_TYPE),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn missing_base_constructor() {
        let dir = tempfile::tempdir().unwrap();
        let mut module = Module::new("Broken", ModuleVersion::new(1, 0, 0, 0));
        let object = module.import_core_type("System", "Object");
        let outer = module.add_type("Demo", "Outer", TypeAttributes::PUBLIC, Some(object));
        let hidden_base = module
            .add_nested_type(outer, "Base", TypeAttributes::NESTED_PRIVATE, Some(object))
            .unwrap();
        let body = MethodBodyBuilder::new()
            .implementation(|asm| asm.emit_ret(false))
            .build()
            .unwrap();
        module
            .add_method(
                hidden_base,
                ".ctor",
                MethodAttributes::PUBLIC
                    | MethodAttributes::SPECIAL_NAME
                    | MethodAttributes::RT_SPECIAL_NAME,
                MethodImplAttributes::IL,
                MethodSignature::new_instance(TypeSig::Void, vec![TypeSig::I4]),
                Some(body),
            )
            .unwrap();
        module
            .add_nested_type(outer, "Derived", TypeAttributes::NESTED_PUBLIC, Some(hidden_base))
            .unwrap();

        match injector(dir.path()).patch(&mut module, &[]) {
            Err(Error::MockCtorUnavailable(name)) => assert_eq!(name, "Demo.Outer/Derived"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn foreign_base_uses_staged_module() {
        let dir = tempfile::tempdir().unwrap();
        let injector = injector(dir.path());
        let mut calculator = calculator_module();
        injector.patch(&mut calculator, &[]).unwrap();

        let mut geometry = Module::new("Geometry", ModuleVersion::new(1, 0, 0, 0));
        let scope = geometry.add_reference(CALCULATOR_MODULE, ModuleVersion::new(1, 0, 0, 0), None);
        let base = geometry.import_type_ref(scope, "Demo", "Calculator");
        let derived = geometry.add_type("Shapes", "Area", TypeAttributes::PUBLIC, Some(base));

        injector
            .patch(&mut geometry, std::slice::from_ref(&calculator))
            .unwrap();

        let type_def = geometry.type_def(derived).unwrap();
        let ctor = geometry
            .method(find_placeholder_ctor(&geometry, type_def).unwrap())
            .unwrap();
        let code = &ctor.body.as_ref().unwrap().code;
        assert_eq!(&code[..3], &[0x02, 0x03, 0x28]);
        let target = Token::new(u32::from_le_bytes([code[3], code[4], code[5], code[6]]));
        let member = geometry.member_ref(target).unwrap();
        assert_eq!(member.parent, base);
        assert!(matches!(&member.signature, MemberSig::Method(sig) if sig.params.len() == 1));
    }

    #[test]
    fn support_module_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MockInjector::new(dir.path()),
            Err(Error::FileError(_))
        ));

        crate::weaver::support::write_support_module(dir.path()).unwrap();
        let injector = MockInjector::new(dir.path()).unwrap();
        assert_eq!(injector.support().name, "Cilweave.Elevated");
        assert_eq!(
            injector.marker().value,
            crate::utils::to_hex(&crate::utils::compute_md5(
                &std::fs::read(support_module_path(dir.path())).unwrap()
            ))
        );
    }
}
