//! The in-memory module model.
//!
//! A [`Module`] holds one compiled unit as a set of tables: referenced assemblies, imported
//! types, type specifications, member references, type definitions with their fields, methods
//! and parameters, custom attributes and user strings. Tables the weaver never interprets
//! (properties, events, generic parameters, layouts, ...) are kept as resolved
//! [`RawTable`]s so they survive a load/store cycle unchanged in meaning.
//!
//! Every row is addressed by a [`Token`] whose row number is its 1-based position in the
//! table. Rows are only ever appended, so tokens embedded in instruction streams stay valid
//! while a module is being patched; the writer renumbers members into the owner-grouped order
//! the file format needs and rewrites every reference accordingly.
//!
//! Key/value pairs such as the patch marker are stored as
//! `System.Reflection.AssemblyMetadataAttribute(string, string)` attributes on the assembly,
//! see [`Module::get_metadata`] and [`Module::set_metadata`].
//!
//! ```rust
//! use cilweave::metadata::{
//!     flags::{MethodAttributes, MethodImplAttributes, TypeAttributes},
//!     identity::ModuleVersion,
//!     method::MethodBodyBuilder,
//!     module::Module,
//!     signatures::{MethodSignature, TypeSig},
//! };
//!
//! let mut module = Module::new("Calculator", ModuleVersion::new(1, 0, 0, 0));
//! let object = module.import_core_type("System", "Object");
//! let calc = module.add_type("Demo", "Calc", TypeAttributes::PUBLIC, Some(object));
//!
//! let body = MethodBodyBuilder::new()
//!     .implementation(|asm| {
//!         asm.emit_ldarg(0)?;
//!         asm.emit_ldarg(1)?;
//!         asm.emit_instruction("add", None)?;
//!         asm.emit_ret(true)
//!     })
//!     .build()?;
//!
//! let add = module.add_method(
//!     calc,
//!     "Add",
//!     MethodAttributes::PUBLIC | MethodAttributes::STATIC,
//!     MethodImplAttributes::IL,
//!     MethodSignature::new_static(TypeSig::I4, vec![TypeSig::I4, TypeSig::I4]),
//!     Some(body),
//! )?;
//!
//! assert_eq!(module.method_full_name(add).as_deref(), Some("Demo.Calc::Add"));
//! # Ok::<(), cilweave::Error>(())
//! ```

use uguid::Guid;

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::{
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes},
        identity::{AssemblyInfo, ModuleIdentity, ModuleVersion},
        image::ImageInfo,
        method::MethodBody,
        signatures::{MethodSignature, TypeSig},
        streams::UserStringHeap,
        tables::{CodedIndexType, RawTable},
        token::{TableId, Token},
    },
    utils::compute_md5,
    Error, Result,
};

/// Name of the core library primitive types are imported from.
pub const CORE_LIBRARY: &str = "mscorlib";

/// Version of the core library reference.
pub const CORE_LIBRARY_VERSION: ModuleVersion = ModuleVersion::new(4, 0, 0, 0);

/// Public key token of the core library.
pub const CORE_LIBRARY_TOKEN: [u8; 8] = [0xb7, 0x7a, 0x5c, 0x56, 0x19, 0x34, 0xe0, 0x89];

/// Names a module may reference its core library by.
pub const CORE_LIBRARY_NAMES: &[&str] = &[
    "mscorlib",
    "System.Runtime",
    "netstandard",
    "System.Private.CoreLib",
];

/// Name of the pseudo type that owns module level members.
pub const MODULE_TYPE_NAME: &str = "<Module>";

/// Namespace of the attribute that stores key/value metadata.
pub const METADATA_ATTRIBUTE_NAMESPACE: &str = "System.Reflection";

/// Name of the attribute that stores key/value metadata.
pub const METADATA_ATTRIBUTE_NAME: &str = "AssemblyMetadataAttribute";

/// Value blob of an attribute constructed without arguments.
const EMPTY_ATTRIBUTE_VALUE: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// A module this module references by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReference {
    /// `AssemblyRef` token
    pub token: Token,
    /// Simple name, the file stem of a co-located module
    pub name: String,
    /// Referenced version
    pub version: ModuleVersion,
    /// Culture, empty for neutral
    pub culture: String,
    /// `AssemblyFlags`
    pub flags: u32,
    /// Public key token of a strong-named target
    pub public_key_token: Option<[u8; 8]>,
    /// Full public key, if the reference stores one instead of the token
    pub public_key: Option<Vec<u8>>,
    /// Hash of the referenced file
    pub hash_value: Vec<u8>,
}

/// A type defined in a referenced module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// `TypeRef` token
    pub token: Token,
    /// Resolution scope: `AssemblyRef`, `ModuleRef`, `Module` or the enclosing `TypeRef`
    pub scope: Token,
    /// Namespace, empty for the global namespace and nested types
    pub namespace: String,
    /// Type name
    pub name: String,
}

/// A constructed type, used wherever a type token must describe more than a plain definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSpec {
    /// `TypeSpec` token
    pub token: Token,
    /// The described type
    pub signature: TypeSig,
}

/// Signature of a member reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberSig {
    /// A method
    Method(MethodSignature),
    /// A field
    Field(TypeSig),
}

/// A method or field of a type, referenced by name and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberRef {
    /// `MemberRef` token
    pub token: Token,
    /// Declaring type, `TypeDef`, `TypeRef` or `TypeSpec`
    pub parent: Token,
    /// Member name
    pub name: String,
    /// Member signature
    pub signature: MemberSig,
}

/// A type defined in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDef {
    /// `TypeDef` token
    pub token: Token,
    /// Namespace, empty for nested types and the global namespace
    pub namespace: String,
    /// Type name
    pub name: String,
    /// Attributes
    pub flags: TypeAttributes,
    /// Base type, `None` for interfaces, `<Module>` and `System.Object`
    pub extends: Option<Token>,
    /// Enclosing type of a nested type
    pub enclosing: Option<Token>,
    /// Field tokens in declaration order
    pub fields: Vec<Token>,
    /// Method tokens in declaration order
    pub methods: Vec<Token>,
}

/// A field defined in this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// `Field` token
    pub token: Token,
    /// Field name
    pub name: String,
    /// Attributes
    pub flags: FieldAttributes,
    /// Field type
    pub signature: TypeSig,
    /// Declaring `TypeDef`
    pub declaring: Token,
    /// Static data mapped through `FieldRVA`
    pub initial_data: Option<Vec<u8>>,
}

/// A method defined in this module.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// `MethodDef` token
    pub token: Token,
    /// Method name
    pub name: String,
    /// Attributes
    pub flags: MethodAttributes,
    /// Implementation attributes
    pub impl_flags: MethodImplAttributes,
    /// Signature
    pub signature: MethodSignature,
    /// Declaring `TypeDef`
    pub declaring: Token,
    /// Body, `None` for abstract, runtime and internal-call methods
    pub body: Option<MethodBody>,
    /// `Param` tokens in sequence order
    pub params: Vec<Token>,
}

impl MethodDef {
    /// Returns `true` for instance and static constructors.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.contains(MethodAttributes::RT_SPECIAL_NAME)
            && (self.name == ".ctor" || self.name == ".cctor")
    }

    /// Returns `true` for abstract methods.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.flags.contains(MethodAttributes::ABSTRACT)
    }
}

/// A parameter row: name and flags of one parameter, sequence 0 is the return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDef {
    /// `Param` token
    pub token: Token,
    /// `ParamAttributes`
    pub flags: u16,
    /// Position, 0 for the return value
    pub sequence: u16,
    /// Parameter name
    pub name: String,
    /// Owning `MethodDef`
    pub method: Token,
}

/// A custom attribute applied to a row of this module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomAttribute {
    /// The attributed row
    pub parent: Token,
    /// Attribute constructor, `MethodDef` or `MemberRef`
    pub constructor: Token,
    /// Serialised constructor arguments and named values
    pub value: Vec<u8>,
}

/// A module level key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataEntry {
    /// Key
    pub key: String,
    /// Value, empty for a null value
    pub value: String,
}

/// One compiled unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Name, version and public key
    pub identity: ModuleIdentity,
    /// Name of the `Module` row, the file name
    pub module_name: String,
    /// Module version id
    pub mvid: Guid,
    /// The `Assembly` row, `None` for netmodules
    pub assembly: Option<AssemblyInfo>,
    /// Referenced modules
    pub references: Vec<ModuleReference>,
    /// Imported types
    pub type_refs: Vec<TypeRef>,
    /// Type specifications
    pub type_specs: Vec<TypeSpec>,
    /// Member references
    pub member_refs: Vec<MemberRef>,
    /// Type definitions, row 1 is `<Module>`
    pub types: Vec<TypeDef>,
    /// Field definitions
    pub fields: Vec<FieldDef>,
    /// Method definitions
    pub methods: Vec<MethodDef>,
    /// Parameter rows
    pub params: Vec<ParamDef>,
    /// Custom attributes
    pub custom_attributes: Vec<CustomAttribute>,
    /// String literals, addressed by `UserString` tokens
    pub user_strings: UserStringHeap,
    /// Tables kept as rows
    pub raw_tables: Vec<RawTable>,
    /// Entry point method of an executable
    pub entry_point: Option<Token>,
    /// PE level values
    pub image: ImageInfo,
}

#[allow(clippy::cast_possible_truncation)]
fn row_token(table: TableId, len: usize) -> Token {
    Token::from_parts(table, (len + 1) as u32)
}

impl Module {
    /// Create an empty library containing only the `<Module>` type.
    ///
    /// The module version id is derived from the name and version so freshly built modules
    /// serialise deterministically.
    pub fn new(name: impl Into<String>, version: ModuleVersion) -> Self {
        let identity = ModuleIdentity::new(name, version);

        let mut seed = [0_u8; 16];
        let hash = compute_md5(identity.display_name().as_bytes());
        for (slot, byte) in seed.iter_mut().zip(hash.iter()) {
            *slot = *byte;
        }

        Module {
            module_name: format!("{}.dll", identity.name),
            identity,
            mvid: Guid::from_bytes(seed),
            assembly: Some(AssemblyInfo::default()),
            references: Vec::new(),
            type_refs: Vec::new(),
            type_specs: Vec::new(),
            member_refs: Vec::new(),
            types: vec![TypeDef {
                token: Token::from_parts(TableId::TypeDef, 1),
                namespace: String::new(),
                name: MODULE_TYPE_NAME.to_string(),
                flags: TypeAttributes::NOT_PUBLIC,
                extends: None,
                enclosing: None,
                fields: Vec::new(),
                methods: Vec::new(),
            }],
            fields: Vec::new(),
            methods: Vec::new(),
            params: Vec::new(),
            custom_attributes: Vec::new(),
            user_strings: UserStringHeap::new(),
            raw_tables: Vec::new(),
            entry_point: None,
            image: ImageInfo::default(),
        }
    }

    /// Simple name of the module.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Returns the referenced module with `token`.
    #[must_use]
    pub fn reference(&self, token: Token) -> Option<&ModuleReference> {
        lookup(&self.references, TableId::AssemblyRef, token)
    }

    /// Returns the assembly that defines the imported type `token`, following the scopes of
    /// nested type references.
    #[must_use]
    pub fn type_ref_reference(&self, token: Token) -> Option<&ModuleReference> {
        let mut current = self.type_ref(token)?;
        for _ in 0..self.type_refs.len() {
            match current.scope.table_id()? {
                TableId::AssemblyRef => return self.reference(current.scope),
                TableId::TypeRef => current = self.type_ref(current.scope)?,
                _ => return None,
            }
        }
        None
    }

    /// Returns the imported type with `token`.
    #[must_use]
    pub fn type_ref(&self, token: Token) -> Option<&TypeRef> {
        lookup(&self.type_refs, TableId::TypeRef, token)
    }

    /// Returns the type specification with `token`.
    #[must_use]
    pub fn type_spec(&self, token: Token) -> Option<&TypeSpec> {
        lookup(&self.type_specs, TableId::TypeSpec, token)
    }

    /// Returns the member reference with `token`.
    #[must_use]
    pub fn member_ref(&self, token: Token) -> Option<&MemberRef> {
        lookup(&self.member_refs, TableId::MemberRef, token)
    }

    /// Returns the type definition with `token`.
    #[must_use]
    pub fn type_def(&self, token: Token) -> Option<&TypeDef> {
        lookup(&self.types, TableId::TypeDef, token)
    }

    /// Mutable access to the type definition with `token`.
    pub fn type_def_mut(&mut self, token: Token) -> Option<&mut TypeDef> {
        if !token.is_table(TableId::TypeDef) {
            return None;
        }
        self.types.get_mut(token.index()?)
    }

    /// Returns the field with `token`.
    #[must_use]
    pub fn field(&self, token: Token) -> Option<&FieldDef> {
        lookup(&self.fields, TableId::Field, token)
    }

    /// Mutable access to the field with `token`.
    pub fn field_mut(&mut self, token: Token) -> Option<&mut FieldDef> {
        if !token.is_table(TableId::Field) {
            return None;
        }
        self.fields.get_mut(token.index()?)
    }

    /// Returns the method with `token`.
    #[must_use]
    pub fn method(&self, token: Token) -> Option<&MethodDef> {
        lookup(&self.methods, TableId::MethodDef, token)
    }

    /// Mutable access to the method with `token`.
    pub fn method_mut(&mut self, token: Token) -> Option<&mut MethodDef> {
        if !token.is_table(TableId::MethodDef) {
            return None;
        }
        self.methods.get_mut(token.index()?)
    }

    /// Returns the parameter row with `token`.
    #[must_use]
    pub fn param(&self, token: Token) -> Option<&ParamDef> {
        lookup(&self.params, TableId::Param, token)
    }

    /// Returns the string literal with `token`.
    #[must_use]
    pub fn user_string(&self, token: Token) -> Option<String> {
        self.user_strings.resolve(token)
    }

    /// Returns the raw table `id`, if the module has one.
    #[must_use]
    pub fn raw_table(&self, id: TableId) -> Option<&RawTable> {
        self.raw_tables.iter().find(|raw| raw.id == id)
    }

    /// Mutable access to the raw table `id`, created empty if missing.
    pub fn raw_table_mut(&mut self, id: TableId) -> &mut RawTable {
        match self.raw_tables.iter().position(|raw| raw.id == id) {
            Some(position) => &mut self.raw_tables[position],
            None => {
                self.raw_tables.push(RawTable::new(id));
                let last = self.raw_tables.len() - 1;
                &mut self.raw_tables[last]
            }
        }
    }

    /// Returns `true` if `token` names an existing row or user string.
    #[must_use]
    pub fn contains_token(&self, token: Token) -> bool {
        let len = match token.table_id() {
            Some(TableId::Module) => 1,
            Some(TableId::TypeRef) => self.type_refs.len(),
            Some(TableId::TypeDef) => self.types.len(),
            Some(TableId::Field) => self.fields.len(),
            Some(TableId::MethodDef) => self.methods.len(),
            Some(TableId::Param) => self.params.len(),
            Some(TableId::MemberRef) => self.member_refs.len(),
            Some(TableId::CustomAttribute) => self.custom_attributes.len(),
            Some(TableId::TypeSpec) => self.type_specs.len(),
            Some(TableId::Assembly) => usize::from(self.assembly.is_some()),
            Some(TableId::AssemblyRef) => self.references.len(),
            Some(TableId::UserString) => return self.user_strings.resolve(token).is_some(),
            Some(other) => self.raw_table(other).map_or(0, |raw| raw.rows.len()),
            None => return false,
        };

        token.row() >= 1 && (token.row() as usize) <= len
    }

    /// Finds a type definition by namespace and name.
    #[must_use]
    pub fn find_type(&self, namespace: &str, name: &str) -> Option<&TypeDef> {
        self.types
            .iter()
            .find(|t| t.enclosing.is_none() && t.namespace == namespace && t.name == name)
    }

    /// Finds a type definition by its full name, `Namespace.Name` or `Outer/Inner`.
    #[must_use]
    pub fn find_type_by_full_name(&self, full_name: &str) -> Option<&TypeDef> {
        self.types
            .iter()
            .find(|t| self.type_full_name(t.token).as_deref() == Some(full_name))
    }

    /// Iterates the methods of a type.
    pub fn type_methods<'a>(
        &'a self,
        type_def: &'a TypeDef,
    ) -> impl Iterator<Item = &'a MethodDef> {
        type_def.methods.iter().filter_map(|token| self.method(*token))
    }

    /// Iterates the fields of a type.
    pub fn type_fields<'a>(
        &'a self,
        type_def: &'a TypeDef,
    ) -> impl Iterator<Item = &'a FieldDef> {
        type_def.fields.iter().filter_map(|token| self.field(*token))
    }

    /// Finds a method of `type_token` by name.
    #[must_use]
    pub fn find_method(&self, type_token: Token, name: &str) -> Option<&MethodDef> {
        let type_def = self.type_def(type_token)?;
        self.type_methods(type_def).find(|m| m.name == name)
    }

    /// Full name of a `TypeDef`, `TypeRef` or `TypeSpec`.
    #[must_use]
    pub fn type_full_name(&self, token: Token) -> Option<String> {
        match token.table_id()? {
            TableId::TypeDef => {
                let type_def = self.type_def(token)?;
                match type_def.enclosing {
                    Some(outer) if outer != token => {
                        Some(format!("{}/{}", self.type_full_name(outer)?, type_def.name))
                    }
                    _ => Some(join_name(&type_def.namespace, &type_def.name)),
                }
            }
            TableId::TypeRef => {
                let type_ref = self.type_ref(token)?;
                if type_ref.scope.is_table(TableId::TypeRef) && type_ref.scope != token {
                    Some(format!(
                        "{}/{}",
                        self.type_full_name(type_ref.scope)?,
                        type_ref.name
                    ))
                } else {
                    Some(join_name(&type_ref.namespace, &type_ref.name))
                }
            }
            TableId::TypeSpec => Some(self.type_spec(token)?.signature.to_string()),
            _ => None,
        }
    }

    /// Full name of a `MethodDef` or method `MemberRef`, `Type::Name`.
    #[must_use]
    pub fn method_full_name(&self, token: Token) -> Option<String> {
        match token.table_id()? {
            TableId::MethodDef => {
                let method = self.method(token)?;
                Some(format!(
                    "{}::{}",
                    self.type_full_name(method.declaring)?,
                    method.name
                ))
            }
            TableId::MemberRef => {
                let member = self.member_ref(token)?;
                Some(format!(
                    "{}::{}",
                    self.type_full_name(member.parent)?,
                    member.name
                ))
            }
            _ => None,
        }
    }

    /// Iterates the custom attributes applied to `target`.
    pub fn attributes_of(&self, target: Token) -> impl Iterator<Item = &CustomAttribute> {
        self.custom_attributes
            .iter()
            .filter(move |attribute| attribute.parent == target)
    }

    /// Returns the type a custom attribute constructs.
    #[must_use]
    pub fn attribute_type(&self, attribute: &CustomAttribute) -> Option<Token> {
        match attribute.constructor.table_id()? {
            TableId::MethodDef => Some(self.method(attribute.constructor)?.declaring),
            TableId::MemberRef => Some(self.member_ref(attribute.constructor)?.parent),
            _ => None,
        }
    }

    /// Returns `true` if `target` carries an attribute of type `full_name`.
    #[must_use]
    pub fn has_attribute(&self, target: Token, full_name: &str) -> bool {
        self.attributes_of(target).any(|attribute| {
            self.attribute_type(attribute)
                .and_then(|ty| self.type_full_name(ty))
                .as_deref()
                == Some(full_name)
        })
    }

    /// The row key/value metadata is attached to: the assembly, or the module of a netmodule.
    #[must_use]
    pub fn metadata_target(&self) -> Token {
        if self.assembly.is_some() {
            Token::from_parts(TableId::Assembly, 1)
        } else {
            Token::from_parts(TableId::Module, 1)
        }
    }

    /// Returns all key/value pairs in attribute order.
    #[must_use]
    pub fn metadata_entries(&self) -> Vec<MetadataEntry> {
        self.metadata_attributes()
            .filter_map(|index| decode_metadata_value(&self.custom_attributes[index].value))
            .map(|(key, value)| MetadataEntry {
                key,
                value: value.unwrap_or_default(),
            })
            .collect()
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata_entries()
            .into_iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.value)
    }

    /// Stores `value` under `key`, replacing an existing value.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the strings cannot be encoded.
    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        let blob = encode_metadata_value(key, value)?;

        let existing = self.metadata_attributes().find(|index| {
            decode_metadata_value(&self.custom_attributes[*index].value)
                .is_some_and(|(existing, _)| existing == key)
        });
        if let Some(index) = existing {
            self.custom_attributes[index].value = blob;
            return Ok(());
        }

        let attribute_type =
            self.import_core_type(METADATA_ATTRIBUTE_NAMESPACE, METADATA_ATTRIBUTE_NAME);
        let constructor = self.add_member_ref(
            attribute_type,
            ".ctor",
            MemberSig::Method(MethodSignature::new_instance(
                TypeSig::Void,
                vec![TypeSig::String, TypeSig::String],
            )),
        );
        self.custom_attributes.push(CustomAttribute {
            parent: self.metadata_target(),
            constructor,
            value: blob,
        });
        Ok(())
    }

    fn metadata_attributes(&self) -> impl Iterator<Item = usize> + '_ {
        let target = self.metadata_target();
        let full_name = format!("{METADATA_ATTRIBUTE_NAMESPACE}.{METADATA_ATTRIBUTE_NAME}");
        self.custom_attributes
            .iter()
            .enumerate()
            .filter(move |(_, attribute)| {
                attribute.parent == target
                    && self
                        .attribute_type(attribute)
                        .and_then(|ty| self.type_full_name(ty))
                        .is_some_and(|name| name == full_name)
            })
            .map(|(index, _)| index)
    }

    /// Names of all referenced modules.
    pub fn referenced_module_names(&self) -> impl Iterator<Item = &str> {
        self.references.iter().map(|r| r.name.as_str())
    }

    /// Adds a module reference, reusing an existing one with the same name.
    pub fn add_reference(
        &mut self,
        name: &str,
        version: ModuleVersion,
        public_key_token: Option<[u8; 8]>,
    ) -> Token {
        if let Some(existing) = self
            .references
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
        {
            return existing.token;
        }

        let token = row_token(TableId::AssemblyRef, self.references.len());
        self.references.push(ModuleReference {
            token,
            name: name.to_string(),
            version,
            culture: String::new(),
            flags: 0,
            public_key_token,
            public_key: None,
            hash_value: Vec::new(),
        });
        token
    }

    /// Imports a type of a referenced module, reusing an identical import.
    pub fn import_type_ref(&mut self, scope: Token, namespace: &str, name: &str) -> Token {
        if let Some(existing) = self
            .type_refs
            .iter()
            .find(|t| t.scope == scope && t.namespace == namespace && t.name == name)
        {
            return existing.token;
        }

        let token = row_token(TableId::TypeRef, self.type_refs.len());
        self.type_refs.push(TypeRef {
            token,
            scope,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        token
    }

    /// Returns the reference to the core library, adding `mscorlib` if the module has none.
    pub fn core_library(&mut self) -> Token {
        let existing = self.references.iter().find(|r| {
            CORE_LIBRARY_NAMES
                .iter()
                .any(|name| r.name.eq_ignore_ascii_case(name))
        });
        match existing {
            Some(reference) => reference.token,
            None => self.add_reference(
                CORE_LIBRARY,
                CORE_LIBRARY_VERSION,
                Some(CORE_LIBRARY_TOKEN),
            ),
        }
    }

    /// Imports a type of the core library.
    pub fn import_core_type(&mut self, namespace: &str, name: &str) -> Token {
        let scope = self.core_library();
        self.import_type_ref(scope, namespace, name)
    }

    /// Adds a type specification, reusing an identical one.
    pub fn add_type_spec(&mut self, signature: TypeSig) -> Token {
        if let Some(existing) = self.type_specs.iter().find(|s| s.signature == signature) {
            return existing.token;
        }

        let token = row_token(TableId::TypeSpec, self.type_specs.len());
        self.type_specs.push(TypeSpec { token, signature });
        token
    }

    /// Returns a type token usable by `ldtoken`, `box` and `unbox.any` for `signature`.
    ///
    /// Class and value type signatures use their own token, primitive types are imported from
    /// the core library, anything else becomes a type specification.
    pub fn import_type_sig(&mut self, signature: &TypeSig) -> Token {
        match signature {
            TypeSig::Class(token) | TypeSig::ValueType(token) => *token,
            other => match other.core_type_name() {
                Some((namespace, name)) => self.import_core_type(namespace, name),
                None => self.add_type_spec(other.clone()),
            },
        }
    }

    /// Adds a member reference, reusing an identical one.
    pub fn add_member_ref(&mut self, parent: Token, name: &str, signature: MemberSig) -> Token {
        if let Some(existing) = self
            .member_refs
            .iter()
            .find(|m| m.parent == parent && m.name == name && m.signature == signature)
        {
            return existing.token;
        }

        let token = row_token(TableId::MemberRef, self.member_refs.len());
        self.member_refs.push(MemberRef {
            token,
            parent,
            name: name.to_string(),
            signature,
        });
        token
    }

    /// Adds a string literal and returns its `UserString` token.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] if the heap outgrows the token range.
    pub fn add_user_string(&mut self, value: &str) -> Result<Token> {
        self.user_strings.add(value)
    }

    /// Adds a top-level type definition.
    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        flags: TypeAttributes,
        extends: Option<Token>,
    ) -> Token {
        let token = row_token(TableId::TypeDef, self.types.len());
        self.types.push(TypeDef {
            token,
            namespace: namespace.to_string(),
            name: name.to_string(),
            flags,
            extends,
            enclosing: None,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        token
    }

    /// Adds a type nested in `enclosing`.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] if `enclosing` is not a type of this module.
    pub fn add_nested_type(
        &mut self,
        enclosing: Token,
        name: &str,
        flags: TypeAttributes,
        extends: Option<Token>,
    ) -> Result<Token> {
        if self.type_def(enclosing).is_none() {
            return Err(Error::TokenNotFound(enclosing));
        }

        let token = self.add_type("", name, flags, extends);
        if let Some(nested) = self.type_def_mut(token) {
            nested.enclosing = Some(enclosing);
        }
        Ok(token)
    }

    /// Adds a field to `declaring`.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] if `declaring` is not a type of this module.
    pub fn add_field(
        &mut self,
        declaring: Token,
        name: &str,
        flags: FieldAttributes,
        signature: TypeSig,
    ) -> Result<Token> {
        let token = row_token(TableId::Field, self.fields.len());
        let type_def = self
            .type_def_mut(declaring)
            .ok_or(Error::TokenNotFound(declaring))?;
        type_def.fields.push(token);

        self.fields.push(FieldDef {
            token,
            name: name.to_string(),
            flags,
            signature,
            declaring,
            initial_data: None,
        });
        Ok(token)
    }

    /// Adds a method to `declaring`.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] if `declaring` is not a type of this module.
    pub fn add_method(
        &mut self,
        declaring: Token,
        name: &str,
        flags: MethodAttributes,
        impl_flags: MethodImplAttributes,
        signature: MethodSignature,
        body: Option<MethodBody>,
    ) -> Result<Token> {
        let token = row_token(TableId::MethodDef, self.methods.len());
        let type_def = self
            .type_def_mut(declaring)
            .ok_or(Error::TokenNotFound(declaring))?;
        type_def.methods.push(token);

        self.methods.push(MethodDef {
            token,
            name: name.to_string(),
            flags,
            impl_flags,
            signature,
            declaring,
            body,
            params: Vec::new(),
        });
        Ok(token)
    }

    /// Adds a named parameter row to `method`.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] if `method` is not a method of this module.
    pub fn add_param(
        &mut self,
        method: Token,
        sequence: u16,
        name: &str,
        flags: u16,
    ) -> Result<Token> {
        let index = method
            .index()
            .filter(|index| method.is_table(TableId::MethodDef) && *index < self.methods.len())
            .ok_or(Error::TokenNotFound(method))?;

        let token = row_token(TableId::Param, self.params.len());
        self.params.push(ParamDef {
            token,
            flags,
            sequence,
            name: name.to_string(),
            method,
        });

        let params = &self.params;
        let owner = &mut self.methods[index];
        owner.params.push(token);
        owner.params.sort_by_key(|param| {
            lookup(params, TableId::Param, *param).map_or(u16::MAX, |row| row.sequence)
        });
        Ok(token)
    }

    /// Applies an attribute of type `attribute_type`, constructed without arguments, to
    /// `target` and returns the `CustomAttribute` token.
    ///
    /// The constructor is a parameterless `.ctor` of the type: the method itself for a type of
    /// this module, a member reference otherwise.
    ///
    /// # Errors
    /// [`Error::TokenNotFound`] if `target` is no row of this module that can carry attributes
    /// or if a type of this module has no parameterless constructor.
    pub fn add_custom_attribute(&mut self, target: Token, attribute_type: Token) -> Result<Token> {
        if !self.contains_token(target) || CodedIndexType::HasCustomAttribute.encode(target).is_err()
        {
            return Err(Error::TokenNotFound(target));
        }

        let constructor = if attribute_type.is_table(TableId::TypeDef) {
            self.find_method(attribute_type, ".ctor")
                .filter(|ctor| ctor.signature.params.is_empty())
                .map(|ctor| ctor.token)
                .ok_or(Error::TokenNotFound(attribute_type))?
        } else {
            self.add_member_ref(
                attribute_type,
                ".ctor",
                MemberSig::Method(MethodSignature::new_instance(TypeSig::Void, vec![])),
            )
        };

        let token = row_token(TableId::CustomAttribute, self.custom_attributes.len());
        self.custom_attributes.push(CustomAttribute {
            parent: target,
            constructor,
            value: EMPTY_ATTRIBUTE_VALUE.to_vec(),
        });
        Ok(token)
    }
}

fn lookup<T>(rows: &[T], table: TableId, token: Token) -> Option<&T> {
    if !token.is_table(table) {
        return None;
    }
    rows.get(token.index()?)
}

fn join_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

/// Reads a `SerString`, `None` for the null string.
fn read_ser_string(parser: &mut Parser<'_>) -> Result<Option<String>> {
    if parser.peek_byte()? == 0xFF {
        parser.read_le::<u8>()?;
        return Ok(None);
    }
    parser.read_prefixed_string_utf8().map(Some)
}

fn decode_metadata_value(blob: &[u8]) -> Option<(String, Option<String>)> {
    let mut parser = Parser::new(blob);
    if parser.read_le::<u16>().ok()? != 0x0001 {
        return None;
    }
    let key = read_ser_string(&mut parser).ok()??;
    let value = read_ser_string(&mut parser).ok()?;
    Some((key, value))
}

fn encode_metadata_value(key: &str, value: &str) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    writer.write_le(0x0001_u16);
    writer.write_prefixed_string(key)?;
    writer.write_prefixed_string(value)?;
    writer.write_le(0_u16);
    Ok(writer.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Module, Token) {
        let mut module = Module::new("Sample", ModuleVersion::new(1, 0, 0, 0));
        let object = module.import_core_type("System", "Object");
        let ty = module.add_type("Demo", "Widget", TypeAttributes::PUBLIC, Some(object));
        (module, ty)
    }

    #[test]
    fn module_pseudo_type() {
        let module = Module::new("Empty", ModuleVersion::default());
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.types[0].name, MODULE_TYPE_NAME);
        assert_eq!(module.types[0].token.value(), 0x0200_0001);
        assert_eq!(module.module_name, "Empty.dll");
        assert!(module.assembly.is_some());
        assert!(module.contains_token(Token::new(0x2000_0001)));
    }

    #[test]
    fn deterministic_mvid() {
        let a = Module::new("Same", ModuleVersion::new(1, 0, 0, 0));
        let b = Module::new("Same", ModuleVersion::new(1, 0, 0, 0));
        let c = Module::new("Other", ModuleVersion::new(1, 0, 0, 0));
        assert_eq!(a.mvid, b.mvid);
        assert_ne!(a.mvid, c.mvid);
    }

    #[test]
    fn imports_are_reused() {
        let (mut module, _) = sample();
        let first = module.import_core_type("System", "Int32");
        let second = module.import_type_sig(&TypeSig::I4);
        assert_eq!(first, second);
        assert_eq!(module.references.len(), 1);

        let spec = module.import_type_sig(&TypeSig::SzArray(Box::new(TypeSig::I4)));
        assert!(spec.is_table(TableId::TypeSpec));
        assert_eq!(
            module.import_type_sig(&TypeSig::SzArray(Box::new(TypeSig::I4))),
            spec
        );

        let literal = module.add_user_string("a").unwrap();
        assert_eq!(module.add_user_string("a").unwrap(), literal);
        assert_eq!(module.user_string(literal).as_deref(), Some("a"));
        assert!(module.contains_token(literal));
        assert!(!module.contains_token(Token::new(0x7000_0100)));
    }

    #[test]
    fn core_library_follows_existing_reference() {
        let mut module = Module::new("Modern", ModuleVersion::default());
        let runtime = module.add_reference("System.Runtime", ModuleVersion::new(8, 0, 0, 0), None);
        let object = module.import_core_type("System", "Object");

        assert_eq!(module.type_ref(object).unwrap().scope, runtime);
        assert_eq!(module.references.len(), 1);
        assert_eq!(
            module.type_ref_reference(object).map(|r| r.name.as_str()),
            Some("System.Runtime")
        );
    }

    #[test]
    fn nested_type_refs() {
        let (mut module, _) = sample();
        let outer = module.import_core_type("System", "Environment");
        let inner = module.import_type_ref(outer, "", "SpecialFolder");

        assert_eq!(
            module.type_full_name(inner).as_deref(),
            Some("System.Environment/SpecialFolder")
        );
        assert_eq!(
            module.type_ref_reference(inner).map(|r| r.name.as_str()),
            Some(CORE_LIBRARY)
        );
    }

    #[test]
    fn members_and_names() {
        let (mut module, ty) = sample();
        let field = module
            .add_field(ty, "count", FieldAttributes::PRIVATE, TypeSig::I4)
            .unwrap();
        let method = module
            .add_method(
                ty,
                "Run",
                MethodAttributes::PUBLIC,
                MethodImplAttributes::IL,
                MethodSignature::new_instance(TypeSig::Void, vec![TypeSig::I4]),
                None,
            )
            .unwrap();
        let nested = module
            .add_nested_type(ty, "Inner", TypeAttributes::NESTED_PRIVATE, None)
            .unwrap();

        assert_eq!(module.type_def(ty).unwrap().fields, vec![field]);
        assert_eq!(module.method_full_name(method).as_deref(), Some("Demo.Widget::Run"));
        assert_eq!(
            module.type_full_name(nested).as_deref(),
            Some("Demo.Widget/Inner")
        );
        assert_eq!(
            module.find_type_by_full_name("Demo.Widget/Inner").map(|t| t.token),
            Some(nested)
        );
        assert_eq!(module.find_method(ty, "Run").map(|m| m.token), Some(method));
        assert!(module.contains_token(method));
        assert!(!module.contains_token(Token::from_parts(TableId::MethodDef, 2)));
        let missing = Token::from_parts(TableId::TypeDef, 99);
        assert!(module
            .add_field(missing, "x", FieldAttributes::PRIVATE, TypeSig::I4)
            .is_err());

        let returns = module.add_param(method, 0, "", 0).unwrap();
        let count = module.add_param(method, 1, "count", 0).unwrap();
        assert_eq!(module.method(method).unwrap().params, vec![returns, count]);
        assert_eq!(module.param(count).unwrap().name, "count");
        assert!(module.contains_token(count));
    }

    #[test]
    fn custom_attributes() {
        let (mut module, ty) = sample();
        let generated =
            module.import_core_type("System.Runtime.CompilerServices", "CompilerGeneratedAttribute");

        let attribute = module.add_custom_attribute(ty, generated).unwrap();
        assert_eq!(attribute, Token::new(0x0C00_0001));
        assert!(module.has_attribute(
            ty,
            "System.Runtime.CompilerServices.CompilerGeneratedAttribute"
        ));
        assert_eq!(module.attributes_of(ty).count(), 1);
        assert_eq!(module.custom_attributes[0].value, EMPTY_ATTRIBUTE_VALUE);

        assert!(module
            .add_custom_attribute(Token::new(0x0200_0063), generated)
            .is_err());
        assert!(module
            .add_custom_attribute(Token::new(0x7000_0001), generated)
            .is_err());
    }

    #[test]
    fn metadata_entries() {
        let (mut module, _) = sample();
        assert_eq!(module.get_metadata("key"), None);
        module.set_metadata("key", "one").unwrap();
        module.set_metadata("key", "two").unwrap();
        module.set_metadata("other", "").unwrap();
        assert_eq!(module.get_metadata("key").as_deref(), Some("two"));
        assert_eq!(module.metadata_entries().len(), 2);

        let attribute = &module.custom_attributes[0];
        assert_eq!(attribute.parent, Token::new(0x2000_0001));
        assert_eq!(
            attribute.value,
            [0x01, 0x00, 0x03, b'k', b'e', b'y', 0x03, b't', b'w', b'o', 0x00, 0x00]
        );
        assert_eq!(
            module
                .attribute_type(attribute)
                .and_then(|ty| module.type_full_name(ty))
                .as_deref(),
            Some("System.Reflection.AssemblyMetadataAttribute")
        );
    }

    #[test]
    fn null_metadata_value() {
        let blob = [0x01, 0x00, 0x01, b'k', 0xFF, 0x00, 0x00];
        assert_eq!(
            decode_metadata_value(&blob),
            Some(("k".to_string(), None))
        );
        assert_eq!(decode_metadata_value(&[0x02, 0x00]), None);
    }

    #[test]
    fn netmodule_metadata_targets_module() {
        let (mut module, _) = sample();
        module.assembly = None;
        module.set_metadata("key", "value").unwrap();
        assert_eq!(module.custom_attributes[0].parent, Token::new(0x0000_0001));
        assert_eq!(module.get_metadata("key").as_deref(), Some("value"));
    }
}
