//! Loading a module from a PE image.
//!
//! The loader walks the same chain as every ECMA-335 reader: PE container, CLI header,
//! metadata root, heaps and the `#~` stream. Tables the [`Module`] models are interpreted into
//! rows with resolved names and signatures, member lists become owner links, `NestedClass`
//! becomes [`TypeDef::enclosing`] and `FieldRVA` becomes [`FieldDef::initial_data`]. Every
//! other table is kept as a [`crate::metadata::tables::RawTable`].
//!
//! Images the writer could not reproduce faithfully are refused with
//! [`Error::NotSupported`]: uncompressed (`#-`) metadata, indirection tables, native entry
//! points, vtable fixups, ready-to-run code and native method bodies.

use std::{ops::Range, path::Path};

use goblin::pe::data_directories::DataDirectoryType;

use crate::{
    file::{parser::Parser, File},
    metadata::{
        cor20header::{CliFlags, Cor20Header},
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, TypeAttributes},
        identity::{
            public_key_token, AssemblyInfo, ModuleIdentity, ModuleVersion,
            ASSEMBLY_FLAG_PUBLIC_KEY,
        },
        image::{ImageInfo, Win32Resources},
        method::MethodBody,
        module::{
            CustomAttribute, FieldDef, MemberRef, MemberSig, MethodDef, Module, ModuleReference,
            ParamDef, TypeDef, TypeRef, TypeSpec,
        },
        root::Root,
        signatures::{
            parse_field_signature, parse_local_signature, MethodSignature, TypeSig,
            SIGNATURE_FIELD,
        },
        streams::{Blob, Guid, Strings, UserStringHeap},
        tables::{Heaps, RawRow, TablesStream},
        token::{TableId, Token},
    },
    Error, Result,
};

/// Tables that only exist in uncompressed or edit-and-continue metadata.
const INDIRECTION_TABLES: &[TableId] = &[
    TableId::FieldPtr,
    TableId::MethodPtr,
    TableId::ParamPtr,
    TableId::EventPtr,
    TableId::PropertyPtr,
];

impl Module {
    /// Loads the module at `path`.
    ///
    /// The file is mapped only while the image is parsed.
    ///
    /// # Errors
    /// Returns [`Error::FileError`] if the file cannot be read and the errors of
    /// [`Module::from_pe`] otherwise.
    pub fn from_file(path: &Path) -> Result<Module> {
        let file = File::from_file(path)?;
        Self::from_pe(&file)
    }

    /// Loads a module from an owned image.
    ///
    /// # Errors
    /// See [`Module::from_pe`].
    pub fn from_mem(data: Vec<u8>) -> Result<Module> {
        let file = File::from_mem(data)?;
        Self::from_pe(&file)
    }

    /// Loads a module from image bytes.
    ///
    /// # Errors
    /// See [`Module::from_pe`].
    pub fn parse(data: &[u8]) -> Result<Module> {
        Self::from_mem(data.to_vec())
    }

    /// Loads a module from a parsed PE image.
    ///
    /// # Errors
    /// Returns [`Error::Malformed`] / [`Error::OutOfBounds`] for damaged metadata and
    /// [`Error::NotSupported`] for images that are not pure IL with compressed metadata.
    pub fn from_pe(file: &File) -> Result<Module> {
        let (clr_rva, clr_size) = file.clr();
        let cor20 = Cor20Header::read(file.rva_slice(to_u32(clr_rva)?, clr_size)?)?;

        if cor20.flags.contains(CliFlags::NATIVE_ENTRYPOINT)
            || cor20.vtable_fixups_size != 0
            || cor20.managed_native_header_size != 0
        {
            log::warn!("Image contains native code, flags {:?}", cor20.flags);
            return Err(Error::NotSupported);
        }

        let metadata = file.rva_slice(cor20.meta_data_rva, cor20.meta_data_size as usize)?;
        let root = Root::read(metadata)?;
        if root.stream(metadata, "#-").is_some() {
            log::warn!("Uncompressed metadata is not supported");
            return Err(Error::NotSupported);
        }
        let tables_data = root
            .stream(metadata, "#~")
            .ok_or_else(|| malformed_error!("Metadata has no #~ stream"))?;

        let heaps = Heaps {
            strings: Strings::from(root.stream(metadata, "#Strings").unwrap_or_default())?,
            blob: Blob::from(root.stream(metadata, "#Blob").unwrap_or_default())?,
            guid: Guid::from(root.stream(metadata, "#GUID").unwrap_or_default())?,
        };
        let user_strings = UserStringHeap::from(root.stream(metadata, "#US").unwrap_or_default())?;

        let mut tables = TablesStream::read(tables_data, &heaps)?;
        for table in INDIRECTION_TABLES {
            if !tables.rows(*table).is_empty() {
                log::warn!("Indirection table {} is not supported", table);
                return Err(Error::NotSupported);
            }
        }
        tables.take(TableId::EncLog);
        tables.take(TableId::EncMap);

        let mut loader = Loader {
            file,
            tables,
            is_64: file.headers().is_64,
        };
        loader.build(cor20, root, user_strings)
    }
}

struct Loader<'a> {
    file: &'a File,
    tables: TablesStream,
    is_64: bool,
}

impl Loader<'_> {
    fn build(
        &mut self,
        cor20: Cor20Header,
        root: Root,
        user_strings: UserStringHeap,
    ) -> Result<Module> {
        let module_rows = self.tables.take(TableId::Module);
        let module_row = module_rows
            .first()
            .ok_or_else(|| malformed_error!("Metadata has no Module row"))?;
        let module_name = module_row.string(1)?.to_string();
        let mvid = module_row.guid(2)?.unwrap_or(uguid::Guid::ZERO);

        let (identity, assembly) = match self.tables.take(TableId::Assembly).first() {
            Some(row) => {
                let public_key = row.blob(6)?;
                let identity = ModuleIdentity {
                    name: row.string(7)?.to_string(),
                    version: read_version(row, 1)?,
                    public_key: (!public_key.is_empty()).then(|| public_key.to_vec()),
                };
                let assembly = AssemblyInfo {
                    hash_algorithm: row.value(0)?,
                    flags: row.value(5)?,
                    culture: row.string(8)?.to_string(),
                };
                (identity, Some(assembly))
            }
            None => (
                ModuleIdentity::new(file_stem(&module_name), ModuleVersion::default()),
                None,
            ),
        };

        let references = self.references()?;
        let type_refs = self.type_refs()?;
        let type_specs = self.type_specs()?;
        let member_refs = self.member_refs()?;
        let (mut types, fields, methods, params) = self.definitions()?;

        for row in self.tables.take(TableId::NestedClass) {
            let nested = row.token(0)?;
            let enclosing = row.token(1)?;
            let index = nested
                .index()
                .filter(|index| *index < types.len())
                .ok_or(Error::TokenNotFound(nested))?;
            types[index].enclosing = Some(enclosing);
        }

        let custom_attributes = self
            .tables
            .take(TableId::CustomAttribute)
            .iter()
            .map(|row| {
                Ok(CustomAttribute {
                    parent: row.token(0)?,
                    constructor: row.token(1)?,
                    value: row.blob(2)?.to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let entry_point = match cor20.entry_point_token {
            0 => None,
            value if Token::new(value).is_table(TableId::MethodDef) => Some(Token::new(value)),
            value => {
                log::warn!("Entry point 0x{value:08x} is not a method of the module");
                return Err(Error::NotSupported);
            }
        };

        let image = ImageInfo {
            headers: self.file.headers(),
            cli_flags: cor20.flags,
            runtime_version: root.version,
            resources: if cor20.resource_size == 0 {
                Vec::new()
            } else {
                self.file
                    .rva_slice(cor20.resource_rva, cor20.resource_size as usize)?
                    .to_vec()
            },
            strong_name_signature_size: cor20.strong_name_signature_size,
            win32_resources: self.win32_resources()?,
        };

        let raw_tables = std::mem::take(&mut self.tables.tables);

        Ok(Module {
            identity,
            module_name,
            mvid,
            assembly,
            references,
            type_refs,
            type_specs,
            member_refs,
            types,
            fields,
            methods,
            params,
            custom_attributes,
            user_strings,
            raw_tables,
            entry_point,
            image,
        })
    }

    fn references(&mut self) -> Result<Vec<ModuleReference>> {
        self.tables
            .take(TableId::AssemblyRef)
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let flags = row.value(4)?;
                let key_or_token = row.blob(5)?;
                let (public_key, token) = if flags & ASSEMBLY_FLAG_PUBLIC_KEY != 0 {
                    (
                        Some(key_or_token.to_vec()),
                        (!key_or_token.is_empty()).then(|| public_key_token(key_or_token)),
                    )
                } else {
                    (None, <[u8; 8]>::try_from(key_or_token).ok())
                };

                Ok(ModuleReference {
                    token: row_token(TableId::AssemblyRef, index),
                    name: row.string(6)?.to_string(),
                    version: read_version(row, 0)?,
                    culture: row.string(7)?.to_string(),
                    flags,
                    public_key_token: token,
                    public_key,
                    hash_value: row.blob(8)?.to_vec(),
                })
            })
            .collect()
    }

    fn type_refs(&mut self) -> Result<Vec<TypeRef>> {
        self.tables
            .take(TableId::TypeRef)
            .iter()
            .enumerate()
            .map(|(index, row)| {
                Ok(TypeRef {
                    token: row_token(TableId::TypeRef, index),
                    scope: row.token(0)?,
                    name: row.string(1)?.to_string(),
                    namespace: row.string(2)?.to_string(),
                })
            })
            .collect()
    }

    fn type_specs(&mut self) -> Result<Vec<TypeSpec>> {
        self.tables
            .take(TableId::TypeSpec)
            .iter()
            .enumerate()
            .map(|(index, row)| {
                Ok(TypeSpec {
                    token: row_token(TableId::TypeSpec, index),
                    signature: TypeSig::parse(&mut Parser::new(row.blob(0)?))?,
                })
            })
            .collect()
    }

    fn member_refs(&mut self) -> Result<Vec<MemberRef>> {
        self.tables
            .take(TableId::MemberRef)
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let blob = row.blob(2)?;
                let signature = if blob.first() == Some(&SIGNATURE_FIELD) {
                    MemberSig::Field(parse_field_signature(blob)?)
                } else {
                    MemberSig::Method(MethodSignature::parse(&mut Parser::new(blob))?)
                };

                Ok(MemberRef {
                    token: row_token(TableId::MemberRef, index),
                    parent: row.token(0)?,
                    name: row.string(1)?.to_string(),
                    signature,
                })
            })
            .collect()
    }

    #[allow(clippy::type_complexity)]
    fn definitions(
        &mut self,
    ) -> Result<(Vec<TypeDef>, Vec<FieldDef>, Vec<MethodDef>, Vec<ParamDef>)> {
        let type_rows = self.tables.take(TableId::TypeDef);
        let field_rows = self.tables.take(TableId::Field);
        let method_rows = self.tables.take(TableId::MethodDef);
        let param_rows = self.tables.take(TableId::Param);

        let field_ranges = member_ranges(&type_rows, 4, field_rows.len())?;
        let method_ranges = member_ranges(&type_rows, 5, method_rows.len())?;
        let param_ranges = member_ranges(&method_rows, 5, param_rows.len())?;

        let mut types = Vec::with_capacity(type_rows.len());
        let mut field_owners = vec![None; field_rows.len()];
        let mut method_owners = vec![None; method_rows.len()];
        for (index, row) in type_rows.iter().enumerate() {
            let token = row_token(TableId::TypeDef, index);
            let extends = row.token(3)?;
            for field in field_ranges[index].clone() {
                field_owners[field] = Some(token);
            }
            for method in method_ranges[index].clone() {
                method_owners[method] = Some(token);
            }

            types.push(TypeDef {
                token,
                flags: TypeAttributes::from_bits_retain(row.value(0)?),
                name: row.string(1)?.to_string(),
                namespace: row.string(2)?.to_string(),
                extends: (!extends.is_null()).then_some(extends),
                enclosing: None,
                fields: field_ranges[index]
                    .clone()
                    .map(|field| row_token(TableId::Field, field))
                    .collect(),
                methods: method_ranges[index]
                    .clone()
                    .map(|method| row_token(TableId::MethodDef, method))
                    .collect(),
            });
        }

        let mut fields = Vec::with_capacity(field_rows.len());
        for (index, row) in field_rows.iter().enumerate() {
            let token = row_token(TableId::Field, index);
            fields.push(FieldDef {
                token,
                flags: FieldAttributes::from_bits_retain(row.value(0)?),
                name: row.string(1)?.to_string(),
                signature: parse_field_signature(row.blob(2)?)?,
                declaring: field_owners[index]
                    .ok_or_else(|| malformed_error!("Field {} has no declaring type", token))?,
                initial_data: None,
            });
        }
        self.field_data(&mut fields)?;

        let mut methods = Vec::with_capacity(method_rows.len());
        let mut param_owners = vec![None; param_rows.len()];
        for (index, row) in method_rows.iter().enumerate() {
            let token = row_token(TableId::MethodDef, index);
            for param in param_ranges[index].clone() {
                param_owners[param] = Some(token);
            }

            let rva = row.value(0)?;
            let impl_flags = MethodImplAttributes::from_bits_retain(row.value(1)?);
            let body = if rva == 0 {
                None
            } else if row.value(1)? & 0x0003 != 0 {
                log::warn!("Method {} has a native body", token);
                return Err(Error::NotSupported);
            } else {
                Some(self.method_body(rva)?)
            };

            methods.push(MethodDef {
                token,
                impl_flags,
                flags: MethodAttributes::from_bits_retain(row.value(2)?),
                name: row.string(3)?.to_string(),
                signature: MethodSignature::parse(&mut Parser::new(row.blob(4)?))?,
                declaring: method_owners[index]
                    .ok_or_else(|| malformed_error!("Method {} has no declaring type", token))?,
                body,
                params: param_ranges[index]
                    .clone()
                    .map(|param| row_token(TableId::Param, param))
                    .collect(),
            });
        }

        let params = param_rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let token = row_token(TableId::Param, index);
                Ok(ParamDef {
                    token,
                    flags: u16::try_from(row.value(0)?).unwrap_or_default(),
                    sequence: u16::try_from(row.value(1)?).unwrap_or_default(),
                    name: row.string(2)?.to_string(),
                    method: param_owners[index]
                        .ok_or_else(|| malformed_error!("Param {} has no method", token))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok((types, fields, methods, params))
    }

    fn method_body(&self, rva: u32) -> Result<MethodBody> {
        let end = self
            .file
            .section_end(rva)
            .ok_or_else(|| malformed_error!("Method body RVA 0x{:x} is not mapped", rva))?;
        let data = self.file.rva_slice(rva, (end - rva) as usize)?;

        let (mut body, locals) = MethodBody::parse_with_locals(data)?;
        if !locals.is_null() {
            let signature = self
                .tables
                .tables
                .iter()
                .find(|raw| raw.id == TableId::StandAloneSig)
                .and_then(|raw| raw.row(locals))
                .ok_or(Error::TokenNotFound(locals))?;
            body.locals = parse_local_signature(signature.blob(0)?)?;
        }
        Ok(body)
    }

    /// Moves the `FieldRVA` data into the fields it belongs to.
    fn field_data(&mut self, fields: &mut [FieldDef]) -> Result<()> {
        let rows = self.tables.take(TableId::FieldRVA);
        let mut starts: Vec<u32> = rows
            .iter()
            .map(|row| row.value(0))
            .collect::<Result<Vec<_>>>()?;
        starts.sort_unstable();

        for row in &rows {
            let rva = row.value(0)?;
            let field = row.token(1)?;
            let section_end = self
                .file
                .section_end(rva)
                .ok_or_else(|| malformed_error!("Field data RVA 0x{:x} is not mapped", rva))?;
            let index = field
                .index()
                .filter(|index| *index < fields.len())
                .ok_or(Error::TokenNotFound(field))?;

            let size = match self.data_size(&fields[index].signature) {
                Some(size) => size,
                None => starts
                    .iter()
                    .find(|start| **start > rva)
                    .map_or(section_end, |next| (*next).min(section_end))
                    - rva,
            };
            let size = size.min(section_end - rva);
            fields[index].initial_data = Some(self.file.rva_slice(rva, size as usize)?.to_vec());
        }
        Ok(())
    }

    /// Size of the static data of a field type, if the metadata declares it.
    fn data_size(&self, signature: &TypeSig) -> Option<u32> {
        match signature.unmodified() {
            TypeSig::Boolean | TypeSig::I1 | TypeSig::U1 => Some(1),
            TypeSig::Char | TypeSig::I2 | TypeSig::U2 => Some(2),
            TypeSig::I4 | TypeSig::U4 | TypeSig::R4 => Some(4),
            TypeSig::I8 | TypeSig::U8 | TypeSig::R8 => Some(8),
            TypeSig::I | TypeSig::U => Some(if self.is_64 { 8 } else { 4 }),
            TypeSig::ValueType(token) if token.is_table(TableId::TypeDef) => self
                .tables
                .rows(TableId::ClassLayout)
                .iter()
                .find(|row| row.token(2).ok() == Some(*token))
                .and_then(|row| row.value(1).ok())
                .filter(|size| *size != 0),
            _ => None,
        }
    }

    fn win32_resources(&self) -> Result<Option<Win32Resources>> {
        let Some((rva, size)) = self.file.get_data_directory(DataDirectoryType::ResourceTable)
        else {
            return Ok(None);
        };
        let end = self
            .file
            .section_end(rva)
            .ok_or_else(|| malformed_error!("Resource directory 0x{:x} is not mapped", rva))?;

        Ok(Some(Win32Resources {
            rva,
            size,
            data: self.file.rva_slice(rva, (end - rva) as usize)?.to_vec(),
        }))
    }
}

#[allow(clippy::cast_possible_truncation)]
fn row_token(table: TableId, index: usize) -> Token {
    Token::from_parts(table, (index + 1) as u32)
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Value 0x{:x} exceeds 32 bits", value))
}

fn read_version(row: &RawRow, first: usize) -> Result<ModuleVersion> {
    let part = |column: usize| -> Result<u16> {
        u16::try_from(row.value(column)?)
            .map_err(|_| malformed_error!("Version component out of range"))
    };
    Ok(ModuleVersion::new(
        part(first)?,
        part(first + 1)?,
        part(first + 2)?,
        part(first + 3)?,
    ))
}

/// Splits a member table into the ranges the list column of `owners` starts.
fn member_ranges(owners: &[RawRow], column: usize, count: usize) -> Result<Vec<Range<usize>>> {
    let mut starts = Vec::with_capacity(owners.len());
    for row in owners {
        let start = row.token(column)?.row() as usize;
        // a list past the table end means an empty list
        starts.push(start.clamp(1, count + 1) - 1);
    }

    let mut ranges = Vec::with_capacity(owners.len());
    for (index, start) in starts.iter().enumerate() {
        let end = starts.get(index + 1).copied().unwrap_or(count);
        if end < *start {
            return Err(malformed_error!(
                "Member lists are not ascending at row {}",
                index + 1
            ));
        }
        ranges.push(*start..end);
    }
    Ok(ranges)
}

fn file_stem(module_name: &str) -> &str {
    [".dll", ".exe", ".netmodule"]
        .iter()
        .find_map(|extension| {
            module_name
                .len()
                .checked_sub(extension.len())
                .filter(|split| module_name[*split..].eq_ignore_ascii_case(extension))
                .map(|split| &module_name[..split])
        })
        .unwrap_or(module_name)
}
