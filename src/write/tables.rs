//! Building the metadata section of a module.
//!
//! [`MetadataBuilder`] turns the rows of a regrouped [`Module`] back into tables: every
//! modelled row becomes a [`RawRow`], the kept raw tables are appended, sorted tables are
//! ordered by their key column and the `#~` stream, heaps and metadata root are laid out.

use crate::{
    file::writer::Writer,
    metadata::{
        flags::FieldAttributes,
        identity::ASSEMBLY_FLAG_PUBLIC_KEY,
        module::{MemberSig, Module},
        root::Root,
        signatures::{encode_field_signature, encode_local_signature, TypeSig},
        streams::{BlobBuilder, GuidBuilder, StringsBuilder},
        tables::{columns, Cell, Column, RawRow, RawTable, TablesStream, SORTED_TABLES},
        token::{TableId, Token},
    },
    Result,
};

/// Collects the rows of one module and lays out its metadata.
pub(crate) struct MetadataBuilder<'a> {
    module: &'a Module,
    signatures: RawTable,
}

impl<'a> MetadataBuilder<'a> {
    /// Starts from the stand-alone signatures `module` already has.
    pub(crate) fn new(module: &'a Module) -> Self {
        let signatures = module
            .raw_table(TableId::StandAloneSig)
            .cloned()
            .unwrap_or_else(|| RawTable::new(TableId::StandAloneSig));
        MetadataBuilder { module, signatures }
    }

    /// Returns the `StandAloneSig` token of a local variable list, adding a row for new lists.
    ///
    /// # Errors
    /// Returns the encoding errors of the local types.
    pub(crate) fn locals_token(&mut self, locals: &[TypeSig]) -> Result<Token> {
        let blob = encode_local_signature(locals)?;
        if let Some(index) = self
            .signatures
            .rows
            .iter()
            .position(|row| row.blob(0).is_ok_and(|existing| existing == blob))
        {
            return Ok(row_token(TableId::StandAloneSig, index));
        }

        self.signatures.rows.push(RawRow {
            cells: vec![Cell::Blob(blob)],
        });
        Ok(row_token(TableId::StandAloneSig, self.signatures.rows.len() - 1))
    }

    /// Lays out the metadata section. `method_rvas` and `field_rvas` hold the body and data
    /// RVAs in row order, 0 where there is none.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for values that do not fit their columns and the
    /// signature encoding errors.
    pub(crate) fn finish(self, method_rvas: &[u32], field_rvas: &[u32]) -> Result<Vec<u8>> {
        let module = self.module;
        let mut tables = self.tables(method_rvas, field_rvas)?;
        sort_tables(&mut tables)?;

        let mut strings = StringsBuilder::new();
        let mut blob = BlobBuilder::new();
        let mut guid = GuidBuilder::new();
        let tables_stream = TablesStream::write(&tables, &mut strings, &mut blob, &mut guid)?;
        log::debug!(
            "Metadata of {}: {} tables, #~ {} bytes",
            module.name(),
            tables.iter().filter(|raw| !raw.is_empty()).count(),
            tables_stream.len()
        );

        let strings = strings.finish();
        let user_strings = module.user_strings.to_bytes();
        let guid = guid.finish();
        let blob = blob.finish();
        Root::write(
            &module.image.runtime_version,
            &[
                ("#~", tables_stream.as_slice()),
                ("#Strings", strings.as_slice()),
                ("#US", user_strings.as_slice()),
                ("#GUID", guid.as_slice()),
                ("#Blob", blob.as_slice()),
            ],
        )
    }

    fn tables(self, method_rvas: &[u32], field_rvas: &[u32]) -> Result<Vec<RawTable>> {
        let module = self.module;
        let mut tables = vec![
            table(
                TableId::Module,
                vec![vec![
                    Cell::Value(0),
                    Cell::String(module.module_name.clone()),
                    Cell::Guid(Some(module.mvid)),
                    Cell::Guid(None),
                    Cell::Guid(None),
                ]],
            ),
            table(
                TableId::TypeRef,
                module
                    .type_refs
                    .iter()
                    .map(|type_ref| {
                        vec![
                            Cell::Token(type_ref.scope),
                            Cell::String(type_ref.name.clone()),
                            Cell::String(type_ref.namespace.clone()),
                        ]
                    })
                    .collect(),
            ),
        ];

        let mut type_rows = Vec::with_capacity(module.types.len());
        let (mut next_field, mut next_method) = (1, 1);
        for type_def in &module.types {
            type_rows.push(vec![
                Cell::Value(type_def.flags.bits()),
                Cell::String(type_def.name.clone()),
                Cell::String(type_def.namespace.clone()),
                Cell::Token(type_def.extends.unwrap_or(Token::new(0))),
                Cell::Token(Token::from_parts(TableId::Field, next_field)),
                Cell::Token(Token::from_parts(TableId::MethodDef, next_method)),
            ]);
            next_field += count(type_def.fields.len())?;
            next_method += count(type_def.methods.len())?;
        }
        tables.push(table(TableId::TypeDef, type_rows));

        let mut field_rows = Vec::with_capacity(module.fields.len());
        for field in &module.fields {
            let mut flags = field.flags;
            flags.set(FieldAttributes::HAS_FIELD_RVA, field.initial_data.is_some());
            field_rows.push(vec![
                Cell::Value(narrow(flags.bits(), "Field flags")?),
                Cell::String(field.name.clone()),
                Cell::Blob(encode_field_signature(&field.signature)?),
            ]);
        }
        tables.push(table(TableId::Field, field_rows));

        let mut method_rows = Vec::with_capacity(module.methods.len());
        let mut next_param = 1;
        for (index, method) in module.methods.iter().enumerate() {
            method_rows.push(vec![
                Cell::Value(method_rvas.get(index).copied().unwrap_or_default()),
                Cell::Value(narrow(method.impl_flags.bits(), "Method impl flags")?),
                Cell::Value(narrow(method.flags.bits(), "Method flags")?),
                Cell::String(method.name.clone()),
                Cell::Blob(encode(|writer| method.signature.encode(writer))?),
                Cell::Token(Token::from_parts(TableId::Param, next_param)),
            ]);
            next_param += count(method.params.len())?;
        }
        tables.push(table(TableId::MethodDef, method_rows));

        tables.push(table(
            TableId::Param,
            module
                .params
                .iter()
                .map(|param| {
                    vec![
                        Cell::Value(u32::from(param.flags)),
                        Cell::Value(u32::from(param.sequence)),
                        Cell::String(param.name.clone()),
                    ]
                })
                .collect(),
        ));

        let mut member_rows = Vec::with_capacity(module.member_refs.len());
        for member in &module.member_refs {
            let signature = match &member.signature {
                MemberSig::Method(signature) => encode(|writer| signature.encode(writer))?,
                MemberSig::Field(signature) => encode_field_signature(signature)?,
            };
            member_rows.push(vec![
                Cell::Token(member.parent),
                Cell::String(member.name.clone()),
                Cell::Blob(signature),
            ]);
        }
        tables.push(table(TableId::MemberRef, member_rows));

        tables.push(table(
            TableId::CustomAttribute,
            module
                .custom_attributes
                .iter()
                .map(|attribute| {
                    vec![
                        Cell::Token(attribute.parent),
                        Cell::Token(attribute.constructor),
                        Cell::Blob(attribute.value.clone()),
                    ]
                })
                .collect(),
        ));
        tables.push(self.signatures);

        let mut spec_rows = Vec::with_capacity(module.type_specs.len());
        for spec in &module.type_specs {
            spec_rows.push(vec![Cell::Blob(encode(|writer| spec.signature.encode(writer))?)]);
        }
        tables.push(table(TableId::TypeSpec, spec_rows));

        if let Some(assembly) = &module.assembly {
            let version = &module.identity.version;
            let public_key = module.identity.public_key.clone().unwrap_or_default();
            let flags = if public_key.is_empty() {
                assembly.flags & !ASSEMBLY_FLAG_PUBLIC_KEY
            } else {
                assembly.flags | ASSEMBLY_FLAG_PUBLIC_KEY
            };
            tables.push(table(
                TableId::Assembly,
                vec![vec![
                    Cell::Value(assembly.hash_algorithm),
                    Cell::Value(u32::from(version.major)),
                    Cell::Value(u32::from(version.minor)),
                    Cell::Value(u32::from(version.build)),
                    Cell::Value(u32::from(version.revision)),
                    Cell::Value(flags),
                    Cell::Blob(public_key),
                    Cell::String(module.identity.name.clone()),
                    Cell::String(assembly.culture.clone()),
                ]],
            ));
        }

        tables.push(table(
            TableId::AssemblyRef,
            module
                .references
                .iter()
                .map(|reference| {
                    let (flags, key_or_token) = match &reference.public_key {
                        Some(key) => (reference.flags | ASSEMBLY_FLAG_PUBLIC_KEY, key.clone()),
                        None => (
                            reference.flags & !ASSEMBLY_FLAG_PUBLIC_KEY,
                            reference
                                .public_key_token
                                .map(|token| token.to_vec())
                                .unwrap_or_default(),
                        ),
                    };
                    vec![
                        Cell::Value(u32::from(reference.version.major)),
                        Cell::Value(u32::from(reference.version.minor)),
                        Cell::Value(u32::from(reference.version.build)),
                        Cell::Value(u32::from(reference.version.revision)),
                        Cell::Value(flags),
                        Cell::Blob(key_or_token),
                        Cell::String(reference.name.clone()),
                        Cell::String(reference.culture.clone()),
                        Cell::Blob(reference.hash_value.clone()),
                    ]
                })
                .collect(),
        ));

        tables.push(table(
            TableId::NestedClass,
            module
                .types
                .iter()
                .filter_map(|type_def| {
                    type_def.enclosing.map(|enclosing| {
                        vec![Cell::Token(type_def.token), Cell::Token(enclosing)]
                    })
                })
                .collect(),
        ));

        tables.push(table(
            TableId::FieldRVA,
            module
                .fields
                .iter()
                .enumerate()
                .filter(|(_, field)| field.initial_data.is_some())
                .map(|(index, field)| {
                    vec![
                        Cell::Value(field_rvas.get(index).copied().unwrap_or_default()),
                        Cell::Token(field.token),
                    ]
                })
                .collect(),
        ));

        tables.extend(
            module
                .raw_tables
                .iter()
                .filter(|raw| raw.id != TableId::StandAloneSig)
                .cloned(),
        );
        Ok(tables)
    }
}

fn table(id: TableId, rows: Vec<Vec<Cell>>) -> RawTable {
    RawTable {
        id,
        rows: rows.into_iter().map(|cells| RawRow { cells }).collect(),
    }
}

fn encode(f: impl FnOnce(&mut Writer) -> Result<()>) -> Result<Vec<u8>> {
    let mut writer = Writer::new();
    f(&mut writer)?;
    Ok(writer.into_vec())
}

#[allow(clippy::cast_possible_truncation)]
fn row_token(table: TableId, index: usize) -> Token {
    Token::from_parts(table, (index + 1) as u32)
}

fn count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| malformed_error!("Member list too long"))
}

fn narrow(value: u32, what: &str) -> Result<u32> {
    u16::try_from(value)
        .map(u32::from)
        .map_err(|_| malformed_error!("{} 0x{:x} do not fit 16 bits", what, value))
}

/// Orders the sorted tables by their key column, primary key then original order.
/// `GenericParam` rows of one owner are ordered by number.
///
/// Moving a row renumbers it, so references to the moved table are rewritten in every table
/// after each sort.
fn sort_tables(tables: &mut [RawTable]) -> Result<()> {
    for (id, key) in SORTED_TABLES {
        let Some(position) = tables.iter().position(|raw| raw.id == *id) else {
            continue;
        };

        let column = columns(*id)[*key];
        let raw = &tables[position];
        let mut keys = Vec::with_capacity(raw.rows.len());
        for (index, row) in raw.rows.iter().enumerate() {
            let primary = match column {
                Column::Index(_) => row.token(*key)?.row(),
                Column::Coded(coded) => coded.encode(row.token(*key)?)?,
                _ => row.value(*key)?,
            };
            let secondary = if *id == TableId::GenericParam {
                row.value(0)?
            } else {
                0
            };
            keys.push((primary, secondary, index));
        }

        if keys.windows(2).all(|pair| pair[0] <= pair[1]) {
            continue;
        }
        keys.sort_unstable();

        let mut new_rows = vec![0_u32; keys.len()];
        for (new_index, (_, _, old_index)) in keys.iter().enumerate() {
            new_rows[*old_index] = count(new_index + 1)?;
        }
        let old_rows = std::mem::take(&mut tables[position].rows);
        let mut slots: Vec<Option<RawRow>> = old_rows.into_iter().map(Some).collect();
        tables[position].rows = keys
            .iter()
            .filter_map(|(_, _, old_index)| slots[*old_index].take())
            .collect();

        let moved = *id;
        for raw in tables.iter_mut() {
            for row in &mut raw.rows {
                row.remap_tokens(&mut |token| {
                    match token.index().filter(|_| token.is_table(moved)) {
                        Some(index) => new_rows
                            .get(index)
                            .map_or(token, |row| Token::from_parts(moved, *row)),
                        None => token,
                    }
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{
            root::Root,
            streams::{Blob, Guid, Strings},
            tables::Heaps,
        },
        test::calculator_module,
    };

    fn read_back(metadata: &[u8]) -> TablesStream {
        let root = Root::read(metadata).unwrap();
        let heaps = Heaps {
            strings: Strings::from(root.stream(metadata, "#Strings").unwrap()).unwrap(),
            blob: Blob::from(root.stream(metadata, "#Blob").unwrap()).unwrap(),
            guid: Guid::from(root.stream(metadata, "#GUID").unwrap()).unwrap(),
        };
        TablesStream::read(root.stream(metadata, "#~").unwrap(), &heaps).unwrap()
    }

    #[test]
    fn local_signatures_are_shared() {
        let module = calculator_module();
        let mut builder = MetadataBuilder::new(&module);
        let first = builder.locals_token(&[TypeSig::I4, TypeSig::String]).unwrap();
        let again = builder.locals_token(&[TypeSig::I4, TypeSig::String]).unwrap();
        let other = builder.locals_token(&[TypeSig::I8]).unwrap();

        assert_eq!(first, Token::new(0x1100_0001));
        assert_eq!(again, first);
        assert_eq!(other, Token::new(0x1100_0002));
    }

    #[test]
    fn member_lists_start_per_owner() {
        let module = calculator_module();
        let metadata = MetadataBuilder::new(&module)
            .finish(&vec![0; module.methods.len()], &vec![0; module.fields.len()])
            .unwrap();
        let stream = read_back(&metadata);

        let types = stream.rows(TableId::TypeDef);
        assert_eq!(types.len(), module.types.len());
        assert_eq!(types[0].string(1).unwrap(), "<Module>");
        let mut expected = 1;
        for (row, type_def) in types.iter().zip(&module.types) {
            assert_eq!(row.token(5).unwrap().row(), expected);
            expected += type_def.methods.len() as u32;
        }

        let module_row = &stream.rows(TableId::Module)[0];
        assert_eq!(module_row.string(1).unwrap(), "Calculator.dll");
        assert_eq!(module_row.guid(2).unwrap(), Some(module.mvid));
    }

    #[test]
    fn sorted_tables_follow_their_key() {
        let parent = |row: u32| Cell::Token(Token::from_parts(TableId::TypeDef, row));
        let mut tables = vec![
            table(
                TableId::CustomAttribute,
                vec![
                    vec![
                        parent(3),
                        Cell::Token(Token::new(0x0A00_0001)),
                        Cell::Blob(vec![1, 0, 0, 0]),
                    ],
                    vec![
                        parent(1),
                        Cell::Token(Token::new(0x0A00_0002)),
                        Cell::Blob(vec![1, 0, 0, 0]),
                    ],
                ],
            ),
            table(
                TableId::GenericParam,
                vec![
                    vec![
                        Cell::Value(1),
                        Cell::Value(0),
                        parent(2),
                        Cell::String("U".to_string()),
                    ],
                    vec![
                        Cell::Value(0),
                        Cell::Value(0),
                        parent(2),
                        Cell::String("T".to_string()),
                    ],
                ],
            ),
            table(
                TableId::GenericParamConstraint,
                vec![vec![
                    Cell::Token(Token::new(0x2A00_0001)),
                    Cell::Token(Token::new(0x0100_0001)),
                ]],
            ),
        ];

        sort_tables(&mut tables).unwrap();

        assert_eq!(tables[0].rows[0].token(1).unwrap(), Token::new(0x0A00_0002));
        assert_eq!(tables[1].rows[0].string(3).unwrap(), "T");
        // the constraint follows its parameter to row 2
        assert_eq!(tables[2].rows[0].token(0).unwrap(), Token::new(0x2A00_0002));
    }
}
