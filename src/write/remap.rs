//! Row renumbering before a module is written.
//!
//! The file format finds the fields and methods of a type through the first row of a
//! contiguous run, and the parameters of a method the same way. The model appends members
//! wherever they are added, so [`regroup`] reorders `Field`, `MethodDef` and `Param` rows by
//! owner and rewrites every token that points at a moved row: owner lists, member reference
//! parents, custom attributes, raw table cells, the entry point and the token operands of
//! method bodies.

use crate::{
    assembly::{decode_stream, Operand},
    metadata::{
        module::Module,
        token::{TableId, Token},
    },
    Error, Result,
};

/// Old row index to new 1-based row of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowMap {
    table: TableId,
    rows: Vec<u32>,
}

impl RowMap {
    /// Builds the map from the old tokens in their new order.
    fn from_order(table: TableId, order: &[Token], len: usize) -> Result<RowMap> {
        let mut rows = vec![0_u32; len];
        for (position, token) in order.iter().enumerate() {
            let slot = token
                .index()
                .filter(|_| token.is_table(table))
                .and_then(|index| rows.get_mut(index))
                .ok_or(Error::TokenNotFound(*token))?;
            if *slot != 0 {
                return Err(malformed_error!("{} is listed by two owners", token));
            }
            *slot = u32::try_from(position + 1)
                .map_err(|_| malformed_error!("Table {} has too many rows", table))?;
        }

        if let Some(orphan) = rows.iter().position(|row| *row == 0) {
            return Err(malformed_error!(
                "{} row {} has no owner",
                table,
                orphan + 1
            ));
        }
        Ok(RowMap { table, rows })
    }

    /// Returns `true` if no row moves.
    pub(crate) fn is_identity(&self) -> bool {
        self.rows
            .iter()
            .enumerate()
            .all(|(index, row)| *row as usize == index + 1)
    }

    /// Maps a token of this table, other tokens pass unchanged.
    pub(crate) fn apply(&self, token: Token) -> Token {
        if !token.is_table(self.table) {
            return token;
        }
        match token.index().and_then(|index| self.rows.get(index)) {
            Some(row) => Token::from_parts(self.table, *row),
            None => token,
        }
    }

    fn position_of(&self, new_row: usize) -> Option<usize> {
        self.rows.iter().position(|row| *row as usize == new_row)
    }
}

/// Returns a copy of `module` with members grouped by owner.
///
/// # Errors
/// Returns [`Error::Malformed`] for members listed by no owner or by two owners and the
/// decoding errors of method bodies whose operands must be rewritten.
pub(crate) fn regroup(module: &Module) -> Result<Module> {
    let field_order: Vec<Token> = module
        .types
        .iter()
        .flat_map(|type_def| type_def.fields.iter().copied())
        .collect();
    let method_order: Vec<Token> = module
        .types
        .iter()
        .flat_map(|type_def| type_def.methods.iter().copied())
        .collect();

    let fields = RowMap::from_order(TableId::Field, &field_order, module.fields.len())?;
    let methods = RowMap::from_order(TableId::MethodDef, &method_order, module.methods.len())?;

    let param_order: Vec<Token> = method_order
        .iter()
        .filter_map(|token| module.method(*token))
        .flat_map(|method| method.params.iter().copied())
        .collect();
    let params = RowMap::from_order(TableId::Param, &param_order, module.params.len())?;

    let mut result = module.clone();
    if fields.is_identity() && methods.is_identity() && params.is_identity() {
        return Ok(result);
    }

    let remap = |token: Token| params.apply(methods.apply(fields.apply(token)));
    log::debug!("Regrouping members of {}", module.name());

    result.fields = reorder(&module.fields, &fields);
    result.methods = reorder(&module.methods, &methods);
    result.params = reorder(&module.params, &params);

    for type_def in &mut result.types {
        remap_all(&mut type_def.fields, remap);
        remap_all(&mut type_def.methods, remap);
    }
    for field in &mut result.fields {
        field.token = remap(field.token);
    }
    for method in &mut result.methods {
        method.token = remap(method.token);
        remap_all(&mut method.params, remap);
        if let Some(body) = &mut method.body {
            remap_code(&mut body.code, remap)?;
        }
    }
    for param in &mut result.params {
        param.token = remap(param.token);
        param.method = remap(param.method);
    }
    for member in &mut result.member_refs {
        member.parent = remap(member.parent);
    }
    for attribute in &mut result.custom_attributes {
        attribute.parent = remap(attribute.parent);
        attribute.constructor = remap(attribute.constructor);
    }
    for raw in &mut result.raw_tables {
        for row in &mut raw.rows {
            row.remap_tokens(&mut |token| remap(token));
        }
    }
    result.entry_point = result.entry_point.map(remap);

    Ok(result)
}

fn reorder<T: Clone>(rows: &[T], map: &RowMap) -> Vec<T> {
    (1..=rows.len())
        .filter_map(|new_row| map.position_of(new_row).map(|old| rows[old].clone()))
        .collect()
}

fn remap_all(tokens: &mut [Token], remap: impl Fn(Token) -> Token) {
    for token in tokens {
        *token = remap(*token);
    }
}

/// Rewrites the token operands of `code` in place.
fn remap_code(code: &mut [u8], remap: impl Fn(Token) -> Token) -> Result<()> {
    for instruction in decode_stream(code)? {
        let Operand::Token(token) = instruction.operand else {
            continue;
        };
        let mapped = remap(token);
        if mapped == token {
            continue;
        }

        #[allow(clippy::cast_possible_truncation)]
        let end = instruction.next_offset() as usize;
        code[end - 4..end].copy_from_slice(&mapped.value().to_le_bytes());
    }
    Ok(())
}
