//! Column layout of every table of the `#~` stream.
//!
//! # Reference
//! - [ECMA-335 II.22](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use super::codedindex::CodedIndexType::{
    self, CustomAttributeType, HasConstant, HasCustomAttribute, HasDeclSecurity, HasFieldMarshal,
    HasSemantics, Implementation, MemberForwarded, MemberRefParent, MethodDefOrRef,
    ResolutionScope, TypeDefOrRef, TypeOrMethodDef,
};
use crate::metadata::token::TableId;

/// The value kinds a column can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// 2 byte constant
    U16,
    /// 4 byte constant
    U32,
    /// `#Strings` offset
    Str,
    /// `#GUID` index
    Guid,
    /// `#Blob` offset
    Blob,
    /// Row of one table
    Index(TableId),
    /// Row of one of several tables
    Coded(CodedIndexType),
}

use Column::{Blob, Coded, Guid, Index, Str, U16, U32};

/// Tables whose rows must be ordered by a key column, with the key's column index.
pub const SORTED_TABLES: &[(TableId, usize)] = &[
    (TableId::InterfaceImpl, 0),
    (TableId::Constant, 1),
    (TableId::FieldMarshal, 0),
    (TableId::DeclSecurity, 1),
    (TableId::ClassLayout, 2),
    (TableId::FieldLayout, 1),
    (TableId::MethodSemantics, 2),
    (TableId::MethodImpl, 0),
    (TableId::ImplMap, 1),
    (TableId::FieldRVA, 1),
    (TableId::NestedClass, 0),
    (TableId::GenericParam, 2),
    (TableId::GenericParamConstraint, 0),
    (TableId::CustomAttribute, 0),
];

/// `Sorted` bit vector written to the `#~` header.
pub const SORTED_MASK: u64 = 0x0000_1600_3301_FA00;

/// Returns the columns of `table`. Unknown ids have none.
#[must_use]
pub fn columns(table: TableId) -> &'static [Column] {
    match table {
        TableId::Module => &[U16, Str, Guid, Guid, Guid],
        TableId::TypeRef => &[Coded(ResolutionScope), Str, Str],
        TableId::TypeDef => &[
            U32,
            Str,
            Str,
            Coded(TypeDefOrRef),
            Index(TableId::Field),
            Index(TableId::MethodDef),
        ],
        TableId::FieldPtr => &[Index(TableId::Field)],
        TableId::Field => &[U16, Str, Blob],
        TableId::MethodPtr => &[Index(TableId::MethodDef)],
        TableId::MethodDef => &[U32, U16, U16, Str, Blob, Index(TableId::Param)],
        TableId::ParamPtr => &[Index(TableId::Param)],
        TableId::Param => &[U16, U16, Str],
        TableId::InterfaceImpl => &[Index(TableId::TypeDef), Coded(TypeDefOrRef)],
        TableId::MemberRef => &[Coded(MemberRefParent), Str, Blob],
        TableId::Constant => &[U16, Coded(HasConstant), Blob],
        TableId::CustomAttribute => &[Coded(HasCustomAttribute), Coded(CustomAttributeType), Blob],
        TableId::FieldMarshal => &[Coded(HasFieldMarshal), Blob],
        TableId::DeclSecurity => &[U16, Coded(HasDeclSecurity), Blob],
        TableId::ClassLayout => &[U16, U32, Index(TableId::TypeDef)],
        TableId::FieldLayout => &[U32, Index(TableId::Field)],
        TableId::StandAloneSig => &[Blob],
        TableId::EventMap => &[Index(TableId::TypeDef), Index(TableId::Event)],
        TableId::EventPtr => &[Index(TableId::Event)],
        TableId::Event => &[U16, Str, Coded(TypeDefOrRef)],
        TableId::PropertyMap => &[Index(TableId::TypeDef), Index(TableId::Property)],
        TableId::PropertyPtr => &[Index(TableId::Property)],
        TableId::Property => &[U16, Str, Blob],
        TableId::MethodSemantics => &[U16, Index(TableId::MethodDef), Coded(HasSemantics)],
        TableId::MethodImpl => &[
            Index(TableId::TypeDef),
            Coded(MethodDefOrRef),
            Coded(MethodDefOrRef),
        ],
        TableId::ModuleRef => &[Str],
        TableId::TypeSpec => &[Blob],
        TableId::ImplMap => &[U16, Coded(MemberForwarded), Str, Index(TableId::ModuleRef)],
        TableId::FieldRVA => &[U32, Index(TableId::Field)],
        TableId::EncLog => &[U32, U32],
        TableId::EncMap => &[U32],
        TableId::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
        TableId::AssemblyProcessor => &[U32],
        TableId::AssemblyOS => &[U32, U32, U32],
        TableId::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
        TableId::AssemblyRefProcessor => &[U32, Index(TableId::AssemblyRef)],
        TableId::AssemblyRefOS => &[U32, U32, U32, Index(TableId::AssemblyRef)],
        TableId::File => &[U32, Str, Blob],
        TableId::ExportedType => &[U32, U32, Str, Str, Coded(Implementation)],
        TableId::ManifestResource => &[U32, U32, Str, Coded(Implementation)],
        TableId::NestedClass => &[Index(TableId::TypeDef), Index(TableId::TypeDef)],
        TableId::GenericParam => &[U16, U16, Coded(TypeOrMethodDef), Str],
        TableId::MethodSpec => &[Coded(MethodDefOrRef), Blob],
        TableId::GenericParamConstraint => {
            &[Index(TableId::GenericParam), Coded(TypeDefOrRef)]
        }
        TableId::UserString => &[],
    }
}

/// Returns the key column of a sorted table.
#[must_use]
pub fn sort_key(table: TableId) -> Option<usize> {
    SORTED_TABLES
        .iter()
        .find(|(sorted, _)| *sorted == table)
        .map(|(_, key)| *key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_mask_matches_sorted_tables() {
        let mask = SORTED_TABLES
            .iter()
            .fold(0_u64, |mask, (table, _)| mask | (1 << *table as u8));
        assert_eq!(mask, SORTED_MASK);
    }

    #[test]
    fn sort_keys_are_references() {
        for (table, key) in SORTED_TABLES {
            assert!(matches!(columns(*table)[*key], Index(_) | Coded(_)));
        }
        assert_eq!(sort_key(TableId::CustomAttribute), Some(0));
        assert_eq!(sort_key(TableId::TypeDef), None);
    }

    #[test]
    fn list_columns() {
        assert_eq!(columns(TableId::TypeDef)[4], Index(TableId::Field));
        assert_eq!(columns(TableId::MethodDef)[5], Index(TableId::Param));
        assert!(columns(TableId::UserString).is_empty());
    }
}
