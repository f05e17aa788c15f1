//! Coded indexes.
//!
//! A coded index packs a reference into one of several tables into a single column: the low
//! bits hold a tag that selects the table, the remaining bits the row.
//!
//! # Reference
//! - [ECMA-335 II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use strum::{EnumCount, EnumIter};

use crate::{
    metadata::token::{TableId, Token},
    Result,
};

/// The kinds of coded index columns.
#[derive(Debug, Hash, Eq, PartialEq, Clone, Copy, EnumIter, EnumCount)]
#[repr(usize)]
pub enum CodedIndexType {
    /// `TypeDef`, `TypeRef` or `TypeSpec`
    TypeDefOrRef,
    /// `Field`, `Param` or `Property`
    HasConstant,
    /// Anything a custom attribute can be applied to
    HasCustomAttribute,
    /// `Field` or `Param`
    HasFieldMarshal,
    /// `TypeDef`, `MethodDef` or `Assembly`
    HasDeclSecurity,
    /// Declaring type or module of a member reference
    MemberRefParent,
    /// `Event` or `Property`
    HasSemantics,
    /// `MethodDef` or `MemberRef`
    MethodDefOrRef,
    /// `Field` or `MethodDef`
    MemberForwarded,
    /// `File`, `AssemblyRef` or `ExportedType`
    Implementation,
    /// Constructor of a custom attribute
    CustomAttributeType,
    /// Scope of a type reference
    ResolutionScope,
    /// `TypeDef` or `MethodDef`
    TypeOrMethodDef,
}

use TableId::{
    Assembly, AssemblyRef, DeclSecurity, Event, ExportedType, Field, File, GenericParam,
    GenericParamConstraint, InterfaceImpl, ManifestResource, MemberRef, MethodDef, MethodSpec,
    Module, ModuleRef, Param, Property, StandAloneSig, TypeDef, TypeRef, TypeSpec,
};

impl CodedIndexType {
    /// The tables in tag order. Unused tags are `None`.
    #[must_use]
    pub fn slots(self) -> &'static [Option<TableId>] {
        match self {
            CodedIndexType::TypeDefOrRef => &[Some(TypeDef), Some(TypeRef), Some(TypeSpec)],
            CodedIndexType::HasConstant => &[Some(Field), Some(Param), Some(Property)],
            CodedIndexType::HasCustomAttribute => &[
                Some(MethodDef),
                Some(Field),
                Some(TypeRef),
                Some(TypeDef),
                Some(Param),
                Some(InterfaceImpl),
                Some(MemberRef),
                Some(Module),
                Some(DeclSecurity),
                Some(Property),
                Some(Event),
                Some(StandAloneSig),
                Some(ModuleRef),
                Some(TypeSpec),
                Some(Assembly),
                Some(AssemblyRef),
                Some(File),
                Some(ExportedType),
                Some(ManifestResource),
                Some(GenericParam),
                Some(GenericParamConstraint),
                Some(MethodSpec),
            ],
            CodedIndexType::HasFieldMarshal => &[Some(Field), Some(Param)],
            CodedIndexType::HasDeclSecurity => &[Some(TypeDef), Some(MethodDef), Some(Assembly)],
            CodedIndexType::MemberRefParent => &[
                Some(TypeDef),
                Some(TypeRef),
                Some(ModuleRef),
                Some(MethodDef),
                Some(TypeSpec),
            ],
            CodedIndexType::HasSemantics => &[Some(Event), Some(Property)],
            CodedIndexType::MethodDefOrRef => &[Some(MethodDef), Some(MemberRef)],
            CodedIndexType::MemberForwarded => &[Some(Field), Some(MethodDef)],
            CodedIndexType::Implementation => &[Some(File), Some(AssemblyRef), Some(ExportedType)],
            CodedIndexType::CustomAttributeType => {
                &[None, None, Some(MethodDef), Some(MemberRef), None]
            }
            CodedIndexType::ResolutionScope => {
                &[Some(Module), Some(ModuleRef), Some(AssemblyRef), Some(TypeRef)]
            }
            CodedIndexType::TypeOrMethodDef => &[Some(TypeDef), Some(MethodDef)],
        }
    }

    /// The tables this index can reference.
    pub fn tables(self) -> impl Iterator<Item = TableId> {
        self.slots().iter().flatten().copied()
    }

    /// Number of low bits holding the tag.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn tag_bits(self) -> u8 {
        let slots = self.slots().len();
        (usize::BITS - (slots - 1).leading_zeros()) as u8
    }

    /// Encodes `token`. The null token encodes as 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token's table is not one of this index.
    pub fn encode(self, token: Token) -> Result<u32> {
        if token.is_null() {
            return Ok(0);
        }

        let tag = self
            .slots()
            .iter()
            .position(|slot| slot.is_some_and(|table| token.is_table(table)))
            .ok_or_else(|| malformed_error!("Token {} cannot be stored as {:?}", token, self))?;

        #[allow(clippy::cast_possible_truncation)]
        Ok((token.row() << self.tag_bits()) | tag as u32)
    }

    /// Decodes a stored value. A zero row decodes to the null token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unused tags.
    pub fn decode(self, value: u32) -> Result<Token> {
        let tag_bits = self.tag_bits();
        let tag = (value & ((1 << tag_bits) - 1)) as usize;
        let row = value >> tag_bits;

        match self.slots().get(tag) {
            Some(Some(table)) if row != 0 => Ok(Token::from_parts(*table, row)),
            Some(Some(_)) => Ok(Token::new(0)),
            _ => Err(malformed_error!("Invalid {:?} tag - {}", self, tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn tag_bits() {
        assert_eq!(CodedIndexType::TypeDefOrRef.tag_bits(), 2);
        assert_eq!(CodedIndexType::HasCustomAttribute.tag_bits(), 5);
        assert_eq!(CodedIndexType::HasFieldMarshal.tag_bits(), 1);
        assert_eq!(CodedIndexType::CustomAttributeType.tag_bits(), 3);
        assert_eq!(CodedIndexType::ResolutionScope.tag_bits(), 2);
        assert_eq!(CodedIndexType::MemberRefParent.tag_bits(), 3);
    }

    #[test]
    fn encode_decode() {
        let base = Token::from_parts(TypeRef, 5);
        let value = CodedIndexType::TypeDefOrRef.encode(base).unwrap();
        assert_eq!(value, (5 << 2) | 1);
        assert_eq!(CodedIndexType::TypeDefOrRef.decode(value).unwrap(), base);

        let ctor = Token::from_parts(MemberRef, 3);
        let value = CodedIndexType::CustomAttributeType.encode(ctor).unwrap();
        assert_eq!(value, (3 << 3) | 3);
        assert_eq!(CodedIndexType::CustomAttributeType.decode(value).unwrap(), ctor);
        assert!(CodedIndexType::CustomAttributeType.decode(1 << 3).is_err());

        assert_eq!(CodedIndexType::TypeDefOrRef.encode(Token::new(0)).unwrap(), 0);
        assert!(CodedIndexType::TypeDefOrRef.decode(0).unwrap().is_null());
        assert!(CodedIndexType::TypeDefOrRef
            .encode(Token::from_parts(MethodDef, 1))
            .is_err());
    }

    #[test]
    fn every_table_is_reachable() {
        for index in CodedIndexType::iter() {
            for (tag, slot) in index.slots().iter().enumerate() {
                if let Some(table) = slot {
                    let token = Token::from_parts(*table, 7);
                    let value = index.encode(token).unwrap();
                    assert_eq!(value as usize & ((1 << index.tag_bits()) - 1), tag);
                    assert_eq!(index.decode(value).unwrap(), token);
                }
            }
        }
    }
}
