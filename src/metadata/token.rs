//! Metadata tokens.
//!
//! A [`Token`] is the 32-bit handle instruction streams and module rows use to reference each
//! other. The high byte selects the table ([`TableId`]), the low 24 bits are the 1-based row
//! within that table. Row 0 is the null reference.
//!
//! ```rust
//! use cilweave::metadata::token::{TableId, Token};
//!
//! let token = Token::from_parts(TableId::MethodDef, 3);
//! assert_eq!(token.value(), 0x0600_0003);
//! assert_eq!(token.table_id(), Some(TableId::MethodDef));
//! assert_eq!(token.row(), 3);
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use strum::{Display, EnumIter};

/// The metadata tables a [`Token`] can point into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum TableId {
    /// The module itself
    Module = 0x00,
    /// Types defined in other modules
    TypeRef = 0x01,
    /// Types defined in this module
    TypeDef = 0x02,
    /// Field indirection of unoptimized metadata
    FieldPtr = 0x03,
    /// Field definitions
    Field = 0x04,
    /// Method indirection of unoptimized metadata
    MethodPtr = 0x05,
    /// Method definitions
    MethodDef = 0x06,
    /// Parameter indirection of unoptimized metadata
    ParamPtr = 0x07,
    /// Parameter names and attributes
    Param = 0x08,
    /// Interfaces implemented by a type
    InterfaceImpl = 0x09,
    /// Methods and fields of types defined elsewhere
    MemberRef = 0x0A,
    /// Default values of fields, parameters and properties
    Constant = 0x0B,
    /// Custom attributes
    CustomAttribute = 0x0C,
    /// Marshalling descriptors
    FieldMarshal = 0x0D,
    /// Declarative security
    DeclSecurity = 0x0E,
    /// Explicit type layout
    ClassLayout = 0x0F,
    /// Explicit field offsets
    FieldLayout = 0x10,
    /// Local variable and `calli` signatures
    StandAloneSig = 0x11,
    /// Event ranges of a type
    EventMap = 0x12,
    /// Event indirection of unoptimized metadata
    EventPtr = 0x13,
    /// Events
    Event = 0x14,
    /// Property ranges of a type
    PropertyMap = 0x15,
    /// Property indirection of unoptimized metadata
    PropertyPtr = 0x16,
    /// Properties
    Property = 0x17,
    /// Accessor methods of events and properties
    MethodSemantics = 0x18,
    /// Explicit method overrides
    MethodImpl = 0x19,
    /// Referenced native modules
    ModuleRef = 0x1A,
    /// Constructed type signatures (arrays, by-ref, generic instances, ...)
    TypeSpec = 0x1B,
    /// Platform invoke mappings
    ImplMap = 0x1C,
    /// Initial data of mapped fields
    FieldRVA = 0x1D,
    /// Edit and continue log
    EncLog = 0x1E,
    /// Edit and continue map
    EncMap = 0x1F,
    /// The assembly manifest
    Assembly = 0x20,
    /// Unused processor list
    AssemblyProcessor = 0x21,
    /// Unused operating system list
    AssemblyOS = 0x22,
    /// Referenced modules
    AssemblyRef = 0x23,
    /// Unused processor list of references
    AssemblyRefProcessor = 0x24,
    /// Unused operating system list of references
    AssemblyRefOS = 0x25,
    /// Files of a multi-module assembly
    File = 0x26,
    /// Types forwarded to or exported from other modules
    ExportedType = 0x27,
    /// Managed resources
    ManifestResource = 0x28,
    /// Nesting of types
    NestedClass = 0x29,
    /// Generic parameters of types and methods
    GenericParam = 0x2A,
    /// Generic method instantiations
    MethodSpec = 0x2B,
    /// Constraints of generic parameters
    GenericParamConstraint = 0x2C,
    /// User string literals used by `ldstr`
    UserString = 0x70,
}

impl TableId {
    /// Returns the [`TableId`] for a raw table byte.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<TableId> {
        match value {
            0x00 => Some(TableId::Module),
            0x01 => Some(TableId::TypeRef),
            0x02 => Some(TableId::TypeDef),
            0x03 => Some(TableId::FieldPtr),
            0x04 => Some(TableId::Field),
            0x05 => Some(TableId::MethodPtr),
            0x06 => Some(TableId::MethodDef),
            0x07 => Some(TableId::ParamPtr),
            0x08 => Some(TableId::Param),
            0x09 => Some(TableId::InterfaceImpl),
            0x0A => Some(TableId::MemberRef),
            0x0B => Some(TableId::Constant),
            0x0C => Some(TableId::CustomAttribute),
            0x0D => Some(TableId::FieldMarshal),
            0x0E => Some(TableId::DeclSecurity),
            0x0F => Some(TableId::ClassLayout),
            0x10 => Some(TableId::FieldLayout),
            0x11 => Some(TableId::StandAloneSig),
            0x12 => Some(TableId::EventMap),
            0x13 => Some(TableId::EventPtr),
            0x14 => Some(TableId::Event),
            0x15 => Some(TableId::PropertyMap),
            0x16 => Some(TableId::PropertyPtr),
            0x17 => Some(TableId::Property),
            0x18 => Some(TableId::MethodSemantics),
            0x19 => Some(TableId::MethodImpl),
            0x1A => Some(TableId::ModuleRef),
            0x1B => Some(TableId::TypeSpec),
            0x1C => Some(TableId::ImplMap),
            0x1D => Some(TableId::FieldRVA),
            0x1E => Some(TableId::EncLog),
            0x1F => Some(TableId::EncMap),
            0x20 => Some(TableId::Assembly),
            0x21 => Some(TableId::AssemblyProcessor),
            0x22 => Some(TableId::AssemblyOS),
            0x23 => Some(TableId::AssemblyRef),
            0x24 => Some(TableId::AssemblyRefProcessor),
            0x25 => Some(TableId::AssemblyRefOS),
            0x26 => Some(TableId::File),
            0x27 => Some(TableId::ExportedType),
            0x28 => Some(TableId::ManifestResource),
            0x29 => Some(TableId::NestedClass),
            0x2A => Some(TableId::GenericParam),
            0x2B => Some(TableId::MethodSpec),
            0x2C => Some(TableId::GenericParamConstraint),
            0x70 => Some(TableId::UserString),
            _ => None,
        }
    }

    /// Returns `true` for the metadata tables of the `#~` stream, `false` for the user string heap.
    #[must_use]
    pub fn is_table(self) -> bool {
        (self as u8) < 0x40
    }
}

/// A metadata token, `table << 24 | row`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Token(pub u32);

impl Token {
    /// Create a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Create a token from a table and a 1-based row.
    #[must_use]
    pub fn from_parts(table: TableId, row: u32) -> Self {
        Token((u32::from(table as u8) << 24) | (row & 0x00FF_FFFF))
    }

    /// Returns the raw value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Returns the raw table byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Returns the table, if the table byte is one this crate knows.
    #[must_use]
    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_u8(self.table())
    }

    /// Returns `true` if the token points into `table`.
    #[must_use]
    pub fn is_table(&self, table: TableId) -> bool {
        self.table() == table as u8
    }

    /// Returns the 1-based row.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// Returns the 0-based index of the row, `None` for a null row.
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        (self.row() as usize).checked_sub(1)
    }

    /// Returns `true` for the null token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn parts() {
        let token = Token::from_parts(TableId::TypeSpec, 0x12);
        assert_eq!(token.value(), 0x1B00_0012);
        assert_eq!(token.table(), 0x1B);
        assert_eq!(token.row(), 0x12);
        assert_eq!(token.index(), Some(0x11));
        assert!(token.is_table(TableId::TypeSpec));
        assert!(!token.is_table(TableId::TypeRef));
    }

    #[test]
    fn null() {
        assert!(Token::new(0).is_null());
        assert_eq!(Token::from_parts(TableId::TypeDef, 0).index(), None);
        assert!(!Token::new(0x0600_0001).is_null());
    }

    #[test]
    fn table_ids_round_trip() {
        for table in TableId::iter() {
            assert_eq!(TableId::from_u8(table as u8), Some(table));
        }
        assert_eq!(TableId::from_u8(0x2D), None);
        assert_eq!(Token::new(0x2D00_0001).table_id(), None);
        assert_eq!(
            Token::new(0x1100_0001).table_id(),
            Some(TableId::StandAloneSig)
        );
        assert!(TableId::GenericParamConstraint.is_table());
        assert!(!TableId::UserString.is_table());
    }

    #[test]
    fn formatting() {
        let token = Token(0x0600_0001);
        assert_eq!(format!("{token}"), "0x06000001");
        assert_eq!(
            format!("{token:?}"),
            "Token(0x06000001, table: 0x06, row: 1)"
        );
        assert_eq!(TableId::MemberRef.to_string(), "MemberRef");
    }
}
