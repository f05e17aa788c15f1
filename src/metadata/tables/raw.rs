//! Rows of the `#~` stream with heap references resolved.
//!
//! A [`RawRow`] holds one [`Cell`] per column: constants stay numbers, heap offsets become the
//! string, blob or GUID they point to and table indexes become [`Token`]s. That makes rows
//! independent of the heaps and column widths of the image they came from, so tables the model
//! does not interpret are carried through a patch unchanged in meaning.

use crate::{
    metadata::token::{TableId, Token},
    Result,
};

/// One resolved column value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cell {
    /// 2 or 4 byte constant
    Value(u32),
    /// `#Strings` entry
    String(String),
    /// `#Blob` entry
    Blob(Vec<u8>),
    /// `#GUID` entry, `None` for index 0
    Guid(Option<uguid::Guid>),
    /// Simple or coded index
    Token(Token),
}

/// One row of a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RawRow {
    /// Column values in schema order
    pub cells: Vec<Cell>,
}

impl RawRow {
    fn cell(&self, column: usize) -> Result<&Cell> {
        self.cells
            .get(column)
            .ok_or_else(|| malformed_error!("Row has no column {}", column))
    }

    /// Returns the constant in `column`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the column holds something else.
    pub fn value(&self, column: usize) -> Result<u32> {
        match self.cell(column)? {
            Cell::Value(value) => Ok(*value),
            other => Err(malformed_error!("Expected a constant, found {:?}", other)),
        }
    }

    /// Returns the string in `column`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the column holds something else.
    pub fn string(&self, column: usize) -> Result<&str> {
        match self.cell(column)? {
            Cell::String(value) => Ok(value),
            other => Err(malformed_error!("Expected a string, found {:?}", other)),
        }
    }

    /// Returns the blob in `column`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the column holds something else.
    pub fn blob(&self, column: usize) -> Result<&[u8]> {
        match self.cell(column)? {
            Cell::Blob(value) => Ok(value),
            other => Err(malformed_error!("Expected a blob, found {:?}", other)),
        }
    }

    /// Returns the GUID in `column`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the column holds something else.
    pub fn guid(&self, column: usize) -> Result<Option<uguid::Guid>> {
        match self.cell(column)? {
            Cell::Guid(value) => Ok(*value),
            other => Err(malformed_error!("Expected a GUID, found {:?}", other)),
        }
    }

    /// Returns the token in `column`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the column holds something else.
    pub fn token(&self, column: usize) -> Result<Token> {
        match self.cell(column)? {
            Cell::Token(value) => Ok(*value),
            other => Err(malformed_error!("Expected a token, found {:?}", other)),
        }
    }

    /// Applies `remap` to every token of the row.
    pub fn remap_tokens(&mut self, remap: &mut impl FnMut(Token) -> Token) {
        for cell in &mut self.cells {
            if let Cell::Token(token) = cell {
                *token = remap(*token);
            }
        }
    }
}

/// A table the module model keeps as rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTable {
    /// Table id
    pub id: TableId,
    /// Rows in table order
    pub rows: Vec<RawRow>,
}

impl RawTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(id: TableId) -> Self {
        RawTable {
            id,
            rows: Vec::new(),
        }
    }

    /// Returns the row a token of this table addresses.
    #[must_use]
    pub fn row(&self, token: Token) -> Option<&RawRow> {
        if !token.is_table(self.id) {
            return None;
        }
        self.rows.get(token.index()?)
    }

    /// Returns `true` if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access() {
        let row = RawRow {
            cells: vec![
                Cell::Value(7),
                Cell::String("Item".to_string()),
                Cell::Blob(vec![0x06, 0x08]),
                Cell::Token(Token::new(0x0200_0002)),
                Cell::Guid(None),
            ],
        };

        assert_eq!(row.value(0).unwrap(), 7);
        assert_eq!(row.string(1).unwrap(), "Item");
        assert_eq!(row.blob(2).unwrap(), &[0x06, 0x08]);
        assert_eq!(row.token(3).unwrap(), Token::new(0x0200_0002));
        assert_eq!(row.guid(4).unwrap(), None);
        assert!(row.value(1).is_err());
        assert!(row.token(9).is_err());
    }

    #[test]
    fn remap_and_lookup() {
        let mut table = RawTable::new(TableId::ClassLayout);
        table.rows.push(RawRow {
            cells: vec![
                Cell::Value(8),
                Cell::Value(16),
                Cell::Token(Token::new(0x0200_0003)),
            ],
        });

        table.rows[0].remap_tokens(&mut |token| Token::new(token.value() + 1));
        let row = table.row(Token::new(0x0F00_0001)).unwrap();
        assert_eq!(row.token(2).unwrap(), Token::new(0x0200_0004));
        assert!(table.row(Token::new(0x0F00_0002)).is_none());
        assert!(table.row(Token::new(0x1000_0001)).is_none());
    }
}
