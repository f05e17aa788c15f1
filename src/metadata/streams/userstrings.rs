//! User string heap (`#US`).
//!
//! The heap is kept byte for byte, so every `ldstr` token of a loaded module stays valid when it
//! is written again. New literals are appended.
//!
//! # Reference
//! - [ECMA-335 II.24.2.4](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use widestring::{U16Str, U16String};

use super::align_heap;
use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::token::{TableId, Token},
    Result,
};

/// Largest heap offset a `UserString` token can address.
const MAX_OFFSET: usize = 0x00FF_FFFF;

/// An owned `#US` heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStringHeap {
    data: Vec<u8>,
}

impl Default for UserStringHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl UserStringHeap {
    /// Creates a heap holding only the empty entry.
    #[must_use]
    pub fn new() -> Self {
        UserStringHeap { data: vec![0] }
    }

    /// Takes over the heap bytes of a loaded module.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty entry.
    pub fn from(data: &[u8]) -> Result<UserStringHeap> {
        if data.is_empty() {
            return Ok(Self::new());
        }
        if data[0] != 0 {
            return Err(malformed_error!("#US heap does not start with 0"));
        }

        Ok(UserStringHeap {
            data: data.to_vec(),
        })
    }

    /// Returns the literal at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the entry exceeds the heap and
    /// [`crate::Error::Malformed`] for invalid UTF-16.
    pub fn get(&self, offset: usize) -> Result<String> {
        if offset == 0 || offset >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(&self.data[offset..]);
        let len = parser.read_compressed_uint()? as usize;
        if len == 0 {
            return Ok(String::new());
        }

        let bytes = parser.read_bytes(len)?;
        let units: Vec<u16> = bytes[..len - 1]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        U16Str::from_slice(&units)
            .to_string()
            .map_err(|_| malformed_error!("Invalid user string at offset - {}", offset))
    }

    /// Returns the literal a `UserString` token refers to.
    #[must_use]
    pub fn resolve(&self, token: Token) -> Option<String> {
        if !token.is_table(TableId::UserString) {
            return None;
        }
        self.get(token.row() as usize).ok()
    }

    /// Iterates over the offsets and literals of all entries.
    pub fn iter(&self) -> impl Iterator<Item = (usize, String)> + '_ {
        let mut offset = 1;
        std::iter::from_fn(move || {
            while offset < self.data.len() {
                let mut parser = Parser::new(&self.data[offset..]);
                let len = parser.read_compressed_uint().ok()? as usize;
                let start = offset;
                offset += parser.pos() + len;
                // zero bytes are alignment padding
                if len == 0 {
                    continue;
                }
                return self.get(start).ok().map(|value| (start, value));
            }
            None
        })
    }

    /// Number of literals.
    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Returns `true` if the heap holds no literal.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds `value`, reusing an equal literal, and returns its `UserString` token.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] once the heap exceeds what a token can address.
    pub fn add(&mut self, value: &str) -> Result<Token> {
        if let Some((offset, _)) = self.iter().find(|(_, existing)| existing == value) {
            return Ok(user_string_token(offset));
        }

        let offset = self.data.len();
        if offset > MAX_OFFSET {
            return Err(crate::Error::NotSupported);
        }

        let units = U16String::from_str(value);
        let mut writer = Writer::new();
        writer.write_compressed_uint(
            u32::try_from(units.len() * 2 + 1).map_err(|_| crate::Error::NotSupported)?,
        )?;
        for unit in units.as_slice() {
            writer.write_le(*unit);
        }
        writer.write_le(u8::from(needs_special_handling(units.as_slice())));

        self.data.extend_from_slice(writer.as_slice());
        Ok(user_string_token(offset))
    }

    /// Returns the padded heap.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        align_heap(&mut data);
        data
    }
}

#[allow(clippy::cast_possible_truncation)]
fn user_string_token(offset: usize) -> Token {
    Token::from_parts(TableId::UserString, offset as u32)
}

/// The terminal byte of a literal: set when any character needs more than 8-bit handling.
fn needs_special_handling(units: &[u16]) -> bool {
    units.iter().any(|unit| {
        let [low, high] = unit.to_le_bytes();
        high != 0 || matches!(low, 0x01..=0x08 | 0x0E..=0x1F | 0x27 | 0x2D | 0x7F)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let data = [
            0x00, 0x1b,
            0x48, 0x00, 0x65, 0x00, 0x6c, 0x00, 0x6c, 0x00, 0x6f, 0x00, 0x2c, 0x00, 0x20, 0x00,
            0x57, 0x00, 0x6f, 0x00, 0x72, 0x00, 0x6c, 0x00, 0x64, 0x00, 0x21, 0x00, 0x00,
        ];

        let heap = UserStringHeap::from(&data).unwrap();
        assert_eq!(heap.get(1).unwrap(), "Hello, World!");
        assert_eq!(
            heap.resolve(Token::new(0x7000_0001)).as_deref(),
            Some("Hello, World!")
        );
        assert_eq!(heap.resolve(Token::new(0x0600_0001)), None);
        assert_eq!(heap.len(), 1);
        assert!(heap.get(0).is_err());
        assert!(UserStringHeap::from(&[0x22, 0x01]).is_err());
    }

    #[test]
    fn add_reuses_and_flags() {
        let mut heap = UserStringHeap::new();
        let plain = heap.add("abc").unwrap();
        assert_eq!(plain, Token::new(0x7000_0001));
        assert_eq!(heap.add("abc").unwrap(), plain);

        let quoted = heap.add("it's").unwrap();
        assert_eq!(quoted.row(), 1 + 1 + 7);

        let bytes = heap.to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        // "abc": length 7, terminal byte 0
        assert_eq!(&bytes[1..9], &[0x07, 0x61, 0x00, 0x62, 0x00, 0x63, 0x00, 0x00]);
        // the apostrophe sets the terminal byte
        assert_eq!(bytes[9 + 9], 1);

        let reloaded = UserStringHeap::from(&bytes).unwrap();
        assert_eq!(reloaded.resolve(quoted).as_deref(), Some("it's"));
        assert_eq!(reloaded.len(), 2);
        assert_eq!(heap.add("").unwrap().row(), 19);
    }
}
