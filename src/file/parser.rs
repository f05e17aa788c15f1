//! Bounds-checked binary cursor.
//!
//! [`Parser`] walks a byte slice and reads the primitive encodings used by module images and
//! method bodies: little-endian fixed integers, ECMA-335 II.23.2 compressed integers, metadata
//! tokens and length-prefixed UTF-8 strings. Every read validates the remaining length first,
//! so truncated or hostile input ends in [`crate::Error::OutOfBounds`] or
//! [`crate::Error::Malformed`] instead of a panic.

use crate::{
    file::io::{read_le_at, CilIO},
    metadata::token::Token,
    Result,
};

/// A cursor over a byte slice.
///
/// # Examples
///
/// ```rust
/// use cilweave::file::parser::Parser;
///
/// let data = [0x01, 0x02, 0x03, 0x04, 0x81, 0x00];
/// let mut parser = Parser::new(&data);
///
/// assert_eq!(parser.read_le::<u32>()?, 0x0403_0201);
/// assert_eq!(parser.read_compressed_uint()?, 0x100);
/// assert!(!parser.has_more_data());
/// # Ok::<(), cilweave::Error>(())
/// ```
pub struct Parser<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Parser<'a> {
    /// Create a new [`Parser`] over `data`, positioned at the start.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Parser { data, position: 0 }
    }

    /// Returns the length of the underlying data.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying data is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if there are unread bytes left.
    #[must_use]
    pub fn has_more_data(&self) -> bool {
        self.position < self.data.len()
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    /// Returns the current position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.position
    }

    /// Moves the cursor to `pos`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `pos` lies past the end of the data.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.data.len() {
            return Err(out_of_bounds_error!());
        }

        self.position = pos;
        Ok(())
    }

    /// Returns the next byte without consuming it.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] at the end of the data.
    pub fn peek_byte(&self) -> Result<u8> {
        self.data
            .get(self.position)
            .copied()
            .ok_or(out_of_bounds_error!())
    }

    /// Reads a little-endian value.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the value does not fit in the remaining data.
    pub fn read_le<T: CilIO>(&mut self) -> Result<T> {
        read_le_at::<T>(self.data, &mut self.position)
    }

    /// Reads a compressed unsigned integer (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated data and [`crate::Error::Malformed`]
    /// if the first byte does not start a valid encoding.
    pub fn read_compressed_uint(&mut self) -> Result<u32> {
        let first_byte = self.read_le::<u8>()?;

        if (first_byte & 0x80) == 0 {
            return Ok(u32::from(first_byte));
        }

        if (first_byte & 0xC0) == 0x80 {
            let second_byte = self.read_le::<u8>()?;
            return Ok(((u32::from(first_byte) & 0x3F) << 8) | u32::from(second_byte));
        }

        if (first_byte & 0xE0) == 0xC0 {
            let b1 = u32::from(self.read_le::<u8>()?);
            let b2 = u32::from(self.read_le::<u8>()?);
            let b3 = u32::from(self.read_le::<u8>()?);
            return Ok(((u32::from(first_byte) & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first_byte))
    }

    /// Reads a compressed signed integer (ECMA-335 II.23.2), as used by array lower bounds.
    ///
    /// # Errors
    /// Same as [`Parser::read_compressed_uint`].
    pub fn read_compressed_int(&mut self) -> Result<i32> {
        let start = self.position;
        let value = self.read_compressed_uint()?;

        let (magnitude_mask, sign_extension) = match self.position - start {
            1 => (0x3F_u32, 0xFFFF_FFC0_u32),
            2 => (0x1FFF, 0xFFFF_E000),
            _ => (0x0FFF_FFFF, 0xF000_0000),
        };

        let magnitude = (value >> 1) & magnitude_mask;
        #[allow(clippy::cast_possible_wrap)]
        if value & 1 == 1 {
            Ok((magnitude | sign_extension) as i32)
        } else {
            Ok(magnitude as i32)
        }
    }

    /// Reads a compressed unsigned integer that is used as a count or length.
    ///
    /// # Errors
    /// Same as [`Parser::read_compressed_uint`], plus [`crate::Error::Malformed`] if the count
    /// exceeds the bytes left, since every counted element occupies at least one byte.
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_compressed_uint()? as usize;
        if count > self.remaining() {
            return Err(malformed_error!(
                "Count {} at offset {} exceeds remaining data {}",
                count,
                self.position,
                self.remaining()
            ));
        }

        Ok(count)
    }

    /// Reads a 4-byte metadata token.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated data.
    pub fn read_token(&mut self) -> Result<Token> {
        Ok(Token::new(self.read_le::<u32>()?))
    }

    /// Reads a `TypeDefOrRefOrSpec` coded index (ECMA-335 II.23.2.8) as a full token.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for the reserved tag value.
    pub fn read_compressed_token(&mut self) -> Result<Token> {
        let compressed_token = self.read_compressed_uint()?;

        let table: u32 = match compressed_token & 0x3 {
            0x0 => 0x0200_0000,
            0x1 => 0x0100_0000,
            0x2 => 0x1B00_0000,
            _ => {
                return Err(malformed_error!(
                    "Invalid compressed token - {}",
                    compressed_token
                ))
            }
        };

        Ok(Token::new(table + (compressed_token >> 2)))
    }

    /// Reads a compressed-length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated data and [`crate::Error::Malformed`]
    /// for invalid UTF-8.
    pub fn read_prefixed_string_utf8(&mut self) -> Result<String> {
        let length = self.read_compressed_uint()? as usize;
        let start = self.position;
        let bytes = self.read_bytes(length)?;

        String::from_utf8(bytes.to_vec()).map_err(|e| {
            malformed_error!(
                "Invalid UTF-8 string at offset {}-{}: {}",
                start,
                start + length,
                e.utf8_error()
            )
        })
    }

    /// Reads a compressed-length-prefixed byte blob.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] on truncated data.
    pub fn read_prefixed_bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.read_compressed_uint()? as usize;
        self.read_bytes(length)
    }

    /// Reads `length` raw bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if fewer than `length` bytes are left.
    pub fn read_bytes(&mut self, length: usize) -> Result<&'a [u8]> {
        let Some(end) = self.position.checked_add(length) else {
            return Err(out_of_bounds_error!());
        };

        let Some(bytes) = self.data.get(self.position..end) else {
            return Err(out_of_bounds_error!());
        };

        self.position = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn compressed_uint() {
        let cases: [(&[u8], u32); 6] = [
            (&[0x03], 0x03),
            (&[0x7F], 0x7F),
            (&[0x80, 0x80], 0x80),
            (&[0xAE, 0x57], 0x2E57),
            (&[0xBF, 0xFF], 0x3FFF),
            (&[0xC0, 0x00, 0x40, 0x00], 0x4000),
        ];

        for (input, expected) in cases {
            let mut parser = Parser::new(input);
            assert_eq!(parser.read_compressed_uint().unwrap(), expected);
            assert!(!parser.has_more_data());
        }
    }

    #[test]
    fn compressed_uint_invalid() {
        let mut parser = Parser::new(&[0xE0, 0x00, 0x00, 0x00]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(Error::Malformed { .. })
        ));

        let mut parser = Parser::new(&[0xC0, 0x00]);
        assert!(matches!(
            parser.read_compressed_uint(),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn prefixed_string() {
        let mut parser = Parser::new(&[0x05, b'H', b'e', b'l', b'l', b'o', 0x00]);
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), "Hello");
        assert_eq!(parser.read_prefixed_string_utf8().unwrap(), "");

        let mut parser = Parser::new(&[0x02, 0xC3, 0x28]);
        assert!(parser.read_prefixed_string_utf8().is_err());

        let mut parser = Parser::new(&[0x09, b'a']);
        assert!(parser.read_prefixed_string_utf8().is_err());
    }

    #[test]
    fn count_larger_than_data() {
        let mut parser = Parser::new(&[0x40, 0x01]);
        assert!(parser.read_count().is_err());

        let mut parser = Parser::new(&[0x01, 0x01]);
        assert_eq!(parser.read_count().unwrap(), 1);
    }

    #[test]
    fn seek_and_peek() {
        let mut parser = Parser::new(&[0x10, 0x20, 0x30]);
        parser.seek(2).unwrap();
        assert_eq!(parser.peek_byte().unwrap(), 0x30);
        assert_eq!(parser.pos(), 2);
        assert!(parser.seek(4).is_err());

        parser.seek(3).unwrap();
        assert!(parser.peek_byte().is_err());
    }

    #[test]
    fn token() {
        let mut parser = Parser::new(&[0x01, 0x00, 0x00, 0x06]);
        let token = parser.read_token().unwrap();
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);
    }

    #[test]
    fn compressed_signed() {
        let data = [0x06, 0x7B, 0x80, 0x80, 0x80, 0x01, 0x01, 0xC0, 0x00, 0x40, 0x00];
        let mut parser = Parser::new(&data);
        assert_eq!(parser.read_compressed_int().unwrap(), 3);
        assert_eq!(parser.read_compressed_int().unwrap(), -3);
        assert_eq!(parser.read_compressed_int().unwrap(), 64);
        assert_eq!(parser.read_compressed_int().unwrap(), -8192);
        assert_eq!(parser.read_compressed_int().unwrap(), -64);
        assert_eq!(parser.read_compressed_int().unwrap(), 8192);
        assert!(!parser.has_more_data());
    }
}
