//! Growable little-endian output buffer, the writing counterpart of
//! [`crate::file::parser::Parser`].

use crate::{file::io::CilIO, metadata::token::Token, Result};

/// Appends binary encodings to an owned buffer.
///
/// # Examples
///
/// ```rust
/// use cilweave::file::{parser::Parser, writer::Writer};
///
/// let mut writer = Writer::new();
/// writer.write_le(0x0403_0201_u32);
/// writer.write_compressed_uint(0x100)?;
/// writer.write_prefixed_string("Add")?;
///
/// let bytes = writer.into_vec();
/// let mut parser = Parser::new(&bytes);
/// assert_eq!(parser.read_le::<u32>()?, 0x0403_0201);
/// assert_eq!(parser.read_compressed_uint()?, 0x100);
/// assert_eq!(parser.read_prefixed_string_utf8()?, "Add");
/// # Ok::<(), cilweave::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Writer { data: Vec::new() }
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing was written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a little-endian value.
    pub fn write_le<T: CilIO>(&mut self, value: T) {
        self.data.extend_from_slice(value.to_le_bytes().as_ref());
    }

    /// Appends a metadata token.
    pub fn write_token(&mut self, token: Token) {
        self.write_le(token.value());
    }

    /// Appends raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Appends a compressed unsigned integer (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for values above `0x1FFF_FFFF`, the largest value
    /// the encoding can represent.
    pub fn write_compressed_uint(&mut self, value: u32) -> Result<()> {
        if value < 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            self.data.push(value as u8);
        } else if value < 0x4000 {
            #[allow(clippy::cast_possible_truncation)]
            self.data
                .extend_from_slice(&[0x80 | (value >> 8) as u8, (value & 0xFF) as u8]);
        } else if value <= 0x1FFF_FFFF {
            self.data
                .extend_from_slice(&(0xC000_0000 | value).to_be_bytes());
        } else {
            return Err(malformed_error!(
                "Value {} is too large for a compressed integer",
                value
            ));
        }

        Ok(())
    }

    /// Appends a compressed signed integer (ECMA-335 II.23.2).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for values outside `-2^28..2^28`.
    pub fn write_compressed_int(&mut self, value: i32) -> Result<()> {
        #[allow(clippy::cast_sign_loss)]
        let rotated = ((value << 1) as u32) | u32::from(value < 0);

        if (-0x40..0x40).contains(&value) {
            #[allow(clippy::cast_possible_truncation)]
            self.data.push((rotated & 0x7F) as u8);
        } else if (-0x2000..0x2000).contains(&value) {
            let encoded = 0x8000 | (rotated & 0x3FFF);
            #[allow(clippy::cast_possible_truncation)]
            self.data.extend_from_slice(&(encoded as u16).to_be_bytes());
        } else if (-0x1000_0000..0x1000_0000).contains(&value) {
            self.data
                .extend_from_slice(&(0xC000_0000 | (rotated & 0x1FFF_FFFF)).to_be_bytes());
        } else {
            return Err(malformed_error!(
                "Value {} is out of range for a compressed signed integer",
                value
            ));
        }

        Ok(())
    }

    /// Appends a `TypeDefOrRefOrSpec` coded index (ECMA-335 II.23.2.8).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `token` is not a type token.
    pub fn write_compressed_token(&mut self, token: Token) -> Result<()> {
        let tag = match token.table() {
            0x02 => 0,
            0x01 => 1,
            0x1B => 2,
            _ => return Err(malformed_error!("Token {} is not a type token", token)),
        };

        self.write_compressed_uint((token.row() << 2) | tag)
    }

    /// Appends a `usize` count as compressed unsigned integer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the count cannot be encoded.
    pub fn write_count(&mut self, count: usize) -> Result<()> {
        let value = u32::try_from(count)
            .map_err(|_| malformed_error!("Count {} exceeds the u32 range", count))?;
        self.write_compressed_uint(value)
    }

    /// Appends a compressed-length-prefixed UTF-8 string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the string length cannot be encoded.
    pub fn write_prefixed_string(&mut self, value: &str) -> Result<()> {
        self.write_prefixed_bytes(value.as_bytes())
    }

    /// Appends a compressed-length-prefixed byte blob.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the blob length cannot be encoded.
    pub fn write_prefixed_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_count(value.len())?;
        self.data.extend_from_slice(value);
        Ok(())
    }

    /// Returns the written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the writer and returns the written bytes.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_uint_forms() {
        let mut writer = Writer::new();
        writer.write_compressed_uint(0x03).unwrap();
        writer.write_compressed_uint(0x80).unwrap();
        writer.write_compressed_uint(0x2E57).unwrap();
        writer.write_compressed_uint(0x4000).unwrap();

        assert_eq!(
            writer.as_slice(),
            &[0x03, 0x80, 0x80, 0xAE, 0x57, 0xC0, 0x00, 0x40, 0x00]
        );
    }

    #[test]
    fn compressed_uint_too_large() {
        let mut writer = Writer::new();
        assert!(writer.write_compressed_uint(0x2000_0000).is_err());
        assert!(writer.is_empty());
    }

    #[test]
    fn fixed_width() {
        let mut writer = Writer::new();
        writer.write_le(0x1234_u16);
        writer.write_token(Token::new(0x0600_0002));

        assert_eq!(writer.into_vec(), vec![0x34, 0x12, 0x02, 0x00, 0x00, 0x06]);
    }

    #[test]
    fn compressed_signed_forms() {
        let mut writer = Writer::new();
        for value in [3, -3, 64, -8192, -64, 8192] {
            writer.write_compressed_int(value).unwrap();
        }
        assert_eq!(
            writer.as_slice(),
            &[0x06, 0x7B, 0x80, 0x80, 0x80, 0x01, 0x01, 0xC0, 0x00, 0x40, 0x00]
        );
        assert!(writer.write_compressed_int(i32::MIN).is_err());
    }
}
