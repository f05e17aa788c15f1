//! Stream headers of the metadata root.
//!
//! # Reference
//! - [ECMA-335 II.24.2.2](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{file::io::read_le, file::writer::Writer, Result};

/// Stream names a module may carry.
pub const STREAM_NAMES: [&str; 6] = ["#~", "#-", "#Strings", "#US", "#GUID", "#Blob"];

/// Location and name of one metadata stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    /// Offset from the start of the metadata root
    pub offset: u32,
    /// Size in bytes, a multiple of four
    pub size: u32,
    /// Stream name
    pub name: String,
}

impl StreamHeader {
    /// Reads a stream header.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated input and [`crate::Error::Malformed`]
    /// for unknown stream names.
    pub fn from(data: &[u8]) -> Result<StreamHeader> {
        if data.len() < 9 {
            return Err(out_of_bounds_error!());
        }

        let name_bytes = &data[8..data.len().min(8 + 32)];
        let Some(end) = name_bytes.iter().position(|byte| *byte == 0) else {
            return Err(malformed_error!("Stream header name is not terminated"));
        };
        let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();

        if !STREAM_NAMES.contains(&name.as_str()) {
            return Err(malformed_error!("Invalid stream header name - {}", name));
        }

        Ok(StreamHeader {
            offset: read_le::<u32>(data)?,
            size: read_le::<u32>(&data[4..])?,
            name,
        })
    }

    /// Size of the header including its padded name.
    #[must_use]
    pub fn header_size(&self) -> usize {
        8 + ((self.name.len() + 1 + 3) & !3)
    }

    /// Appends the header.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(self.offset);
        writer.write_le(self.size);
        writer.write_bytes(self.name.as_bytes());
        for _ in self.name.len()..self.header_size() - 8 {
            writer.write_le(0_u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x6C, 0x00, 0x00, 0x00,
            0xA4, 0x45, 0x00, 0x00,
            0x23, 0x7E, 0x00,
        ];

        let parsed_header = StreamHeader::from(&header_bytes).unwrap();

        assert_eq!(parsed_header.offset, 0x6C);
        assert_eq!(parsed_header.size, 0x45A4);
        assert_eq!(parsed_header.name, "#~");
        assert_eq!(parsed_header.header_size(), 12);
    }

    #[test]
    fn crafted_invalid() {
        #[rustfmt::skip]
        let header_bytes = [
            0x6C, 0x00, 0x00, 0x00,
            0xA4, 0x45, 0x00, 0x00,
            0x24, 0x7E, 0x00,
        ];

        assert!(StreamHeader::from(&header_bytes).is_err());
        assert!(StreamHeader::from(&header_bytes[..8]).is_err());
    }

    #[test]
    fn written_names_are_padded() {
        let header = StreamHeader {
            offset: 0x20,
            size: 0x10,
            name: "#Strings".to_string(),
        };
        let mut writer = Writer::new();
        header.write(&mut writer);

        let bytes = writer.into_vec();
        assert_eq!(bytes.len(), header.header_size());
        assert_eq!(bytes.len(), 20);
        assert_eq!(StreamHeader::from(&bytes).unwrap(), header);
    }
}
