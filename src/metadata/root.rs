//! Metadata root and stream directory.
//!
//! The metadata section starts with the `BSJB` signature, a version string and the headers of
//! the streams that follow. [`Root::read`] validates the directory against the section size,
//! [`Root::write`] lays out a fresh section from finished streams.
//!
//! # Reference
//! - [ECMA-335 II.24.2.1](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::streams::StreamHeader,
    Result,
};

/// Signature of the metadata root, `BSJB`.
pub const CIL_HEADER_MAGIC: u32 = 0x424A_5342;

/// Runtime version string written into new modules.
pub const DEFAULT_RUNTIME_VERSION: &str = "v4.0.30319";

/// The parsed metadata root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root {
    /// Major version, 1
    pub major_version: u16,
    /// Minor version, 1
    pub minor_version: u16,
    /// Runtime version the module was built against
    pub version: String,
    /// Reserved flags
    pub flags: u16,
    /// Stream directory
    pub stream_headers: Vec<StreamHeader>,
}

impl Root {
    /// Reads the root at the start of `data`, the complete metadata section.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for a wrong signature, duplicate streams or
    /// streams outside the section and [`crate::Error::OutOfBounds`] for truncated data.
    pub fn read(data: &[u8]) -> Result<Root> {
        let mut parser = Parser::new(data);

        let signature = parser.read_le::<u32>()?;
        if signature != CIL_HEADER_MAGIC {
            return Err(malformed_error!(
                "CIL_HEADER_MAGIC does not match - 0x{:08x}",
                signature
            ));
        }

        let major_version = parser.read_le::<u16>()?;
        let minor_version = parser.read_le::<u16>()?;
        let _reserved = parser.read_le::<u32>()?;
        let length = parser.read_le::<u32>()? as usize;
        if length > 255 {
            return Err(malformed_error!("Version string too long - {}", length));
        }
        let version_bytes = parser.read_bytes(length)?;
        let end = version_bytes
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(version_bytes.len());
        let version = String::from_utf8_lossy(&version_bytes[..end]).into_owned();

        let flags = parser.read_le::<u16>()?;
        let stream_count = parser.read_le::<u16>()?;
        if stream_count == 0 || stream_count > 6 {
            return Err(malformed_error!("Invalid stream count - {}", stream_count));
        }

        let mut stream_headers: Vec<StreamHeader> = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let position = parser.pos();
            let header = StreamHeader::from(&data[position..])?;

            let in_bounds = header
                .offset
                .checked_add(header.size)
                .is_some_and(|end| end as usize <= data.len());
            if !in_bounds {
                return Err(malformed_error!(
                    "Stream {} exceeds the metadata section",
                    header.name
                ));
            }
            if stream_headers.iter().any(|existing| existing.name == header.name) {
                return Err(malformed_error!("Duplicate stream {}", header.name));
            }

            parser.seek(position + header.header_size())?;
            stream_headers.push(header);
        }

        Ok(Root {
            major_version,
            minor_version,
            version,
            flags,
            stream_headers,
        })
    }

    /// Returns the bytes of stream `name` within `data`.
    #[must_use]
    pub fn stream<'a>(&self, data: &'a [u8], name: &str) -> Option<&'a [u8]> {
        let header = self.stream_headers.iter().find(|header| header.name == name)?;
        data.get(header.offset as usize..(header.offset + header.size) as usize)
    }

    /// Lays out a metadata section: root, directory and the given streams in order.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the section outgrows 32 bit offsets.
    pub fn write(version: &str, streams: &[(&str, &[u8])]) -> Result<Vec<u8>> {
        let mut version_bytes = version.as_bytes().to_vec();
        version_bytes.push(0);
        while version_bytes.len() % 4 != 0 {
            version_bytes.push(0);
        }

        let mut headers: Vec<StreamHeader> = streams
            .iter()
            .map(|(name, _)| StreamHeader {
                offset: 0,
                size: 0,
                name: (*name).to_string(),
            })
            .collect();

        let directory_size: usize = headers.iter().map(StreamHeader::header_size).sum();
        let mut offset = 16 + version_bytes.len() + 4 + directory_size;
        for (header, (_, content)) in headers.iter_mut().zip(streams) {
            header.offset = u32::try_from(offset)
                .map_err(|_| malformed_error!("Metadata section too large"))?;
            header.size = u32::try_from(content.len())
                .map_err(|_| malformed_error!("Metadata stream too large"))?;
            offset += content.len();
        }

        let mut writer = Writer::new();
        writer.write_le(CIL_HEADER_MAGIC);
        writer.write_le(1_u16);
        writer.write_le(1_u16);
        writer.write_le(0_u32);
        writer.write_le(u32::try_from(version_bytes.len()).unwrap_or_default());
        writer.write_bytes(&version_bytes);
        writer.write_le(0_u16);
        writer.write_le(u16::try_from(headers.len()).unwrap_or_default());
        for header in &headers {
            header.write(&mut writer);
        }
        for (_, content) in streams {
            writer.write_bytes(content);
        }

        Ok(writer.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x42, 0x53, 0x4A, 0x42,
            0x01, 0x00,
            0x01, 0x00,
            0x00, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            b'v', b'4', 0x00, 0x00,
            0x00, 0x00,
            0x01, 0x00,
            0x24, 0x00, 0x00, 0x00,
            0x04, 0x00, 0x00, 0x00,
            0x23, 0x7E, 0x00, 0x00,
            0xAA, 0xBB, 0xCC, 0xDD,
        ];

        let root = Root::read(&header_bytes).unwrap();
        assert_eq!(root.version, "v4");
        assert_eq!(root.stream_headers.len(), 1);
        assert_eq!(
            root.stream(&header_bytes, "#~").unwrap(),
            &[0xAA, 0xBB, 0xCC, 0xDD]
        );
        assert!(root.stream(&header_bytes, "#Blob").is_none());

        let mut wrong_magic = header_bytes;
        wrong_magic[0] = 0;
        assert!(Root::read(&wrong_magic).is_err());

        // stream runs past the section
        assert!(Root::read(&header_bytes[..38]).is_err());
    }

    #[test]
    fn write_then_read() {
        let tables = [1_u8, 2, 3, 4];
        let strings = [0_u8, b'A', 0, 0];
        let data = Root::write(
            DEFAULT_RUNTIME_VERSION,
            &[("#~", tables.as_slice()), ("#Strings", strings.as_slice())],
        )
        .unwrap();

        let root = Root::read(&data).unwrap();
        assert_eq!(root.version, DEFAULT_RUNTIME_VERSION);
        assert_eq!((root.major_version, root.minor_version), (1, 1));
        assert_eq!(root.stream(&data, "#~").unwrap(), &tables);
        assert_eq!(root.stream(&data, "#Strings").unwrap(), &strings);
        assert_eq!(root.stream_headers[0].offset % 4, 0);
    }

    #[test]
    fn duplicate_streams() {
        let empty = [0_u8; 4];
        let data = Root::write("v4.0", &[("#~", empty.as_slice()), ("#~", empty.as_slice())]).unwrap();
        assert!(Root::read(&data).is_err());
    }
}
