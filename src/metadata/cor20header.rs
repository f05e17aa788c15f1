//! The CLI header (`IMAGE_COR20_HEADER`).
//!
//! # Reference
//! - [ECMA-335 II.25.3.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use bitflags::bitflags;

use crate::{
    file::{parser::Parser, writer::Writer},
    Result,
};

/// Size of the CLI header in bytes.
pub const COR20_HEADER_SIZE: u32 = 72;

bitflags! {
    /// Runtime flags of the CLI header
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CliFlags: u32 {
        /// The image contains IL only
        const IL_ONLY = 0x0000_0001;
        /// The image can only be loaded into a 32-bit process
        const REQUIRES_32BIT = 0x0000_0002;
        /// The image is a library of IL only
        const IL_LIBRARY = 0x0000_0004;
        /// The image has a strong name signature
        const STRONG_NAME_SIGNED = 0x0000_0008;
        /// The entry point is native code
        const NATIVE_ENTRYPOINT = 0x0000_0010;
        /// Track debug data
        const TRACK_DEBUG_DATA = 0x0001_0000;
        /// Prefer a 32-bit process
        const PREFERS_32BIT = 0x0002_0000;
    }
}

/// The fields of the CLI header a module reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cor20Header {
    /// Major runtime version, 2
    pub major_runtime_version: u16,
    /// Minor runtime version, 5
    pub minor_runtime_version: u16,
    /// RVA of the metadata root
    pub meta_data_rva: u32,
    /// Size of the metadata section
    pub meta_data_size: u32,
    /// Runtime flags
    pub flags: CliFlags,
    /// `MethodDef` or `File` token of the entry point, 0 for libraries
    pub entry_point_token: u32,
    /// RVA of the managed resources
    pub resource_rva: u32,
    /// Size of the managed resources
    pub resource_size: u32,
    /// RVA of the strong name signature
    pub strong_name_signature_rva: u32,
    /// Size of the strong name signature
    pub strong_name_signature_size: u32,
    /// RVA of the vtable fixups
    pub vtable_fixups_rva: u32,
    /// Size of the vtable fixups
    pub vtable_fixups_size: u32,
    /// RVA of the ready-to-run header
    pub managed_native_header_rva: u32,
    /// Size of the ready-to-run header
    pub managed_native_header_size: u32,
}

impl Cor20Header {
    /// Reads a CLI header.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated data and [`crate::Error::Malformed`]
    /// for a wrong size field or a missing metadata directory.
    pub fn read(data: &[u8]) -> Result<Cor20Header> {
        let mut parser = Parser::new(data);

        let cb = parser.read_le::<u32>()?;
        if cb != COR20_HEADER_SIZE {
            return Err(malformed_error!(
                "Invalid CLR header size: expected 72, got {}",
                cb
            ));
        }

        let major_runtime_version = parser.read_le::<u16>()?;
        let minor_runtime_version = parser.read_le::<u16>()?;
        let meta_data_rva = parser.read_le::<u32>()?;
        let meta_data_size = parser.read_le::<u32>()?;
        if meta_data_rva == 0 || meta_data_size == 0 {
            return Err(malformed_error!("CLR header has no metadata"));
        }

        let flags = CliFlags::from_bits_retain(parser.read_le::<u32>()?);
        let entry_point_token = parser.read_le::<u32>()?;
        let resource_rva = parser.read_le::<u32>()?;
        let resource_size = parser.read_le::<u32>()?;
        let strong_name_signature_rva = parser.read_le::<u32>()?;
        let strong_name_signature_size = parser.read_le::<u32>()?;
        let _code_manager_table = parser.read_le::<u64>()?;
        let vtable_fixups_rva = parser.read_le::<u32>()?;
        let vtable_fixups_size = parser.read_le::<u32>()?;
        let _export_address_table_jumps = parser.read_le::<u64>()?;
        let managed_native_header_rva = parser.read_le::<u32>()?;
        let managed_native_header_size = parser.read_le::<u32>()?;

        Ok(Cor20Header {
            major_runtime_version,
            minor_runtime_version,
            meta_data_rva,
            meta_data_size,
            flags,
            entry_point_token,
            resource_rva,
            resource_size,
            strong_name_signature_rva,
            strong_name_signature_size,
            vtable_fixups_rva,
            vtable_fixups_size,
            managed_native_header_rva,
            managed_native_header_size,
        })
    }

    /// Appends the header, 72 bytes.
    pub fn write(&self, writer: &mut Writer) {
        writer.write_le(COR20_HEADER_SIZE);
        writer.write_le(self.major_runtime_version);
        writer.write_le(self.minor_runtime_version);
        writer.write_le(self.meta_data_rva);
        writer.write_le(self.meta_data_size);
        writer.write_le(self.flags.bits());
        writer.write_le(self.entry_point_token);
        writer.write_le(self.resource_rva);
        writer.write_le(self.resource_size);
        writer.write_le(self.strong_name_signature_rva);
        writer.write_le(self.strong_name_signature_size);
        writer.write_le(0_u64);
        writer.write_le(self.vtable_fixups_rva);
        writer.write_le(self.vtable_fixups_size);
        writer.write_le(0_u64);
        writer.write_le(self.managed_native_header_rva);
        writer.write_le(self.managed_native_header_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let header_bytes = [
            0x48, 0x00, 0x00, 0x00, 0x02, 0x00, 0x05, 0x00,
            0x80, 0x20, 0x00, 0x00, 0x50, 0x06, 0x00, 0x00,
            0x09, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x06,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];

        let header = Cor20Header::read(&header_bytes).unwrap();
        assert_eq!(header.major_runtime_version, 2);
        assert_eq!(header.minor_runtime_version, 5);
        assert_eq!(header.meta_data_rva, 0x2080);
        assert_eq!(header.meta_data_size, 0x650);
        assert_eq!(header.flags, CliFlags::IL_ONLY | CliFlags::STRONG_NAME_SIGNED);
        assert_eq!(header.entry_point_token, 0x0600_0001);

        let mut writer = Writer::new();
        header.write(&mut writer);
        assert_eq!(writer.as_slice(), &header_bytes);

        assert!(Cor20Header::read(&header_bytes[..40]).is_err());
        let mut wrong_size = header_bytes;
        wrong_size[0] = 0x40;
        assert!(Cor20Header::read(&wrong_size).is_err());
    }
}
