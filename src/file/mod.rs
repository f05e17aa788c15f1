//! Raw module file access.
//!
//! A compiled module is a PE image with a CLI header. This module abstracts over the two places
//! such an image can come from: a file on disk, which is memory-mapped through [`memmap2`], and
//! an owned in-memory buffer. Both are exposed through the [`Backend`] trait and wrapped by
//! [`File`], which parses the PE container with [`goblin`] once and keeps the parsed headers
//! next to the data they borrow from.
//!
//! Next to the data sources this module holds the binary primitives every other layer builds
//! on:
//!
//! - [`parser::Parser`] - bounds-checked little-endian cursor with ECMA-335 compressed integers
//! - [`writer::Writer`] - the writing counterpart used to serialise metadata and PE images
//! - [`io::CilIO`] - fixed-size primitive conversion shared by both
//!
//! # Examples
//!
//! ```rust,no_run
//! use cilweave::file::File;
//! use std::path::Path;
//!
//! let file = File::from_file(Path::new("SystemUnderTest.dll"))?;
//! let (clr_rva, clr_size) = file.clr();
//! let offset = file.rva_to_offset(clr_rva)?;
//! println!("CLI header at file offset 0x{offset:x}, {clr_size} bytes");
//! # Ok::<(), cilweave::Error>(())
//! ```
//!
//! A mapped [`File`] keeps the underlying file open. Loaders drop it as soon as the image has
//! been parsed, so the patch orchestrator never renames a file that is still mapped.

pub mod io;
pub mod parser;
pub mod writer;

mod memory;
mod physical;

use std::path::Path;

use goblin::pe::{data_directories::DataDirectoryType, section_table::SectionTable, PE};
use ouroboros::self_referencing;

use crate::{
    Error::{Empty, GoblinErr},
    Result,
};
use memory::Memory;
use physical::Physical;

/// Read access to the bytes of one module image.
pub trait Backend {
    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the data.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the complete data.
    fn data(&self) -> &[u8];

    /// Returns the size of the data in bytes.
    fn len(&self) -> usize;
}

/// The PE header fields a module keeps to write an equivalent image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeHeaders {
    /// COFF machine
    pub machine: u16,
    /// COFF characteristics
    pub characteristics: u16,
    /// Windows subsystem
    pub subsystem: u16,
    /// DLL characteristics
    pub dll_characteristics: u16,
    /// PE32+ image
    pub is_64: bool,
}

/// A loaded PE image with a CLI header, backed either by a memory mapping or by an owned
/// buffer.
#[self_referencing]
pub struct File {
    data: Box<dyn Backend>,
    #[borrows(data)]
    #[not_covariant]
    pe: PE<'this>,
}

impl File {
    /// Memory-maps and parses the file at `file`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be opened,
    /// [`crate::Error::Empty`] if it has no content and the errors of [`File::from_mem`] for
    /// content that is not a managed PE image.
    pub fn from_file(file: &Path) -> Result<File> {
        let input = Physical::new(file)?;

        Self::load(input)
    }

    /// Parses an owned buffer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Empty`] if `data` is empty, [`crate::Error::GoblinErr`] if it
    /// is not a PE image and [`crate::Error::Malformed`] if the image has no CLI header.
    pub fn from_mem(data: Vec<u8>) -> Result<File> {
        let input = Memory::new(data);

        Self::load(input)
    }

    fn load<T: Backend + 'static>(data: T) -> Result<File> {
        if data.len() == 0 {
            return Err(Empty);
        }

        let data = Box::new(data);

        File::try_new(data, |data| match PE::parse(data.data()) {
            Ok(pe) => match pe.header.optional_header {
                Some(optional_header) => {
                    if optional_header
                        .data_directories
                        .get_clr_runtime_header()
                        .is_none()
                    {
                        Err(malformed_error!(
                            "File does not have a CLR runtime header directory"
                        ))
                    } else {
                        Ok(pe)
                    }
                }
                None => Err(malformed_error!("File does not have an OptionalHeader")),
            },
            Err(error) => Err(GoblinErr(error)),
        })
    }

    /// Returns the size of the image in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Returns `true` if the image has no bytes. Never the case for a loaded [`File`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the preferred load address.
    #[must_use]
    pub fn imagebase(&self) -> u64 {
        self.with_pe(|pe| pe.image_base)
    }

    /// Returns the header fields that describe the target platform.
    #[must_use]
    pub fn headers(&self) -> PeHeaders {
        self.with_pe(|pe| {
            let (subsystem, dll_characteristics) = pe
                .header
                .optional_header
                .map(|optional| {
                    (
                        optional.windows_fields.subsystem,
                        optional.windows_fields.dll_characteristics,
                    )
                })
                .unwrap_or_default();

            PeHeaders {
                machine: pe.header.coff_header.machine,
                characteristics: pe.header.coff_header.characteristics,
                subsystem,
                dll_characteristics,
                is_64: pe.is_64,
            }
        })
    }

    /// Returns RVA and size of the CLI header.
    #[must_use]
    pub fn clr(&self) -> (usize, usize) {
        self.get_data_directory(DataDirectoryType::ClrRuntimeHeader)
            .map_or((0, 0), |(rva, size)| (rva as usize, size as usize))
    }

    /// Returns RVA and size of a non-empty data directory.
    #[must_use]
    pub fn get_data_directory(&self, dir_type: DataDirectoryType) -> Option<(u32, u32)> {
        self.with_pe(|pe| {
            pe.header
                .optional_header?
                .data_directories
                .dirs()
                .find(|(directory_type, directory)| {
                    *directory_type == dir_type
                        && directory.virtual_address != 0
                        && directory.size != 0
                })
                .map(|(_, directory)| (directory.virtual_address, directory.size))
        })
    }

    /// Returns the section headers.
    #[must_use]
    pub fn sections(&self) -> Vec<SectionTable> {
        self.with_pe(|pe| pe.sections.clone())
    }

    /// Returns the complete image.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.with_data(|data| data.data())
    }

    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the range exceeds the image.
    pub fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.with_data(|data| data.data_slice(offset, len))
    }

    /// Translates a relative virtual address into a file offset.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if no section maps `rva`.
    pub fn rva_to_offset(&self, rva: usize) -> Result<usize> {
        let rva_u32 =
            u32::try_from(rva).map_err(|_| malformed_error!("RVA too large to fit in u32: {}", rva))?;

        self.with_pe(|pe| {
            for section in &pe.sections {
                let Some(section_max) = section.virtual_address.checked_add(section.virtual_size)
                else {
                    return Err(malformed_error!(
                        "Section malformed, causing integer overflow - {} + {}",
                        section.virtual_address,
                        section.virtual_size
                    ));
                };

                if section.virtual_address <= rva_u32 && section_max > rva_u32 {
                    return Ok((rva - section.virtual_address as usize)
                        + section.pointer_to_raw_data as usize);
                }
            }

            Err(malformed_error!(
                "RVA could not be converted to offset - {}",
                rva
            ))
        })
    }

    /// Returns the end RVA of the raw data of the section that maps `rva`.
    #[must_use]
    pub fn section_end(&self, rva: u32) -> Option<u32> {
        self.with_pe(|pe| {
            pe.sections
                .iter()
                .find(|section| {
                    section.virtual_address <= rva
                        && section
                            .virtual_address
                            .checked_add(section.virtual_size)
                            .is_some_and(|end| end > rva)
                })
                .and_then(|section| {
                    section
                        .virtual_address
                        .checked_add(section.size_of_raw_data.min(section.virtual_size))
                })
        })
    }

    /// Returns `len` bytes at `rva`.
    ///
    /// # Errors
    /// Returns the errors of [`File::rva_to_offset`] and [`crate::Error::OutOfBounds`].
    pub fn rva_slice(&self, rva: u32, len: usize) -> Result<&[u8]> {
        let offset = self.rva_to_offset(rva as usize)?;
        self.data_slice(offset, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test::calculator_module, Error};

    #[test]
    fn from_mem() {
        let image = calculator_module().to_bytes().unwrap();
        let file = File::from_mem(image.clone()).unwrap();

        assert_eq!(file.len(), image.len());
        assert!(!file.is_empty());
        assert_eq!(file.data_slice(0, 2).unwrap(), b"MZ");
        assert!(file.data_slice(image.len() - 1, 2).is_err());
        assert_eq!(file.imagebase(), 0x1000_0000);

        let (clr_rva, clr_size) = file.clr();
        assert_eq!(clr_size, 72);
        let header = file.rva_slice(clr_rva as u32, 4).unwrap();
        assert_eq!(header, &72_u32.to_le_bytes());
        assert!(file.rva_to_offset(0x7FFF_FFF0).is_err());

        let headers = file.headers();
        assert_eq!(headers.machine, 0x14C);
        assert!(!headers.is_64);
        assert!(file.sections().iter().any(|s| s.name().ok() == Some(".text")));
    }

    #[test]
    fn from_mem_empty() {
        assert!(matches!(File::from_mem(Vec::new()), Err(Error::Empty)));
    }

    #[test]
    fn from_mem_not_a_pe() {
        assert!(matches!(
            File::from_mem(b"not an image".to_vec()),
            Err(Error::GoblinErr(_))
        ));
    }

    #[test]
    fn from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Sample.dll");
        let image = calculator_module().to_bytes().unwrap();
        std::fs::write(&path, &image).unwrap();

        let file = File::from_file(&path).unwrap();
        assert_eq!(file.data(), image.as_slice());
    }

    #[test]
    fn from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = File::from_file(&dir.path().join("Missing.dll"));

        assert!(matches!(result, Err(Error::FileError(_))));
    }
}
