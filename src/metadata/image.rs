//! PE level information of a module.
//!
//! The metadata model describes what a module contains; [`ImageInfo`] keeps what the PE
//! container around it says about how to load it: target machine, subsystem, CLI flags, the
//! runtime version of the metadata root and the data the CLI header points to besides metadata
//! and method bodies. Writing a loaded module reproduces these values.

use crate::{
    file::{io::read_le, PeHeaders},
    metadata::{cor20header::CliFlags, root::DEFAULT_RUNTIME_VERSION},
    Result,
};

/// `IMAGE_FILE_MACHINE_I386`
pub const MACHINE_I386: u16 = 0x014C;
/// `IMAGE_FILE_MACHINE_AMD64`
pub const MACHINE_AMD64: u16 = 0x8664;
/// `IMAGE_FILE_DLL`
pub const CHARACTERISTICS_DLL: u16 = 0x2000;

/// PE and CLI header values of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// COFF and optional header values
    pub headers: PeHeaders,
    /// CLI header flags
    pub cli_flags: CliFlags,
    /// Version string of the metadata root
    pub runtime_version: String,
    /// Managed resources the `ManifestResource` offsets point into
    pub resources: Vec<u8>,
    /// Space reserved for a strong name signature
    pub strong_name_signature_size: u32,
    /// Native resources
    pub win32_resources: Option<Win32Resources>,
}

impl Default for ImageInfo {
    fn default() -> Self {
        ImageInfo {
            headers: PeHeaders {
                machine: MACHINE_I386,
                characteristics: 0x0102 | CHARACTERISTICS_DLL,
                subsystem: 3,
                dll_characteristics: 0x8540,
                is_64: false,
            },
            cli_flags: CliFlags::IL_ONLY,
            runtime_version: DEFAULT_RUNTIME_VERSION.to_string(),
            resources: Vec::new(),
            strong_name_signature_size: 0,
            win32_resources: None,
        }
    }
}

impl ImageInfo {
    /// Returns `true` for libraries.
    #[must_use]
    pub fn is_dll(&self) -> bool {
        self.headers.characteristics & CHARACTERISTICS_DLL != 0
    }
}

/// The native resource directory (`.rsrc`) of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Win32Resources {
    /// RVA the directory was loaded from
    pub rva: u32,
    /// Size announced by the data directory
    pub size: u32,
    /// Directory tree and resource data up to the end of the section
    pub data: Vec<u8>,
}

impl Win32Resources {
    /// Returns the resource data relocated to `new_rva`.
    ///
    /// Directory offsets are relative to the directory start and stay as they are; the RVAs of
    /// the data entries are moved along with the block.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for loops, excessive nesting or data entries outside
    /// the block.
    pub fn relocated(&self, new_rva: u32) -> Result<Vec<u8>> {
        let mut data = self.data.clone();
        let mut visited = Vec::new();
        self.relocate_directory(&mut data, 0, new_rva, 0, &mut visited)?;
        Ok(data)
    }

    fn relocate_directory(
        &self,
        data: &mut [u8],
        offset: usize,
        new_rva: u32,
        depth: usize,
        visited: &mut Vec<usize>,
    ) -> Result<()> {
        if depth > 8 || visited.contains(&offset) {
            return Err(malformed_error!("Resource directory loops at {}", offset));
        }
        visited.push(offset);

        let header = data
            .get(offset..offset + 16)
            .ok_or_else(|| malformed_error!("Resource directory outside the section"))?;
        let named = read_le::<u16>(&header[12..])? as usize;
        let ids = read_le::<u16>(&header[14..])? as usize;

        for index in 0..named + ids {
            let entry = offset + 16 + index * 8;
            let target = read_le::<u32>(
                data.get(entry + 4..entry + 8)
                    .ok_or_else(|| malformed_error!("Resource entry outside the section"))?,
            )?;

            if target & 0x8000_0000 != 0 {
                let child = (target & 0x7FFF_FFFF) as usize;
                self.relocate_directory(data, child, new_rva, depth + 1, visited)?;
                continue;
            }

            let data_entry = target as usize;
            let slot = data
                .get_mut(data_entry..data_entry + 4)
                .ok_or_else(|| malformed_error!("Resource data entry outside the section"))?;
            let rva = read_le::<u32>(slot)?;
            let Some(relative) = rva
                .checked_sub(self.rva)
                .filter(|relative| (*relative as usize) < self.data.len())
            else {
                return Err(malformed_error!("Resource data at 0x{:x} outside the section", rva));
            };
            slot.copy_from_slice(&(new_rva + relative).to_le_bytes());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One type directory with one id entry pointing at a data entry.
    fn resources(rva: u32) -> Win32Resources {
        let mut data = vec![0_u8; 48];
        data[14] = 1; // one id entry
        data[16..20].copy_from_slice(&16_u32.to_le_bytes());
        data[20..24].copy_from_slice(&24_u32.to_le_bytes());
        data[24..28].copy_from_slice(&(rva + 40).to_le_bytes());
        data[28..32].copy_from_slice(&8_u32.to_le_bytes());
        Win32Resources {
            rva,
            size: 48,
            data,
        }
    }

    #[test]
    fn relocation_moves_data_entries() {
        let rsrc = resources(0x4000);
        let moved = rsrc.relocated(0x6000).unwrap();
        assert_eq!(read_le::<u32>(&moved[24..]).unwrap(), 0x6000 + 40);
        assert_eq!(&moved[..24], &rsrc.data[..24]);
    }

    #[test]
    fn relocation_rejects_loops_and_foreign_data() {
        let mut looping = resources(0x4000);
        looping.data[20..24].copy_from_slice(&0x8000_0000_u32.to_le_bytes());
        assert!(looping.relocated(0x6000).is_err());

        let mut foreign = resources(0x4000);
        foreign.data[24..28].copy_from_slice(&0x9000_u32.to_le_bytes());
        assert!(foreign.relocated(0x6000).is_err());
    }

    #[test]
    fn default_is_a_library() {
        let info = ImageInfo::default();
        assert!(info.is_dll());
        assert_eq!(info.headers.machine, MACHINE_I386);
        assert_eq!(info.runtime_version, "v4.0.30319");
    }
}
