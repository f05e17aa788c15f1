//! PE container layout.
//!
//! The written image has the shape compilers produce for IL-only modules: headers in the first
//! file block, a `.text` section holding the CLI header, method bodies, field data, managed
//! resources, strong name space and metadata, an optional `.rsrc` section with the native
//! resources and, for PE32 images, the `mscoree.dll` import with its entry stub and the base
//! relocation for that stub. PE32+ images load without the stub and carry neither.
//!
//! Nothing depends on time or memory addresses, so a module always serialises to the same
//! bytes.

use crate::{
    file::writer::Writer,
    metadata::{
        cor20header::{Cor20Header, COR20_HEADER_SIZE},
        image::ImageInfo,
    },
    Result,
};

const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x2000;
const HEADERS_SIZE: u32 = 0x200;
const TEXT_RVA: u32 = SECTION_ALIGNMENT;
const PE_OFFSET: u32 = 0x80;
const CHECKSUM_OFFSET: usize = PE_OFFSET as usize + 4 + 20 + 64;

const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;

const IMAGE_REL_BASED_HIGHLOW: u16 = 3;

const DIRECTORY_IMPORT: usize = 1;
const DIRECTORY_RESOURCE: usize = 2;
const DIRECTORY_BASERELOC: usize = 5;
const DIRECTORY_IAT: usize = 12;
const DIRECTORY_CLR: usize = 14;

/// Size of the import address table of a PE32 image: one thunk and the terminator.
const IAT_SIZE: u32 = 8;

#[rustfmt::skip]
const DOS_STUB: [u8; 14] = [
    0x0E, 0x1F, 0xBA, 0x0E, 0x00, 0xB4, 0x09, 0xCD,
    0x21, 0xB8, 0x01, 0x4C, 0xCD, 0x21,
];
const DOS_MESSAGE: &[u8] = b"This program cannot be run in DOS mode.\r\r\n$";

/// The `.text` section while it is filled.
///
/// The PE32 import address table and the CLI header are reserved up front at fixed places; all
/// other content is appended and addressed by the RVA [`TextSection::append`] returns.
pub(crate) struct TextSection {
    is_64: bool,
    data: Vec<u8>,
}

impl TextSection {
    pub(crate) fn new(is_64: bool) -> Self {
        let reserved = if is_64 { 0 } else { IAT_SIZE };
        TextSection {
            is_64,
            data: vec![0; (reserved + COR20_HEADER_SIZE) as usize],
        }
    }

    /// Appends `bytes` at the next multiple of `alignment` and returns their RVA.
    pub(crate) fn append(&mut self, bytes: &[u8], alignment: usize) -> Result<u32> {
        self.pad(alignment);
        let rva = self.rva()?;
        self.data.extend_from_slice(bytes);
        Ok(rva)
    }

    /// Appends `size` zero bytes and returns their RVA.
    pub(crate) fn reserve(&mut self, size: u32, alignment: usize) -> Result<u32> {
        self.pad(alignment);
        let rva = self.rva()?;
        self.data.resize(self.data.len() + size as usize, 0);
        Ok(rva)
    }

    fn pad(&mut self, alignment: usize) {
        while self.data.len() % alignment != 0 {
            self.data.push(0);
        }
    }

    fn rva(&self) -> Result<u32> {
        u32::try_from(self.data.len())
            .ok()
            .and_then(|offset| offset.checked_add(TEXT_RVA))
            .ok_or_else(|| malformed_error!("Image exceeds 4 GiB"))
    }

    fn cli_header_rva(&self) -> u32 {
        if self.is_64 {
            TEXT_RVA
        } else {
            TEXT_RVA + IAT_SIZE
        }
    }

    fn write_at(&mut self, rva: u32, bytes: &[u8]) {
        let offset = (rva - TEXT_RVA) as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

/// One section of the written image.
struct Section {
    name: [u8; 8],
    rva: u32,
    data: Vec<u8>,
    characteristics: u32,
}

impl Section {
    fn virtual_size(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    fn raw_size(&self) -> u32 {
        align(self.virtual_size(), FILE_ALIGNMENT)
    }
}

/// Preferred load address of an image.
pub(crate) fn image_base(image: &ImageInfo) -> u64 {
    match (image.headers.is_64, image.is_dll()) {
        (false, true) => 0x1000_0000,
        (false, false) => 0x0040_0000,
        (true, true) => 0x1_8000_0000,
        (true, false) => 0x1_4000_0000,
    }
}

/// Completes `text` with the CLI header and the native loader glue and lays out the image.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if the image outgrows 32 bit offsets or the native
/// resources cannot be relocated.
pub(crate) fn write_image(
    mut text: TextSection,
    cor20: &Cor20Header,
    image: &ImageInfo,
) -> Result<Vec<u8>> {
    let is_64 = image.headers.is_64;
    let base = image_base(image);
    let mut directories = [(0_u32, 0_u32); 16];

    let mut header = Writer::new();
    cor20.write(&mut header);
    let cli_header_rva = text.cli_header_rva();
    text.write_at(cli_header_rva, header.as_slice());
    directories[DIRECTORY_CLR] = (cli_header_rva, COR20_HEADER_SIZE);

    let mut entry_point = 0;
    let mut stub_rva = None;
    if !is_64 {
        let (import_rva, import_size) = write_imports(&mut text, image.is_dll())?;
        directories[DIRECTORY_IMPORT] = (import_rva, import_size);
        directories[DIRECTORY_IAT] = (TEXT_RVA, IAT_SIZE);

        // jmp dword ptr [iat], with the address operand 4 byte aligned
        text.pad(4);
        text.data.extend_from_slice(&[0, 0]);
        let jump = text.rva()?;
        let iat = u32::try_from(base + u64::from(TEXT_RVA))
            .map_err(|_| malformed_error!("PE32 image base out of range"))?;
        let mut stub = vec![0xFF, 0x25];
        stub.extend_from_slice(&iat.to_le_bytes());
        text.data.extend_from_slice(&stub);
        entry_point = jump;
        stub_rva = Some(jump + 2);
    }

    let mut sections = vec![Section {
        name: *b".text\0\0\0",
        rva: TEXT_RVA,
        data: text.data,
        characteristics: IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ,
    }];

    if let Some(resources) = &image.win32_resources {
        let rva = next_rva(&sections)?;
        directories[DIRECTORY_RESOURCE] = (rva, resources.size);
        sections.push(Section {
            name: *b".rsrc\0\0\0",
            rva,
            data: resources.relocated(rva)?,
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ,
        });
    }

    if let Some(target) = stub_rva {
        let rva = next_rva(&sections)?;
        let mut block = Writer::new();
        block.write_le(target & !0xFFF);
        block.write_le(12_u32);
        #[allow(clippy::cast_possible_truncation)]
        block.write_le((IMAGE_REL_BASED_HIGHLOW << 12) | (target & 0xFFF) as u16);
        block.write_le(0_u16);
        directories[DIRECTORY_BASERELOC] = (rva, 12);
        sections.push(Section {
            name: *b".reloc\0\0",
            rva,
            data: block.into_vec(),
            characteristics: IMAGE_SCN_CNT_INITIALIZED_DATA
                | IMAGE_SCN_MEM_DISCARDABLE
                | IMAGE_SCN_MEM_READ,
        });
    }

    let size_of_image = next_rva(&sections)?;
    let size_of_code = sections[0].raw_size();
    let size_of_data: u32 = sections[1..].iter().map(Section::raw_size).sum();

    let mut writer = Writer::new();
    write_dos_header(&mut writer);

    writer.write_bytes(b"PE\0\0");
    writer.write_le(image.headers.machine);
    #[allow(clippy::cast_possible_truncation)]
    writer.write_le(sections.len() as u16);
    writer.write_le(0_u32);
    writer.write_le(0_u32);
    writer.write_le(0_u32);
    writer.write_le(if is_64 { 240_u16 } else { 224_u16 });
    writer.write_le(image.headers.characteristics);

    writer.write_le(if is_64 { 0x020B_u16 } else { 0x010B_u16 });
    writer.write_le(8_u8);
    writer.write_le(0_u8);
    writer.write_le(size_of_code);
    writer.write_le(size_of_data);
    writer.write_le(0_u32);
    writer.write_le(entry_point);
    writer.write_le(TEXT_RVA);
    if is_64 {
        writer.write_le(base);
    } else {
        writer.write_le(sections.get(1).map_or(0, |section| section.rva));
        #[allow(clippy::cast_possible_truncation)]
        writer.write_le(base as u32);
    }
    writer.write_le(SECTION_ALIGNMENT);
    writer.write_le(FILE_ALIGNMENT);
    writer.write_le(4_u16);
    writer.write_le(0_u16);
    writer.write_le(0_u16);
    writer.write_le(0_u16);
    writer.write_le(4_u16);
    writer.write_le(0_u16);
    writer.write_le(0_u32);
    writer.write_le(size_of_image);
    writer.write_le(HEADERS_SIZE);
    writer.write_le(0_u32);
    writer.write_le(image.headers.subsystem);
    writer.write_le(image.headers.dll_characteristics);
    for size in [0x10_0000_u32, 0x1000, 0x10_0000, 0x1000] {
        if is_64 {
            writer.write_le(u64::from(size));
        } else {
            writer.write_le(size);
        }
    }
    writer.write_le(0_u32);
    writer.write_le(16_u32);
    for (rva, size) in directories {
        writer.write_le(rva);
        writer.write_le(size);
    }

    let mut offset = HEADERS_SIZE;
    for section in &sections {
        writer.write_bytes(&section.name);
        writer.write_le(section.virtual_size());
        writer.write_le(section.rva);
        writer.write_le(section.raw_size());
        writer.write_le(offset);
        writer.write_le(0_u32);
        writer.write_le(0_u32);
        writer.write_le(0_u16);
        writer.write_le(0_u16);
        writer.write_le(section.characteristics);
        offset += section.raw_size();
    }

    let mut data = writer.into_vec();
    data.resize(HEADERS_SIZE as usize, 0);
    for section in &sections {
        data.extend_from_slice(&section.data);
        data.resize(align(to_u32(data.len())?, FILE_ALIGNMENT) as usize, 0);
    }

    let checksum = checksum(&data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
    Ok(data)
}

/// Appends the import directory, lookup table, hint/name entry and DLL name and points the
/// import address table at the hint/name entry. Returns the directory RVA and size.
fn write_imports(text: &mut TextSection, is_dll: bool) -> Result<(u32, u32)> {
    text.pad(4);
    let directory = text.rva()?;
    let lookup = directory + 40;
    let hint_name = lookup + 8;
    let function: &[u8] = if is_dll {
        b"_CorDllMain\0"
    } else {
        b"_CorExeMain\0"
    };
    let dll_name = hint_name + 2 + to_u32(function.len())?;

    let mut imports = Writer::new();
    imports.write_le(lookup);
    imports.write_le(0_u32);
    imports.write_le(0_u32);
    imports.write_le(dll_name);
    imports.write_le(TEXT_RVA);
    imports.write_bytes(&[0; 20]);
    imports.write_le(hint_name);
    imports.write_le(0_u32);
    imports.write_le(0_u16);
    imports.write_bytes(function);
    imports.write_bytes(b"mscoree.dll\0");
    text.data.extend_from_slice(imports.as_slice());

    text.write_at(TEXT_RVA, &hint_name.to_le_bytes());
    Ok((directory, 40))
}

fn write_dos_header(writer: &mut Writer) {
    writer.write_bytes(b"MZ");
    writer.write_le(0x90_u16);
    writer.write_le(3_u16);
    writer.write_le(0_u16);
    writer.write_le(4_u16);
    writer.write_le(0_u16);
    writer.write_le(0xFFFF_u16);
    writer.write_le(0_u16);
    writer.write_le(0xB8_u16);
    writer.write_bytes(&[0; 6]);
    writer.write_le(0x40_u16);
    writer.write_bytes(&[0; 34]);
    writer.write_le(PE_OFFSET);
    writer.write_bytes(&DOS_STUB);
    writer.write_bytes(DOS_MESSAGE);
    while writer.len() < PE_OFFSET as usize {
        writer.write_le(0_u8);
    }
}

fn next_rva(sections: &[Section]) -> Result<u32> {
    let last = sections
        .last()
        .ok_or_else(|| malformed_error!("Image has no sections"))?;
    last.rva
        .checked_add(align(last.virtual_size(), SECTION_ALIGNMENT))
        .ok_or_else(|| malformed_error!("Image exceeds 4 GiB"))
}

fn align(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Image exceeds 4 GiB"))
}

/// The PE checksum: 16 bit one's complement sum of the file without the checksum field, plus
/// the file size.
fn checksum(data: &[u8]) -> u32 {
    let mut sum: u64 = 0;
    for (index, chunk) in data.chunks(2).enumerate() {
        let offset = index * 2;
        if (CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4).contains(&offset) {
            continue;
        }
        let word = match chunk {
            [low, high] => u16::from_le_bytes([*low, *high]),
            [low] => u16::from(*low),
            _ => 0,
        };
        sum += u64::from(word);
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }

    sum += data.len() as u64;
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    #[allow(clippy::cast_possible_truncation)]
    let checksum = sum as u32;
    checksum
}
