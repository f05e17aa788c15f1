use bitflags::bitflags;

use crate::{
    file::{
        io::{read_le, read_le_at},
        writer::Writer,
    },
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags},
        signatures::TypeSig,
        token::Token,
    },
    Result,
};

bitflags! {
    /// Flags that a method body header can have
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodBodyFlags: u16 {
        /// Tiny method header format
        const TINY_FORMAT = 0x2;
        /// Fat method header format
        const FAT_FORMAT = 0x3;
        /// More data sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialize all local variables
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    /// Flags of an extra data section following the code
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u8 {
        /// Section contains exception handling data
        const EHTABLE = 0x1;
        /// Reserved, shall be 0
        const OPT_ILTABLE = 0x2;
        /// Section uses the fat layout
        const FAT_FORMAT = 0x40;
        /// Another section follows this one
        const MORE_SECTS = 0x80;
    }
}

const FAT_HEADER_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;
const SMALL_CLAUSE_SIZE: usize = 12;

/// The executable part of a method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MethodBody {
    /// Maximum number of evaluation stack slots the code uses
    pub max_stack: u16,
    /// Locals are zero-initialized on entry
    pub init_locals: bool,
    /// Local variable types, indexed by `ldloc` / `stloc` operands
    pub locals: Vec<TypeSig>,
    /// Raw CIL code
    pub code: Vec<u8>,
    /// Exception handling clauses
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Create a body without locals or exception handlers.
    #[must_use]
    pub fn new(code: Vec<u8>, max_stack: u16) -> Self {
        MethodBody {
            max_stack,
            init_locals: false,
            locals: Vec::new(),
            code,
            exception_handlers: Vec::new(),
        }
    }

    /// Parses a tiny or fat body blob.
    ///
    /// The local variable types live in a separate `StandAloneSig` row, so the returned body
    /// has an empty `locals` list. Use [`MethodBody::parse_with_locals`] to learn the row.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] / [`crate::Error::OutOfBounds`] for damaged data.
    pub fn parse(data: &[u8]) -> Result<MethodBody> {
        Self::parse_with_locals(data).map(|(body, _)| body)
    }

    /// Parses a tiny or fat body blob and returns the local variable signature token of its
    /// header, the null token if there is none.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] / [`crate::Error::OutOfBounds`] for damaged data.
    pub fn parse_with_locals(data: &[u8]) -> Result<(MethodBody, Token)> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_0000_0011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                let Some(code) = data.get(1..1 + size_code) else {
                    return Err(out_of_bounds_error!());
                };

                Ok((
                    MethodBody {
                        max_stack: 8,
                        init_locals: false,
                        locals: Vec::new(),
                        code: code.to_vec(),
                        exception_handlers: Vec::new(),
                    },
                    Token::new(0),
                ))
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < FAT_HEADER_SIZE {
                    return Err(out_of_bounds_error!());
                }

                let first_duo = read_le::<u16>(data)?;
                let size_header = ((first_duo >> 12) * 4) as usize;
                if size_header < FAT_HEADER_SIZE {
                    return Err(malformed_error!("Invalid fat header size - {}", size_header));
                }

                let mut cursor = 2;
                let max_stack = read_le_at::<u16>(data, &mut cursor)?;
                let size_code = read_le_at::<u32>(data, &mut cursor)? as usize;
                let local_var_sig_token = Token::new(read_le_at::<u32>(data, &mut cursor)?);
                let flags_header =
                    MethodBodyFlags::from_bits_truncate(first_duo & 0b_0000_1111_1111_1111_u16);

                let Some(code_end) = size_header.checked_add(size_code) else {
                    return Err(out_of_bounds_error!());
                };
                let Some(code) = data.get(size_header..code_end) else {
                    return Err(out_of_bounds_error!());
                };

                let exception_handlers = if flags_header.contains(MethodBodyFlags::MORE_SECTS) {
                    Self::parse_sections(data, code_end)?
                } else {
                    Vec::new()
                };

                Ok((
                    MethodBody {
                        max_stack,
                        init_locals: flags_header.contains(MethodBodyFlags::INIT_LOCALS),
                        locals: Vec::new(),
                        code: code.to_vec(),
                        exception_handlers,
                    },
                    local_var_sig_token,
                ))
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }

    // Exception Handling -> II.25.4.6
    fn parse_sections(data: &[u8], code_end: usize) -> Result<Vec<ExceptionHandler>> {
        let mut exception_handlers = Vec::new();
        let mut cursor = (code_end + 3) & !3;

        loop {
            let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(
                data.get(cursor..).ok_or(out_of_bounds_error!())?,
            )?);
            if !section_flags.contains(SectionFlags::EHTABLE) {
                return Err(malformed_error!(
                    "Unsupported method data section - {:02X}",
                    section_flags.bits()
                ));
            }

            let section_start = cursor;
            let mut header_cursor = cursor;
            let header = read_le_at::<u32>(data, &mut header_cursor)?;
            let fat = section_flags.contains(SectionFlags::FAT_FORMAT);
            let section_size = if fat {
                (header >> 8) as usize
            } else {
                ((header >> 8) & 0xFF) as usize
            };

            let clause_size = if fat {
                FAT_CLAUSE_SIZE
            } else {
                SMALL_CLAUSE_SIZE
            };
            if section_size < 4 || (section_size - 4) % clause_size != 0 {
                return Err(malformed_error!(
                    "Invalid exception section size - {}",
                    section_size
                ));
            }
            if data.len() < section_start + section_size {
                return Err(out_of_bounds_error!());
            }

            cursor = section_start + 4;
            for _ in 0..(section_size - 4) / clause_size {
                let handler = if fat {
                    #[allow(clippy::cast_possible_truncation)]
                    let flags = read_le_at::<u32>(data, &mut cursor)? as u16;
                    ExceptionHandler {
                        flags: ExceptionHandlerFlags::from_bits_truncate(flags),
                        try_offset: read_le_at::<u32>(data, &mut cursor)?,
                        try_length: read_le_at::<u32>(data, &mut cursor)?,
                        handler_offset: read_le_at::<u32>(data, &mut cursor)?,
                        handler_length: read_le_at::<u32>(data, &mut cursor)?,
                        filter_offset: read_le_at::<u32>(data, &mut cursor)?,
                    }
                } else {
                    ExceptionHandler {
                        flags: ExceptionHandlerFlags::from_bits_truncate(read_le_at::<u16>(
                            data,
                            &mut cursor,
                        )?),
                        try_offset: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        try_length: u32::from(read_le_at::<u8>(data, &mut cursor)?),
                        handler_offset: u32::from(read_le_at::<u16>(data, &mut cursor)?),
                        handler_length: u32::from(read_le_at::<u8>(data, &mut cursor)?),
                        filter_offset: read_le_at::<u32>(data, &mut cursor)?,
                    }
                };
                exception_handlers.push(handler);
            }

            if !section_flags.contains(SectionFlags::MORE_SECTS) {
                return Ok(exception_handlers);
            }
            cursor = (cursor + 3) & !3;
        }
    }

    /// Returns `true` if the body can use the one byte tiny header.
    #[must_use]
    pub fn is_tiny(&self) -> bool {
        self.code.len() < 64
            && self.max_stack <= 8
            && self.locals.is_empty()
            && !self.init_locals
            && self.exception_handlers.is_empty()
    }

    /// Encodes the body blob without a local variable signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the code or handler table is too large.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.encode_with_locals(Token::new(0))
    }

    /// Encodes the body blob: header, code and exception handling section. `locals` is the
    /// `StandAloneSig` token stored in a fat header.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the code or handler table is too large.
    pub fn encode_with_locals(&self, locals: Token) -> Result<Vec<u8>> {
        let mut writer = Writer::new();

        if self.is_tiny() && locals.is_null() {
            #[allow(clippy::cast_possible_truncation)]
            writer.write_le(((self.code.len() as u8) << 2) | 0x2);
            writer.write_bytes(&self.code);
            return Ok(writer.into_vec());
        }

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !self.exception_handlers.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        let code_size = u32::try_from(self.code.len())
            .map_err(|_| malformed_error!("Method body size exceeds u32 range"))?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_le(flags.bits() | (((FAT_HEADER_SIZE / 4) as u16) << 12));
        writer.write_le(self.max_stack);
        writer.write_le(code_size);
        writer.write_token(locals);
        writer.write_bytes(&self.code);

        if !self.exception_handlers.is_empty() {
            while writer.len() % 4 != 0 {
                writer.write_le(0_u8);
            }

            let section_size = 4 + self.exception_handlers.len() * FAT_CLAUSE_SIZE;
            if section_size > 0x00FF_FFFF {
                return Err(malformed_error!(
                    "Too many exception handlers - {}",
                    self.exception_handlers.len()
                ));
            }

            #[allow(clippy::cast_possible_truncation)]
            let header = u32::from((SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT).bits())
                | ((section_size as u32) << 8);
            writer.write_le(header);

            for handler in &self.exception_handlers {
                writer.write_le(u32::from(handler.flags.bits()));
                writer.write_le(handler.try_offset);
                writer.write_le(handler.try_length);
                writer.write_le(handler.handler_offset);
                writer.write_le(handler.handler_length);
                writer.write_le(handler.filter_offset);
            }
        }

        Ok(writer.into_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny() {
        // ldarg.0 ldarg.1 add ret
        let data = [0x12, 0x02, 0x03, 0x58, 0x2A];

        let body = MethodBody::parse(&data).unwrap();
        assert_eq!(body.code, vec![0x02, 0x03, 0x58, 0x2A]);
        assert_eq!(body.max_stack, 8);
        assert!(body.is_tiny());
        assert_eq!(body.encode().unwrap(), data.to_vec());
    }

    #[test]
    fn tiny_truncated() {
        assert!(MethodBody::parse(&[0x12, 0x02]).is_err());
        assert!(MethodBody::parse(&[]).is_err());
    }

    #[test]
    fn fat_with_handlers() {
        let body = MethodBody {
            max_stack: 3,
            init_locals: true,
            locals: Vec::new(),
            code: vec![0x00; 13],
            exception_handlers: vec![ExceptionHandler {
                flags: ExceptionHandlerFlags::FINALLY,
                try_offset: 0,
                try_length: 6,
                handler_offset: 6,
                handler_length: 6,
                filter_offset: 0,
            }],
        };

        let encoded = body.encode().unwrap();
        assert_eq!(encoded[0] & 0x3, 0x3);
        assert_eq!(encoded.len(), 12 + 16 + 4 + 24);

        let parsed = MethodBody::parse(&encoded).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn small_handler_section() {
        let mut data = vec![
            0x1B, 0x30, // fat, more sects, init locals, header size 3
            0x02, 0x00, // max stack
            0x04, 0x00, 0x00, 0x00, // code size
            0x00, 0x00, 0x00, 0x00, // local sig
            0x00, 0x00, 0xDC, 0x2A, // nop nop endfinally ret
            0x01, 0x10, 0x00, 0x00, // small EH section of 16 bytes
        ];
        data.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x02, 0, 0, 0, 0]);

        let body = MethodBody::parse(&data).unwrap();
        assert_eq!(body.code.len(), 4);
        assert!(body.init_locals);
        assert_eq!(body.exception_handlers.len(), 1);
        assert_eq!(body.exception_handlers[0].flags, ExceptionHandlerFlags::FINALLY);
        assert_eq!(body.exception_handlers[0].handler_offset, 1);
        assert_eq!(body.exception_handlers[0].handler_length, 2);
    }

    #[test]
    fn fat_header_keeps_local_signature() {
        let mut body = MethodBody::new(vec![0x16, 0x0A, 0x06, 0x2A], 1);
        body.locals.push(TypeSig::I4);
        body.init_locals = true;

        let encoded = body.encode_with_locals(Token::new(0x1100_0002)).unwrap();
        assert_eq!(&encoded[8..12], &[0x02, 0x00, 0x00, 0x11]);

        let (parsed, locals) = MethodBody::parse_with_locals(&encoded).unwrap();
        assert_eq!(locals, Token::new(0x1100_0002));
        assert_eq!(parsed.code, body.code);
        assert!(parsed.locals.is_empty());
    }

    #[test]
    fn invalid_header() {
        assert!(MethodBody::parse(&[0x00, 0x00]).is_err());
        assert!(MethodBody::parse(&[0x03, 0x10, 0x00]).is_err());
    }
}
