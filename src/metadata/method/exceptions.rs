//! Exception handling clauses of a method body.

use bitflags::bitflags;

bitflags! {
    /// Kind of an exception handling clause
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// Fault clause (finally that is called on exception only)
        const FAULT = 0x0004;
    }
}

/// One try region and its handler, offsets relative to the start of the code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExceptionHandler {
    /// Clause kind
    pub flags: ExceptionHandlerFlags,
    /// Start of the protected region
    pub try_offset: u32,
    /// Length of the protected region
    pub try_length: u32,
    /// Start of the handler
    pub handler_offset: u32,
    /// Length of the handler
    pub handler_length: u32,
    /// Catch type token for typed clauses, filter start for filter clauses, 0 otherwise
    pub filter_offset: u32,
}

impl ExceptionHandler {
    /// Returns the same clause with every code offset moved by `delta` bytes.
    ///
    /// Catch type tokens are left untouched; only filter clauses carry an offset in
    /// `filter_offset`.
    #[must_use]
    pub fn shifted(&self, delta: u32) -> ExceptionHandler {
        let filter_offset = if self.flags.contains(ExceptionHandlerFlags::FILTER) {
            self.filter_offset.saturating_add(delta)
        } else {
            self.filter_offset
        };

        ExceptionHandler {
            flags: self.flags,
            try_offset: self.try_offset.saturating_add(delta),
            try_length: self.try_length,
            handler_offset: self.handler_offset.saturating_add(delta),
            handler_length: self.handler_length,
            filter_offset,
        }
    }

    /// Returns `true` if the clause can be encoded in the small section format.
    #[must_use]
    pub fn fits_small(&self) -> bool {
        self.try_offset <= u32::from(u16::MAX)
            && self.try_length <= u32::from(u8::MAX)
            && self.handler_offset <= u32::from(u16::MAX)
            && self.handler_length <= u32::from(u8::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shift_keeps_catch_token() {
        let handler = ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset: 0,
            try_length: 10,
            handler_offset: 10,
            handler_length: 4,
            filter_offset: 0x0100_0005,
        };

        let shifted = handler.shifted(0x40);
        assert_eq!(shifted.try_offset, 0x40);
        assert_eq!(shifted.handler_offset, 0x4A);
        assert_eq!(shifted.try_length, 10);
        assert_eq!(shifted.filter_offset, 0x0100_0005);
    }

    #[test]
    fn shift_moves_filter() {
        let handler = ExceptionHandler {
            flags: ExceptionHandlerFlags::FILTER,
            try_offset: 2,
            try_length: 8,
            handler_offset: 16,
            handler_length: 4,
            filter_offset: 10,
        };

        assert_eq!(handler.shifted(5).filter_offset, 15);
        assert!(handler.fits_small());
    }
}
