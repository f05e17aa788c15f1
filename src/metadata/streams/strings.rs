//! String heap (`#Strings`).
//!
//! # Reference
//! - [ECMA-335 II.24.2.3](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use std::{collections::HashMap, ffi::CStr};

use super::align_heap;
use crate::{Error, Result};

/// Read access to a `#Strings` heap.
pub struct Strings<'a> {
    data: &'a [u8],
}

impl<'a> Strings<'a> {
    /// Wraps the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty string.
    pub fn from(data: &'a [u8]) -> Result<Strings<'a>> {
        if data.first().is_some_and(|first| *first != 0) {
            return Err(malformed_error!("#Strings heap does not start with 0"));
        }

        Ok(Strings { data })
    }

    /// Returns the string at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for offsets past the heap and
    /// [`crate::Error::Malformed`] for unterminated or non UTF-8 data.
    pub fn get(&self, index: usize) -> Result<&'a str> {
        if index == 0 {
            return Ok("");
        }
        if index >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        match CStr::from_bytes_until_nul(&self.data[index..]) {
            Ok(result) => result
                .to_str()
                .map_err(|_| malformed_error!("Invalid string at index - {}", index)),
            Err(_) => Err(malformed_error!("Invalid string at index - {}", index)),
        }
    }
}

/// Builds a `#Strings` heap, storing every distinct string once.
#[derive(Debug)]
pub struct StringsBuilder {
    data: Vec<u8>,
    index: HashMap<String, u32>,
}

impl Default for StringsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StringsBuilder {
    /// Creates a heap holding only the empty string.
    #[must_use]
    pub fn new() -> Self {
        StringsBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Adds `value` and returns its offset. The empty string is offset 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for strings containing NUL.
    pub fn add(&mut self, value: &str) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }
        if value.contains('\0') {
            return Err(malformed_error!("Identifier contains NUL - {:?}", value));
        }

        let offset = u32::try_from(self.data.len()).map_err(|_| Error::NotSupported)?;
        self.data.extend_from_slice(value.as_bytes());
        self.data.push(0);
        self.index.insert(value.to_string(), offset);
        Ok(offset)
    }

    /// Current unpadded size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Never `true`, the heap always holds the empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the padded heap.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        align_heap(&mut self.data);
        self.data
    }
}
