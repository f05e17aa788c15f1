//! Blob heap (`#Blob`).
//!
//! # Reference
//! - [ECMA-335 II.24.2.4](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use std::collections::HashMap;

use super::align_heap;
use crate::{
    file::{parser::Parser, writer::Writer},
    Error, Result,
};

/// Read access to a `#Blob` heap.
pub struct Blob<'a> {
    data: &'a [u8],
}

impl<'a> Blob<'a> {
    /// Wraps the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap does not start with the empty blob.
    pub fn from(data: &'a [u8]) -> Result<Blob<'a>> {
        if data.first().is_some_and(|first| *first != 0) {
            return Err(malformed_error!("#Blob heap does not start with 0"));
        }

        Ok(Blob { data })
    }

    /// Returns the blob at `index`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the blob exceeds the heap.
    pub fn get(&self, index: usize) -> Result<&'a [u8]> {
        if index == 0 {
            return Ok(&[]);
        }
        if index >= self.data.len() {
            return Err(out_of_bounds_error!());
        }

        let mut parser = Parser::new(&self.data[index..]);
        let len = parser.read_compressed_uint()? as usize;
        parser.read_bytes(len)
    }
}

/// Builds a `#Blob` heap, storing every distinct blob once.
#[derive(Debug)]
pub struct BlobBuilder {
    data: Vec<u8>,
    index: HashMap<Vec<u8>, u32>,
}

impl Default for BlobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBuilder {
    /// Creates a heap holding only the empty blob.
    #[must_use]
    pub fn new() -> Self {
        BlobBuilder {
            data: vec![0],
            index: HashMap::new(),
        }
    }

    /// Adds `value` and returns its offset. The empty blob is offset 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for blobs longer than a compressed length allows.
    pub fn add(&mut self, value: &[u8]) -> Result<u32> {
        if value.is_empty() {
            return Ok(0);
        }
        if let Some(offset) = self.index.get(value) {
            return Ok(*offset);
        }

        let offset = u32::try_from(self.data.len()).map_err(|_| Error::NotSupported)?;
        let mut writer = Writer::new();
        writer.write_prefixed_bytes(value)?;
        self.data.extend_from_slice(writer.as_slice());
        self.index.insert(value.to_vec(), offset);
        Ok(offset)
    }

    /// Current unpadded size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Never `true`, the heap always holds the empty blob.
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
