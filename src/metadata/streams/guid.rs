//! GUID heap (`#GUID`).
//!
//! # Reference
//! - [ECMA-335 II.24.2.5](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use crate::{Error, Result};

/// Read access to a `#GUID` heap.
pub struct Guid<'a> {
    data: &'a [u8],
}

impl<'a> Guid<'a> {
    /// Wraps the heap bytes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the heap is not a whole number of GUIDs.
    pub fn from(data: &'a [u8]) -> Result<Guid<'a>> {
        if data.len() % 16 != 0 {
            return Err(malformed_error!(
                "#GUID heap size {} is not a multiple of 16",
                data.len()
            ));
        }

        Ok(Guid { data })
    }

    /// Returns the GUID at the 1-based `index`, `None` for index 0.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for indexes past the heap.
    pub fn get(&self, index: usize) -> Result<Option<uguid::Guid>> {
        if index == 0 {
            return Ok(None);
        }

        let start = (index - 1) * 16;
        let Some(bytes) = self.data.get(start..start + 16) else {
            return Err(out_of_bounds_error!());
        };

        let mut buffer = [0_u8; 16];
        buffer.copy_from_slice(bytes);
        Ok(Some(uguid::Guid::from_bytes(buffer)))
    }
}

/// Builds a `#GUID` heap.
#[derive(Debug, Default)]
pub struct GuidBuilder {
    guids: Vec<uguid::Guid>,
}

impl GuidBuilder {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        GuidBuilder { guids: Vec::new() }
    }

    /// Adds `guid` and returns its 1-based index, reusing an equal entry.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] if the heap outgrows a table index.
    pub fn add(&mut self, guid: uguid::Guid) -> Result<u32> {
        let position = match self.guids.iter().position(|existing| *existing == guid) {
            Some(position) => position,
            None => {
                self.guids.push(guid);
                self.guids.len() - 1
            }
        };

        u32::try_from(position + 1).map_err(|_| Error::NotSupported)
    }

    /// Heap size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.guids.len() * 16
    }

    /// Returns `true` if no GUID was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guids.is_empty()
    }

    /// Returns the heap.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.guids.iter().flat_map(|guid| guid.to_bytes()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crafted() {
        #[rustfmt::skip]
        let data : [u8; 32] = [
            0x8e, 0x90, 0x37, 0xd4, 0xe6, 0x65, 0x7c, 0x48, 0x97, 0x35, 0x7b, 0xdf, 0xf6, 0x99, 0xbe, 0xa5,
            0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA,
        ];

        let guids = Guid::from(&data).unwrap();

        assert_eq!(guids.get(0).unwrap(), None);
        assert_eq!(
            guids.get(1).unwrap(),
            Some(uguid::guid!("d437908e-65e6-487c-9735-7bdff699bea5"))
        );
        assert_eq!(
            guids.get(2).unwrap(),
            Some(uguid::guid!("AAAAAAAA-AAAA-AAAA-AAAA-AAAAAAAAAAAA"))
        );
        assert!(guids.get(3).is_err());
        assert!(Guid::from(&data[..15]).is_err());
    }

    #[test]
    fn builder() {
        let mvid = uguid::guid!("d437908e-65e6-487c-9735-7bdff699bea5");
        let mut builder = GuidBuilder::new();
        assert_eq!(builder.add(mvid).unwrap(), 1);
        assert_eq!(builder.add(mvid).unwrap(), 1);

        let heap = builder.finish();
        assert_eq!(heap.len(), 16);
        assert_eq!(Guid::from(&heap).unwrap().get(1).unwrap(), Some(mvid));
    }
}
