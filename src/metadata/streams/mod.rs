//! Metadata streams.
//!
//! The metadata section of a module is a small directory ([`crate::metadata::root::Root`])
//! followed by five streams:
//!
//! - `#~` - the compressed tables, see [`crate::metadata::tables`]
//! - `#Strings` - NUL-terminated UTF-8 identifiers, read through [`Strings`]
//! - `#US` - length-prefixed UTF-16 literals used by `ldstr`, kept whole as [`UserStringHeap`]
//! - `#GUID` - 16 byte GUIDs addressed by 1-based index, read through [`Guid`]
//! - `#Blob` - length-prefixed signatures and attribute values, read through [`Blob`]
//!
//! The readers borrow the image. The builders ([`StringsBuilder`], [`BlobBuilder`],
//! [`GuidBuilder`]) deduplicate while a module is written and produce 4-byte aligned heaps.
//!
//! # Reference
//! - [ECMA-335 II.24.2](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

mod blob;
mod guid;
mod streamheader;
mod strings;
mod userstrings;

pub use blob::{Blob, BlobBuilder};
pub use guid::{Guid, GuidBuilder};
pub use streamheader::StreamHeader;
pub use strings::{Strings, StringsBuilder};
pub use userstrings::UserStringHeap;

/// Pads `data` with zero bytes to a multiple of four.
pub(crate) fn align_heap(data: &mut Vec<u8>) {
    while data.len() % 4 != 0 {
        data.push(0);
    }
}
