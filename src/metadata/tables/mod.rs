//! The compressed metadata tables (`#~` stream).
//!
//! Table rows are read into [`RawRow`]s whose heap references and indexes are already resolved.
//! The module loader interprets the tables it models and keeps every other table as a
//! [`RawTable`]; the writer turns both back into rows and encodes them with widths computed by
//! [`TableInfo`].
//!
//! # Reference
//! - [ECMA-335 II.22 and II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

mod codedindex;
mod raw;
mod schema;
mod stream;
mod tableinfo;

pub use codedindex::CodedIndexType;
pub use raw::{Cell, RawRow, RawTable};
pub use schema::{columns, sort_key, Column, SORTED_MASK, SORTED_TABLES};
pub use stream::{Heaps, TablesStream};
pub use tableinfo::{TableInfo, TableRowInfo, TABLE_COUNT};
