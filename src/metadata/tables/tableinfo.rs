//! Column widths of the `#~` stream.
//!
//! Whether an index column takes 2 or 4 bytes depends on the row count of the tables it can
//! reference and on the size of the heaps. [`TableInfo`] computes all widths once per stream.

use strum::{EnumCount, IntoEnumIterator};

use super::{codedindex::CodedIndexType, schema::Column};
use crate::metadata::token::TableId;

/// Number of table slots in the `#~` stream.
pub const TABLE_COUNT: usize = 64;

/// Heap size flag for 4 byte `#Strings` indexes.
pub const HEAP_LARGE_STRINGS: u8 = 0x01;
/// Heap size flag for 4 byte `#GUID` indexes.
pub const HEAP_LARGE_GUID: u8 = 0x02;
/// Heap size flag for 4 byte `#Blob` indexes.
pub const HEAP_LARGE_BLOB: u8 = 0x04;

/// Row count of one table and the bits needed to address it.
#[derive(Clone, Copy, Default, PartialEq, Debug)]
pub struct TableRowInfo {
    /// Number of rows
    pub rows: u32,
    /// Bits needed to store the largest row number
    pub bits: u8,
}

impl TableRowInfo {
    /// Creates the entry for a table with `rows` rows.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(rows: u32) -> Self {
        let bits = if rows == 0 {
            1
        } else {
            (32 - rows.leading_zeros()) as u8
        };

        Self { rows, bits }
    }
}

/// Row counts, heap widths and derived column sizes.
#[derive(Clone, Debug)]
pub struct TableInfo {
    rows: [TableRowInfo; TABLE_COUNT],
    coded_indexes: [u8; CodedIndexType::COUNT],
    heap_sizes: u8,
}

impl TableInfo {
    /// Creates the sizes for the given row counts and `HeapSizes` flags.
    #[must_use]
    pub fn new(row_counts: &[u32; TABLE_COUNT], heap_sizes: u8) -> Self {
        let mut info = TableInfo {
            rows: [TableRowInfo::default(); TABLE_COUNT],
            coded_indexes: [0; CodedIndexType::COUNT],
            heap_sizes,
        };

        for (slot, rows) in info.rows.iter_mut().zip(row_counts.iter()) {
            *slot = TableRowInfo::new(*rows);
        }

        for coded_index in CodedIndexType::iter() {
            let max_bits = coded_index
                .tables()
                .map(|table| info.rows[table as usize].bits)
                .max()
                .unwrap_or(1);
            info.coded_indexes[coded_index as usize] = max_bits + coded_index.tag_bits();
        }

        info
    }

    /// Returns the row count of `table`.
    #[must_use]
    pub fn rows(&self, table: TableId) -> u32 {
        self.rows
            .get(table as usize)
            .map_or(0, |row_info| row_info.rows)
    }

    /// Returns the `HeapSizes` flags.
    #[must_use]
    pub fn heap_sizes(&self) -> u8 {
        self.heap_sizes
    }

    fn heap_bytes(&self, flag: u8) -> usize {
        if self.heap_sizes & flag == flag {
            4
        } else {
            2
        }
    }

    /// Width of a simple index into `table`.
    #[must_use]
    pub fn table_index_bytes(&self, table: TableId) -> usize {
        if self.rows[table as usize].bits > 16 {
            4
        } else {
            2
        }
    }

    /// Width of a coded index.
    #[must_use]
    pub fn coded_index_bytes(&self, coded_index: CodedIndexType) -> usize {
        if self.coded_indexes[coded_index as usize] > 16 {
            4
        } else {
            2
        }
    }

    /// Width of one column.
    #[must_use]
    pub fn column_bytes(&self, column: Column) -> usize {
        match column {
            Column::U16 => 2,
            Column::U32 => 4,
            Column::Str => self.heap_bytes(HEAP_LARGE_STRINGS),
            Column::Guid => self.heap_bytes(HEAP_LARGE_GUID),
            Column::Blob => self.heap_bytes(HEAP_LARGE_BLOB),
            Column::Index(table) => self.table_index_bytes(table),
            Column::Coded(coded_index) => self.coded_index_bytes(coded_index),
        }
    }

    /// Width of one row of `table`.
    #[must_use]
    pub fn row_bytes(&self, table: TableId) -> usize {
        super::schema::columns(table)
            .iter()
            .map(|column| self.column_bytes(*column))
            .sum()
    }
}
