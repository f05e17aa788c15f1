//! Reading and writing the `#~` stream.
//!
//! # Reference
//! - [ECMA-335 II.24.2.6](https://ecma-international.org/wp-content/uploads/ECMA-335_6th_edition_june_2012.pdf)

use strum::IntoEnumIterator;

use super::{
    raw::{Cell, RawRow, RawTable},
    schema::{columns, Column, SORTED_MASK},
    tableinfo::{
        TableInfo, HEAP_LARGE_BLOB, HEAP_LARGE_GUID, HEAP_LARGE_STRINGS, TABLE_COUNT,
    },
};
use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::{
        streams::{align_heap, Blob, BlobBuilder, Guid, GuidBuilder, Strings, StringsBuilder},
        token::{TableId, Token},
    },
    Error, Result,
};

/// `HeapSizes` flag announcing an extra 4 byte value after the row counts.
const HEAP_EXTRA_DATA: u8 = 0x40;

/// Largest row count a token can address.
const MAX_ROWS: u32 = 0x00FF_FFFF;

/// The heaps the rows of a `#~` stream refer to.
pub struct Heaps<'a> {
    /// `#Strings`
    pub strings: Strings<'a>,
    /// `#Blob`
    pub blob: Blob<'a>,
    /// `#GUID`
    pub guid: Guid<'a>,
}

/// The decoded `#~` stream.
#[derive(Debug, Clone)]
pub struct TablesStream {
    /// Major schema version
    pub major_version: u8,
    /// Minor schema version
    pub minor_version: u8,
    /// Present tables in id order
    pub tables: Vec<RawTable>,
}

impl TablesStream {
    /// Decodes a `#~` stream.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for truncated data, [`crate::Error::Malformed`] for
    /// damaged rows and [`crate::Error::NotSupported`] for tables outside ECMA-335 II.22.
    pub fn read(data: &[u8], heaps: &Heaps<'_>) -> Result<TablesStream> {
        let mut parser = Parser::new(data);

        let _reserved = parser.read_le::<u32>()?;
        let major_version = parser.read_le::<u8>()?;
        let minor_version = parser.read_le::<u8>()?;
        let heap_sizes = parser.read_le::<u8>()?;
        let _reserved = parser.read_le::<u8>()?;
        let valid = parser.read_le::<u64>()?;
        let _sorted = parser.read_le::<u64>()?;

        if major_version != 2 && major_version != 1 {
            return Err(Error::NotSupported);
        }

        let mut row_counts = [0_u32; TABLE_COUNT];
        for (bit, count) in row_counts.iter_mut().enumerate() {
            if valid & (1 << bit) == 0 {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let known = TableId::from_u8(bit as u8).is_some_and(TableId::is_table);
            if !known {
                log::warn!("#~ stream announces unknown table 0x{bit:02x}");
                return Err(Error::NotSupported);
            }

            *count = parser.read_le::<u32>()?;
            if *count > MAX_ROWS {
                return Err(malformed_error!(
                    "Table 0x{:02x} has too many rows - {}",
                    bit,
                    count
                ));
            }
        }
        if heap_sizes & HEAP_EXTRA_DATA != 0 {
            let _extra = parser.read_le::<u32>()?;
        }

        let info = TableInfo::new(&row_counts, heap_sizes);
        let mut tables = Vec::new();
        for table in TableId::iter().filter(|table| table.is_table()) {
            let rows = info.rows(table);
            if rows == 0 {
                continue;
            }

            let mut raw = RawTable::new(table);
            raw.rows.reserve(rows as usize);
            for _ in 0..rows {
                raw.rows.push(read_row(&mut parser, table, &info, heaps)?);
            }
            tables.push(raw);
        }

        Ok(TablesStream {
            major_version,
            minor_version,
            tables,
        })
    }

    /// Returns the rows of `table`, empty if absent.
    #[must_use]
    pub fn rows(&self, table: TableId) -> &[RawRow] {
        self.tables
            .iter()
            .find(|raw| raw.id == table)
            .map_or(&[], |raw| raw.rows.as_slice())
    }

    /// Removes and returns `table`, empty if absent.
    pub fn take(&mut self, table: TableId) -> Vec<RawRow> {
        match self.tables.iter().position(|raw| raw.id == table) {
            Some(position) => self.tables.remove(position).rows,
            None => Vec::new(),
        }
    }

    /// Encodes `tables` as a version 2.0 `#~` stream, adding their heap values to the builders.
    ///
    /// Rows are written as given; callers order sorted tables beforehand.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a cell does not fit its column.
    pub fn write(
        tables: &[RawTable],
        strings: &mut StringsBuilder,
        blob: &mut BlobBuilder,
        guid: &mut GuidBuilder,
    ) -> Result<Vec<u8>> {
        enum Slot {
            Value(u32),
            Token(Token),
        }

        let mut row_counts = [0_u32; TABLE_COUNT];
        let mut resolved: Vec<(TableId, Vec<Vec<Slot>>)> = Vec::new();
        let mut ordered: Vec<&RawTable> = tables.iter().filter(|raw| !raw.is_empty()).collect();
        ordered.sort_by_key(|raw| raw.id);

        for raw in ordered {
            if !raw.id.is_table() {
                return Err(malformed_error!("{} is not a metadata table", raw.id));
            }
            if resolved.iter().any(|(id, _)| *id == raw.id) {
                return Err(malformed_error!("Table {} is present twice", raw.id));
            }

            let schema = columns(raw.id);
            let mut rows = Vec::with_capacity(raw.rows.len());
            for row in &raw.rows {
                if row.cells.len() != schema.len() {
                    return Err(malformed_error!(
                        "{} row has {} cells, expected {}",
                        raw.id,
                        row.cells.len(),
                        schema.len()
                    ));
                }

                let mut slots = Vec::with_capacity(schema.len());
                for (cell, column) in row.cells.iter().zip(schema.iter()) {
                    slots.push(match (cell, column) {
                        (Cell::Value(value), Column::U16 | Column::U32) => Slot::Value(*value),
                        (Cell::String(value), Column::Str) => Slot::Value(strings.add(value)?),
                        (Cell::Blob(value), Column::Blob) => Slot::Value(blob.add(value)?),
                        (Cell::Guid(value), Column::Guid) => Slot::Value(match value {
                            Some(value) => guid.add(*value)?,
                            None => 0,
                        }),
                        (Cell::Token(token), Column::Index(_) | Column::Coded(_)) => {
                            Slot::Token(*token)
                        }
                        (cell, column) => {
                            return Err(malformed_error!(
                                "{} cell {:?} does not fit column {:?}",
                                raw.id,
                                cell,
                                column
                            ))
                        }
                    });
                }
                rows.push(slots);
            }

            row_counts[raw.id as usize] = u32::try_from(rows.len())
                .ok()
                .filter(|count| *count <= MAX_ROWS)
                .ok_or_else(|| malformed_error!("Table {} has too many rows", raw.id))?;
            resolved.push((raw.id, rows));
        }

        let mut heap_sizes = 0;
        if strings.len() > 0xFFFF {
            heap_sizes |= HEAP_LARGE_STRINGS;
        }
        if guid.len() / 16 > 0xFFFF {
            heap_sizes |= HEAP_LARGE_GUID;
        }
        if blob.len() > 0xFFFF {
            heap_sizes |= HEAP_LARGE_BLOB;
        }
        let info = TableInfo::new(&row_counts, heap_sizes);

        let valid = resolved
            .iter()
            .fold(0_u64, |mask, (id, _)| mask | (1 << *id as u8));

        let mut writer = Writer::new();
        writer.write_le(0_u32);
        writer.write_le(2_u8);
        writer.write_le(0_u8);
        writer.write_le(heap_sizes);
        writer.write_le(1_u8);
        writer.write_le(valid);
        writer.write_le(SORTED_MASK);
        for (id, _) in &resolved {
            writer.write_le(row_counts[*id as usize]);
        }

        for (id, rows) in &resolved {
            let schema = columns(*id);
            for row in rows {
                for (slot, column) in row.iter().zip(schema.iter()) {
                    let value = match (slot, column) {
                        (Slot::Token(token), Column::Index(table)) => {
                            if !token.is_null() && !token.is_table(*table) {
                                return Err(malformed_error!(
                                    "{} index expects {}, found {}",
                                    id,
                                    table,
                                    token
                                ));
                            }
                            token.row()
                        }
                        (Slot::Token(token), Column::Coded(coded)) => coded.encode(*token)?,
                        (Slot::Value(value), _) => *value,
                        (Slot::Token(token), _) => {
                            return Err(malformed_error!("Unexpected token {}", token))
                        }
                    };
                    write_column(&mut writer, value, info.column_bytes(*column))?;
                }
            }
        }

        let mut data = writer.into_vec();
        align_heap(&mut data);
        Ok(data)
    }
}

fn write_column(writer: &mut Writer, value: u32, bytes: usize) -> Result<()> {
    if bytes == 2 {
        let narrow = u16::try_from(value)
            .map_err(|_| malformed_error!("Value 0x{:x} does not fit a 2 byte column", value))?;
        writer.write_le(narrow);
    } else {
        writer.write_le(value);
    }
    Ok(())
}

fn read_column(parser: &mut Parser<'_>, bytes: usize) -> Result<u32> {
    if bytes == 2 {
        Ok(u32::from(parser.read_le::<u16>()?))
    } else {
        parser.read_le::<u32>()
    }
}

fn read_row(
    parser: &mut Parser<'_>,
    table: TableId,
    info: &TableInfo,
    heaps: &Heaps<'_>,
) -> Result<RawRow> {
    let schema = columns(table);
    let mut cells = Vec::with_capacity(schema.len());

    for column in schema {
        let value = read_column(parser, info.column_bytes(*column))?;
        cells.push(match column {
            Column::U16 | Column::U32 => Cell::Value(value),
            Column::Str => Cell::String(heaps.strings.get(value as usize)?.to_string()),
            Column::Blob => Cell::Blob(heaps.blob.get(value as usize)?.to_vec()),
            Column::Guid => Cell::Guid(heaps.guid.get(value as usize)?),
            Column::Index(target) => Cell::Token(Token::from_parts(*target, value)),
            Column::Coded(coded) => Cell::Token(coded.decode(value)?),
        });
    }

    Ok(RawRow { cells })
}
