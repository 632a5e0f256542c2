//! # Table Wire Format
//!
//! A table serializes as (all integers big-endian, every length prefix
//! non-inclusive of its own four bytes):
//!
//! ```text
//! [int32 totalSize] [column header] [int32 tupleCount] [tuple ...]
//! ```
//!
//! The column header:
//!
//! ```text
//! [int32 headerSize] [int8 status = -128] [int16 columnCount]
//! [int8 x columnCount  column types]
//! [(int32 len, bytes)  x columnCount  column names]
//! ```
//!
//! Column names are ASCII in the header; tuple payloads may carry UTF-8.
//! The header bytes are built once per table and cached for the life of
//! the schema (size and bytes cached together, never invalidated).
//!
//! Loading validates the incoming column header against the table's
//! schema before allocating anything, so a mismatch leaves the target
//! untouched. Each accepted row is allocated through the normal slot
//! path, flagged active/clean, and handed to the index observer.

use std::sync::Arc;

use eyre::Result;

use crate::block::SlotAddr;
use crate::encoding::{ByteReader, ByteWriter};
use crate::error::TableError;
use crate::tuple::{self, status, TupleRef};
use crate::types::ValueType;

use super::Table;

/// Fixed status code carried in the serialized column header.
pub const COLUMN_HEADER_STATUS: i8 = -128;

fn columns_description(types: &[u8], names: &[String]) -> String {
    let mut out = String::new();
    for (i, (t, n)) in types.iter().zip(names).enumerate() {
        let type_name = ValueType::from_byte(*t)
            .map(|vt| vt.name().to_owned())
            .unwrap_or_else(|| format!("UNKNOWN({})", t));
        out.push_str(&format!("column {}: {}, type = {}\n", i, n, type_name));
    }
    out
}

impl Table {
    fn schema_columns_description(&self) -> String {
        let types: Vec<u8> = self
            .schema
            .columns()
            .iter()
            .map(|c| c.value_type as u8)
            .collect();
        columns_description(&types, &self.column_names)
    }

    /// Appends the serialized column header, building and caching it on
    /// first use.
    pub fn serialize_column_header(&mut self, w: &mut ByteWriter) {
        assert!(self.initialized, "table not initialized");
        if self.column_header_cache.is_none() {
            let mut hw = ByteWriter::new();
            let start = hw.position();
            hw.write_i32(-1);
            hw.write_i8(COLUMN_HEADER_STATUS);
            hw.write_i16(self.schema.column_count() as i16);
            for spec in self.schema.columns() {
                hw.write_i8(spec.value_type as u8 as i8);
            }
            for name in &self.column_names {
                debug_assert!(name.is_ascii(), "column names are ASCII in the header");
                hw.write_i32(name.len() as i32);
                hw.write_bytes(name.as_bytes());
            }
            let size = hw.position() - start;
            hw.patch_i32(start, (size - 4) as i32);
            self.column_header_cache = Some(hw.into_inner().into_boxed_slice());
        }
        w.write_bytes(
            self.column_header_cache
                .as_deref()
                .expect("column header cache just built"),
        );
    }

    /// Serializes the whole table: size prefix, column header, tuple
    /// count, then every active tuple in scan order.
    pub fn serialize_to(&mut self, w: &mut ByteWriter) -> Result<()> {
        let pos = w.position();
        w.write_i32(-1);
        self.serialize_column_header(w);
        w.write_i32(self.tuple_count as i32);

        let mut written = 0u64;
        for addr in self.scan_active() {
            let tuple = self.tuple_at(addr).expect("active slot vanished mid-scan");
            tuple.serialize_into(w)?;
            written += 1;
        }
        debug_assert_eq!(written, self.tuple_count, "scan missed active tuples");

        let total = (w.position() - pos - 4) as i32;
        w.patch_i32(pos, total);
        Ok(())
    }

    /// Serializes only the listed tuples with the same framing. Used for
    /// error-reporting payloads.
    pub fn serialize_tuples(&mut self, addrs: &[SlotAddr], w: &mut ByteWriter) -> Result<()> {
        let pos = w.position();
        w.write_i32(-1);
        self.serialize_column_header(w);
        w.write_i32(addrs.len() as i32);
        for &addr in addrs {
            let tuple = self
                .tuple_at(addr)
                .ok_or_else(|| eyre::eyre!("no active tuple at {:?}", addr))?;
            tuple.serialize_into(w)?;
        }
        let total = (w.position() - pos - 4) as i32;
        w.patch_i32(pos, total);
        Ok(())
    }

    /// A guaranteed over-estimate of `serialize_to` output: column header
    /// bound plus per-tuple slot footprint, variable-length framing, and
    /// the out-of-line bytes.
    pub fn approximate_serialized_size(&self) -> usize {
        let header = 4 // total size prefix
            + 4 // header size prefix
            + 1 // status
            + 2 // column count
            + self.schema.column_count() // type bytes
            + self
                .column_names
                .iter()
                .map(|n| 4 + n.len())
                .sum::<usize>()
            + 4; // tuple count
        header
            + self.tuple_count as usize
                * (self.tuple_length + self.schema.var_column_count() * 4)
            + self.non_inlined_memory_size
    }

    /// Reads a column header, validates it against the schema, then loads
    /// the rows that follow. A mismatch surfaces before any allocation.
    pub fn load_tuples_from(&mut self, allow_export: bool, r: &mut ByteReader<'_>) -> Result<()> {
        assert!(self.initialized, "table not initialized");
        let _header_size = r.read_i32("column header size")?;
        let _status = r.read_i8("column header status")?;
        let colcount = r.read_i16("column count")?;
        if colcount < 0 {
            return Err(TableError::deserialization(format!(
                "negative column count {}",
                colcount
            )));
        }

        let mut types = Vec::with_capacity(colcount as usize);
        for _ in 0..colcount {
            types.push(r.read_i8("column type")? as u8);
        }
        let mut names = Vec::with_capacity(colcount as usize);
        for i in 0..colcount {
            let len = r.read_i32("column name length")?;
            if len < 0 {
                return Err(TableError::deserialization(format!(
                    "negative length {} for column name {}",
                    len, i
                )));
            }
            let bytes = r.read_bytes("column name", len as usize)?;
            let name = std::str::from_utf8(bytes).map_err(|e| {
                TableError::deserialization(format!("column name {} is not valid UTF-8: {}", i, e))
            })?;
            names.push(name.to_owned());
        }

        if colcount as usize != self.schema.column_count() {
            return Err(TableError::schema_mismatch(format!(
                "Column count mismatch. Expecting {}, but {} given\n\
                 Expecting the following columns:\n{}\
                 The following columns are given:\n{}",
                self.schema.column_count(),
                colcount,
                self.schema_columns_description(),
                columns_description(&types, &names),
            )));
        }
        for (i, (&code, spec)) in types.iter().zip(self.schema.columns()).enumerate() {
            if ValueType::from_byte(code) != Some(spec.value_type) {
                return Err(TableError::schema_mismatch(format!(
                    "Column type mismatch at column {}\n\
                     Expecting the following columns:\n{}\
                     The following columns are given:\n{}",
                    i,
                    self.schema_columns_description(),
                    columns_description(&types, &names),
                )));
            }
        }

        self.load_tuples_from_no_header(allow_export, r)
    }

    /// Loads rows using the table's own schema, with no header parse.
    pub fn load_tuples_from_no_header(
        &mut self,
        allow_export: bool,
        r: &mut ByteReader<'_>,
    ) -> Result<()> {
        assert!(self.initialized, "table not initialized");
        let count = r.read_i32("tuple count")?;
        if count < 0 {
            return Err(TableError::deserialization(format!(
                "negative tuple count {}",
                count
            )));
        }

        let schema = Arc::clone(&self.schema);
        let pool = Arc::clone(&self.pool);
        for _ in 0..count {
            let addr = self.next_free_slot()?;
            let deserialized = {
                let block = self
                    .blocks
                    .get_mut(&addr.block)
                    .expect("allocated block missing");
                let slot = block.slot_mut(addr.slot);
                // active, not dirty, no pending delete in either form
                slot[0] = status::ACTIVE;
                tuple::deserialize_into(slot, &schema, &pool, r)
            };
            match deserialized {
                Ok(charged) => self.non_inlined_memory_size += charged,
                Err(e) => {
                    // roll the allocation back so the table stays consistent
                    self.release_slot_bookkeeping(addr);
                    return Err(e);
                }
            }
            let block = self
                .blocks
                .get(&addr.block)
                .expect("allocated block missing");
            let loaded = TupleRef::new(block.slot(addr.slot), &schema, &pool);
            self.observer.on_loaded_tuple(allow_export, &loaded);
        }
        Ok(())
    }
}
