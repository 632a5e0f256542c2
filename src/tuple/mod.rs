//! # Tuple Slot Views
//!
//! A tuple slot is one status byte followed by the schema-defined column
//! payload. This module provides the borrowed views that bind a slot to
//! its schema and pool for typed access:
//!
//! - `TupleRef`: immutable view with typed column reads and wire encoding
//! - `TupleMut`: mutable view with status flag setters and column writes
//!
//! Views never own the slot; the block (or the table's temp slot) does.
//!
//! ## Status Byte (bitmask)
//!
//! ```text
//! Bit 0: ACTIVE                              - slot holds a live tuple
//! Bit 1: DIRTY                               - modified since last snapshot
//! Bit 2: PENDING_DELETE                      - delete issued, not yet visible
//! Bit 3: PENDING_DELETE_ON_UNDO_RELEASE      - delete deferred to undo release
//! Bits 4-7: reserved
//! ```
//!
//! ## In-Slot vs Wire Representation
//!
//! Fixed-width columns are stored little-endian in the slot and big-endian
//! on the wire. Variable-length columns store a `StringRef` handle in the
//! slot and serialize inline as `(int32 len, bytes)` with `-1` for NULL.

use std::borrow::Cow;

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;

use crate::encoding::{ByteReader, ByteWriter};
use crate::pool::{StringPool, StringRef};
use crate::schema::Schema;
use crate::types::{
    Value, ValueType, NULL_BIGINT, NULL_DOUBLE, NULL_INTEGER, NULL_SMALLINT, NULL_TIMESTAMP,
    NULL_TINYINT,
};

pub const TUPLE_HEADER_SIZE: usize = 1;

pub mod status {
    pub const ACTIVE: u8 = 0b0000_0001;
    pub const DIRTY: u8 = 0b0000_0010;
    pub const PENDING_DELETE: u8 = 0b0000_0100;
    pub const PENDING_DELETE_ON_UNDO_RELEASE: u8 = 0b0000_1000;
}

#[derive(Debug, Clone, Copy)]
pub struct TupleRef<'a> {
    data: &'a [u8],
    schema: &'a Schema,
    pool: &'a StringPool,
}

impl<'a> TupleRef<'a> {
    pub fn new(data: &'a [u8], schema: &'a Schema, pool: &'a StringPool) -> Self {
        debug_assert_eq!(data.len(), TUPLE_HEADER_SIZE + schema.payload_length());
        Self { data, schema, pool }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn schema(&self) -> &'a Schema {
        self.schema
    }

    pub fn status(&self) -> u8 {
        self.data[0]
    }

    pub fn is_active(&self) -> bool {
        self.status() & status::ACTIVE != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.status() & status::DIRTY != 0
    }

    pub fn is_pending_delete(&self) -> bool {
        self.status() & status::PENDING_DELETE != 0
    }

    pub fn is_pending_delete_on_undo_release(&self) -> bool {
        self.status() & status::PENDING_DELETE_ON_UNDO_RELEASE != 0
    }

    fn column_offset(&self, col_idx: usize) -> usize {
        TUPLE_HEADER_SIZE + self.schema.offset(col_idx)
    }

    /// Materializes the column as a runtime value, mapping the type's
    /// null sentinel (or the NULL pool handle) to `Value::Null`.
    pub fn value(&self, col_idx: usize) -> Result<Value<'static>> {
        let spec = self
            .schema
            .column(col_idx)
            .ok_or_else(|| eyre::eyre!("column index {} out of range", col_idx))?;
        let off = self.column_offset(col_idx);

        let value = match spec.value_type {
            ValueType::TinyInt => {
                let v = self.data[off] as i8;
                if v == NULL_TINYINT {
                    Value::Null
                } else {
                    Value::TinyInt(v)
                }
            }
            ValueType::SmallInt => {
                let v = i16::from_le_bytes(self.data[off..off + 2].try_into().unwrap());
                if v == NULL_SMALLINT {
                    Value::Null
                } else {
                    Value::SmallInt(v)
                }
            }
            ValueType::Integer => {
                let v = i32::from_le_bytes(self.data[off..off + 4].try_into().unwrap());
                if v == NULL_INTEGER {
                    Value::Null
                } else {
                    Value::Integer(v)
                }
            }
            ValueType::BigInt => {
                let v = i64::from_le_bytes(self.data[off..off + 8].try_into().unwrap());
                if v == NULL_BIGINT {
                    Value::Null
                } else {
                    Value::BigInt(v)
                }
            }
            ValueType::Double => {
                let v = f64::from_le_bytes(self.data[off..off + 8].try_into().unwrap());
                if v == NULL_DOUBLE {
                    Value::Null
                } else {
                    Value::Double(v)
                }
            }
            ValueType::Timestamp => {
                let v = i64::from_le_bytes(self.data[off..off + 8].try_into().unwrap());
                if v == NULL_TIMESTAMP {
                    Value::Null
                } else {
                    Value::Timestamp(v)
                }
            }
            ValueType::VarChar => {
                let r = StringRef::from_bytes(&self.data[off..])?;
                if r.is_null() {
                    Value::Null
                } else {
                    let text = self.pool.with_bytes(r, |b| {
                        std::str::from_utf8(b).map(|s| s.to_owned()).map_err(|e| {
                            eyre::eyre!("column {} holds invalid UTF-8: {}", col_idx, e)
                        })
                    })?;
                    Value::VarChar(Cow::Owned(text))
                }
            }
        };
        Ok(value)
    }

    /// Emits the tuple body in wire order: fixed columns big-endian,
    /// variable columns as `(int32 len, bytes)` with `-1` for NULL.
    pub fn serialize_into(&self, w: &mut ByteWriter) -> Result<()> {
        for (col_idx, spec) in self.schema.columns().iter().enumerate() {
            let off = self.column_offset(col_idx);
            match spec.value_type {
                ValueType::TinyInt => w.write_i8(self.data[off] as i8),
                ValueType::SmallInt => {
                    w.write_i16(i16::from_le_bytes(
                        self.data[off..off + 2].try_into().unwrap(),
                    ));
                }
                ValueType::Integer => {
                    w.write_i32(i32::from_le_bytes(
                        self.data[off..off + 4].try_into().unwrap(),
                    ));
                }
                ValueType::BigInt | ValueType::Timestamp => {
                    w.write_i64(i64::from_le_bytes(
                        self.data[off..off + 8].try_into().unwrap(),
                    ));
                }
                ValueType::Double => {
                    w.write_f64(f64::from_le_bytes(
                        self.data[off..off + 8].try_into().unwrap(),
                    ));
                }
                ValueType::VarChar => {
                    let r = StringRef::from_bytes(&self.data[off..])?;
                    if r.is_null() {
                        w.write_i32(-1);
                    } else {
                        w.write_i32(r.length() as i32);
                        self.pool.with_bytes(r, |b| w.write_bytes(b));
                    }
                }
            }
        }
        Ok(())
    }

    /// Column-wise value equality against another tuple, which may live
    /// in a different table or pool.
    pub fn equals(&self, other: &TupleRef<'_>) -> Result<bool> {
        if self.schema.column_count() != other.schema.column_count() {
            return Ok(false);
        }
        for col_idx in 0..self.schema.column_count() {
            if self.value(col_idx)? != other.value(col_idx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct TupleMut<'a> {
    data: &'a mut [u8],
    schema: &'a Schema,
    pool: &'a StringPool,
}

impl<'a> TupleMut<'a> {
    pub fn new(data: &'a mut [u8], schema: &'a Schema, pool: &'a StringPool) -> Self {
        debug_assert_eq!(data.len(), TUPLE_HEADER_SIZE + schema.payload_length());
        Self { data, schema, pool }
    }

    pub fn as_ref(&self) -> TupleRef<'_> {
        TupleRef::new(self.data, self.schema, self.pool)
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.data[0] |= flag;
        } else {
            self.data[0] &= !flag;
        }
    }

    pub fn set_active(&mut self, on: bool) {
        self.set_flag(status::ACTIVE, on);
    }

    pub fn set_dirty(&mut self, on: bool) {
        self.set_flag(status::DIRTY, on);
    }

    pub fn set_pending_delete(&mut self, on: bool) {
        self.set_flag(status::PENDING_DELETE, on);
    }

    pub fn set_pending_delete_on_undo_release(&mut self, on: bool) {
        self.set_flag(status::PENDING_DELETE_ON_UNDO_RELEASE, on);
    }

    /// Writes one column. Returns `(charged, released)` pool byte counts:
    /// a variable-length write charges the new payload and releases any
    /// handle the slot previously held.
    pub fn set_value(&mut self, col_idx: usize, value: &Value<'_>) -> Result<(usize, usize)> {
        let spec = self
            .schema
            .column(col_idx)
            .ok_or_else(|| eyre::eyre!("column index {} out of range", col_idx))?
            .clone();
        let off = TUPLE_HEADER_SIZE + self.schema.offset(col_idx);

        if value.is_null() {
            ensure!(
                spec.nullable,
                "column {} ({}) is not nullable",
                col_idx,
                spec.value_type.name()
            );
            return self.write_null(col_idx, off, spec.value_type);
        }

        match (value, spec.value_type) {
            (Value::TinyInt(v), ValueType::TinyInt) => self.data[off] = *v as u8,
            (Value::SmallInt(v), ValueType::SmallInt) => {
                self.data[off..off + 2].copy_from_slice(&v.to_le_bytes());
            }
            (Value::Integer(v), ValueType::Integer) => {
                self.data[off..off + 4].copy_from_slice(&v.to_le_bytes());
            }
            (Value::BigInt(v), ValueType::BigInt) => {
                self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
            (Value::Timestamp(v), ValueType::Timestamp) => {
                self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
            (Value::Double(v), ValueType::Double) => {
                self.data[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
            (Value::VarChar(s), ValueType::VarChar) => {
                let released = self.release_handle(off)?;
                let r = self.pool.insert(s.as_bytes());
                r.write_to(&mut self.data[off..])?;
                return Ok((s.len(), released));
            }
            (v, t) => bail!(
                "cannot store {:?} in column {} of type {}",
                v.value_type().map(|vt| vt.name()).unwrap_or("NULL"),
                col_idx,
                t.name()
            ),
        }
        Ok((0, 0))
    }

    fn write_null(
        &mut self,
        _col_idx: usize,
        off: usize,
        value_type: ValueType,
    ) -> Result<(usize, usize)> {
        match value_type {
            ValueType::TinyInt => self.data[off] = NULL_TINYINT as u8,
            ValueType::SmallInt => {
                self.data[off..off + 2].copy_from_slice(&NULL_SMALLINT.to_le_bytes());
            }
            ValueType::Integer => {
                self.data[off..off + 4].copy_from_slice(&NULL_INTEGER.to_le_bytes());
            }
            ValueType::BigInt => {
                self.data[off..off + 8].copy_from_slice(&NULL_BIGINT.to_le_bytes());
            }
            ValueType::Timestamp => {
                self.data[off..off + 8].copy_from_slice(&NULL_TIMESTAMP.to_le_bytes());
            }
            ValueType::Double => {
                self.data[off..off + 8].copy_from_slice(&NULL_DOUBLE.to_le_bytes());
            }
            ValueType::VarChar => {
                let released = self.release_handle(off)?;
                StringRef::null().write_to(&mut self.data[off..])?;
                return Ok((0, released));
            }
        }
        Ok((0, 0))
    }

    fn release_handle(&mut self, off: usize) -> Result<usize> {
        let old = StringRef::from_bytes(&self.data[off..])?;
        Ok(self.pool.remove(old))
    }
}

/// Releases every pool handle a slot payload holds and returns the bytes
/// released. Used when a tuple is freed and when a table is dropped.
pub fn release_var_values(data: &mut [u8], schema: &Schema, pool: &StringPool) -> Result<usize> {
    let mut released = 0;
    for &col_idx in schema.var_column_indices() {
        let off = TUPLE_HEADER_SIZE + schema.offset(col_idx as usize);
        let r = StringRef::from_bytes(&data[off..])?;
        released += pool.remove(r);
        StringRef::null().write_to(&mut data[off..])?;
    }
    Ok(released)
}

/// Reads one wire-format tuple body into a zeroed slot payload. Returns
/// the pool bytes charged for variable-length columns. On error, any
/// handles written so far are released and the payload is re-zeroed.
pub fn deserialize_into(
    data: &mut [u8],
    schema: &Schema,
    pool: &StringPool,
    r: &mut ByteReader<'_>,
) -> Result<usize> {
    let mut charged = 0;
    let mut written: SmallVec<[StringRef; 4]> = SmallVec::new();

    let result = (|| -> Result<usize> {
        for (col_idx, spec) in schema.columns().iter().enumerate() {
            let off = TUPLE_HEADER_SIZE + schema.offset(col_idx);
            match spec.value_type {
                ValueType::TinyInt => data[off] = r.read_i8("tinyint column")? as u8,
                ValueType::SmallInt => {
                    let v = r.read_i16("smallint column")?;
                    data[off..off + 2].copy_from_slice(&v.to_le_bytes());
                }
                ValueType::Integer => {
                    let v = r.read_i32("integer column")?;
                    data[off..off + 4].copy_from_slice(&v.to_le_bytes());
                }
                ValueType::BigInt | ValueType::Timestamp => {
                    let v = r.read_i64("bigint column")?;
                    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
                }
                ValueType::Double => {
                    let v = r.read_f64("double column")?;
                    data[off..off + 8].copy_from_slice(&v.to_le_bytes());
                }
                ValueType::VarChar => {
                    let len = r.read_i32("varchar length")?;
                    if len < 0 {
                        StringRef::null().write_to(&mut data[off..])?;
                    } else {
                        let bytes = r.read_bytes("varchar payload", len as usize)?;
                        if std::str::from_utf8(bytes).is_err() {
                            return Err(crate::error::TableError::deserialization(format!(
                                "varchar column {} holds invalid UTF-8",
                                col_idx
                            )));
                        }
                        let handle = pool.insert(bytes);
                        handle.write_to(&mut data[off..])?;
                        written.push(handle);
                        charged += len as usize;
                    }
                }
            }
        }
        Ok(charged)
    })();

    if result.is_err() {
        for handle in written {
            pool.remove(handle);
        }
        data.fill(0);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnSpec;

    fn test_schema() -> Schema {
        Schema::new(vec![
            ColumnSpec::fixed(ValueType::Integer, true),
            ColumnSpec::varchar(32, true),
            ColumnSpec::fixed(ValueType::Double, true),
        ])
    }

    fn slot_for(schema: &Schema) -> Vec<u8> {
        vec![0u8; TUPLE_HEADER_SIZE + schema.payload_length()]
    }

    #[test]
    fn status_flags_set_and_clear() {
        let schema = Schema::new(vec![]);
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);

        tuple.set_active(true);
        tuple.set_dirty(true);
        assert!(tuple.as_ref().is_active());
        assert!(tuple.as_ref().is_dirty());
        assert!(!tuple.as_ref().is_pending_delete());

        tuple.set_dirty(false);
        tuple.set_pending_delete(true);
        tuple.set_pending_delete_on_undo_release(true);
        assert!(!tuple.as_ref().is_dirty());
        assert!(tuple.as_ref().is_pending_delete());
        assert!(tuple.as_ref().is_pending_delete_on_undo_release());
    }

    #[test]
    fn set_and_read_values_roundtrip() {
        let schema = test_schema();
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);

        tuple.set_value(0, &Value::Integer(42)).unwrap();
        let (charged, released) = tuple.set_value(1, &Value::varchar("storage")).unwrap();
        tuple.set_value(2, &Value::Double(2.5)).unwrap();

        assert_eq!(charged, 7);
        assert_eq!(released, 0);
        let view = tuple.as_ref();
        assert_eq!(view.value(0).unwrap(), Value::Integer(42));
        assert_eq!(view.value(1).unwrap(), Value::varchar("storage"));
        assert_eq!(view.value(2).unwrap(), Value::Double(2.5));
    }

    #[test]
    fn nulls_roundtrip_through_sentinels() {
        let schema = test_schema();
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);

        tuple.set_value(0, &Value::Null).unwrap();
        tuple.set_value(1, &Value::Null).unwrap();
        tuple.set_value(2, &Value::Null).unwrap();

        let view = tuple.as_ref();
        for col in 0..3 {
            assert_eq!(view.value(col).unwrap(), Value::Null);
        }
    }

    #[test]
    fn null_rejected_on_non_nullable_column() {
        let schema = Schema::new(vec![ColumnSpec::fixed(ValueType::BigInt, false)]);
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);

        let err = tuple.set_value(0, &Value::Null).unwrap_err();

        assert!(err.to_string().contains("not nullable"));
    }

    #[test]
    fn type_mismatch_rejected() {
        let schema = Schema::new(vec![ColumnSpec::fixed(ValueType::Integer, false)]);
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);

        let err = tuple.set_value(0, &Value::varchar("nope")).unwrap_err();

        assert!(err.to_string().contains("cannot store"));
    }

    #[test]
    fn overwriting_varchar_releases_old_handle() {
        let schema = Schema::new(vec![ColumnSpec::varchar(32, true)]);
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);

        tuple.set_value(0, &Value::varchar("first")).unwrap();
        let (charged, released) = tuple.set_value(0, &Value::varchar("second")).unwrap();

        assert_eq!(charged, 6);
        assert_eq!(released, 5);
        assert_eq!(pool.live_entries(), 1);
        assert_eq!(pool.total_bytes(), 6);
    }

    #[test]
    fn serialize_deserialize_tuple_body() {
        let schema = test_schema();
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);
        tuple.set_value(0, &Value::Integer(-7)).unwrap();
        tuple.set_value(1, &Value::varchar("wire")).unwrap();
        tuple.set_value(2, &Value::Null).unwrap();

        let mut w = ByteWriter::new();
        tuple.as_ref().serialize_into(&mut w).unwrap();

        // int32 + (int32 len + 4 bytes) + double
        assert_eq!(w.as_slice().len(), 4 + 4 + 4 + 8);

        let mut restored = slot_for(&schema);
        let mut r = ByteReader::new(w.as_slice());
        let charged = deserialize_into(&mut restored, &schema, &pool, &mut r).unwrap();

        assert_eq!(charged, 4);
        assert_eq!(r.remaining(), 0);
        let view = TupleRef::new(&restored, &schema, &pool);
        assert_eq!(view.value(0).unwrap(), Value::Integer(-7));
        assert_eq!(view.value(1).unwrap(), Value::varchar("wire"));
        assert_eq!(view.value(2).unwrap(), Value::Null);
    }

    #[test]
    fn deserialize_truncated_releases_partial_handles() {
        let schema = Schema::new(vec![
            ColumnSpec::varchar(16, true),
            ColumnSpec::fixed(ValueType::BigInt, false),
        ]);
        let pool = StringPool::new();
        let mut w = ByteWriter::new();
        w.write_i32(3);
        w.write_bytes(b"abc");
        // bigint column missing entirely

        let mut data = slot_for(&schema);
        let mut r = ByteReader::new(w.as_slice());
        let err = deserialize_into(&mut data, &schema, &pool, &mut r).unwrap_err();

        assert!(err.to_string().contains("unexpected end of buffer"));
        assert_eq!(pool.live_entries(), 0);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn tuple_equality_compares_values() {
        let schema = test_schema();
        let pool = StringPool::new();
        let mut a = slot_for(&schema);
        let mut b = slot_for(&schema);

        for data in [&mut a, &mut b] {
            let mut t = TupleMut::new(data, &schema, &pool);
            t.set_value(0, &Value::Integer(1)).unwrap();
            t.set_value(1, &Value::varchar("same")).unwrap();
            t.set_value(2, &Value::Null).unwrap();
        }

        let va = TupleRef::new(&a, &schema, &pool);
        let vb = TupleRef::new(&b, &schema, &pool);
        assert!(va.equals(&vb).unwrap());

        let mut t = TupleMut::new(&mut b, &schema, &pool);
        t.set_value(0, &Value::Integer(2)).unwrap();
        let vb = TupleRef::new(&b, &schema, &pool);
        assert!(!va.equals(&vb).unwrap());
    }

    #[test]
    fn release_var_values_clears_handles() {
        let schema = test_schema();
        let pool = StringPool::new();
        let mut data = slot_for(&schema);
        let mut tuple = TupleMut::new(&mut data, &schema, &pool);
        tuple.set_value(1, &Value::varchar("held")).unwrap();
        assert_eq!(pool.live_entries(), 1);

        let released = release_var_values(&mut data, &schema, &pool).unwrap();

        assert_eq!(released, 4);
        assert_eq!(pool.live_entries(), 0);
        let view = TupleRef::new(&data, &schema, &pool);
        assert_eq!(view.value(1).unwrap(), Value::Null);
    }
}
