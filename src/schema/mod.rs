//! # Schema Definition
//!
//! This module provides the `Schema` struct that defines the physical
//! layout of a tuple slot. The schema pre-computes per-column payload
//! offsets for O(1) access and is immutable after construction.
//!
//! ## Schema Internals
//!
//! - `columns`: column specifications in declaration order
//! - `offsets`: pre-computed byte offset of each column within the payload
//! - `var_column_indices`: positions of variable-length columns
//! - `payload_length`: total payload size; a slot is one status byte plus
//!   this many bytes
//!
//! Variable-length columns contribute the 8-byte pool handle to the
//! payload; their actual bytes live out-of-line in the shared string pool.

use smallvec::SmallVec;

use crate::pool::StringRef;
use crate::types::ValueType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub value_type: ValueType,
    /// Declared capacity for variable-length columns, fixed size otherwise.
    pub length: u32,
    pub nullable: bool,
}

impl ColumnSpec {
    pub fn new(value_type: ValueType, length: u32, nullable: bool) -> Self {
        Self {
            value_type,
            length,
            nullable,
        }
    }

    /// A fixed-width column; the length is implied by the type.
    pub fn fixed(value_type: ValueType, nullable: bool) -> Self {
        let length = value_type.fixed_size().unwrap_or(0) as u32;
        Self {
            value_type,
            length,
            nullable,
        }
    }

    pub fn varchar(length: u32, nullable: bool) -> Self {
        Self {
            value_type: ValueType::VarChar,
            length,
            nullable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSpec>,
    offsets: Vec<usize>,
    var_column_indices: SmallVec<[u16; 4]>,
    payload_length: usize,
}

impl Schema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        let mut offsets = Vec::with_capacity(columns.len());
        let mut var_column_indices = SmallVec::new();
        let mut offset = 0;

        for (idx, col) in columns.iter().enumerate() {
            offsets.push(offset);
            match col.value_type.fixed_size() {
                Some(size) => offset += size,
                None => {
                    var_column_indices.push(idx as u16);
                    offset += StringRef::SIZE;
                }
            }
        }

        Self {
            columns,
            offsets,
            var_column_indices,
            payload_length: offset,
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> Option<&ColumnSpec> {
        self.columns.get(idx)
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Byte offset of the column within the slot payload (the status byte
    /// is not included; callers add the tuple header size).
    pub fn offset(&self, idx: usize) -> usize {
        self.offsets[idx]
    }

    pub fn var_column_count(&self) -> usize {
        self.var_column_indices.len()
    }

    pub fn var_column_indices(&self) -> &[u16] {
        &self.var_column_indices
    }

    pub fn payload_length(&self) -> usize {
        self.payload_length
    }

    pub fn is_variable(&self, idx: usize) -> bool {
        self.columns[idx].value_type.is_variable()
    }
}
