//! # Shared String Pool
//!
//! Variable-length column values are stored out-of-line in a pool shared
//! across tables. The tuple slot holds an 8-byte `StringRef` handle; the
//! pool owns the bytes and reports per-allocation sizes so each table can
//! account its `non_inlined_memory_size` charge.
//!
//! ## Handle Layout (8 bytes, little-endian, unaligned)
//!
//! ```text
//! +----------------+----------------+
//! | index (4 bytes)| length (4 bytes)|
//! +----------------+----------------+
//! ```
//!
//! Handle index `0` is the NULL handle, so a zeroed slot reads back as a
//! NULL value without initialization. Live handles are the slab position
//! plus one.
//!
//! ## Zero-Copy Access
//!
//! `StringRef` uses `zerocopy` for safe transmutation from slot bytes at
//! arbitrary (unaligned) payload offsets, the same pattern the block and
//! page headers use elsewhere.
//!
//! ## Thread Safety
//!
//! The pool is shared as `Arc<StringPool>` and internally synchronized
//! with a `parking_lot::Mutex`. Access is closure-scoped (`with_bytes`)
//! rather than guard-returning so readers cannot hold the lock across
//! unrelated pool calls. The pool must outlive every table that holds
//! handles into it.

use eyre::{ensure, Result};
use parking_lot::Mutex;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[repr(C)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
pub struct StringRef {
    index: U32<LittleEndian>,
    length: U32<LittleEndian>,
}

impl StringRef {
    pub const SIZE: usize = 8;

    pub fn null() -> Self {
        Self {
            index: U32::new(0),
            length: U32::new(0),
        }
    }

    pub fn is_null(&self) -> bool {
        self.index.get() == 0
    }

    /// Byte length of the referenced value.
    pub fn length(&self) -> u32 {
        self.length.get()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() >= Self::SIZE,
            "buffer too small for StringRef: {} < {}",
            data.len(),
            Self::SIZE
        );

        Self::read_from_bytes(&data[..Self::SIZE])
            .map_err(|e| eyre::eyre!("failed to read StringRef: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= Self::SIZE,
            "buffer too small for StringRef: {} < {}",
            data.len(),
            Self::SIZE
        );

        data[..Self::SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    fn slab_index(&self) -> usize {
        debug_assert!(!self.is_null());
        self.index.get() as usize - 1
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    entries: Vec<Option<Box<[u8]>>>,
    free: Vec<u32>,
    total_bytes: usize,
}

#[derive(Debug, Default)]
pub struct StringPool {
    inner: Mutex<PoolInner>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a copy of `data` and returns its handle. The caller is
    /// charged `data.len()` bytes until `remove`.
    pub fn insert(&self, data: &[u8]) -> StringRef {
        let mut inner = self.inner.lock();
        let slab_index = match inner.free.pop() {
            Some(idx) => {
                inner.entries[idx as usize] = Some(data.into());
                idx as usize
            }
            None => {
                inner.entries.push(Some(data.into()));
                inner.entries.len() - 1
            }
        };
        inner.total_bytes += data.len();
        StringRef {
            index: U32::new(slab_index as u32 + 1),
            length: U32::new(data.len() as u32),
        }
    }

    /// Frees the referenced value and returns the bytes released. A NULL
    /// handle releases nothing.
    pub fn remove(&self, r: StringRef) -> usize {
        if r.is_null() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let slab_index = r.slab_index();
        let entry = inner.entries[slab_index]
            .take()
            .expect("string pool handle already freed");
        inner.free.push(slab_index as u32);
        inner.total_bytes -= entry.len();
        entry.len()
    }

    /// Runs `f` over the referenced bytes under the pool lock. `f` must
    /// not call back into the same pool.
    pub fn with_bytes<T>(&self, r: StringRef, f: impl FnOnce(&[u8]) -> T) -> T {
        assert!(!r.is_null(), "with_bytes on a NULL string handle");
        let inner = self.inner.lock();
        let entry = inner.entries[r.slab_index()]
            .as_deref()
            .expect("string pool handle already freed");
        f(entry)
    }

    pub fn copy_bytes(&self, r: StringRef) -> Vec<u8> {
        self.with_bytes(r, |b| b.to_vec())
    }

    /// Total bytes held across all live entries, pool-wide.
    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    pub fn live_entries(&self) -> usize {
        let inner = self.inner.lock();
        inner.entries.len() - inner.free.len()
    }
}
