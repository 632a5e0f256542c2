//! # Tuple Blocks
//!
//! A block is one contiguous allocation holding a fixed number of tuple
//! slots of identical length. Blocks track their live-slot population and
//! the free slots available for reuse:
//!
//! ```text
//! +-----------------------------------------------+
//! | slot 0 | slot 1 | slot 2 | ... | slot cap-1   |
//! +-----------------------------------------------+
//!   ^ each slot: 1 status byte + payload
//! ```
//!
//! ## Allocation Within a Block
//!
//! Free slots come from two sources, checked in order:
//! 1. `free_list`: a stack of slot indices reclaimed by deletes
//! 2. `next_unused`: a bump pointer over never-used slots
//!
//! Slots at indices >= `next_unused` have never held a tuple, so scans
//! only examine `0..next_unused`.
//!
//! ## Density Buckets
//!
//! Each block maintains its density bucket
//! `min(num_buckets - 1, active * num_buckets / capacity)` so the owning
//! table can cheaply find its fullest and emptiest blocks. Mutating
//! operations report a `BucketChange` exactly when the population change
//! crosses a bucket boundary; the table then moves the block between the
//! ordered bucket sets.
//!
//! ## Relocation Fence
//!
//! `relocation_fence` bounds which slots `merge_from` may drain out of a
//! source block. It equals `capacity` (no restriction) except after a
//! scan releases its pin mid-block, when it holds the released cursor so
//! only already-visited slots can move.
//!
//! ## Memory
//!
//! Backing memory is either a heap allocation or an anonymous mapping,
//! chosen per table at construction. Both are zero-initialized, which
//! matters: a zeroed slot reads as inactive with NULL variable-length
//! handles.

use eyre::Result;
use memmap2::MmapMut;

use crate::error::TableError;
use crate::tuple::status;

/// Block identity: a monotonically increasing allocation sequence number
/// assigned by the owning table. Ordered sets of `BlockId` therefore
/// enumerate blocks in allocation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

/// Stable identity of one tuple slot: owning block plus slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotAddr {
    pub block: BlockId,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockAllocation {
    #[default]
    Heap,
    Mmap,
}

#[derive(Debug)]
enum BlockMemory {
    Heap(Box<[u8]>),
    Mmap(MmapMut),
}

impl BlockMemory {
    fn allocate(bytes: usize, allocation: BlockAllocation) -> Result<Self> {
        match allocation {
            BlockAllocation::Heap => Ok(BlockMemory::Heap(vec![0u8; bytes].into_boxed_slice())),
            BlockAllocation::Mmap => MmapMut::map_anon(bytes)
                .map(BlockMemory::Mmap)
                .map_err(|e| {
                    TableError::out_of_memory(format!(
                        "anonymous mapping of {} bytes failed: {}",
                        bytes, e
                    ))
                }),
        }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            BlockMemory::Heap(b) => b,
            BlockMemory::Mmap(m) => m,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            BlockMemory::Heap(b) => b,
            BlockMemory::Mmap(m) => m,
        }
    }
}

/// The two snapshot partitions. Compaction never moves tuples across the
/// partition boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    NotPendingSnapshot,
    PendingSnapshot,
}

impl Partition {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        match self {
            Partition::NotPendingSnapshot => 0,
            Partition::PendingSnapshot => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Partition::NotPendingSnapshot => "not-pending-snapshot",
            Partition::PendingSnapshot => "pending-snapshot",
        }
    }
}

/// Where a block stands relative to the snapshot partitions. A pinned
/// block is held by a scan: it sits in no partition and no bucket, and
/// remembers which partition to rejoin on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    InPartition(Partition),
    Pinned { origin: Partition },
}

impl PartitionState {
    pub fn is_pinned(&self) -> bool {
        matches!(self, PartitionState::Pinned { .. })
    }

    pub fn partition(&self) -> Option<Partition> {
        match self {
            PartitionState::InPartition(p) => Some(*p),
            PartitionState::Pinned { .. } => None,
        }
    }
}

/// Reported when a population change crosses a density-bucket boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketChange {
    pub from: usize,
    pub to: usize,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub dest_change: Option<BucketChange>,
    pub source_change: Option<BucketChange>,
    pub moved: u32,
}

#[derive(Debug)]
pub struct Block {
    id: BlockId,
    memory: BlockMemory,
    tuple_length: usize,
    capacity: u32,
    active: u32,
    free_list: Vec<u32>,
    next_unused: u32,
    relocation_fence: u32,
    bucket: usize,
    num_buckets: usize,
    state: PartitionState,
}

impl Block {
    pub fn new(
        id: BlockId,
        capacity: u32,
        tuple_length: usize,
        allocation_bytes: usize,
        num_buckets: usize,
        allocation: BlockAllocation,
    ) -> Result<Self> {
        assert!(capacity > 0, "block capacity must be positive");
        assert!(num_buckets >= 2, "need at least two density buckets");
        assert!(
            allocation_bytes >= capacity as usize * tuple_length,
            "allocation of {} bytes cannot hold {} slots of {} bytes",
            allocation_bytes,
            capacity,
            tuple_length
        );

        let memory = BlockMemory::allocate(allocation_bytes, allocation)?;
        Ok(Self {
            id,
            memory,
            tuple_length,
            capacity,
            active: 0,
            free_list: Vec::new(),
            next_unused: 0,
            relocation_fence: capacity,
            bucket: 0,
            num_buckets,
            state: PartitionState::InPartition(Partition::NotPendingSnapshot),
        })
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Base address of the backing allocation, for diagnostics.
    pub fn base_address(&self) -> usize {
        self.memory.as_slice().as_ptr() as usize
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn active_count(&self) -> u32 {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn has_free_slots(&self) -> bool {
        self.active < self.capacity
    }

    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn set_state(&mut self, state: PartitionState) {
        self.state = state;
    }

    pub fn relocation_fence(&self) -> u32 {
        self.relocation_fence
    }

    pub fn set_relocation_fence(&mut self, fence: u32) {
        self.relocation_fence = fence.min(self.capacity);
    }

    pub fn clear_relocation_fence(&mut self) {
        self.relocation_fence = self.capacity;
    }

    /// Slots at indices below this bound may hold tuples; slots at or
    /// above it have never been used.
    pub fn used_slot_limit(&self) -> u32 {
        self.next_unused
    }

    pub fn slot(&self, idx: u32) -> &[u8] {
        assert!(idx < self.capacity, "slot {} out of range", idx);
        let off = idx as usize * self.tuple_length;
        &self.memory.as_slice()[off..off + self.tuple_length]
    }

    pub fn slot_mut(&mut self, idx: u32) -> &mut [u8] {
        assert!(idx < self.capacity, "slot {} out of range", idx);
        let off = idx as usize * self.tuple_length;
        &mut self.memory.as_mut_slice()[off..off + self.tuple_length]
    }

    pub fn slot_is_active(&self, idx: u32) -> bool {
        self.slot(idx)[0] & status::ACTIVE != 0
    }

    pub fn bucket_for(active: u32, capacity: u32, num_buckets: usize) -> usize {
        let raw = active as usize * num_buckets / capacity as usize;
        raw.min(num_buckets - 1)
    }

    fn update_bucket(&mut self) -> Option<BucketChange> {
        let to = Self::bucket_for(self.active, self.capacity, self.num_buckets);
        if to == self.bucket {
            return None;
        }
        let from = self.bucket;
        self.bucket = to;
        Some(BucketChange { from, to })
    }

    /// Hands out a free slot, preferring reclaimed slots over never-used
    /// ones. The slot is returned zeroed; the caller writes payload and
    /// raises the active flag.
    pub fn next_free_slot(&mut self) -> (u32, Option<BucketChange>) {
        assert!(self.has_free_slots(), "next_free_slot on a full block");
        let slot = match self.free_list.pop() {
            Some(s) => s,
            None => {
                let s = self.next_unused;
                self.next_unused += 1;
                s
            }
        };
        self.active += 1;
        (slot, self.update_bucket())
    }

    /// Returns a slot to the free list. The caller has already cleared
    /// the slot contents and released any pool handles.
    pub fn free_slot(&mut self, slot: u32) -> Option<BucketChange> {
        assert!(slot < self.next_unused, "freeing a never-used slot {}", slot);
        assert!(self.active > 0, "free_slot on an empty block");
        self.free_list.push(slot);
        self.active -= 1;
        self.update_bucket()
    }

    /// Drains active slots from `source` into this block's free slots,
    /// invoking `on_relocate` for each move so external indexes can chase
    /// the tuple. Only source slots below the relocation fence are
    /// eligible. Stops when this block fills or the eligible region is
    /// exhausted. Bucket changes are reported once, against the
    /// pre-merge buckets.
    pub fn merge_from(
        &mut self,
        source: &mut Block,
        mut on_relocate: impl FnMut(SlotAddr, SlotAddr),
    ) -> MergeOutcome {
        assert_eq!(
            self.tuple_length, source.tuple_length,
            "merging blocks of different slot sizes"
        );

        let dest_id = self.id;
        let src_id = source.id;
        let limit = source.next_unused.min(source.relocation_fence);
        let mut moved = 0;

        for idx in 0..limit {
            if !self.has_free_slots() {
                break;
            }
            if !source.slot_is_active(idx) {
                continue;
            }

            let dst_idx = match self.free_list.pop() {
                Some(s) => s,
                None => {
                    let s = self.next_unused;
                    self.next_unused += 1;
                    s
                }
            };
            self.active += 1;

            let src_off = idx as usize * source.tuple_length;
            let dst_off = dst_idx as usize * self.tuple_length;
            let len = self.tuple_length;
            self.memory.as_mut_slice()[dst_off..dst_off + len]
                .copy_from_slice(&source.memory.as_slice()[src_off..src_off + len]);

            source.memory.as_mut_slice()[src_off..src_off + len].fill(0);
            source.free_list.push(idx);
            source.active -= 1;
            moved += 1;

            on_relocate(
                SlotAddr {
                    block: src_id,
                    slot: idx,
                },
                SlotAddr {
                    block: dest_id,
                    slot: dst_idx,
                },
            );
        }

        MergeOutcome {
            dest_change: self.update_bucket(),
            source_change: source.update_bucket(),
            moved,
        }
    }
}
