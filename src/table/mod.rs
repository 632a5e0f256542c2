//! # Table Core
//!
//! The table owns a set of uniform tuple blocks and the bookkeeping that
//! makes allocation, compaction, and snapshot-safe scans meet in one
//! structure:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Table                             │
//! ├──────────────────────────────────────────────────────────┤
//! │ blocks: BlockId -> Block            (allocation order)   │
//! │ blocks_with_space: ordered set of non-full, unpinned     │
//! │ buckets[not-pending][0..B-1]: density-ordered sets       │
//! │ buckets[pending][0..B-1]:     density-ordered sets       │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Allocation
//!
//! `next_free_slot` picks any block with space (lowest id first) or
//! allocates a fresh block sized to the construction-time allocation
//! target. Density-bucket membership is maintained on every population
//! change; full blocks leave `blocks_with_space`.
//!
//! ## Compaction
//!
//! `compact_within` drains the emptiest blocks of one snapshot partition
//! into the fullest, notifying the index observer of every relocation and
//! freeing blocks that empty out. The two partitions are compacted
//! independently so tuples never cross the snapshot boundary, and blocks
//! pinned by a scan are invisible to the whole pass.
//!
//! ## Bucket Membership Rules
//!
//! A block lives in exactly one bucket of exactly one partition array,
//! except while a scan pins it, when it is in neither. Every mutation
//! that reports a `BucketChange` goes through one of three cases:
//! in the not-pending array, in the pending array, or pinned (no set to
//! update; the scan rebuckets on release).
//!
//! ## Concurrency Model
//!
//! The table is not internally synchronized. The engine guarantees a
//! single mutator at a time; scans are cursors that interleave with
//! mutations through `&mut` access rather than shared references.

mod iterator;
mod serde;

pub use iterator::TableIterator;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::block::{
    Block, BlockAllocation, BlockId, BucketChange, Partition, PartitionState, SlotAddr,
};
use crate::pool::StringPool;
use crate::schema::Schema;
use crate::tuple::{self, status, TupleMut, TupleRef, TUPLE_HEADER_SIZE};
use crate::types::Value;

pub const DEFAULT_NUM_BUCKETS: usize = 20;
pub const DEFAULT_ALLOCATION_TARGET: usize = 2 * 1024 * 1024;

/// Counts consulted by `IndexObserver::compaction_predicate`.
#[derive(Debug, Clone, Copy)]
pub struct CompactionStats {
    pub active_tuple_count: u64,
    pub allocated_tuple_count: u64,
    pub tuples_per_block: u32,
}

impl CompactionStats {
    /// Smallest allocated-slot count that can hold the active tuples at
    /// the table's block granularity.
    pub fn minimum_allocated(&self) -> u64 {
        if self.tuples_per_block == 0 {
            return 0;
        }
        let per_block = self.tuples_per_block as u64;
        self.active_tuple_count.div_ceil(per_block) * per_block
    }
}

/// Capability the indexing layer hands to the table. Compaction and bulk
/// loads call back through it so external structures that point at tuple
/// slots stay current.
pub trait IndexObserver {
    /// A live tuple moved during compaction; indexes chase the pointer.
    fn on_relocate(&mut self, _old: SlotAddr, _new: SlotAddr) {}

    /// A block is about to be freed; drop any per-block index state.
    fn on_block_removed(&mut self, _block: BlockId) {}

    /// A tuple was materialized by a bulk load.
    fn on_loaded_tuple(&mut self, _allow_export: bool, _tuple: &TupleRef<'_>) {}

    /// Queried by `forced_compaction` to decide whether to keep going.
    fn compaction_predicate(&self, stats: &CompactionStats) -> bool {
        stats.allocated_tuple_count > stats.minimum_allocated()
    }

    fn index_count(&self) -> usize {
        0
    }
}

/// Observer for tables with no external indexes.
#[derive(Debug, Default)]
pub struct NullIndexObserver;

impl IndexObserver for NullIndexObserver {}

pub struct TableConfig {
    pub allocation_target_bytes: usize,
    pub num_buckets: usize,
    pub allocation: BlockAllocation,
    pub database_id: i32,
    pub name: String,
    pub pool: Option<Arc<StringPool>>,
    pub observer: Option<Box<dyn IndexObserver>>,
}

impl TableConfig {
    pub fn new(allocation_target_bytes: usize) -> Self {
        Self {
            allocation_target_bytes,
            num_buckets: DEFAULT_NUM_BUCKETS,
            allocation: BlockAllocation::default(),
            database_id: 0,
            name: String::new(),
            pool: None,
            observer: None,
        }
    }

    pub fn num_buckets(mut self, num_buckets: usize) -> Self {
        self.num_buckets = num_buckets;
        self
    }

    pub fn allocation(mut self, allocation: BlockAllocation) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn database_id(mut self, database_id: i32) -> Self {
        self.database_id = database_id;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn pool(mut self, pool: Arc<StringPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn observer(mut self, observer: Box<dyn IndexObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

pub struct Table {
    schema: Arc<Schema>,
    column_names: Vec<String>,
    column_index: HashMap<String, usize>,
    name: String,
    database_id: i32,
    tuple_length: usize,
    tuples_per_block: u32,
    block_allocation_bytes: usize,
    allocation_target_bytes: usize,
    allocation: BlockAllocation,
    num_buckets: usize,
    next_block_id: u64,
    blocks: BTreeMap<BlockId, Block>,
    blocks_with_space: BTreeSet<BlockId>,
    buckets: [Vec<BTreeSet<BlockId>>; Partition::COUNT],
    tuple_count: u64,
    tuples_pinned_by_undo: u64,
    non_inlined_memory_size: usize,
    pool: Arc<StringPool>,
    temp_tuple: Box<[u8]>,
    column_header_cache: Option<Box<[u8]>>,
    observer: Box<dyn IndexObserver>,
    initialized: bool,
}

impl Table {
    pub fn new(allocation_target_bytes: usize) -> Self {
        Self::with_config(TableConfig::new(allocation_target_bytes))
    }

    pub fn with_config(config: TableConfig) -> Self {
        assert!(
            config.num_buckets >= 2,
            "need at least two density buckets"
        );
        assert!(
            config.allocation_target_bytes > 0,
            "allocation target must be positive"
        );
        Self {
            schema: Arc::new(Schema::new(Vec::new())),
            column_names: Vec::new(),
            column_index: HashMap::new(),
            name: config.name,
            database_id: config.database_id,
            tuple_length: 0,
            tuples_per_block: 0,
            block_allocation_bytes: 0,
            allocation_target_bytes: config.allocation_target_bytes,
            allocation: config.allocation,
            num_buckets: config.num_buckets,
            next_block_id: 0,
            blocks: BTreeMap::new(),
            blocks_with_space: BTreeSet::new(),
            buckets: [
                vec![BTreeSet::new(); config.num_buckets],
                vec![BTreeSet::new(); config.num_buckets],
            ],
            tuple_count: 0,
            tuples_pinned_by_undo: 0,
            non_inlined_memory_size: 0,
            pool: config.pool.unwrap_or_default(),
            temp_tuple: Box::new([]),
            column_header_cache: None,
            observer: config.observer.unwrap_or_else(|| Box::new(NullIndexObserver)),
            initialized: false,
        }
    }

    /// Binds the schema and column names and derives the block geometry.
    /// The table must not own any blocks yet.
    pub fn initialize(&mut self, schema: Arc<Schema>, column_names: Vec<String>) -> Result<()> {
        assert!(
            self.blocks.is_empty() && self.blocks_with_space.is_empty() && self.tuple_count == 0,
            "initialize on a table that already owns blocks"
        );
        ensure!(
            column_names.len() == schema.column_count(),
            "{} column names for {} columns",
            column_names.len(),
            schema.column_count()
        );

        self.tuple_length = TUPLE_HEADER_SIZE + schema.payload_length();
        if cfg!(feature = "memcheck") {
            self.tuples_per_block = 1;
            self.block_allocation_bytes = self.tuple_length;
        } else {
            let per_block = self.allocation_target_bytes / self.tuple_length;
            if per_block < 1 {
                self.tuples_per_block = 1;
                self.block_allocation_bytes = match self.allocation {
                    BlockAllocation::Mmap => self.tuple_length.next_power_of_two(),
                    BlockAllocation::Heap => self.tuple_length,
                };
            } else {
                self.tuples_per_block =
                    u32::try_from(per_block).expect("tuples per block overflows u32");
                self.block_allocation_bytes = match self.allocation {
                    BlockAllocation::Mmap => self.allocation_target_bytes.next_power_of_two(),
                    BlockAllocation::Heap => self.allocation_target_bytes,
                };
            }
        }

        self.temp_tuple = vec![0u8; self.tuple_length].into_boxed_slice();
        self.temp_tuple[0] = status::ACTIVE;
        self.column_index = column_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        self.schema = schema;
        self.column_names = column_names;
        self.column_header_cache = None;
        self.initialized = true;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_id(&self) -> i32 {
        self.database_id
    }

    pub fn table_type(&self) -> &'static str {
        "PersistentTable"
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.column_index.get(name).copied()
    }

    pub fn tuple_length(&self) -> usize {
        self.tuple_length
    }

    pub fn tuples_per_block(&self) -> u32 {
        self.tuples_per_block
    }

    pub fn block_allocation_bytes(&self) -> usize {
        self.block_allocation_bytes
    }

    pub fn active_tuple_count(&self) -> u64 {
        self.tuple_count
    }

    pub fn allocated_tuple_count(&self) -> u64 {
        self.blocks.len() as u64 * self.tuples_per_block as u64
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn non_inlined_memory_size(&self) -> usize {
        self.non_inlined_memory_size
    }

    pub fn pool(&self) -> &Arc<StringPool> {
        &self.pool
    }

    pub fn tuples_pinned_by_undo(&self) -> u64 {
        self.tuples_pinned_by_undo
    }

    pub fn add_undo_pin(&mut self) {
        self.tuples_pinned_by_undo += 1;
    }

    pub fn release_undo_pin(&mut self) {
        assert!(self.tuples_pinned_by_undo > 0, "undo pin underflow");
        self.tuples_pinned_by_undo -= 1;
    }

    pub fn compaction_stats(&self) -> CompactionStats {
        CompactionStats {
            active_tuple_count: self.tuple_count,
            allocated_tuple_count: self.allocated_tuple_count(),
            tuples_per_block: self.tuples_per_block,
        }
    }

    // ---------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.keys().copied().collect()
    }

    pub fn block_active_count(&self, id: BlockId) -> Option<u32> {
        self.blocks.get(&id).map(|b| b.active_count())
    }

    pub fn block_bucket(&self, id: BlockId) -> Option<usize> {
        self.blocks.get(&id).map(|b| b.bucket())
    }

    pub fn block_state(&self, id: BlockId) -> Option<PartitionState> {
        self.blocks.get(&id).map(|b| b.state())
    }

    pub fn block_relocation_fence(&self, id: BlockId) -> Option<u32> {
        self.blocks.get(&id).map(|b| b.relocation_fence())
    }

    pub fn blocks_with_space(&self) -> Vec<BlockId> {
        self.blocks_with_space.iter().copied().collect()
    }

    // ---------------------------------------------------------------
    // Tuples
    // ---------------------------------------------------------------

    /// Hands out a free slot, reusing a block with space or allocating a
    /// fresh one. The returned slot is zeroed; the caller writes the
    /// payload and raises the active flag.
    pub fn next_free_slot(&mut self) -> Result<SlotAddr> {
        assert!(self.initialized, "table not initialized");
        let block_id = match self.blocks_with_space.first().copied() {
            Some(id) => id,
            None => self.allocate_block()?,
        };

        let (slot, change, state, has_free) = {
            let block = self
                .blocks
                .get_mut(&block_id)
                .expect("blocks_with_space references a missing block");
            let (slot, change) = block.next_free_slot();
            (slot, change, block.state(), block.has_free_slots())
        };

        if let Some(change) = change {
            self.apply_bucket_change(block_id, state, change);
        }
        if !has_free {
            self.blocks_with_space.remove(&block_id);
        }
        self.tuple_count += 1;
        Ok(SlotAddr {
            block: block_id,
            slot,
        })
    }

    /// Deletes the tuple at `addr`: releases its pool handles, returns
    /// the slot to the block's free list, and drops the block entirely if
    /// it empties out while unpinned.
    pub fn free_slot(&mut self, addr: SlotAddr) -> Result<()> {
        assert!(self.initialized, "table not initialized");
        let schema = Arc::clone(&self.schema);
        let pool = Arc::clone(&self.pool);

        let released = {
            let block = self
                .blocks
                .get_mut(&addr.block)
                .expect("free_slot on an unknown block");
            assert!(
                block.slot_is_active(addr.slot),
                "free_slot on an inactive slot {:?}",
                addr
            );
            let released = tuple::release_var_values(block.slot_mut(addr.slot), &schema, &pool)?;
            block.slot_mut(addr.slot).fill(0);
            released
        };
        self.non_inlined_memory_size -= released;
        self.release_slot_bookkeeping(addr);
        Ok(())
    }

    /// Count/bucket/set maintenance shared by delete and load rollback.
    /// The slot contents have already been cleared.
    fn release_slot_bookkeeping(&mut self, addr: SlotAddr) {
        let (change, empty, state, has_free) = {
            let block = self
                .blocks
                .get_mut(&addr.block)
                .expect("releasing a slot in an unknown block");
            let change = block.free_slot(addr.slot);
            (
                change,
                block.is_empty(),
                block.state(),
                block.has_free_slots(),
            )
        };
        self.tuple_count -= 1;

        if empty && !state.is_pinned() {
            self.remove_block(addr.block);
            return;
        }
        if let Some(change) = change {
            self.apply_bucket_change(addr.block, state, change);
        }
        if has_free && !state.is_pinned() {
            self.blocks_with_space.insert(addr.block);
        }
    }

    /// Validates and writes a full row. Returns the new tuple's address.
    pub fn insert(&mut self, values: &[Value<'_>]) -> Result<SlotAddr> {
        ensure!(
            values.len() == self.schema.column_count(),
            "row has {} values but the schema has {} columns",
            values.len(),
            self.schema.column_count()
        );
        for (idx, (value, spec)) in values.iter().zip(self.schema.columns()).enumerate() {
            match value.value_type() {
                None => ensure!(
                    spec.nullable,
                    "column {} ({}) is not nullable",
                    idx,
                    spec.value_type.name()
                ),
                Some(vt) => ensure!(
                    vt == spec.value_type,
                    "cannot store {} in column {} of type {}",
                    vt.name(),
                    idx,
                    spec.value_type.name()
                ),
            }
        }

        let addr = self.next_free_slot()?;
        let schema = Arc::clone(&self.schema);
        let pool = Arc::clone(&self.pool);
        let mut charged = 0;
        {
            let block = self
                .blocks
                .get_mut(&addr.block)
                .expect("allocated block missing");
            let mut tuple = TupleMut::new(block.slot_mut(addr.slot), &schema, &pool);
            tuple.set_active(true);
            for (idx, value) in values.iter().enumerate() {
                let (c, _) = tuple.set_value(idx, value)?;
                charged += c;
            }
        }
        self.non_inlined_memory_size += charged;
        Ok(addr)
    }

    /// Borrow of the scratch slot used to stage a row before insert. The
    /// scratch slot is active and owned exclusively by this table.
    pub fn temp_tuple(&mut self) -> TupleMut<'_> {
        assert!(self.initialized, "table not initialized");
        TupleMut::new(&mut self.temp_tuple, &self.schema, &self.pool)
    }

    /// Copies the staged scratch row into a fresh slot, transferring
    /// ownership of any pool handles it holds.
    pub fn insert_from_temp(&mut self) -> Result<SlotAddr> {
        assert!(self.initialized, "table not initialized");
        let addr = self.next_free_slot()?;
        let schema = Arc::clone(&self.schema);

        let mut charged = 0;
        for &col_idx in schema.var_column_indices() {
            let off = TUPLE_HEADER_SIZE + schema.offset(col_idx as usize);
            let r = crate::pool::StringRef::from_bytes(&self.temp_tuple[off..])?;
            if !r.is_null() {
                charged += r.length() as usize;
            }
        }

        {
            let block = self
                .blocks
                .get_mut(&addr.block)
                .expect("allocated block missing");
            block.slot_mut(addr.slot).copy_from_slice(&self.temp_tuple);
            block.slot_mut(addr.slot)[0] = status::ACTIVE;
        }
        // the slot owns the handles now; detach them from the scratch row
        for &col_idx in schema.var_column_indices() {
            let off = TUPLE_HEADER_SIZE + schema.offset(col_idx as usize);
            crate::pool::StringRef::null().write_to(&mut self.temp_tuple[off..])?;
        }
        self.non_inlined_memory_size += charged;
        Ok(addr)
    }

    /// A typed view of the tuple at `addr`, or `None` if the block is
    /// gone or the slot is not active.
    pub fn tuple_at(&self, addr: SlotAddr) -> Option<TupleRef<'_>> {
        let block = self.blocks.get(&addr.block)?;
        if addr.slot >= block.used_slot_limit() || !block.slot_is_active(addr.slot) {
            return None;
        }
        Some(TupleRef::new(
            block.slot(addr.slot),
            &self.schema,
            &self.pool,
        ))
    }

    /// All active slots in scan order: ascending block id, then slot.
    pub(crate) fn scan_active(&self) -> impl Iterator<Item = SlotAddr> + '_ {
        self.blocks.iter().flat_map(|(&id, block)| {
            (0..block.used_slot_limit())
                .filter(move |&slot| block.slot_is_active(slot))
                .map(move |slot| SlotAddr { block: id, slot })
        })
    }

    pub fn active_slots(&self) -> Vec<SlotAddr> {
        self.scan_active().collect()
    }

    // ---------------------------------------------------------------
    // Blocks and buckets
    // ---------------------------------------------------------------

    fn allocate_block(&mut self) -> Result<BlockId> {
        let id = BlockId(self.next_block_id);
        let block = Block::new(
            id,
            self.tuples_per_block,
            self.tuple_length,
            self.block_allocation_bytes,
            self.num_buckets,
            self.allocation,
        )?;
        self.next_block_id += 1;
        // fresh blocks join the not-pending partition in the bottom bucket
        self.buckets[Partition::NotPendingSnapshot.index()][block.bucket()].insert(id);
        self.blocks.insert(id, block);
        self.blocks_with_space.insert(id);
        Ok(id)
    }

    /// Frees a block's memory after notifying the observer and detaching
    /// it from every set. Pinned blocks reach this only through scan
    /// release.
    fn remove_block(&mut self, id: BlockId) {
        self.observer.on_block_removed(id);
        let block = self.blocks.remove(&id).expect("removing an unknown block");
        self.blocks_with_space.remove(&id);
        if let PartitionState::InPartition(p) = block.state() {
            let removed = self.buckets[p.index()][block.bucket()].remove(&id);
            debug_assert!(removed, "block {:?} missing from its bucket", id);
        }
    }

    fn apply_bucket_change(&mut self, id: BlockId, state: PartitionState, change: BucketChange) {
        match state {
            PartitionState::InPartition(p) => {
                let array = &mut self.buckets[p.index()];
                let removed = array[change.from].remove(&id);
                debug_assert!(
                    removed,
                    "block {:?} missing from {} bucket {}",
                    id,
                    p.name(),
                    change.from
                );
                array[change.to].insert(id);
            }
            PartitionState::Pinned { .. } => {
                // pinned blocks sit in no bucket; the scan rebuckets on release
            }
        }
    }

    fn partition_is_empty(&self, partition: Partition) -> bool {
        self.buckets[partition.index()].iter().all(|b| b.is_empty())
    }

    // ---------------------------------------------------------------
    // Snapshot partition markers
    // ---------------------------------------------------------------

    pub fn mark_block_pending_snapshot(&mut self, id: BlockId) {
        self.set_block_partition(id, Partition::PendingSnapshot);
    }

    pub fn mark_block_not_pending_snapshot(&mut self, id: BlockId) {
        self.set_block_partition(id, Partition::NotPendingSnapshot);
    }

    pub fn mark_all_blocks_pending_snapshot(&mut self) {
        for id in self.block_ids() {
            self.mark_block_pending_snapshot(id);
        }
    }

    fn set_block_partition(&mut self, id: BlockId, target: Partition) {
        let (state, bucket) = {
            let block = self.blocks.get(&id).expect("marking an unknown block");
            (block.state(), block.bucket())
        };
        match state {
            PartitionState::InPartition(p) if p == target => {}
            PartitionState::InPartition(p) => {
                let removed = self.buckets[p.index()][bucket].remove(&id);
                debug_assert!(removed, "block {:?} missing from its bucket", id);
                self.buckets[target.index()][bucket].insert(id);
                self.blocks
                    .get_mut(&id)
                    .expect("marking an unknown block")
                    .set_state(PartitionState::InPartition(target));
            }
            PartitionState::Pinned { .. } => {
                // held by a scan; it rejoins the target partition on release
                self.blocks
                    .get_mut(&id)
                    .expect("marking an unknown block")
                    .set_state(PartitionState::Pinned { origin: target });
            }
        }
    }

    // ---------------------------------------------------------------
    // Scan pinning
    // ---------------------------------------------------------------

    pub fn iterator(&self) -> TableIterator {
        TableIterator::new(self)
    }

    pub(crate) fn pin_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(&id) else {
            return;
        };
        let PartitionState::InPartition(p) = block.state() else {
            return;
        };
        let bucket = block.bucket();
        let removed = self.buckets[p.index()][bucket].remove(&id);
        debug_assert!(removed, "block {:?} missing from its bucket", id);
        self.blocks_with_space.remove(&id);
        let block = self.blocks.get_mut(&id).expect("pinning an unknown block");
        block.set_state(PartitionState::Pinned { origin: p });
        block.clear_relocation_fence();
    }

    pub(crate) fn unpin_block(&mut self, id: BlockId) {
        self.release_block_pin(id, None);
    }

    pub(crate) fn unpin_block_with_fence(&mut self, id: BlockId, fence: u32) {
        self.release_block_pin(id, Some(fence));
    }

    pub(crate) fn clear_block_fence(&mut self, id: BlockId) {
        if let Some(block) = self.blocks.get_mut(&id) {
            block.clear_relocation_fence();
        }
    }

    fn release_block_pin(&mut self, id: BlockId, fence: Option<u32>) {
        let released = {
            let Some(block) = self.blocks.get_mut(&id) else {
                return;
            };
            let PartitionState::Pinned { origin } = block.state() else {
                return;
            };
            if block.is_empty() {
                None
            } else {
                match fence {
                    Some(f) => block.set_relocation_fence(f),
                    None => block.clear_relocation_fence(),
                }
                block.set_state(PartitionState::InPartition(origin));
                Some((origin, block.bucket(), block.has_free_slots()))
            }
        };
        match released {
            None => self.remove_block(id),
            Some((origin, bucket, has_free)) => {
                self.buckets[origin.index()][bucket].insert(id);
                if has_free {
                    self.blocks_with_space.insert(id);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // Compaction
    // ---------------------------------------------------------------

    /// One compaction pass over a single snapshot partition. Returns
    /// `false` when no receiving block or no donor block can be found.
    pub fn compact_within(&mut self, partition: Partition) -> bool {
        let pi = partition.index();

        // receiving block: highest non-empty bucket strictly below the
        // top (the top bucket is fully packed)
        let mut fullest = None;
        for b in (0..self.num_buckets - 1).rev() {
            if let Some(&id) = self.buckets[pi][b].first() {
                fullest = Some(id);
                break;
            }
        }
        let Some(fullest_id) = fullest else {
            return false;
        };
        let dest_prev_bucket = self.blocks[&fullest_id].bucket();

        // donors whose movable region is exhausted by a relocation fence
        let mut stalled: Vec<BlockId> = Vec::new();

        while self.blocks[&fullest_id].has_free_slots() {
            let mut lightest = None;
            'scan: for b in 0..self.num_buckets {
                for &id in &self.buckets[pi][b] {
                    if id != fullest_id && !stalled.contains(&id) {
                        lightest = Some(id);
                        break 'scan;
                    }
                }
            }
            let Some(lightest_id) = lightest else {
                self.finish_compaction_dest(fullest_id, dest_prev_bucket, partition);
                return false;
            };

            let mut source = self
                .blocks
                .remove(&lightest_id)
                .expect("donor block missing from map");
            let src_prev_bucket = source.bucket();
            let outcome = {
                let observer = &mut self.observer;
                let dest = self
                    .blocks
                    .get_mut(&fullest_id)
                    .expect("receiving block missing from map");
                dest.merge_from(&mut source, |old, new| observer.on_relocate(old, new))
            };

            if source.is_empty() {
                self.observer.on_block_removed(lightest_id);
                self.blocks_with_space.remove(&lightest_id);
                let removed = self.buckets[pi][src_prev_bucket].remove(&lightest_id);
                debug_assert!(removed, "donor {:?} missing from its bucket", lightest_id);
                // source dropped here, freeing its memory
            } else {
                if let Some(change) = outcome.source_change {
                    let removed = self.buckets[pi][change.from].remove(&lightest_id);
                    debug_assert!(removed, "donor {:?} missing from its bucket", lightest_id);
                    self.buckets[pi][change.to].insert(lightest_id);
                }
                if source.has_free_slots() {
                    self.blocks_with_space.insert(lightest_id);
                }
                let fenced = outcome.moved == 0;
                self.blocks.insert(lightest_id, source);
                if fenced {
                    stalled.push(lightest_id);
                }
            }
        }
        self.finish_compaction_dest(fullest_id, dest_prev_bucket, partition);
        true
    }

    fn finish_compaction_dest(&mut self, id: BlockId, prev_bucket: usize, partition: Partition) {
        let pi = partition.index();
        let block = self.blocks.get(&id).expect("receiving block missing");
        let bucket = block.bucket();
        let full = !block.has_free_slots();
        if bucket != prev_bucket {
            let removed = self.buckets[pi][prev_bucket].remove(&id);
            debug_assert!(removed, "receiver {:?} missing from its bucket", id);
            self.buckets[pi][bucket].insert(id);
        }
        if full {
            self.blocks_with_space.remove(&id);
        }
    }

    /// One pass across each non-empty partition.
    pub fn idle_compaction(&mut self) {
        if !self.partition_is_empty(Partition::NotPendingSnapshot) {
            self.compact_within(Partition::NotPendingSnapshot);
        }
        if !self.partition_is_empty(Partition::PendingSnapshot) {
            self.compact_within(Partition::PendingSnapshot);
        }
    }

    /// Compacts until the observer's predicate is satisfied or neither
    /// partition can make progress.
    pub fn forced_compaction(&mut self) {
        loop {
            let stats = self.compaction_stats();
            if !self.observer.compaction_predicate(&stats) {
                break;
            }
            let worked_np = !self.partition_is_empty(Partition::NotPendingSnapshot)
                && self.compact_within(Partition::NotPendingSnapshot);
            let worked_p = !self.partition_is_empty(Partition::PendingSnapshot)
                && self.compact_within(Partition::PendingSnapshot);
            if !worked_np && !worked_p {
                break;
            }
        }
    }

    // ---------------------------------------------------------------
    // Equality and diagnostics
    // ---------------------------------------------------------------

    /// Deep equality: identity metadata, schema, and pairwise-equal
    /// tuples in scan order.
    pub fn equals(&self, other: &Table) -> Result<bool> {
        if self.schema.column_count() != other.schema.column_count()
            || self.observer.index_count() != other.observer.index_count()
            || self.tuple_count != other.tuple_count
            || self.database_id != other.database_id
            || self.name != other.name
            || self.table_type() != other.table_type()
            || *self.schema != *other.schema
        {
            return Ok(false);
        }

        let mut theirs = other.scan_active();
        for addr in self.scan_active() {
            let Some(other_addr) = theirs.next() else {
                return Ok(false);
            };
            let a = self.tuple_at(addr).expect("active slot vanished mid-scan");
            let b = other
                .tuple_at(other_addr)
                .expect("active slot vanished mid-scan");
            if !a.equals(&b)? {
                return Ok(false);
            }
        }
        Ok(theirs.next().is_none())
    }

    /// Checks every structural invariant, reporting the first violation
    /// with block context. Intended for tests and debugging sweeps.
    pub fn validate(&self) -> Result<()> {
        let mut active_sum = 0u64;
        for (&id, block) in &self.blocks {
            active_sum += block.active_count() as u64;
            let expected =
                Block::bucket_for(block.active_count(), block.capacity(), self.num_buckets);
            match block.state() {
                PartitionState::InPartition(p) => {
                    ensure!(
                        block.bucket() == expected,
                        "block {:?} (base {:#x}) tracks bucket {} but {}/{} active maps to {}",
                        id,
                        block.base_address(),
                        block.bucket(),
                        block.active_count(),
                        block.capacity(),
                        expected
                    );
                    ensure!(
                        self.buckets[p.index()][block.bucket()].contains(&id),
                        "block {:?} missing from {} bucket {}",
                        id,
                        p.name(),
                        block.bucket()
                    );
                    let other = &self.buckets[1 - p.index()];
                    for (bi, bucket) in other.iter().enumerate() {
                        ensure!(
                            !bucket.contains(&id),
                            "block {:?} leaked into the opposite partition's bucket {}",
                            id,
                            bi
                        );
                    }
                    ensure!(!block.is_empty(), "empty block {:?} still resident", id);
                    ensure!(
                        self.blocks_with_space.contains(&id) == block.has_free_slots(),
                        "blocks_with_space disagrees with block {:?} ({}/{} active)",
                        id,
                        block.active_count(),
                        block.capacity()
                    );
                }
                PartitionState::Pinned { .. } => {
                    for array in &self.buckets {
                        for (bi, bucket) in array.iter().enumerate() {
                            ensure!(
                                !bucket.contains(&id),
                                "pinned block {:?} still in bucket {}",
                                id,
                                bi
                            );
                        }
                    }
                    ensure!(
                        !self.blocks_with_space.contains(&id),
                        "pinned block {:?} in blocks_with_space",
                        id
                    );
                }
            }
        }
        ensure!(
            active_sum == self.tuple_count,
            "tuple count {} != sum of block active counts {}",
            self.tuple_count,
            active_sum
        );
        for &id in &self.blocks_with_space {
            ensure!(
                self.blocks.contains_key(&id),
                "blocks_with_space references unknown block {:?}",
                id
            );
        }
        for (pi, array) in self.buckets.iter().enumerate() {
            for (bi, bucket) in array.iter().enumerate() {
                for &id in bucket {
                    let block = self.blocks.get(&id);
                    ensure!(
                        block.is_some(),
                        "bucket {}/{} references unknown block {:?}",
                        pi,
                        bi,
                        id
                    );
                    ensure!(
                        block.map(|b| b.bucket()) == Some(bi),
                        "bucket {}/{} holds block {:?} that tracks a different bucket",
                        pi,
                        bi,
                        id
                    );
                }
            }
        }
        Ok(())
    }

    /// Human-readable rendering of the table state and its live tuples.
    pub fn debug_dump(&self) -> Result<String> {
        let mut out = String::new();
        out.push_str(&format!("{}({}):\n", self.table_type(), self.name));
        out.push_str(&format!(
            "\tAllocated Tuples:  {}\n",
            self.allocated_tuple_count()
        ));
        out.push_str(&format!(
            "\tNumber of Columns: {}\n",
            self.schema.column_count()
        ));
        out.push_str("===========================================================\n");
        out.push_str("\tCOLUMNS\n");
        for (idx, (name, spec)) in self
            .column_names
            .iter()
            .zip(self.schema.columns())
            .enumerate()
        {
            out.push_str(&format!(
                "\tcolumn {}: {}, type = {}\n",
                idx,
                name,
                spec.value_type.name()
            ));
        }
        out.push_str("===========================================================\n");
        out.push_str("\tDATA\n");
        if self.tuple_count == 0 {
            out.push_str("\t<NONE>\n");
        } else {
            for addr in self.scan_active() {
                let tuple = self.tuple_at(addr).expect("active slot vanished mid-scan");
                let mut rendered = Vec::with_capacity(self.schema.column_count());
                for col in 0..self.schema.column_count() {
                    rendered.push(tuple.value(col)?.to_string());
                }
                out.push_str(&format!("\t({})\n", rendered.join(", ")));
            }
        }
        out.push_str("===========================================================\n");
        Ok(out)
    }

}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("tuple_count", &self.tuple_count)
            .field("block_count", &self.blocks.len())
            .field("tuples_per_block", &self.tuples_per_block)
            .field("non_inlined_memory_size", &self.non_inlined_memory_size)
            .finish_non_exhaustive()
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.schema.var_column_count() == 0 {
            return;
        }
        let schema = Arc::clone(&self.schema);
        let pool = Arc::clone(&self.pool);
        for block in self.blocks.values_mut() {
            for slot in 0..block.used_slot_limit() {
                if block.slot_is_active(slot) {
                    let _ = tuple::release_var_values(block.slot_mut(slot), &schema, &pool);
                }
            }
        }
        let _ = tuple::release_var_values(&mut self.temp_tuple, &schema, &pool);
    }
}
