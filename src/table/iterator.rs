//! # Table Scans
//!
//! A `TableIterator` walks every block's active slots in scan order:
//! ascending block id, then ascending slot offset. The iterator is a
//! cursor, not a borrowing `Iterator`: each step takes `&mut Table` so
//! the engine can interleave inserts (and compaction passes) between
//! steps under its single-mutator discipline.
//!
//! ## Pinning
//!
//! While the cursor is positioned inside a block, that block is pinned:
//! removed from its snapshot partition, its density bucket, and
//! `blocks_with_space`. Compaction cannot see it, so slots the cursor has
//! not yet visited cannot move out from under it. Leaving the block
//! restores partition and bucket membership from its then-current
//! population.
//!
//! The block list is captured at construction: tuples inserted into new
//! blocks afterwards are not visited, tuples inserted into captured
//! blocks may be, and blocks that empty out mid-scan are skipped.
//!
//! ## Early Release
//!
//! `release_pin` hands the current block back to its partition mid-scan,
//! leaving a relocation fence at the cursor so compaction may only move
//! slots the scan has already visited. The next `advance` re-pins the
//! block and lifts the fence. `close` abandons the scan and clears any
//! pin or fence it still holds.
//!
//! One scan may be live per table at a time; the engine serializes
//! snapshot readers the same way it serializes writers.

use crate::block::{BlockId, SlotAddr};

use super::Table;

#[derive(Debug)]
pub struct TableIterator {
    blocks: Vec<BlockId>,
    position: usize,
    slot: u32,
    pinned: Option<BlockId>,
    fenced: Option<BlockId>,
    done: bool,
}

impl TableIterator {
    pub(crate) fn new(table: &Table) -> Self {
        Self {
            blocks: table.block_ids(),
            position: 0,
            slot: 0,
            pinned: None,
            fenced: None,
            done: false,
        }
    }

    /// Steps to the next active slot, pinning and unpinning blocks as the
    /// cursor moves. Returns `None` once the captured block list is
    /// exhausted; the scan is closed at that point.
    pub fn advance(&mut self, table: &mut Table) -> Option<SlotAddr> {
        if self.done {
            return None;
        }
        loop {
            let Some(&id) = self.blocks.get(self.position) else {
                self.finish(table);
                return None;
            };
            if !table.blocks.contains_key(&id) {
                // compacted away or emptied since capture
                self.position += 1;
                self.slot = 0;
                continue;
            }
            if self.pinned != Some(id) {
                table.pin_block(id);
                self.pinned = Some(id);
                if self.fenced == Some(id) {
                    self.fenced = None;
                }
            }
            let limit = table
                .blocks
                .get(&id)
                .map(|b| b.used_slot_limit())
                .unwrap_or(0);
            while self.slot < limit {
                let slot = self.slot;
                self.slot += 1;
                let active = table
                    .blocks
                    .get(&id)
                    .map(|b| b.slot_is_active(slot))
                    .unwrap_or(false);
                if active {
                    return Some(SlotAddr { block: id, slot });
                }
            }
            table.unpin_block(id);
            self.pinned = None;
            self.position += 1;
            self.slot = 0;
        }
    }

    /// Returns the current block to its partition mid-scan, fencing
    /// relocation to the slots already visited. The next `advance`
    /// re-pins it and lifts the fence.
    pub fn release_pin(&mut self, table: &mut Table) {
        if let Some(id) = self.pinned.take() {
            table.unpin_block_with_fence(id, self.slot);
            self.fenced = Some(id);
        }
    }

    /// Abandons the scan, releasing any pin and fence it still holds.
    pub fn close(&mut self, table: &mut Table) {
        self.finish(table);
    }

    fn finish(&mut self, table: &mut Table) {
        if let Some(id) = self.pinned.take() {
            table.unpin_block(id);
        }
        if let Some(id) = self.fenced.take() {
            table.clear_block_fence(id);
        }
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn pinned_block(&self) -> Option<BlockId> {
        self.pinned
    }
}
