//! Block Layer: partitions flash into fixed erase blocks, tracks
//! free/dirty/valid classification, and writes dual-redundant metadata.
//!
//! Grounded on `original_source/src/sapphireos/ffs_block.c` and
//! `ffs_block.h`: monotonic one-way flags (`FREE -> VALID -> DIRTY`),
//! dual meta/index copies with bounded retry, and recovery-by-scan at
//! mount. The free/dirty/valid partition is kept as an in-RAM
//! classification table instead of the original's threaded linked
//! lists — same invariants (§8: "for all mounts, the set of block ids
//! equals the disjoint union of FREE, DIRTY, and VALID block lists"),
//! simpler in safe Rust.

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::config::{FFS_PAGES_PER_BLOCK, IO_ATTEMPTS, MAX_BLOCKS, MAX_FILES};
use crate::flash::{Flash, ERASE_BLOCK_SIZE};

bitflags! {
    /// Individual one-way bits within the block flags byte. Both are `1`
    /// (set) on an erased/free block; each transition clears exactly one
    /// bit and is never reversed without a full block erase.
    pub struct BlockFlagBit: u8 {
        /// Cleared once the block's meta/index have been finalized.
        const VALID = 0x40;
        /// Cleared once the block has been logically deleted.
        const DIRTY = 0x80;
    }
}

const FLAGS_FREE: u8 = 0xFF;

fn flags_is_free(flags: u8) -> bool {
    flags == FLAGS_FREE
}

fn flags_is_valid(flags: u8) -> bool {
    !flags_is_free(flags) && flags & BlockFlagBit::VALID.bits() == 0
}

fn flags_is_dirty(flags: u8) -> bool {
    flags & BlockFlagBit::DIRTY.bits() == 0
}

fn flags_mark_valid(flags: u8) -> u8 {
    flags & !BlockFlagBit::VALID.bits()
}

fn flags_mark_dirty(flags: u8) -> u8 {
    flags & !BlockFlagBit::DIRTY.bits()
}

/// Meta record stored twice per block. `reserved` pads the on-flash
/// record to 8 bytes, matching `ffs_block_meta_t`'s packed+aligned(4) layout.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BlockMeta {
    pub file_id: u8,
    pub flags: u8,
    pub block_seq: u8,
    pub sequence: u8,
}

const META_SIZE: usize = 8;

impl BlockMeta {
    fn to_bytes(self) -> [u8; META_SIZE] {
        [self.file_id, self.flags, self.block_seq, self.sequence, 0, 0, 0, 0]
    }

    fn from_bytes(b: &[u8; META_SIZE]) -> Self {
        BlockMeta { file_id: b[0], flags: b[1], block_seq: b[2], sequence: b[3] }
    }

    pub fn is_free(&self) -> bool {
        flags_is_free(self.flags)
    }

    pub fn is_valid(&self) -> bool {
        flags_is_valid(self.flags)
    }

    pub fn is_dirty(&self) -> bool {
        flags_is_dirty(self.flags)
    }

    fn is_sane(&self, total_blocks: u16) -> bool {
        (self.file_id as usize) < MAX_FILES && (self.block_seq as u16) < total_blocks
    }
}

/// Per-block index: physical slot -> logical page number (`0xFF` = free slot).
pub type BlockIndex = [u8; FFS_PAGES_PER_BLOCK];

pub const INDEX_FREE: u8 = 0xFF;

const HEADER_SIZE: usize = 2 * META_SIZE + 2 * FFS_PAGES_PER_BLOCK;

/// In-RAM classification of one block, rebuilt at mount by scanning flash.
#[derive(Clone, Copy, Debug, PartialEq)]
enum BlockState {
    Free,
    Dirty,
    /// Valid block; caches the authoritative meta so repeated lookups
    /// don't have to re-read flash.
    Valid(BlockMeta),
    /// Could not be classified after retries; treated like dirty for
    /// allocation purposes but is reported separately to mount() callers.
    Invalid,
}

/// Signed-distance compare of two monotonic 8-bit sequence counters.
/// `a` is considered newer than `b` if advancing `b` by up to 127 steps
/// reaches `a` before wrapping past it.
pub fn sequence_is_newer(a: u8, b: u8) -> bool {
    (a.wrapping_sub(b) as i8) > 0
}

pub struct BlockLayer<F: Flash> {
    flash: F,
    total_blocks: u16,
    states: [BlockState; MAX_BLOCKS],
    hard_errors: u32,
    warning: bool,
}

impl<F: Flash> BlockLayer<F> {
    /// Wrap a flash device that has already been formatted (or is being
    /// mounted for the first time with `mount`).
    pub fn new(flash: F) -> Self {
        let total_blocks = (flash.capacity() as usize / ERASE_BLOCK_SIZE).min(MAX_BLOCKS) as u16;
        BlockLayer {
            flash,
            total_blocks,
            states: [BlockState::Free; MAX_BLOCKS],
            hard_errors: 0,
            warning: false,
        }
    }

    pub fn total_blocks(&self) -> u16 {
        self.total_blocks
    }

    pub fn hard_error_count(&self) -> u32 {
        self.hard_errors
    }

    pub fn has_warning(&self) -> bool {
        self.warning
    }

    fn block_addr(&self, block: u16) -> u32 {
        block as u32 * ERASE_BLOCK_SIZE as u32
    }

    /// Scan every block exactly once, classifying each as FREE, DIRTY, or
    /// VALID. Unreadable "valid-looking" blocks are demoted to DIRTY.
    pub fn mount(&mut self) -> Result<(), F::Error> {
        for block in 0..self.total_blocks {
            let raw = self.read_raw_flags(block)?;

            let state = if flags_is_free(raw) {
                BlockState::Free
            } else if flags_is_dirty(raw) {
                BlockState::Dirty
            } else {
                match self.read_meta(block) {
                    Ok(meta) if meta.is_sane(self.total_blocks) => BlockState::Valid(meta),
                    _ => {
                        warn!("block {} unreadable at mount, demoting to dirty", block);
                        BlockState::Dirty
                    }
                }
            };

            trace!("mount: block {} -> {:?}", block, state);
            self.states[block as usize] = state;
        }
        Ok(())
    }

    /// Byte-verify every FREE block is actually all-`0xFF`; anything else
    /// is moved to the dirty list. Intended to be called a few blocks at a
    /// time from a cooperative background task (`FREE_VERIFY_BLOCKS_PER_STEP`).
    pub fn verify_free_space(&mut self, start: u16, count: u16) -> Result<(), F::Error> {
        let mut buf = [0u8; 64];
        for block in start..(start + count).min(self.total_blocks) {
            if !matches!(self.states[block as usize], BlockState::Free) {
                continue;
            }
            let mut ok = true;
            let base = self.block_addr(block);
            let mut offset = 0u32;
            while offset < ERASE_BLOCK_SIZE as u32 {
                let n = buf.len().min((ERASE_BLOCK_SIZE as u32 - offset) as usize);
                self.flash.read(base + offset, &mut buf[..n])?;
                if buf[..n].iter().any(|&b| b != 0xFF) {
                    ok = false;
                    break;
                }
                offset += n as u32;
            }
            if !ok {
                warn!("free block {} not actually erased, marking dirty", block);
                self.states[block as usize] = BlockState::Dirty;
            }
        }
        Ok(())
    }

    fn read_raw_flags(&mut self, block: u16) -> Result<u8, F::Error> {
        let mut b = [0u8; 1];
        self.flash.read(self.block_addr(block) + 1, &mut b)?;
        Ok(b[0])
    }

    /// Read both meta copies; on bit-mismatch or insane fields, retry up to
    /// `IO_ATTEMPTS` times, then count a hard error and report the block as
    /// unreadable (DIRTY) rather than fail the whole mount.
    pub fn read_meta(&mut self, block: u16) -> Result<BlockMeta, F::Error> {
        let base = self.block_addr(block);
        for attempt in 0..IO_ATTEMPTS {
            let mut m0 = [0u8; META_SIZE];
            let mut m1 = [0u8; META_SIZE];
            self.flash.read(base, &mut m0)?;
            self.flash.read(base + META_SIZE as u32, &mut m1)?;
            if m0 == m1 {
                let meta = BlockMeta::from_bytes(&m0);
                if meta.is_sane(self.total_blocks) || meta.is_free() || meta.is_dirty() {
                    return Ok(meta);
                }
            }
            trace!("read_meta({}) mismatch, attempt {}", block, attempt);
        }
        self.soft_error();
        self.hard_error();
        self.states[block as usize] = BlockState::Invalid;
        Ok(BlockMeta { file_id: 0xFF, flags: flags_mark_dirty(FLAGS_FREE), block_seq: 0xFF, sequence: 0 })
    }

    /// Read both index copies (byte comparison, last write wins on retry).
    pub fn read_index(&mut self, block: u16) -> Result<BlockIndex, F::Error> {
        let base = self.block_addr(block) + (2 * META_SIZE) as u32;
        for attempt in 0..IO_ATTEMPTS {
            let mut i0 = [0u8; FFS_PAGES_PER_BLOCK];
            let mut i1 = [0u8; FFS_PAGES_PER_BLOCK];
            self.flash.read(base, &mut i0)?;
            self.flash.read(base + FFS_PAGES_PER_BLOCK as u32, &mut i1)?;
            if i0 == i1 {
                return Ok(i0);
            }
            trace!("read_index({}) mismatch, attempt {}", block, attempt);
        }
        self.soft_error();
        self.hard_error();
        // Caller treats a hard-errored index as "nothing allocated yet".
        Ok([INDEX_FREE; FFS_PAGES_PER_BLOCK])
    }

    /// Single-byte write into both index copies; read back and verify.
    pub fn set_index_entry(&mut self, block: u16, slot: usize, logical: u8) -> Result<bool, F::Error> {
        let base = self.block_addr(block) + (2 * META_SIZE) as u32;
        let a0 = base + slot as u32;
        let a1 = base + FFS_PAGES_PER_BLOCK as u32 + slot as u32;
        self.flash.write(a0, &[logical])?;
        self.flash.write(a1, &[logical])?;

        let mut r0 = [0u8; 1];
        let mut r1 = [0u8; 1];
        self.flash.read(a0, &mut r0)?;
        self.flash.read(a1, &mut r1)?;
        let ok = r0[0] == logical || r1[0] == logical;
        if !ok {
            self.soft_error();
        }
        Ok(ok)
    }

    /// Write a fresh meta record (both copies) for a block taken from the
    /// free list, transitioning it to VALID.
    pub fn write_meta(&mut self, block: u16, meta: BlockMeta) -> Result<(), F::Error> {
        let base = self.block_addr(block);
        let bytes = meta.to_bytes();
        self.flash.write(base, &bytes)?;
        self.flash.write(base + META_SIZE as u32, &bytes)?;
        self.states[block as usize] = if meta.is_valid() {
            BlockState::Valid(meta)
        } else if meta.is_dirty() {
            BlockState::Dirty
        } else {
            BlockState::Free
        };
        Ok(())
    }

    /// Allocate a free block and finalize it VALID for `file_id`/`block_seq`
    /// in one step (writes meta, returns the block id).
    pub fn alloc_block(&mut self, file_id: u8, block_seq: u8) -> Result<Option<u16>, F::Error> {
        let free = (0..self.total_blocks).find(|&b| matches!(self.states[b as usize], BlockState::Free));
        let block = match free {
            Some(b) => b,
            None => return Ok(None),
        };
        let meta = BlockMeta { file_id, flags: flags_mark_valid(FLAGS_FREE), block_seq, sequence: 0 };
        self.write_meta(block, meta)?;
        debug!("alloc_block -> {} (file {}, seq {})", block, file_id, block_seq);
        Ok(Some(block))
    }

    /// Flip the DIRTY bit in both meta copies. At least one copy must read
    /// back correctly or the block is left unreadable and a hard error
    /// counted (never silently dropped to FREE without an erase).
    pub fn mark_dirty(&mut self, block: u16) -> Result<(), F::Error> {
        let current_flags = match self.states[block as usize] {
            BlockState::Valid(m) => m.flags,
            BlockState::Invalid => FLAGS_FREE,
            _ => return Ok(()),
        };
        let new_flags = flags_mark_dirty(current_flags);
        let base = self.block_addr(block) + 1;
        self.flash.write(base, &[new_flags])?;
        self.flash.write(base + META_SIZE as u32, &[new_flags])?;

        let mut r0 = [0u8; 1];
        let mut r1 = [0u8; 1];
        self.flash.read(base, &mut r0)?;
        self.flash.read(base + META_SIZE as u32, &mut r1)?;
        if r0[0] != new_flags && r1[0] != new_flags {
            self.hard_error();
            self.states[block as usize] = BlockState::Invalid;
        } else {
            self.states[block as usize] = BlockState::Dirty;
        }
        debug!("mark_dirty({})", block);
        Ok(())
    }

    /// Erase the block, drop any cached index, and return it to FREE.
    pub fn erase(&mut self, block: u16) -> Result<(), F::Error> {
        self.flash.erase_4k(self.block_addr(block))?;
        while self.flash.busy() {}
        self.states[block as usize] = BlockState::Free;
        debug!("erase({}) -> free", block);
        Ok(())
    }

    /// All blocks currently classified VALID with their meta.
    pub fn valid_blocks(&self) -> impl Iterator<Item = (u16, BlockMeta)> + '_ {
        self.states.iter().take(self.total_blocks as usize).enumerate().filter_map(|(i, s)| match s {
            BlockState::Valid(m) => Some((i as u16, *m)),
            _ => None,
        })
    }

    /// Valid blocks belonging to one file, ordered by `block_seq`.
    /// Duplicate `block_seq` values are resolved in favor of the
    /// block with the numerically newer `sequence` (signed-distance
    /// compare); the loser is marked dirty.
    pub fn file_blocks(&mut self, file_id: u8) -> Result<heapless_list::List, F::Error> {
        let mut slots: [Option<(u16, BlockMeta)>; MAX_BLOCKS] = [None; MAX_BLOCKS];
        let mut max_seq = 0usize;
        let candidates: heapless_list::List = {
            let mut l = heapless_list::List::new();
            for (block, meta) in self.valid_blocks() {
                if meta.file_id == file_id {
                    l.push(block);
                }
            }
            l
        };
        for &block in candidates.iter() {
            let meta = match self.states[block as usize] {
                BlockState::Valid(m) => m,
                _ => continue,
            };
            let seq = meta.block_seq as usize;
            max_seq = max_seq.max(seq);
            match slots[seq] {
                None => slots[seq] = Some((block, meta)),
                Some((old_block, old_meta)) => {
                    if sequence_is_newer(meta.sequence, old_meta.sequence) {
                        self.mark_dirty(old_block)?;
                        slots[seq] = Some((block, meta));
                    } else {
                        self.mark_dirty(block)?;
                    }
                }
            }
        }

        // A gap in block_seq deletes the file entirely.
        let mut out = heapless_list::List::new();
        let mut any = false;
        for seq in 0..=max_seq {
            match slots[seq] {
                Some((block, _)) => {
                    out.push(block);
                    any = true;
                }
                None => {
                    if any {
                        // gap found: file is corrupt, drop everything collected.
                        for b in out.iter() {
                            self.mark_dirty(*b)?;
                        }
                        return Ok(heapless_list::List::new());
                    }
                }
            }
        }
        Ok(out)
    }

    fn soft_error(&mut self) {
        trace!("flash soft error");
    }

    fn hard_error(&mut self) {
        self.hard_errors += 1;
        self.warning = true;
        warn!("flash hard error, count={}", self.hard_errors);
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }
}

/// A tiny fixed-capacity ordered list, avoiding an `alloc` dependency for
/// the handful of block ids one file can span.
pub mod heapless_list {
    use crate::config::MAX_BLOCKS;

    pub struct List {
        items: [u16; MAX_BLOCKS],
        len: usize,
    }

    impl List {
        pub fn new() -> Self {
            List { items: [0; MAX_BLOCKS], len: 0 }
        }

        pub fn push(&mut self, v: u16) {
            if self.len < self.items.len() {
                self.items[self.len] = v;
                self.len += 1;
            }
        }

        pub fn iter(&self) -> impl Iterator<Item = &u16> {
            self.items[..self.len].iter()
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn get(&self, i: usize) -> Option<u16> {
            self.items.get(i).copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFlash;

    fn layer(total_blocks: usize) -> BlockLayer<MockFlash> {
        let flash = MockFlash::new(total_blocks * ERASE_BLOCK_SIZE);
        BlockLayer::new(flash)
    }

    #[test]
    fn fresh_device_is_all_free() {
        let mut l = layer(4);
        l.mount().unwrap();
        assert_eq!(l.valid_blocks().count(), 0);
        assert!(l.alloc_block(0, 0).unwrap().is_some());
    }

    #[test]
    fn alloc_mark_dirty_erase_round_trip() {
        let mut l = layer(4);
        l.mount().unwrap();
        let block = l.alloc_block(3, 0).unwrap().unwrap();
        assert_eq!(l.valid_blocks().count(), 1);
        l.mark_dirty(block).unwrap();
        assert_eq!(l.valid_blocks().count(), 0);
        l.erase(block).unwrap();
        let again = l.alloc_block(5, 0).unwrap().unwrap();
        assert_eq!(again, block);
    }

    #[test]
    fn sequence_compare_handles_wrap() {
        assert!(sequence_is_newer(1, 0));
        assert!(sequence_is_newer(0, 255));
        assert!(!sequence_is_newer(0, 1));
    }

    #[test]
    fn file_blocks_orders_by_seq_and_drops_duplicates() {
        let mut l = layer(4);
        l.mount().unwrap();
        let b0 = l.alloc_block(1, 0).unwrap().unwrap();
        let b1 = l.alloc_block(1, 1).unwrap().unwrap();
        let list = l.file_blocks(1).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(0), Some(b0));
        assert_eq!(list.get(1), Some(b1));
    }
}
