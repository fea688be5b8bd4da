//! Page Layer: maps logical file pages to physical pages within a block,
//! backed by a small write-back cache, with per-page CRC16 and
//! block-replacement when a block's physical slots are exhausted.
//!
//! Grounded on `original_source/src/sapphireos/ffs_page.c`/`.h`. The
//! cache is a fixed-size round-robin array (`PAGE_CACHE_SIZE`), matching
//! the original's small compile-time cache rather than a dynamically
//! sized one.

use crc::{crc16, Hasher16};
use log::{debug, trace};

use crate::config::{FFS_DATA_PAGES_PER_BLOCK, FFS_PAGES_PER_BLOCK, IO_ATTEMPTS, PAGE_CACHE_SIZE, PAGE_DATA_SIZE};
use crate::ffs::block::{BlockLayer, BlockMeta, INDEX_FREE};
use crate::flash::Flash;

/// One physical page's on-flash payload: `{length, data, crc16}`.
#[derive(Clone, Copy)]
pub struct Page {
    pub len: u8,
    pub data: [u8; PAGE_DATA_SIZE],
}

impl Page {
    pub fn empty() -> Self {
        Page { len: 0, data: [0u8; PAGE_DATA_SIZE] }
    }

    fn crc(&self) -> u16 {
        // length byte participates in the checksum so a truncated read
        // (length mismatch) is also caught, not just payload corruption.
        let mut digest = crc16::Digest::new(crc16::X25);
        digest.write(&[self.len]);
        digest.write(&self.data[..self.len as usize]);
        digest.sum16()
    }

    const WIRE_SIZE: usize = 1 + PAGE_DATA_SIZE + 2;

    fn to_bytes(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0] = self.len;
        out[1..1 + PAGE_DATA_SIZE].copy_from_slice(&self.data);
        let crc = self.crc();
        out[1 + PAGE_DATA_SIZE] = (crc & 0xFF) as u8;
        out[2 + PAGE_DATA_SIZE] = (crc >> 8) as u8;
        out
    }

    fn from_bytes(b: &[u8]) -> Option<Self> {
        let len = b[0];
        let mut data = [0u8; PAGE_DATA_SIZE];
        data.copy_from_slice(&b[1..1 + PAGE_DATA_SIZE]);
        let stored_crc = b[1 + PAGE_DATA_SIZE] as u16 | ((b[2 + PAGE_DATA_SIZE] as u16) << 8);
        let page = Page { len, data };
        if page.crc() == stored_crc {
            Some(page)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CacheKey {
    file_id: u8,
    logical_page: u16,
}

struct CacheEntry {
    key: Option<CacheKey>,
    page: Page,
    dirty: bool,
}

impl CacheEntry {
    const fn empty() -> Self {
        CacheEntry { key: None, page: Page { len: 0, data: [0u8; PAGE_DATA_SIZE] }, dirty: false }
    }
}

/// Page-level read/write cache sitting on top of the Block Layer.
pub struct PageLayer<F: Flash> {
    blocks: BlockLayer<F>,
    cache: [CacheEntry; PAGE_CACHE_SIZE],
    clock_hand: usize,
    flush_busy: bool,
}

impl<F: Flash> PageLayer<F> {
    pub fn new(blocks: BlockLayer<F>) -> Self {
        const EMPTY: CacheEntry = CacheEntry::empty();
        PageLayer { blocks, cache: [EMPTY; PAGE_CACHE_SIZE], clock_hand: 0, flush_busy: false }
    }

    pub fn blocks(&self) -> &BlockLayer<F> {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut BlockLayer<F> {
        &mut self.blocks
    }

    fn logical_block_index(logical_page: u16) -> (usize, u16) {
        (
            (logical_page as usize) / FFS_DATA_PAGES_PER_BLOCK,
            (logical_page as usize % FFS_DATA_PAGES_PER_BLOCK) as u16,
        )
    }

    fn find_cache_slot(&self, key: CacheKey) -> Option<usize> {
        self.cache.iter().position(|e| e.key == Some(key))
    }

    /// Read a logical page, consulting the cache first.
    pub fn read(&mut self, file_id: u8, logical_page: u16) -> Result<Page, F::Error> {
        let key = CacheKey { file_id, logical_page };
        if let Some(idx) = self.find_cache_slot(key) {
            return Ok(self.cache[idx].page);
        }

        let (block_idx, _) = Self::logical_block_index(logical_page);
        let file_blocks = self.blocks.file_blocks(file_id)?;
        let block = match file_blocks.get(block_idx) {
            Some(b) => b,
            None => return Ok(Page::empty()),
        };

        let page = self.load_from_block(block, logical_page)?;
        self.insert_cache(key, page, false);
        Ok(page)
    }

    /// Scan a block's index backward for the latest physical slot carrying
    /// `logical_page`'s in-block logical number, then read and verify it.
    fn load_from_block(&mut self, block: u16, logical_page: u16) -> Result<Page, F::Error> {
        let logical_in_block = (logical_page as usize % FFS_DATA_PAGES_PER_BLOCK) as u8;
        let index = self.blocks.read_index(block)?;

        let mut slot = None;
        for (i, &entry) in index.iter().enumerate().rev() {
            if entry == logical_in_block {
                slot = Some(i);
                break;
            }
        }

        let slot = match slot {
            Some(s) => s,
            None => return Ok(Page::empty()),
        };

        for attempt in 0..IO_ATTEMPTS {
            if let Some(page) = self.read_physical(block, slot)? {
                return Ok(page);
            }
            trace!("page read CRC fail block {} slot {} attempt {}", block, slot, attempt);
        }
        Ok(Page::empty())
    }

    fn physical_page_addr(&self, block: u16, slot: usize) -> u32 {
        let header = 2 * 8 + 2 * FFS_PAGES_PER_BLOCK; // meta x2 + index x2
        block as u32 * crate::flash::ERASE_BLOCK_SIZE as u32
            + header as u32
            + (slot * Page::WIRE_SIZE) as u32
    }

    fn read_physical(&mut self, block: u16, slot: usize) -> Result<Option<Page>, F::Error> {
        let addr = self.physical_page_addr(block, slot);
        let mut buf = [0u8; Page::WIRE_SIZE];
        self.blocks.flash_mut().read(addr, &mut buf)?;
        Ok(Page::from_bytes(&buf))
    }

    fn write_physical(&mut self, block: u16, slot: usize, page: &Page) -> Result<(), F::Error> {
        let addr = self.physical_page_addr(block, slot);
        self.blocks.flash_mut().write(addr, &page.to_bytes())
    }

    fn insert_cache(&mut self, key: CacheKey, page: Page, dirty: bool) {
        if let Some(idx) = self.find_cache_slot(key) {
            self.cache[idx].page = page;
            self.cache[idx].dirty |= dirty;
            return;
        }
        let idx = self.clock_hand;
        self.clock_hand = (self.clock_hand + 1) % PAGE_CACHE_SIZE;
        self.cache[idx] = CacheEntry { key: Some(key), page, dirty };
    }

    /// Patch `data` into a logical page at `offset`, extending file length
    /// as needed. If this write fills the page and the write is an append
    /// (offset + data lands exactly at `PAGE_DATA_SIZE`), flush immediately
    /// so appended pages commit to flash in ascending order.
    pub fn write(
        &mut self,
        file_id: u8,
        logical_page: u16,
        offset: usize,
        data: &[u8],
    ) -> Result<(), F::Error> {
        let key = CacheKey { file_id, logical_page };
        let mut page = if let Some(idx) = self.find_cache_slot(key) {
            self.cache[idx].page
        } else {
            self.read(file_id, logical_page)?
        };

        let end = offset + data.len();
        page.data[offset..end].copy_from_slice(data);
        if end > page.len as usize {
            page.len = end as u8;
        }

        self.insert_cache(key, page, true);

        if page.len as usize == PAGE_DATA_SIZE {
            self.flush_one(file_id, logical_page)?;
        }
        Ok(())
    }

    /// Flush one cached page: find (or make, via block replace) a free
    /// physical slot in the owning block and commit the page + index entry.
    pub fn flush_one(&mut self, file_id: u8, logical_page: u16) -> Result<(), F::Error> {
        let key = CacheKey { file_id, logical_page };
        let idx = match self.find_cache_slot(key) {
            Some(i) => i,
            None => return Ok(()),
        };
        if !self.cache[idx].dirty {
            return Ok(());
        }
        let page = self.cache[idx].page;

        let (block_pos, logical_in_block) = Self::logical_block_index(logical_page);
        let file_blocks = self.blocks.file_blocks(file_id)?;
        let mut block = match file_blocks.get(block_pos) {
            Some(b) => b,
            None => {
                // First write to this logical block: allocate fresh.
                let next_seq = file_blocks.len() as u8;
                match self.blocks.alloc_block(file_id, next_seq)? {
                    Some(b) => b,
                    None => return Ok(()), // out of space; caller sees stale cache, acceptable degraded mode
                }
            }
        };

        for attempt in 0..IO_ATTEMPTS {
            let index = self.blocks.read_index(block)?;
            match index.iter().position(|&e| e == INDEX_FREE) {
                Some(slot) => {
                    self.write_physical(block, slot, &page)?;
                    if self.blocks.set_index_entry(block, slot, logical_in_block as u8)? {
                        self.cache[idx].dirty = false;
                        debug!("flushed file {} page {} -> block {} slot {}", file_id, logical_page, block, slot);
                        return Ok(());
                    }
                }
                None => {
                    block = self.replace_block(file_id, block)?;
                }
            }
            trace!("flush retry {} for file {} page {}", attempt, file_id, logical_page);
        }
        Ok(())
    }

    /// Copy every logical page currently in `block` into a newly allocated
    /// block (bumping `sequence`), mark the old block dirty, and return the
    /// new block id.
    fn replace_block(&mut self, file_id: u8, old_block: u16) -> Result<u16, F::Error> {
        let old_meta = self.read_meta_or_default(old_block);
        let new_block = match self.blocks.alloc_block(file_id, old_meta.block_seq)? {
            Some(b) => b,
            None => return Ok(old_block), // out of space, nothing we can do
        };

        let index = self.blocks.read_index(old_block)?;
        let mut next_slot = 0usize;
        for &logical in index.iter() {
            if logical == INDEX_FREE {
                continue;
            }
            if let Some(page) = self.read_physical_logical(old_block, &index, logical)? {
                self.write_physical(new_block, next_slot, &page)?;
                self.blocks.set_index_entry(new_block, next_slot, logical)?;
                next_slot += 1;
            }
        }
        // bump sequence so duplicate-block_seq resolution favors the new copy
        let bumped = BlockMeta {
            file_id: old_meta.file_id,
            flags: old_meta.flags,
            block_seq: old_meta.block_seq,
            sequence: old_meta.sequence.wrapping_add(1),
        };
        self.blocks.write_meta(new_block, bumped)?;
        self.blocks.mark_dirty(old_block)?;
        Ok(new_block)
    }

    fn read_meta_or_default(&mut self, block: u16) -> BlockMeta {
        self.blocks.read_meta(block).unwrap_or(BlockMeta { file_id: 0, flags: 0, block_seq: 0, sequence: 0 })
    }

    fn read_physical_logical(&mut self, block: u16, index: &[u8], logical: u8) -> Result<Option<Page>, F::Error> {
        let slot = index.iter().enumerate().rev().find(|&(_, &e)| e == logical).map(|(i, _)| i);
        match slot {
            Some(s) => self.read_physical(block, s),
            None => Ok(None),
        }
    }

    /// Flush every dirty page belonging to `file_id`, in ascending logical
    /// order, guarded so only one flush runs at a time.
    pub fn flush_file(&mut self, file_id: u8) -> Result<(), F::Error> {
        if self.flush_busy {
            return Ok(());
        }
        self.flush_busy = true;

        let mut pending: heapless_u16_list::List = heapless_u16_list::List::new();
        for e in self.cache.iter() {
            if let Some(k) = e.key {
                if k.file_id == file_id && e.dirty {
                    pending.push(k.logical_page);
                }
            }
        }
        pending.sort();
        for lp in pending.iter() {
            self.flush_one(file_id, *lp)?;
        }

        self.flush_busy = false;
        Ok(())
    }

    /// Flush every dirty page in the cache, file by file, ascending.
    pub fn flush_all(&mut self) -> Result<(), F::Error> {
        let mut files: heapless_u8_list::List = heapless_u8_list::List::new();
        for e in self.cache.iter() {
            if let Some(k) = e.key {
                if e.dirty && !files.contains(k.file_id) {
                    files.push(k.file_id);
                }
            }
        }
        for f in files.iter() {
            self.flush_file(*f)?;
        }
        Ok(())
    }

    /// Walk the file's block list and mark every block dirty, dropping any
    /// cached pages for it.
    pub fn delete_file(&mut self, file_id: u8) -> Result<(), F::Error> {
        let blocks = self.blocks.file_blocks(file_id)?;
        for &b in blocks.iter() {
            self.blocks.mark_dirty(b)?;
        }
        for e in self.cache.iter_mut() {
            if e.key.map(|k| k.file_id) == Some(file_id) {
                e.key = None;
                e.dirty = false;
            }
        }
        Ok(())
    }
}

/// Minimal sortable fixed-capacity u16 list, used only for ordering a
/// flush batch.
mod heapless_u16_list {
    use crate::config::PAGE_CACHE_SIZE;

    pub struct List {
        items: [u16; PAGE_CACHE_SIZE],
        len: usize,
    }

    impl List {
        pub fn new() -> Self {
            List { items: [0; PAGE_CACHE_SIZE], len: 0 }
        }
        pub fn push(&mut self, v: u16) {
            if self.len < self.items.len() {
                self.items[self.len] = v;
                self.len += 1;
            }
        }
        pub fn sort(&mut self) {
            self.items[..self.len].sort_unstable();
        }
        pub fn iter(&self) -> impl Iterator<Item = &u16> {
            self.items[..self.len].iter()
        }
    }
}

mod heapless_u8_list {
    use crate::config::MAX_FILES;

    pub struct List {
        items: [u8; MAX_FILES],
        len: usize,
    }

    impl List {
        pub fn new() -> Self {
            List { items: [0; MAX_FILES], len: 0 }
        }
        pub fn push(&mut self, v: u8) {
            if self.len < self.items.len() {
                self.items[self.len] = v;
                self.len += 1;
            }
        }
        pub fn contains(&self, v: u8) -> bool {
            self.items[..self.len].contains(&v)
        }
        pub fn iter(&self) -> impl Iterator<Item = &u8> {
            self.items[..self.len].iter()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFlash;

    fn page_layer(blocks: usize) -> PageLayer<MockFlash> {
        let flash = MockFlash::new(blocks * crate::flash::ERASE_BLOCK_SIZE);
        let mut bl = BlockLayer::new(flash);
        bl.mount().unwrap();
        PageLayer::new(bl)
    }

    #[test]
    fn write_then_read_same_page() {
        let mut p = page_layer(4);
        p.write(0, 0, 0, b"world").unwrap();
        let page = p.read(0, 0).unwrap();
        assert_eq!(&page.data[..5], b"world");
        assert_eq!(page.len, 5);
    }

    #[test]
    fn filling_a_page_flushes_immediately() {
        let mut p = page_layer(4);
        let full = [0xABu8; PAGE_DATA_SIZE];
        p.write(1, 0, 0, &full).unwrap();
        // cache entry should no longer be dirty: it was flushed on fill.
        let key_dirty = p.cache.iter().any(|e| e.key.map(|k| k.file_id) == Some(1) && e.dirty);
        assert!(!key_dirty);
    }

    #[test]
    fn crc_mismatch_on_corrupted_page_yields_empty() {
        let page = Page { len: 2, data: { let mut d = [0u8; PAGE_DATA_SIZE]; d[0] = 9; d[1] = 9; d } };
        let mut bytes = page.to_bytes();
        bytes[1] ^= 0xFF; // corrupt payload without fixing crc
        assert!(Page::from_bytes(&bytes).is_none());
    }
}
