//! File Layer: named files addressed sequentially by offset, plus the
//! two reserved firmware partitions which bypass the page layer entirely.
//!
//! Grounded on `original_source/src/sapphireos/ffs_fw.c` (firmware
//! partitions as raw contiguous regions, chunked background erase,
//! partition 1 read-only) and the page-layer file-size accounting
//! described in spec.md §3.

use log::debug;

use crate::config::{
    FFS_FILE_DATA_START_PAGE, FFS_FILE_META_PAGE, FILENAME_LEN,
    FIRMWARE_0_FILE_ID, FIRMWARE_1_FILE_ID, FIRMWARE_ERASE_BLOCKS_PER_TICK, PAGE_DATA_SIZE,
};
use crate::error::FfsError;
use crate::ffs::page::PageLayer;
use crate::flash::{Flash, ERASE_BLOCK_SIZE};

/// Page 0 of every file: the filename metadata record.
#[derive(Clone, Copy)]
pub struct FileMeta0 {
    pub filename: [u8; FILENAME_LEN],
}

impl FileMeta0 {
    pub fn named(name: &str) -> Self {
        let mut filename = [0u8; FILENAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(FILENAME_LEN);
        filename[..n].copy_from_slice(&bytes[..n]);
        FileMeta0 { filename }
    }

    pub fn name_str(&self) -> &str {
        let end = self.filename.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
        core::str::from_utf8(&self.filename[..end]).unwrap_or("")
    }
}

fn is_firmware_partition(file_id: u8) -> bool {
    file_id == FIRMWARE_0_FILE_ID || file_id == FIRMWARE_1_FILE_ID
}

/// Sequential file handle: current read/write offset plus the file id it
/// addresses. Firmware partitions are recognized by id and dispatched to
/// the raw-partition path instead of the page layer.
pub struct FileLayer<F: Flash> {
    pages: PageLayer<F>,
    /// Raw byte range reserved for each firmware partition, set at format time.
    firmware_regions: [(u32, u32); 2],
}

impl<F: Flash> FileLayer<F> {
    pub fn new(pages: PageLayer<F>, firmware_regions: [(u32, u32); 2]) -> Self {
        FileLayer { pages, firmware_regions }
    }

    pub fn pages(&self) -> &PageLayer<F> {
        &self.pages
    }

    pub fn pages_mut(&mut self) -> &mut PageLayer<F> {
        &mut self.pages
    }

    /// Create a new file, writing its name into the reserved meta page.
    pub fn create(&mut self, file_id: u8, name: &str) -> Result<(), FfsError<F::Error>> {
        if is_firmware_partition(file_id) {
            return Err(FfsError::InvalidForFirmwarePartition);
        }
        let meta = FileMeta0::named(name);
        self.pages.write(file_id, FFS_FILE_META_PAGE, 0, &meta.filename)?;
        self.pages.flush_one(file_id, FFS_FILE_META_PAGE)?;
        debug!("create file {} = {:?}", file_id, name);
        Ok(())
    }

    pub fn delete(&mut self, file_id: u8) -> Result<(), FfsError<F::Error>> {
        if is_firmware_partition(file_id) {
            return Err(FfsError::InvalidForFirmwarePartition);
        }
        self.pages.delete_file(file_id)?;
        Ok(())
    }

    fn data_page_for_offset(offset: u32) -> (u16, usize) {
        let page = (offset as usize) / PAGE_DATA_SIZE;
        let in_page = (offset as usize) % PAGE_DATA_SIZE;
        (FFS_FILE_DATA_START_PAGE + page as u16, in_page)
    }

    /// File size: (page count - 2 reserved pages) * PAGE_DATA_SIZE, plus
    /// the length of the last partially-filled data page.
    pub fn size(&mut self, file_id: u8) -> Result<u32, FfsError<F::Error>> {
        if is_firmware_partition(file_id) {
            let (start, end) = self.firmware_regions[file_id as usize];
            return Ok(end - start);
        }
        let blocks = self.pages.blocks_mut().file_blocks(file_id)?;
        if blocks.is_empty() {
            return Ok(0);
        }
        let mut logical_page = FFS_FILE_DATA_START_PAGE;
        let mut last_len = 0usize;
        let mut full_pages = 0u32;
        loop {
            let page = self.pages.read(file_id, logical_page)?;
            if page.len == 0 && logical_page > FFS_FILE_DATA_START_PAGE {
                break;
            }
            if (page.len as usize) < PAGE_DATA_SIZE {
                last_len = page.len as usize;
                break;
            }
            full_pages += 1;
            logical_page += 1;
            if logical_page as usize > blocks.len() * crate::config::FFS_DATA_PAGES_PER_BLOCK + 4 {
                break; // safety bound, avoids an infinite scan on a corrupt index
            }
        }
        Ok(full_pages * PAGE_DATA_SIZE as u32 + last_len as u32)
    }

    /// Write `data` at `offset` in `file_id`. Firmware partitions go
    /// straight to flash; user files go through the page layer.
    pub fn write(&mut self, file_id: u8, offset: u32, data: &[u8]) -> Result<(), FfsError<F::Error>> {
        if is_firmware_partition(file_id) {
            let (start, end) = self.firmware_regions[file_id as usize];
            if start + offset + data.len() as u32 > end {
                return Err(FfsError::OutOfBounds);
            }
            self.pages.blocks_mut().flash_mut().write(start + offset, data)?;
            return Ok(());
        }

        let mut written = 0usize;
        while written < data.len() {
            let (page, in_page) = Self::data_page_for_offset(offset + written as u32);
            let chunk = (PAGE_DATA_SIZE - in_page).min(data.len() - written);
            self.pages.write(file_id, page, in_page, &data[written..written + chunk])?;
            written += chunk;
        }
        Ok(())
    }

    /// Append to the end of the file (convenience wrapper matching the
    /// "opened for write appends at end" contract in spec.md §4.3).
    pub fn append(&mut self, file_id: u8, data: &[u8]) -> Result<(), FfsError<F::Error>> {
        let size = self.size(file_id)?;
        self.write(file_id, size, data)
    }

    pub fn read(&mut self, file_id: u8, offset: u32, buf: &mut [u8]) -> Result<usize, FfsError<F::Error>> {
        if is_firmware_partition(file_id) {
            let (start, end) = self.firmware_regions[file_id as usize];
            let n = buf.len().min((end - start - offset) as usize);
            self.pages.blocks_mut().flash_mut().read(start + offset, &mut buf[..n])?;
            return Ok(n);
        }

        let size = self.size(file_id)?;
        if offset >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - offset) as usize);
        let mut read = 0usize;
        while read < n {
            let (page_id, in_page) = Self::data_page_for_offset(offset + read as u32);
            let page = self.pages.read(file_id, page_id)?;
            let avail = (page.len as usize).saturating_sub(in_page);
            let chunk = avail.min(n - read);
            if chunk == 0 {
                break;
            }
            buf[read..read + chunk].copy_from_slice(&page.data[in_page..in_page + chunk]);
            read += chunk;
        }
        Ok(read)
    }

    /// Erase a firmware partition a few blocks at a time, so the caller's
    /// cooperative scheduler can interleave other work. Partition 1 is
    /// treated read-only: erase is accepted but performs no flash I/O
    /// (resolves spec.md §9's open question the same way the original
    /// firmware's early-return did).
    pub fn erase_firmware_step(&mut self, file_id: u8) -> Result<usize, FfsError<F::Error>> {
        if file_id == FIRMWARE_1_FILE_ID {
            return Ok(0);
        }
        if file_id != FIRMWARE_0_FILE_ID {
            return Err(FfsError::InvalidForFirmwarePartition);
        }
        let (start, end) = self.firmware_regions[file_id as usize];
        let mut erased = 0usize;
        let mut addr = start;
        while addr < end && erased < FIRMWARE_ERASE_BLOCKS_PER_TICK {
            self.pages.blocks_mut().flash_mut().erase_4k(addr)?;
            addr += ERASE_BLOCK_SIZE as u32;
            erased += 1;
        }
        Ok(erased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffs::block::BlockLayer;
    use crate::mock::MockFlash;

    fn files(blocks: usize) -> FileLayer<MockFlash> {
        let flash = MockFlash::new(blocks * ERASE_BLOCK_SIZE);
        let mut bl = BlockLayer::new(flash);
        bl.mount().unwrap();
        let pages = PageLayer::new(bl);
        FileLayer::new(pages, [(0, 0), (0, 0)])
    }

    #[test]
    fn create_write_read_round_trip() {
        let mut f = files(8);
        f.create(2, "hello").unwrap();
        f.write(2, 0, b"world").unwrap();
        let mut buf = [0u8; 5];
        let n = f.read(2, 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");
        assert_eq!(f.size(2).unwrap(), 5);
    }

    #[test]
    fn append_wraps_to_next_page() {
        let mut f = files(8);
        f.create(3, "f").unwrap();
        let chunk = [0x11u8; PAGE_DATA_SIZE];
        f.append(3, &chunk).unwrap();
        f.append(3, &[0x22]).unwrap();
        assert_eq!(f.size(3).unwrap(), PAGE_DATA_SIZE as u32 + 1);
        let mut buf = [0u8; PAGE_DATA_SIZE + 1];
        f.read(3, 0, &mut buf).unwrap();
        assert_eq!(buf[PAGE_DATA_SIZE], 0x22);
    }

    #[test]
    fn firmware_partition_bypasses_page_layer() {
        let mut f = files(8);
        f.firmware_regions[0] = (0, ERASE_BLOCK_SIZE as u32 * 2);
        f.write(FIRMWARE_0_FILE_ID, 0, b"boot").unwrap();
        let mut buf = [0u8; 4];
        f.read(FIRMWARE_0_FILE_ID, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"boot");
    }

    #[test]
    fn firmware_1_erase_is_a_no_op() {
        let mut f = files(8);
        f.firmware_regions[1] = (ERASE_BLOCK_SIZE as u32, ERASE_BLOCK_SIZE as u32 * 3);
        let erased = f.erase_firmware_step(FIRMWARE_1_FILE_ID).unwrap();
        assert_eq!(erased, 0);
    }
}
