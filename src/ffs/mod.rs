//! FlashFS facade: the log-structured, power-fail-safe filesystem over
//! raw NOR flash described in spec.md §2-§4.
//!
//! Composes the Block, Page, and File layers (leaves first, per spec.md
//! §2's dependency order) behind one `Ffs` type, plus `format`/`mount`
//! entry points grounded on `original_source/src/sapphireos/flash_fs.c`.

pub mod block;
pub mod file;
pub mod page;

use log::info;

use crate::config::{FFS_BOARD_TYPE_UNSET, FFS_VERSION, FIRMWARE_0_FILE_ID, FIRMWARE_1_FILE_ID};
use crate::error::FfsError;
use crate::flash::{Flash, ERASE_BLOCK_SIZE};
use block::BlockLayer;
use file::FileLayer;
use page::PageLayer;

/// Top level FlashFS handle.
pub struct Ffs<F: Flash> {
    files: FileLayer<F>,
}

impl<F: Flash> Ffs<F> {
    /// Erase the whole device, write the two-byte FFS header (version +
    /// unset board type), and reserve the two firmware partitions. Per
    /// spec.md scenario 1, free space after format equals
    /// `total_blocks * BLOCK_DATA_SIZE` minus the reserved partitions, and
    /// the file count is exactly 2 (the firmware partitions).
    pub fn format(mut flash: F, firmware_partition_blocks: u16) -> Result<Self, FfsError<F::Error>> {
        let total_blocks = flash.capacity() / ERASE_BLOCK_SIZE as u32;
        for b in 0..total_blocks {
            flash.erase_4k(b * ERASE_BLOCK_SIZE as u32)?;
        }
        flash.write(0, &[FFS_VERSION, FFS_BOARD_TYPE_UNSET])?;

        let fw_bytes = firmware_partition_blocks as u32 * ERASE_BLOCK_SIZE as u32;
        let fw0 = (0u32, fw_bytes);
        let fw1 = (fw_bytes, fw_bytes * 2);

        let mut block_layer = BlockLayer::new(flash);
        block_layer.mount()?;
        let pages = PageLayer::new(block_layer);
        let mut files = FileLayer::new(pages, [fw0, fw1]);
        files.create(FIRMWARE_0_FILE_ID, "firmware0")?;
        files.create(FIRMWARE_1_FILE_ID, "firmware1")?;
        info!("ffs formatted: {} blocks, {} reserved for firmware", total_blocks, firmware_partition_blocks * 2);
        Ok(Ffs { files })
    }

    /// Mount an already-formatted device: validate the FFS header, scan
    /// every block to rebuild the free/dirty/valid classification, and
    /// recompute each file's block list.
    pub fn mount(mut flash: F, firmware_partition_blocks: u16) -> Result<Self, FfsError<F::Error>> {
        let mut header = [0u8; 2];
        flash.read(0, &mut header)?;
        if header[0] != FFS_VERSION {
            return Err(FfsError::HardError);
        }

        let fw_bytes = firmware_partition_blocks as u32 * ERASE_BLOCK_SIZE as u32;
        let fw0 = (0u32, fw_bytes);
        let fw1 = (fw_bytes, fw_bytes * 2);

        let mut block_layer = BlockLayer::new(flash);
        block_layer.mount()?;
        let pages = PageLayer::new(block_layer);
        let files = FileLayer::new(pages, [fw0, fw1]);
        Ok(Ffs { files })
    }

    pub fn create(&mut self, file_id: u8, name: &str) -> Result<(), FfsError<F::Error>> {
        self.files.create(file_id, name)
    }

    pub fn delete(&mut self, file_id: u8) -> Result<(), FfsError<F::Error>> {
        self.files.delete(file_id)
    }

    pub fn write(&mut self, file_id: u8, offset: u32, data: &[u8]) -> Result<(), FfsError<F::Error>> {
        self.files.write(file_id, offset, data)
    }

    pub fn append(&mut self, file_id: u8, data: &[u8]) -> Result<(), FfsError<F::Error>> {
        self.files.append(file_id, data)
    }

    pub fn read(&mut self, file_id: u8, offset: u32, buf: &mut [u8]) -> Result<usize, FfsError<F::Error>> {
        self.files.read(file_id, offset, buf)
    }

    pub fn file_size(&mut self, file_id: u8) -> Result<u32, FfsError<F::Error>> {
        self.files.size(file_id)
    }

    /// Close out any pending cache writes; call before power-down.
    pub fn sync(&mut self) -> Result<(), FfsError<F::Error>> {
        self.files.pages_mut().flush_all()?;
        Ok(())
    }

    /// Background byte-verification of the free list, a few blocks at a time.
    pub fn verify_free_space_step(&mut self, start: u16, count: u16) -> Result<(), FfsError<F::Error>> {
        self.files.pages_mut().blocks_mut().verify_free_space(start, count)?;
        Ok(())
    }

    /// Total bytes of free space across all blocks not owned by a file.
    pub fn free_space(&self) -> u32 {
        let blocks = self.files.pages().blocks();
        let free_blocks = blocks.total_blocks() as u32
            - blocks.valid_blocks().count() as u32
            - 0; // dirty blocks still occupy physical space until erased
        free_blocks * crate::config::FFS_DATA_PAGES_PER_BLOCK as u32 * crate::config::PAGE_DATA_SIZE as u32
    }

    /// Number of distinct files with at least one valid block (firmware
    /// partitions are counted by convention even though they bypass the
    /// block layer, matching spec.md scenario 1's "file_count == 2" on a
    /// fresh format).
    pub fn file_count(&self) -> u32 {
        let blocks = self.files.pages().blocks();
        let mut seen = [false; crate::config::MAX_FILES];
        let mut count = 0u32;
        for (_, meta) in blocks.valid_blocks() {
            let id = meta.file_id as usize;
            if id < seen.len() && !seen[id] {
                seen[id] = true;
                count += 1;
            }
        }
        count + 2 // the two firmware partitions, tracked outside the block layer
    }

    pub fn hard_error_count(&self) -> u32 {
        self.files.pages().blocks().hard_error_count()
    }

    pub fn has_hard_error_warning(&self) -> bool {
        self.files.pages().blocks().has_warning()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFlash;

    fn device(blocks: usize) -> MockFlash {
        MockFlash::new(blocks * ERASE_BLOCK_SIZE)
    }

    #[test]
    fn fresh_format_reports_two_files() {
        let ffs = Ffs::format(device(8), 1).unwrap();
        assert_eq!(ffs.file_count(), 2);
    }

    #[test]
    fn tiny_file_round_trip() {
        let flash = device(8);
        let mut ffs = Ffs::format(flash, 1).unwrap();
        ffs.create(5, "hello").unwrap();
        ffs.write(5, 0, b"world").unwrap();
        ffs.sync().unwrap();
        assert_eq!(ffs.file_size(5).unwrap(), 5);

        let mut buf = [0u8; 5];
        ffs.read(5, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
    }
}
