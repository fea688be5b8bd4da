//! Raw NOR flash device contract.
//!
//! Generalized from the teacher crate's `Flash` trait: the teacher exposed
//! a page-erase abstraction with a single `PAGE_SIZE`; FlashFS needs a
//! byte-addressable read, a page-granular write, and a fixed 4 KiB erase
//! unit that is coarser than the read/write granule, plus a busy poll for
//! devices with asynchronous erase.

use core::fmt::Debug;

/// One flash erase unit, matching the Block Layer's erase block.
pub const ERASE_BLOCK_SIZE: usize = 4096;

/// Byte-addressable NOR flash with page-granular writes and block erase.
///
/// Implementors need not buffer anything; FlashFS's page cache sits above
/// this trait and is the only thing that amortizes repeated access.
pub trait Flash {
    /// Error type surfaced by the underlying device/bus.
    type Error: Debug;

    /// Total addressable capacity in bytes.
    fn capacity(&self) -> u32;

    /// Read `data.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, data: &mut [u8]) -> Result<(), Self::Error>;

    /// Write `data` at `addr`. The region must already be erased (all `0xFF`);
    /// flash can only clear bits (`1 -> 0`), never set them, without an erase.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erase one `ERASE_BLOCK_SIZE`-aligned block, setting it to all `0xFF`.
    fn erase_4k(&mut self, addr: u32) -> Result<(), Self::Error>;

    /// True while an asynchronous erase/write is still in flight.
    ///
    /// The default backend is synchronous, so the default always reports idle.
    fn busy(&mut self) -> bool {
        false
    }
}
