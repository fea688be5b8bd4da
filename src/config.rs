//! Compile-time constants shared by the FlashFS and FX-VM subsystems.
//!
//! Mirrors the way `ffs_global.h` / `vm_core.h` centralize board and
//! image-format constants in the original firmware instead of scattering
//! magic numbers through the call sites.

/// Bytes of payload carried by one physical flash page.
pub const PAGE_DATA_SIZE: usize = 128;

/// Upper bound on the number of blocks a single device image may have.
/// Block state is held in a fixed-size table sized to this constant.
pub const MAX_BLOCKS: usize = 256;

/// Logical data pages stored per erase block (the rest is spares + index).
pub const FFS_DATA_PAGES_PER_BLOCK: usize = 14;

/// Spare physical slots per block, used to absorb rewrites without a block replace.
pub const FFS_SPARE_PAGES_PER_BLOCK: usize = 2;

/// Total physical page slots per block.
pub const FFS_PAGES_PER_BLOCK: usize = FFS_DATA_PAGES_PER_BLOCK + FFS_SPARE_PAGES_PER_BLOCK;

/// Reserved page holding the file's name/type metadata.
pub const FFS_FILE_META_PAGE: u16 = 0;
/// Reserved page held for future per-file metadata.
pub const FFS_FILE_RESERVED_PAGE: u16 = 1;
/// First page index carrying user data.
pub const FFS_FILE_DATA_START_PAGE: u16 = 2;

/// Maximum number of files trackable (block meta `file_id` width assumes this fits a byte).
pub const MAX_FILES: usize = 64;

/// Firmware partition 0: active firmware image.
pub const FIRMWARE_0_FILE_ID: u8 = 0;
/// Firmware partition 1: recovery/backup image. Read-only once flashed (see DESIGN.md).
pub const FIRMWARE_1_FILE_ID: u8 = 1;
/// Number of blocks erased per background-erase tick when clearing a firmware partition.
pub const FIRMWARE_ERASE_BLOCKS_PER_TICK: usize = 4;

/// Retries before a soft flash error escalates to a hard error.
pub const IO_ATTEMPTS: u8 = 3;

/// Number of cached pages held by the page write cache.
pub const PAGE_CACHE_SIZE: usize = 16;

/// Background free-space verification: blocks scanned per call.
pub const FREE_VERIFY_BLOCKS_PER_STEP: usize = 4;

/// Filename length in `file_meta0`.
pub const FILENAME_LEN: usize = 32;

/// FFS on-flash format version; byte 0 of block 0 must equal this.
pub const FFS_VERSION: u8 = 1;
/// Sentinel meaning "board type not yet written" in byte 1 of block 0.
pub const FFS_BOARD_TYPE_UNSET: u8 = 0xff;

/// VM ISA version. The loader rejects any image whose header doesn't match exactly.
pub const VM_ISA_VERSION: u16 = 13;

/// Section magic numbers, little-endian on the wire, matching `vm_core.h`.
pub const FILE_MAGIC: u32 = 0x2020_4658; // 'FX  '
pub const PROGRAM_MAGIC: u32 = 0x474f_5250; // 'PROG'
pub const CODE_MAGIC: u32 = 0x4544_4f43; // 'CODE'
pub const POOL_MAGIC: u32 = 0x4c4f_4f50; // 'POOL'
pub const META_MAGIC: u32 = 0x4154_454d; // 'META'

/// Instructions executed before a VM run is forcibly aborted.
pub const VM_MAX_CYCLES: u32 = 20_000;

/// Wall-clock budget for one `run_tick` call, matching `VM_MAX_RUN_TIME`.
pub const VM_MAX_RUN_TIME_US: u64 = 500_000;

/// Maximum nested `call`/`icall`/`lcall` depth before `CALL_DEPTH_EXCEEDED`.
pub const MAX_CALL_DEPTH: usize = 8;

/// Maximum concurrently-scheduled user threads per VM.
pub const MAX_THREADS: usize = 8;

/// Minimum delay (ticks) a `suspend` may apply, to prevent busy spinning.
pub const MIN_DELAY: u64 = 1;

/// Register index where direct/indirect call arguments are written in the callee frame.
pub const REG_CALL_PARAMS: usize = 0;

/// Word size of one register / storage slot, in bytes.
pub const WORD_SIZE: usize = 4;

/// Q16.16 fixed point fractional bits.
pub const F16_SHIFT: u32 = 16;

/// Number of general-purpose 32-bit registers in one call frame.
pub const VM_REGISTER_COUNT: usize = 16;

/// Upper bound on a loaded image's code section, in 4-byte instructions.
pub const VM_MAX_CODE_WORDS: usize = 4096;

/// Upper bound on the GLOBAL storage pool, in 32-bit words.
pub const VM_MAX_GLOBAL_WORDS: usize = 512;

/// Upper bound on the constant pool, in 32-bit words.
pub const VM_MAX_CONST_WORDS: usize = 256;

/// Upper bound on the string literal pool, in bytes.
pub const VM_MAX_STRING_POOL: usize = 1024;

/// Upper bound on the function table.
pub const VM_MAX_FUNCTIONS: usize = 32;

/// Upper bound on one PIXEL_ARRAY pool's pixel count.
pub const VM_MAX_PIXELS: usize = 512;

/// Upper bound on LOCAL storage per call frame, in 32-bit words.
pub const VM_MAX_LOCAL_WORDS: usize = 32;

/// Byte alignment every image section must start on.
pub const VM_SECTION_ALIGN: usize = 4;
