//! VM Loader: parses a compiled program image into an in-memory `VmImage`
//! ready for execution.
//!
//! Grounded on `original_source/src/sapphireos/vm_core.c`'s
//! `vm_i8_load_program` and `vm_core.h`'s `vm_program_header_t`. Section
//! order on the wire is header, code, function info, global data,
//! constant pool, string literal pool, trailing CRC32 — each section
//! padded to `VM_SECTION_ALIGN` bytes, resolving spec.md §9's alignment
//! open question at image-build time rather than with a runtime memcpy.

use std::convert::TryInto;

use crc::{crc32, Hasher32};
use log::{debug, warn};

use crate::config::{
    CODE_MAGIC, FILE_MAGIC, META_MAGIC, POOL_MAGIC, PROGRAM_MAGIC, VM_ISA_VERSION,
    VM_MAX_CODE_WORDS, VM_MAX_CONST_WORDS, VM_MAX_FUNCTIONS, VM_MAX_GLOBAL_WORDS,
    VM_MAX_STRING_POOL, VM_SECTION_ALIGN,
};
use crate::error::VmStatus;
use crate::vm::isa::{Instruction, INSTRUCTION_SIZE};

const HEADER_LEN: usize = 48;

/// One entry of the function table: code offset, frame size (registers),
/// and local-storage context size, matching `function_info_t`.
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct FunctionInfo {
    pub addr: u16,
    pub frame_size: u16,
    pub context_size: u16,
}

#[derive(Debug, PartialEq)]
pub struct VmImage {
    pub program_name_hash: u32,
    pub code: heapless_u32::List,
    pub functions: [FunctionInfo; VM_MAX_FUNCTIONS],
    pub function_count: usize,
    pub global_data: [u8; VM_MAX_GLOBAL_WORDS * 4],
    pub global_len: usize,
    pub constants: [u8; VM_MAX_CONST_WORDS * 4],
    pub constants_len: usize,
    pub strings: [u8; VM_MAX_STRING_POOL],
    pub strings_len: usize,
    pub init_start: u16,
    pub loop_start: u16,
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn align_up(n: usize) -> usize {
    (n + VM_SECTION_ALIGN - 1) / VM_SECTION_ALIGN * VM_SECTION_ALIGN
}

impl VmImage {
    /// Parse and validate `bytes` as a complete program image, returning
    /// the specific `VmStatus` error the original loader would report for
    /// each failure so host logs stay diffable.
    pub fn load(bytes: &[u8]) -> Result<VmImage, VmStatus> {
        if bytes.len() < HEADER_LEN {
            return Err(VmStatus::ErrBadLength);
        }
        if read_u32(bytes, 0) != FILE_MAGIC {
            return Err(VmStatus::ErrBadFileMagic);
        }
        if read_u32(bytes, 4) != PROGRAM_MAGIC {
            return Err(VmStatus::ErrBadProgMagic);
        }
        let isa_version = read_u16(bytes, 8);
        if isa_version != VM_ISA_VERSION {
            warn!("image isa version {} != {}", isa_version, VM_ISA_VERSION);
            return Err(VmStatus::ErrInvalidIsa);
        }
        let program_name_hash = read_u32(bytes, 12);
        let code_len = read_u32(bytes, 16) as usize;
        let func_info_len = read_u32(bytes, 20) as usize;
        let global_data_len = read_u32(bytes, 24) as usize;
        let constant_len = read_u32(bytes, 28) as usize;
        let stringlit_len = read_u32(bytes, 32) as usize;
        let init_start = read_u16(bytes, 36);
        let loop_start = read_u16(bytes, 38);

        if code_len % INSTRUCTION_SIZE != 0 {
            return Err(VmStatus::CodeMisalign);
        }
        if code_len / INSTRUCTION_SIZE > VM_MAX_CODE_WORDS {
            return Err(VmStatus::ImageTooLarge);
        }

        let mut cursor = HEADER_LEN;

        if bytes.len() < cursor + 4 || read_u32(bytes, cursor) != CODE_MAGIC {
            return Err(VmStatus::ErrBadCodeMagic);
        }
        cursor += 4;
        let code_end = cursor + code_len;
        if bytes.len() < code_end {
            return Err(VmStatus::ErrBadLength);
        }
        let mut code = heapless_u32::List::new();
        let mut i = cursor;
        while i + INSTRUCTION_SIZE <= code_end {
            let word: [u8; INSTRUCTION_SIZE] = bytes[i..i + INSTRUCTION_SIZE].try_into().unwrap();
            let _ = Instruction::decode(&word);
            code.push(read_u32(bytes, i));
            i += INSTRUCTION_SIZE;
        }
        cursor = align_up(code_end);

        if bytes.len() < cursor + 4 || read_u32(bytes, cursor) != META_MAGIC {
            return Err(VmStatus::ErrBadMetaMagic);
        }
        cursor += 4;
        let func_count = func_info_len / 6;
        if func_count > VM_MAX_FUNCTIONS {
            return Err(VmStatus::LoadAllocFail);
        }
        let mut functions = [FunctionInfo::default(); VM_MAX_FUNCTIONS];
        for (idx, slot) in functions.iter_mut().take(func_count).enumerate() {
            let off = cursor + idx * 6;
            if bytes.len() < off + 6 {
                return Err(VmStatus::ErrBadLength);
            }
            slot.addr = read_u16(bytes, off);
            slot.frame_size = read_u16(bytes, off + 2);
            slot.context_size = read_u16(bytes, off + 4);
        }
        cursor = align_up(cursor + func_info_len);

        if bytes.len() < cursor + 4 || read_u32(bytes, cursor) != POOL_MAGIC {
            return Err(VmStatus::ErrBadPoolMagic);
        }
        cursor += 4;

        if global_data_len > VM_MAX_GLOBAL_WORDS * 4 {
            return Err(VmStatus::DataMisalign);
        }
        let mut global_data = [0u8; VM_MAX_GLOBAL_WORDS * 4];
        if bytes.len() < cursor + global_data_len {
            return Err(VmStatus::ErrBadLength);
        }
        global_data[..global_data_len].copy_from_slice(&bytes[cursor..cursor + global_data_len]);
        cursor = align_up(cursor + global_data_len);

        if constant_len > VM_MAX_CONST_WORDS * 4 {
            return Err(VmStatus::PoolMisalign);
        }
        let mut constants = [0u8; VM_MAX_CONST_WORDS * 4];
        if bytes.len() < cursor + constant_len {
            return Err(VmStatus::ErrBadLength);
        }
        constants[..constant_len].copy_from_slice(&bytes[cursor..cursor + constant_len]);
        cursor = align_up(cursor + constant_len);

        if stringlit_len > VM_MAX_STRING_POOL {
            return Err(VmStatus::PoolMisalign);
        }
        let mut strings = [0u8; VM_MAX_STRING_POOL];
        if bytes.len() < cursor + stringlit_len {
            return Err(VmStatus::ErrBadLength);
        }
        strings[..stringlit_len].copy_from_slice(&bytes[cursor..cursor + stringlit_len]);
        cursor = align_up(cursor + stringlit_len);

        if bytes.len() < cursor + 4 {
            return Err(VmStatus::ErrBadFileHash);
        }
        let expected_crc = read_u32(bytes, cursor);
        let mut digest = crc32::Digest::new(crc32::IEEE);
        digest.write(&bytes[..cursor]);
        let actual_crc = digest.sum32();
        if expected_crc != actual_crc {
            return Err(VmStatus::ErrBadHash);
        }

        debug!(
            "loaded vm image hash={:#x} code_words={} functions={} globals={}b consts={}b strings={}b",
            program_name_hash,
            code.len(),
            func_count,
            global_data_len,
            constant_len,
            stringlit_len
        );

        Ok(VmImage {
            program_name_hash,
            code,
            functions,
            function_count: func_count,
            global_data,
            global_len: global_data_len,
            constants,
            constants_len: constant_len,
            strings,
            strings_len: stringlit_len,
            init_start,
            loop_start,
        })
    }

    pub fn fetch(&self, pc: u16) -> Option<Instruction> {
        let idx = pc as usize;
        let word = *self.code.get(idx)?;
        Some(Instruction::decode(&word.to_le_bytes()))
    }

    pub fn function(&self, index: usize) -> Option<&FunctionInfo> {
        self.functions.get(index).filter(|_| index < self.function_count)
    }
}

/// Fixed-capacity `u32` list backing the decoded code section; avoids
/// pulling in `alloc` for what is otherwise a plain growable vector.
pub mod heapless_u32 {
    use crate::config::VM_MAX_CODE_WORDS;

    #[derive(Debug, PartialEq)]
    pub struct List {
        buf: [u32; VM_MAX_CODE_WORDS],
        len: usize,
    }

    impl List {
        pub fn new() -> Self {
            List { buf: [0; VM_MAX_CODE_WORDS], len: 0 }
        }

        pub fn push(&mut self, v: u32) {
            if self.len < self.buf.len() {
                self.buf[self.len] = v;
                self.len += 1;
            }
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn get(&self, idx: usize) -> Option<&u32> {
            if idx < self.len {
                Some(&self.buf[idx])
            } else {
                None
            }
        }
    }

    impl Default for List {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_section(buf: &mut std::vec::Vec<u8>, magic: u32, body: &[u8]) {
        buf.extend_from_slice(&magic.to_le_bytes());
        buf.extend_from_slice(body);
        while buf.len() % VM_SECTION_ALIGN != 0 {
            buf.push(0);
        }
    }

    fn build_image(code: &[u8], globals: &[u8], consts: &[u8], strings: &[u8]) -> std::vec::Vec<u8> {
        let mut header = std::vec::Vec::new();
        header.extend_from_slice(&FILE_MAGIC.to_le_bytes());
        header.extend_from_slice(&PROGRAM_MAGIC.to_le_bytes());
        header.extend_from_slice(&VM_ISA_VERSION.to_le_bytes());
        header.extend_from_slice(&[0u8; 2]);
        header.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        header.extend_from_slice(&(code.len() as u32).to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes()); // func_info_len
        header.extend_from_slice(&(globals.len() as u32).to_le_bytes());
        header.extend_from_slice(&(consts.len() as u32).to_le_bytes());
        header.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        header.extend_from_slice(&0u16.to_le_bytes()); // init_start
        header.extend_from_slice(&0u16.to_le_bytes()); // loop_start
        header.extend_from_slice(&[0u8; HEADER_LEN - 40]);
        assert_eq!(header.len(), HEADER_LEN);

        let mut buf = header;
        push_section(&mut buf, CODE_MAGIC, code);
        push_section(&mut buf, META_MAGIC, &[]);
        push_section(&mut buf, POOL_MAGIC, globals);
        buf.extend_from_slice(consts);
        while buf.len() % VM_SECTION_ALIGN != 0 {
            buf.push(0);
        }
        buf.extend_from_slice(strings);
        while buf.len() % VM_SECTION_ALIGN != 0 {
            buf.push(0);
        }
        let mut digest = crc32::Digest::new(crc32::IEEE);
        digest.write(&buf);
        let crc = digest.sum32();
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    #[test]
    fn rejects_bad_file_magic() {
        let bytes = [0u8; HEADER_LEN];
        assert_eq!(VmImage::load(&bytes), Err(VmStatus::ErrBadFileMagic));
    }

    #[test]
    fn loads_minimal_valid_image() {
        let bytes = build_image(&[0, 0, 0, 0], &[], &[], &[]);
        let image = VmImage::load(&bytes).unwrap();
        assert_eq!(image.code.len(), 1);
    }

    #[test]
    fn rejects_corrupted_crc() {
        let mut bytes = build_image(&[0, 0, 0, 0], &[], &[], &[]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert_eq!(VmImage::load(&bytes), Err(VmStatus::ErrBadHash));
    }
}
