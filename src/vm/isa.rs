//! FX-VM instruction set: opcodes, packed references, and the fixed
//! 4-byte-aligned operand layouts the loader and interpreter share.
//!
//! Grounded on `original_source/src/sapphireos/vm_core.c`'s opcode table
//! and `vm_core.h`'s operand-template structs. The original dispatch
//! table reserves all 256 opcode values (most slots are `trap`); this
//! enum only names the opcodes the interpreter implements; everything
//! else decodes to `Opcode::Trap` and the VM halts with `VmStatus::Trap`,
//! which is also what the original firmware does for an unassigned slot.

/// One instruction word is 4 bytes: opcode + 3 operand bytes, or opcode +
/// a 3-byte immediate/register payload depending on the template below.
pub const INSTRUCTION_SIZE: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,

    // register <- register moves and immediate loads
    Mov = 1,
    LdI32 = 2,
    ClrReg = 3,

    // integer arithmetic, two operands + destination
    AddI32 = 10,
    SubI32 = 11,
    MulI32 = 12,
    DivI32 = 13,
    ModI32 = 14,
    AndI32 = 15,
    OrI32 = 16,
    XorI32 = 17,
    NotI32 = 18,
    NegI32 = 19,
    ShlI32 = 20,
    ShrI32 = 21,

    // comparisons, result is 0/1 in dest register
    CmpEq = 30,
    CmpNeq = 31,
    CmpGt = 32,
    CmpGte = 33,
    CmpLt = 34,
    CmpLte = 35,

    // Q16.16 fixed point arithmetic
    AddF16 = 40,
    SubF16 = 41,
    MulF16 = 42,
    DivF16 = 43,

    // control flow
    Jmp = 60,
    JmpZ = 61,
    JmpNz = 62,
    Loop = 63,
    Ret = 64,

    // calls
    Call = 70,
    CallIndirect = 71,
    CallLib = 72,

    // cooperative scheduling
    Suspend = 80,
    Yield = 81,

    // storage pool access (load/store through a packed Reference)
    Load = 90,
    Store = 91,
    ArrayLoad = 92,
    ArrayStore = 93,

    // strings
    LoadStr = 100,
    FormatStr = 101,

    // vector ops over PIXEL_ARRAY references
    VecMov = 110,
    VecAdd = 111,
    VecSub = 112,
    VecMul = 113,
    VecDiv = 114,
    VecMod = 115,

    // diagnostics
    Assert = 120,
    Halt = 127,

    /// Catch-all for any opcode value not listed above; matches the
    /// original table's unused slots, which all point at the trap handler.
    Trap = 255,
}

impl Opcode {
    pub fn decode(byte: u8) -> Self {
        match byte {
            0 => Opcode::Nop,
            1 => Opcode::Mov,
            2 => Opcode::LdI32,
            3 => Opcode::ClrReg,
            10 => Opcode::AddI32,
            11 => Opcode::SubI32,
            12 => Opcode::MulI32,
            13 => Opcode::DivI32,
            14 => Opcode::ModI32,
            15 => Opcode::AndI32,
            16 => Opcode::OrI32,
            17 => Opcode::XorI32,
            18 => Opcode::NotI32,
            19 => Opcode::NegI32,
            20 => Opcode::ShlI32,
            21 => Opcode::ShrI32,
            30 => Opcode::CmpEq,
            31 => Opcode::CmpNeq,
            32 => Opcode::CmpGt,
            33 => Opcode::CmpGte,
            34 => Opcode::CmpLt,
            35 => Opcode::CmpLte,
            40 => Opcode::AddF16,
            41 => Opcode::SubF16,
            42 => Opcode::MulF16,
            43 => Opcode::DivF16,
            60 => Opcode::Jmp,
            61 => Opcode::JmpZ,
            62 => Opcode::JmpNz,
            63 => Opcode::Loop,
            64 => Opcode::Ret,
            70 => Opcode::Call,
            71 => Opcode::CallIndirect,
            72 => Opcode::CallLib,
            80 => Opcode::Suspend,
            81 => Opcode::Yield,
            90 => Opcode::Load,
            91 => Opcode::Store,
            92 => Opcode::ArrayLoad,
            93 => Opcode::ArrayStore,
            100 => Opcode::LoadStr,
            101 => Opcode::FormatStr,
            110 => Opcode::VecMov,
            111 => Opcode::VecAdd,
            112 => Opcode::VecSub,
            113 => Opcode::VecMul,
            114 => Opcode::VecDiv,
            115 => Opcode::VecMod,
            120 => Opcode::Assert,
            127 => Opcode::Halt,
            _ => Opcode::Trap,
        }
    }
}

/// Storage pool ids, matching `vm_core.h`'s `POOL_*` constants.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Pool {
    Global = 0,
    PixelArray = 1,
    StringLiterals = 2,
    Functions = 3,
    Local = 4,
}

impl Pool {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Pool::Global),
            1 => Some(Pool::PixelArray),
            2 => Some(Pool::StringLiterals),
            3 => Some(Pool::Functions),
            4 => Some(Pool::Local),
            _ => None,
        }
    }
}

/// A packed 32-bit storage reference: `{pool: u8, addr: u16, index: u8}`.
/// Matches the bitfield the original compiler emits for every variable
/// and array access instead of a raw pointer, so images are
/// position-independent and bounds-checkable at load time.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Reference {
    pub pool: u8,
    pub addr: u16,
    pub index: u8,
}

impl Reference {
    pub fn pack(self) -> u32 {
        (self.pool as u32) | ((self.addr as u32) << 8) | ((self.index as u32) << 24)
    }

    pub fn unpack(word: u32) -> Self {
        Reference {
            pool: (word & 0xff) as u8,
            addr: ((word >> 8) & 0xffff) as u16,
            index: ((word >> 24) & 0xff) as u8,
        }
    }
}

/// One decoded instruction: opcode plus up to three raw operand bytes,
/// interpreted per-opcode by the interpreter (the original's many named
/// operand-template structs collapse to this single shape here, since
/// the interpreter is the only consumer and each arm already knows its
/// own layout).
#[derive(Clone, Copy, Debug)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: [u8; 3],
}

impl Instruction {
    pub fn decode(word: &[u8; INSTRUCTION_SIZE]) -> Self {
        Instruction { opcode: Opcode::decode(word[0]), operands: [word[1], word[2], word[3]] }
    }

    pub fn reg(&self, i: usize) -> usize {
        self.operands[i] as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_pack_round_trip() {
        let r = Reference { pool: Pool::PixelArray as u8, addr: 0x1234, index: 7 };
        let packed = r.pack();
        assert_eq!(Reference::unpack(packed), r);
    }

    #[test]
    fn unknown_opcode_decodes_to_trap() {
        assert_eq!(Opcode::decode(0xee), Opcode::Trap);
    }

    #[test]
    fn known_opcode_round_trip() {
        assert_eq!(Opcode::decode(Opcode::AddF16 as u8), Opcode::AddF16);
    }
}
