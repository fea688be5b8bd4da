//! The Catbus type tag set and the `type_convert` policy function.
//!
//! Discriminant values match `original_source/src/sapphireos/catbus_types.h`
//! exactly, since the VM image's publish/DB tables carry these as raw
//! bytes (spec.md §6.2's "bit-exact" requirement extends to the type tag).

use std::convert::TryInto;

/// Largest single value any `CatbusType` can hold (STRING512, artificially
/// capped at 488 bytes in the original firmware to fit one catbus message).
pub const CATBUS_MAX_DATA: usize = 488;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CatbusType {
    None = 0,
    Bool = 1,
    Uint8 = 2,
    Int8 = 3,
    Uint16 = 4,
    Int16 = 5,
    Uint32 = 6,
    Int32 = 7,
    Uint64 = 8,
    Int64 = 9,
    Float = 10,
    Fixed16 = 11,
    Gfx16 = 20,
    String128 = 40,
    Mac48 = 41,
    Mac64 = 42,
    Key128 = 43,
    IPv4 = 44,
    String512 = 45,
    String32 = 46,
    String64 = 47,
    Invalid = 255,
}

impl CatbusType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => CatbusType::None,
            1 => CatbusType::Bool,
            2 => CatbusType::Uint8,
            3 => CatbusType::Int8,
            4 => CatbusType::Uint16,
            5 => CatbusType::Int16,
            6 => CatbusType::Uint32,
            7 => CatbusType::Int32,
            8 => CatbusType::Uint64,
            9 => CatbusType::Int64,
            10 => CatbusType::Float,
            11 => CatbusType::Fixed16,
            20 => CatbusType::Gfx16,
            40 => CatbusType::String128,
            41 => CatbusType::Mac48,
            42 => CatbusType::Mac64,
            43 => CatbusType::Key128,
            44 => CatbusType::IPv4,
            45 => CatbusType::String512,
            46 => CatbusType::String32,
            47 => CatbusType::String64,
            _ => CatbusType::Invalid,
        }
    }

    /// Byte width of one value of this type; `None` for variable/invalid.
    pub fn size(self) -> Option<usize> {
        use CatbusType::*;
        Some(match self {
            None => 0,
            Bool | Uint8 | Int8 => 1,
            Uint16 | Int16 => 2,
            Uint32 | Int32 | Float | Fixed16 | Gfx16 | IPv4 => 4,
            Uint64 | Int64 => 8,
            String128 => 128,
            String32 => 32,
            String64 => 64,
            String512 => CATBUS_MAX_DATA,
            Mac48 => 6,
            Mac64 => 8,
            Key128 => 16,
            Invalid => return Option::None,
        })
    }

    pub fn is_string(self) -> bool {
        matches!(
            self,
            CatbusType::String128
                | CatbusType::String32
                | CatbusType::String64
                | CatbusType::String512
                | CatbusType::Mac48
                | CatbusType::Mac64
                | CatbusType::Key128
        )
    }
}

fn to_i64(ty: CatbusType, data: &[u8]) -> i64 {
    use CatbusType::*;
    match ty {
        Bool | Uint8 => data[0] as i64,
        Int8 => data[0] as i8 as i64,
        Uint16 => u16::from_le_bytes([data[0], data[1]]) as i64,
        Int16 => i16::from_le_bytes([data[0], data[1]]) as i64,
        Uint32 | Gfx16 | IPv4 => u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64,
        Int32 | Fixed16 => i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64,
        Uint64 => u64::from_le_bytes(data[..8].try_into().unwrap()) as i64,
        Int64 => i64::from_le_bytes(data[..8].try_into().unwrap()),
        Float => f32::from_le_bytes([data[0], data[1], data[2], data[3]]) as i64,
        _ => 0,
    }
}

fn from_i64(ty: CatbusType, v: i64, out: &mut [u8]) {
    use CatbusType::*;
    match ty {
        Bool | Uint8 => out[0] = v as u8,
        Int8 => out[0] = v as i8 as u8,
        Uint16 => out[..2].copy_from_slice(&(v as u16).to_le_bytes()),
        Int16 => out[..2].copy_from_slice(&(v as i16).to_le_bytes()),
        Uint32 | Gfx16 | IPv4 => out[..4].copy_from_slice(&(v as u32).to_le_bytes()),
        Int32 | Fixed16 => out[..4].copy_from_slice(&(v as i32).to_le_bytes()),
        Uint64 => out[..8].copy_from_slice(&(v as u64).to_le_bytes()),
        Int64 => out[..8].copy_from_slice(&v.to_le_bytes()),
        Float => out[..4].copy_from_slice(&(v as f32).to_le_bytes()),
        _ => {}
    }
}

/// Single policy function covering numeric->numeric (saturating through
/// an `i64` intermediate), string->string (truncate-or-pad), and
/// numeric<->string (zero-filled destination) conversions.
///
/// `dst` must be at least `dst_type.size()` bytes; returns the number of
/// bytes written.
pub fn type_convert(src_type: CatbusType, src: &[u8], dst_type: CatbusType, dst: &mut [u8]) -> usize {
    let dst_size = match dst_type.size() {
        Some(s) => s,
        Option::None => return 0,
    };
    for b in dst[..dst_size].iter_mut() {
        *b = 0;
    }

    if src_type.is_string() && dst_type.is_string() {
        let n = src.len().min(dst_size);
        dst[..n].copy_from_slice(&src[..n]);
        return dst_size;
    }

    if src_type.is_string() || dst_type.is_string() {
        // numeric<->string: not a general printf round trip here (that's
        // `fmtstr`'s job in the VM); policy is "zero-fill destination,
        // no conversion" when crossing the string/numeric boundary via
        // this path, matching the original's behavior for raw KVDB sets.
        return dst_size;
    }

    let saturated = saturate(src_type, to_i64(src_type, src), dst_type);
    from_i64(dst_type, saturated, dst);
    dst_size
}

fn saturate(src_type: CatbusType, v: i64, dst_type: CatbusType) -> i64 {
    use CatbusType::*;
    match dst_type {
        Bool | Uint8 => v.clamp(0, u8::MAX as i64),
        Int8 => v.clamp(i8::MIN as i64, i8::MAX as i64),
        Uint16 => v.clamp(0, u16::MAX as i64),
        Int16 => v.clamp(i16::MIN as i64, i16::MAX as i64),
        Uint32 | Gfx16 | IPv4 => v.clamp(0, u32::MAX as i64),
        Int32 | Fixed16 => {
            if src_type == Fixed16 || dst_type == Fixed16 {
                v
            } else {
                v.clamp(i32::MIN as i64, i32::MAX as i64)
            }
        }
        Uint64 => v.max(0),
        Int64 => v,
        Float => v,
        _ => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_widen_and_narrow_saturates() {
        let mut dst = [0u8; 1];
        let src = 300i32.to_le_bytes();
        type_convert(CatbusType::Int32, &src, CatbusType::Uint8, &mut dst);
        assert_eq!(dst[0], 255);
    }

    #[test]
    fn string_truncate_or_pad() {
        let mut dst = [0xAAu8; 32];
        type_convert(CatbusType::String32, b"hi", CatbusType::String32, &mut dst);
        assert_eq!(&dst[..2], b"hi");
        assert_eq!(&dst[2..4], &[0, 0]);
    }

    #[test]
    fn type_sizes_match_original_firmware() {
        assert_eq!(CatbusType::Uint32.size(), Some(4));
        assert_eq!(CatbusType::String512.size(), Some(CATBUS_MAX_DATA));
        assert_eq!(CatbusType::Key128.size(), Some(16));
    }
}
