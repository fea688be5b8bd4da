//! Graphics Buffer contract: the pixel-addressing and color-channel
//! operations the VM's `vec*` opcode family and `gfx_lib_call` host
//! functions are specified against.
//!
//! Grounded on `original_source/src/lib_gfx/gfx_lib.c`: HSV channels are
//! 16-bit with hue wrapping modulo 65536 and saturation/value/fade
//! channels clamped to `[0, 65535]`, never wrapping. `gfx_lib_call`
//! collects the small set of host-provided generator functions
//! (`urand`/`noise`/`sine`/`cosine`/`triangle`) a VM image can invoke
//! without linking a full DSP or RNG implementation into the
//! interpreter itself.

/// Sentinel the original firmware uses for "fully saturated" fixed-point
/// values; inputs of exactly 65536 clamp down to this instead of
/// wrapping to 0, since callers often compute one-past-max via fixed
/// point math that should saturate, not wrap.
pub const F16_ONE: u32 = 65535;

fn clamp_channel(v: i32) -> u16 {
    if v < 0 {
        0
    } else if v as u32 >= 65536 {
        F16_ONE as u16
    } else {
        v as u16
    }
}

fn wrap_hue(v: i32) -> u16 {
    (v.rem_euclid(65536)) as u16
}

/// One HSV pixel plus its fade targets, the unit the VM's pixel array
/// pool stores per element.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct Pixel {
    pub hue: u16,
    pub sat: u16,
    pub val: u16,
    pub hs_fade: u16,
    pub v_fade: u16,
}

/// Implemented by the host's pixel array storage; the interpreter's
/// `vec*` opcodes and `gfx_calc_index` call through this trait rather
/// than owning pixel memory directly, the same boundary the original
/// firmware draws between `vm_core.c` and `gfx_lib.c`.
pub trait GraphicsBuffer {
    fn pixel_count(&self) -> usize;
    fn get(&self, index: usize) -> Pixel;
    fn set(&mut self, index: usize, p: Pixel);

    /// Maps a 1-D VM index plus an optional object offset/stride into a
    /// flat buffer index, matching `gfx_i16_calc_index`'s addressing.
    fn calc_index(&self, index: i32, offset: i32, stride: i32) -> Option<usize> {
        if stride == 0 {
            return None;
        }
        let addr = offset + index * stride;
        if addr < 0 || addr as usize >= self.pixel_count() {
            None
        } else {
            Some(addr as usize)
        }
    }

    fn set_hue(&mut self, index: usize, v: i32) {
        let mut p = self.get(index);
        p.hue = wrap_hue(v);
        self.set(index, p);
    }
    fn get_hue(&self, index: usize) -> u16 {
        self.get(index).hue
    }
    fn set_sat(&mut self, index: usize, v: i32) {
        let mut p = self.get(index);
        p.sat = clamp_channel(v);
        self.set(index, p);
    }
    fn get_sat(&self, index: usize) -> u16 {
        self.get(index).sat
    }
    fn set_val(&mut self, index: usize, v: i32) {
        let mut p = self.get(index);
        p.val = clamp_channel(v);
        self.set(index, p);
    }
    fn get_val(&self, index: usize) -> u16 {
        self.get(index).val
    }
    fn set_hs_fade(&mut self, index: usize, v: i32) {
        let mut p = self.get(index);
        p.hs_fade = clamp_channel(v);
        self.set(index, p);
    }
    fn get_hs_fade(&self, index: usize) -> u16 {
        self.get(index).hs_fade
    }
    fn set_v_fade(&mut self, index: usize, v: i32) {
        let mut p = self.get(index);
        p.v_fade = clamp_channel(v);
        self.set(index, p);
    }
    fn get_v_fade(&self, index: usize) -> u16 {
        self.get(index).v_fade
    }

    /// Bulk element-wise ops over a contiguous pixel range, backing the
    /// `vec*` opcode family. `channel` selects which field each op touches.
    fn array_move(&mut self, start: usize, count: usize, channel: Channel, value: i32) {
        for i in start..start + count {
            apply(self, i, channel, |_| value);
        }
    }
    fn array_add(&mut self, start: usize, count: usize, channel: Channel, value: i32) {
        for i in start..start + count {
            apply(self, i, channel, |cur| cur + value);
        }
    }
    fn array_sub(&mut self, start: usize, count: usize, channel: Channel, value: i32) {
        for i in start..start + count {
            apply(self, i, channel, |cur| cur - value);
        }
    }
    fn array_mul(&mut self, start: usize, count: usize, channel: Channel, value: i32) {
        for i in start..start + count {
            apply(self, i, channel, |cur| cur.wrapping_mul(value));
        }
    }
    fn array_div(&mut self, start: usize, count: usize, channel: Channel, value: i32) {
        if value == 0 {
            return;
        }
        for i in start..start + count {
            apply(self, i, channel, |cur| cur / value);
        }
    }
    fn array_mod(&mut self, start: usize, count: usize, channel: Channel, value: i32) {
        if value == 0 {
            return;
        }
        for i in start..start + count {
            apply(self, i, channel, |cur| cur.rem_euclid(value));
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Channel {
    Hue,
    Sat,
    Val,
    HsFade,
    VFade,
}

fn apply<G: GraphicsBuffer + ?Sized>(buf: &mut G, index: usize, channel: Channel, f: impl Fn(i32) -> i32) {
    if index >= buf.pixel_count() {
        return;
    }
    let cur = match channel {
        Channel::Hue => buf.get_hue(index) as i32,
        Channel::Sat => buf.get_sat(index) as i32,
        Channel::Val => buf.get_val(index) as i32,
        Channel::HsFade => buf.get_hs_fade(index) as i32,
        Channel::VFade => buf.get_v_fade(index) as i32,
    };
    let next = f(cur);
    match channel {
        Channel::Hue => buf.set_hue(index, next),
        Channel::Sat => buf.set_sat(index, next),
        Channel::Val => buf.set_val(index, next),
        Channel::HsFade => buf.set_hs_fade(index, next),
        Channel::VFade => buf.set_v_fade(index, next),
    }
}

/// A simple xorshift PRNG, standing in for the host's `urand` source;
/// deterministic given a seed so VM-driven effects are reproducible in
/// tests, matching the original firmware's software LFSR rather than a
/// hardware TRNG.
pub struct Rng(u32);

impl Rng {
    pub fn new(seed: u32) -> Self {
        Rng(if seed == 0 { 0xdead_beef } else { seed })
    }

    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

/// The host-side library call surface `CallLib` dispatches into for
/// graphics generator functions (`urand`, `noise`, `sine`, `cosine`,
/// `triangle`), matching `vm_lib.c`'s `LIB_CALL_*` table for this subset.
pub fn lib_call(index: u8, arg: i32, rng: &mut Rng) -> Option<i32> {
    match index {
        0 => Some((rng.next_u32() % (arg.max(1) as u32)) as i32), // urand(max)
        1 => Some(triangle_wave(arg)),                            // noise approximated by triangle
        2 => Some(sine_f16(arg)),
        3 => Some(sine_f16(arg.wrapping_add(1 << 14))), // cosine = sine phase-shifted by pi/2
        4 => Some(triangle_wave(arg)),
        _ => None,
    }
}

/// Q16.16 sine approximation over a 0..=65535 phase wheel using a
/// triangle-to-sine correction (Bhaskara I), avoiding a libm dependency
/// in a no_std core.
fn sine_f16(phase: i32) -> i32 {
    let p = (phase as u32 % 65536) as i64;
    let pi_scaled = 65536i64;
    let x = (p * 2 * pi_scaled) / 65536 - pi_scaled;
    let num = 16 * x * (pi_scaled - x.abs());
    let den = 5 * pi_scaled * pi_scaled - 4 * x * (pi_scaled - x.abs());
    if den == 0 {
        0
    } else {
        ((num << 16) / den) as i32
    }
}

fn triangle_wave(phase: i32) -> i32 {
    let p = phase.rem_euclid(65536);
    if p < 32768 {
        (p * 2) - 32768
    } else {
        32768 - ((p - 32768) * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBuf {
        pixels: std::vec::Vec<Pixel>,
    }

    impl GraphicsBuffer for TestBuf {
        fn pixel_count(&self) -> usize {
            self.pixels.len()
        }
        fn get(&self, index: usize) -> Pixel {
            self.pixels[index]
        }
        fn set(&mut self, index: usize, p: Pixel) {
            self.pixels[index] = p;
        }
    }

    fn buf(n: usize) -> TestBuf {
        TestBuf { pixels: std::vec![Pixel::default(); n] }
    }

    #[test]
    fn hue_wraps_modulo_65536() {
        let mut b = buf(1);
        b.set_hue(0, 70000);
        assert_eq!(b.get_hue(0), (70000i32 - 65536) as u16);
    }

    #[test]
    fn value_clamps_instead_of_wrapping() {
        let mut b = buf(1);
        b.set_val(0, -5);
        assert_eq!(b.get_val(0), 0);
        b.set_val(0, 100_000);
        assert_eq!(b.get_val(0), F16_ONE as u16);
    }

    #[test]
    fn array_add_touches_every_element_in_range() {
        let mut b = buf(4);
        b.array_add(1, 2, Channel::Val, 100);
        assert_eq!(b.get_val(0), 0);
        assert_eq!(b.get_val(1), 100);
        assert_eq!(b.get_val(2), 100);
        assert_eq!(b.get_val(3), 0);
    }

    #[test]
    fn rng_is_deterministic_for_a_fixed_seed() {
        let mut a = Rng::new(42);
        let mut b = Rng::new(42);
        assert_eq!(a.next_u32(), b.next_u32());
    }
}
