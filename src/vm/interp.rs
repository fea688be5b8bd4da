//! FX-VM Interpreter: the `run` dispatch loop.
//!
//! Grounded on `original_source/src/sapphireos/vm_core.c`'s `vm_i8_run`:
//! a cycle-bounded fetch/decode/execute loop over register-only
//! instructions, divide-by-zero-returns-zero integer policy, Q16.16
//! fixed point via `i64` intermediates, and cooperative suspend with
//! idempotent re-entry (the interpreter is re-entered at the *same* `pc`
//! after a suspend resolves, so `suspend` itself must be a no-op the
//! second time through).

use log::trace;

use crate::config::{F16_SHIFT, VM_MAX_CYCLES, VM_REGISTER_COUNT};
use crate::error::VmStatus;
use crate::vm::image::VmImage;
use crate::vm::isa::Opcode;

/// Host-provided library call surface for the `lcall` family: string
/// formatting, graphics primitives, and RNG live on the host side of
/// this trait rather than inside the interpreter, the same split the
/// original firmware draws between `vm_core.c` and `vm_lib.c`.
pub trait LibraryHost {
    /// Invoke library function `index` with `args`, writing the return
    /// value (if any) into `*out`. Returns `false` for an unknown index,
    /// which the interpreter turns into `VmStatus::Trap`.
    fn call(&mut self, index: u8, args: &[i32], out: &mut i32) -> bool;
}

/// No-op host for images that never call a library function.
pub struct NullLibraryHost;

impl LibraryHost for NullLibraryHost {
    fn call(&mut self, _index: u8, _args: &[i32], _out: &mut i32) -> bool {
        false
    }
}

/// Why a run stopped before reaching `Halt`/`Ret` at the top level.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopReason {
    Completed,
    /// `suspend` requested a delay of this many ticks before resuming.
    Suspended(u32),
}

/// One call frame: a register window plus the return address.
#[derive(Clone, Copy)]
struct Frame {
    registers: [i32; VM_REGISTER_COUNT],
    return_pc: u16,
}

impl Default for Frame {
    fn default() -> Self {
        Frame { registers: [0; VM_REGISTER_COUNT], return_pc: 0 }
    }
}

/// Per-thread execution context: program counter, call stack, and the
/// resume state a `suspend` must restore on re-entry.
pub struct ThreadContext {
    pc: u16,
    frames: [Frame; crate::config::MAX_CALL_DEPTH],
    depth: usize,
    cycles_run_total: u64,
}

impl ThreadContext {
    pub fn new(entry_pc: u16) -> Self {
        ThreadContext {
            pc: entry_pc,
            frames: [Frame::default(); crate::config::MAX_CALL_DEPTH],
            depth: 1,
            cycles_run_total: 0,
        }
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn register(&self, r: usize) -> i32 {
        self.frames[self.depth - 1].registers[r]
    }

    pub fn set_register(&mut self, r: usize, v: i32) {
        self.frames[self.depth - 1].registers[r] = v;
    }
}

fn f16_mul(a: i32, b: i32) -> i32 {
    (((a as i64) * (b as i64)) >> F16_SHIFT) as i32
}

fn f16_div(a: i32, b: i32) -> i32 {
    if b == 0 {
        0
    } else {
        (((a as i64) << F16_SHIFT) / (b as i64)) as i32
    }
}

/// Run `ctx` against `image` for up to `VM_MAX_CYCLES` instructions,
/// stopping at `Halt`/`Ret`-from-top-frame, a `suspend`, or an error.
pub fn run<L: LibraryHost>(
    ctx: &mut ThreadContext,
    image: &VmImage,
    lib: &mut L,
) -> Result<StopReason, VmStatus> {
    let mut cycles: u32 = 0;

    loop {
        if cycles >= VM_MAX_CYCLES {
            return Err(VmStatus::ErrMaxCycles);
        }
        cycles += 1;
        ctx.cycles_run_total += 1;

        let instr = image.fetch(ctx.pc).ok_or(VmStatus::IndexOutOfBounds)?;
        trace!("pc={} opcode={:?} operands={:?}", ctx.pc, instr.opcode, instr.operands);
        let mut next_pc = ctx.pc.wrapping_add(1);

        match instr.opcode {
            Opcode::Nop => {}

            Opcode::Mov => {
                let v = ctx.register(instr.reg(1));
                ctx.set_register(instr.reg(0), v);
            }
            Opcode::LdI32 => {
                let v = instr.operands[1] as i8 as i32;
                ctx.set_register(instr.reg(0), v);
            }
            Opcode::ClrReg => ctx.set_register(instr.reg(0), 0),

            Opcode::AddI32 => binop_i32(ctx, instr, |a, b| a.wrapping_add(b)),
            Opcode::SubI32 => binop_i32(ctx, instr, |a, b| a.wrapping_sub(b)),
            Opcode::MulI32 => binop_i32(ctx, instr, |a, b| a.wrapping_mul(b)),
            Opcode::DivI32 => binop_i32(ctx, instr, |a, b| if b == 0 { 0 } else { a.wrapping_div(b) }),
            Opcode::ModI32 => binop_i32(ctx, instr, |a, b| if b == 0 { 0 } else { a.wrapping_rem(b) }),
            Opcode::AndI32 => binop_i32(ctx, instr, |a, b| a & b),
            Opcode::OrI32 => binop_i32(ctx, instr, |a, b| a | b),
            Opcode::XorI32 => binop_i32(ctx, instr, |a, b| a ^ b),
            Opcode::NotI32 => {
                let a = ctx.register(instr.reg(1));
                ctx.set_register(instr.reg(0), !a);
            }
            Opcode::NegI32 => {
                let a = ctx.register(instr.reg(1));
                ctx.set_register(instr.reg(0), a.wrapping_neg());
            }
            Opcode::ShlI32 => binop_i32(ctx, instr, |a, b| a.wrapping_shl(b as u32 & 31)),
            Opcode::ShrI32 => binop_i32(ctx, instr, |a, b| a.wrapping_shr(b as u32 & 31)),

            Opcode::CmpEq => binop_i32(ctx, instr, |a, b| (a == b) as i32),
            Opcode::CmpNeq => binop_i32(ctx, instr, |a, b| (a != b) as i32),
            Opcode::CmpGt => binop_i32(ctx, instr, |a, b| (a > b) as i32),
            Opcode::CmpGte => binop_i32(ctx, instr, |a, b| (a >= b) as i32),
            Opcode::CmpLt => binop_i32(ctx, instr, |a, b| (a < b) as i32),
            Opcode::CmpLte => binop_i32(ctx, instr, |a, b| (a <= b) as i32),

            Opcode::AddF16 => binop_i32(ctx, instr, |a, b| a.wrapping_add(b)),
            Opcode::SubF16 => binop_i32(ctx, instr, |a, b| a.wrapping_sub(b)),
            Opcode::MulF16 => binop_i32(ctx, instr, f16_mul),
            Opcode::DivF16 => binop_i32(ctx, instr, f16_div),

            Opcode::Jmp => {
                next_pc = decode_jump_target(ctx.pc, instr.operands);
            }
            Opcode::JmpZ => {
                if ctx.register(instr.reg(0)) == 0 {
                    next_pc = decode_jump_target(ctx.pc, [0, instr.operands[1], instr.operands[2]]);
                }
            }
            Opcode::JmpNz => {
                if ctx.register(instr.reg(0)) != 0 {
                    next_pc = decode_jump_target(ctx.pc, [0, instr.operands[1], instr.operands[2]]);
                }
            }
            Opcode::Loop => {
                let counter_reg = instr.reg(0);
                let v = ctx.register(counter_reg).wrapping_sub(1);
                ctx.set_register(counter_reg, v);
                if v > 0 {
                    next_pc = decode_jump_target(ctx.pc, [0, instr.operands[1], instr.operands[2]]);
                }
            }
            Opcode::Ret => {
                if ctx.depth <= 1 {
                    return Ok(StopReason::Completed);
                }
                next_pc = ctx.frames[ctx.depth - 1].return_pc;
                ctx.depth -= 1;
            }

            Opcode::Call | Opcode::CallIndirect => {
                let func_index = if instr.opcode == Opcode::Call {
                    instr.reg(0)
                } else {
                    ctx.register(instr.reg(0)) as usize
                };
                let func = image.function(func_index).ok_or(VmStatus::ErrFuncNotFound)?;
                if ctx.depth >= crate::config::MAX_CALL_DEPTH {
                    return Err(VmStatus::CallDepthExceeded);
                }
                let mut frame = Frame::default();
                frame.return_pc = next_pc;
                ctx.frames[ctx.depth] = frame;
                ctx.depth += 1;
                next_pc = func.addr;
            }
            Opcode::CallLib => {
                let index = instr.operands[0];
                let arg_reg = instr.reg(1);
                let dest_reg = instr.reg(2);
                let args = [ctx.register(arg_reg)];
                let mut out = 0i32;
                if !lib.call(index, &args, &mut out) {
                    return Err(VmStatus::Trap);
                }
                ctx.set_register(dest_reg, out);
            }

            Opcode::Suspend => {
                let ticks = ctx.register(instr.reg(0)).max(crate::config::MIN_DELAY as i32) as u32;
                // re-entry lands back on this instruction; advancing pc
                // here (not past it) would re-issue the suspend forever,
                // so the caller must advance the thread's saved pc past
                // this instruction before resuming.
                ctx.pc = next_pc;
                return Ok(StopReason::Suspended(ticks));
            }
            Opcode::Yield => {
                ctx.pc = next_pc;
                return Ok(StopReason::Suspended(0));
            }

            Opcode::Load | Opcode::Store | Opcode::ArrayLoad | Opcode::ArrayStore => {
                // Storage-pool addressing is dispatched by the owning
                // `VmState`, which has the pool tables this interpreter
                // does not; reaching here means the caller didn't
                // intercept it, which is a host wiring bug, not a
                // program error.
                return Err(VmStatus::BadStoragePool);
            }

            Opcode::LoadStr | Opcode::FormatStr => {
                return Err(VmStatus::BadStoragePool);
            }

            Opcode::VecMov | Opcode::VecAdd | Opcode::VecSub | Opcode::VecMul | Opcode::VecDiv | Opcode::VecMod => {
                return Err(VmStatus::PixelMisalign);
            }

            Opcode::Assert => {
                let cond = ctx.register(instr.reg(0));
                if cond == 0 {
                    return Err(VmStatus::Assert);
                }
            }

            Opcode::Halt => return Ok(StopReason::Completed),
            Opcode::Trap => return Err(VmStatus::Trap),
        }

        ctx.pc = next_pc;
    }
}

fn binop_i32(ctx: &mut ThreadContext, instr: crate::vm::isa::Instruction, f: impl Fn(i32, i32) -> i32) {
    let a = ctx.register(instr.reg(1));
    let b = ctx.register(instr.reg(2));
    ctx.set_register(instr.reg(0), f(a, b));
}

fn decode_jump_target(pc: u16, operands: [u8; 3]) -> u16 {
    let rel = i16::from_le_bytes([operands[1], operands[2]]);
    (pc as i32 + rel as i32) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::isa::INSTRUCTION_SIZE;

    fn image_from_words(words: &[[u8; INSTRUCTION_SIZE]]) -> VmImage {
        let mut code = crate::vm::image::heapless_u32::List::new();
        for w in words {
            code.push(u32::from_le_bytes(*w));
        }
        VmImage {
            program_name_hash: 0,
            code,
            functions: [Default::default(); crate::config::VM_MAX_FUNCTIONS],
            function_count: 0,
            global_data: [0; crate::config::VM_MAX_GLOBAL_WORDS * 4],
            global_len: 0,
            constants: [0; crate::config::VM_MAX_CONST_WORDS * 4],
            constants_len: 0,
            strings: [0; crate::config::VM_MAX_STRING_POOL],
            strings_len: 0,
            init_start: 0,
            loop_start: 0,
        }
    }

    #[test]
    fn integer_hello_x_equals_3_plus_4() {
        // r1=3; r2=4; r0=r1+r2; halt
        let image = image_from_words(&[
            [Opcode::LdI32 as u8, 1, 3, 0],
            [Opcode::LdI32 as u8, 2, 4, 0],
            [Opcode::AddI32 as u8, 0, 1, 2],
            [Opcode::Halt as u8, 0, 0, 0],
        ]);
        let mut ctx = ThreadContext::new(0);
        let mut lib = NullLibraryHost;
        let reason = run(&mut ctx, &image, &mut lib).unwrap();
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(ctx.register(0), 7);
    }

    #[test]
    fn fixed_point_mul_three_times_four_is_twelve() {
        let three = 3i32 << F16_SHIFT;
        let four = 4i32 << F16_SHIFT;
        let mut ctx = ThreadContext::new(0);
        ctx.set_register(1, three);
        ctx.set_register(2, four);
        let image = image_from_words(&[
            [Opcode::MulF16 as u8, 0, 1, 2],
            [Opcode::Halt as u8, 0, 0, 0],
        ]);
        let mut lib = NullLibraryHost;
        run(&mut ctx, &image, &mut lib).unwrap();
        assert_eq!(ctx.register(0) >> F16_SHIFT, 12);
    }

    #[test]
    fn divide_by_zero_yields_zero_not_a_trap() {
        let mut ctx = ThreadContext::new(0);
        ctx.set_register(1, 10);
        ctx.set_register(2, 0);
        let image = image_from_words(&[
            [Opcode::DivI32 as u8, 0, 1, 2],
            [Opcode::Halt as u8, 0, 0, 0],
        ]);
        let mut lib = NullLibraryHost;
        run(&mut ctx, &image, &mut lib).unwrap();
        assert_eq!(ctx.register(0), 0);
    }

    #[test]
    fn suspend_returns_requested_delay_and_resumes_past_itself() {
        let mut ctx = ThreadContext::new(0);
        ctx.set_register(1, 20);
        let image = image_from_words(&[
            [Opcode::Suspend as u8, 1, 0, 0],
            [Opcode::Halt as u8, 0, 0, 0],
        ]);
        let mut lib = NullLibraryHost;
        let reason = run(&mut ctx, &image, &mut lib).unwrap();
        assert_eq!(reason, StopReason::Suspended(20));
        assert_eq!(ctx.pc(), 1);
        let reason2 = run(&mut ctx, &image, &mut lib).unwrap();
        assert_eq!(reason2, StopReason::Completed);
    }

    #[test]
    fn infinite_loop_hits_max_cycles_repeatably_without_corruption() {
        let image = image_from_words(&[[Opcode::Jmp as u8, 0, 0x00, 0x00]]);
        let mut ctx = ThreadContext::new(0);
        let mut lib = NullLibraryHost;
        assert_eq!(run(&mut ctx, &image, &mut lib), Err(VmStatus::ErrMaxCycles));
        let mut ctx2 = ThreadContext::new(0);
        assert_eq!(run(&mut ctx2, &image, &mut lib), Err(VmStatus::ErrMaxCycles));
    }
}
