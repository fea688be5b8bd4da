//! FX-VM facade: ties the loaded `VmImage` to a `Scheduler` and a pixel
//! buffer, the same three-piece split `vm_core.c` draws between the
//! loader, the thread table, and `gfx_lib.c`.

pub mod gfx;
pub mod image;
pub mod interp;
pub mod isa;
pub mod scheduler;

use log::info;

use crate::config::VM_MAX_PIXELS;
use crate::error::VmStatus;
use crate::time::MonotonicClock;
use gfx::{GraphicsBuffer, Pixel};
use image::VmImage;
use interp::LibraryHost;
use scheduler::Scheduler;

/// Fixed-capacity pixel array backing one VM's `PIXEL_ARRAY` pool.
pub struct PixelPool {
    pixels: [Pixel; VM_MAX_PIXELS],
    len: usize,
}

impl PixelPool {
    pub fn new(len: usize) -> Self {
        PixelPool { pixels: [Pixel::default(); VM_MAX_PIXELS], len: len.min(VM_MAX_PIXELS) }
    }
}

impl GraphicsBuffer for PixelPool {
    fn pixel_count(&self) -> usize {
        self.len
    }
    fn get(&self, index: usize) -> Pixel {
        self.pixels[index]
    }
    fn set(&mut self, index: usize, p: Pixel) {
        self.pixels[index] = p;
    }
}

/// One running instance of a loaded program: the image, its scheduler,
/// and the pixel pool its `vec*` opcodes and `gfx_lib_call` address.
pub struct VmState {
    image: VmImage,
    scheduler: Scheduler,
    pixels: PixelPool,
    initialized: bool,
}

impl VmState {
    pub fn new(image: VmImage, pixel_count: usize) -> Self {
        VmState { image, scheduler: Scheduler::new(), pixels: PixelPool::new(pixel_count), initialized: false }
    }

    pub fn image(&self) -> &VmImage {
        &self.image
    }

    pub fn pixels(&self) -> &PixelPool {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut PixelPool {
        &mut self.pixels
    }

    /// Run the image's `init` entry point once, then start its `loop`
    /// entry point as thread 0. Idempotent: calling this again on an
    /// already-initialized VM is a no-op, matching the original's guard
    /// against a double `vm_i8_init`.
    pub fn init<L: LibraryHost>(&mut self, lib: &mut L) -> Result<(), VmStatus> {
        if self.initialized {
            return Ok(());
        }
        self.scheduler.run_init(&self.image, lib)?;
        self.scheduler.thread_start(self.image.loop_start)?;
        self.initialized = true;
        info!("vm initialized, hash={:#x}", self.image.program_name_hash);
        Ok(())
    }

    pub fn run_tick<L: LibraryHost, C: MonotonicClock>(
        &mut self,
        delta_ticks: u64,
        lib: &mut L,
        clock: &C,
    ) -> Result<(), VmStatus> {
        self.scheduler.run_tick(delta_ticks, &self.image, lib, clock)
    }

    pub fn tick(&self) -> u64 {
        self.scheduler.tick()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockClock;
    use interp::NullLibraryHost;

    fn trivial_image() -> VmImage {
        use crate::vm::image::heapless_u32::List;
        use crate::vm::isa::Opcode;
        let mut code = List::new();
        code.push(u32::from_le_bytes([Opcode::Halt as u8, 0, 0, 0]));
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
    fn init_is_idempotent() {
        let mut vm = VmState::new(trivial_image(), 8);
        let mut lib = NullLibraryHost;
        vm.init(&mut lib).unwrap();
        vm.init(&mut lib).unwrap();
    }

    #[test]
    fn run_tick_advances_clock_and_dispatches_threads() {
        let mut vm = VmState::new(trivial_image(), 8);
        let mut lib = NullLibraryHost;
        let clock = MockClock::new();
        vm.init(&mut lib).unwrap();
        vm.run_tick(1, &mut lib, &clock).unwrap();
        assert_eq!(vm.tick(), 1);
    }
}
