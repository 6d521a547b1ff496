//! i386 implementation.

use core::{arch::asm, ptr};

use sjos_kernel_params::KERNBASE;

use super::Arch;
use crate::{
    env::{FL_IF, TrapFrame},
    memory::PageDir,
};

unsafe extern "C" {
    /// Interactive kernel monitor. Returns when the user exits it.
    fn monitor(tf: *const TrapFrame);
}

pub struct X86;

fn read_eflags() -> u32 {
    let eflags: u32;
    unsafe {
        asm!("pushfd", "pop {}", out(reg) eflags, options(nomem, preserves_flags));
    }
    eflags
}

impl Arch for X86 {
    fn interrupts_enabled() -> bool {
        read_eflags() & FL_IF != 0
    }

    fn enable_interrupts() {
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }

    fn disable_interrupts() {
        unsafe {
            asm!("cli", options(nomem, nostack));
        }
    }

    fn spin_hint() {
        core::hint::spin_loop();
    }

    unsafe fn env_pop_tf(tf: &TrapFrame, pgdir: PageDir) -> ! {
        unsafe {
            asm!("mov cr3, {}", in(reg) pgdir.paddr(), options(nostack, preserves_flags));
            asm!(
                "mov esp, {tf}",
                "popad",
                "pop es",
                "pop ds",
                // skip trapno and errcode
                "add esp, 8",
                "iretd",
                tf = in(reg) ptr::from_ref(tf),
                options(noreturn),
            );
        }
    }

    fn monitor() -> ! {
        loop {
            unsafe { monitor(ptr::null()) };
        }
    }
}

/// Port I/O and low memory access used while starting APs.
pub struct X86Platform;

impl apic::Platform for X86Platform {
    fn outb(&self, port: u16, value: u8) {
        unsafe {
            asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
        }
    }

    fn inb(&self, port: u16) -> u8 {
        let value: u8;
        unsafe {
            asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        }
        value
    }

    fn write_phys_u16(&self, paddr: usize, value: u16) {
        let ptr = ptr::with_exposed_provenance_mut::<u16>(KERNBASE + paddr);
        unsafe { ptr.write_volatile(value) };
    }

    fn micro_delay(&self, _us: u32) {
        // On real hardware this would want to be tuned dynamically.
    }
}
