use core::mem;

use dataview::{Pod, PodMethods as _};
use sjos_kernel_params::USTACKTOP;

/// Interrupt enable flag in EFLAGS.
pub const FL_IF: u32 = 0x0000_0200;

/// User text segment selector.
pub const GD_UT: u16 = 0x18;
/// User data segment selector.
pub const GD_UD: u16 = 0x20;
/// Requested privilege level of user mode.
pub const RPL_USER: u16 = 3;

/// Registers as pushed by `pushal`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct PushRegs {
    pub edi: u32,  // 0
    pub esi: u32,  // 4
    pub ebp: u32,  // 8
    pub oesp: u32, // 12, useless & ignored
    pub ebx: u32,  // 16
    pub edx: u32,  // 20
    pub ecx: u32,  // 24
    pub eax: u32,  // 28
}

/// User context saved on kernel entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod)]
pub struct TrapFrame {
    pub regs: PushRegs, // 0
    pub es: u16,        // 32
    pub padding1: u16,
    pub ds: u16, // 36
    pub padding2: u16,
    pub trapno: u32, // 40
    // below here defined by x86 hardware
    pub err: u32, // 44
    pub eip: u32, // 48
    pub cs: u16,  // 52
    pub padding3: u16,
    pub eflags: u32, // 56
    // below here only when crossing rings, such as from user to kernel
    pub esp: u32, // 60
    pub ss: u16,  // 64
    pub padding4: u16,
}

const _: () = assert!(size_of::<TrapFrame>() == 68);

impl TrapFrame {
    // SAFETY: all-zero bytes are a valid `Pod` value.
    pub const EMPTY: Self = unsafe { mem::zeroed() };

    /// Initial context of a new user environment.
    ///
    /// Interrupts are enabled in user mode and the stack starts at
    /// [`USTACKTOP`]. The entry point is set once the image is loaded.
    pub fn user() -> Self {
        let mut tf = Self::zeroed();
        tf.ds = GD_UD | RPL_USER;
        tf.es = GD_UD | RPL_USER;
        tf.ss = GD_UD | RPL_USER;
        tf.cs = GD_UT | RPL_USER;
        tf.eflags = FL_IF;
        #[expect(clippy::cast_possible_truncation)]
        let esp = USTACKTOP as u32;
        tf.esp = esp;
        tf
    }

    /// System call arguments, in order.
    pub fn syscall_args(&self) -> [u32; 5] {
        let r = &self.regs;
        [r.edx, r.ecx, r.ebx, r.edi, r.esi]
    }
}
