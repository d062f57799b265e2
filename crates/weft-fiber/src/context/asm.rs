// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Assembly backend.
//!
//! `weft_fiber_switch(from_sp, to_sp)` pushes the callee-saved registers
//! (plus the FP control state the ABI treats as callee-saved), stores the
//! stack pointer through `from_sp`, loads `to_sp`, pops the same frame and
//! returns into whatever that frame's return address is. A fresh context
//! gets a hand-built frame whose return address is the trampoline.

use std::arch::global_asm;
use std::ffi::c_void;
use std::ptr;

use super::{ContextError, Entry, FiberContext};
use crate::stack::Stack;

extern "C" {
    fn weft_fiber_switch(from_sp: *mut *mut c_void, to_sp: *mut c_void);
    fn weft_fiber_trampoline();
}

#[cfg(target_arch = "x86_64")]
global_asm!(
    ".text",
    ".globl weft_fiber_switch",
    ".p2align 4",
    "weft_fiber_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    "mov qword ptr [rdi], rsp",
    "mov rsp, rsi",
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".globl weft_fiber_trampoline",
    ".p2align 4",
    "weft_fiber_trampoline:",
    "mov rdi, r13",
    "call r12",
    "ud2",
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    ".text",
    ".globl weft_fiber_switch",
    ".p2align 2",
    "weft_fiber_switch:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "mov sp, x1",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
    ".globl weft_fiber_trampoline",
    ".p2align 2",
    "weft_fiber_trampoline:",
    "mov x0, x20",
    "blr x19",
    "brk #0",
);

/// Lay out the first frame `weft_fiber_switch` will pop.
///
/// Frame (low to high): control words, r15, r14, r13 = arg, r12 = entry,
/// rbx, rbp = 0, return address = trampoline. The trampoline runs with
/// `rsp` 16-byte aligned so `call` leaves the entry with the usual
/// misalignment of 8.
#[cfg(target_arch = "x86_64")]
unsafe fn prepare_frame(top: *mut u8, entry: Entry, arg: *mut c_void) -> *mut c_void {
    const MXCSR_DEFAULT: u64 = 0x1F80;
    const FPU_CW_DEFAULT: u64 = 0x037F;

    let top = (top as usize) & !15;
    let sp = (top - 80) as *mut u64;
    let frame: [u64; 10] = [
        (FPU_CW_DEFAULT << 32) | MXCSR_DEFAULT,
        0,
        0,
        arg as u64,
        entry as *const () as usize as u64,
        0,
        0,
        weft_fiber_trampoline as *const () as usize as u64,
        0,
        0,
    ];
    ptr::copy_nonoverlapping(frame.as_ptr(), sp, frame.len());
    sp as *mut c_void
}

/// Frame (low to high): x19 = entry, x20 = arg, x21..x28, x29 = 0,
/// x30 = trampoline, d8..d15.
#[cfg(target_arch = "aarch64")]
unsafe fn prepare_frame(top: *mut u8, entry: Entry, arg: *mut c_void) -> *mut c_void {
    let top = (top as usize) & !15;
    let sp = (top - 160) as *mut u64;
    ptr::write_bytes(sp, 0, 20);
    *sp = entry as *const () as usize as u64;
    *sp.add(1) = arg as u64;
    *sp.add(11) = weft_fiber_trampoline as *const () as usize as u64;
    sp as *mut c_void
}

/// Context driven by `weft_fiber_switch`.
#[derive(Debug)]
pub struct AsmContext {
    sp: *mut c_void,
    caller: *mut AsmContext,
    stack: Option<Stack>,
    initialized: bool,
    root: bool,
}

impl FiberContext for AsmContext {
    #[cfg(target_arch = "x86_64")]
    const BACKEND: &'static str = "asm (x86_64 sysv)";
    #[cfg(target_arch = "aarch64")]
    const BACKEND: &'static str = "asm (aarch64 aapcs)";

    fn create_root() -> Self {
        Self {
            sp: ptr::null_mut(),
            caller: ptr::null_mut(),
            stack: None,
            initialized: true,
            root: true,
        }
    }

    fn create() -> Self {
        Self {
            sp: ptr::null_mut(),
            caller: ptr::null_mut(),
            stack: None,
            initialized: false,
            root: false,
        }
    }

    fn init(
        &mut self,
        entry: Entry,
        arg: *mut c_void,
        stack_size: usize,
    ) -> Result<(), ContextError> {
        if self.initialized {
            return Err(ContextError::AlreadyInitialized);
        }
        let stack = Stack::new(stack_size)?;
        self.sp = unsafe { prepare_frame(stack.top(), entry, arg) };
        self.stack = Some(stack);
        self.initialized = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_root(&self) -> bool {
        self.root
    }

    unsafe fn switch(from: *mut Self, to: *mut Self) {
        assert!(
            (*to).initialized,
            "cannot switch into an uninitialized fiber context"
        );
        (*to).caller = from;
        weft_fiber_switch(ptr::addr_of_mut!((*from).sp), (*to).sp);
    }

    unsafe fn yield_to_caller(ctx: *mut Self) {
        let caller = (*ctx).caller;
        assert!(!caller.is_null(), "fiber context has no caller to return to");
        weft_fiber_switch(ptr::addr_of_mut!((*ctx).sp), (*caller).sp);
    }
}
