// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! glibc ucontext backend.
//!
//! `makecontext` only passes `int` arguments portably, so the entry point
//! and its argument travel through a thread-local that the switch fills in
//! right before the first `swapcontext` into a fresh context.

use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::ptr;

use super::{ContextError, Entry, FiberContext};
use crate::stack::Stack;

thread_local! {
    static STARTING: Cell<Option<(Entry, *mut c_void)>> = const { Cell::new(None) };
}

extern "C" fn trampoline() {
    match STARTING.with(Cell::take) {
        Some((entry, arg)) => unsafe { entry(arg) },
        None => std::process::abort(),
    }
}

/// Context saved with `swapcontext`. The `ucontext_t` is boxed because
/// glibc stores pointers into the structure itself.
pub struct UContext {
    uc: Box<libc::ucontext_t>,
    caller: *mut UContext,
    stack: Option<Stack>,
    start: Option<(Entry, *mut c_void)>,
    initialized: bool,
    root: bool,
}

impl UContext {
    fn blank(root: bool) -> Self {
        Self {
            uc: Box::new(unsafe { std::mem::zeroed() }),
            caller: ptr::null_mut(),
            stack: None,
            start: None,
            initialized: root,
            root,
        }
    }
}

impl std::fmt::Debug for UContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UContext")
            .field("initialized", &self.initialized)
            .field("root", &self.root)
            .field("stack", &self.stack)
            .finish()
    }
}

impl FiberContext for UContext {
    const BACKEND: &'static str = "ucontext";

    fn create_root() -> Self {
        Self::blank(true)
    }

    fn create() -> Self {
        Self::blank(false)
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

        let uc: *mut libc::ucontext_t = &mut *self.uc;
        unsafe {
            if libc::getcontext(uc) != 0 {
                return Err(ContextError::Init(io::Error::last_os_error()));
            }
            (*uc).uc_stack.ss_sp = stack.bottom() as *mut c_void;
            (*uc).uc_stack.ss_size = stack.usable_size();
            (*uc).uc_stack.ss_flags = 0;
            (*uc).uc_link = ptr::null_mut();
            libc::makecontext(uc, trampoline, 0);
        }

        self.stack = Some(stack);
        self.start = Some((entry, arg));
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
        if let Some(start) = (*to).start.take() {
            STARTING.with(|s| s.set(Some(start)));
        }
        (*to).caller = from;
        let rc = libc::swapcontext(&mut *(*from).uc, &*(*to).uc);
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }

    unsafe fn yield_to_caller(ctx: *mut Self) {
        let caller = (*ctx).caller;
        assert!(!caller.is_null(), "fiber context has no caller to return to");
        let rc = libc::swapcontext(&mut *(*ctx).uc, &*(*caller).uc);
        assert_eq!(rc, 0, "swapcontext failed: {}", io::Error::last_os_error());
    }
}
