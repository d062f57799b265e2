// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Windows fiber backend.
//!
//! The OS owns fiber stacks here (`CreateFiber` reserves them with its own
//! guard page), so `Stack` is not used. Root contexts have no handle of
//! their own: whichever fiber is running when a root context is switched
//! away from becomes its handle.

use std::cell::Cell;
use std::ffi::c_void;
use std::io;
use std::ptr;

use super::{ContextError, Entry, FiberContext};

#[link(name = "kernel32")]
extern "system" {
    fn ConvertThreadToFiber(param: *mut c_void) -> *mut c_void;
    fn CreateFiber(
        stack_size: usize,
        start: unsafe extern "system" fn(*mut c_void),
        param: *mut c_void,
    ) -> *mut c_void;
    fn SwitchToFiber(fiber: *mut c_void);
    fn DeleteFiber(fiber: *mut c_void);
}

thread_local! {
    static RUNNING: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
}

/// Handle of the running fiber, converting the thread on first use.
fn running_fiber() -> *mut c_void {
    let current = RUNNING.with(Cell::get);
    if !current.is_null() {
        return current;
    }
    let handle = unsafe { ConvertThreadToFiber(ptr::null_mut()) };
    assert!(
        !handle.is_null(),
        "ConvertThreadToFiber failed: {}",
        io::Error::last_os_error()
    );
    RUNNING.with(|r| r.set(handle));
    handle
}

unsafe extern "system" fn fiber_start(param: *mut c_void) {
    let ctx = param as *mut WinFiberContext;
    match (*ctx).start.take() {
        Some((entry, arg)) => entry(arg),
        None => std::process::abort(),
    }
}

#[derive(Debug)]
pub struct WinFiberContext {
    handle: *mut c_void,
    caller: *mut WinFiberContext,
    start: Option<(Entry, *mut c_void)>,
    initialized: bool,
    root: bool,
}

impl FiberContext for WinFiberContext {
    const BACKEND: &'static str = "winfib";

    fn create_root() -> Self {
        Self {
            handle: ptr::null_mut(),
            caller: ptr::null_mut(),
            start: None,
            initialized: true,
            root: true,
        }
    }

    fn create() -> Self {
        Self {
            handle: ptr::null_mut(),
            caller: ptr::null_mut(),
            start: None,
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
        self.start = Some((entry, arg));
        let handle = unsafe { CreateFiber(stack_size, fiber_start, self as *mut Self as *mut c_void) };
        if handle.is_null() {
            self.start = None;
            return Err(ContextError::Alloc(io::Error::last_os_error()));
        }
        self.handle = handle;
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
        if (*from).root {
            (*from).handle = running_fiber();
        }
        (*to).caller = from;
        RUNNING.with(|r| r.set((*to).handle));
        SwitchToFiber((*to).handle);
    }

    unsafe fn yield_to_caller(ctx: *mut Self) {
        let caller = (*ctx).caller;
        assert!(!caller.is_null(), "fiber context has no caller to return to");
        RUNNING.with(|r| r.set((*caller).handle));
        SwitchToFiber((*caller).handle);
    }
}

impl Drop for WinFiberContext {
    fn drop(&mut self) {
        if !self.root && !self.handle.is_null() {
            unsafe { DeleteFiber(self.handle) };
        }
    }
}
