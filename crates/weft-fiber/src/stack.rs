// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Guarded fiber stacks.
//!
//! Each stack is an anonymous private mapping. The lowest `GUARD_PAGES`
//! pages are remapped `PROT_NONE`, so overflowing the usable region faults
//! instead of scribbling over whatever sits below it.

use std::io;
use std::ptr::{self, NonNull};

use crate::context::ContextError;

/// No-access pages placed below the usable region.
pub const GUARD_PAGES: usize = 4;

/// Requests below this are rounded up.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// System page size, falling back to 4 KiB if sysconf refuses.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// An mmap'd stack with guard pages. Grows down from `top()`.
#[derive(Debug)]
pub struct Stack {
    base: NonNull<u8>,
    len: usize,
    guard: usize,
}

impl Stack {
    /// Map a stack with at least `size` usable bytes.
    pub fn new(size: usize) -> Result<Self, ContextError> {
        let page = page_size();
        let usable = size
            .max(MIN_STACK_SIZE)
            .checked_add(page - 1)
            .ok_or(ContextError::StackSize(size))?
            / page
            * page;
        let guard = GUARD_PAGES * page;
        let len = usable
            .checked_add(guard)
            .ok_or(ContextError::StackSize(size))?;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ContextError::Alloc(io::Error::last_os_error()));
        }

        if unsafe { libc::mprotect(ptr, guard, libc::PROT_NONE) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::munmap(ptr, len) };
            return Err(ContextError::Protect(err));
        }

        let base = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| ContextError::Alloc(io::Error::from(io::ErrorKind::OutOfMemory)))?;

        tracing::trace!(usable, guard, "mapped fiber stack");

        Ok(Self { base, len, guard })
    }

    /// One past the highest usable byte. Page aligned.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest usable byte, directly above the guard pages.
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    pub fn usable_size(&self) -> usize {
        self.len - self.guard
    }

    pub fn guard_size(&self) -> usize {
        self.guard
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_rounds_to_pages() {
        let page = page_size();
        let stack = Stack::new(MIN_STACK_SIZE + 1).unwrap();
        assert_eq!(stack.usable_size() % page, 0);
        assert!(stack.usable_size() > MIN_STACK_SIZE);
        assert_eq!(stack.guard_size(), GUARD_PAGES * page);
    }

    #[test]
    fn stack_minimum_applies() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.usable_size() >= MIN_STACK_SIZE);
    }

    #[test]
    fn stack_usable_region_is_writable() {
        let stack = Stack::new(64 * 1024).unwrap();
        assert_eq!(stack.top() as usize % 16, 0);
        unsafe {
            std::ptr::write_bytes(stack.bottom(), 0xAB, stack.usable_size());
            assert_eq!(*stack.top().sub(1), 0xAB);
            assert_eq!(*stack.bottom(), 0xAB);
        }
    }

    #[test]
    fn stack_rejects_overflowing_size() {
        assert!(matches!(
            Stack::new(usize::MAX),
            Err(ContextError::StackSize(_))
        ));
    }
}
