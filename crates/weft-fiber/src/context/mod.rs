// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Stack-switch primitive.
//!
//! A `FiberContext` is saved machine state plus (for non-root contexts) the
//! stack it runs on. Backends are interchangeable; `DefaultContext` picks
//! the best one for the target:
//!
//! - `asm`: hand-written switch for x86_64/aarch64 on non-Apple unix
//! - `ucontext`: glibc getcontext/makecontext/swapcontext (x86_64 Linux,
//!   kept as an alternative to `asm` and exercised by the same tests)
//! - `winfib`: Windows fiber API
//!
//! Contexts are handled through raw pointers because a switch "returns"
//! only when some other context switches back, long after any borrow taken
//! at the call site would have ended. Callers keep contexts at a stable
//! address (boxed) for as long as they may be switched to.

use std::ffi::c_void;
use std::io;

#[cfg(all(
    unix,
    not(target_vendor = "apple"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub mod asm;
#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
pub mod ucontext;
#[cfg(windows)]
pub mod winfib;

/// Function a fresh context starts in. Must never return; it leaves by
/// switching away for the last time.
pub type Entry = unsafe extern "C" fn(*mut c_void) -> !;

/// Failure to set up a context. Switching itself cannot fail recoverably.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("invalid fiber stack size: {0} bytes")]
    StackSize(usize),

    #[error("failed to allocate fiber stack: {0}")]
    Alloc(#[source] io::Error),

    #[error("failed to protect fiber stack guard pages: {0}")]
    Protect(#[source] io::Error),

    #[error("failed to prepare fiber context: {0}")]
    Init(#[source] io::Error),

    #[error("fiber context has already been initialized")]
    AlreadyInitialized,
}

/// Uniform contract over the platform backends.
pub trait FiberContext: Sized {
    /// Human readable backend name.
    const BACKEND: &'static str;

    /// Wrap whatever stack the caller is running on. Never owns a stack.
    fn create_root() -> Self;

    /// An empty context. `init` must run before anything switches into it.
    fn create() -> Self;

    /// Allocate a guarded stack and arrange for the first switch into this
    /// context to call `entry(arg)` on it.
    fn init(&mut self, entry: Entry, arg: *mut c_void, stack_size: usize)
        -> Result<(), ContextError>;

    fn is_initialized(&self) -> bool;

    fn is_root(&self) -> bool;

    /// Save the running state into `from` and continue in `to`. Returns
    /// when something switches back into `from`. `from` becomes `to`'s
    /// caller.
    ///
    /// # Safety
    /// Both pointers must be valid for the whole time either context may
    /// still be switched to, `from` must describe the code that is running
    /// now, and `to` must be initialized.
    unsafe fn switch(from: *mut Self, to: *mut Self);

    /// Switch back to whoever last switched into `ctx`.
    ///
    /// # Safety
    /// `ctx` must be the running context and its caller must still be alive.
    unsafe fn yield_to_caller(ctx: *mut Self);
}

#[cfg(all(
    unix,
    not(target_vendor = "apple"),
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub type DefaultContext = asm::AsmContext;

#[cfg(windows)]
pub type DefaultContext = winfib::WinFiberContext;

#[cfg(not(any(
    windows,
    all(
        unix,
        not(target_vendor = "apple"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    )
)))]
compile_error!("weft-fiber has no stack-switching backend for this target");

/// Contract tests shared by every backend.
#[cfg(test)]
mod conformance {
    use super::*;
    use std::cell::Cell;

    pub(super) struct Fixture<C> {
        pub ctx: *mut C,
        pub hits: Cell<u32>,
    }

    pub(super) unsafe extern "C" fn fixture_entry<C: FiberContext>(arg: *mut c_void) -> ! {
        let fixture = &*(arg as *const Fixture<C>);
        loop {
            fixture.hits.set(fixture.hits.get() + 1);
            C::yield_to_caller(fixture.ctx);
        }
    }

    #[inline(never)]
    fn burn_stack(depth: u32) -> u64 {
        let buf = [depth as u8; 512];
        if depth == 0 {
            buf.iter().map(|b| *b as u64).sum()
        } else {
            burn_stack(depth - 1) + buf[7] as u64
        }
    }

    pub(super) unsafe extern "C" fn deep_entry<C: FiberContext>(arg: *mut c_void) -> ! {
        let fixture = &*(arg as *const Fixture<C>);
        let total = burn_stack(32);
        fixture.hits.set(total as u32);
        loop {
            C::yield_to_caller(fixture.ctx);
        }
    }

    pub(super) fn root_context_flags<C: FiberContext>() {
        let root = C::create_root();
        assert!(root.is_root());
        assert!(root.is_initialized());

        let ctx = C::create();
        assert!(!ctx.is_root());
        assert!(!ctx.is_initialized());
    }

    pub(super) fn init_marks_initialized<C: FiberContext>() {
        let mut ctx = Box::new(C::create());
        let fixture = Box::new(Fixture::<C> {
            ctx: &mut *ctx,
            hits: Cell::new(0),
        });
        ctx.init(fixture_entry::<C>, &*fixture as *const _ as *mut c_void, 64 * 1024)
            .unwrap();
        assert!(ctx.is_initialized());
        assert!(!ctx.is_root());
    }

    pub(super) fn init_twice_is_rejected<C: FiberContext>() {
        let mut ctx = Box::new(C::create());
        let fixture = Box::new(Fixture::<C> {
            ctx: &mut *ctx,
            hits: Cell::new(0),
        });
        let arg = &*fixture as *const _ as *mut c_void;
        ctx.init(fixture_entry::<C>, arg, 64 * 1024).unwrap();
        assert!(matches!(
            ctx.init(fixture_entry::<C>, arg, 64 * 1024),
            Err(ContextError::AlreadyInitialized)
        ));
    }

    pub(super) fn switch_round_trips<C: FiberContext>() {
        let mut root = Box::new(C::create_root());
        let mut ctx = Box::new(C::create());
        let fixture = Box::new(Fixture::<C> {
            ctx: &mut *ctx,
            hits: Cell::new(0),
        });
        ctx.init(fixture_entry::<C>, &*fixture as *const _ as *mut c_void, 64 * 1024)
            .unwrap();

        for expected in 1..=5 {
            unsafe { C::switch(&mut *root, &mut *ctx) };
            assert_eq!(fixture.hits.get(), expected);
        }
    }

    pub(super) fn contexts_interleave<C: FiberContext>() {
        let mut root = Box::new(C::create_root());
        let mut a = Box::new(C::create());
        let mut b = Box::new(C::create());
        let pa = Box::new(Fixture::<C> {
            ctx: &mut *a,
            hits: Cell::new(0),
        });
        let pb = Box::new(Fixture::<C> {
            ctx: &mut *b,
            hits: Cell::new(0),
        });
        a.init(fixture_entry::<C>, &*pa as *const _ as *mut c_void, 64 * 1024)
            .unwrap();
        b.init(fixture_entry::<C>, &*pb as *const _ as *mut c_void, 64 * 1024)
            .unwrap();

        unsafe {
            C::switch(&mut *root, &mut *a);
            C::switch(&mut *root, &mut *b);
            C::switch(&mut *root, &mut *b);
            C::switch(&mut *root, &mut *a);
            C::switch(&mut *root, &mut *b);
        }
        assert_eq!(pa.hits.get(), 2);
        assert_eq!(pb.hits.get(), 3);
    }

    pub(super) fn fresh_stack_supports_deep_calls<C: FiberContext>() {
        let mut root = Box::new(C::create_root());
        let mut ctx = Box::new(C::create());
        let fixture = Box::new(Fixture::<C> {
            ctx: &mut *ctx,
            hits: Cell::new(0),
        });
        ctx.init(deep_entry::<C>, &*fixture as *const _ as *mut c_void, 128 * 1024)
            .unwrap();
        unsafe { C::switch(&mut *root, &mut *ctx) };
        assert_eq!(fixture.hits.get(), burn_stack(32) as u32);
    }

    macro_rules! backend_conformance {
        ($($name:ident => $ctx:ty),* $(,)?) => {
            $(
                mod $name {
                    use super::*;

                    #[test]
                    fn root_context_flags() {
                        super::root_context_flags::<$ctx>();
                    }

                    #[test]
                    fn init_marks_initialized() {
                        super::init_marks_initialized::<$ctx>();
                    }

                    #[test]
                    fn init_twice_is_rejected() {
                        super::init_twice_is_rejected::<$ctx>();
                    }

                    #[test]
                    fn switch_round_trips() {
                        super::switch_round_trips::<$ctx>();
                    }

                    #[test]
                    fn contexts_interleave() {
                        super::contexts_interleave::<$ctx>();
                    }

                    #[test]
                    fn fresh_stack_supports_deep_calls() {
                        super::fresh_stack_supports_deep_calls::<$ctx>();
                    }
                }
            )*
        };
    }

    #[cfg(all(
        unix,
        not(target_vendor = "apple"),
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    backend_conformance!(asm_backend => super::super::asm::AsmContext);

    #[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
    backend_conformance!(ucontext_backend => super::super::ucontext::UContext);

    #[cfg(windows)]
    backend_conformance!(winfib_backend => super::super::winfib::WinFiberContext);
}
