// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Context tree.
//!
//! A `Context` is an immutable node pointing at its parent. Deriving a
//! context (`with`, `with_timeout`, `shield`, ...) allocates a new child
//! node; nothing is ever mutated in place. Each node holds its parent and
//! its cancellation handler strongly. Handlers never point back at
//! contexts.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::cancel::{CancelHandler, CancellationHandle};
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;

type ErrorHandler = Rc<dyn Fn(&Error) -> bool>;

thread_local! {
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
    static ROOT: Context = Context::root();
}

/// Identity of a context variable. Values are looked up by identity, not
/// by name.
pub struct ContextVar<T> {
    id: u64,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ContextVar<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ContextVar<T> {
    fn clone(&self) -> Self {
        ContextVar {
            id: self.id,
            name: self.name,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ContextVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextVar")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

struct Node {
    parent: Option<Context>,
    /// `None` as the value hides the variable from this node down.
    entry: Option<(u64, Option<Rc<dyn Any>>)>,
    background: bool,
    cancel: Option<Rc<CancelHandler>>,
    error_handler: Option<ErrorHandler>,
}

#[derive(Clone)]
pub struct Context {
    node: Rc<Node>,
}

impl Context {
    fn root() -> Self {
        Context {
            node: Rc::new(Node {
                parent: None,
                entry: None,
                background: false,
                cancel: None,
                error_handler: None,
            }),
        }
    }

    /// The context code is running in right now.
    pub fn current() -> Context {
        CURRENT
            .with(|c| c.borrow().clone())
            .unwrap_or_else(|| ROOT.with(Context::clone))
    }

    /// The explicitly installed ambient context, if any.
    pub(crate) fn ambient() -> Option<Context> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Make `ctx` the ambient context, returning the previous one.
    pub(crate) fn swap_current(ctx: Option<Context>) -> Option<Context> {
        CURRENT.with(|c| c.replace(ctx))
    }

    /// Fresh background context under the thread's root. Operations awaited
    /// in it do not keep the event loop alive.
    pub fn background() -> Context {
        ROOT.with(|root| root.derive(|n| n.background = true))
    }

    /// New child of the current context that changes nothing.
    pub fn inherit() -> Context {
        Context::current().derive(|_| {})
    }

    /// Allocate a new variable identity.
    pub fn var<T: 'static>(name: &'static str) -> ContextVar<T> {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextVar {
            id: NEXT.fetch_add(1, Ordering::Relaxed),
            name,
            _marker: PhantomData,
        }
    }

    fn derive(&self, edit: impl FnOnce(&mut Node)) -> Context {
        let mut node = Node {
            parent: Some(self.clone()),
            entry: None,
            background: self.node.background,
            cancel: self.node.cancel.clone(),
            error_handler: None,
        };
        edit(&mut node);
        Context {
            node: Rc::new(node),
        }
    }

    fn ancestors(&self) -> impl Iterator<Item = &Context> {
        std::iter::successors(Some(self), |ctx| ctx.node.parent.as_ref())
    }

    /// Value bound to `var` by the nearest node that mentions it.
    pub fn get<T: Clone + 'static>(&self, var: &ContextVar<T>) -> Option<T> {
        self.ancestors()
            .find_map(|ctx| match &ctx.node.entry {
                Some((id, value)) if *id == var.id => Some(value.clone()),
                _ => None,
            })
            .flatten()
            .and_then(|value| value.downcast_ref::<T>().cloned())
    }

    pub fn with<T: 'static>(&self, var: &ContextVar<T>, value: T) -> Context {
        let value: Rc<dyn Any> = Rc::new(value);
        self.derive(|n| n.entry = Some((var.id, Some(value))))
    }

    /// Child in which `var` reads as unset.
    pub fn without<T: 'static>(&self, var: &ContextVar<T>) -> Context {
        self.derive(|n| n.entry = Some((var.id, None)))
    }

    /// Child whose failures are offered to `handler` first. The handler
    /// returns true when it dealt with the error.
    pub fn with_error_handler<F>(&self, handler: F) -> Context
    where
        F: Fn(&Error) -> bool + 'static,
    {
        let handler: ErrorHandler = Rc::new(handler);
        self.derive(|n| n.error_handler = Some(handler))
    }

    /// Offer `error` to the error handlers from this node up to the root.
    /// Returns true once one of them accepts it.
    pub fn handle_error(&self, error: &Error) -> bool {
        self.ancestors()
            .filter_map(|ctx| ctx.node.error_handler.as_ref())
            .any(|handler| handler(error))
    }

    /// Run `f` with this context as the ambient one.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Restore(Option<Context>);
        impl Drop for Restore {
            fn drop(&mut self) {
                Context::swap_current(self.0.take());
            }
        }
        let _restore = Restore(Context::swap_current(Some(self.clone())));
        f()
    }

    /// Child that is cancelled after `timeout`, or when this context is.
    ///
    /// A zero timeout cancels the child immediately without arming a timer.
    pub fn with_timeout(&self, timeout: Duration) -> Context {
        let handler = CancelHandler::child_of(self.node.cancel.as_ref());
        if !handler.is_triggered() {
            if timeout.is_zero() {
                handler.trigger(Error::timed_out());
            } else {
                let scheduler = Scheduler::current();
                let event_loop = scheduler.event_loop_rc();
                let weak = Rc::downgrade(&handler);
                let id = event_loop.add_timer(
                    timeout,
                    None,
                    Rc::new(move || {
                        if let Some(handler) = weak.upgrade() {
                            handler.trigger(Error::timed_out());
                        }
                    }),
                );
                event_loop.set_timer_ref(id, false);
                handler.set_timer(&event_loop, id);
            }
        }
        self.derive(|n| n.cancel = Some(handler))
    }

    /// Child cancelled through the returned handle, or when this context is.
    pub fn with_cancel(&self) -> (Context, CancellationHandle) {
        let handler = CancelHandler::child_of(self.node.cancel.as_ref());
        let handle = CancellationHandle::new(Rc::clone(&handler));
        (self.derive(|n| n.cancel = Some(handler)), handle)
    }

    /// Child detached from every ancestor's cancellation.
    pub fn shield(&self) -> Context {
        self.derive(|n| n.cancel = None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.cancel.as_ref().is_some_and(|c| c.is_triggered())
    }

    pub fn cancel_error(&self) -> Option<Error> {
        self.node.cancel.as_ref().and_then(|c| c.error())
    }

    pub fn throw_if_cancelled(&self) -> Result<()> {
        match self.cancel_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_background(&self) -> bool {
        self.node.background
    }

    pub(crate) fn cancel_handler(&self) -> Option<&Rc<CancelHandler>> {
        self.node.cancel.as_ref()
    }

    pub fn same(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("depth", &(self.ancestors().count() - 1))
            .field("background", &self.node.background)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
