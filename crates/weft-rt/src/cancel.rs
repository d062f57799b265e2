// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot cancellation handlers.
//!
//! A handler fires at most once. Firing stores the error and drains the
//! registered callbacks in registration order. Child handlers hang off
//! their parent through a registration that holds only a weak reference to
//! the child, so a dropped child simply stops listening.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::Error;
use crate::event_loop::{EventLoop, TimerId};

type Callback = Box<dyn FnOnce(&Error)>;

/// Key of a callback registered on a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CancelKey(u64);

pub(crate) struct CancelHandler {
    error: RefCell<Option<Error>>,
    callbacks: RefCell<VecDeque<(CancelKey, Callback)>>,
    next_key: Cell<u64>,
    /// Registration on the parent handler, removed when this one drops.
    chain: RefCell<Option<(Weak<CancelHandler>, CancelKey)>>,
    timer: RefCell<Option<(Weak<EventLoop>, TimerId)>>,
}

impl CancelHandler {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(CancelHandler {
            error: RefCell::new(None),
            callbacks: RefCell::new(VecDeque::new()),
            next_key: Cell::new(1),
            chain: RefCell::new(None),
            timer: RefCell::new(None),
        })
    }

    /// A handler that fires whenever `parent` fires. If the parent has
    /// already fired the child starts out cancelled with the same error.
    pub(crate) fn child_of(parent: Option<&Rc<CancelHandler>>) -> Rc<Self> {
        let child = CancelHandler::new();
        let Some(parent) = parent else {
            return child;
        };
        if let Some(err) = parent.error() {
            *child.error.borrow_mut() = Some(err);
            return child;
        }
        let weak = Rc::downgrade(&child);
        let key = parent.register(Box::new(move |err| {
            if let Some(child) = weak.upgrade() {
                child.trigger(err.clone());
            }
        }));
        *child.chain.borrow_mut() = Some((Rc::downgrade(parent), key));
        child
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.error.borrow().clone()
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.error.borrow().is_some()
    }

    /// Queue `callback` to run when the handler fires. The caller must not
    /// register on a handler that has already fired.
    pub(crate) fn register(&self, callback: Callback) -> CancelKey {
        debug_assert!(!self.is_triggered());
        let key = CancelKey(self.next_key.get());
        self.next_key.set(key.0 + 1);
        self.callbacks.borrow_mut().push_back((key, callback));
        key
    }

    /// Remove a pending callback. Returns false if it already ran.
    pub(crate) fn detach(&self, key: CancelKey) -> bool {
        let mut callbacks = self.callbacks.borrow_mut();
        match callbacks.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    /// Fire with `error`. Only the first call has any effect.
    pub(crate) fn trigger(&self, error: Error) -> bool {
        {
            let mut slot = self.error.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(error.clone());
        }
        self.release_timer();
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        tracing::debug!(callbacks = callbacks.len(), error = %error, "cancellation triggered");
        for (_, callback) in callbacks {
            callback(&error);
        }
        true
    }

    pub(crate) fn set_timer(&self, event_loop: &Rc<EventLoop>, id: TimerId) {
        *self.timer.borrow_mut() = Some((Rc::downgrade(event_loop), id));
    }

    /// True while this handler or one of its ancestors still has a
    /// timeout armed, i.e. it will fire without outside help.
    pub(crate) fn has_pending_timer(&self) -> bool {
        if self.timer.borrow().is_some() {
            return true;
        }
        let parent = self
            .chain
            .borrow()
            .as_ref()
            .and_then(|(parent, _)| parent.upgrade());
        parent.is_some_and(|p| p.has_pending_timer())
    }

    fn release_timer(&self) {
        if let Some((event_loop, id)) = self.timer.borrow_mut().take() {
            if let Some(event_loop) = event_loop.upgrade() {
                event_loop.cancel_timer(id);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_callbacks(&self) -> usize {
        self.callbacks.borrow().len()
    }
}

impl Drop for CancelHandler {
    fn drop(&mut self) {
        if let Some((parent, key)) = self.chain.get_mut().take() {
            if let Some(parent) = parent.upgrade() {
                parent.detach(key);
            }
        }
        self.release_timer();
    }
}

impl fmt::Debug for CancelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandler")
            .field("error", &self.error.borrow())
            .field("callbacks", &self.callbacks.borrow().len())
            .finish()
    }
}

/// Explicit trigger for a context derived with `Context::with_cancel`.
#[derive(Clone)]
pub struct CancellationHandle {
    handler: Rc<CancelHandler>,
}

impl CancellationHandle {
    pub(crate) fn new(handler: Rc<CancelHandler>) -> Self {
        CancellationHandle { handler }
    }

    /// Cancel the context, chaining `cause` under the cancellation error.
    /// Returns false if it was already cancelled.
    pub fn cancel(&self, cause: Option<Error>) -> bool {
        self.handler.trigger(Error::cancelled(cause))
    }

    pub fn is_cancelled(&self) -> bool {
        self.handler.is_triggered()
    }
}

impl fmt::Debug for CancellationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
