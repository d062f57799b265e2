// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Deferred values.
//!
//! `Deferred<T>` is the producing side and is owned by exactly one
//! producer. `DeferredAwaitable<T>` is the consuming side and can be cloned
//! and awaited any number of times. Continuations run inside the context
//! that was current when the deferred was created.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::awaitable::{Awaitable, Delegate};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::op::{Op, OpQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredStatus {
    Pending,
    Resolved,
    Failed,
}

struct State<T> {
    outcome: RefCell<Option<Result<T>>>,
    continuations: OpQueue<T>,
    context: Context,
}

impl<T: Clone + 'static> State<T> {
    fn new(outcome: Option<Result<T>>) -> Rc<Self> {
        Rc::new(State {
            outcome: RefCell::new(outcome),
            continuations: OpQueue::new(),
            context: Context::current(),
        })
    }

    fn status(&self) -> DeferredStatus {
        match &*self.outcome.borrow() {
            None => DeferredStatus::Pending,
            Some(Ok(_)) => DeferredStatus::Resolved,
            Some(Err(_)) => DeferredStatus::Failed,
        }
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        {
            let mut slot = self.outcome.borrow_mut();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
        }
        self.context.run(|| match outcome {
            Ok(value) => self.continuations.finish_all(value),
            Err(err) => self.continuations.fail_all(&err),
        });
        true
    }
}

/// Producer side of a deferred value.
pub struct Deferred<T: Clone + 'static> {
    state: Rc<State<T>>,
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn new() -> Self {
        Deferred {
            state: State::new(None),
        }
    }

    /// An awaitable that is already resolved with `value`.
    pub fn value(value: T) -> DeferredAwaitable<T> {
        DeferredAwaitable {
            state: State::new(Some(Ok(value))),
        }
    }

    /// An awaitable that has already failed with `error`.
    pub fn error(error: Error) -> DeferredAwaitable<T> {
        DeferredAwaitable {
            state: State::new(Some(Err(error))),
        }
    }

    pub fn awaitable(&self) -> DeferredAwaitable<T> {
        DeferredAwaitable {
            state: Rc::clone(&self.state),
        }
    }

    /// Resolve with `value`. Returns false if already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.state.settle(Ok(value))
    }

    /// Fail with `error`. Returns false if already settled.
    pub fn fail(&self, error: Error) -> bool {
        self.state.settle(Err(error))
    }

    pub fn status(&self) -> DeferredStatus {
        self.state.status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == DeferredStatus::Pending
    }

    /// Feed the outcome of every input to `f` as it arrives.
    ///
    /// `f` receives the combined deferred, whether this is the last input
    /// to settle, the input's index and its outcome. An error from `f`
    /// fails the combined deferred. If it is still pending once every input
    /// settled it fails as disposed.
    pub fn combine<A, F>(awaitables: &[A], f: F) -> Result<DeferredAwaitable<T>>
    where
        A: Awaitable,
        F: FnMut(&Deferred<T>, bool, usize, Result<A::Output>) -> Result<()> + 'static,
    {
        if awaitables.is_empty() {
            return Err(Error::contract("At least one awaitable is required"));
        }

        struct Combine<T: Clone + 'static, F> {
            deferred: RefCell<Option<Rc<Deferred<T>>>>,
            remaining: Cell<usize>,
            f: RefCell<F>,
        }

        let deferred = Deferred::new();
        let combined = deferred.awaitable();
        let shared = Rc::new(Combine {
            deferred: RefCell::new(Some(Rc::new(deferred))),
            remaining: Cell::new(awaitables.len()),
            f: RefCell::new(f),
        });

        for (index, awaitable) in awaitables.iter().enumerate() {
            let op = Op::new();
            let shared = Rc::clone(&shared);
            op.on_complete(move |op: &Op<A::Output>| {
                let outcome = op
                    .take_result()
                    .unwrap_or_else(|| Err(Error::awaitable_disposed()));
                let remaining = shared.remaining.get() - 1;
                shared.remaining.set(remaining);
                let last = remaining == 0;

                let Some(deferred) = shared.deferred.borrow().clone() else {
                    return;
                };
                if deferred.is_pending() {
                    let verdict = {
                        let mut f = shared.f.borrow_mut();
                        (*f)(&*deferred, last, index, outcome)
                    };
                    if let Err(err) = verdict {
                        deferred.fail(err);
                    }
                }
                if last {
                    shared.deferred.borrow_mut().take();
                    deferred.fail(Error::awaitable_disposed());
                }
            });
            awaitable.schedule(&op);
        }
        Ok(combined)
    }

    /// Awaitable settling with `f` applied to the outcome of `awaitable`.
    pub fn transform<A, F>(awaitable: &A, f: F) -> DeferredAwaitable<T>
    where
        A: Awaitable,
        F: FnOnce(Result<A::Output>) -> Result<T> + 'static,
    {
        let deferred = Deferred::new();
        let transformed = deferred.awaitable();
        let op = Op::new();
        op.on_complete(move |op: &Op<A::Output>| {
            let outcome = op
                .take_result()
                .unwrap_or_else(|| Err(Error::awaitable_disposed()));
            match f(outcome) {
                Ok(value) => deferred.resolve(value),
                Err(err) => deferred.fail(err),
            };
        });
        awaitable.schedule(&op);
        transformed
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Drop for Deferred<T> {
    fn drop(&mut self) {
        if self.is_pending() {
            self.fail(Error::awaitable_disposed());
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("status", &self.status())
            .finish()
    }
}

/// Consumer side of a deferred value.
pub struct DeferredAwaitable<T> {
    state: Rc<State<T>>,
}

impl<T> Clone for DeferredAwaitable<T> {
    fn clone(&self) -> Self {
        DeferredAwaitable {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Clone + 'static> DeferredAwaitable<T> {
    pub fn status(&self) -> DeferredStatus {
        self.state.status()
    }
}

impl<T: Clone + 'static> Awaitable for DeferredAwaitable<T> {
    type Output = T;

    fn delegate(&self) -> Delegate<T> {
        match &*self.state.outcome.borrow() {
            None => Delegate::Pending,
            Some(outcome) => outcome.clone().into(),
        }
    }

    fn schedule(&self, op: &Op<T>) {
        let settled = self.state.outcome.borrow().clone();
        match settled {
            None => self.state.continuations.enqueue(op.clone()),
            Some(Ok(value)) => {
                op.finish(value);
            }
            Some(Err(err)) => {
                op.fail(err);
            }
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for DeferredAwaitable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredAwaitable")
            .field("status", &self.status())
            .finish()
    }
}
