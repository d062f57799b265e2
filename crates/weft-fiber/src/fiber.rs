// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Typed fibers with value passing.
//!
//! `Fiber<In, Out>` moves an `In` into the fiber on every `start`/`resume`
//! and an `Out` back on every suspension and on completion. Values cross
//! the switch through a shared exchange slot; errors injected with `throw`
//! come out of the pending `Suspender::suspend` call.

use std::cell::Cell;
use std::error::Error as StdError;
use std::fmt;
use std::rc::Rc;

use crate::error::FiberError;
use crate::raw::{Exit, FiberId, FiberStatus, RawFiber};
use crate::DEFAULT_STACK_SIZE;

/// What a switching call observed when control came back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// The fiber suspended with this value.
    Yield(T),
    /// The fiber returned this value.
    Complete(T),
}

struct Exchange<In, Out> {
    input: Cell<Option<In>>,
    output: Cell<Option<Out>>,
    outcome: Cell<Option<Result<Out, FiberError>>>,
    thrown: Cell<Option<Box<dyn StdError>>>,
}

impl<In, Out> Default for Exchange<In, Out> {
    fn default() -> Self {
        Self {
            input: Cell::new(None),
            output: Cell::new(None),
            outcome: Cell::new(None),
            thrown: Cell::new(None),
        }
    }
}

/// Handle a fiber body uses to yield.
pub struct Suspender<In, Out> {
    exchange: Rc<Exchange<In, Out>>,
    fiber: Option<FiberId>,
}

impl<In, Out> Suspender<In, Out> {
    /// Hand `value` to the resumer and wait to be resumed.
    pub fn suspend(&self, value: Out) -> Result<In, FiberError> {
        if RawFiber::current_id() != self.fiber {
            return Err(FiberError::NotInFiber);
        }
        self.exchange.output.set(Some(value));
        RawFiber::suspend()?;
        if let Some(err) = self.exchange.thrown.take() {
            return Err(FiberError::Thrown(err));
        }
        self.exchange.input.take().ok_or(FiberError::NoValue)
    }
}

/// Stackful coroutine taking `In` values and producing `Out` values.
pub struct Fiber<In, Out> {
    raw: RawFiber,
    exchange: Rc<Exchange<In, Out>>,
}

impl<In: 'static, Out: 'static> Fiber<In, Out> {
    #[track_caller]
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Suspender<In, Out>, In) -> Result<Out, FiberError> + 'static,
    {
        Self::with_stack_size(DEFAULT_STACK_SIZE, body)
    }

    #[track_caller]
    pub fn with_stack_size<F>(stack_size: usize, body: F) -> Self
    where
        F: FnOnce(&Suspender<In, Out>, In) -> Result<Out, FiberError> + 'static,
    {
        let exchange: Rc<Exchange<In, Out>> = Rc::new(Exchange::default());
        let shared = Rc::clone(&exchange);
        let raw = RawFiber::new(stack_size, move || {
            let suspender = Suspender {
                exchange: Rc::clone(&shared),
                fiber: RawFiber::current_id(),
            };
            let result = match shared.input.take() {
                Some(input) => body(&suspender, input),
                None => Err(FiberError::NoValue),
            };
            let exit = if result.is_ok() {
                Exit::Finished
            } else {
                Exit::Failed
            };
            shared.outcome.set(Some(result));
            exit
        });
        Fiber { raw, exchange }
    }
}

impl<In, Out> Fiber<In, Out> {
    pub fn start(&mut self, input: In) -> Result<Step<Out>, FiberError> {
        if self.raw.status() != FiberStatus::Init {
            return Err(FiberError::AlreadyStarted);
        }
        self.exchange.input.set(Some(input));
        self.raw.start()?;
        self.collect()
    }

    pub fn resume(&mut self, input: In) -> Result<Step<Out>, FiberError> {
        if self.raw.status() != FiberStatus::Suspended {
            return Err(FiberError::NotSuspended);
        }
        self.exchange.input.set(Some(input));
        self.raw.resume()?;
        self.collect()
    }

    /// Resume the fiber with an error. Its pending `suspend` returns
    /// `FiberError::Thrown(error)`.
    pub fn throw<E>(&mut self, error: E) -> Result<Step<Out>, FiberError>
    where
        E: Into<Box<dyn StdError>>,
    {
        if self.raw.status() != FiberStatus::Suspended {
            return Err(FiberError::NotSuspended);
        }
        self.exchange.thrown.set(Some(error.into()));
        self.raw.resume()?;
        self.collect()
    }

    fn collect(&self) -> Result<Step<Out>, FiberError> {
        match self.raw.status() {
            FiberStatus::Suspended => self
                .exchange
                .output
                .take()
                .map(Step::Yield)
                .ok_or(FiberError::NoValue),
            FiberStatus::Finished | FiberStatus::Failed => match self.exchange.outcome.take() {
                Some(Ok(value)) => Ok(Step::Complete(value)),
                Some(Err(err)) => Err(err),
                None => Err(FiberError::NoValue),
            },
            _ => Err(FiberError::NoValue),
        }
    }

    pub fn status(&self) -> FiberStatus {
        self.raw.status()
    }

    pub fn id(&self) -> FiberId {
        self.raw.id()
    }

    /// Name of the stack-switching backend in use.
    pub fn backend() -> &'static str {
        crate::backend()
    }
}

impl<In, Out> fmt::Debug for Fiber<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("raw", &self.raw).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fiber_yield_and_resume_values() {
        let mut fiber = Fiber::new(|s: &Suspender<i32, String>, first: i32| {
            let mut seen = vec![first];
            for i in 0..3 {
                seen.push(s.suspend(format!("yield {i}"))?);
            }
            Ok(format!("{seen:?}"))
        });

        assert_eq!(fiber.start(10).unwrap(), Step::Yield("yield 0".into()));
        assert_eq!(fiber.resume(11).unwrap(), Step::Yield("yield 1".into()));
        assert_eq!(fiber.resume(12).unwrap(), Step::Yield("yield 2".into()));
        assert_eq!(
            fiber.resume(13).unwrap(),
            Step::Complete("[10, 11, 12, 13]".into())
        );
        assert_eq!(fiber.status(), FiberStatus::Finished);
    }

    #[test]
    fn fiber_start_twice_fails() {
        let mut fiber = Fiber::new(|_: &Suspender<(), ()>, ()| Ok(()));
        fiber.start(()).unwrap();
        let err = fiber.start(()).unwrap_err();
        assert_eq!(err.to_string(), "Cannot start Fiber that has already been started");
    }

    #[test]
    fn fiber_resume_unstarted_fails() {
        let mut fiber = Fiber::new(|_: &Suspender<(), ()>, ()| Ok(()));
        let err = fiber.resume(()).unwrap_err();
        assert_eq!(err.to_string(), "Non-suspended Fiber cannot be resumed");
        assert!(err.is_contract_violation());
    }

    #[test]
    fn fiber_throw_reaches_suspend_point() {
        let mut fiber = Fiber::new(|s: &Suspender<u8, &'static str>, _| {
            match s.suspend("waiting") {
                Err(FiberError::Thrown(e)) => Ok(if e.to_string() == "nope" {
                    "caught"
                } else {
                    "wrong error"
                }),
                Err(e) => Err(e),
                Ok(_) => Ok("resumed normally"),
            }
        });
        fiber.start(0).unwrap();
        assert_eq!(fiber.throw("nope").unwrap(), Step::Complete("caught"));
    }

    #[test]
    fn fiber_throw_requires_suspension() {
        let mut fiber = Fiber::new(|_: &Suspender<(), ()>, ()| Ok(()));
        assert!(matches!(fiber.throw("x"), Err(FiberError::NotSuspended)));
    }

    #[test]
    fn fiber_body_error_marks_failed() {
        let mut fiber = Fiber::new(|_: &Suspender<(), ()>, ()| Err(FiberError::Destroyed));
        assert!(matches!(fiber.start(()), Err(FiberError::Destroyed)));
        assert_eq!(fiber.status(), FiberStatus::Failed);
    }

    #[test]
    fn fiber_panic_is_captured() {
        let mut fiber = Fiber::new(|_: &Suspender<(), ()>, ()| -> Result<(), FiberError> {
            panic!("kaboom")
        });
        match fiber.start(()) {
            Err(FiberError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn nested_fiber_runs_inside_outer() {
        let mut outer = Fiber::new(|s: &Suspender<(), u8>, ()| {
            let mut inner = Fiber::new(|_: &Suspender<(), u8>, ()| Ok(1u8));
            inner.start(())?;
            s.suspend(2)?;
            Ok(3)
        });
        assert_eq!(outer.start(()).unwrap(), Step::Yield(2));
        assert_eq!(outer.resume(()).unwrap(), Step::Complete(3));
    }

    #[test]
    fn backend_is_named() {
        assert!(!Fiber::<(), ()>::backend().is_empty());
    }

    proptest! {
        #[test]
        fn resume_values_arrive_in_order(values in proptest::collection::vec(any::<i64>(), 1..16)) {
            let expected = values.clone();
            let mut fiber = Fiber::with_stack_size(64 * 1024, |s: &Suspender<i64, usize>, first: i64| {
                let mut seen = vec![first];
                loop {
                    match s.suspend(seen.len()) {
                        Ok(v) => seen.push(v),
                        Err(FiberError::Thrown(_)) => break,
                        Err(e) => return Err(e),
                    }
                }
                Ok(seen.iter().fold(0i64, |a, b| a.wrapping_add(*b)) as usize ^ seen.len())
            });

            let mut observed = Vec::new();
            let mut step = fiber.start(values[0]).unwrap();
            observed.push(values[0]);
            for v in &values[1..] {
                prop_assert!(matches!(step, Step::Yield(n) if n == observed.len()));
                step = fiber.resume(*v).unwrap();
                observed.push(*v);
            }
            prop_assert_eq!(&observed, &expected);
            let done = fiber.throw("stop").unwrap();
            let sum = expected.iter().fold(0i64, |a, b| a.wrapping_add(*b));
            prop_assert_eq!(done, Step::Complete(sum as usize ^ expected.len()));
        }
    }
}
