// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The awaitable protocol.

use crate::error::{Error, Result};
use crate::op::{await_op, Op};

/// Outcome as far as it is known right now.
#[derive(Debug, Clone)]
pub enum Delegate<T> {
    Pending,
    Resolved(T),
    Failed(Error),
}

impl<T> Delegate<T> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Delegate::Pending)
    }
}

impl<T> From<Result<T>> for Delegate<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Delegate::Resolved(value),
            Err(err) => Delegate::Failed(err),
        }
    }
}

/// Something that eventually produces a value or an error.
///
/// Implementors provide a non-blocking `delegate` poll and `schedule`,
/// which arranges for `op` to be completed with the final outcome. An op
/// scheduled on an awaitable that is already settled must be completed
/// right away.
pub trait Awaitable {
    type Output: Clone + 'static;

    fn delegate(&self) -> Delegate<Self::Output>;

    fn schedule(&self, op: &Op<Self::Output>);

    /// Suspend until the outcome is known.
    fn wait(&self) -> Result<Self::Output> {
        match self.delegate() {
            Delegate::Resolved(value) => Ok(value),
            Delegate::Failed(err) => Err(err),
            Delegate::Pending => {
                let op = Op::new();
                self.schedule(&op);
                await_op(&op)
            }
        }
    }
}
