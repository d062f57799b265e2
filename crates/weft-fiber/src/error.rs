// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fiber errors.

use crate::context::ContextError;

/// Contract violations and failures reported by fiber operations.
#[derive(Debug, thiserror::Error)]
pub enum FiberError {
    #[error("Cannot start Fiber that has already been started")]
    AlreadyStarted,

    #[error("Non-suspended Fiber cannot be resumed")]
    NotSuspended,

    #[error("Cannot yield from outside a fiber")]
    NotInFiber,

    #[error("Fiber has been destroyed")]
    Destroyed,

    #[error("fiber panicked: {0}")]
    Panicked(String),

    /// Error injected with `Fiber::throw`, observed by the suspended side.
    #[error("{0}")]
    Thrown(Box<dyn std::error::Error>),

    #[error("fiber switched back without delivering a value")]
    NoValue,

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl FiberError {
    /// True for errors caused by misusing the fiber API rather than by
    /// what ran on the fiber.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            FiberError::AlreadyStarted | FiberError::NotSuspended | FiberError::NotInFiber
        )
    }
}
