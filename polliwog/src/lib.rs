//! An asynchronous task runtime built around a readiness reactor.
//!
//! The reactor turns OS readiness events and timer expirations into batches
//! of ready continuations; an executor (inline or work-stealing) resumes
//! them. Synchronous calls are offloaded to an elastic blocking pool so they
//! never stall the engine.

#[doc(inline)]
pub use polliwog_macros::main;

#[doc(inline)]
pub use polliwog_macros::test;

pub mod error;
pub use error::IoError;

pub mod executor;

pub mod future;

pub mod reactor;
pub use reactor::{Reactor, Source};

pub mod runtime;
pub use runtime::{Builder, Runtime};

pub(crate) mod task;

#[cfg(test)]
pub(crate) mod test_utils;
