//! Deterministic, pure logic shared by the kernel.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests. Time
//! is always passed in by the caller.

pub mod breaker;
pub mod classifier;
pub mod deadline;
pub mod microloop;
pub mod progress;
pub mod router;
pub mod signature;
pub mod types;
