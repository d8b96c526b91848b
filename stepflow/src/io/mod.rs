//! I/O for the kernel: persistence, supervision, child processes, config.

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod events;
pub mod executor;
pub mod process;
pub mod run_state;
pub mod summary;
pub mod supervisor;
