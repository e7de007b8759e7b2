#![allow(clippy::multiple_crate_versions)]

//! fbt-rs: function boundary tracing by in-process hot patching.
//!
//! Procedures compiled with hot-patch padding are redirected to an entry
//! thunk at run time. The thunk reports the call, swaps the caller's return
//! address for an exit thunk and keeps the real one on a per-thread shadow
//! stack, so both ends of every traced call reach the user's `Handler`.
//! Handlers write into per-thread buffers that are handed to a consumer,
//! either by a collector thread or on demand.
//!
//! `engine::Engine` is the entry point. `platform::mock::Simulated` lets the
//! patching logic run against fake memory and threads; on x86-64 Linux,
//! `platform::linux::Native` patches the running process.

pub mod arch;
pub mod asm;
pub mod buffer;
pub mod collector;
pub mod config;
pub mod diag;
pub mod engine;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod jit;
pub mod patch;
pub mod platform;
pub mod pool;
pub mod procedure;
pub mod stats;
pub mod thread;
pub mod thunk;
