//! CacheScope allocation tracker
//!
//! Built as a shared object and injected into the target with
//! `LD_PRELOAD`. Intercepts the C allocator, `mmap`/`munmap` and the
//! C++ new/delete family, keeps the live set in a lock-free table, and
//! appends one fixed-size record per event to the trace file named by
//! `CACHESCOPE_TRACE`. Without both `CACHESCOPE_ENABLE` and
//! `CACHESCOPE_TRACE` set at process start the hooks are pure
//! pass-throughs.
//!
//! Nothing in here may abort the target: every failure path falls back
//! to calling the real allocator.

pub mod log;
pub mod maps;
pub mod table;

// The interposed symbols clash with the test harness's own allocator
// use, so they only exist in non-test builds.
#[cfg(not(test))]
pub mod hooks;

pub use table::{AllocSnapshot, AllocTable, DEFAULT_CAPACITY};
