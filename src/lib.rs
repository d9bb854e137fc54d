//! fuzzalloc: a tagged, pool-segregated allocator runtime (§2 components
//! A-C) plus an SSA-IR transformation pipeline (§2 components D-G) that
//! rewrites allocations and memory accesses for data-flow coverage fuzzing.
//!
//! The runtime half ([`tag`], [`pool`], [`allocator`], [`access`]) is the
//! shared library an instrumented binary links against. The build-time half
//! ([`ir`], [`ir_text`], [`taglog`], [`whitelist`], [`passes`]) is what
//! `fuzzalloc-pass` (`src/bin/fuzzalloc_pass.rs`) drives to perform that
//! instrumentation;
//! both halves live in one crate so the passes can be unit-tested without a
//! real compiler front end.

pub mod access;
pub mod allocator;
pub mod config;
pub mod error;
pub mod ir;
pub mod ir_text;
pub mod passes;
pub mod pool;
pub mod tag;
pub mod taglog;
pub mod whitelist;

pub use config::Config;
pub use error::FuzzallocError;
pub use tag::Tag;
