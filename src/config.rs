//! Environment-driven configuration (§6), parsed once and cached.
//!
//! Ported from the ancestor runtime's own once-at-first-use env parsing
//! (`Gc::new`'s `NEPTUNE_THREADS` lookup in the teacher's `gc.rs`), but
//! generalized to the full set of `FUZZALLOC_*` variables and cached in a
//! `OnceLock` rather than read on every allocation.

use std::env;
use std::sync::OnceLock;

/// Default pool size (§3): ~5*10^8 bytes.
pub const DEFAULT_POOL_SIZE: usize = 500_000_000;

/// Which host fuzzer's coverage convention to emit instrumentation for
/// (§4.C, §6 `FUZZALLOC_FUZZER`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuzzerMode {
    /// Print each access instead of updating a shared map; for local testing.
    DebugLog,
    /// AFL-style shared byte-array bitmap (`__afl_area_ptr`).
    Afl,
    /// libFuzzer-style per-function 8-bit counter section.
    LibFuzzer,
}

impl FuzzerMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "debug-log" => Some(FuzzerMode::DebugLog),
            "AFL" => Some(FuzzerMode::Afl),
            "libfuzzer" => Some(FuzzerMode::LibFuzzer),
            _ => None,
        }
    }
}

/// Which instruction classes the dereference instrumentation pass (4.G)
/// instruments, and whether to fold the static access offset into the hash
/// (§6 `FUZZALLOC_SENSITIVITY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    MemRead,
    MemWrite,
    MemAccess,
    MemReadOffset,
    MemWriteOffset,
    MemAccessOffset,
}

impl Sensitivity {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "mem-read" => Some(Sensitivity::MemRead),
            "mem-write" => Some(Sensitivity::MemWrite),
            "mem-access" => Some(Sensitivity::MemAccess),
            "mem-read-offset" => Some(Sensitivity::MemReadOffset),
            "mem-write-offset" => Some(Sensitivity::MemWriteOffset),
            "mem-access-offset" => Some(Sensitivity::MemAccessOffset),
            _ => None,
        }
    }

    pub fn includes_offset(self) -> bool {
        matches!(
            self,
            Sensitivity::MemReadOffset | Sensitivity::MemWriteOffset | Sensitivity::MemAccessOffset
        )
    }

    pub fn includes_reads(self) -> bool {
        matches!(
            self,
            Sensitivity::MemRead | Sensitivity::MemAccess | Sensitivity::MemReadOffset | Sensitivity::MemAccessOffset
        )
    }

    pub fn includes_writes(self) -> bool {
        matches!(
            self,
            Sensitivity::MemWrite | Sensitivity::MemAccess | Sensitivity::MemWriteOffset | Sensitivity::MemAccessOffset
        )
    }
}

/// Policy knobs for the heapification pass (4.F), pulled out of hidden
/// globals/compile-time `#[cfg]`s (the ancestor's approach) into an explicit,
/// constructible struct (SPEC_FULL §4 EXPANSION).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapifyPolicy {
    /// Minimum element count an array must have to be eligible.
    pub min_elements: usize,
    /// Arrays at or above this element count are assumed already heap-sized
    /// in spirit and are left alone (diminishing instrumentation value,
    /// increasing rewrite risk).
    pub max_elements: usize,
}

impl Default for HeapifyPolicy {
    fn default() -> Self {
        HeapifyPolicy {
            min_elements: 8,
            max_elements: 1 << 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub pool_size: usize,
    pub tag_log_path: Option<String>,
    pub whitelist_path: Option<String>,
    pub fuzzer_mode: FuzzerMode,
    pub sensitivity: Sensitivity,
    pub heapify_policy: HeapifyPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool_size: DEFAULT_POOL_SIZE,
            tag_log_path: None,
            whitelist_path: None,
            fuzzer_mode: FuzzerMode::Afl,
            sensitivity: Sensitivity::MemAccess,
            heapify_policy: HeapifyPolicy::default(),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment, applying the
    /// documented defaults and debug-mode logging on parse failure (§6, §7).
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        let pool_size_raw = env::var("FUZZALLOC_POOL_SIZE")
            .or_else(|_| env::var("POOL_SIZE"))
            .ok();
        if let Some(raw) = pool_size_raw {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => cfg.pool_size = n,
                _ => {
                    log::warn!(
                        "fuzzalloc: invalid POOL_SIZE/FUZZALLOC_POOL_SIZE {:?}, using default {}",
                        raw,
                        DEFAULT_POOL_SIZE
                    );
                }
            }
        }

        cfg.tag_log_path = env::var("FUZZALLOC_TAG_LOG").ok();

        cfg.whitelist_path = env::var("FUZZALLOC_MEM_FUNCS")
            .or_else(|_| env::var("FUZZALLOC_WHITELIST"))
            .ok();

        if let Ok(raw) = env::var("FUZZALLOC_FUZZER") {
            match FuzzerMode::parse(&raw) {
                Some(mode) => cfg.fuzzer_mode = mode,
                None => log::warn!("fuzzalloc: unrecognized FUZZALLOC_FUZZER {:?}, defaulting to AFL", raw),
            }
        }

        if let Ok(raw) = env::var("FUZZALLOC_SENSITIVITY") {
            match Sensitivity::parse(&raw) {
                Some(s) => cfg.sensitivity = s,
                None => log::warn!(
                    "fuzzalloc: unrecognized FUZZALLOC_SENSITIVITY {:?}, defaulting to mem-access",
                    raw
                ),
            }
        }

        cfg
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Returns the process-wide config, parsing the environment on first call
/// (§5, §9: lazily, not at static-init time).
pub fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}
