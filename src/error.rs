//! Error taxonomy (§7).
//!
//! Build-time passes (D-G) and the pool manager's fallible setup path
//! (`get_or_create_pool`) report failures through [`FuzzallocError`]. The
//! allocation hot path (`tagged_malloc`, `malloc`, `free`, ...) deliberately
//! does **not** use this type — per §7's propagation policy those functions
//! never throw; they return a null pointer and set `errno`, exactly like the
//! C allocator they replace.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FuzzallocError {
    /// Mapping fresh pool memory failed. Recoverable: the caller sees a null
    /// pointer with `errno = ENOMEM`.
    #[error("out of memory: failed to map {requested} bytes for tag pool")]
    OutOfMemory { requested: usize },

    /// An aligned tag-slot sub-range could not be carved out of a larger
    /// mapping. Per §4.A this indicates address-space fragmentation and is
    /// fatal; callers should abort rather than retry.
    #[error("fatal: could not obtain a {alignment:#x}-aligned region for tag pool")]
    AddressSpaceFatal { alignment: usize },

    /// I/O failure while reading or writing the tag log (§4.D, §4.E).
    #[error("tag log I/O error at {path}: {source}")]
    TagLogIoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O or format failure reading the whitelist/special-case list (§4.D).
    #[error("whitelist I/O error at {path}: {source}")]
    WhitelistIoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A malformed line in the tag log or whitelist file.
    #[error("malformed {kind} record at {path}:{line}: {text:?}")]
    MalformedRecord {
        kind: &'static str,
        path: String,
        line: usize,
        text: String,
    },

    /// A transformation pass encountered a construct it cannot rewrite.
    /// Debug builds should treat this as an assertion failure; release
    /// builds skip the construct with a warning (§7).
    #[error("unsupported construct in {pass}: {detail}")]
    UnsupportedConstruct { pass: &'static str, detail: String },
}
