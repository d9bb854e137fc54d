//! Access Instrumentation Runtime (§4.C).
//!
//! Exports the single `on_access` callback surface instrumented code can
//! call from an un-inlined instrumentation site — primarily useful for the
//! `debug-log` fuzzer mode, since §4.C notes that "in practice, most
//! instrumentation is inlined by component G"; `passes::instrument`
//! generates the inlined sequence directly rather than calling this
//! function. The hash here and the one the inlined sequence generates must
//! stay bit-for-bit identical, which is why both live on the frozen formula
//! in [`coverage_index`].

use std::io::Write;
use std::sync::OnceLock;

use crate::config::FuzzerMode;
use crate::tag::{Tag, DEFAULT_TAG};

/// Default AFL-style bitmap size (§6: "inherited from host fuzzer (default
/// 2^16 for AFL)").
pub const DEFAULT_MAP_SIZE: usize = 1 << 16;

/// Shared, process-wide coverage buffer the access runtime accumulates
/// hits into. Implementations must be safe to call from many threads with
/// no synchronization beyond what's documented in §5 ("racy-by-design...
/// must not be fixed with atomics").
pub trait CoverageMap: Send + Sync {
    fn len(&self) -> usize;
    /// Increments the byte/counter at `index`, wrapping on overflow. `index`
    /// is always `< len()`.
    fn bump(&self, index: usize);
}

/// Wraps a fuzzer-owned AFL bitmap (`__afl_area_ptr`, §6). Constructed by
/// the thin C shim that owns the actual AFL runtime and calls
/// [`set_afl_area`] once at process start — this crate never declares
/// `__afl_area_ptr` as an `extern` symbol itself, so linking `fuzzalloc`
/// standalone (e.g. for its own tests) never requires AFL's runtime to be
/// present.
pub struct AflCoverageMap {
    area: *mut u8,
    len: usize,
}

unsafe impl Send for AflCoverageMap {}
unsafe impl Sync for AflCoverageMap {}

impl CoverageMap for AflCoverageMap {
    fn len(&self) -> usize {
        self.len
    }

    fn bump(&self, index: usize) {
        unsafe {
            let cell = self.area.add(index);
            // Deliberately non-atomic: AFL/libFuzzer coverage maps are
            // racy-by-design (§5); a missed increment under contention is
            // an accepted false negative, not a correctness bug.
            *cell = cell.read().wrapping_add(1);
        }
    }
}

/// Wraps a libFuzzer-style per-translation-unit 8-bit counter section
/// (`__sanitizer_cov_8bit_counters_init`, §6).
pub struct LibFuzzerCoverageMap {
    counters: *mut u8,
    len: usize,
}

unsafe impl Send for LibFuzzerCoverageMap {}
unsafe impl Sync for LibFuzzerCoverageMap {}

impl CoverageMap for LibFuzzerCoverageMap {
    fn len(&self) -> usize {
        self.len
    }

    fn bump(&self, index: usize) {
        unsafe {
            let cell = self.counters.add(index);
            *cell = cell.read().wrapping_add(1);
        }
    }
}

static ACTIVE_MAP: OnceLock<Box<dyn CoverageMap>> = OnceLock::new();

/// Registers the AFL bitmap this process should accumulate hits into. Only
/// the first call wins; later calls are logged and ignored, since the
/// active map is a process-wide singleton set once at startup.
///
/// # Safety
/// `area` must point to at least `len` writable bytes, live for the rest of
/// the process, per AFL's `__afl_area_ptr` contract.
pub unsafe fn set_afl_area(area: *mut u8, len: usize) {
    if ACTIVE_MAP.set(Box::new(AflCoverageMap { area, len })).is_err() {
        log::warn!("fuzzalloc: coverage map already set; ignoring duplicate set_afl_area");
    }
}

/// As [`set_afl_area`], for libFuzzer's 8-bit counter section.
///
/// # Safety
/// `counters` must point to at least `len` writable bytes, live for the
/// rest of the process.
pub unsafe fn set_libfuzzer_counters(counters: *mut u8, len: usize) {
    if ACTIVE_MAP.set(Box::new(LibFuzzerCoverageMap { counters, len })).is_err() {
        log::warn!("fuzzalloc: coverage map already set; ignoring duplicate set_libfuzzer_counters");
    }
}

/// The frozen data-flow coverage hash (§4.C, §9 "several variants of hash
/// functions coexist in the source ... normalized on the latter"):
///
/// ```text
/// h = ((3 * (tag - DEFAULT_TAG)) XOR use_site) - use_site
/// ```
///
/// wrapping at 64 bits throughout so it is total over all `(tag, use_site)`
/// pairs, never panics, and is reproducible bit-for-bit by the inlined
/// sequence `passes::instrument` generates.
pub fn raw_hash(tag: Tag, use_site: usize) -> u64 {
    let offset = tag.get() as i64 - DEFAULT_TAG as i64;
    let mixed = (offset.wrapping_mul(3)) ^ (use_site as i64);
    mixed.wrapping_sub(use_site as i64) as u64
}

/// `raw_hash` reduced into `[0, map_size)`.
pub fn coverage_index(tag: Tag, use_site: usize, map_size: usize) -> usize {
    debug_assert!(map_size > 0);
    (raw_hash(tag, use_site) as usize) % map_size
}

/// Applies the data-flow hash and bumps `map`, unless `tag` is
/// `DEFAULT_TAG` (§4.C: "If tag == DEFAULT_TAG, the bitmap is not updated",
/// §8 invariant 7).
pub fn record_access(map: &dyn CoverageMap, tag: Tag, use_site: usize) {
    if tag.is_default() {
        return;
    }
    let index = coverage_index(tag, use_site, map.len());
    map.bump(index);
}

/// Captures the return address of the instrumented call site, i.e. the
/// "use site" identity in §4.C. `on_access` is itself never inlined so the
/// second backtrace frame is always the caller.
#[inline(never)]
fn caller_pc() -> usize {
    let mut depth = 0usize;
    let mut pc = 0usize;
    backtrace::trace(|frame| {
        depth += 1;
        if depth == 2 {
            pc = frame.ip() as usize;
            return false;
        }
        true
    });
    pc
}

/// Debug-mode access callback (§4.C, §6). Most instrumentation is inlined
/// directly by `passes::instrument`; this symbol exists so un-inlined call
/// sites (and the `debug-log` fuzzer mode, which always calls out rather
/// than inlining) have somewhere to call. Must never allocate and must
/// never call a routine that could itself be instrumented (§5), so its own
/// I/O goes straight to a raw `Stderr` handle rather than through `log`'s
/// formatting machinery.
#[no_mangle]
pub extern "C" fn on_access(tag: u16) {
    let use_site = caller_pc();
    match crate::config::get().fuzzer_mode {
        FuzzerMode::DebugLog => {
            let mut stderr = std::io::stderr();
            let _ = writeln!(stderr, "fuzzalloc: access tag={:#06x} site={:#x}", tag, use_site);
        }
        FuzzerMode::Afl | FuzzerMode::LibFuzzer => {
            if let Some(map) = ACTIVE_MAP.get() {
                record_access(map.as_ref(), Tag::new(tag), use_site);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, Ordering};

    struct TestMap {
        cells: Vec<AtomicU8>,
    }

    impl TestMap {
        fn new(len: usize) -> Self {
            TestMap {
                cells: (0..len).map(|_| AtomicU8::new(0)).collect(),
            }
        }
    }

    impl CoverageMap for TestMap {
        fn len(&self) -> usize {
            self.cells.len()
        }
        fn bump(&self, index: usize) {
            self.cells[index].fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_tag_suppresses_update() {
        let map = TestMap::new(DEFAULT_MAP_SIZE);
        record_access(&map, Tag::DEFAULT, 0x1000);
        assert!(map.cells.iter().all(|c| c.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn non_default_tag_updates_exactly_one_cell() {
        let map = TestMap::new(DEFAULT_MAP_SIZE);
        record_access(&map, Tag::new(0x00AB), 0x7f0000001234);
        let nonzero: Vec<_> = map
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.load(Ordering::Relaxed) != 0)
            .collect();
        assert_eq!(nonzero.len(), 1);
        assert_eq!(nonzero[0].1.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn hash_distinguishes_swapped_operands() {
        // §8 invariant 6 framing: (a, b) and (b, a) should not collide in
        // general, i.e. tag and use-site are not interchangeable.
        let a = Tag::new(0x0010);
        let b = Tag::new(0x0011);
        assert_ne!(raw_hash(a, b.get() as usize), raw_hash(b, a.get() as usize));
    }

    #[test]
    fn hash_rarely_collides_across_random_tag_pairs() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(0xF00D);
        let use_site = 0x5555_1234usize;
        let mut collisions = 0u32;
        const TRIALS: u32 = 1 << 12;
        for _ in 0..TRIALS {
            let a: u16 = rng.gen_range(crate::tag::TAG_MIN..=crate::tag::TAG_MAX);
            let b: u16 = rng.gen_range(crate::tag::TAG_MIN..=crate::tag::TAG_MAX);
            if a == b {
                continue;
            }
            if raw_hash(Tag::new(a), use_site) == raw_hash(Tag::new(b), use_site) {
                collisions += 1;
            }
        }
        // The mixing function should collide for only a vanishing fraction
        // of distinct-tag pairs at a fixed use-site.
        assert!(collisions < TRIALS / 100);
    }
}
