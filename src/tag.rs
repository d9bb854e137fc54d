//! Tag/pointer arithmetic and the process-wide tag registry (§3, §4.A).
//!
//! A [`Tag`] is a 16-bit identifier for the allocation site that produced a
//! pointer. Every pointer handed out by a tagged pool has its tag embedded in
//! bits `[SHIFT, SHIFT + TAG_BITS)`, so recovering the tag from a pointer is
//! two arithmetic operations and never a table lookup.

use std::sync::{Arc, Mutex, OnceLock};

use crate::pool::Pool;

/// Usable virtual-address bits a pointer's tag arithmetic assumes (§3).
pub const NUM_USABLE_BITS: u32 = 48;
/// Width of the tag field embedded in a pointer.
pub const NUM_TAG_BITS: u32 = 16;
/// `USABLE_BITS - TAG_BITS`: right-shift amount to recover a tag from a pointer.
pub const SHIFT: u32 = NUM_USABLE_BITS - NUM_TAG_BITS;
/// Mask applied after the shift to isolate the tag field.
pub const TAG_MASK: u64 = 0xFFFF;

/// Reserved tag meaning "uninstrumented origin" — never backed by a pool
/// that participates in coverage, and never assigned to a real call site.
pub const DEFAULT_TAG: u16 = 1;
/// Low end (inclusive) of the tag range the tagging pass may assign.
pub const TAG_MIN: u16 = 2;
/// High end (inclusive) of the tag range in non-ASan builds.
const TAG_MAX_PLAIN: u16 = 0x7FFE;
/// High end (inclusive) of the tag range when the ASan quarantine range is
/// reserved (§6: ASan builds reserve `0x7FFE..0x6FFF`... i.e. the top of the
/// usable range, leaving quarantine tags above `TAG_MAX`).
const TAG_MAX_ASAN: u16 = 0x6FFE;

/// Upper bound of the usable tag range for this build.
#[cfg(feature = "asan")]
pub const TAG_MAX: u16 = TAG_MAX_ASAN;
#[cfg(not(feature = "asan"))]
pub const TAG_MAX: u16 = TAG_MAX_PLAIN;

/// 16-bit allocation-site identifier embedded in a pointer's high bits.
///
/// Deliberately not `Copy`-compatible with a bare `u16` at call sites that
/// matter (construction goes through [`Tag::new`]/[`Tag::from_ptr`]) so a
/// stray array index cannot silently be passed where a tag was meant; the
/// public C ABI in [`crate::allocator`] still speaks plain `u16` at the
/// boundary, matching `tagged_malloc`'s documented signature (§6).
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(u16);

impl Tag {
    /// Wraps a raw tag value with no range validation — used for values that
    /// are known-good (read back out of a pointer, or `DEFAULT_TAG`).
    pub const fn new(raw: u16) -> Self {
        Tag(raw)
    }

    pub const DEFAULT: Tag = Tag(DEFAULT_TAG);

    pub fn is_default(self) -> bool {
        self.0 == DEFAULT_TAG
    }

    /// Whether `raw` falls in the assignable range `[TAG_MIN, TAG_MAX]`.
    pub fn in_usable_range(raw: u16) -> bool {
        (TAG_MIN..=TAG_MAX).contains(&raw)
    }

    pub fn get(self) -> u16 {
        self.0
    }

    /// Extracts the tag embedded in `ptr`'s high bits (§3 invariant 1, §4.G
    /// step 2): `(p >> SHIFT) & TAG_MASK`.
    pub fn from_ptr(ptr: *const u8) -> Tag {
        Tag((((ptr as u64) >> SHIFT) & TAG_MASK) as u16)
    }

    /// Whether `base` is a valid pool base address for this tag: `base >>
    /// SHIFT == tag` (§3 Pool invariant).
    pub fn matches_base(self, base: usize) -> bool {
        ((base as u64) >> SHIFT) & TAG_MASK == self.0 as u64
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Process-wide `tag -> pool` mapping plus the `pool_to_alloc_site` table
/// (§3). Slot creation is serialized by a single coarse mutex (§5); once a
/// pool exists, its own internal locking (or lack thereof, under
/// `single-threaded`) governs concurrent allocation within it.
pub struct TagRegistry {
    pools: Vec<Option<Arc<Pool>>>,
    pool_to_alloc_site: Vec<Option<u32>>,
}

impl TagRegistry {
    fn new() -> Self {
        let slots = TAG_MAX as usize + 1;
        TagRegistry {
            pools: vec![None; slots],
            pool_to_alloc_site: vec![None; slots],
        }
    }

    /// Returns the pool for `tag`, if one has been created.
    pub fn get(&self, tag: Tag) -> Option<Arc<Pool>> {
        self.pools.get(tag.get() as usize).cloned().flatten()
    }

    /// Records that `tag`'s pool was minted for (the first-seen) call site
    /// `alloc_site_id`. Multiple logical call sites sharing one tag keep the
    /// earliest recorded id, matching the read side's "which site owns this
    /// pool" query rather than the pool's own creation order.
    fn record_call_site(&mut self, tag: Tag, alloc_site_id: u32) {
        let slot = &mut self.pool_to_alloc_site[tag.get() as usize];
        if slot.is_none() {
            *slot = Some(alloc_site_id);
        }
    }

    pub fn call_site_of(&self, tag: Tag) -> Option<u32> {
        self.pool_to_alloc_site.get(tag.get() as usize).copied().flatten()
    }

    fn insert(&mut self, tag: Tag, pool: Arc<Pool>) {
        self.pools[tag.get() as usize] = Some(pool);
    }
}

/// The process-wide registry, initialized on first use (§9: not at
/// static-init time, since some sanitizer builds call `malloc` before Rust's
/// own runtime has finished starting up).
static REGISTRY: OnceLock<Mutex<TagRegistry>> = OnceLock::new();

fn registry() -> &'static Mutex<TagRegistry> {
    REGISTRY.get_or_init(|| Mutex::new(TagRegistry::new()))
}

/// Returns the pool for `tag`, creating it (mmap'ing a fresh tag-aligned
/// region) if this is the first use. The alloc-site id defaults to the tag
/// itself, per §3: "the tag itself may serve as the call-site id."
pub fn get_or_create_pool(tag: Tag) -> Result<Arc<Pool>, crate::error::FuzzallocError> {
    get_or_create_pool_for_site(tag, tag.get() as u32)
}

/// As [`get_or_create_pool`], but records `alloc_site_id` as the owning call
/// site rather than defaulting to the tag value — used when several call
/// sites funnel through one tag (§3's "the table exists so that multiple
/// logical call sites can share a pool if needed").
pub fn get_or_create_pool_for_site(
    tag: Tag,
    alloc_site_id: u32,
) -> Result<Arc<Pool>, crate::error::FuzzallocError> {
    let mut reg = registry().lock().unwrap();
    if let Some(pool) = reg.get(tag) {
        return Ok(pool);
    }
    let pool = Arc::new(Pool::create(tag, crate::config::get().pool_size)?);
    reg.insert(tag, pool.clone());
    reg.record_call_site(tag, alloc_site_id);
    log::debug!("fuzzalloc: minted pool for tag {} at base {:#x}", tag, pool.base());
    Ok(pool)
}

/// Looks up an already-created pool without creating one. Used by `free`,
/// where minting a pool for a tag we're about to free into would be a bug.
pub fn lookup_pool(tag: Tag) -> Option<Arc<Pool>> {
    registry().lock().unwrap().get(tag)
}

pub fn call_site_of(tag: Tag) -> Option<u32> {
    registry().lock().unwrap().call_site_of(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_match_spec() {
        assert_eq!(SHIFT, 32);
        assert_eq!(TAG_MASK, 0xFFFF);
        assert_eq!(DEFAULT_TAG, 1);
        assert_eq!(TAG_MIN, 2);
        assert!(TAG_MAX < u16::MAX);
        assert!(TAG_MIN > DEFAULT_TAG);
    }

    #[test]
    fn from_ptr_extracts_high_bits() {
        let tag_val: u64 = 0x00AB;
        let ptr = ((tag_val << SHIFT) | 0x1234) as *const u8;
        assert_eq!(Tag::from_ptr(ptr), Tag::new(0x00AB));
    }

    #[test]
    fn matches_base_round_trips() {
        let tag = Tag::new(0x10);
        let base = (tag.get() as usize) << SHIFT;
        assert!(tag.matches_base(base));
        assert!(!tag.matches_base(base + (1usize << SHIFT)));
    }

    #[test]
    fn usable_range_excludes_default() {
        assert!(!Tag::in_usable_range(DEFAULT_TAG));
        assert!(Tag::in_usable_range(TAG_MIN));
        assert!(Tag::in_usable_range(TAG_MAX));
        assert!(!Tag::in_usable_range(TAG_MAX.wrapping_add(1)));
    }
}
