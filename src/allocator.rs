//! Tagged Allocator API (§4.B) and the `malloc`/`calloc`/`realloc`/`free`
//! interposition shims (§6).
//!
//! Grounded on the ancestor runtime's `#[no_mangle] extern` export style in
//! `c_interface.rs` (e.g. `neptune_alloc`, `neptune_pool_alloc`), generalized
//! from "hand a `Gc` object across the FFI boundary" to "route through the
//! process-wide tag registry." The `GlobalAlloc` wrapper is grounded on
//! `other_examples/.../allocator/tracking.rs`'s `AccountingAlloc`.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;

use crate::tag::{self, Tag};

fn set_errno_enomem() {
    unsafe {
        *libc::__errno_location() = libc::ENOMEM;
    }
}

/// Allocates `size` bytes from the pool for `tag`, minting the pool on
/// first use. Returns null with `errno = ENOMEM` on failure, matching
/// `malloc`'s contract (§7 propagation policy).
#[no_mangle]
pub extern "C" fn tagged_malloc(tag: u16, size: usize) -> *mut u8 {
    let pool = match tag::get_or_create_pool(Tag::new(tag)) {
        Ok(pool) => pool,
        Err(_) => {
            set_errno_enomem();
            return ptr::null_mut();
        }
    };
    match pool.alloc(size) {
        Some(p) => p,
        None => {
            set_errno_enomem();
            ptr::null_mut()
        }
    }
}

/// As [`tagged_malloc`], zero-initialized, with the standard `calloc`
/// overflow check on `nmemb * size`.
#[no_mangle]
pub extern "C" fn tagged_calloc(tag: u16, nmemb: usize, size: usize) -> *mut u8 {
    let pool = match tag::get_or_create_pool(Tag::new(tag)) {
        Ok(pool) => pool,
        Err(_) => {
            set_errno_enomem();
            return ptr::null_mut();
        }
    };
    match pool.calloc(nmemb, size) {
        Some(p) => p,
        None => {
            set_errno_enomem();
            ptr::null_mut()
        }
    }
}

/// Resizes `ptr` within its own pool (tag stability, §4.B/§8 invariant 4). A
/// null `ptr` acts as `tagged_malloc`.
#[no_mangle]
pub extern "C" fn tagged_realloc(tag: u16, ptr_in: *mut u8, size: usize) -> *mut u8 {
    if ptr_in.is_null() {
        return tagged_malloc(tag, size);
    }
    let pool = match tag::get_or_create_pool(Tag::new(tag)) {
        Ok(pool) => pool,
        Err(_) => {
            set_errno_enomem();
            return ptr::null_mut();
        }
    };
    match pool.realloc(ptr_in, size) {
        Some(p) => p,
        None => {
            set_errno_enomem();
            ptr::null_mut()
        }
    }
}

/// `malloc` replacement: delegates to `tagged_malloc(DEFAULT_TAG, ...)`
/// (§4.B), so untagged/library allocations are still tag-addressable, just
/// uninteresting to the coverage map (§4.C: `DEFAULT_TAG` suppresses
/// bitmap updates).
#[no_mangle]
pub extern "C" fn malloc(size: usize) -> *mut u8 {
    tagged_malloc(tag::DEFAULT_TAG, size)
}

#[no_mangle]
pub extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
    tagged_calloc(tag::DEFAULT_TAG, nmemb, size)
}

/// `realloc(NULL, n)` acts as `malloc`; otherwise the pointer's own
/// (embedded) tag is used, never `DEFAULT_TAG`, so a pointer originally
/// allocated through a tagged call site keeps its tag across a plain
/// `realloc` call (§4.B).
#[no_mangle]
pub extern "C" fn realloc(ptr_in: *mut u8, size: usize) -> *mut u8 {
    if ptr_in.is_null() {
        return malloc(size);
    }
    let tag = Tag::from_ptr(ptr_in);
    tagged_realloc(tag.get(), ptr_in, size)
}

/// `free(NULL)` is a no-op (§4.B). Otherwise the tag is read back out of the
/// pointer's own high bits — no table lookup needed to find which pool to
/// return it to (§3's central design goal).
///
/// If the extracted tag has no live pool — a foreign pointer, or a
/// `DEFAULT_TAG` pointer that predates this allocator being linked in — the
/// open question in §9 is resolved here: by default we forward to the
/// system allocator; with the `strict-free` feature the process aborts
/// instead (see `DESIGN.md`).
#[no_mangle]
pub extern "C" fn free(ptr_in: *mut u8) {
    if ptr_in.is_null() {
        return;
    }
    let tag = Tag::from_ptr(ptr_in);
    match tag::lookup_pool(tag) {
        Some(pool) => pool.free(ptr_in),
        None => handle_foreign_free(ptr_in),
    }
}

#[cfg(feature = "strict-free")]
fn handle_foreign_free(ptr_in: *mut u8) {
    log::error!("fuzzalloc: free() of untracked pointer {:?}; aborting (strict-free)", ptr_in);
    std::process::abort();
}

#[cfg(not(feature = "strict-free"))]
fn handle_foreign_free(ptr_in: *mut u8) {
    log::debug!("fuzzalloc: free() of untracked pointer {:?}; forwarding to system allocator", ptr_in);
    unsafe {
        libc::free(ptr_in as *mut libc::c_void);
    }
}

/// A `#[global_allocator]`-capable wrapper that routes Rust's own
/// allocation traffic through a single fixed tag's pool (SPEC_FULL §4.B
/// EXPANSION). Not part of the stable C ABI in §6 — this is for embedding
/// `fuzzalloc` pools in a pure-Rust harness, such as this crate's own test
/// binaries exercising tag-stability under allocator-heavy workloads.
pub struct TaggedGlobalAlloc {
    tag: u16,
}

impl TaggedGlobalAlloc {
    pub const fn new(tag: u16) -> Self {
        TaggedGlobalAlloc { tag }
    }
}

unsafe impl GlobalAlloc for TaggedGlobalAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= 16 {
            tagged_malloc(self.tag, layout.size())
        } else {
            System.alloc(layout)
        }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        if layout.align() <= 16 && tag::lookup_pool(Tag::from_ptr(ptr_in)).is_some() {
            free(ptr_in);
        } else {
            System.dealloc(ptr_in, layout);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= 16 {
            tagged_calloc(self.tag, 1, layout.size())
        } else {
            System.alloc_zeroed(layout)
        }
    }

    unsafe fn realloc(&self, ptr_in: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= 16 && tag::lookup_pool(Tag::from_ptr(ptr_in)).is_some() {
            tagged_realloc(Tag::from_ptr(ptr_in).get(), ptr_in, new_size)
        } else {
            System.realloc(ptr_in, layout, new_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TAG_MIN;

    #[test]
    fn malloc_is_tagged_default() {
        let p = malloc(32);
        assert!(!p.is_null());
        assert_eq!(Tag::from_ptr(p), Tag::DEFAULT);
        free(p);
    }

    #[test]
    fn tagged_malloc_round_trips_tag() {
        let t = TAG_MIN + 5;
        let p = tagged_malloc(t, 64);
        assert!(!p.is_null());
        assert_eq!(Tag::from_ptr(p).get(), t);
        free(p);
    }

    #[test]
    fn realloc_null_acts_as_malloc() {
        let p = realloc(ptr::null_mut(), 16);
        assert!(!p.is_null());
        free(p);
    }

    #[test]
    fn free_null_is_noop() {
        free(ptr::null_mut());
    }

    #[test]
    fn realloc_preserves_tag() {
        let t = TAG_MIN + 6;
        let p = tagged_malloc(t, 16);
        let p2 = realloc(p, 256);
        assert_eq!(Tag::from_ptr(p2).get(), t);
        free(p2);
    }
}
