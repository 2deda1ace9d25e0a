//! Backing storage for the detector's own bookkeeping.
//!
//! The engine is meant to be driven from inside an allocation hook.  If its
//! internal tables allocated through the instrumented allocator, every
//! recorded allocation would trigger further recorded allocations.  Instead,
//! all bookkeeping memory is routed through a process-wide installable
//! `malloc`/`free`-shaped pair, defaulting to the *real* allocator located
//! with `dlsym(RTLD_NEXT)` so the lookup cannot resolve back to an
//! interposer.
//!
//! [`initialize`] must run before the first component allocates, and
//! [`shutdown`] only after every component has released its memory.

use std::{
    alloc::Layout,
    mem,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use allocator_api2::alloc::{AllocError, Allocator};
use hashbrown::hash_map::DefaultHashBuilder;
use libc::{c_char, c_void, dlsym, size_t, RTLD_NEXT};
use once_cell::sync::Lazy;

/// Allocation function installed for the engine's bookkeeping.
pub type AllocFn = unsafe extern "C" fn(size: size_t) -> *mut c_void;

/// Deallocation counterpart of [`AllocFn`].
pub type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);

static ALLOC_FN: AtomicUsize = AtomicUsize::new(0);
static FREE_FN: AtomicUsize = AtomicUsize::new(0);

static REAL_MALLOC: Lazy<usize> = Lazy::new(|| {
    let real_malloc = unsafe { dlsym(RTLD_NEXT, b"malloc\0".as_ptr() as *const c_char) };
    if real_malloc.is_null() {
        panic!("malloc_trend: couldn't find original malloc");
    }
    real_malloc as usize
});

static REAL_FREE: Lazy<usize> = Lazy::new(|| {
    let real_free = unsafe { dlsym(RTLD_NEXT, b"free\0".as_ptr() as *const c_char) };
    if real_free.is_null() {
        panic!("malloc_trend: couldn't find original free");
    }
    real_free as usize
});

unsafe extern "C" fn default_alloc(size: size_t) -> *mut c_void {
    let real_malloc: AllocFn = mem::transmute(*REAL_MALLOC);
    real_malloc(size)
}

unsafe extern "C" fn default_free(ptr: *mut c_void) {
    let real_free: FreeFn = mem::transmute(*REAL_FREE);
    real_free(ptr)
}

/// Installs the process-wide bookkeeping allocation functions.  Passing
/// `None` installs the defaults, which delegate to the real `malloc` and
/// `free`.
pub fn initialize(alloc_fn: Option<AllocFn>, free_fn: Option<FreeFn>) {
    ALLOC_FN.store(alloc_fn.unwrap_or(default_alloc) as usize, Ordering::SeqCst);
    FREE_FN.store(free_fn.unwrap_or(default_free) as usize, Ordering::SeqCst);
}

/// Clears the installed pair.  Only call this once every component has
/// released its memory; an uninitialized pair falls back to the defaults.
pub fn shutdown() {
    ALLOC_FN.store(0, Ordering::SeqCst);
    FREE_FN.store(0, Ordering::SeqCst);
}

fn installed_alloc() -> AllocFn {
    match ALLOC_FN.load(Ordering::SeqCst) {
        0 => default_alloc,
        f => unsafe { mem::transmute::<usize, AllocFn>(f) },
    }
}

fn installed_free() -> FreeFn {
    match FREE_FN.load(Ordering::SeqCst) {
        0 => default_free,
        f => unsafe { mem::transmute::<usize, FreeFn>(f) },
    }
}

// Internal containers never need more alignment than malloc guarantees.
const MAX_ALIGN: usize = mem::align_of::<libc::max_align_t>();

/// Zero-sized handle to the installed bookkeeping allocator.  Every
/// container owned by the engine is parameterized over it, so the engine's
/// own memory never re-enters the instrumented allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct BookkeepingAlloc;

unsafe impl Allocator for BookkeepingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > MAX_ALIGN {
            return Err(AllocError);
        }
        let size = layout.size().max(1);
        let raw = unsafe { installed_alloc()(size) } as *mut u8;
        match NonNull::new(raw) {
            Some(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, size)),
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        installed_free()(ptr.as_ptr() as *mut c_void);
    }
}

pub(crate) type AVec<T> = allocator_api2::vec::Vec<T, BookkeepingAlloc>;
pub(crate) type ABox<T> = allocator_api2::boxed::Box<T, BookkeepingAlloc>;
pub(crate) type AHashMap<K, V> = hashbrown::HashMap<K, V, DefaultHashBuilder, BookkeepingAlloc>;

pub(crate) fn new_vec<T>() -> AVec<T> {
    AVec::new_in(BookkeepingAlloc)
}

pub(crate) fn new_map<K, V>() -> AHashMap<K, V> {
    AHashMap::with_hasher_in(DefaultHashBuilder::default(), BookkeepingAlloc)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static TEST_ALLOCS: AtomicUsize = AtomicUsize::new(0);
    static TEST_FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_alloc(size: size_t) -> *mut c_void {
        TEST_ALLOCS.fetch_add(1, Ordering::SeqCst);
        libc::malloc(size)
    }

    unsafe extern "C" fn counting_free(ptr: *mut c_void) {
        TEST_FREES.fetch_add(1, Ordering::SeqCst);
        libc::free(ptr)
    }

    #[test]
    fn default_pair_allocates() {
        let mut v: AVec<u8> = new_vec();
        v.push(1);
        v.push(2);
        assert_eq!(v.as_slice(), &[1, 2]);
    }

    // One test covers the whole install/shutdown lifecycle; the installed
    // pair is process-wide state and concurrent tests must not fight over
    // it.
    #[test]
    fn installed_pair_lifecycle() {
        initialize(Some(counting_alloc), Some(counting_free));
        let allocs_before = TEST_ALLOCS.load(Ordering::SeqCst);
        let frees_before = TEST_FREES.load(Ordering::SeqCst);

        let mut v: AVec<u64> = new_vec();
        for i in 0..100 {
            v.push(i);
        }
        drop(v);

        assert!(TEST_ALLOCS.load(Ordering::SeqCst) > allocs_before);
        assert!(TEST_FREES.load(Ordering::SeqCst) > frees_before);

        // After shutdown the engine falls back to the real allocator.
        shutdown();
        let mut v: AVec<u32> = new_vec();
        v.push(7);
        assert_eq!(v.as_slice(), &[7]);
    }

    #[test]
    fn overaligned_requests_are_refused() {
        let layout = Layout::from_size_align(64, 1024).unwrap();
        assert!(BookkeepingAlloc.allocate(layout).is_err());
    }
}
