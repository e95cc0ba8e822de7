//! Memory allocation for table storage.
//!
//! The general-purpose heap stops being the right tool for very large
//! buffers: common allocators will not `mremap` on realloc even when the
//! chunk is huge, and copying tens of gigabytes to grow a buffer is far more
//! expensive than moving its address-space mapping. Requests at or above
//! [`MMAP_THRESHOLD`] therefore go straight to anonymous memory mapping and
//! grow via `mremap` where the platform has it; everything below stays on
//! the libc heap (`malloc`/`calloc`, or `posix_memalign` when the caller
//! needs more alignment than malloc guarantees). The threshold is set high
//! enough that the mapped path is reserved for buffers where address-space
//! games actually pay off.
//!
//! Mapped pages arrive zero-filled from the kernel, so the zeroing
//! configuration skips its memset on that path.
//!
//! Failure policy: allocation failure aborts the process. The tables sized
//! from an a-priori cardinality estimate have no fallback for a partial
//! allocation, so there is nothing to recover.
//!
//! A process-wide counter tracks live mapped bytes across all allocator
//! users; it exists purely for observability and has no correctness role.

use std::alloc::Layout;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Requests at or above this size bypass the heap and are memory-mapped.
pub const MMAP_THRESHOLD: usize = 64 << 30;

/// What 64-bit libc malloc already guarantees; below this, alignment is free.
const MALLOC_MIN_ALIGN: usize = 16;

/// Mapped regions are page-aligned and no better.
#[cfg(unix)]
const PAGE_ALIGN: usize = 4096;

static MAPPED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Live bytes currently held in mapped regions, process-wide.
pub fn mapped_bytes() -> usize {
    MAPPED_BYTES.load(Ordering::Acquire)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Route {
    Heap,
    #[cfg(unix)]
    Mapped,
}

#[cfg(unix)]
fn route(size: usize, threshold: usize) -> Route {
    if size >= threshold {
        Route::Mapped
    } else {
        Route::Heap
    }
}

#[cfg(not(unix))]
fn route(_size: usize, _threshold: usize) -> Route {
    Route::Heap
}

fn alloc_failure(size: usize) -> ! {
    std::alloc::handle_alloc_error(Layout::from_size_align(size.max(1), 1).unwrap())
}

fn heap_alloc<const CLEAR: bool>(size: usize, align: usize) -> NonNull<u8> {
    if align <= MALLOC_MIN_ALIGN {
        let ptr = unsafe {
            if CLEAR {
                libc::calloc(size, 1)
            } else {
                libc::malloc(size)
            }
        };
        NonNull::new(ptr as *mut u8).unwrap_or_else(|| alloc_failure(size))
    } else {
        aligned_heap_alloc::<CLEAR>(size, align)
    }
}

#[cfg(unix)]
fn aligned_heap_alloc<const CLEAR: bool>(size: usize, align: usize) -> NonNull<u8> {
    let mut ptr: *mut libc::c_void = std::ptr::null_mut();
    let rc = unsafe { libc::posix_memalign(&mut ptr, align, size) };
    if rc != 0 {
        alloc_failure(size);
    }
    if CLEAR {
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, size) };
    }
    unsafe { NonNull::new_unchecked(ptr as *mut u8) }
}

#[cfg(not(unix))]
fn aligned_heap_alloc<const CLEAR: bool>(_size: usize, align: usize) -> NonNull<u8> {
    panic!("alignment {align} exceeds the malloc guarantee on this platform");
}

#[cfg(unix)]
fn map_alloc(size: usize, align: usize) -> NonNull<u8> {
    // Mappings are page-aligned; anything stricter has no mapped-path answer.
    assert!(
        align <= PAGE_ALIGN,
        "alignment {align} above page size for a mapped allocation"
    );
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        alloc_failure(size);
    }
    // No zero-fill even for the zeroing configuration: the kernel guarantees
    // anonymous pages come back zeroed.
    MAPPED_BYTES.fetch_add(size, Ordering::AcqRel);
    unsafe { NonNull::new_unchecked(ptr as *mut u8) }
}

#[cfg(unix)]
unsafe fn map_free(ptr: NonNull<u8>, size: usize) {
    if unsafe { libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) } != 0 {
        std::process::abort();
    }
    MAPPED_BYTES.fetch_sub(size, Ordering::AcqRel);
}

#[cfg(target_os = "linux")]
unsafe fn map_grow(ptr: NonNull<u8>, old_size: usize, new_size: usize) -> NonNull<u8> {
    let p = unsafe {
        libc::mremap(
            ptr.as_ptr() as *mut libc::c_void,
            old_size,
            new_size,
            libc::MREMAP_MAYMOVE,
        )
    };
    if p == libc::MAP_FAILED {
        alloc_failure(new_size);
    }
    // Remapped pages keep their contents; growth arrives zero-filled.
    if new_size >= old_size {
        MAPPED_BYTES.fetch_add(new_size - old_size, Ordering::AcqRel);
    } else {
        MAPPED_BYTES.fetch_sub(old_size - new_size, Ordering::AcqRel);
    }
    unsafe { NonNull::new_unchecked(p as *mut u8) }
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn map_grow(ptr: NonNull<u8>, old_size: usize, new_size: usize) -> NonNull<u8> {
    // No mremap outside Linux: map a fresh region and copy.
    let p = map_alloc(new_size, PAGE_ALIGN);
    unsafe {
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), p.as_ptr(), old_size.min(new_size));
        map_free(ptr, old_size);
    }
    p
}

fn alloc_at<const CLEAR: bool>(size: usize, align: usize, threshold: usize) -> NonNull<u8> {
    debug_assert!(align.is_power_of_two());
    if size == 0 {
        return NonNull::dangling();
    }
    match route(size, threshold) {
        Route::Heap => heap_alloc::<CLEAR>(size, align),
        #[cfg(unix)]
        Route::Mapped => map_alloc(size, align),
    }
}

unsafe fn free_at(ptr: NonNull<u8>, size: usize, threshold: usize) {
    if size == 0 {
        return;
    }
    match route(size, threshold) {
        Route::Heap => unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) },
        #[cfg(unix)]
        Route::Mapped => unsafe { map_free(ptr, size) },
    }
}

unsafe fn realloc_at<const CLEAR: bool>(
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    align: usize,
    threshold: usize,
) -> NonNull<u8> {
    if old_size == new_size {
        return ptr;
    }
    if old_size == 0 {
        return alloc_at::<CLEAR>(new_size, align, threshold);
    }
    if new_size == 0 {
        unsafe { free_at(ptr, old_size, threshold) };
        return NonNull::dangling();
    }
    match (route(old_size, threshold), route(new_size, threshold)) {
        (Route::Heap, Route::Heap) if align <= MALLOC_MIN_ALIGN => {
            let p = unsafe { libc::realloc(ptr.as_ptr() as *mut libc::c_void, new_size) };
            let p = NonNull::new(p as *mut u8).unwrap_or_else(|| alloc_failure(new_size));
            if CLEAR && new_size > old_size {
                unsafe { std::ptr::write_bytes(p.as_ptr().add(old_size), 0, new_size - old_size) };
            }
            p
        }
        #[cfg(unix)]
        (Route::Mapped, Route::Mapped) => unsafe { map_grow(ptr, old_size, new_size) },
        _ => {
            // Crossing the threshold, or an over-aligned heap buffer libc
            // realloc cannot preserve: allocate, copy, free.
            let p = alloc_at::<CLEAR>(new_size, align, threshold);
            unsafe {
                std::ptr::copy_nonoverlapping(ptr.as_ptr(), p.as_ptr(), old_size.min(new_size));
                free_at(ptr, old_size, threshold);
            }
            p
        }
    }
}

/// Raw allocation service backing table storage.
///
/// `CLEAR` selects zero-initialization of every byte handed out (the slot
/// arrays rely on it: their all-zero state is "every slot vacant"). The
/// interface differs from a plain malloc wrapper in the same ways the
/// classic hash-table allocators do: `realloc` exists and uses `mremap` for
/// huge chunks, `free` takes the size, and `alloc` takes an alignment.
#[derive(Copy, Clone, Default)]
pub struct Allocator<const CLEAR: bool>;

/// Allocator handing out zero-initialized memory.
pub type ZeroingAllocator = Allocator<true>;
/// Allocator handing out uninitialized memory.
pub type RawAllocator = Allocator<false>;

impl<const CLEAR: bool> Allocator<CLEAR> {
    /// Allocates `size` bytes at the given power-of-two alignment.
    /// Zero-size requests return a dangling pointer. Aborts on failure.
    pub fn alloc(&self, size: usize, align: usize) -> NonNull<u8> {
        alloc_at::<CLEAR>(size, align, MMAP_THRESHOLD)
    }

    /// Releases a buffer previously obtained from this allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc`/`realloc` on an allocator with the same
    /// `CLEAR`, with exactly `size` as its current size, and must not be
    /// used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { free_at(ptr, size, MMAP_THRESHOLD) }
    }

    /// Resizes a buffer, preserving contents up to `min(old_size, new_size)`.
    /// Newly grown bytes are zero-filled only when `CLEAR` is set. The
    /// buffer may move; the old pointer is invalid afterwards.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::free`] for `ptr`/`old_size`; `align` must
    /// match the original allocation's alignment.
    pub unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> NonNull<u8> {
        unsafe { realloc_at::<CLEAR>(ptr, old_size, new_size, align, MMAP_THRESHOLD) }
    }
}

/// An owned, fixed-length, zero-initialized slice allocated through
/// [`ZeroingAllocator`]. This is how the tables keep their bucket, slot and
/// link arrays on the allocator while staying safe code themselves.
pub struct Buffer<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T> Buffer<T> {
    /// Allocates `len` zero-initialized elements.
    ///
    /// # Safety
    ///
    /// The all-zero byte pattern must be a valid `T`.
    pub unsafe fn zeroed(len: usize) -> Self {
        if len == 0 {
            return Self {
                ptr: NonNull::dangling(),
                len: 0,
            };
        }
        let bytes = len
            .checked_mul(size_of::<T>())
            .expect("buffer size overflow");
        let ptr = Allocator::<true>.alloc(bytes, align_of::<T>()).cast::<T>();
        Self { ptr, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of backing storage held by this buffer.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len * size_of::<T>()
    }
}

impl<T> Deref for Buffer<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for Buffer<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for Buffer<T> {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe { Allocator::<true>.free(self.ptr.cast::<u8>(), self.byte_len()) };
        }
    }
}

unsafe impl<T: Send> Send for Buffer<T> {}
unsafe impl<T: Sync> Sync for Buffer<T> {}
