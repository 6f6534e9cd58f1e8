//! A spinlock-protected heap that can be shared between harts.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
};

use log::debug;
use spin::Mutex;

use crate::{
    stats::HeapStats, AllocError, AllocInitError, BackingAllocator, BuddyHeap, Raw,
};

/// A [`BuddyHeap`] behind a spinlock.
///
/// Every operation takes the lock for its whole duration. The heap may be
/// created empty in a `static` and initialized once the memory map is
/// known, which makes this type suitable as a `#[global_allocator]`:
///
/// ```
/// use kbuddy::{LockedBuddyHeap, Raw};
///
/// static HEAP: LockedBuddyHeap<64, Raw> = LockedBuddyHeap::empty();
///
/// assert!(HEAP.allocate(64).is_err());
/// ```
pub struct LockedBuddyHeap<const LEAF_SIZE: usize, A: BackingAllocator> {
    inner: Mutex<Option<BuddyHeap<LEAF_SIZE, A>>>,
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> LockedBuddyHeap<LEAF_SIZE, A> {
    /// Creates an uninitialized heap. Every allocation fails until the heap
    /// is initialized.
    pub const fn empty() -> LockedBuddyHeap<LEAF_SIZE, A> {
        LockedBuddyHeap {
            inner: Mutex::new(None),
        }
    }

    /// Wraps an initialized heap.
    pub fn new(heap: BuddyHeap<LEAF_SIZE, A>) -> LockedBuddyHeap<LEAF_SIZE, A> {
        LockedBuddyHeap {
            inner: Mutex::new(Some(heap)),
        }
    }

    /// Returns whether the heap has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Attempts to allocate a block of at least `nbytes` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the heap is uninitialized or has no free block large
    /// enough.
    pub fn allocate(&self, nbytes: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.inner
            .lock()
            .as_mut()
            .ok_or(AllocError)?
            .allocate(nbytes)
    }

    /// Returns the block at `ptr` to the heap.
    ///
    /// # Panics
    ///
    /// Panics if the heap is uninitialized or `ptr` is outside the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block currently allocated by this heap.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock();
        let heap = inner
            .as_mut()
            .expect("release on an uninitialized heap");

        unsafe { heap.release(ptr) };
    }

    /// Returns a snapshot of the heap's free space, or `None` if the heap is
    /// uninitialized.
    pub fn stats(&self) -> Option<HeapStats> {
        self.inner.lock().as_ref().map(BuddyHeap::stats)
    }

    /// Logs the heap's free space at debug level.
    pub fn log_stats(&self) {
        match self.stats() {
            Some(stats) => debug!("buddy heap statistics:\n{}", stats),
            None => debug!("buddy heap statistics: uninitialized"),
        }
    }
}

impl<const LEAF_SIZE: usize> LockedBuddyHeap<LEAF_SIZE, Raw> {
    /// Initializes the heap to manage the memory in `[base, end)`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the heap is already initialized, or if
    /// [`BuddyHeap::init`] fails.
    ///
    /// # Safety
    ///
    /// See [`BuddyHeap::init`].
    pub unsafe fn init(&self, base: NonNull<u8>, end: NonNull<u8>) -> Result<(), AllocInitError> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(AllocInitError::AlreadyInitialized);
        }

        *inner = Some(unsafe { BuddyHeap::init(base, end)? });

        Ok(())
    }
}

unsafe impl<const LEAF_SIZE: usize, A: BackingAllocator + Send> GlobalAlloc
    for LockedBuddyHeap<LEAF_SIZE, A>
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are only guaranteed to be aligned to a leaf.
        if layout.align() > LEAF_SIZE {
            return ptr::null_mut();
        }

        match self.allocate(layout.size()) {
            Ok(block) => block.cast().as_ptr(),
            Err(AllocError) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            unsafe { self.release(ptr) };
        }
    }
}

impl<const LEAF_SIZE: usize, A: BackingAllocator> fmt::Debug for LockedBuddyHeap<LEAF_SIZE, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("LockedBuddyHeap");

        match self.inner.try_lock() {
            Some(heap) => s.field("heap", &*heap),
            None => s.field("heap", &format_args!("<locked>")),
        };

        s.finish()
    }
}
