//! Lock-free Chase-Lev work-stealing deque
//!
//! Each worker owns one deque. The owner pushes and pops at the tail (LIFO),
//! which keeps execution depth-first and cache-warm; any other worker steals
//! from the head (FIFO), taking the oldest and typically largest pending
//! subtree.
//!
//! # Linearizability
//!
//! - The owner is the only writer of `bottom`; thieves only advance `top`
//!   through a CAS, so every element is handed out exactly once
//! - A pop that races with thieves for the last element resolves through the
//!   same CAS on `top`
//! - Buffers replaced by growth are retired, not freed, until the deque itself
//!   drops, so a thief holding a stale buffer pointer always reads live memory

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{self, AtomicIsize, AtomicPtr, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// Initial slot count; always a power of two
const MIN_CAPACITY: usize = 64;

/// Circular array backing a deque
struct Buffer<T> {
    /// Storage slots, indexed modulo capacity
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Capacity minus one, for index wrapping
    mask: usize,
}

impl<T> Buffer<T> {
    fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: capacity - 1,
        }
    }

    #[inline]
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    #[inline]
    fn at(&self, index: isize) -> *mut MaybeUninit<T> {
        self.slots[(index as usize) & self.mask].get()
    }

    /// Write a value into the slot for `index`.
    ///
    /// SAFETY: only the owner writes, and only to slots outside `[top, bottom)`.
    #[inline]
    unsafe fn write(&self, index: isize, value: T) {
        self.write_uninit(index, MaybeUninit::new(value));
    }

    /// Store raw slot contents, initialised or not.
    ///
    /// SAFETY: same as [`Buffer::write`].
    #[inline]
    unsafe fn write_uninit(&self, index: isize, value: MaybeUninit<T>) {
        ptr::write(self.at(index), value);
    }

    /// Bitwise-copy the slot for `index` without claiming it.
    ///
    /// The copy stays a `MaybeUninit` until the caller has won the slot. A
    /// thief holding a stale buffer or racing the owner's write into a
    /// recycled slot may copy garbage, so the read is volatile and the copy
    /// must only be `assume_init`-ed after a successful CAS on `top`.
    ///
    /// SAFETY: `index` must be in bounds of a live or retired buffer.
    #[inline]
    unsafe fn read(&self, index: isize) -> MaybeUninit<T> {
        ptr::read_volatile(self.at(index))
    }
}

/// State shared between the owner handle and its stealers
struct Inner<T> {
    /// Tail index, written only by the owner
    bottom: CachePadded<AtomicIsize>,
    /// Head index, advanced by thieves (and the owner on the last element)
    top: CachePadded<AtomicIsize>,
    /// Current circular buffer
    buffer: CachePadded<AtomicPtr<Buffer<T>>>,
    /// Buffers replaced by growth; kept alive for in-flight thieves
    retired: Mutex<Vec<Box<Buffer<T>>>>,
    _marker: PhantomData<T>,
}

// SAFETY: elements are moved between threads but never shared; every element
// is read out by exactly one winner of the `top`/`bottom` protocol.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new() -> Self {
        let buffer = Box::into_raw(Box::new(Buffer::with_capacity(MIN_CAPACITY)));
        Self {
            bottom: CachePadded::new(AtomicIsize::new(0)),
            top: CachePadded::new(AtomicIsize::new(0)),
            buffer: CachePadded::new(AtomicPtr::new(buffer)),
            retired: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    /// Approximate element count (may be stale)
    fn len(&self) -> usize {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Relaxed);
        bottom.saturating_sub(top).max(0) as usize
    }

    /// Double the buffer, moving `[top, bottom)` across. Owner only.
    fn grow(&self, bottom: isize, top: isize) -> *mut Buffer<T> {
        let old_ptr = self.buffer.load(Ordering::Relaxed);
        // SAFETY: the owner is the only thread that replaces the buffer.
        let old = unsafe { &*old_ptr };
        let new = Buffer::with_capacity(old.capacity() * 2);

        for index in top..bottom {
            // SAFETY: the bits move across untouched; retired buffers only free
            // their slots, so the old copies are never dropped.
            unsafe { new.write_uninit(index, old.read(index)) };
        }

        let new_ptr = Box::into_raw(Box::new(new));
        self.buffer.store(new_ptr, Ordering::Release);
        // SAFETY: `old_ptr` came from `Box::into_raw` and is no longer current.
        self.retired.lock().push(unsafe { Box::from_raw(old_ptr) });
        new_ptr
    }

    fn push(&self, value: T) {
        let bottom = self.bottom.load(Ordering::Relaxed);
        let top = self.top.load(Ordering::Acquire);
        let mut buffer = self.buffer.load(Ordering::Relaxed);

        // SAFETY: the owner holds the only mutable view of the buffer pointer.
        if bottom - top >= unsafe { (*buffer).capacity() } as isize {
            buffer = self.grow(bottom, top);
        }

        // SAFETY: slot `bottom` is outside `[top, bottom)` and owned by us.
        unsafe { (*buffer).write(bottom, value) };
        atomic::fence(Ordering::Release);
        self.bottom.store(bottom + 1, Ordering::Relaxed);
    }

    fn pop(&self) -> Option<T> {
        let bottom = self.bottom.load(Ordering::Relaxed) - 1;
        let buffer = self.buffer.load(Ordering::Relaxed);

        // Reserve the tail before looking at `top`.
        self.bottom.store(bottom, Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);
        let top = self.top.load(Ordering::Relaxed);

        let remaining = bottom - top;
        if remaining < 0 {
            // Empty: undo the reservation.
            self.bottom.store(bottom + 1, Ordering::Relaxed);
            return None;
        }

        // SAFETY: `buffer` is the current buffer and `bottom` is in bounds.
        let slot = unsafe { (*buffer).read(bottom) };
        if remaining > 0 {
            // SAFETY: thieves stop short of `bottom`, so the slot is ours and
            // was written by our own push.
            return Some(unsafe { slot.assume_init() });
        }

        // Last element: race the thieves for it.
        let won = self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.bottom.store(bottom + 1, Ordering::Relaxed);

        // SAFETY: winning the CAS makes the slot ours; it was written by our
        // own push. A lost copy is left uninitialised and never dropped.
        won.then(|| unsafe { slot.assume_init() })
    }

    fn steal(&self) -> Option<T> {
        let top = self.top.load(Ordering::Acquire);
        atomic::fence(Ordering::SeqCst);
        let bottom = self.bottom.load(Ordering::Acquire);

        if bottom - top <= 0 {
            return None;
        }

        let buffer = self.buffer.load(Ordering::Acquire);
        // SAFETY: `buffer` is either current or retired (never freed while the
        // deque lives), so the read stays in bounds.
        let slot = unsafe { (*buffer).read(top) };

        match self
            .top
            .compare_exchange(top, top + 1, Ordering::SeqCst, Ordering::Relaxed)
        {
            // SAFETY: a successful CAS proves `top` was still in `[top, bottom)`
            // of the buffer published before `bottom`, so the slot holds the
            // pushed value and it is now ours alone.
            Ok(_) => Some(unsafe { slot.assume_init() }),
            // Another thief, or the owner, took it; the copy is discarded.
            Err(_) => None,
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let bottom = *self.bottom.get_mut();
        let top = *self.top.get_mut();
        let buffer = *self.buffer.get_mut();

        // SAFETY: no other handle exists; `[top, bottom)` still holds values.
        unsafe {
            for index in top..bottom {
                ptr::drop_in_place((*(*buffer).at(index)).as_mut_ptr());
            }
            drop(Box::from_raw(buffer));
        }
    }
}

/// Owner handle of a work-stealing deque
///
/// `Send` so it can be moved into the worker thread, but not `Sync`: tail
/// operations are only ever issued by the single owning thread.
pub struct WorkerDeque<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> WorkerDeque<T> {
    /// Create an empty deque
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new()),
            _not_sync: PhantomData,
        }
    }

    /// Push onto the tail; amortized O(1), never blocks
    pub fn push_tail(&self, value: T) {
        self.inner.push(value);
    }

    /// Pop from the tail (most recently pushed first)
    pub fn pop_tail(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Create a handle other workers can steal through
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Approximate number of queued elements
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the deque appears empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for WorkerDeque<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Thief handle of a work-stealing deque
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Stealer<T> {
    /// Take the oldest element from the head
    ///
    /// Returns `None` when the deque is empty or when a concurrent pop or
    /// steal won the race for the element observed.
    pub fn steal_head(&self) -> Option<T> {
        self.inner.steal()
    }

    /// Approximate number of queued elements
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the deque appears empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
