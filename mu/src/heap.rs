//! Allocator service for the runtime. Two entry points: atomic byte
//! buffers (no outgoing references) and traced objects. Everything is
//! released together when the heap goes away; collection itself lives
//! outside this crate.
use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use log::debug;
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct HeapCreateInfo {
    /// alignment of atomic buffers
    pub atomic_alignment: usize,
}

impl Default for HeapCreateInfo {
    fn default() -> Self {
        Self {
            atomic_alignment: 16,
        }
    }
}

/// Marker for objects the heap may hand out.
///
/// # Safety
/// Implementors must be `#[repr(C)]` with an [`crate::Object`] header as
/// their first field, so any object pointer can be read as a header.
pub unsafe trait HeapObject: 'static {}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub atomic_allocations: usize,
    pub atomic_bytes: usize,
    pub objects: usize,
}

#[derive(Default)]
struct Ledger {
    atomic: Vec<(NonNull<u8>, Layout)>,
    objects: Vec<*mut dyn HeapObject>,
    atomic_bytes: usize,
}

/// Owns every buffer and object it hands out. Nothing is reclaimed while
/// the heap is alive: allocations accumulate until the heap itself drops,
/// so long-lived threads grow their heap monotonically.
pub struct Heap {
    info: HeapCreateInfo,
    ledger: Mutex<Ledger>,
}

// all access to the ledger goes through the mutex
unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(info: HeapCreateInfo) -> Self {
        assert!(
            info.atomic_alignment.is_power_of_two(),
            "atomic alignment must be a power of two"
        );
        Self {
            info,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Zeroed bytes the collector never scans. Aborts on exhaustion.
    pub fn allocate_atomic(&self, size: usize) -> NonNull<u8> {
        let Ok(layout) = Layout::from_size_align(size.max(1), self.info.atomic_alignment) else {
            panic!("atomic allocation of {size} bytes exceeds the address space");
        };
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout);
        };
        let mut ledger = self.ledger.lock();
        ledger.atomic.push((ptr, layout));
        ledger.atomic_bytes += layout.size();
        ptr
    }

    /// Moves `object` into the heap and returns its stable address.
    pub fn allocate_object<T: HeapObject>(&self, object: T) -> NonNull<T> {
        let raw = Box::into_raw(Box::new(object));
        self.ledger.lock().objects.push(raw as *mut dyn HeapObject);
        // SAFETY: Box::into_raw never returns null
        unsafe { NonNull::new_unchecked(raw) }
    }

    pub fn stats(&self) -> HeapStats {
        let ledger = self.ledger.lock();
        HeapStats {
            atomic_allocations: ledger.atomic.len(),
            atomic_bytes: ledger.atomic_bytes,
            objects: ledger.objects.len(),
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let ledger = self.ledger.get_mut();
        debug!(
            "releasing heap: {} objects, {} atomic buffers ({} bytes)",
            ledger.objects.len(),
            ledger.atomic.len(),
            ledger.atomic_bytes
        );
        for object in ledger.objects.drain(..) {
            // SAFETY: came from Box::into_raw in allocate_object
            drop(unsafe { Box::from_raw(object) });
        }
        for (ptr, layout) in ledger.atomic.drain(..) {
            // SAFETY: allocated with this layout in allocate_atomic
            unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
        }
    }
}
