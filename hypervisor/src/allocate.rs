//! Zero-initialized heap allocation for page-aligned hypervisor structures.
//! Large structures (EPT tables, bitmaps, stacks) must never be constructed
//! on the stack, so everything goes through `alloc_zeroed`.

use {
    alloc::{
        alloc::{alloc_zeroed, handle_alloc_error},
        boxed::Box,
    },
    core::alloc::Layout,
};

/// Allocates zeroed memory for `T` directly on the heap.
///
/// # Safety
///
/// All-zero bytes must be a valid representation of `T`.
pub unsafe fn box_zeroed<T>() -> Box<T> {
    let layout = Layout::new::<T>();
    let ptr = unsafe { alloc_zeroed(layout) }.cast::<T>();
    if ptr.is_null() {
        handle_alloc_error(layout);
    }
    unsafe { Box::from_raw(ptr) }
}
