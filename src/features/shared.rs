#![allow(unsafe_code)]

//! Shared access to a store from a cooperative single-threaded host.

use core::cell::UnsafeCell;

use crate::features::device::FlashDevice;
use crate::features::store::FeatureStore;

/// A [`FeatureStore`] placed in a `static`-friendly cell.
///
/// The store runs every operation to completion on the caller's context and
/// is not re-entrant, so shared access only needs to rule out preemption by
/// another invocation. [`with`](SharedStore::with) brackets each access in a
/// critical section; callers that can already guarantee exclusivity (for
/// example a main loop with interrupts masked) may use the unchecked
/// variant.
pub struct SharedStore<D: FlashDevice, const PAGE: usize, const SUBSECTOR: usize> {
    inner: UnsafeCell<FeatureStore<D, PAGE, SUBSECTOR>>,
}

// Safety: all access to the inner store is serialized through a critical
// section or the caller's exclusivity guarantee.
unsafe impl<D: FlashDevice + Send, const PAGE: usize, const SUBSECTOR: usize> Sync
    for SharedStore<D, PAGE, SUBSECTOR>
{
}

impl<D: FlashDevice, const PAGE: usize, const SUBSECTOR: usize> SharedStore<D, PAGE, SUBSECTOR> {
    /// Wraps a store for shared access.
    pub fn new(store: FeatureStore<D, PAGE, SUBSECTOR>) -> Self {
        Self {
            inner: UnsafeCell::new(store),
        }
    }

    /// Runs `f` with exclusive access to the store inside a critical
    /// section.
    pub fn with<R>(&self, f: impl FnOnce(&mut FeatureStore<D, PAGE, SUBSECTOR>) -> R) -> R {
        critical_section::with(|_| unsafe { self.with_unchecked(f) })
    }

    /// Runs `f` with exclusive access to the store.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other code accesses this
    /// `SharedStore` for the duration of the call.
    pub unsafe fn with_unchecked<R>(
        &self,
        f: impl FnOnce(&mut FeatureStore<D, PAGE, SUBSECTOR>) -> R,
    ) -> R {
        let store = unsafe { &mut *self.inner.get() };
        f(store)
    }

    /// Unwraps the inner store.
    pub fn into_inner(self) -> FeatureStore<D, PAGE, SUBSECTOR> {
        self.inner.into_inner()
    }
}
