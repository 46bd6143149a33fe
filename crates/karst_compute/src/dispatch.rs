//! Kernel dispatch for the host backend.
//!
//! A "kernel launch" here is a rayon parallel loop over the global work
//! size. Kernels that scatter to computed indices of a shared output go
//! through [`SharedWrites`], which carries the aliasing contract.

use std::marker::PhantomData;

use rayon::prelude::*;

/// Run `kernel` once for every work item in `0..global_size`.
pub fn dispatch_1d<F>(global_size: usize, kernel: F)
where
    F: Fn(usize) + Send + Sync,
{
    (0..global_size).into_par_iter().for_each(kernel);
}

/// A slice handle that work items of a single dispatch may scatter into.
///
/// # Safety contract
///
/// All `read`/`write` calls are `unsafe` with one rule: within one
/// dispatch, an index written by some work item must not be read or
/// written by any other work item. Every kernel using this type derives
/// its target indices injectively from the work-item id (bitonic exchange
/// groups, strided scan blocks, pair slots at prefix-sum offsets), which
/// is exactly that guarantee.
pub struct SharedWrites<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedWrites<'_, T> {}
unsafe impl<T: Send> Sync for SharedWrites<'_, T> {}

impl<'a, T> SharedWrites<'a, T> {
    /// Borrow a slice for the duration of a dispatch.
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    /// Number of elements behind the handle.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the handle is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the element at `index`.
    ///
    /// # Safety
    /// `index < len()`, and no concurrent work item writes `index`.
    #[inline]
    pub unsafe fn read(&self, index: usize) -> T
    where
        T: Copy,
    {
        debug_assert!(index < self.len);
        *self.ptr.add(index)
    }

    /// Write the element at `index`.
    ///
    /// # Safety
    /// `index < len()`, and no concurrent work item reads or writes
    /// `index`.
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        *self.ptr.add(index) = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_covers_range() {
        let mut out = vec![0u32; 1024];
        let shared = SharedWrites::new(&mut out);
        dispatch_1d(1024, |i| unsafe { shared.write(i, i as u32 * 2) });

        assert!(out.iter().enumerate().all(|(i, &v)| v == i as u32 * 2));
    }

    #[test]
    fn test_disjoint_strided_writes() {
        // Two work items per stride pair, as the sort kernels do.
        let mut out = vec![0u32; 64];
        let shared = SharedWrites::new(&mut out);
        dispatch_1d(32, |t| unsafe {
            shared.write(t * 2, 1);
            shared.write(t * 2 + 1, 2);
        });

        assert_eq!(out.iter().sum::<u32>(), 32 * 3);
    }
}
