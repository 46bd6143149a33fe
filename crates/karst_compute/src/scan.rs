//! Blockwise inclusive prefix sum over `u32` arrays.
//!
//! Two kernels, launched in an outer loop whose stride grows by the block
//! size (2 elements per workgroup thread) each round: a block kernel that
//! scans the stride-decimated view in independent blocks, and a global
//! fix-up kernel that folds each block's boundary total into the elements
//! after it. The result is **inclusive**: `out[i] = sum(in[0..=i])`.
//! Downstream consumers read a primitive's first slot as
//! `prefix[i] - count[i]` and totals as `prefix[n - 1]`.
//!
//! Input length must be a power of two; callers zero-pad the tail.

use crate::{dispatch_1d, ComputeError, ComputeResult, DeviceProfile, SharedWrites};

/// Driver for the two-kernel scan.
pub struct PrefixSum {
    profile: DeviceProfile,
}

impl PrefixSum {
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }

    /// Elements a single workgroup scans in one block launch.
    fn block_size(&self) -> usize {
        self.profile.workgroup_for(self.profile.max_workgroup_size) * 2
    }

    /// Inclusive scan of `data` in place. Length must be a power of two.
    pub fn inclusive(&self, data: &mut [u32]) -> ComputeResult<()> {
        let n = data.len();
        if n <= 1 {
            return Ok(());
        }
        if !n.is_power_of_two() {
            return Err(ComputeError::NotPowerOfTwo {
                what: "prefix sum input",
                value: n,
            });
        }

        let block = self.block_size();
        let needed = block * std::mem::size_of::<u32>();
        if needed > self.profile.local_memory {
            return Err(ComputeError::InsufficientLocalMemory {
                kernel: "scan_block",
                needed,
                available: self.profile.local_memory,
            });
        }

        let mut offset = 1;
        while offset < n {
            if n / offset > 1 {
                scan_block_kernel(data, offset, block);
            }
            if offset > 1 {
                scan_fixup_kernel(data, offset, block);
            }
            offset *= block;
        }
        Ok(())
    }
}

/// Scan the view `v[j] = data[(j + 1) * offset - 1]` in independent blocks
/// of `block` elements. At `offset == 1` this is the per-block scan of the
/// raw input; later rounds scan block totals of the previous round.
fn scan_block_kernel(data: &mut [u32], offset: usize, block: usize) {
    let view_len = data.len() / offset;
    let num_blocks = view_len.div_ceil(block);
    let shared = SharedWrites::new(data);

    dispatch_1d(num_blocks, |b| {
        let start = b * block;
        let end = (start + block).min(view_len);
        let mut acc = 0u32;
        for j in start..end {
            let idx = (j + 1) * offset - 1;
            // SAFETY: blocks cover disjoint, per-work-item index ranges.
            unsafe {
                acc = acc.wrapping_add(shared.read(idx));
                shared.write(idx, acc);
            }
        }
    });
}

/// Fold block-boundary totals into the elements that follow them. Skips
/// boundary elements themselves (the block kernel already placed their
/// value) and the first block of every super-block (nothing precedes it
/// at this stride).
fn scan_fixup_kernel(data: &mut [u32], offset: usize, block: usize) {
    let n = data.len();
    let shared = SharedWrites::new(data);

    dispatch_1d(n, |i| {
        if (i + 1) % offset != 0 && (i / offset) % block != 0 {
            let boundary = (i / offset) * offset - 1;
            // SAFETY: each eligible `i` is written by exactly one work
            // item; boundary elements are never written in this launch.
            unsafe {
                let v = shared.read(i).wrapping_add(shared.read(boundary));
                shared.write(i, v);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn scanner() -> PrefixSum {
        PrefixSum::new(DeviceProfile::detect())
    }

    /// Scanner with a tiny block size so multi-round recursion is hit even
    /// by small arrays.
    fn tiny_block_scanner() -> PrefixSum {
        PrefixSum::new(DeviceProfile {
            max_workgroup_size: 2,
            wavefront: 2,
            local_memory: 32 * 1024,
            compute_units: 4,
        })
    }

    #[test]
    fn test_reference_sequence() {
        let mut data = vec![1u32, 2, 3, 4, 5, 6, 7, 8];
        scanner().inclusive(&mut data).unwrap();
        assert_eq!(data, vec![1, 3, 6, 10, 15, 21, 28, 36]);
    }

    #[test]
    fn test_reference_sequence_multi_round() {
        let mut data = vec![1u32, 2, 3, 4, 5, 6, 7, 8];
        tiny_block_scanner().inclusive(&mut data).unwrap();
        assert_eq!(data, vec![1, 3, 6, 10, 15, 21, 28, 36]);
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let mut data = vec![1u32, 2, 3];
        assert!(matches!(
            scanner().inclusive(&mut data),
            Err(ComputeError::NotPowerOfTwo { .. })
        ));
    }

    #[test]
    fn test_insufficient_local_memory() {
        let scan = PrefixSum::new(DeviceProfile {
            max_workgroup_size: 256,
            wavefront: 64,
            local_memory: 64,
            compute_units: 4,
        });
        let mut data = vec![0u32; 8];
        assert!(matches!(
            scan.inclusive(&mut data),
            Err(ComputeError::InsufficientLocalMemory { .. })
        ));
    }

    #[test]
    fn test_matches_sequential_scan() {
        let mut rng = StdRng::seed_from_u64(11);
        for log_n in [6usize, 10, 14] {
            let n = 1 << log_n;
            let input: Vec<u32> = (0..n).map(|_| rng.gen_range(0..16)).collect();
            let mut data = input.clone();
            scanner().inclusive(&mut data).unwrap();

            let mut acc = 0u32;
            for (i, &x) in input.iter().enumerate() {
                acc += x;
                assert_eq!(data[i], acc, "mismatch at {i} for n={n}");
            }
        }
    }

    #[test]
    fn test_adjacent_difference_recovers_input() {
        let input: Vec<u32> = (0..64).map(|i| (i * 7 + 3) % 13).collect();
        let mut data = input.clone();
        scanner().inclusive(&mut data).unwrap();

        assert_eq!(data[0], input[0]);
        for i in 1..input.len() {
            assert_eq!(data[i] - data[i - 1], input[i]);
        }
    }

    #[test]
    fn test_zero_padded_tail_holds_total() {
        // The padded region of a power-of-two buffer repeats the total.
        let mut data = vec![0u32; 16];
        for (i, v) in [5u32, 1, 2, 7, 9].iter().enumerate() {
            data[i] = *v;
        }
        scanner().inclusive(&mut data).unwrap();

        assert_eq!(data[4], 24);
        assert!(data[5..].iter().all(|&v| v == 24));
    }
}
