//! Parallel bitonic sort of 32-bit key/value pairs.
//!
//! The classic comparator network, expressed the way the GPU runs it: an
//! outer stage loop over `length` in {1, 2, ..., N/2}, an inner loop over
//! `inc` in {length, length/2, ..., 1}, and a kernel family B2/B4/B8/B16
//! where the Bn kernel folds log2(n) consecutive `inc` levels into one
//! launch of N/n work items. Input length must be a power of two; callers
//! pad with [`SortPair::SENTINEL`] so the padding sorts to the tail.
//!
//! Equal keys may reorder - the sort is only stable as a multiset, which
//! is what the duplicate-aware radix-tree build downstream expects.

use bytemuck::{Pod, Zeroable};

use crate::{dispatch_1d, ComputeError, ComputeResult, DeviceProfile, SharedWrites};

/// One sortable element: a 32-bit key with a 32-bit payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SortPair {
    pub key: u32,
    pub value: u32,
}

impl SortPair {
    /// Padding element; sorts after every real key.
    pub const SENTINEL: SortPair = SortPair {
        key: u32::MAX,
        value: u32::MAX,
    };

    pub fn new(key: u32, value: u32) -> Self {
        Self { key, value }
    }
}

/// Driver for the bitonic kernel family.
pub struct BitonicSorter {
    profile: DeviceProfile,
}

impl BitonicSorter {
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }

    /// Sort `data` ascending by key. Length must be a power of two.
    pub fn sort(&self, data: &mut [SortPair]) -> ComputeResult<()> {
        let n = data.len();
        if n <= 1 {
            return Ok(());
        }
        if !n.is_power_of_two() {
            return Err(ComputeError::NotPowerOfTwo {
                what: "bitonic sort input",
                value: n,
            });
        }

        let shared = SharedWrites::new(data);
        let mut length = 1;
        while length < n {
            // Sort direction alternates in blocks of 2*length.
            let dir = length << 1;
            let mut inc = length;
            while inc > 0 {
                // Largest kernel the remaining level count allows.
                let ninc: u32 = if inc >= 8 {
                    4 // B16
                } else if inc >= 4 {
                    3 // B8
                } else if inc >= 2 {
                    2 // B4
                } else {
                    1 // B2
                };
                let threads = n >> ninc;
                let workgroup = self.profile.workgroup_for(threads);
                log::trace!(
                    "bitonic B{}: length {length}, inc {inc}, {threads} threads, workgroup {workgroup}",
                    1u32 << ninc
                );
                dispatch_1d(threads, |t| unsafe { bn_kernel(&shared, t, inc, dir, ninc) });
                inc >>= ninc;
            }
            length <<= 1;
        }
        Ok(())
    }
}

/// The Bn kernel: work item `t` gathers `2^ninc` elements covering `ninc`
/// consecutive comparator levels of the network, runs the clean bitonic
/// merge on them locally, and scatters back.
///
/// # Safety
/// Work items of one launch own disjoint element groups: the group base
/// index embeds the work-item id injectively.
unsafe fn bn_kernel(data: &SharedWrites<SortPair>, t: usize, inc: usize, dir: usize, ninc: u32) {
    let radix = 1usize << ninc;
    // Stride of the lowest level this kernel folds in.
    let stride = inc >> (ninc - 1);
    let low = t & (stride - 1);
    let base = ((t - low) << ninc) + low;
    let ascending = (base & dir) == 0;

    let mut local = [SortPair::SENTINEL; 16];
    for k in 0..radix {
        local[k] = data.read(base + k * stride);
    }

    // Clean bitonic merge over the gathered elements.
    let mut gap = radix >> 1;
    while gap > 0 {
        for j in 0..radix {
            if j & gap == 0 {
                let a = local[j];
                let b = local[j | gap];
                if (a.key > b.key) == ascending {
                    local[j] = b;
                    local[j | gap] = a;
                }
            }
        }
        gap >>= 1;
    }

    for k in 0..radix {
        data.write(base + k * stride, local[k]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn sorter() -> BitonicSorter {
        BitonicSorter::new(DeviceProfile::detect())
    }

    fn is_sorted(data: &[SortPair]) -> bool {
        data.windows(2).all(|w| w[0].key <= w[1].key)
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let mut data = vec![SortPair::new(3, 0), SortPair::new(1, 1), SortPair::new(2, 2)];
        assert!(matches!(
            sorter().sort(&mut data),
            Err(ComputeError::NotPowerOfTwo { .. })
        ));
    }

    #[test]
    fn test_sorts_small_array() {
        let keys = [7u32, 3, 9, 1, 0, 12, 5, 2];
        let mut data: Vec<SortPair> = keys
            .iter()
            .enumerate()
            .map(|(i, &k)| SortPair::new(k, i as u32))
            .collect();

        sorter().sort(&mut data).unwrap();

        let sorted_keys: Vec<u32> = data.iter().map(|p| p.key).collect();
        assert_eq!(sorted_keys, vec![0, 1, 2, 3, 5, 7, 9, 12]);
        // Values ride along with their keys.
        assert_eq!(data[0].value, 4);
        assert_eq!(data[7].value, 5);
    }

    #[test]
    fn test_sorts_random_large_array() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 1 << 14;
        let mut data: Vec<SortPair> = (0..n)
            .map(|i| SortPair::new(rng.gen::<u32>() >> 2, i as u32))
            .collect();
        let mut expected_keys: Vec<u32> = data.iter().map(|p| p.key).collect();
        let mut expected_values: Vec<u32> = data.iter().map(|p| p.value).collect();

        sorter().sort(&mut data).unwrap();

        assert!(is_sorted(&data));
        // Multisets of keys and values are preserved.
        let mut keys: Vec<u32> = data.iter().map(|p| p.key).collect();
        let mut values: Vec<u32> = data.iter().map(|p| p.value).collect();
        keys.sort_unstable();
        values.sort_unstable();
        expected_keys.sort_unstable();
        expected_values.sort_unstable();
        assert_eq!(keys, expected_keys);
        assert_eq!(values, expected_values);
    }

    #[test]
    fn test_duplicate_keys_keep_values() {
        let mut data: Vec<SortPair> = (0..256u32).map(|i| SortPair::new(i % 4, i)).collect();
        sorter().sort(&mut data).unwrap();

        assert!(is_sorted(&data));
        let mut values: Vec<u32> = data.iter().map(|p| p.value).collect();
        values.sort_unstable();
        assert_eq!(values, (0..256u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_sentinel_padding_sorts_to_tail() {
        let mut data = vec![SortPair::SENTINEL; 16];
        for (i, key) in [42u32, 17, 99, 3, 8].iter().enumerate() {
            data[i] = SortPair::new(*key, i as u32);
        }

        sorter().sort(&mut data).unwrap();

        assert!(is_sorted(&data));
        assert_eq!(data[0].key, 3);
        assert_eq!(data[4].key, 99);
        assert!(data[5..].iter().all(|p| *p == SortPair::SENTINEL));
    }

    #[test]
    fn test_single_element_and_pairs() {
        let mut one = vec![SortPair::new(5, 0)];
        sorter().sort(&mut one).unwrap();
        assert_eq!(one[0].key, 5);

        let mut two = vec![SortPair::new(9, 0), SortPair::new(4, 1)];
        sorter().sort(&mut two).unwrap();
        assert_eq!((two[0].key, two[1].key), (4, 9));
    }
}
