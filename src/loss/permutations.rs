//! Slot permutations for assignment matching.
//!
//! A permutation `σ` is stored as a slice where `σ[k]` is the candidate slot
//! matched to true slot `k`. Permutations are enumerated in lexicographic
//! order starting from the identity; the loss engine breaks ties by taking
//! the first minimum in this order, so the order is part of the loss
//! definition.

use ndarray::{Array, ArrayView, Axis, RemoveAxis};

use crate::config::MAX_DETECTIONS_LIMIT;
use crate::error::{BlissError, Result};

/// Iterator over all permutations of `0..n` in lexicographic order.
pub struct LexicographicPermutations {
    next: Option<Vec<usize>>,
}

impl LexicographicPermutations {
    pub fn new(n: usize) -> Self {
        Self {
            next: Some((0..n).collect()),
        }
    }
}

impl Iterator for LexicographicPermutations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let current = self.next.take()?;

        // Standard next-permutation step:
        //   find the last ascent a[i] < a[i+1],
        //   swap a[i] with the last element greater than it,
        //   reverse the suffix.
        let mut succ = current.clone();
        let n = succ.len();
        if n > 1 {
            if let Some(i) = (0..n - 1).rev().find(|&i| succ[i] < succ[i + 1]) {
                let j = (i + 1..n).rev().find(|&j| succ[j] > succ[i]).unwrap_or(i + 1);
                succ.swap(i, j);
                succ[i + 1..].reverse();
                self.next = Some(succ);
            }
        }

        Some(current)
    }
}

/// Inverse permutation: `inverse(σ)[σ[k]] == k`.
pub fn inverse(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (k, &p) in perm.iter().enumerate() {
        inv[p] = k;
    }
    inv
}

/// Gather along the slot axis (axis 1): `out[:, k, ...] = x[:, perm[k], ...]`.
pub fn permute_slots<A, D>(x: &ArrayView<A, D>, perm: &[usize]) -> Array<A, D>
where
    A: Clone,
    D: RemoveAxis,
{
    x.select(Axis(1), perm)
}

/// All permutations of `0..max_detections`, computed once per model
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermutationTable {
    n: usize,
    perms: Vec<Vec<usize>>,
}

impl PermutationTable {
    /// Enumerate all `n!` permutations. Rejects `n > MAX_DETECTIONS_LIMIT`.
    pub fn new(n: usize) -> Result<Self> {
        if n > MAX_DETECTIONS_LIMIT {
            return Err(BlissError::PermutationOverflow {
                max_detections: n,
                limit: MAX_DETECTIONS_LIMIT,
            });
        }
        Ok(Self {
            n,
            perms: LexicographicPermutations::new(n).collect(),
        })
    }

    /// A table holding only the identity permutation.
    pub fn identity(n: usize) -> Self {
        Self {
            n,
            perms: vec![(0..n).collect()],
        }
    }

    /// Number of slots each permutation acts on.
    pub fn n_slots(&self) -> usize {
        self.n
    }

    pub fn len(&self) -> usize {
        self.perms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.perms.is_empty()
    }

    pub fn get(&self, index: usize) -> &[usize] {
        &self.perms[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[usize]> {
        self.perms.iter().map(|p| p.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_lexicographic_order() {
        let perms: Vec<Vec<usize>> = LexicographicPermutations::new(3).collect();
        assert_eq!(
            perms,
            vec![
                vec![0, 1, 2],
                vec![0, 2, 1],
                vec![1, 0, 2],
                vec![1, 2, 0],
                vec![2, 0, 1],
                vec![2, 1, 0],
            ]
        );
    }

    #[test]
    fn test_counts_are_factorial() {
        for (n, expected) in [(1, 1), (2, 2), (3, 6), (4, 24), (5, 120)] {
            let table = PermutationTable::new(n).unwrap();
            assert_eq!(table.len(), expected);
            assert_eq!(table.get(0), (0..n).collect::<Vec<_>>().as_slice());
        }
    }

    #[test]
    fn test_all_distinct() {
        let table = PermutationTable::new(4).unwrap();
        let mut seen = std::collections::HashSet::new();
        for p in table.iter() {
            let mut sorted = p.to_vec();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3]);
            assert!(seen.insert(p.to_vec()));
        }
    }

    #[test]
    fn test_overflow_rejected() {
        assert!(PermutationTable::new(MAX_DETECTIONS_LIMIT).is_ok());
        assert!(matches!(
            PermutationTable::new(MAX_DETECTIONS_LIMIT + 1),
            Err(BlissError::PermutationOverflow { .. })
        ));
    }

    #[test]
    fn test_permute_round_trip() {
        let x = Array3::from_shape_fn((3, 4, 2), |(t, s, d)| (t * 100 + s * 10 + d) as f64);
        let table = PermutationTable::new(4).unwrap();
        for p in table.iter() {
            let y = permute_slots(&x.view(), p);
            for k in 0..4 {
                assert_eq!(y[[1, k, 1]], x[[1, p[k], 1]]);
            }
            let back = permute_slots(&y.view(), &inverse(p));
            assert_eq!(back, x);
        }
    }

    #[test]
    fn test_identity_table() {
        let table = PermutationTable::identity(3);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0), &[0, 1, 2]);
    }
}
