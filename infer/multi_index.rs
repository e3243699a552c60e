use crate::basis::BasisError;
use serde::{Deserialize, Serialize};

/// A set of exponent tuples selecting the polynomial terms of a basis.
///
/// Terms are stored in graded order: ascending total degree, and within one
/// degree the first coordinate varies slowest (largest exponent first). This
/// order is part of the model: coefficient `j` of a class block always
/// multiplies term `j` of this set.
///
/// Deserialization regenerates the set from `dims` and `max_order` and
/// rejects stored terms that differ from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StoredMultiIndexSet")]
pub struct MultiIndexSet {
    dims: usize,
    max_order: usize,
    indices: Vec<Vec<usize>>,
}

#[derive(Deserialize)]
struct StoredMultiIndexSet {
    dims: usize,
    max_order: usize,
    indices: Vec<Vec<usize>>,
}

impl TryFrom<StoredMultiIndexSet> for MultiIndexSet {
    type Error = BasisError;

    fn try_from(stored: StoredMultiIndexSet) -> Result<Self, Self::Error> {
        let canonical = Self::total_order(stored.dims, stored.max_order)?;
        if stored.indices != canonical.indices {
            return Err(BasisError::NonCanonicalTerms {
                dims: stored.dims,
                max_order: stored.max_order,
            });
        }
        Ok(canonical)
    }
}

impl MultiIndexSet {
    /// Every tuple of `dims` non-negative integers whose sum is at most `max_order`.
    pub fn total_order(dims: usize, max_order: usize) -> Result<Self, BasisError> {
        if dims == 0 {
            return Err(BasisError::InvalidDimension(dims));
        }
        if max_order == 0 {
            return Err(BasisError::InvalidOrder(max_order));
        }

        let mut indices = Vec::new();
        let mut scratch = vec![0usize; dims];
        for degree in 0..=max_order {
            internal::push_compositions(degree, 0, &mut scratch, &mut indices);
        }

        Ok(Self {
            dims,
            max_order,
            indices,
        })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[usize]> {
        self.indices.iter().map(Vec::as_slice)
    }

    /// Largest exponent used in any single dimension.
    pub fn max_degree(&self) -> usize {
        self.indices
            .iter()
            .flat_map(|index| index.iter().copied())
            .max()
            .unwrap_or(0)
    }
}

mod internal {
    /// Appends all splits of `remaining` over `slot..` in descending lexicographic order.
    pub(super) fn push_compositions(
        remaining: usize,
        slot: usize,
        scratch: &mut [usize],
        out: &mut Vec<Vec<usize>>,
    ) {
        if slot + 1 == scratch.len() {
            scratch[slot] = remaining;
            out.push(scratch.to_vec());
            return;
        }
        for head in (0..=remaining).rev() {
            scratch[slot] = head;
            push_compositions(remaining - head, slot + 1, scratch, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binomial(n: usize, k: usize) -> usize {
        (1..=k).fold(1, |acc, i| acc * (n + 1 - i) / i)
    }

    #[test]
    fn test_two_dims_order_one() {
        let set = MultiIndexSet::total_order(2, 1).unwrap();
        let terms: Vec<Vec<usize>> = set.iter().map(|t| t.to_vec()).collect();
        assert_eq!(terms, vec![vec![0, 0], vec![1, 0], vec![0, 1]]);
    }

    #[test]
    fn test_graded_order_within_degree() {
        let set = MultiIndexSet::total_order(2, 2).unwrap();
        let terms: Vec<Vec<usize>> = set.iter().map(|t| t.to_vec()).collect();
        assert_eq!(
            terms,
            vec![
                vec![0, 0],
                vec![1, 0],
                vec![0, 1],
                vec![2, 0],
                vec![1, 1],
                vec![0, 2]
            ]
        );
    }

    #[test]
    fn test_cardinality_matches_binomial() {
        for dims in 1..=4 {
            for order in 1..=5 {
                let set = MultiIndexSet::total_order(dims, order).unwrap();
                assert_eq!(
                    set.len(),
                    binomial(dims + order, order),
                    "dims={dims} order={order}"
                );
                assert!(set.iter().all(|t| t.iter().sum::<usize>() <= order));
                assert_eq!(set.max_degree(), order);
            }
        }
    }

    #[test]
    fn test_order_is_stable_across_calls() {
        let a = MultiIndexSet::total_order(3, 4).unwrap();
        let b = MultiIndexSet::total_order(3, 4).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_deserialization_checks_term_order() {
        let stored = toml::to_string(&MultiIndexSet::total_order(2, 1).unwrap()).unwrap();
        let loaded: MultiIndexSet = toml::from_str(&stored).unwrap();
        assert_eq!(loaded, MultiIndexSet::total_order(2, 1).unwrap());

        let swapped = "dims = 2\nmax_order = 1\nindices = [[0, 0], [0, 1], [1, 0]]\n";
        assert!(toml::from_str::<MultiIndexSet>(swapped).is_err());

        let too_high = "dims = 2\nmax_order = 1\nindices = [[0, 0], [1, 0], [0, 2]]\n";
        assert!(toml::from_str::<MultiIndexSet>(too_high).is_err());

        let zero_order = "dims = 2\nmax_order = 0\nindices = [[0, 0]]\n";
        assert!(toml::from_str::<MultiIndexSet>(zero_order).is_err());
    }

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(matches!(
            MultiIndexSet::total_order(0, 2),
            Err(BasisError::InvalidDimension(0))
        ));
        assert!(matches!(
            MultiIndexSet::total_order(2, 0),
            Err(BasisError::InvalidOrder(0))
        ));
    }
}
