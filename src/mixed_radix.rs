//! Mixed-radix index arithmetic for banks and multiports.
//!
//! A position inside nested banks/multiports is a list of digits, one per
//! dimension, outermost first. Flattening is row-major: the last digit varies
//! fastest. Everything here is a pure function over slices.
//!
//! ```
//! use kairos::mixed_radix::{to_flat, from_flat};
//!
//! // bank of 3 reactors, each with a multiport of width 4
//! let radixes = [3, 4];
//! assert_eq!(to_flat(&[2, 1], &radixes), Some(9));
//! assert_eq!(from_flat(9, &radixes), Some(vec![2, 1]));
//! ```

/// Number of positions addressable with the given radixes.
///
/// Returns `None` on overflow. An empty radix list addresses one position.
pub fn capacity(radixes: &[usize]) -> Option<usize> {
    radixes
        .iter()
        .try_fold(1usize, |acc, &r| acc.checked_mul(r))
}

/// Flattens `digits` (outermost first) into a row-major index.
///
/// Returns `None` when the lengths differ or a digit is out of range.
pub fn to_flat(digits: &[usize], radixes: &[usize]) -> Option<usize> {
    if digits.len() != radixes.len() {
        return None;
    }
    let mut index = 0usize;
    for (&digit, &radix) in digits.iter().zip(radixes) {
        if digit >= radix {
            return None;
        }
        index = index.checked_mul(radix)?.checked_add(digit)?;
    }
    Some(index)
}

/// Inverse of [`to_flat`].
pub fn from_flat(mut index: usize, radixes: &[usize]) -> Option<Vec<usize>> {
    if index >= capacity(radixes)? {
        return None;
    }
    let mut digits = vec![0; radixes.len()];
    for (slot, &radix) in digits.iter_mut().zip(radixes).rev() {
        *slot = index % radix;
        index /= radix;
    }
    Some(digits)
}

/// Maps a row-major index to the index the same position has once the
/// dimensions are reordered by `permutation`.
///
/// `permutation[k]` names the source dimension that becomes dimension `k`.
/// Interleaved bank connections use `[1, 0]` over `[banks, width]`, which
/// enumerates channel-major instead of bank-major.
pub fn permute(index: usize, radixes: &[usize], permutation: &[usize]) -> Option<usize> {
    if permutation.len() != radixes.len() {
        return None;
    }
    let digits = from_flat(index, radixes)?;
    let mut permuted_digits = Vec::with_capacity(digits.len());
    let mut permuted_radixes = Vec::with_capacity(radixes.len());
    for &source in permutation {
        permuted_digits.push(*digits.get(source)?);
        permuted_radixes.push(radixes[source]);
    }
    to_flat(&permuted_digits, &permuted_radixes)
}

/// Enumerates every digit vector in row-major order.
pub fn positions(radixes: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    let count = capacity(radixes).unwrap_or(0);
    (0..count).filter_map(move |i| from_flat(i, radixes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity() {
        assert_eq!(capacity(&[]), Some(1));
        assert_eq!(capacity(&[3, 4, 2]), Some(24));
        assert_eq!(capacity(&[usize::MAX, 2]), None);
    }

    #[test]
    fn test_row_major_order() {
        let radixes = [2, 3];
        let flat: Vec<usize> = positions(&radixes)
            .map(|d| to_flat(&d, &radixes).unwrap())
            .collect();
        assert_eq!(flat, vec![0, 1, 2, 3, 4, 5]);

        let all: Vec<Vec<usize>> = positions(&radixes).collect();
        assert_eq!(all[3], vec![1, 0]);
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(to_flat(&[3, 0], &[3, 4]), None);
        assert_eq!(to_flat(&[1], &[3, 4]), None);
        assert_eq!(from_flat(12, &[3, 4]), None);
    }

    #[test]
    fn test_permute_interleaves() {
        // 2 banks x 3 channels; channel-major order visits
        // (0,0) (1,0) (0,1) (1,1) (0,2) (1,2)
        let radixes = [2, 3];
        let perm = [1, 0];
        assert_eq!(permute(0, &radixes, &perm), Some(0)); // (0,0)
        assert_eq!(permute(1, &radixes, &perm), Some(2)); // (0,1)
        assert_eq!(permute(3, &radixes, &perm), Some(1)); // (1,0)
        assert_eq!(permute(5, &radixes, &perm), Some(5)); // (1,2)
    }

    #[test]
    fn test_three_dimensions() {
        let radixes = [2, 3, 4];
        for i in 0..24 {
            let digits = from_flat(i, &radixes).unwrap();
            assert_eq!(to_flat(&digits, &radixes), Some(i));
        }
        assert_eq!(from_flat(23, &radixes), Some(vec![1, 2, 3]));
    }
}
