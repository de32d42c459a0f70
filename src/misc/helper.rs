// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Small helpers shared across modules.

use crate::misc::type_aliases::Float;

/// Check that a coordinate is in the bounds of an image of a given size.
pub fn in_image_bounds(pos: (Float, Float), shape: (usize, usize)) -> bool {
    let (x, y) = pos;
    let (nrows, ncols) = shape;
    0.0 <= x && x < (ncols - 1) as Float && 0.0 <= y && y < (nrows - 1) as Float
}

/// Value at the given quantile of a sorted slice.
pub fn sorted_quantile(sorted: &[Float], q: Float) -> Float {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len() - 1;
    sorted[(n as Float * q) as usize]
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn bounds_check() {
        assert!(in_image_bounds((0.0, 0.0), (10, 20)));
        assert!(in_image_bounds((18.9, 8.9), (10, 20)));
        assert!(!in_image_bounds((19.5, 5.0), (10, 20)));
        assert!(!in_image_bounds((-0.1, 5.0), (10, 20)));
    }

    #[test]
    fn quantiles_of_sorted_data() {
        let data: Vec<Float> = (0..101).map(|i| i as Float).collect();
        assert_eq!(sorted_quantile(&data, 0.05), 5.0);
        assert_eq!(sorted_quantile(&data, 0.95), 95.0);
    }
}
