// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Symmetric outer-product accumulators with cascaded summation.
//!
//! The photometric Hessian of a tracking level is a sum of millions of
//! rank-one terms. Summing them into a single f32 buffer loses precision
//! once the running sum dwarfs the increments, so every accumulator here
//! keeps three tiers and shifts a tier up into the next one after 1000
//! updates. This bounds the magnitude ratio of any single addition.
//!
//! Lane layout: each upper-triangle entry holds four partial sums (one per
//! SIMD lane); `finish` folds the lanes and mirrors the triangle.

use nalgebra::SMatrix;

use crate::math::simd::F32x4;

const SHIFT_THRESHOLD: u32 = 1000;

/// Cascaded accumulator for a symmetric `D x D` matrix built from
/// weighted Jacobian outer products, four rows at a time. Any dimension
/// works; the solvers instantiate 9 and 11 (see the aliases below), the
/// tests also exercise 8.
///
/// When the last row passed to `update` is the (weighted) residual, the
/// finished matrix carries the Gauss-Newton `H` in its top-left
/// `(D-1) x (D-1)` block and `b = J^T W r` in its last column.
#[derive(Clone)]
pub struct SymAccumulator<const D: usize> {
    data: Vec<F32x4>,
    data_1k: Vec<F32x4>,
    data_1m: Vec<F32x4>,
    /// Total number of lane updates since `initialize`.
    pub num: usize,
    num_in1: u32,
    num_in1k: u32,
    num_in1m: u32,
}

/// Number of upper-triangle entries of a `D x D` symmetric matrix.
const fn triangle_len(d: usize) -> usize {
    d * (d + 1) / 2
}

impl<const D: usize> SymAccumulator<D> {
    pub fn new() -> Self {
        let len = triangle_len(D);
        SymAccumulator {
            data: vec![F32x4::ZERO; len],
            data_1k: vec![F32x4::ZERO; len],
            data_1m: vec![F32x4::ZERO; len],
            num: 0,
            num_in1: 0,
            num_in1k: 0,
            num_in1m: 0,
        }
    }

    /// Zero all buffers and counters.
    pub fn initialize(&mut self) {
        self.data.fill(F32x4::ZERO);
        self.data_1k.fill(F32x4::ZERO);
        self.data_1m.fill(F32x4::ZERO);
        self.num = 0;
        self.num_in1 = 0;
        self.num_in1k = 0;
        self.num_in1m = 0;
    }

    /// Accumulate the outer product of the given Jacobian rows.
    #[inline]
    pub fn update(&mut self, rows: &[F32x4; D]) {
        let mut idx = 0;
        for r in 0..D {
            for c in r..D {
                self.data[idx] += rows[r] * rows[c];
                idx += 1;
            }
        }
        self.num += 4;
        self.num_in1 += 1;
        self.shift_up(false);
    }

    /// Accumulate `w * J J^T` for a lane-wise weight vector.
    #[inline]
    pub fn update_weighted(&mut self, rows: &[F32x4; D], w: F32x4) {
        let mut idx = 0;
        for r in 0..D {
            let wr = w * rows[r];
            for c in r..D {
                self.data[idx] += wr * rows[c];
                idx += 1;
            }
        }
        self.num += 4;
        self.num_in1 += 1;
        self.shift_up(false);
    }

    /// Flush the cascade and reconstruct the full symmetric matrix.
    pub fn finish(&mut self) -> SMatrix<f32, D, D> {
        self.shift_up(true);
        debug_assert_eq!(self.num_in1, 0);
        debug_assert_eq!(self.num_in1k, 0);

        let mut h = SMatrix::<f32, D, D>::zeros();
        let mut idx = 0;
        for r in 0..D {
            for c in r..D {
                let v = self.data_1m[idx].horizontal_sum();
                h[(r, c)] = v;
                h[(c, r)] = v;
                idx += 1;
            }
        }
        h
    }

    fn shift_up(&mut self, force: bool) {
        if self.num_in1 > SHIFT_THRESHOLD || force {
            for (hi, lo) in self.data_1k.iter_mut().zip(self.data.iter_mut()) {
                *hi += *lo;
                *lo = F32x4::ZERO;
            }
            self.num_in1k += self.num_in1;
            self.num_in1 = 0;
        }
        if self.num_in1k > SHIFT_THRESHOLD || force {
            for (hi, lo) in self.data_1m.iter_mut().zip(self.data_1k.iter_mut()) {
                *hi += *lo;
                *lo = F32x4::ZERO;
            }
            self.num_in1m += self.num_in1k;
            self.num_in1k = 0;
        }
    }
}

impl<const D: usize> Default for SymAccumulator<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Mono coarse system: 8 variables plus the residual column.
pub type Accumulator9 = SymAccumulator<9>;
/// Stereo coarse system: 10 variables plus the residual column.
pub type Accumulator11 = SymAccumulator<11>;

const APPROX_TRI: usize = triangle_len(10);
const APPROX_TR: usize = 30;
const APPROX_BR: usize = 6;

/// Approximate 13-D accumulator with a 10+3 block layout.
///
/// The top-left 10x10 block is the outer sum of 10-vectors `x`, `y`
/// (passed split into 4+6 parts) weighted by the 2x2 matrix
/// `[a b; b c]`:
///
/// ```text
/// H_tl += [x y] * [a b; b c] * [x y]^T
/// ```
///
/// This is the per-pattern form produced by the photometric residual
/// linearizer: `x`/`y` are the intrinsics+pose Jacobian rows, `(a, b, c)`
/// the entries of the summed image-gradient Gram matrix.
pub struct AccumulatorApprox {
    data: [[f32; APPROX_TRI]; 3],
    top_right: [[f32; APPROX_TR]; 3],
    bot_right: [[f32; APPROX_BR]; 3],
    pub num: usize,
    num_in1: u32,
    num_in1k: u32,
    num_in1m: u32,
}

impl AccumulatorApprox {
    pub fn new() -> Self {
        AccumulatorApprox {
            data: [[0.0; APPROX_TRI]; 3],
            top_right: [[0.0; APPROX_TR]; 3],
            bot_right: [[0.0; APPROX_BR]; 3],
            num: 0,
            num_in1: 0,
            num_in1k: 0,
            num_in1m: 0,
        }
    }

    pub fn initialize(&mut self) {
        *self = AccumulatorApprox::new();
    }

    /// Weighted outer sum of the 4+6 split vectors into the 10x10 block.
    pub fn update(
        &mut self,
        x4: &[f32; 4],
        x6: &[f32; 6],
        y4: &[f32; 4],
        y6: &[f32; 6],
        a: f32,
        b: f32,
        c: f32,
    ) {
        let mut x = [0.0f32; 10];
        let mut y = [0.0f32; 10];
        x[..4].copy_from_slice(x4);
        x[4..].copy_from_slice(x6);
        y[..4].copy_from_slice(y4);
        y[4..].copy_from_slice(y6);

        let data = &mut self.data[0];
        let mut idx = 0;
        for r in 0..10 {
            for col in r..10 {
                data[idx] += a * x[col] * x[r] + c * y[col] * y[r] + b * (x[col] * y[r] + y[col] * x[r]);
                idx += 1;
            }
        }

        self.num += 1;
        self.num_in1 += 1;
        self.shift_up(false);
    }

    /// Cross terms between the 10 geometric variables and the 3 trailing
    /// (affine, residual) columns.
    #[allow(clippy::too_many_arguments)]
    pub fn update_top_right(
        &mut self,
        x4: &[f32; 4],
        x6: &[f32; 6],
        y4: &[f32; 4],
        y6: &[f32; 6],
        tr00: f32,
        tr10: f32,
        tr01: f32,
        tr11: f32,
        tr02: f32,
        tr12: f32,
    ) {
        let mut x = [0.0f32; 10];
        let mut y = [0.0f32; 10];
        x[..4].copy_from_slice(x4);
        x[4..].copy_from_slice(x6);
        y[..4].copy_from_slice(y4);
        y[4..].copy_from_slice(y6);

        let tr = &mut self.top_right[0];
        for r in 0..10 {
            tr[3 * r] += x[r] * tr00 + y[r] * tr10;
            tr[3 * r + 1] += x[r] * tr01 + y[r] * tr11;
            tr[3 * r + 2] += x[r] * tr02 + y[r] * tr12;
        }
    }

    /// Trailing 3x3 block (upper triangle, row major).
    pub fn update_bot_right(&mut self, a00: f32, a01: f32, a02: f32, a11: f32, a12: f32, a22: f32) {
        let br = &mut self.bot_right[0];
        br[0] += a00;
        br[1] += a01;
        br[2] += a02;
        br[3] += a11;
        br[4] += a12;
        br[5] += a22;
    }

    pub fn finish(&mut self) -> SMatrix<f32, 13, 13> {
        self.shift_up(true);
        debug_assert_eq!(self.num_in1, 0);
        debug_assert_eq!(self.num_in1k, 0);

        let mut h = SMatrix::<f32, 13, 13>::zeros();
        let mut idx = 0;
        for r in 0..10 {
            for c in r..10 {
                h[(r, c)] = self.data[2][idx];
                h[(c, r)] = self.data[2][idx];
                idx += 1;
            }
        }
        idx = 0;
        for r in 0..10 {
            for c in 0..3 {
                h[(r, c + 10)] = self.top_right[2][idx];
                h[(c + 10, r)] = self.top_right[2][idx];
                idx += 1;
            }
        }
        let br = &self.bot_right[2];
        h[(10, 10)] = br[0];
        h[(10, 11)] = br[1];
        h[(11, 10)] = br[1];
        h[(10, 12)] = br[2];
        h[(12, 10)] = br[2];
        h[(11, 11)] = br[3];
        h[(11, 12)] = br[4];
        h[(12, 11)] = br[4];
        h[(12, 12)] = br[5];
        h
    }

    fn shift_up(&mut self, force: bool) {
        if self.num_in1 > SHIFT_THRESHOLD || force {
            shift_block(&mut self.data, 0);
            shift_block(&mut self.top_right, 0);
            shift_block(&mut self.bot_right, 0);
            self.num_in1k += self.num_in1;
            self.num_in1 = 0;
        }
        if self.num_in1k > SHIFT_THRESHOLD || force {
            shift_block(&mut self.data, 1);
            shift_block(&mut self.top_right, 1);
            shift_block(&mut self.bot_right, 1);
            self.num_in1m += self.num_in1k;
            self.num_in1k = 0;
        }
    }
}

impl Default for AccumulatorApprox {
    fn default() -> Self {
        Self::new()
    }
}

fn shift_block<const N: usize>(tiers: &mut [[f32; N]; 3], from: usize) {
    let (lo, hi) = tiers.split_at_mut(from + 1);
    for (h, l) in hi[0].iter_mut().zip(lo[from].iter_mut()) {
        *h += *l;
        *l = 0.0;
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use nalgebra::SMatrix;
    use quickcheck::TestResult;

    fn splat_rows<const D: usize>(row: &[f32; D]) -> [F32x4; D] {
        let mut out = [F32x4::ZERO; D];
        for (o, &v) in out.iter_mut().zip(row.iter()) {
            *o = F32x4::splat(v);
        }
        out
    }

    #[test]
    fn finish_resets_tier_counters() {
        let mut acc = Accumulator9::new();
        let rows = splat_rows(&[1.0; 9]);
        for _ in 0..2500 {
            acc.update(&rows);
        }
        let _ = acc.finish();
        assert_eq!(acc.num_in1, 0);
        assert_eq!(acc.num_in1k, 0);
        assert_eq!(acc.num, 4 * 2500);
    }

    #[test]
    fn symmetric_output() {
        let mut acc = SymAccumulator::<8>::new();
        let rows = [
            F32x4([1.0, -2.0, 0.5, 3.0]),
            F32x4([0.0, 1.0, 2.0, -1.0]),
            F32x4([4.0, 0.25, -0.5, 1.0]),
            F32x4([1.5, 1.0, 1.0, 0.0]),
            F32x4([-3.0, 2.0, 0.0, 0.5]),
            F32x4([0.125, -1.0, 2.5, 2.0]),
            F32x4([1.0, 1.0, -1.0, -1.0]),
            F32x4([0.5, 0.5, 0.5, 0.5]),
        ];
        acc.update(&rows);
        let h = acc.finish();
        for r in 0..8 {
            for c in 0..8 {
                assert_eq!(h[(r, c)], h[(c, r)]);
            }
        }
    }

    #[test]
    fn hundred_thousand_identical_rows() {
        // Entries of magnitude one: the cascade must keep the sum within
        // 1e-6 relative error over 1e5 updates.
        let row = [1.0, -1.0, 0.5, -0.5, 1.0, 0.25, -1.0, 1.0, 0.5];
        let rows = splat_rows(&row);
        let mut acc = Accumulator9::new();
        let n = 100_000;
        for _ in 0..n {
            acc.update(&rows);
        }
        let h = acc.finish();
        let total = (4 * n) as f64;
        for r in 0..9 {
            for c in 0..9 {
                let expected = total * f64::from(row[r]) * f64::from(row[c]);
                let err = (f64::from(h[(r, c)]) - expected).abs();
                assert!(err <= 1e-6 * expected.abs(), "H({r},{c}) off by {err}");
            }
        }
    }

    #[test]
    fn weighted_update_single_lane() {
        let row = [2.0, -1.0, 0.5, 3.0, 1.0, 0.0, -2.0, 1.5, 1.0];
        let mut rows = [F32x4::ZERO; 9];
        for (o, &v) in rows.iter_mut().zip(row.iter()) {
            *o = F32x4([v, 0.0, 0.0, 0.0]);
        }
        let w = F32x4([0.25, 0.0, 0.0, 0.0]);
        let mut acc = Accumulator9::new();
        acc.update_weighted(&rows, w);
        let h = acc.finish();
        for r in 0..9 {
            for c in 0..9 {
                let expected = 0.25 * row[r] * row[c];
                assert!((h[(r, c)] - expected).abs() < 1e-6);
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn initialize_is_clean_slate(a: f32, b: f32) -> TestResult {
        if !a.is_finite() || !b.is_finite() {
            return TestResult::discard();
        }
        let mut acc = SymAccumulator::<8>::new();
        acc.update(&splat_rows(&[a, b, a, b, a, b, a, b]));
        acc.initialize();
        let h = acc.finish();
        TestResult::from_bool(h == SMatrix::<f32, 8, 8>::zeros() && acc.num == 0)
    }

    #[test]
    fn approx_matches_dense_reference() {
        let x4 = [0.5, -1.0, 2.0, 0.25];
        let x6 = [1.0, 0.0, -0.5, 2.0, 1.5, -1.0];
        let y4 = [2.0, 1.0, -1.0, 0.5];
        let y6 = [0.0, 1.0, 0.5, -2.0, 1.0, 0.25];
        let (a, b, c) = (2.0, 0.5, 1.5);

        let mut acc = AccumulatorApprox::new();
        for _ in 0..3 {
            acc.update(&x4, &x6, &y4, &y6, a, b, c);
        }
        let h = acc.finish();

        let mut x = SMatrix::<f32, 10, 1>::zeros();
        let mut y = SMatrix::<f32, 10, 1>::zeros();
        for i in 0..4 {
            x[i] = x4[i];
            y[i] = y4[i];
        }
        for i in 0..6 {
            x[4 + i] = x6[i];
            y[4 + i] = y6[i];
        }
        let reference = 3.0
            * (a * x * x.transpose()
                + c * y * y.transpose()
                + b * (x * y.transpose() + y * x.transpose()));
        for r in 0..10 {
            for col in 0..10 {
                assert!(
                    (h[(r, col)] - reference[(r, col)]).abs() < 1e-4,
                    "mismatch at ({r},{col})"
                );
            }
        }
    }

    #[test]
    fn approx_trailing_blocks() {
        let x4 = [1.0, 0.0, 0.0, 0.0];
        let x6 = [0.0; 6];
        let y4 = [0.0, 1.0, 0.0, 0.0];
        let y6 = [0.0; 6];
        let mut acc = AccumulatorApprox::new();
        acc.update_top_right(&x4, &x6, &y4, &y6, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        acc.update_bot_right(1.0, 2.0, 3.0, 4.0, 5.0, 6.0);
        let h = acc.finish();
        // row 0 of x pairs with (tr00, tr01, tr02); row 1 of y with (tr10, tr11, tr12).
        assert_eq!(h[(0, 10)], 1.0);
        assert_eq!(h[(0, 11)], 3.0);
        assert_eq!(h[(0, 12)], 5.0);
        assert_eq!(h[(1, 10)], 2.0);
        assert_eq!(h[(1, 11)], 4.0);
        assert_eq!(h[(1, 12)], 6.0);
        assert_eq!(h[(10, 10)], 1.0);
        assert_eq!(h[(11, 12)], 5.0);
        assert_eq!(h[(12, 12)], 6.0);
        assert_eq!(h, h.transpose());
    }
}
