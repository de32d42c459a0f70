// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Four-lane float vectors and 16-byte-aligned buffers.
//!
//! The accumulators and the warp buffers process points four at a time.
//! `F32x4` keeps the lane-wise arithmetic explicit and auto-vectorizable;
//! `LaneBuffer` owns the aligned storage so that every buffer of the
//! tracker can be viewed both as flat `f32` data and as whole lanes.

use std::ops::{Add, AddAssign, Mul, Neg, Sub};

/// A four-lane f32 vector with guaranteed 16-byte alignment.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
#[repr(C, align(16))]
pub struct F32x4(pub [f32; 4]);

impl F32x4 {
    pub const ZERO: Self = F32x4([0.0; 4]);

    /// All four lanes set to the same value.
    #[inline]
    pub fn splat(v: f32) -> Self {
        F32x4([v; 4])
    }

    /// Load four consecutive values.
    #[inline]
    pub fn from_slice(s: &[f32]) -> Self {
        F32x4([s[0], s[1], s[2], s[3]])
    }

    #[inline]
    pub fn horizontal_sum(self) -> f32 {
        self.0[0] + self.0[1] + self.0[2] + self.0[3]
    }

    /// Lane-wise reciprocal.
    #[inline]
    pub fn recip(self) -> Self {
        F32x4([
            1.0 / self.0[0],
            1.0 / self.0[1],
            1.0 / self.0[2],
            1.0 / self.0[3],
        ])
    }
}

impl Add for F32x4 {
    type Output = F32x4;
    #[inline]
    fn add(self, rhs: F32x4) -> F32x4 {
        F32x4([
            self.0[0] + rhs.0[0],
            self.0[1] + rhs.0[1],
            self.0[2] + rhs.0[2],
            self.0[3] + rhs.0[3],
        ])
    }
}

impl Sub for F32x4 {
    type Output = F32x4;
    #[inline]
    fn sub(self, rhs: F32x4) -> F32x4 {
        F32x4([
            self.0[0] - rhs.0[0],
            self.0[1] - rhs.0[1],
            self.0[2] - rhs.0[2],
            self.0[3] - rhs.0[3],
        ])
    }
}

impl Mul for F32x4 {
    type Output = F32x4;
    #[inline]
    fn mul(self, rhs: F32x4) -> F32x4 {
        F32x4([
            self.0[0] * rhs.0[0],
            self.0[1] * rhs.0[1],
            self.0[2] * rhs.0[2],
            self.0[3] * rhs.0[3],
        ])
    }
}

impl AddAssign for F32x4 {
    #[inline]
    fn add_assign(&mut self, rhs: F32x4) {
        *self = *self + rhs;
    }
}

impl Neg for F32x4 {
    type Output = F32x4;
    #[inline]
    fn neg(self) -> F32x4 {
        F32x4([-self.0[0], -self.0[1], -self.0[2], -self.0[3]])
    }
}

/// An f32 buffer whose storage is 16-byte aligned and sized in whole lanes.
///
/// Allocated once at tracker construction; the live length is tracked by
/// the caller. The flat view spans the full allocated capacity so that the
/// zero padding past the live length is always addressable.
#[derive(Clone)]
pub struct LaneBuffer {
    lanes: Vec<F32x4>,
}

impl LaneBuffer {
    /// Allocate a zeroed buffer able to hold at least `n` floats.
    pub fn zeros(n: usize) -> Self {
        let nb_lanes = n.div_ceil(4);
        LaneBuffer {
            lanes: vec![F32x4::ZERO; nb_lanes],
        }
    }

    /// Number of floats the buffer can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        4 * self.lanes.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        // F32x4 is repr(C): four contiguous f32 per lane.
        unsafe {
            std::slice::from_raw_parts(self.lanes.as_ptr().cast::<f32>(), self.capacity())
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        unsafe {
            std::slice::from_raw_parts_mut(self.lanes.as_mut_ptr().cast::<f32>(), self.capacity())
        }
    }

    #[inline]
    pub fn lanes(&self) -> &[F32x4] {
        &self.lanes
    }

    /// Lane containing floats `[4 * i, 4 * i + 4)`.
    #[inline]
    pub fn lane(&self, i: usize) -> F32x4 {
        self.lanes[i]
    }

    pub fn fill_zero(&mut self) {
        self.lanes.fill(F32x4::ZERO);
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn lane_buffer_is_aligned() {
        let buffer = LaneBuffer::zeros(37);
        assert_eq!(buffer.capacity(), 40);
        assert_eq!(buffer.as_slice().as_ptr() as usize % 16, 0);
    }

    #[test]
    fn lane_view_matches_flat_view() {
        let mut buffer = LaneBuffer::zeros(8);
        for (i, v) in buffer.as_mut_slice().iter_mut().enumerate() {
            *v = i as f32;
        }
        assert_eq!(buffer.lane(1), F32x4([4.0, 5.0, 6.0, 7.0]));
    }

    #[test]
    fn horizontal_sum() {
        let v = F32x4([1.0, 2.0, 3.0, 4.0]);
        assert_eq!(v.horizontal_sum(), 10.0);
    }
}
