// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Pinhole calibration and its multi-resolution pyramid.

use crate::misc::type_aliases::{Float, Mat3};

/// Maximum number of pyramid levels the tracker is built for.
pub const MAX_PYR_LEVELS: usize = 5;

/// Level-0 pinhole calibration of the (left) camera.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Calibration {
    pub fx: Float,
    pub fy: Float,
    pub cx: Float,
    pub cy: Float,
    pub width: usize,
    pub height: usize,
    /// Stereo baseline in meters (0 for monocular rigs).
    pub baseline: Float,
}

/// Per-level intrinsics of the pyramid, with `K` and `K^-1` cached.
///
/// Pyramid scaling obeys `fx_l = fx_0 / 2^l` and
/// `cx_l = (cx_0 + 0.5) / 2^l - 0.5` (likewise for y): pixel centers of a
/// 2x2 block of the finer level coincide with the pixel center of the
/// coarser one.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraPyramid {
    pub levels: usize,
    pub w: [usize; MAX_PYR_LEVELS],
    pub h: [usize; MAX_PYR_LEVELS],
    pub fx: [Float; MAX_PYR_LEVELS],
    pub fy: [Float; MAX_PYR_LEVELS],
    pub cx: [Float; MAX_PYR_LEVELS],
    pub cy: [Float; MAX_PYR_LEVELS],
    pub k: [Mat3; MAX_PYR_LEVELS],
    pub k_inv: [Mat3; MAX_PYR_LEVELS],
    pub baseline: Float,
}

impl CameraPyramid {
    /// Build (or rebuild) the per-level intrinsics. Idempotent.
    pub fn make(calib: &Calibration, levels: usize) -> Self {
        assert!(levels >= 1 && levels <= MAX_PYR_LEVELS);
        let mut pyr = CameraPyramid {
            levels,
            w: [0; MAX_PYR_LEVELS],
            h: [0; MAX_PYR_LEVELS],
            fx: [0.0; MAX_PYR_LEVELS],
            fy: [0.0; MAX_PYR_LEVELS],
            cx: [0.0; MAX_PYR_LEVELS],
            cy: [0.0; MAX_PYR_LEVELS],
            k: [Mat3::identity(); MAX_PYR_LEVELS],
            k_inv: [Mat3::identity(); MAX_PYR_LEVELS],
            baseline: calib.baseline,
        };

        pyr.w[0] = calib.width;
        pyr.h[0] = calib.height;
        pyr.fx[0] = calib.fx;
        pyr.fy[0] = calib.fy;
        pyr.cx[0] = calib.cx;
        pyr.cy[0] = calib.cy;

        for level in 1..levels {
            pyr.w[level] = pyr.w[0] >> level;
            pyr.h[level] = pyr.h[0] >> level;
            pyr.fx[level] = pyr.fx[level - 1] * 0.5;
            pyr.fy[level] = pyr.fy[level - 1] * 0.5;
            pyr.cx[level] = (pyr.cx[0] + 0.5) / (1 << level) as Float - 0.5;
            pyr.cy[level] = (pyr.cy[0] + 0.5) / (1 << level) as Float - 0.5;
        }

        for level in 0..levels {
            pyr.k[level] = Mat3::new(
                pyr.fx[level], 0.0, pyr.cx[level],
                0.0, pyr.fy[level], pyr.cy[level],
                0.0, 0.0, 1.0,
            );
            pyr.k_inv[level] = pyr.k[level]
                .try_inverse()
                .expect("pinhole K is always invertible");
        }
        pyr
    }

    #[inline]
    pub fn fxi(&self, level: usize) -> Float {
        self.k_inv[level][(0, 0)]
    }

    #[inline]
    pub fn fyi(&self, level: usize) -> Float {
        self.k_inv[level][(1, 1)]
    }

    #[inline]
    pub fn cxi(&self, level: usize) -> Float {
        self.k_inv[level][(0, 2)]
    }

    #[inline]
    pub fn cyi(&self, level: usize) -> Float {
        self.k_inv[level][(1, 2)]
    }
}

// TESTS #############################################################
