// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration of the tracker.
//!
//! All process-wide thresholds and parameter scales of the original system
//! are gathered here and passed by reference at construction; there is no
//! hidden module-level state.

use crate::misc::type_aliases::Float;

/// Optimization mode of one affine illumination variable.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum AffineOptMode {
    /// The variable is fixed (forced to zero on output).
    Fixed,
    /// Optimized without a prior; a non-zero initial value is allowed.
    Free,
    /// Optimized against a zero prior of the given weight.
    Prior(Float),
}

impl AffineOptMode {
    #[inline]
    pub fn is_fixed(self) -> bool {
        matches!(self, AffineOptMode::Fixed)
    }

    #[inline]
    pub fn is_free(self) -> bool {
        matches!(self, AffineOptMode::Free)
    }
}

/// Scales applied to the optimization variables so that all step components
/// live in a comparable numeric range.
#[derive(Copy, Clone, Debug)]
pub struct ParamScales {
    pub xi_rot: Float,
    pub xi_trans: Float,
    pub f: Float,
    pub c: Float,
    pub a: Float,
    pub b: Float,
    pub idepth: Float,
}

impl Default for ParamScales {
    fn default() -> Self {
        ParamScales {
            xi_rot: 1.0,
            xi_trans: 0.5,
            f: 50.0,
            c: 50.0,
            a: 10.0,
            b: 1000.0,
            idepth: 1.0,
        }
    }
}

/// Settings of the coarse tracker and the residual linearizer.
#[derive(Clone, Debug)]
pub struct TrackerSettings {
    /// Huber threshold of the photometric residual.
    pub huber_th: Float,
    /// Baseline per-pixel residual cutoff of the coarse tracker.
    pub coarse_cutoff_th: Float,
    /// Gradient-dependent down-weighting constant of the linearizer.
    pub outlier_th_sum_component: Float,
    pub affine_opt_mode_a: AffineOptMode,
    pub affine_opt_mode_b: AffineOptMode,
    /// Whitening weight of the inertial residual.
    pub imu_residual_weight: f64,
    /// Render the per-level residual image while tracking.
    pub render_display_coarse_tracking_full: bool,
    /// Silence the informational solver output.
    pub debugout_runquiet: bool,
    /// Dump the colorized depth map to `images_out/`.
    pub debug_save_images: bool,
    pub scales: ParamScales,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        TrackerSettings {
            huber_th: 9.0,
            coarse_cutoff_th: 20.0,
            outlier_th_sum_component: 50.0 * 50.0,
            affine_opt_mode_a: AffineOptMode::Prior(1e12),
            affine_opt_mode_b: AffineOptMode::Prior(1e12),
            imu_residual_weight: 1.0,
            render_display_coarse_tracking_full: false,
            debugout_runquiet: true,
            debug_save_images: false,
            scales: ParamScales::default(),
        }
    }
}

// TESTS #############################################################
