// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tightly-coupled inertial measurements: pre-integration between frame
//! timestamps and the whitened 15-D inertial residual.

pub mod preintegration;
pub mod residual;

pub use preintegration::Preintegration;
pub use residual::{evaluate, ImuResidual};

use crate::misc::type_aliases::Vec3d;

/// One inertial sample. The provider delivers an ordered sequence
/// covering the tracked time window.
#[derive(Copy, Clone, Debug)]
pub struct ImuMeasurement {
    pub timestamp: f64,
    /// Angular velocity in rad/s.
    pub gyro: Vec3d,
    /// Linear acceleration in m/s^2.
    pub acc: Vec3d,
}

/// Noise and saturation characteristics of the inertial unit.
#[derive(Copy, Clone, Debug)]
pub struct ImuParameters {
    /// Gyro noise density.
    pub sigma_g_c: f64,
    /// Accelerometer noise density.
    pub sigma_a_c: f64,
    /// Gyro bias random walk.
    pub sigma_gw_c: f64,
    /// Accelerometer bias random walk.
    pub sigma_aw_c: f64,
    /// Gravity magnitude.
    pub g: f64,
    /// Accelerometer saturation threshold.
    pub a_max: f64,
    /// Gyro saturation threshold.
    pub g_max: f64,
}

impl Default for ImuParameters {
    fn default() -> Self {
        ImuParameters {
            sigma_g_c: 12.0e-4,
            sigma_a_c: 8.0e-3,
            sigma_gw_c: 4.0e-6,
            sigma_aw_c: 4.0e-5,
            g: 9.81,
            a_max: 176.0,
            g_max: 7.8,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ImuError {
    /// The sample sequence does not cover the tracked time window; the
    /// caller must fall back to visual-only tracking.
    #[error("imu data does not cover the integration window")]
    WindowNotCovered,
    /// The propagated covariance could not be inverted.
    #[error("preintegration covariance is degenerate")]
    DegenerateCovariance,
}
