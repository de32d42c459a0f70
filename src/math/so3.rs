// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lie algebra/group functions for 3D rotations.
//!
//! Interesting reads:
//! - Sophus c++ library: <https://github.com/strasdat/Sophus>
//! - Ethan Eade course on Lie Groups for 2D and 3D transformations:
//!     - details: <http://ethaneade.com/lie.pdf>
//!     - summary: <http://ethaneade.com/lie_groups.pdf>
//! - Forster et al., "IMU Preintegration on Manifold" (right Jacobians).

use nalgebra::{Quaternion, UnitQuaternion};
use std::f64::consts::PI;

use crate::misc::type_aliases::{Mat3d, Vec3d};

/// Threshold for using Taylor series in computations.
const EPSILON_TAYLOR_SERIES: f64 = 1e-6;
const EPSILON_TAYLOR_SERIES_2: f64 = EPSILON_TAYLOR_SERIES * EPSILON_TAYLOR_SERIES;
const _1_8: f64 = 0.125;
const _1_48: f64 = 1.0 / 48.0;

/// Hat operator.
/// Goes from so3 parameterization to so3 element (skew-symmetric matrix).
#[rustfmt::skip]
pub fn hat(w: Vec3d) -> Mat3d {
    Mat3d::new(
         0.0,  -w.z,   w.y,
         w.z,   0.0,  -w.x,
        -w.y,   w.x,   0.0,
    )
}

/// Squared hat operator (`hat_2(w) == hat(w) * hat(w)`).
/// Result is a symmetric matrix.
#[rustfmt::skip]
pub fn hat_2(w: Vec3d) -> Mat3d {
    let w11 = w.x * w.x;
    let w12 = w.x * w.y;
    let w13 = w.x * w.z;
    let w22 = w.y * w.y;
    let w23 = w.y * w.z;
    let w33 = w.z * w.z;
    Mat3d::new(
        -w22 - w33,     w12,           w13,
         w12,          -w11 - w33,     w23,
         w13,           w23,          -w11 - w22,
    )
}

/// Vee operator. Inverse of hat operator.
/// Warning! does not check that the given matrix is skew-symmetric.
pub fn vee(mat: Mat3d) -> Vec3d {
    Vec3d::new(mat.m32, mat.m13, mat.m21)
}

/// Compute the exponential map from Lie algebra so3 to Lie group SO3.
pub fn exp(w: Vec3d) -> UnitQuaternion<f64> {
    let theta_2 = w.norm_squared();
    let (real_factor, imag_factor);
    if theta_2 < EPSILON_TAYLOR_SERIES_2 {
        real_factor = 1.0 - _1_8 * theta_2;
        imag_factor = 0.5 - _1_48 * theta_2;
    } else {
        let theta = theta_2.sqrt();
        let half_theta = 0.5 * theta;
        real_factor = half_theta.cos();
        imag_factor = half_theta.sin() / theta;
    }
    UnitQuaternion::from_quaternion(Quaternion::from_parts(real_factor, imag_factor * w))
}

/// Rotation matrix of the exponential map.
pub fn exp_matrix(w: Vec3d) -> Mat3d {
    exp(w).to_rotation_matrix().into_inner()
}

/// Compute the logarithm map from the Lie group SO3 to the Lie algebra so3.
/// Inverse of the exponential map.
pub fn log(rotation: UnitQuaternion<f64>) -> Vec3d {
    let imag_vector = rotation.vector();
    let imag_norm_2 = imag_vector.norm_squared();
    let real_factor = rotation.scalar();
    if imag_norm_2 < EPSILON_TAYLOR_SERIES_2 {
        let theta_by_imag_norm = 2.0 / real_factor; // TAYLOR
        theta_by_imag_norm * imag_vector
    } else if real_factor.abs() < EPSILON_TAYLOR_SERIES {
        let imag_norm = imag_norm_2.sqrt();
        let alpha = real_factor.abs() / imag_norm;
        let theta = real_factor.signum() * (PI - 2.0 * alpha); // TAYLOR
        (theta / imag_norm) * imag_vector
    } else {
        let imag_norm = imag_norm_2.sqrt();
        let theta = 2.0 * (imag_norm / real_factor).atan();
        (theta / imag_norm) * imag_vector
    }
}

/// Logarithm of a rotation matrix.
pub fn log_matrix(mat: &Mat3d) -> Vec3d {
    let rot = nalgebra::Rotation3::from_matrix(mat);
    log(UnitQuaternion::from_rotation_matrix(&rot))
}

/// Right Jacobian Jr of SO(3):
///
/// ```text
/// Jr(w) = I - (1 - cos t)/t^2 [w]x + (t - sin t)/t^3 [w]x^2,  t = |w|
/// ```
pub fn right_jacobian(w: Vec3d) -> Mat3d {
    let theta_2 = w.norm_squared();
    if theta_2 < EPSILON_TAYLOR_SERIES_2 {
        return Mat3d::identity() - 0.5 * hat(w);
    }
    let theta = theta_2.sqrt();
    let coef_hat = (1.0 - theta.cos()) / theta_2;
    let coef_hat_2 = (theta - theta.sin()) / (theta_2 * theta);
    Mat3d::identity() - coef_hat * hat(w) + coef_hat_2 * hat_2(w)
}

/// Inverse of the right Jacobian.
pub fn right_jacobian_inv(w: Vec3d) -> Mat3d {
    let theta_2 = w.norm_squared();
    if theta_2 < EPSILON_TAYLOR_SERIES_2 {
        return Mat3d::identity() + 0.5 * hat(w) + hat_2(w) / 12.0;
    }
    let theta = theta_2.sqrt();
    let coef = 1.0 / theta_2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Mat3d::identity() + 0.5 * hat(w) + coef * hat_2(w)
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use quickcheck::TestResult;

    const EPSILON_ROUNDTRIP_APPROX: f64 = 1e-9;

    #[test]
    fn exp_log_round_trip() {
        let w = Vec3d::zeros();
        assert_eq!(w, log(exp(w)));
    }

    // PROPERTY TESTS ################################################

    #[quickcheck_macros::quickcheck]
    fn hat_vee_roundtrip(x: f64, y: f64, z: f64) -> TestResult {
        if ![x, y, z].iter().all(|v| v.is_finite()) {
            return TestResult::discard();
        }
        let element = Vec3d::new(x, y, z);
        TestResult::from_bool(element == vee(hat(element)))
    }

    #[quickcheck_macros::quickcheck]
    fn hat_2_ok(x: f64, y: f64, z: f64) -> TestResult {
        if ![x, y, z].iter().all(|v| v.is_finite() && v.abs() < 1e50) {
            return TestResult::discard();
        }
        let element = Vec3d::new(x, y, z);
        let diff = hat_2(element) - hat(element) * hat(element);
        TestResult::from_bool(diff.norm() <= 1e-9 * (1.0 + element.norm_squared()))
    }

    #[quickcheck_macros::quickcheck]
    fn log_exp_round_trip(roll: f64, pitch: f64, yaw: f64) -> TestResult {
        if ![roll, pitch, yaw].iter().all(|v| v.is_finite()) {
            return TestResult::discard();
        }
        let rotation = UnitQuaternion::from_euler_angles(roll, pitch, yaw);
        TestResult::from_bool(approx::relative_eq!(
            rotation,
            exp(log(rotation)),
            epsilon = EPSILON_ROUNDTRIP_APPROX
        ))
    }

    #[test]
    fn right_jacobian_identity_at_zero() {
        assert_eq!(right_jacobian(Vec3d::zeros()), Mat3d::identity());
    }

    #[test]
    fn right_jacobian_inverse_consistent() {
        let w = Vec3d::new(0.3, -0.2, 0.5);
        let prod = right_jacobian(w) * right_jacobian_inv(w);
        assert!((prod - Mat3d::identity()).norm() < 1e-12);
    }

    #[test]
    fn right_jacobian_first_order() {
        // Exp(w + dw) ~ Exp(w) * Exp(Jr(w) dw)
        let w = Vec3d::new(0.4, 0.1, -0.3);
        let dw = Vec3d::new(1e-6, -2e-6, 1.5e-6);
        let lhs = exp_matrix(w + dw);
        let rhs = exp_matrix(w) * exp_matrix(right_jacobian(w) * dw);
        assert!((lhs - rhs).norm() < 1e-11);
    }
}
