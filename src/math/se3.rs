// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Lie algebra/group functions for 3D rigid body motion.
//!
//! Interesting reads:
//! - Sophus c++ library: <https://github.com/strasdat/Sophus>
//! - Ethan Eade course on Lie Groups for 2D and 3D transformations:
//!     - details: <http://ethaneade.com/lie.pdf>
//!     - summary: <http://ethaneade.com/lie_groups.pdf>

use nalgebra::{Quaternion, Translation3, UnitQuaternion};
use std::f64::consts::PI;

use crate::math::so3;
use crate::misc::type_aliases::{Iso3, Mat3d, Mat4d, Vec3d, Vec6d};

const EPSILON_TAYLOR_SERIES: f64 = 1e-6;
const EPSILON_TAYLOR_SERIES_2: f64 = EPSILON_TAYLOR_SERIES * EPSILON_TAYLOR_SERIES;
const _1_6: f64 = 1.0 / 6.0;
const _1_8: f64 = 0.125;
const _1_12: f64 = 1.0 / 12.0;
const _1_15: f64 = 1.0 / 15.0;
const _1_24: f64 = 1.0 / 24.0;
const _1_48: f64 = 1.0 / 48.0;
const _1_120: f64 = 1.0 / 120.0;

/// Parameterization of a twist (element of se3): linear velocity first.
pub type Twist = Vec6d;

/// Retrieve the linear velocity part of the twist parameterization.
pub fn linear_velocity(xi: Twist) -> Vec3d {
    Vec3d::new(xi[0], xi[1], xi[2])
}

/// Retrieve the angular velocity part of the twist parameterization.
pub fn angular_velocity(xi: Twist) -> Vec3d {
    Vec3d::new(xi[3], xi[4], xi[5])
}

/// Hat operator.
/// Goes from se3 parameters to se3 element (4x4 matrix).
#[rustfmt::skip]
pub fn hat(xi: Twist) -> Mat4d {
    let w1 = xi[3];
    let w2 = xi[4];
    let w3 = xi[5];
    Mat4d::new(
         0.0,  -w3,    w2,   xi[0],
         w3,    0.0,  -w1,   xi[1],
        -w2,    w1,    0.0,  xi[2],
         0.0,   0.0,   0.0,  0.0,
    )
}

/// Vee operator. Inverse of hat operator.
/// Warning! does not check that the given top left 3x3 sub-matrix is skew-symmetric.
pub fn vee(mat: Mat4d) -> Twist {
    Vec6d::new(mat.m14, mat.m24, mat.m34, mat.m32, mat.m13, mat.m21)
}

/// Compute the exponential map from Lie algebra se3 to Lie group SE3.
pub fn exp(xi: Twist) -> Iso3 {
    let xi_v = linear_velocity(xi);
    let xi_w = angular_velocity(xi);
    let theta_2 = xi_w.norm_squared();
    let (omega, omega_2) = (so3::hat(xi_w), so3::hat_2(xi_w));
    let (real_factor, imag_factor, coef_omega, coef_omega_2);
    if theta_2 < EPSILON_TAYLOR_SERIES_2 {
        real_factor = 1.0 - _1_8 * theta_2; // TAYLOR
        imag_factor = 0.5 - _1_48 * theta_2; // TAYLOR
        coef_omega = 0.5 - _1_24 * theta_2; // TAYLOR
        coef_omega_2 = _1_6 - _1_120 * theta_2; // TAYLOR
    } else {
        let theta = theta_2.sqrt();
        let half_theta = 0.5 * theta;
        real_factor = half_theta.cos();
        imag_factor = half_theta.sin() / theta;
        coef_omega = (1.0 - theta.cos()) / theta_2;
        coef_omega_2 = (theta - theta.sin()) / (theta * theta_2);
    }
    let v = Mat3d::identity() + coef_omega * omega + coef_omega_2 * omega_2;
    let rotation =
        UnitQuaternion::from_quaternion(Quaternion::from_parts(real_factor, imag_factor * xi_w));
    Iso3::from_parts(Translation3::from(v * xi_v), rotation)
}

/// Compute the logarithm map from the Lie group SE3 to the Lie algebra se3.
/// Inverse of the exponential map.
pub fn log(iso: Iso3) -> Twist {
    let imag_vector = iso.rotation.vector();
    let imag_norm_2 = imag_vector.norm_squared();
    let real_factor = iso.rotation.scalar();
    if imag_norm_2 < EPSILON_TAYLOR_SERIES_2 {
        let theta_by_imag_norm = 2.0 / real_factor; // TAYLOR
        let w = theta_by_imag_norm * imag_vector;
        let (omega, omega_2) = (so3::hat(w), so3::hat_2(w));
        let x_2 = imag_norm_2 / (real_factor * real_factor);
        let coef_omega_2 = _1_12 * (1.0 + _1_15 * x_2); // TAYLOR
        let v_inv = Mat3d::identity() - 0.5 * omega + coef_omega_2 * omega_2;
        let xi_v = v_inv * iso.translation.vector;
        Vec6d::new(xi_v[0], xi_v[1], xi_v[2], w[0], w[1], w[2])
    } else {
        let imag_norm = imag_norm_2.sqrt();
        let theta = if real_factor.abs() < EPSILON_TAYLOR_SERIES {
            let alpha = real_factor.abs() / imag_norm;
            real_factor.signum() * (PI - 2.0 * alpha) // TAYLOR
        } else {
            2.0 * (imag_norm / real_factor).atan()
        };
        let theta_2 = theta * theta;
        let w = (theta / imag_norm) * imag_vector;
        let (omega, omega_2) = (so3::hat(w), so3::hat_2(w));
        let coef_omega_2 = (1.0 - 0.5 * theta * real_factor / imag_norm) / theta_2;
        let v_inv = Mat3d::identity() - 0.5 * omega + coef_omega_2 * omega_2;
        let xi_v = v_inv * iso.translation.vector;
        Vec6d::new(xi_v[0], xi_v[1], xi_v[2], w[0], w[1], w[2])
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use quickcheck::TestResult;

    const EPSILON_ROUNDTRIP_APPROX: f64 = 1e-9;

    #[test]
    fn exp_log_round_trip() {
        let xi = Vec6d::zeros();
        assert_eq!(xi, log(exp(xi)));
    }

    // PROPERTY TESTS ################################################

    #[quickcheck_macros::quickcheck]
    fn hat_vee_roundtrip(v1: f64, v2: f64, v3: f64, w1: f64, w2: f64, w3: f64) -> TestResult {
        if ![v1, v2, v3, w1, w2, w3].iter().all(|v| v.is_finite()) {
            return TestResult::discard();
        }
        let xi = Vec6d::new(v1, v2, v3, w1, w2, w3);
        TestResult::from_bool(xi == vee(hat(xi)))
    }

    #[quickcheck_macros::quickcheck]
    fn log_exp_round_trip(t1: f64, t2: f64, t3: f64, a1: f64, a2: f64, a3: f64) -> TestResult {
        if ![t1, t2, t3, a1, a2, a3].iter().all(|v| v.is_finite() && v.abs() < 1e3) {
            return TestResult::discard();
        }
        let rigid_motion = gen_rigid_motion(t1, t2, t3, a1, a2, a3);
        TestResult::from_bool(approx::relative_eq!(
            rigid_motion,
            exp(log(rigid_motion)),
            epsilon = EPSILON_ROUNDTRIP_APPROX * (1.0 + rigid_motion.translation.vector.norm())
        ))
    }

    // GENERATORS ####################################################

    fn gen_rigid_motion(t1: f64, t2: f64, t3: f64, a1: f64, a2: f64, a3: f64) -> Iso3 {
        let translation = Translation3::from(Vec3d::new(t1, t2, t3));
        let rotation = UnitQuaternion::from_euler_angles(a1, a2, a3);
        Iso3::from_parts(translation, rotation)
    }
}
