// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The whitened 15-D inertial residual between two pose nodes, with its
//! Jacobian blocks with respect to both poses and both speed-and-bias
//! states.

use crate::imu::Preintegration;
use crate::math::so3;
use crate::misc::type_aliases::{
    Iso3, Mat3d, Mat15d, Mat15x6d, Mat15x9d, SpeedAndBias, Vec3d, Vec15d,
};

/// Residual and Jacobian blocks of one inertial constraint.
pub struct ImuResidual {
    /// Whitened 15-D error: position, rotation, velocity, gyro bias,
    /// accelerometer bias.
    pub res: Vec15d,
    pub j_xi_0: Mat15x6d,
    pub j_sb_0: Mat15x9d,
    pub j_xi_1: Mat15x6d,
    pub j_sb_1: Mat15x9d,
}

/// Evaluate the inertial residual between the two nodes.
///
/// `t_sw_0`/`t_sw_1` are world-to-sensor poses of the older and newer
/// node, `gravity_w` the gravity vector in the world frame, `delta_t` the
/// window length. The pre-integration increments are corrected to first
/// order for the drift of the newer node's biases away from the
/// linearization point. Everything is whitened by `weight` times the
/// square-root information.
pub fn evaluate(
    preint: &Preintegration,
    t_sw_0: &Iso3,
    t_sw_1: &Iso3,
    sb_0: &SpeedAndBias,
    sb_1: &SpeedAndBias,
    gravity_w: Vec3d,
    delta_t: f64,
    weight: f64,
) -> ImuResidual {
    let delta_b = sb_1 - preint.sb_ref;
    let db_g = delta_b.fixed_rows::<3>(3).into_owned();
    let db_a = delta_b.fixed_rows::<3>(6).into_owned();

    let t_ws_0 = t_sw_0.inverse();
    let t_ws_1 = t_sw_1.inverse();
    let t_s0 = t_ws_0.translation.vector;
    let t_s1 = t_ws_1.translation.vector;
    let c_ws_0 = t_ws_0.rotation.to_rotation_matrix().into_inner();
    let c_s0_w = c_ws_0.transpose();
    let c_ws_1 = t_ws_1.rotation.to_rotation_matrix().into_inner();
    let c_s1_w = c_ws_1.transpose();

    let v0 = sb_0.fixed_rows::<3>(0).into_owned();
    let v1 = sb_1.fixed_rows::<3>(0).into_owned();

    let mut error = Vec15d::zeros();
    let p_pred = t_s1 - t_s0 - v0 * delta_t - 0.5 * gravity_w * delta_t * delta_t;
    error
        .fixed_rows_mut::<3>(0)
        .copy_from(&(c_s0_w * p_pred - (preint.delta_p + preint.d_p_d_bg * db_g + preint.d_p_d_ba * db_a)));
    let r_corr = preint.delta_r * so3::exp_matrix(preint.d_r_d_bg * db_g);
    let e_r = so3::log_matrix(&(r_corr.transpose() * c_s0_w * c_ws_1));
    error.fixed_rows_mut::<3>(3).copy_from(&e_r);
    let v_pred = v1 - v0 - gravity_w * delta_t;
    error
        .fixed_rows_mut::<3>(6)
        .copy_from(&(c_s0_w * v_pred - (preint.delta_v + preint.d_v_d_bg * db_g + preint.d_v_d_ba * db_a)));
    error
        .fixed_rows_mut::<6>(9)
        .copy_from(&(sb_1.fixed_rows::<6>(3) - sb_0.fixed_rows::<6>(3)));

    // Jacobian w.r.t. the older node.
    let mut f0 = Mat15d::zeros();
    f0.fixed_view_mut::<3, 3>(0, 0).copy_from(&c_s0_w);
    f0.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&(-c_s0_w * so3::hat(p_pred)));
    f0.fixed_view_mut::<3, 3>(0, 6)
        .copy_from(&(-c_s0_w * delta_t));
    f0.fixed_view_mut::<3, 3>(0, 9).copy_from(&(-preint.d_p_d_bg));
    f0.fixed_view_mut::<3, 3>(0, 12)
        .copy_from(&(-preint.d_p_d_ba));
    f0.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(so3::right_jacobian_inv(e_r) * c_s1_w));
    // J_l(phi) = J_r(-phi)
    f0.fixed_view_mut::<3, 3>(3, 9).copy_from(
        &(-so3::right_jacobian_inv(-e_r)
            * so3::right_jacobian(preint.d_r_d_bg * db_g)
            * preint.d_r_d_bg),
    );
    f0.fixed_view_mut::<3, 3>(6, 3)
        .copy_from(&(-c_s0_w * so3::hat(v_pred)));
    f0.fixed_view_mut::<3, 3>(6, 6).copy_from(&c_s0_w);
    f0.fixed_view_mut::<3, 3>(6, 9).copy_from(&(-preint.d_v_d_bg));
    f0.fixed_view_mut::<3, 3>(6, 12)
        .copy_from(&(-preint.d_v_d_ba));
    f0.fixed_view_mut::<3, 3>(9, 9).copy_from(&Mat3d::identity());
    f0.fixed_view_mut::<3, 3>(12, 12)
        .copy_from(&Mat3d::identity());

    // Jacobian w.r.t. the newer node.
    let mut f1 = Mat15d::zeros();
    f1.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-c_s0_w));
    f1.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(-so3::right_jacobian_inv(e_r) * c_s1_w));
    f1.fixed_view_mut::<3, 3>(6, 6).copy_from(&c_s0_w);
    f1.fixed_view_mut::<3, 3>(9, 9)
        .copy_from(&(-Mat3d::identity()));
    f1.fixed_view_mut::<3, 3>(12, 12)
        .copy_from(&(-Mat3d::identity()));

    let whitening = weight * preint.sqrt_information;
    ImuResidual {
        res: whitening * error,
        j_xi_0: whitening * f0.fixed_view::<15, 6>(0, 0).into_owned(),
        j_sb_0: whitening * f0.fixed_view::<15, 9>(0, 6).into_owned(),
        j_xi_1: whitening * f1.fixed_view::<15, 6>(0, 0).into_owned(),
        j_sb_1: whitening * f1.fixed_view::<15, 9>(0, 6).into_owned(),
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::imu::{ImuMeasurement, ImuParameters};

    fn still_preint() -> Preintegration {
        let mut preint = Preintegration::new();
        let data: Vec<ImuMeasurement> = (0..201)
            .map(|i| ImuMeasurement {
                timestamp: i as f64 / 200.0,
                gyro: Vec3d::zeros(),
                acc: Vec3d::zeros(),
            })
            .collect();
        preint
            .redo(
                &data,
                0.0,
                1.0,
                SpeedAndBias::zeros(),
                &ImuParameters::default(),
            )
            .unwrap();
        preint
    }

    #[test]
    fn zero_motion_zero_gravity_has_zero_residual() {
        let preint = still_preint();
        let out = evaluate(
            &preint,
            &Iso3::identity(),
            &Iso3::identity(),
            &SpeedAndBias::zeros(),
            &SpeedAndBias::zeros(),
            Vec3d::zeros(),
            1.0,
            1.0,
        );
        assert!(out.res.norm() < 1e-6, "residual norm {}", out.res.norm());
    }

    #[test]
    fn residual_scales_linearly_with_weight() {
        let preint = still_preint();
        let t1 = Iso3::translation(0.2, -0.1, 0.3);
        let mut sb_1 = SpeedAndBias::zeros();
        sb_1[0] = 0.5;
        let gravity = Vec3d::new(0.0, -9.81, 0.0);
        let r1 = evaluate(
            &preint,
            &Iso3::identity(),
            &t1,
            &SpeedAndBias::zeros(),
            &sb_1,
            gravity,
            1.0,
            1.0,
        );
        let r3 = evaluate(
            &preint,
            &Iso3::identity(),
            &t1,
            &SpeedAndBias::zeros(),
            &sb_1,
            gravity,
            1.0,
            3.0,
        );
        assert!((r3.res - 3.0 * r1.res).norm() < 1e-9 * r1.res.norm().max(1.0));
        assert!((r3.j_xi_1 - 3.0 * r1.j_xi_1).norm() < 1e-9 * r1.j_xi_1.norm().max(1.0));
    }

    #[test]
    fn gravity_enters_position_and_velocity_rows() {
        let preint = still_preint();
        let gravity = Vec3d::new(0.0, -9.81, 0.0);
        let out = evaluate(
            &preint,
            &Iso3::identity(),
            &Iso3::identity(),
            &SpeedAndBias::zeros(),
            &SpeedAndBias::zeros(),
            gravity,
            1.0,
            1.0,
        );
        // Unmodelled gravity shows up as a non-zero whitened error.
        assert!(out.res.norm() > 1.0);
    }
}
