// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Time-domain accumulation of inertial samples into relative motion
//! increments with bias Jacobians and covariance, linearized about a
//! reference speed-and-bias.

use log::warn;
use nalgebra::{Cholesky, SMatrix};

use crate::imu::{ImuError, ImuMeasurement, ImuParameters};
use crate::math::so3;
use crate::misc::type_aliases::{Mat3d, Mat15d, SpeedAndBias, Vec3d};

type Mat15x6 = SMatrix<f64, 15, 6>;
type Mat6d = SMatrix<f64, 6, 6>;

/// Pre-integrated inertial motion between two frame timestamps.
pub struct Preintegration {
    /// Rotation increment.
    pub delta_r: Mat3d,
    /// Velocity increment.
    pub delta_v: Vec3d,
    /// Position increment.
    pub delta_p: Vec3d,
    pub d_r_d_bg: Mat3d,
    pub d_v_d_bg: Mat3d,
    pub d_v_d_ba: Mat3d,
    pub d_p_d_bg: Mat3d,
    pub d_p_d_ba: Mat3d,
    /// Covariance of the 15-D increment state.
    pub sigma: Mat15d,
    /// Upper Cholesky factor of the information matrix.
    pub sqrt_information: Mat15d,
    /// Speed-and-bias the integration was linearized about.
    pub sb_ref: SpeedAndBias,
}

impl Preintegration {
    pub fn new() -> Self {
        Preintegration {
            delta_r: Mat3d::identity(),
            delta_v: Vec3d::zeros(),
            delta_p: Vec3d::zeros(),
            d_r_d_bg: Mat3d::zeros(),
            d_v_d_bg: Mat3d::zeros(),
            d_v_d_ba: Mat3d::zeros(),
            d_p_d_bg: Mat3d::zeros(),
            d_p_d_ba: Mat3d::zeros(),
            sigma: Mat15d::zeros(),
            sqrt_information: Mat15d::identity(),
            sb_ref: SpeedAndBias::zeros(),
        }
    }

    /// Walk the sample sequence over `[t0, t1]` and rebuild all
    /// increments, bias Jacobians, the covariance and its square-root
    /// information. Returns the number of integrated steps.
    ///
    /// Samples straddling the window endpoints are linearly interpolated;
    /// non-positive intervals are skipped. A step whose rates exceed the
    /// saturation thresholds integrates with its noise inflated by 100.
    pub fn redo(
        &mut self,
        data: &[ImuMeasurement],
        t0: f64,
        t1: f64,
        speed_and_bias: SpeedAndBias,
        params: &ImuParameters,
    ) -> Result<usize, ImuError> {
        if data.is_empty() || data[0].timestamp > t0 || data[data.len() - 1].timestamp < t1 {
            return Err(ImuError::WindowNotCovered);
        }

        self.delta_r = Mat3d::identity();
        self.delta_v = Vec3d::zeros();
        self.delta_p = Vec3d::zeros();
        self.d_r_d_bg = Mat3d::zeros();
        self.d_v_d_bg = Mat3d::zeros();
        self.d_v_d_ba = Mat3d::zeros();
        self.d_p_d_bg = Mat3d::zeros();
        self.d_p_d_ba = Mat3d::zeros();
        self.sigma = Mat15d::zeros();

        let mut sigma_eta = Mat6d::zeros();
        for i in 0..3 {
            sigma_eta[(i, i)] = params.sigma_gw_c * params.sigma_gw_c;
            sigma_eta[(i + 3, i + 3)] = params.sigma_aw_c * params.sigma_aw_c;
        }

        let bg = speed_and_bias.fixed_rows::<3>(3).into_owned();
        let ba = speed_and_bias.fixed_rows::<3>(6).into_owned();

        let mut time = t0;
        let mut has_started = false;
        let mut count = 0usize;

        for i in 0..data.len() {
            let s0 = &data[i];
            let mut omega_0 = s0.gyro;
            let mut acc_0 = s0.acc;
            let (mut omega_1, mut acc_1, mut nexttime);
            if i + 1 == data.len() {
                nexttime = t1;
                omega_1 = omega_0;
                acc_1 = acc_0;
            } else {
                let s1 = &data[i + 1];
                nexttime = s1.timestamp;
                omega_1 = s1.gyro;
                acc_1 = s1.acc;
            }
            let mut dt = nexttime - time;

            if t1 < nexttime {
                let interval = nexttime - s0.timestamp;
                nexttime = t1;
                dt = nexttime - time;
                let r = dt / interval;
                omega_1 = (1.0 - r) * omega_0 + r * omega_1;
                acc_1 = (1.0 - r) * acc_0 + r * acc_1;
            }

            if dt <= 0.0 {
                continue;
            }

            if !has_started {
                has_started = true;
                let r = dt / (nexttime - s0.timestamp);
                omega_0 = r * omega_0 + (1.0 - r) * omega_1;
                acc_0 = r * acc_0 + (1.0 - r) * acc_1;
            }

            let mut sigma_eta_step = sigma_eta;
            if omega_0.amax() > params.g_max || omega_1.amax() > params.g_max {
                for j in 0..3 {
                    sigma_eta_step[(j, j)] *= 100.0 * 100.0;
                }
                warn!("gyr saturation");
            }
            if acc_0.amax() > params.a_max || acc_1.amax() > params.a_max {
                for j in 0..3 {
                    sigma_eta_step[(j + 3, j + 3)] *= 100.0 * 100.0;
                }
                warn!("acc saturation");
            }

            // Increment propagation about the reference biases.
            let omega_true = 0.5 * (omega_0 + omega_1) - bg;
            let acc_true = 0.5 * (acc_0 + acc_1) - ba;
            let delta_r_step = so3::exp_matrix(omega_true * dt);
            let delta_r_new = self.delta_r * delta_r_step;
            let delta_v_new = self.delta_v + self.delta_r * acc_true * dt;
            let delta_p_new =
                self.delta_p + self.delta_v * dt + 0.5 * self.delta_r * acc_true * dt * dt;

            // Bias-Jacobian propagation (order matters: the velocity and
            // position rows consume the freshly updated rotation row).
            self.d_r_d_bg += -delta_r_new * so3::right_jacobian(omega_true * dt) * dt;
            self.d_v_d_bg += -self.delta_r * so3::hat(omega_true) * self.d_r_d_bg * dt;
            self.d_v_d_ba += -self.delta_r * dt;
            self.d_p_d_bg += -1.5 * self.delta_r * so3::hat(omega_true) * self.d_r_d_bg * dt;
            self.d_p_d_ba += -1.5 * self.delta_r * dt * dt;

            // Covariance propagation, state order (p, R, v, bg, ba) to
            // match the residual ordering the information whitens.
            let mut a = Mat15d::identity();
            a.fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-1.5 * self.delta_r * so3::hat(acc_true) * dt * dt));
            a.fixed_view_mut::<3, 3>(3, 3)
                .copy_from(&delta_r_step.transpose());
            a.fixed_view_mut::<3, 3>(6, 3)
                .copy_from(&(-self.delta_r * so3::hat(acc_true) * dt));

            let mut b = Mat15x6::zeros();
            b.fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(1.5 * self.delta_r * dt * dt));
            b.fixed_view_mut::<3, 3>(3, 0)
                .copy_from(&(so3::right_jacobian(omega_true * dt) * dt));
            b.fixed_view_mut::<3, 3>(6, 3).copy_from(&(self.delta_r * dt));
            b.fixed_view_mut::<3, 3>(9, 0)
                .copy_from(&(Mat3d::identity() * dt));
            b.fixed_view_mut::<3, 3>(12, 3)
                .copy_from(&(Mat3d::identity() * dt));

            self.sigma = a * self.sigma * a.transpose() + b * sigma_eta_step * b.transpose();

            self.delta_r = delta_r_new;
            self.delta_v = delta_v_new;
            self.delta_p = delta_p_new;
            time = nexttime;
            count += 1;

            if nexttime == t1 {
                break;
            }
        }

        self.sb_ref = speed_and_bias;

        // Symmetrize, invert, symmetrize again, then factor.
        self.sigma = 0.5 * (self.sigma + self.sigma.transpose());
        let mut information = self
            .sigma
            .try_inverse()
            .ok_or(ImuError::DegenerateCovariance)?;
        information = 0.5 * (information + information.transpose());
        let chol = Cholesky::new(information).ok_or(ImuError::DegenerateCovariance)?;
        self.sqrt_information = chol.l().transpose();

        Ok(count)
    }
}

impl Default for Preintegration {
    fn default() -> Self {
        Self::new()
    }
}

// TESTS #############################################################
