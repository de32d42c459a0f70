// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Tightly-coupled inertial extension of the coarse tracker.
//!
//! After the purely visual coarse-to-fine refinement, a fixed number of
//! joint iterations combine the level-0 direct system with the whitened
//! inertial residual, optionally anchored by the marginal prior of the
//! previous call, and Schur-complement the non-retained variables into
//! the prior for the next call.

use log::info;
use nalgebra::{SMatrix, SVector};

use crate::core::frame::{AffLight, FrameData};
use crate::core::track::coarse::{
    CoarseTracker, LastFrameNode, ResEval, TrackingDiagnostics, TrackingError, TrackingGuess,
    TrackingResult,
};
use crate::imu::{self, ImuMeasurement, ImuParameters};
use crate::math::se3;
use crate::math::simd::F32x4;
use crate::misc::type_aliases::{Float, Iso3, Mat10d, SpeedAndBias, Vec10d, Vec3d};

const JOINT_ITERATIONS: usize = 6;
const LAMBDA_EXTRAPOLATION_LIMIT: f64 = 0.001;

type Mat19 = SMatrix<f64, 19, 19>;
type Vec19 = SVector<f64, 19>;

/// Outcome of an inertial tracking call.
pub struct InertialTrackingResult {
    pub tracking: TrackingResult,
    /// Updated speed-and-bias of the older node (reference keyframe or
    /// previously tracked frame); the caller writes it back.
    pub speed_and_bias_0: SpeedAndBias,
    /// Updated speed-and-bias of the new frame.
    pub speed_and_bias_1: SpeedAndBias,
    /// False when the inertial window was insufficient and the call fell
    /// back to visual-only refinement.
    pub used_inertial: bool,
}

impl CoarseTracker {
    /// Track a new stereo pair with tightly-coupled inertial measurements
    /// covering `[t_ref_or_last, t_new]`.
    pub fn track_newest_stereo_inertial(
        &mut self,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        imu_data: &[ImuMeasurement],
        imu_params: &ImuParameters,
        guess: TrackingGuess,
        coarsest_lvl: usize,
        min_res_for_abort: [Float; crate::core::camera::MAX_PYR_LEVELS],
    ) -> Result<InertialTrackingResult, TrackingError> {
        let mut pose = guess.pose;
        let mut aff = guess.aff_g2l;
        let mut aff_r = guess.aff_g2l_r;
        let mut diagnostics = TrackingDiagnostics::default();
        self.refine_stereo_pyramid(
            new_frame,
            new_frame_right,
            &mut pose,
            &mut aff,
            &mut aff_r,
            coarsest_lvl,
            min_res_for_abort,
            &mut diagnostics,
        )?;

        // Joint direct + inertial refinement at level 0.
        self.redo_preintegration = true;
        let reference = self.reference.expect("tracking reference not set");
        let (t0, mut sb_0) = match self.last_frame {
            Some(node) => (node.timestamp, node.speed_and_bias),
            None => (reference.timestamp, reference.speed_and_bias),
        };
        let t1 = new_frame.timestamp;
        let delta_t = t1 - t0;
        let mut sb_1 = new_frame.speed_and_bias;

        let mut t_sw_0 = match self.last_frame {
            Some(_) => guess.pose,
            None => Iso3::identity(),
        };
        let mut t_sw_1 = pose;

        let gravity_w = reference.world_to_cam.rotation.to_rotation_matrix().into_inner()
            * Vec3d::new(0.0, -imu_params.g, 0.0);
        let weight = self.settings.imu_residual_weight;
        let two_nodes = self.last_frame.is_some();
        let mut used_inertial = true;
        let mut joint28: Option<(SMatrix<f64, 28, 28>, SVector<f64, 28>)> = None;
        let mut joint38: Option<(SMatrix<f64, 38, 38>, SVector<f64, 38>)> = None;

        'joint: for _iteration in 0..JOINT_ITERATIONS {
            let lambda = 0.01;

            let res_old = self.calc_res_stereo(
                0,
                new_frame,
                new_frame_right,
                &t_sw_1,
                aff,
                aff_r,
                self.settings.coarse_cutoff_th,
            );
            let (h_d, b_d) =
                self.calc_gs_stereo(0, new_frame, new_frame_right, aff, aff_r);

            // Refresh the pre-integration when forced or when the gyro
            // bias drifted too far from the linearization point.
            let db_g = (sb_1 - self.preint.sb_ref).fixed_rows::<3>(3).norm();
            if self.redo_preintegration || db_g * delta_t > 1e-4 {
                match self.preint.redo(imu_data, t0, t1, sb_0, imu_params) {
                    Ok(_) => self.redo_preintegration = false,
                    Err(err) => {
                        info!("inertial residual disabled: {err}");
                        used_inertial = false;
                        break 'joint;
                    }
                }
            }

            let imu_res = imu::evaluate(
                &self.preint,
                &t_sw_0,
                &t_sw_1,
                &sb_0,
                &sb_1,
                gravity_w,
                delta_t,
                weight,
            );

            if !two_nodes {
                // 28-D system: (pose + affine) of the new node, then the
                // two speed-and-bias blocks.
                let mut h = SMatrix::<f64, 28, 28>::zeros();
                let mut b = SVector::<f64, 28>::zeros();

                h.fixed_view_mut::<10, 10>(0, 0).copy_from(&h_d);
                b.fixed_rows_mut::<10>(0).copy_from(&b_d);

                let jx1 = &imu_res.j_xi_1;
                let js0 = &imu_res.j_sb_0;
                let js1 = &imu_res.j_sb_1;

                add_block(&mut h, 0, 0, &(jx1.transpose() * jx1));
                add_block(&mut h, 0, 10, &(jx1.transpose() * js0));
                add_block(&mut h, 0, 19, &(jx1.transpose() * js1));
                add_block(&mut h, 10, 10, &(js0.transpose() * js0));
                add_block(&mut h, 10, 19, &(js0.transpose() * js1));
                add_block(&mut h, 19, 19, &(js1.transpose() * js1));
                mirror_block::<28, 6, 9>(&mut h, 0, 10);
                mirror_block::<28, 6, 9>(&mut h, 0, 19);
                mirror_block::<28, 9, 9>(&mut h, 10, 19);

                add_rows(&mut b, 0, &(jx1.transpose() * imu_res.res));
                add_rows(&mut b, 10, &(js0.transpose() * imu_res.res));
                add_rows(&mut b, 19, &(js1.transpose() * imu_res.res));

                for i in 0..28 {
                    h[(i, i)] *= 1.0 + lambda;
                }
                joint28 = Some((h, b));
                let inc = h
                    .cholesky()
                    .map(|c| c.solve(&-b))
                    .unwrap_or_else(SVector::zeros);
                let inc = inc * extrapolation(lambda);

                let inc10 = self.scale_step10(inc.fixed_rows::<10>(0).into_owned());
                let t_sw_1_new = se3::exp(inc10.fixed_rows::<6>(0).into_owned()) * t_sw_1;
                let aff_new = AffLight::new(
                    aff.a + inc10[6] as Float,
                    aff.b + inc10[7] as Float,
                );
                let aff_r_new = AffLight::new(
                    aff_r.a + inc10[8] as Float,
                    aff_r.b + inc10[9] as Float,
                );

                let res_new = self.calc_res_stereo(
                    0,
                    new_frame,
                    new_frame_right,
                    &t_sw_1_new,
                    aff_new,
                    aff_r_new,
                    self.settings.coarse_cutoff_th,
                );
                if mean(&res_new) < mean(&res_old) {
                    aff = aff_new;
                    aff_r = aff_r_new;
                    t_sw_1 = t_sw_1_new;
                    sb_0 += inc.fixed_rows::<9>(10).into_owned();
                    sb_1 += inc.fixed_rows::<9>(19).into_owned();
                }
            } else {
                // 38-D system: older node (pose+affine, sb), then the new
                // node (pose+affine, sb); the prior anchors the older one.
                let mut h = SMatrix::<f64, 38, 38>::zeros();
                let mut b = SVector::<f64, 38>::zeros();

                h.fixed_view_mut::<10, 10>(19, 19).copy_from(&h_d);
                b.fixed_rows_mut::<10>(19).copy_from(&b_d);

                let jx0 = &imu_res.j_xi_0;
                let js0 = &imu_res.j_sb_0;
                let jx1 = &imu_res.j_xi_1;
                let js1 = &imu_res.j_sb_1;

                add_block(&mut h, 0, 0, &(jx0.transpose() * jx0));
                add_block(&mut h, 0, 10, &(jx0.transpose() * js0));
                add_block(&mut h, 0, 19, &(jx0.transpose() * jx1));
                add_block(&mut h, 0, 29, &(jx0.transpose() * js1));
                add_block(&mut h, 10, 10, &(js0.transpose() * js0));
                add_block(&mut h, 10, 19, &(js0.transpose() * jx1));
                add_block(&mut h, 10, 29, &(js0.transpose() * js1));
                add_block(&mut h, 19, 19, &(jx1.transpose() * jx1));
                add_block(&mut h, 19, 29, &(jx1.transpose() * js1));
                add_block(&mut h, 29, 29, &(js1.transpose() * js1));
                mirror_block::<38, 6, 9>(&mut h, 0, 10);
                mirror_block::<38, 6, 6>(&mut h, 0, 19);
                mirror_block::<38, 6, 9>(&mut h, 0, 29);
                mirror_block::<38, 9, 6>(&mut h, 10, 19);
                mirror_block::<38, 9, 9>(&mut h, 10, 29);
                mirror_block::<38, 6, 9>(&mut h, 19, 29);

                add_rows(&mut b, 0, &(jx0.transpose() * imu_res.res));
                add_rows(&mut b, 10, &(js0.transpose() * imu_res.res));
                add_rows(&mut b, 19, &(jx1.transpose() * imu_res.res));
                add_rows(&mut b, 29, &(js1.transpose() * imu_res.res));

                if let Some((h_m, b_m)) = self.marg_prior {
                    for r in 0..19 {
                        for c in 0..19 {
                            h[(r, c)] += h_m[(r, c)];
                        }
                        b[r] += b_m[r];
                    }
                }

                for i in 0..38 {
                    h[(i, i)] *= 1.0 + lambda;
                }
                joint38 = Some((h, b));
                let inc = h
                    .cholesky()
                    .map(|c| c.solve(&-b))
                    .unwrap_or_else(SVector::zeros);
                let inc = inc * extrapolation(lambda);

                let inc10_new = self.scale_step10(inc.fixed_rows::<10>(19).into_owned());
                let t_sw_1_new = se3::exp(inc10_new.fixed_rows::<6>(0).into_owned()) * t_sw_1;
                let aff_new = AffLight::new(
                    aff.a + inc10_new[6] as Float,
                    aff.b + inc10_new[7] as Float,
                );
                let aff_r_new = AffLight::new(
                    aff_r.a + inc10_new[8] as Float,
                    aff_r.b + inc10_new[9] as Float,
                );

                let inc10_old = self.scale_step10(inc.fixed_rows::<10>(0).into_owned());
                let t_sw_0_new = se3::exp(inc10_old.fixed_rows::<6>(0).into_owned()) * t_sw_0;

                let res_new = self.calc_res_stereo(
                    0,
                    new_frame,
                    new_frame_right,
                    &t_sw_1_new,
                    aff_new,
                    aff_r_new,
                    self.settings.coarse_cutoff_th,
                );
                if mean(&res_new) < mean(&res_old) {
                    aff = aff_new;
                    aff_r = aff_r_new;
                    t_sw_0 = t_sw_0_new;
                    t_sw_1 = t_sw_1_new;
                    sb_0 += inc.fixed_rows::<9>(10).into_owned();
                    sb_1 += inc.fixed_rows::<9>(29).into_owned();
                }
            }
        }

        if used_inertial {
            // Marginalize the non-retained variables of the last joint
            // system into the prior for the next call. In the one-node
            // case the retained order is (pose+affine, new
            // speed-and-bias); in the two-node case the new node is
            // already contiguous.
            if let Some((h, b)) = joint28 {
                let retained = ret_indices(&[0..10, 19..28]);
                if let Some(prior) = marginalize::<28>(&h, &b, &retained) {
                    self.marg_prior = Some(prior);
                }
            }
            if let Some((h, b)) = joint38 {
                let retained = ret_indices(&[19..38]);
                if let Some(prior) = marginalize::<38>(&h, &b, &retained) {
                    self.marg_prior = Some(prior);
                }
            }

            pose = t_sw_1;
            if self.last_frame.is_none() {
                if let Some(reference) = self.reference.as_mut() {
                    reference.speed_and_bias = sb_0;
                }
            }
            self.last_frame = Some(LastFrameNode {
                timestamp: t1,
                speed_and_bias: sb_1,
            });
        }

        self.validate_affine(&mut aff, new_frame.exposure)?;
        if self.settings.affine_opt_mode_a.is_fixed() {
            aff_r.a = 0.0;
        }
        if self.settings.affine_opt_mode_b.is_fixed() {
            aff_r.b = 0.0;
        }

        Ok(InertialTrackingResult {
            tracking: TrackingResult {
                pose,
                aff_g2l: aff,
                aff_g2l_r: aff_r,
                last_residuals: self.last_residuals,
                flow: self.last_flow_indicators,
                diagnostics,
            },
            speed_and_bias_0: sb_0,
            speed_and_bias_1: sb_1,
            used_inertial,
        })
    }

    fn scale_step10(&self, mut inc: Vec10d) -> Vec10d {
        let s = &self.settings.scales;
        for i in 0..3 {
            inc[i] *= f64::from(s.xi_rot);
            inc[i + 3] *= f64::from(s.xi_trans);
        }
        inc[6] *= f64::from(s.a);
        inc[7] *= f64::from(s.b);
        inc[8] *= f64::from(s.a);
        inc[9] *= f64::from(s.b);
        if !inc.iter().all(|v| v.is_finite()) {
            inc = Vec10d::zeros();
        }
        inc
    }

    /// Residual of the new frame at its current estimated state; exposed
    /// to the back-end.
    pub fn calculate_res(
        &mut self,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        ref_to_new: &Iso3,
        aff_g2l: AffLight,
        aff_g2l_r: AffLight,
    ) -> ResEval {
        let cutoff = self.settings.coarse_cutoff_th;
        self.calc_res_stereo(
            0,
            new_frame,
            new_frame_right,
            ref_to_new,
            aff_g2l,
            aff_g2l_r,
            cutoff,
        )
    }

    /// Direct 10-D system of the new frame at level 0; exposed to the
    /// back-end. The warp buffers must have been filled by
    /// [`Self::calculate_res`].
    pub fn calculate_h_and_b(
        &mut self,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        aff_g2l: AffLight,
        aff_g2l_r: AffLight,
    ) -> (Mat10d, Vec10d) {
        self.calc_gs_stereo(0, new_frame, new_frame_right, aff_g2l, aff_g2l_r)
    }

    /// Disparity-weighted 10-D system used by the back-end Schur
    /// complement over the coarse inverse depths. The warp buffers must
    /// have been filled by [`Self::calculate_res`].
    pub fn calculate_msc_and_bsc(
        &mut self,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        aff_g2l: AffLight,
        aff_g2l_r: AffLight,
    ) -> (Mat10d, Vec10d) {
        self.calc_msc_stereo(0, new_frame, new_frame_right, aff_g2l, aff_g2l_r)
    }

    /// Like the stereo Hessian assembly, with every Jacobian row scaled
    /// by the disparity derivative and the weights divided by the squared
    /// disparity-derivative norm.
    pub(crate) fn calc_msc_stereo(
        &mut self,
        lvl: usize,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        aff_g2l: AffLight,
        aff_g2l_r: AffLight,
    ) -> (Mat10d, Vec10d) {
        let reference = self.reference.expect("tracking reference not set");
        self.acc11.initialize();

        let fxl = F32x4::splat(self.cam.fx[lvl]);
        let fyl = F32x4::splat(self.cam.fy[lvl]);
        let b0 = F32x4::splat(reference.aff_g2l.b);
        let a = F32x4::splat(
            AffLight::from_to_exposure(
                reference.exposure,
                new_frame.exposure,
                reference.aff_g2l,
                aff_g2l,
            )[0],
        );
        let a_r = F32x4::splat(
            AffLight::from_to_exposure(
                reference.exposure,
                new_frame_right.exposure,
                reference.aff_g2l,
                aff_g2l_r,
            )[0],
        );
        let one = F32x4::splat(1.0);
        let minus_one = F32x4::splat(-1.0);
        let zero = F32x4::ZERO;

        let n = self.warp.n;
        debug_assert_eq!(n % 4, 0);
        for i in 0..n / 4 {
            let dx = self.warp.dx.lane(i) * fxl;
            let dy = self.warp.dy.lane(i) * fyl;
            let u = self.warp.u.lane(i);
            let v = self.warp.v.lane(i);
            let id = self.warp.idepth.lane(i);
            let dd = self.warp.dd.lane(i);
            let dd_r = self.warp.dd_r.lane(i);
            let dd2_inv = recip_or_zero(dd * dd + dd_r * dd_r);

            let rows = [
                dd * (id * dx),
                dd * (id * dy),
                dd * -(id * (u * dx + v * dy)),
                dd * -(u * v * dx + dy * (one + v * v)),
                dd * (u * v * dy + dx * (one + u * u)),
                dd * (u * dy - v * dx),
                dd * (a * (b0 - self.warp.ref_color.lane(i))),
                dd * minus_one,
                zero,
                zero,
                self.warp.residual.lane(i),
            ];
            self.acc11
                .update_weighted(&rows, self.warp.weight.lane(i) * dd2_inv);

            let dx_r = self.warp.idepth_r.lane(i) * self.warp.dx_r.lane(i) * fxl;
            let dy_r = self.warp.idepth_r.lane(i) * self.warp.dy_r.lane(i) * fyl;
            let rows_r = [
                dd_r * (id * dx_r),
                dd_r * (id * dy_r),
                dd_r * -(id * (u * dx_r + v * dy_r)),
                dd_r * -(u * v * dx_r + dy_r * (one + v * v)),
                dd_r * (u * v * dy_r + dx_r * (one + u * u)),
                dd_r * (u * dy_r - v * dx_r),
                zero,
                zero,
                dd_r * (a_r * (b0 - self.warp.ref_color.lane(i))),
                dd_r * minus_one,
                self.warp.residual_r.lane(i),
            ];
            self.acc11
                .update_weighted(&rows_r, self.warp.weight_r.lane(i) * dd2_inv);
        }

        let h11 = self.acc11.finish();
        let inv_n = 1.0 / n as f64;
        let mut h_out = Mat10d::zeros();
        let mut b_out = Vec10d::zeros();
        for r in 0..10 {
            for c in 0..10 {
                h_out[(r, c)] = f64::from(h11[(r, c)]) * inv_n;
            }
            b_out[r] = f64::from(h11[(r, 10)]) * inv_n;
        }

        let s = self.scale_vec10();
        for r in 0..10 {
            for c in 0..10 {
                h_out[(r, c)] *= s[r] * s[c];
            }
            b_out[r] *= s[r];
        }
        (h_out, b_out)
    }
}

#[inline]
fn mean(res: &ResEval) -> f64 {
    res.energy / res.num_terms as f64
}

#[inline]
fn extrapolation(lambda: f64) -> f64 {
    if lambda < LAMBDA_EXTRAPOLATION_LIMIT {
        (LAMBDA_EXTRAPOLATION_LIMIT / lambda).sqrt().sqrt()
    } else {
        1.0
    }
}

/// Per-lane reciprocal that maps empty (zero) lanes to zero instead of
/// infinity, so padded warp entries contribute nothing.
#[inline]
fn recip_or_zero(v: F32x4) -> F32x4 {
    let mut out = F32x4::ZERO;
    for lane in 0..4 {
        if v.0[lane] != 0.0 {
            out.0[lane] = 1.0 / v.0[lane];
        }
    }
    out
}

fn add_block<const N: usize, const R: usize, const C: usize>(
    h: &mut SMatrix<f64, N, N>,
    row: usize,
    col: usize,
    block: &SMatrix<f64, R, C>,
) {
    for r in 0..R {
        for c in 0..C {
            h[(row + r, col + c)] += block[(r, c)];
        }
    }
}

fn mirror_block<const N: usize, const R: usize, const C: usize>(
    h: &mut SMatrix<f64, N, N>,
    row: usize,
    col: usize,
) {
    for r in 0..R {
        for c in 0..C {
            h[(col + c, row + r)] = h[(row + r, col + c)];
        }
    }
}

fn add_rows<const N: usize, const R: usize>(
    b: &mut SVector<f64, N>,
    row: usize,
    rows: &SVector<f64, R>,
) {
    for r in 0..R {
        b[row + r] += rows[r];
    }
}

fn ret_indices(ranges: &[std::ops::Range<usize>]) -> [usize; 19] {
    let mut out = [0usize; 19];
    let mut k = 0;
    for range in ranges {
        for i in range.clone() {
            out[k] = i;
            k += 1;
        }
    }
    debug_assert_eq!(k, 19);
    out
}

/// Schur-complement the non-retained variables of the joint system into
/// a 19-D prior over the retained ones.
fn marginalize<const N: usize>(
    h: &SMatrix<f64, N, N>,
    b: &SVector<f64, N>,
    retained: &[usize; 19],
) -> Option<(Mat19, Vec19)> {
    let transient: Vec<usize> = (0..N).filter(|i| !retained.contains(i)).collect();
    let t = transient.len();

    let mut h_tt = nalgebra::DMatrix::<f64>::zeros(t, t);
    for (i, &ti) in transient.iter().enumerate() {
        for (j, &tj) in transient.iter().enumerate() {
            h_tt[(i, j)] = h[(ti, tj)];
        }
    }
    let h_tt_inv = h_tt.try_inverse()?;

    let mut h_rt = nalgebra::DMatrix::<f64>::zeros(19, t);
    for (i, &ri) in retained.iter().enumerate() {
        for (j, &tj) in transient.iter().enumerate() {
            h_rt[(i, j)] = h[(ri, tj)];
        }
    }
    let mut b_t = nalgebra::DVector::<f64>::zeros(t);
    for (j, &tj) in transient.iter().enumerate() {
        b_t[j] = b[tj];
    }

    let correction = &h_rt * &h_tt_inv;
    let mut h_m = Mat19::zeros();
    for (i, &ri) in retained.iter().enumerate() {
        for (j, &rj) in retained.iter().enumerate() {
            h_m[(i, j)] = h[(ri, rj)];
        }
    }
    let schur = &correction * h_rt.transpose();
    for i in 0..19 {
        for j in 0..19 {
            h_m[(i, j)] -= schur[(i, j)];
        }
    }

    let mut b_m = Vec19::zeros();
    let corr_b = correction * b_t;
    for (i, &ri) in retained.iter().enumerate() {
        b_m[i] = b[ri] - corr_b[i];
    }
    Some((h_m, b_m))
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn schur_complement_matches_dense_elimination() {
        // A small synthetic quadratic: marginalizing the transient block
        // must reproduce the textbook reduced system.
        let mut h = SMatrix::<f64, 28, 28>::zeros();
        for i in 0..28 {
            h[(i, i)] = 2.0 + i as f64 * 0.1;
        }
        for i in 0..27 {
            h[(i, i + 1)] = 0.3;
            h[(i + 1, i)] = 0.3;
        }
        let b = SVector::<f64, 28>::from_fn(|i, _| 0.5 - 0.01 * i as f64);

        let retained = ret_indices(&[0..10, 19..28]);
        let (h_m, b_m) = marginalize::<28>(&h, &b, &retained).unwrap();

        // Reference: eliminate x_t from H x = -b by substitution.
        let transient: Vec<usize> = (10..19).collect();
        let mut h_tt = nalgebra::DMatrix::<f64>::zeros(9, 9);
        for (i, &ti) in transient.iter().enumerate() {
            for (j, &tj) in transient.iter().enumerate() {
                h_tt[(i, j)] = h[(ti, tj)];
            }
        }
        let h_tt_inv = h_tt.try_inverse().unwrap();
        for (i, &ri) in retained.iter().enumerate() {
            for (j, &rj) in retained.iter().enumerate() {
                let mut expected = h[(ri, rj)];
                for (a, &ta) in transient.iter().enumerate() {
                    for (c, &tc) in transient.iter().enumerate() {
                        expected -= h[(ri, ta)] * h_tt_inv[(a, c)] * h[(tc, rj)];
                    }
                }
                assert!((h_m[(i, j)] - expected).abs() < 1e-10);
            }
        }
        // The reduced gradient follows the same elimination.
        for (i, &ri) in retained.iter().enumerate() {
            let mut expected = b[ri];
            for (a, &ta) in transient.iter().enumerate() {
                for (c, &tc) in transient.iter().enumerate() {
                    expected -= h[(ri, ta)] * h_tt_inv[(a, c)] * b[tc];
                }
            }
            assert!((b_m[i] - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn marginal_prior_is_symmetric() {
        let mut h = SMatrix::<f64, 38, 38>::zeros();
        for i in 0..38 {
            h[(i, i)] = 3.0;
        }
        for i in 0..37 {
            h[(i, i + 1)] = -0.2;
            h[(i + 1, i)] = -0.2;
        }
        let b = SVector::<f64, 38>::repeat(1.0);
        let retained = ret_indices(&[19..38]);
        let (h_m, _) = marginalize::<38>(&h, &b, &retained).unwrap();
        assert!((h_m - h_m.transpose()).norm() < 1e-12);
    }

    #[test]
    fn recip_or_zero_guards_padded_lanes() {
        let v = F32x4([4.0, 0.0, 2.0, 0.0]);
        let r = recip_or_zero(v);
        assert_eq!(r, F32x4([0.25, 0.0, 0.5, 0.0]));
    }

    use crate::config::{AffineOptMode, TrackerSettings};
    use crate::core::camera::Calibration;
    use crate::core::frame::{HostFrame, KeyframePoint, ResState};

    fn calib() -> Calibration {
        Calibration {
            fx: 80.0,
            fy: 80.0,
            cx: 31.5,
            cy: 23.5,
            width: 64,
            height: 48,
            baseline: 0.05,
        }
    }

    fn plane_image(calib: &Calibration, shift_x: Float, levels: usize) -> FrameData {
        let img: Vec<Float> = (0..calib.width * calib.height)
            .map(|i| {
                let x = ((i % calib.width) as Float - calib.cx) / calib.fx + shift_x;
                let y = ((i / calib.width) as Float - calib.cy) / calib.fy;
                120.0 + 40.0 * (8.0 * x).sin() + 30.0 * (7.0 * y).cos()
            })
            .collect();
        FrameData::from_image(&img, calib.width, calib.height, levels)
    }

    fn grid_points(calib: &Calibration) -> Vec<KeyframePoint> {
        let mut points = Vec::new();
        for y in (4..calib.height - 4).step_by(2) {
            for x in (4..calib.width - 4).step_by(2) {
                points.push(KeyframePoint {
                    u: x as Float,
                    v: y as Float,
                    idepth: 1.0,
                    hdi_f: 1e-3,
                    status: ResState::In,
                    target_id: 0,
                    center_projected: [x as Float, y as Float, 1.0],
                });
            }
        }
        points
    }

    fn still_imu(n: usize, rate_hz: f64) -> Vec<ImuMeasurement> {
        (0..n)
            .map(|i| ImuMeasurement {
                timestamp: i as f64 / rate_hz,
                gyro: crate::misc::type_aliases::Vec3d::zeros(),
                acc: crate::misc::type_aliases::Vec3d::zeros(),
            })
            .collect()
    }

    fn inertial_tracker() -> (CoarseTracker, FrameData, FrameData, FrameData) {
        let calib = calib();
        let settings = TrackerSettings {
            affine_opt_mode_a: AffineOptMode::Fixed,
            affine_opt_mode_b: AffineOptMode::Fixed,
            ..TrackerSettings::default()
        };
        let mut tracker = CoarseTracker::new(&calib, 3, settings);
        let reference = plane_image(&calib, 0.0, 3);
        let right = plane_image(&calib, calib.baseline, 3);
        let points = grid_points(&calib);
        tracker.set_ref_for_first_frame(&HostFrame {
            frame: &reference,
            points: &points,
        });
        let mut new_frame = plane_image(&calib, 0.0, 3);
        new_frame.id = 1;
        new_frame.timestamp = 1.0;
        (tracker, reference, right, new_frame)
    }

    #[test]
    fn inertial_tracking_produces_a_marginal_prior() {
        let (mut tracker, _reference, right, new_frame) = inertial_tracker();
        let imu = still_imu(201, 200.0);
        let result = tracker
            .track_newest_stereo_inertial(
                &new_frame,
                &right,
                &imu,
                &ImuParameters::default(),
                TrackingGuess::identity(),
                2,
                [1e5; 5],
            )
            .unwrap();
        assert!(result.used_inertial);
        assert!(tracker.marg_prior.is_some());
        assert!(tracker.last_frame.is_some());
        assert!(result.tracking.pose.translation.vector.norm() < 0.05);

        let (h_m, _) = tracker.marg_prior.unwrap();
        assert!((h_m - h_m.transpose()).norm() < 1e-6 * (1.0 + h_m.norm()));
    }

    #[test]
    fn short_imu_window_falls_back_to_visual() {
        let (mut tracker, _reference, right, new_frame) = inertial_tracker();
        // Samples stop well before the new frame timestamp.
        let imu = still_imu(50, 200.0);
        let result = tracker
            .track_newest_stereo_inertial(
                &new_frame,
                &right,
                &imu,
                &ImuParameters::default(),
                TrackingGuess::identity(),
                2,
                [1e5; 5],
            )
            .unwrap();
        assert!(!result.used_inertial);
        assert!(tracker.marg_prior.is_none());
        assert!(tracker.last_frame.is_none());
        assert!(result.tracking.pose.translation.vector.norm() < 1e-3);
    }

    #[test]
    fn second_inertial_call_uses_two_pose_nodes() {
        let (mut tracker, _reference, right, new_frame) = inertial_tracker();
        let imu = still_imu(201, 200.0);
        let params = ImuParameters::default();
        tracker
            .track_newest_stereo_inertial(
                &new_frame,
                &right,
                &imu,
                &params,
                TrackingGuess::identity(),
                2,
                [1e5; 5],
            )
            .unwrap();

        let mut third = plane_image(&calib(), 0.0, 3);
        third.id = 2;
        third.timestamp = 2.0;
        let imu2 = still_imu(401, 200.0);
        let result = tracker
            .track_newest_stereo_inertial(
                &third,
                &right,
                &imu2,
                &params,
                TrackingGuess::identity(),
                2,
                [1e5; 5],
            )
            .unwrap();
        assert!(result.used_inertial);
        assert_eq!(tracker.last_frame.unwrap().timestamp, 2.0);
    }
}
