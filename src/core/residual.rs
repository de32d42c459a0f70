// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Analytic linearization of a point-frame photometric residual.
//!
//! For every pixel of the residual pattern, computes the residual against
//! the affine-corrected reference color and the full Jacobian stack with
//! respect to pose, camera intrinsics, inverse depth and affine
//! illumination, with per-pixel robust weighting. The products feeding the
//! back-end Hessian are precomputed here so the accumulator only sees
//! small dense blocks.

use nalgebra::{Matrix2, Matrix4, SMatrix, Vector2, Vector4};

use crate::config::TrackerSettings;
use crate::core::camera::CameraPyramid;
use crate::core::frame::{interpolate33, Dip, ResState};
use crate::math::accumulator::AccumulatorApprox;
use crate::misc::type_aliases::{Float, Mat3, Vec3, Vec6};

/// Number of pixels in the residual pattern.
pub const PATTERN_NUM: usize = 8;

/// The 8-point spread pattern around a point center.
pub const PATTERN: [[Float; 2]; PATTERN_NUM] = [
    [0.0, -2.0],
    [-1.0, -1.0],
    [1.0, -1.0],
    [-2.0, 0.0],
    [0.0, 0.0],
    [2.0, 0.0],
    [-1.0, 1.0],
    [0.0, 2.0],
];

/// Per-point data consumed by the linearizer.
#[derive(Clone, Debug)]
pub struct PointData {
    pub u: Float,
    pub v: Float,
    /// Inverse depth at the linearization point.
    pub idepth_zero: Float,
    /// Current inverse depth.
    pub idepth: Float,
    /// Reference colors at the pattern pixels.
    pub color: [Float; PATTERN_NUM],
    /// Cached per-pattern weights.
    pub weights: [Float; PATTERN_NUM],
}

/// Precomputed host-to-target relative pose data.
#[derive(Clone, Debug)]
pub struct FramePrecalc {
    /// `K R K^-1` at the current state.
    pub krki: Mat3,
    /// `K t` at the current state.
    pub kt: Vec3,
    /// Rotation at the linearization point.
    pub r0: Mat3,
    /// Translation at the linearization point.
    pub t0: Vec3,
    /// Relative affine mapping `(a, b)`.
    pub aff_mode: [Float; 2],
    /// Host affine offset entering the brightness-transfer derivative.
    pub b0: Float,
}

/// Jacobians of one point-frame residual, laid out per pattern pixel.
#[derive(Clone, Debug)]
pub struct RawResidualJacobian {
    /// Weighted residual per pattern pixel.
    pub res_f: [Float; PATTERN_NUM],
    /// d(projection) / d(se3 pose), x and y rows.
    pub j_pd_xi: [Vec6; 2],
    /// d(projection) / d(fx, fy, cx, cy), x and y rows (scale applied).
    pub j_pd_c: [Vector4<Float>; 2],
    /// d(projection) / d(inverse depth), x and y.
    pub j_pd_d: Vector2<Float>,
    /// Weighted image gradient per pattern pixel, x and y rows.
    pub j_idx: [[Float; PATTERN_NUM]; 2],
    /// d(residual) / d(a, b, a_r, b_r) per pattern pixel.
    pub j_ab_f: [[Float; PATTERN_NUM]; 4],
    /// Sum of `j_idx * j_idx^T` over the pattern.
    pub j_idx2: Matrix2<Float>,
    /// Sum of `j_ab_f * j_idx^T` over the pattern.
    pub j_ab_j_idx: SMatrix<Float, 4, 2>,
    /// Sum of `j_ab_f * j_ab_f^T` over the pattern.
    pub j_ab2: Matrix4<Float>,
}

impl RawResidualJacobian {
    pub fn zeros() -> Self {
        RawResidualJacobian {
            res_f: [0.0; PATTERN_NUM],
            j_pd_xi: [Vec6::zeros(); 2],
            j_pd_c: [Vector4::zeros(); 2],
            j_pd_d: Vector2::zeros(),
            j_idx: [[0.0; PATTERN_NUM]; 2],
            j_ab_f: [[0.0; PATTERN_NUM]; 4],
            j_idx2: Matrix2::zeros(),
            j_ab_j_idx: SMatrix::zeros(),
            j_ab2: Matrix4::zeros(),
        }
    }
}

/// Everything the linearizer borrows for one call.
pub struct LinearizeInput<'a> {
    pub point: &'a PointData,
    pub precalc: &'a FramePrecalc,
    /// Level-0 records of the target frame.
    pub target_dip: &'a [Dip],
    pub host_energy_th: Float,
    pub target_energy_th: Float,
}

/// A point-frame residual in the back-end. Host, target and point are
/// arena indices owned by the caller; back references are lookups.
pub struct PointFrameResidual {
    pub point: usize,
    pub host: usize,
    pub target: usize,
    pub state: ResState,
    pub energy: Float,
    pub new_state: ResState,
    pub new_energy: Float,
    pub new_energy_with_outlier: Float,
    /// Projection of the point center into the target: `(u, v, idepth)`.
    pub center_projected: [Float; 3],
    pub projected_to: [[Float; 2]; PATTERN_NUM],
    pub jac: RawResidualJacobian,
}

/// Center projection at the linearization point.
fn project_center(
    u: Float,
    v: Float,
    idepth: Float,
    cam: &CameraPyramid,
    r0: &Mat3,
    t0: &Vec3,
) -> Option<(Float, Float, Float, Float, Float, Vec3)> {
    let klip = Vec3::new(
        cam.fxi(0) * u + cam.cxi(0),
        cam.fyi(0) * v + cam.cyi(0),
        1.0,
    );
    let ptp = r0 * klip + t0 * idepth;
    let drescale = 1.0 / ptp[2];
    if !(drescale > 0.0) {
        return None;
    }
    let un = ptp[0] * drescale;
    let vn = ptp[1] * drescale;
    let ku = un * cam.fx[0] + cam.cx[0];
    let kv = vn * cam.fy[0] + cam.cy[0];
    if !in_target_bounds(ku, kv, cam) {
        return None;
    }
    Some((drescale, un, vn, ku, kv, klip))
}

/// Pattern-pixel projection with the current state.
fn project_pattern(
    u: Float,
    v: Float,
    idepth: Float,
    krki: &Mat3,
    kt: &Vec3,
    cam: &CameraPyramid,
) -> Option<(Float, Float)> {
    let ptp = krki * Vec3::new(u, v, 1.0) + kt * idepth;
    let ku = ptp[0] / ptp[2];
    let kv = ptp[1] / ptp[2];
    in_target_bounds(ku, kv, cam).then_some((ku, kv))
}

#[inline]
fn in_target_bounds(ku: Float, kv: Float, cam: &CameraPyramid) -> bool {
    ku > 1.1 && kv > 1.1 && ku < (cam.w[0] - 3) as Float && kv < (cam.h[0] - 3) as Float
}

impl PointFrameResidual {
    pub fn new(point: usize, host: usize, target: usize) -> Self {
        PointFrameResidual {
            point,
            host,
            target,
            state: ResState::In,
            energy: 0.0,
            new_state: ResState::Oob,
            new_energy: 0.0,
            new_energy_with_outlier: -1.0,
            center_projected: [0.0; 3],
            projected_to: [[0.0; 2]; PATTERN_NUM],
            jac: RawResidualJacobian::zeros(),
        }
    }

    /// Linearize against a regular target frame.
    pub fn linearize(
        &mut self,
        input: &LinearizeInput,
        cam: &CameraPyramid,
        settings: &TrackerSettings,
    ) -> Float {
        self.linearize_impl(input, cam, settings, false)
    }

    /// Linearize against the static right frame: the baseline is fixed,
    /// so the pose Jacobian is forced to zero and the affine derivatives
    /// are routed to the right-image slots.
    pub fn linearize_static(
        &mut self,
        input: &LinearizeInput,
        cam: &CameraPyramid,
        settings: &TrackerSettings,
    ) -> Float {
        self.linearize_impl(input, cam, settings, true)
    }

    fn linearize_impl(
        &mut self,
        input: &LinearizeInput,
        cam: &CameraPyramid,
        settings: &TrackerSettings,
        static_stereo: bool,
    ) -> Float {
        self.new_energy_with_outlier = -1.0;
        if self.state == ResState::Oob {
            self.new_state = ResState::Oob;
            return self.energy;
        }

        let point = input.point;
        let precalc = input.precalc;
        let scales = &settings.scales;
        let mut energy = 0.0;

        // Analytic Jacobians at the point center, taken at the
        // linearization point.
        let Some((drescale, u, v, ku, kv, klip)) = project_center(
            point.u,
            point.v,
            point.idepth_zero,
            cam,
            &precalc.r0,
            &precalc.t0,
        ) else {
            self.new_state = ResState::Oob;
            return self.energy;
        };
        let new_idepth = point.idepth_zero * drescale;
        self.center_projected = [ku, kv, new_idepth];

        let (fx, fy) = (cam.fx[0], cam.fy[0]);
        let (fxi, fyi) = (cam.fxi(0), cam.fyi(0));
        let r0 = &precalc.r0;
        let t0 = &precalc.t0;

        let d_d_x = drescale * (t0[0] - t0[2] * u) * scales.idepth * fx;
        let d_d_y = drescale * (t0[1] - t0[2] * v) * scales.idepth * fy;

        let mut d_c_x = Vector4::zeros();
        let mut d_c_y = Vector4::zeros();
        d_c_x[2] = drescale * (r0[(2, 0)] * u - r0[(0, 0)]);
        d_c_x[3] = fx * drescale * (r0[(2, 1)] * u - r0[(0, 1)]) * fyi;
        d_c_x[0] = klip[0] * d_c_x[2];
        d_c_x[1] = klip[1] * d_c_x[3];
        d_c_y[2] = fy * drescale * (r0[(2, 0)] * v - r0[(1, 0)]) * fxi;
        d_c_y[3] = drescale * (r0[(2, 1)] * v - r0[(1, 1)]);
        d_c_y[0] = klip[0] * d_c_y[2];
        d_c_y[1] = klip[1] * d_c_y[3];

        d_c_x[0] = (d_c_x[0] + u) * scales.f;
        d_c_x[1] *= scales.f;
        d_c_x[2] = (d_c_x[2] + 1.0) * scales.c;
        d_c_x[3] *= scales.c;
        d_c_y[0] *= scales.f;
        d_c_y[1] = (d_c_y[1] + v) * scales.f;
        d_c_y[2] *= scales.c;
        d_c_y[3] = (d_c_y[3] + 1.0) * scales.c;

        let (d_xi_x, d_xi_y);
        if static_stereo {
            d_xi_x = Vec6::zeros();
            d_xi_y = Vec6::zeros();
        } else {
            d_xi_x = Vec6::new(
                new_idepth * fx,
                0.0,
                -new_idepth * u * fx,
                -u * v * fx,
                (1.0 + u * u) * fx,
                -v * fx,
            );
            d_xi_y = Vec6::new(
                0.0,
                new_idepth * fy,
                -new_idepth * v * fy,
                -(1.0 + v * v) * fy,
                u * v * fy,
                u * fy,
            );
        }

        self.jac.j_pd_xi = [d_xi_x, d_xi_y];
        self.jac.j_pd_c = [d_c_x, d_c_y];
        self.jac.j_pd_d = Vector2::new(d_d_x, d_d_y);

        let mut j_idx2 = Matrix2::zeros();
        let mut j_ab_j_idx = SMatrix::<Float, 4, 2>::zeros();
        let mut j_ab2 = Matrix4::zeros();
        let mut w_ji2_sum = 0.0;

        let aff = precalc.aff_mode;
        let (a_slot, b_slot) = if static_stereo { (2, 3) } else { (0, 1) };

        for idx in 0..PATTERN_NUM {
            let Some((ku, kv)) = project_pattern(
                point.u + PATTERN[idx][0],
                point.v + PATTERN[idx][1],
                point.idepth,
                &precalc.krki,
                &precalc.kt,
                cam,
            ) else {
                self.new_state = ResState::Oob;
                return self.energy;
            };
            self.projected_to[idx] = [ku, kv];

            let hit = interpolate33(input.target_dip, ku, kv, cam.w[0]);
            if !hit[0].is_finite() {
                self.new_state = ResState::Oob;
                return self.energy;
            }
            let residual = hit[0] - (aff[0] * point.color[idx] + aff[1]);
            let drd_a = point.color[idx] - precalc.b0;

            let w_grad = (settings.outlier_th_sum_component
                / (settings.outlier_th_sum_component + hit[1] * hit[1] + hit[2] * hit[2]))
                .sqrt();
            let w = 0.5 * (w_grad + point.weights[idx]);

            let mut hw = if residual.abs() < settings.huber_th {
                1.0
            } else {
                settings.huber_th / residual.abs()
            };
            energy += w * w * hw * residual * residual * (2.0 - hw);

            if hw < 1.0 {
                hw = hw.sqrt();
            }
            hw *= w;
            let gx = hit[1] * hw;
            let gy = hit[2] * hw;

            self.jac.res_f[idx] = residual * hw;
            self.jac.j_idx[0][idx] = gx;
            self.jac.j_idx[1][idx] = gy;
            for slot in 0..4 {
                self.jac.j_ab_f[slot][idx] = 0.0;
            }
            self.jac.j_ab_f[a_slot][idx] = -drd_a * hw;
            self.jac.j_ab_f[b_slot][idx] = -hw;

            j_idx2[(0, 0)] += gx * gx;
            j_idx2[(1, 1)] += gy * gy;
            j_idx2[(0, 1)] += gx * gy;

            for row in 0..4 {
                j_ab_j_idx[(row, 0)] += self.jac.j_ab_f[row][idx] * gx;
                j_ab_j_idx[(row, 1)] += self.jac.j_ab_f[row][idx] * gy;
                for col in row..4 {
                    j_ab2[(row, col)] += self.jac.j_ab_f[row][idx] * self.jac.j_ab_f[col][idx];
                }
            }

            w_ji2_sum += hw * hw * (gx * gx + gy * gy);

            if settings.affine_opt_mode_a.is_fixed() {
                self.jac.j_ab_f[0][idx] = 0.0;
                self.jac.j_ab_f[2][idx] = 0.0;
            }
            if settings.affine_opt_mode_b.is_fixed() {
                self.jac.j_ab_f[1][idx] = 0.0;
                self.jac.j_ab_f[3][idx] = 0.0;
            }
        }

        j_idx2[(1, 0)] = j_idx2[(0, 1)];
        for row in 0..4 {
            for col in row + 1..4 {
                j_ab2[(col, row)] = j_ab2[(row, col)];
            }
        }
        self.jac.j_idx2 = j_idx2;
        self.jac.j_ab_j_idx = j_ab_j_idx;
        self.jac.j_ab2 = j_ab2;

        self.new_energy_with_outlier = energy;
        let frame_th = input.host_energy_th.max(input.target_energy_th);
        if energy > frame_th || w_ji2_sum < 2.0 {
            energy = frame_th;
            self.new_state = ResState::Outlier;
        } else {
            self.new_state = ResState::In;
        }
        self.new_energy = energy;
        energy
    }

    /// Commit the state of the last linearization.
    pub fn apply_res(&mut self) {
        // A residual can never come back from OOB.
        if self.state != ResState::Oob {
            self.state = self.new_state;
        }
        self.energy = self.new_energy;
    }
}

/// Feed one linearized residual into the 13-D approximate accumulator the
/// way the back-end Hessian assembly does: the 10x10 geometric block from
/// the gradient Gram matrix, the affine/residual cross terms top right,
/// and the affine Gram block bottom right.
pub fn accumulate_point_hessian(acc: &mut AccumulatorApprox, jac: &RawResidualJacobian) {
    let x4: [Float; 4] = jac.j_pd_c[0].into();
    let x6: [Float; 6] = jac.j_pd_xi[0].into();
    let y4: [Float; 4] = jac.j_pd_c[1].into();
    let y6: [Float; 6] = jac.j_pd_xi[1].into();

    acc.update(
        &x4,
        &x6,
        &y4,
        &y6,
        jac.j_idx2[(0, 0)],
        jac.j_idx2[(0, 1)],
        jac.j_idx2[(1, 1)],
    );

    let mut ji_r = [0.0; 2];
    let mut jab_r = [0.0; 2];
    let mut rr = 0.0;
    for idx in 0..PATTERN_NUM {
        ji_r[0] += jac.res_f[idx] * jac.j_idx[0][idx];
        ji_r[1] += jac.res_f[idx] * jac.j_idx[1][idx];
        jab_r[0] += jac.res_f[idx] * jac.j_ab_f[0][idx];
        jab_r[1] += jac.res_f[idx] * jac.j_ab_f[1][idx];
        rr += jac.res_f[idx] * jac.res_f[idx];
    }

    acc.update_top_right(
        &x4,
        &x6,
        &y4,
        &y6,
        jac.j_ab_j_idx[(0, 0)],
        jac.j_ab_j_idx[(0, 1)],
        jac.j_ab_j_idx[(1, 0)],
        jac.j_ab_j_idx[(1, 1)],
        ji_r[0],
        ji_r[1],
    );
    acc.update_bot_right(
        jac.j_ab2[(0, 0)],
        jac.j_ab2[(0, 1)],
        jab_r[0],
        jac.j_ab2[(1, 1)],
        jab_r[1],
        rr,
    );
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::camera::Calibration;
    use crate::core::frame::FrameData;

    fn cam() -> CameraPyramid {
        CameraPyramid::make(
            &Calibration {
                fx: 100.0,
                fy: 100.0,
                cx: 31.5,
                cy: 23.5,
                width: 64,
                height: 48,
                baseline: 0.1,
            },
            1,
        )
    }

    fn smooth_frame() -> FrameData {
        let img: Vec<Float> = (0..64 * 48)
            .map(|i| {
                let (x, y) = ((i % 64) as Float, (i / 64) as Float);
                100.0 + 0.8 * x + 0.5 * y
            })
            .collect();
        FrameData::from_image(&img, 64, 48, 1)
    }

    fn identity_precalc() -> FramePrecalc {
        FramePrecalc {
            krki: Mat3::identity(),
            kt: Vec3::zeros(),
            r0: Mat3::identity(),
            t0: Vec3::zeros(),
            aff_mode: [1.0, 0.0],
            b0: 0.0,
        }
    }

    fn point_with_true_colors(frame: &FrameData, u: Float, v: Float) -> PointData {
        let mut color = [0.0; PATTERN_NUM];
        for (c, offset) in color.iter_mut().zip(PATTERN.iter()) {
            let i = (u + offset[0]) as usize + (v + offset[1]) as usize * 64;
            *c = frame.dip[0][i][0];
        }
        PointData {
            u,
            v,
            idepth_zero: 0.5,
            idepth: 0.5,
            color,
            weights: [1.0; PATTERN_NUM],
        }
    }

    #[test]
    fn identity_projection_is_inlier_with_zero_energy() {
        let cam = cam();
        let frame = smooth_frame();
        let point = point_with_true_colors(&frame, 20.0, 20.0);
        let mut res = PointFrameResidual::new(0, 0, 1);
        let energy = res.linearize(
            &LinearizeInput {
                point: &point,
                precalc: &identity_precalc(),
                target_dip: &frame.dip[0],
                host_energy_th: 1e8,
                target_energy_th: 1e8,
            },
            &cam,
            &TrackerSettings::default(),
        );
        assert_eq!(res.new_state, ResState::In);
        assert!(energy < 1e-4, "energy was {energy}");
        assert!((res.center_projected[0] - 20.0).abs() < 1e-4);
        assert!((res.center_projected[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn out_of_bounds_keeps_cached_energy() {
        let cam = cam();
        let frame = smooth_frame();
        let point = point_with_true_colors(&frame, 20.0, 20.0);
        let mut res = PointFrameResidual::new(0, 0, 1);
        res.energy = 42.0;
        let precalc = FramePrecalc {
            // Large translation pushes the projection far off the image.
            kt: Vec3::new(1e5, 0.0, 0.0),
            ..identity_precalc()
        };
        let energy = res.linearize(
            &LinearizeInput {
                point: &point,
                precalc: &precalc,
                target_dip: &frame.dip[0],
                host_energy_th: 1e8,
                target_energy_th: 1e8,
            },
            &cam,
            &TrackerSettings::default(),
        );
        assert_eq!(res.new_state, ResState::Oob);
        assert_eq!(energy, 42.0);
    }

    #[test]
    fn outlier_energy_is_clamped_to_frame_threshold() {
        let cam = cam();
        let frame = smooth_frame();
        let mut point = point_with_true_colors(&frame, 20.0, 20.0);
        for c in point.color.iter_mut() {
            *c += 500.0;
        }
        let mut res = PointFrameResidual::new(0, 0, 1);
        let energy = res.linearize(
            &LinearizeInput {
                point: &point,
                precalc: &identity_precalc(),
                target_dip: &frame.dip[0],
                host_energy_th: 10.0,
                target_energy_th: 12.0,
            },
            &cam,
            &TrackerSettings::default(),
        );
        assert_eq!(res.new_state, ResState::Outlier);
        assert_eq!(energy, 12.0);
        assert!(res.new_energy_with_outlier > 12.0);
    }

    #[test]
    fn static_stereo_zeroes_pose_jacobian() {
        let cam = cam();
        let frame = smooth_frame();
        let point = point_with_true_colors(&frame, 20.0, 20.0);
        let mut res = PointFrameResidual::new(0, 0, 1);
        res.linearize_static(
            &LinearizeInput {
                point: &point,
                precalc: &identity_precalc(),
                target_dip: &frame.dip[0],
                host_energy_th: 1e8,
                target_energy_th: 1e8,
            },
            &cam,
            &TrackerSettings::default(),
        );
        assert_eq!(res.jac.j_pd_xi[0], Vec6::zeros());
        assert_eq!(res.jac.j_pd_xi[1], Vec6::zeros());
        // Affine derivatives live in the right-image slots.
        assert_eq!(res.jac.j_ab_f[0], [0.0; PATTERN_NUM]);
        assert_eq!(res.jac.j_ab_f[1], [0.0; PATTERN_NUM]);
        assert!(res.jac.j_ab_f[3].iter().all(|&v| v != 0.0));
    }

    #[test]
    fn apply_res_never_leaves_oob() {
        let mut res = PointFrameResidual::new(0, 0, 1);
        res.state = ResState::Oob;
        res.new_state = ResState::In;
        res.apply_res();
        assert_eq!(res.state, ResState::Oob);
    }

    #[test]
    fn approx_accumulator_sees_gram_blocks() {
        let cam = cam();
        let frame = smooth_frame();
        let point = point_with_true_colors(&frame, 20.0, 20.0);
        let mut res = PointFrameResidual::new(0, 0, 1);
        let precalc = FramePrecalc {
            kt: Vec3::new(0.5, 0.0, 0.0),
            t0: Vec3::new(0.5, 0.0, 0.0),
            ..identity_precalc()
        };
        res.linearize(
            &LinearizeInput {
                point: &point,
                precalc: &precalc,
                target_dip: &frame.dip[0],
                host_energy_th: 1e8,
                target_energy_th: 1e8,
            },
            &cam,
            &TrackerSettings::default(),
        );
        let mut acc = AccumulatorApprox::new();
        accumulate_point_hessian(&mut acc, &res.jac);
        let h = acc.finish();
        assert_eq!(h, h.transpose());
        // The residual-energy corner equals sum(res_f^2).
        let rr: Float = res.jac.res_f.iter().map(|r| r * r).sum();
        assert!((h[(12, 12)] - rr).abs() < 1e-3 * (1.0 + rr.abs()));
    }
}

