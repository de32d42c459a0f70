// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The coarse tracker: direct image alignment of a new frame against the
//! reference keyframe over a multi-resolution pyramid.
//!
//! Per level, the warper projects every reference point into the new
//! frame, evaluates the Huber-robust photometric residual and fills the
//! SIMD warp buffers; the accumulators aggregate them into a dense
//! fixed-size system; a Levenberg-Marquardt loop proposes, tests and
//! applies steps. Levels run from coarsest to finest, with an adaptive
//! residual-cutoff escalation and a one-shot level repetition.

use itertools::izip;
use log::info;
use nalgebra::{SMatrix, SVector};

use crate::config::TrackerSettings;
use crate::core::camera::{Calibration, CameraPyramid, MAX_PYR_LEVELS};
use crate::core::depth_map::DepthPyramid;
use crate::core::frame::{interpolate33, AffLight, FrameData, FrameId, HostFrame};
use crate::math::accumulator::{Accumulator11, Accumulator9};
use crate::math::se3;
use crate::math::simd::{F32x4, LaneBuffer};
use crate::misc::type_aliases::{
    Float, Iso3, Mat8d, Mat10d, SpeedAndBias, Vec3, Vec8d, Vec10d,
};

/// Per-level iteration budgets, coarsest last.
const MAX_ITERATIONS: [usize; MAX_PYR_LEVELS] = [10, 20, 50, 50, 50];
const LAMBDA_EXTRAPOLATION_LIMIT: f64 = 0.001;

/// Warp buffers: one entry per surviving reference point, padded with
/// zeros to a multiple of four so the accumulators always read whole
/// lanes. Capacity equals the level-0 image size.
pub(crate) struct WarpBuffers {
    pub n: usize,
    pub idepth: LaneBuffer,
    pub u: LaneBuffer,
    pub v: LaneBuffer,
    pub dx: LaneBuffer,
    pub dy: LaneBuffer,
    pub residual: LaneBuffer,
    pub weight: LaneBuffer,
    pub ref_color: LaneBuffer,
    /// Right-to-left inverse depth ratio (stereo).
    pub idepth_r: LaneBuffer,
    pub dx_r: LaneBuffer,
    pub dy_r: LaneBuffer,
    pub residual_r: LaneBuffer,
    pub weight_r: LaneBuffer,
    /// Derivative of the stereo disparity w.r.t. inverse depth.
    pub dd: LaneBuffer,
    pub dd_r: LaneBuffer,
}

impl WarpBuffers {
    fn new(capacity: usize) -> Self {
        WarpBuffers {
            n: 0,
            idepth: LaneBuffer::zeros(capacity),
            u: LaneBuffer::zeros(capacity),
            v: LaneBuffer::zeros(capacity),
            dx: LaneBuffer::zeros(capacity),
            dy: LaneBuffer::zeros(capacity),
            residual: LaneBuffer::zeros(capacity),
            weight: LaneBuffer::zeros(capacity),
            ref_color: LaneBuffer::zeros(capacity),
            idepth_r: LaneBuffer::zeros(capacity),
            dx_r: LaneBuffer::zeros(capacity),
            dy_r: LaneBuffer::zeros(capacity),
            residual_r: LaneBuffer::zeros(capacity),
            weight_r: LaneBuffer::zeros(capacity),
            dd: LaneBuffer::zeros(capacity),
            dd_r: LaneBuffer::zeros(capacity),
        }
    }

    fn push_left(
        &mut self,
        idepth: Float,
        u: Float,
        v: Float,
        dx: Float,
        dy: Float,
        residual: Float,
        weight: Float,
        ref_color: Float,
        dd: Float,
    ) {
        let i = self.n;
        self.idepth.as_mut_slice()[i] = idepth;
        self.u.as_mut_slice()[i] = u;
        self.v.as_mut_slice()[i] = v;
        self.dx.as_mut_slice()[i] = dx;
        self.dy.as_mut_slice()[i] = dy;
        self.residual.as_mut_slice()[i] = residual;
        self.weight.as_mut_slice()[i] = weight;
        self.ref_color.as_mut_slice()[i] = ref_color;
        self.dd.as_mut_slice()[i] = dd;
    }

    fn push_right(
        &mut self,
        idepth_ratio: Float,
        dx: Float,
        dy: Float,
        residual: Float,
        weight: Float,
        dd: Float,
    ) {
        let i = self.n;
        self.idepth_r.as_mut_slice()[i] = idepth_ratio;
        self.dx_r.as_mut_slice()[i] = dx;
        self.dy_r.as_mut_slice()[i] = dy;
        self.residual_r.as_mut_slice()[i] = residual;
        self.weight_r.as_mut_slice()[i] = weight;
        self.dd_r.as_mut_slice()[i] = dd;
    }

    /// Zero-fill the current entry of every buffer and advance; used to
    /// pad the live range to a multiple of four.
    fn pad_to_lane(&mut self) {
        while self.n % 4 != 0 {
            let i = self.n;
            for buf in [
                &mut self.idepth,
                &mut self.u,
                &mut self.v,
                &mut self.dx,
                &mut self.dy,
                &mut self.residual,
                &mut self.weight,
                &mut self.ref_color,
                &mut self.idepth_r,
                &mut self.dx_r,
                &mut self.dy_r,
                &mut self.residual_r,
                &mut self.weight_r,
                &mut self.dd,
                &mut self.dd_r,
            ] {
                buf.as_mut_slice()[i] = 0.0;
            }
            self.n += 1;
        }
    }
}

/// Outcome of one residual evaluation over a level.
#[derive(Copy, Clone, Debug)]
pub struct ResEval {
    pub energy: f64,
    pub num_terms: usize,
    /// Mean squared pixel shift under translation-only motion.
    pub flow_t: Float,
    /// Mean squared pixel shift under translation+rotation.
    pub flow_rt: Float,
    /// Fraction of evaluated points above the cutoff.
    pub saturated: Float,
}

impl ResEval {
    #[inline]
    fn mean(&self) -> f64 {
        self.energy / self.num_terms as f64
    }
}

/// Initial guess of a tracking call.
#[derive(Copy, Clone, Debug)]
pub struct TrackingGuess {
    /// Reference-to-new rigid motion.
    pub pose: Iso3,
    pub aff_g2l: AffLight,
    pub aff_g2l_r: AffLight,
}

impl TrackingGuess {
    pub fn identity() -> Self {
        TrackingGuess {
            pose: Iso3::identity(),
            aff_g2l: AffLight::default(),
            aff_g2l_r: AffLight::default(),
        }
    }
}

/// Counters describing how a tracking call went.
#[derive(Copy, Clone, Debug, Default)]
pub struct TrackingDiagnostics {
    /// Number of cutoff doublings across all level visits.
    pub cutoff_escalations: u32,
    /// Whether the one-shot level repetition triggered.
    pub repeated_level: bool,
    /// Accepted plus rejected LM iterations.
    pub iterations: u32,
}

/// A successful tracking call.
#[derive(Copy, Clone, Debug)]
pub struct TrackingResult {
    pub pose: Iso3,
    pub aff_g2l: AffLight,
    pub aff_g2l_r: AffLight,
    /// Per-level RMSE of the accepted state (NaN for unvisited levels).
    pub last_residuals: [Float; MAX_PYR_LEVELS],
    /// `(flow_t, 0, flow_rt)` of the finest visited level.
    pub flow: Vec3,
    pub diagnostics: TrackingDiagnostics,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TrackingError {
    #[error("level {level} residual {rmse} above abort threshold")]
    ResidualAboveAbort { level: usize, rmse: Float },
    #[error("affine parameters out of bounds after optimization")]
    AffineOutOfBounds,
    #[error("relative exposure affine out of bounds")]
    RelativeAffineOutOfBounds,
    #[error(transparent)]
    Imu(#[from] crate::imu::ImuError),
}

/// Snapshot of the reference keyframe taken by `set_coarse_tracking_ref`.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RefSnapshot {
    pub id: FrameId,
    pub timestamp: f64,
    pub exposure: Float,
    pub aff_g2l: AffLight,
    pub world_to_cam: Iso3,
    pub speed_and_bias: SpeedAndBias,
}

impl RefSnapshot {
    fn of(frame: &FrameData) -> Self {
        RefSnapshot {
            id: frame.id,
            timestamp: frame.timestamp,
            exposure: frame.exposure,
            aff_g2l: frame.aff_g2l,
            world_to_cam: frame.world_to_cam,
            speed_and_bias: frame.speed_and_bias,
        }
    }
}

/// Inertial state of the most recently tracked frame, kept so consecutive
/// tracking calls can chain two pose nodes.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LastFrameNode {
    pub timestamp: f64,
    pub speed_and_bias: SpeedAndBias,
}

/// The coarse tracker. Owns its depth pyramid and warp buffers from
/// construction to destruction; reference keyframe and new frames are
/// borrowed per call. Not re-entrant; the surrounding front-end owns two
/// instances when it wants to overlap reference swaps.
pub struct CoarseTracker {
    pub(crate) settings: TrackerSettings,
    pub(crate) cam: CameraPyramid,
    pub(crate) depth: DepthPyramid,
    pub(crate) warp: WarpBuffers,
    acc9: Accumulator9,
    pub(crate) acc11: Accumulator11,
    pub(crate) reference: Option<RefSnapshot>,
    /// RMSE of the first successful track against the current reference;
    /// maintained by the caller to derive its abort thresholds.
    pub first_coarse_rmse: f64,
    pub last_residuals: [Float; MAX_PYR_LEVELS],
    pub last_flow_indicators: Vec3,
    // Inertial coupling state.
    pub(crate) preint: crate::imu::Preintegration,
    pub(crate) last_frame: Option<LastFrameNode>,
    pub(crate) marg_prior: Option<(SMatrix<f64, 19, 19>, SVector<f64, 19>)>,
    pub(crate) redo_preintegration: bool,
}

impl CoarseTracker {
    pub fn new(calib: &Calibration, levels: usize, settings: TrackerSettings) -> Self {
        let cam = CameraPyramid::make(calib, levels);
        let depth = DepthPyramid::new(&cam);
        let warp = WarpBuffers::new(calib.width * calib.height);
        CoarseTracker {
            settings,
            cam,
            depth,
            warp,
            acc9: Accumulator9::new(),
            acc11: Accumulator11::new(),
            reference: None,
            first_coarse_rmse: -1.0,
            last_residuals: [Float::NAN; MAX_PYR_LEVELS],
            last_flow_indicators: Vec3::new(1000.0, 1000.0, 1000.0),
            preint: crate::imu::Preintegration::new(),
            last_frame: None,
            marg_prior: None,
            redo_preintegration: true,
        }
    }

    /// Rebuild the per-level intrinsics. Idempotent; the image size must
    /// match the one the tracker was built for.
    pub fn make_k(&mut self, calib: &Calibration) {
        assert_eq!(calib.width, self.cam.w[0]);
        assert_eq!(calib.height, self.cam.h[0]);
        self.cam = CameraPyramid::make(calib, self.cam.levels);
    }

    #[inline]
    pub fn camera(&self) -> &CameraPyramid {
        &self.cam
    }

    #[inline]
    pub fn depth_map(&self) -> &DepthPyramid {
        &self.depth
    }

    #[inline]
    pub fn ref_frame_id(&self) -> Option<FrameId> {
        self.reference.map(|r| r.id)
    }

    /// Rebuild the coarse tracking templates from the active window; the
    /// last host is the new reference keyframe.
    pub fn set_coarse_tracking_ref(&mut self, hosts: &[HostFrame]) {
        let reference = hosts.last().expect("at least one host keyframe").frame;
        self.depth.make(hosts, reference.id, &reference.dip);
        self.reference = Some(RefSnapshot::of(reference));
        self.first_coarse_rmse = -1.0;
        self.last_frame = None;
        self.marg_prior = None;
        self.redo_preintegration = true;
    }

    /// First-frame variant: no residual history exists yet, every point
    /// splats at its raw location.
    pub fn set_ref_for_first_frame(&mut self, host: &HostFrame) {
        self.depth
            .make_for_first_frame(host.points, &host.frame.dip);
        self.reference = Some(RefSnapshot::of(host.frame));
        self.first_coarse_rmse = -1.0;
        self.last_frame = None;
        self.marg_prior = None;
        self.redo_preintegration = true;
    }

    // Residual evaluation ###############################################

    /// Warp every reference point of the level into the new frame and
    /// evaluate the robust photometric cost, filling the warp buffers.
    pub(crate) fn calc_res(
        &mut self,
        lvl: usize,
        new_frame: &FrameData,
        ref_to_new: &Iso3,
        aff_g2l: AffLight,
        cutoff_th: Float,
    ) -> ResEval {
        let reference = self.reference.expect("tracking reference not set");
        let wl = self.cam.w[lvl];
        let hl = self.cam.h[lvl];
        let dip_new = &new_frame.dip[lvl];
        let (fxl, fyl) = (self.cam.fx[lvl], self.cam.fy[lvl]);
        let (cxl, cyl) = (self.cam.cx[lvl], self.cam.cy[lvl]);
        let ki = &self.cam.k_inv[lvl];

        let r_f32: SMatrix<Float, 3, 3> = ref_to_new.rotation.to_rotation_matrix().into_inner().cast();
        let rki = r_f32 * ki;
        let t: Vec3 = ref_to_new.translation.vector.cast();
        let aff_ll = AffLight::from_to_exposure(
            reference.exposure,
            new_frame.exposure,
            reference.aff_g2l,
            aff_g2l,
        );

        let huber = self.settings.huber_th;
        let max_energy = 2.0 * huber * cutoff_th - huber * huber;

        let mut energy = 0.0f64;
        let mut num_terms = 0usize;
        let mut num_saturated = 0usize;
        let mut shift_t = 0.0f32;
        let mut shift_rt = 0.0f32;
        let mut shift_num = 0.0f32;

        self.warp.n = 0;
        let (pc_u, pc_v, pc_idepth, pc_color) = self.depth.pc(lvl);

        for (i, (&x, &y, &id, &ref_color)) in
            izip!(pc_u, pc_v, pc_idepth, pc_color).enumerate()
        {
            let pt = rki * Vec3::new(x, y, 1.0) + t * id;
            let u = pt[0] / pt[2];
            let v = pt[1] / pt[2];
            let ku = fxl * u + cxl;
            let kv = fyl * v + cyl;
            let new_idepth = id / pt[2];

            if lvl == 0 && i % 32 == 0 {
                // Squared pixel shifts under four alternative motions,
                // used as motion-magnitude heuristics.
                let pt_t = ki * Vec3::new(x, y, 1.0) + t * id;
                let ku_t = fxl * (pt_t[0] / pt_t[2]) + cxl;
                let kv_t = fyl * (pt_t[1] / pt_t[2]) + cyl;

                let pt_t2 = ki * Vec3::new(x, y, 1.0) - t * id;
                let ku_t2 = fxl * (pt_t2[0] / pt_t2[2]) + cxl;
                let kv_t2 = fyl * (pt_t2[1] / pt_t2[2]) + cyl;

                let pt3 = rki * Vec3::new(x, y, 1.0) - t * id;
                let ku3 = fxl * (pt3[0] / pt3[2]) + cxl;
                let kv3 = fyl * (pt3[1] / pt3[2]) + cyl;

                shift_t += (ku_t - x).powi(2) + (kv_t - y).powi(2);
                shift_t += (ku_t2 - x).powi(2) + (kv_t2 - y).powi(2);
                shift_rt += (ku - x).powi(2) + (kv - y).powi(2);
                shift_rt += (ku3 - x).powi(2) + (kv3 - y).powi(2);
                shift_num += 2.0;
            }

            if !(ku > 2.0 && kv > 2.0 && ku < (wl - 3) as Float && kv < (hl - 3) as Float
                && new_idepth > 0.0)
            {
                continue;
            }

            let hit = interpolate33(dip_new, ku, kv, wl);
            if !hit[0].is_finite() {
                continue;
            }
            let residual = hit[0] - (aff_ll[0] * ref_color + aff_ll[1]);
            let hw = if residual.abs() < huber {
                1.0
            } else {
                huber / residual.abs()
            };

            if residual.abs() > cutoff_th {
                energy += f64::from(max_energy);
                num_terms += 1;
                num_saturated += 1;
            } else {
                energy += f64::from(hw * residual * residual * (2.0 - hw));
                num_terms += 1;
                self.warp
                    .push_left(new_idepth, u, v, hit[1], hit[2], residual, hw, ref_color, 0.0);
                self.warp.n += 1;
            }
        }
        self.warp.pad_to_lane();

        ResEval {
            energy,
            num_terms,
            flow_t: shift_t / (shift_num + 0.1),
            flow_rt: shift_rt / (shift_num + 0.1),
            saturated: num_saturated as Float / num_terms as Float,
        }
    }

    /// Stereo variant: additionally re-projects each surviving point into
    /// the right camera through the static baseline and evaluates the
    /// right-image residual; also fills the disparity-derivative scalars
    /// used by the inertial coupling.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn calc_res_stereo(
        &mut self,
        lvl: usize,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        ref_to_new: &Iso3,
        aff_g2l: AffLight,
        aff_g2l_r: AffLight,
        cutoff_th: Float,
    ) -> ResEval {
        let reference = self.reference.expect("tracking reference not set");
        let wl = self.cam.w[lvl];
        let hl = self.cam.h[lvl];
        let dip_new = &new_frame.dip[lvl];
        let dip_new_r = &new_frame_right.dip[lvl];
        let (fxl, fyl) = (self.cam.fx[lvl], self.cam.fy[lvl]);
        let (cxl, cyl) = (self.cam.cx[lvl], self.cam.cy[lvl]);
        let ki = &self.cam.k_inv[lvl];

        let r_f32: SMatrix<Float, 3, 3> = ref_to_new.rotation.to_rotation_matrix().into_inner().cast();
        let rki = r_f32 * ki;
        let t: Vec3 = ref_to_new.translation.vector.cast();
        let aff_ll = AffLight::from_to_exposure(
            reference.exposure,
            new_frame.exposure,
            reference.aff_g2l,
            aff_g2l,
        );
        let aff_ll_r = AffLight::from_to_exposure(
            reference.exposure,
            new_frame_right.exposure,
            reference.aff_g2l,
            aff_g2l_r,
        );

        // Static stereo reprojection: identity rotation, baseline along x.
        let rki_s = ki.clone_owned();
        let t_s = Vec3::new(-self.cam.baseline, 0.0, 0.0);

        let huber = self.settings.huber_th;
        let max_energy = 2.0 * huber * cutoff_th - huber * huber;

        let mut energy = 0.0f64;
        let mut num_terms = 0usize;
        let mut num_saturated = 0usize;
        let mut shift_t = 0.0f32;
        let mut shift_rt = 0.0f32;
        let mut shift_num = 0.0f32;

        self.warp.n = 0;
        let (pc_u, pc_v, pc_idepth, pc_color) = self.depth.pc(lvl);

        for (i, (&x, &y, &id, &ref_color)) in
            izip!(pc_u, pc_v, pc_idepth, pc_color).enumerate()
        {
            let pt = rki * Vec3::new(x, y, 1.0) + t * id;
            let u = pt[0] / pt[2];
            let v = pt[1] / pt[2];
            let ku = fxl * u + cxl;
            let kv = fyl * v + cyl;
            let new_idepth = id / pt[2];

            let pt_r = rki_s * Vec3::new(ku, kv, 1.0) + t_s * new_idepth;
            let u_r = pt_r[0] / pt_r[2];
            let v_r = pt_r[1] / pt_r[2];
            let ku_r = fxl * u_r + cxl;
            let kv_r = fyl * v_r + cyl;
            let new_idepth_r = new_idepth / pt_r[2];

            if lvl == 0 && i % 32 == 0 {
                let pt_t = ki * Vec3::new(x, y, 1.0) + t * id;
                let ku_t = fxl * (pt_t[0] / pt_t[2]) + cxl;
                let kv_t = fyl * (pt_t[1] / pt_t[2]) + cyl;

                let pt_t2 = ki * Vec3::new(x, y, 1.0) - t * id;
                let ku_t2 = fxl * (pt_t2[0] / pt_t2[2]) + cxl;
                let kv_t2 = fyl * (pt_t2[1] / pt_t2[2]) + cyl;

                let pt3 = rki * Vec3::new(x, y, 1.0) - t * id;
                let ku3 = fxl * (pt3[0] / pt3[2]) + cxl;
                let kv3 = fyl * (pt3[1] / pt3[2]) + cyl;

                shift_t += (ku_t - x).powi(2) + (kv_t - y).powi(2);
                shift_t += (ku_t2 - x).powi(2) + (kv_t2 - y).powi(2);
                shift_rt += (ku - x).powi(2) + (kv - y).powi(2);
                shift_rt += (ku3 - x).powi(2) + (kv3 - y).powi(2);
                shift_num += 2.0;
            }

            if !(ku > 2.0 && kv > 2.0 && ku < (wl - 3) as Float && kv < (hl - 3) as Float
                && new_idepth > 0.0)
            {
                continue;
            }
            let mut right_valid = ku_r > 2.0
                && kv_r > 2.0
                && ku_r < (wl - 3) as Float
                && kv_r < (hl - 3) as Float
                && new_idepth_r > 0.0;

            let hit = interpolate33(dip_new, ku, kv, wl);
            if !hit[0].is_finite() || hit[1] == 0.0 || hit[2] == 0.0 {
                continue;
            }
            let residual = hit[0] - (aff_ll[0] * ref_color + aff_ll[1]);
            let hw = if residual.abs() < huber {
                1.0
            } else {
                huber / residual.abs()
            };

            let hit_r = if right_valid {
                let hit_r = interpolate33(dip_new_r, ku_r, kv_r, wl);
                if !hit_r[0].is_finite() || hit_r[1] == 0.0 || hit_r[2] == 0.0 {
                    right_valid = false;
                }
                hit_r
            } else {
                Vec3::zeros()
            };
            let residual_r = hit_r[0] - (aff_ll_r[0] * ref_color + aff_ll_r[1]);
            let hw_r = if residual_r.abs() < huber {
                1.0
            } else {
                huber / residual_r.abs()
            };

            if residual.abs() > cutoff_th {
                energy += 2.0 * f64::from(max_energy);
                num_terms += 1;
                num_saturated += 1;
            } else {
                energy += f64::from(hw * residual * residual * (2.0 - hw));
                if right_valid && residual_r.abs() <= cutoff_th {
                    energy += f64::from(hw_r * residual_r * residual_r * (2.0 - hw_r));
                }
                num_terms += 1;

                let pt2 = new_idepth / id;
                let dd = pt2 * (hit[1] * fxl * (t[0] - u * t[2]) + hit[2] * fyl * (t[1] - v * t[2]));
                self.warp
                    .push_left(new_idepth, u, v, hit[1], hit[2], residual, hw, ref_color, dd);

                if right_valid && residual_r.abs() <= cutoff_th {
                    let pt_r2 = new_idepth_r / new_idepth;
                    let dd_r = pt_r2
                        * pt2
                        * (hit_r[1] * fxl * (t[0] - u * t[2]) + hit_r[2] * fyl * (t[1] - v * t[2]));
                    self.warp
                        .push_right(pt_r2, hit_r[1], hit_r[2], residual_r, hw_r, dd_r);
                } else {
                    self.warp.push_right(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
                }
                self.warp.n += 1;
            }
        }
        self.warp.pad_to_lane();

        ResEval {
            energy,
            num_terms,
            flow_t: shift_t / (shift_num + 0.1),
            flow_rt: shift_rt / (shift_num + 0.1),
            saturated: num_saturated as Float / num_terms as Float,
        }
    }

    // Hessian assembly ##################################################

    /// Scale vector of the mono system.
    fn scale_vec8(&self) -> Vec8d {
        let s = &self.settings.scales;
        Vec8d::from_row_slice(&[
            f64::from(s.xi_rot),
            f64::from(s.xi_rot),
            f64::from(s.xi_rot),
            f64::from(s.xi_trans),
            f64::from(s.xi_trans),
            f64::from(s.xi_trans),
            f64::from(s.a),
            f64::from(s.b),
        ])
    }

    /// Scale vector of the stereo system.
    pub(crate) fn scale_vec10(&self) -> Vec10d {
        let s8 = self.scale_vec8();
        let s = &self.settings.scales;
        let mut out = Vec10d::zeros();
        out.fixed_rows_mut::<8>(0).copy_from(&s8);
        out[8] = f64::from(s.a);
        out[9] = f64::from(s.b);
        out
    }

    /// Build the normalized, scale-applied 8-D mono system from the warp
    /// buffers.
    pub(crate) fn calc_gs(
        &mut self,
        lvl: usize,
        new_frame: &FrameData,
        aff_g2l: AffLight,
    ) -> (Mat8d, Vec8d) {
        let reference = self.reference.expect("tracking reference not set");
        self.acc9.initialize();

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
        let one = F32x4::splat(1.0);
        let minus_one = F32x4::splat(-1.0);

        let n = self.warp.n;
        debug_assert_eq!(n % 4, 0);
        for i in 0..n / 4 {
            let dx = self.warp.dx.lane(i) * fxl;
            let dy = self.warp.dy.lane(i) * fyl;
            let u = self.warp.u.lane(i);
            let v = self.warp.v.lane(i);
            let id = self.warp.idepth.lane(i);

            let rows = [
                id * dx,
                id * dy,
                -(id * (u * dx + v * dy)),
                -(u * v * dx + dy * (one + v * v)),
                u * v * dy + dx * (one + u * u),
                u * dy - v * dx,
                a * (b0 - self.warp.ref_color.lane(i)),
                minus_one,
                self.warp.residual.lane(i),
            ];
            self.acc9.update_weighted(&rows, self.warp.weight.lane(i));
        }

        let h9 = self.acc9.finish();
        let inv_n = 1.0 / n as f64;
        let mut h_out = Mat8d::zeros();
        let mut b_out = Vec8d::zeros();
        for r in 0..8 {
            for c in 0..8 {
                h_out[(r, c)] = f64::from(h9[(r, c)]) * inv_n;
            }
            b_out[r] = f64::from(h9[(r, 8)]) * inv_n;
        }

        let s = self.scale_vec8();
        for r in 0..8 {
            for c in 0..8 {
                h_out[(r, c)] *= s[r] * s[c];
            }
            b_out[r] *= s[r];
        }
        (h_out, b_out)
    }

    /// Build the normalized, scale-applied 10-D stereo system.
    pub(crate) fn calc_gs_stereo(
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

            let rows = [
                id * dx,
                id * dy,
                -(id * (u * dx + v * dy)),
                -(u * v * dx + dy * (one + v * v)),
                u * v * dy + dx * (one + u * u),
                u * dy - v * dx,
                a * (b0 - self.warp.ref_color.lane(i)),
                minus_one,
                zero,
                zero,
                self.warp.residual.lane(i),
            ];
            self.acc11.update_weighted(&rows, self.warp.weight.lane(i));

            let dx_r = self.warp.idepth_r.lane(i) * self.warp.dx_r.lane(i) * fxl;
            let dy_r = self.warp.idepth_r.lane(i) * self.warp.dy_r.lane(i) * fyl;
            let rows_r = [
                id * dx_r,
                id * dy_r,
                -(id * (u * dx_r + v * dy_r)),
                -(u * v * dx_r + dy_r * (one + v * v)),
                u * v * dy_r + dx_r * (one + u * u),
                u * dy_r - v * dx_r,
                zero,
                zero,
                a_r * (b0 - self.warp.ref_color.lane(i)),
                minus_one,
                self.warp.residual_r.lane(i),
            ];
            self.acc11
                .update_weighted(&rows_r, self.warp.weight_r.lane(i));
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

    // Solver ############################################################

    /// Track a new monocular frame against the reference keyframe.
    pub fn track_newest(
        &mut self,
        new_frame: &FrameData,
        guess: TrackingGuess,
        coarsest_lvl: usize,
        min_res_for_abort: [Float; MAX_PYR_LEVELS],
    ) -> Result<TrackingResult, TrackingError> {
        assert!(coarsest_lvl < self.cam.levels);

        self.last_residuals = [Float::NAN; MAX_PYR_LEVELS];
        self.last_flow_indicators = Vec3::new(1000.0, 1000.0, 1000.0);

        let mut pose = guess.pose;
        let mut aff = guess.aff_g2l;
        let mut diagnostics = TrackingDiagnostics::default();
        let mut have_repeated = false;

        let mut lvl = coarsest_lvl as i64;
        while lvl >= 0 {
            let l = lvl as usize;
            let mut level_cutoff_repeat: Float = 1.0;
            let mut res_old = self.calc_res(
                l,
                new_frame,
                &pose,
                aff,
                self.settings.coarse_cutoff_th * level_cutoff_repeat,
            );
            while res_old.saturated > 0.6 && level_cutoff_repeat < 50.0 {
                level_cutoff_repeat *= 2.0;
                diagnostics.cutoff_escalations += 1;
                res_old = self.calc_res(
                    l,
                    new_frame,
                    &pose,
                    aff,
                    self.settings.coarse_cutoff_th * level_cutoff_repeat,
                );
                if !self.settings.debugout_runquiet {
                    info!(
                        "INCREASING cutoff to {} (ratio is {})!",
                        self.settings.coarse_cutoff_th * level_cutoff_repeat,
                        res_old.saturated
                    );
                }
            }

            let (mut h, mut b) = self.calc_gs(l, new_frame, aff);
            let mut lambda = 0.01;

            for _iteration in 0..MAX_ITERATIONS[l] {
                let mut hl = h;
                for i in 0..8 {
                    hl[(i, i)] *= 1.0 + lambda;
                }
                let mut inc = self.solve_mono(&hl, &b);

                let extrap_fac = if lambda < LAMBDA_EXTRAPOLATION_LIMIT {
                    (LAMBDA_EXTRAPOLATION_LIMIT / lambda).sqrt().sqrt()
                } else {
                    1.0
                };
                inc *= extrap_fac;

                let s = self.scale_vec8();
                let mut inc_scaled = inc;
                for i in 0..8 {
                    inc_scaled[i] *= s[i];
                }
                if !inc_scaled.iter().all(|v| v.is_finite()) {
                    inc_scaled = Vec8d::zeros();
                }

                let pose_new = se3::exp(inc_scaled.fixed_rows::<6>(0).into_owned()) * pose;
                let aff_new = AffLight::new(
                    aff.a + inc_scaled[6] as Float,
                    aff.b + inc_scaled[7] as Float,
                );

                let res_new = self.calc_res(
                    l,
                    new_frame,
                    &pose_new,
                    aff_new,
                    self.settings.coarse_cutoff_th * level_cutoff_repeat,
                );
                let accept = res_new.mean() < res_old.mean();
                diagnostics.iterations += 1;

                if accept {
                    let gs = self.calc_gs(l, new_frame, aff_new);
                    h = gs.0;
                    b = gs.1;
                    res_old = res_new;
                    aff = aff_new;
                    pose = pose_new;
                    lambda *= 0.5;
                } else {
                    lambda *= 4.0;
                    if lambda < LAMBDA_EXTRAPOLATION_LIMIT {
                        lambda = LAMBDA_EXTRAPOLATION_LIMIT;
                    }
                }

                if !(inc.norm() > 1e-3) {
                    break;
                }
            }

            self.last_residuals[l] = res_old.mean().sqrt() as Float;
            self.last_flow_indicators = Vec3::new(res_old.flow_t, 0.0, res_old.flow_rt);
            if self.last_residuals[l] > 1.5 * min_res_for_abort[l] {
                return Err(TrackingError::ResidualAboveAbort {
                    level: l,
                    rmse: self.last_residuals[l],
                });
            }

            if level_cutoff_repeat > 1.0 && !have_repeated {
                have_repeated = true;
                diagnostics.repeated_level = true;
                info!("REPEAT LEVEL!");
            } else {
                lvl -= 1;
            }
        }

        self.validate_affine(&mut aff, new_frame.exposure)?;

        Ok(TrackingResult {
            pose,
            aff_g2l: aff,
            aff_g2l_r: guess.aff_g2l_r,
            last_residuals: self.last_residuals,
            flow: self.last_flow_indicators,
            diagnostics,
        })
    }

    /// Track a new stereo pair against the reference keyframe.
    pub fn track_newest_stereo(
        &mut self,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        guess: TrackingGuess,
        coarsest_lvl: usize,
        min_res_for_abort: [Float; MAX_PYR_LEVELS],
    ) -> Result<TrackingResult, TrackingError> {
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

        self.validate_affine(&mut aff, new_frame.exposure)?;
        if self.settings.affine_opt_mode_a.is_fixed() {
            aff_r.a = 0.0;
        }
        if self.settings.affine_opt_mode_b.is_fixed() {
            aff_r.b = 0.0;
        }

        Ok(TrackingResult {
            pose,
            aff_g2l: aff,
            aff_g2l_r: aff_r,
            last_residuals: self.last_residuals,
            flow: self.last_flow_indicators,
            diagnostics,
        })
    }

    /// Coarse-to-fine LM refinement of the stereo photometric cost,
    /// shared by the pure-stereo and the inertial tracking paths.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn refine_stereo_pyramid(
        &mut self,
        new_frame: &FrameData,
        new_frame_right: &FrameData,
        pose: &mut Iso3,
        aff: &mut AffLight,
        aff_r: &mut AffLight,
        coarsest_lvl: usize,
        min_res_for_abort: [Float; MAX_PYR_LEVELS],
        diagnostics: &mut TrackingDiagnostics,
    ) -> Result<(), TrackingError> {
        assert!(coarsest_lvl < self.cam.levels);

        self.last_residuals = [Float::NAN; MAX_PYR_LEVELS];
        self.last_flow_indicators = Vec3::new(1000.0, 1000.0, 1000.0);
        let mut have_repeated = false;

        let mut lvl = coarsest_lvl as i64;
        while lvl >= 0 {
            let l = lvl as usize;
            let mut level_cutoff_repeat: Float = 1.0;
            let mut res_old = self.calc_res_stereo(
                l,
                new_frame,
                new_frame_right,
                pose,
                *aff,
                *aff_r,
                self.settings.coarse_cutoff_th * level_cutoff_repeat,
            );
            while res_old.saturated > 0.6 && level_cutoff_repeat < 50.0 {
                level_cutoff_repeat *= 2.0;
                diagnostics.cutoff_escalations += 1;
                res_old = self.calc_res_stereo(
                    l,
                    new_frame,
                    new_frame_right,
                    pose,
                    *aff,
                    *aff_r,
                    self.settings.coarse_cutoff_th * level_cutoff_repeat,
                );
                if !self.settings.debugout_runquiet {
                    info!(
                        "INCREASING cutoff to {} (ratio is {})!",
                        self.settings.coarse_cutoff_th * level_cutoff_repeat,
                        res_old.saturated
                    );
                }
            }

            let (mut h, mut b) =
                self.calc_gs_stereo(l, new_frame, new_frame_right, *aff, *aff_r);
            let mut lambda = 0.01;

            for _iteration in 0..MAX_ITERATIONS[l] {
                let mut hl = h;
                for i in 0..10 {
                    hl[(i, i)] *= 1.0 + lambda;
                }
                let mut inc = self.solve_stereo(&hl, &b);

                let extrap_fac = if lambda < LAMBDA_EXTRAPOLATION_LIMIT {
                    (LAMBDA_EXTRAPOLATION_LIMIT / lambda).sqrt().sqrt()
                } else {
                    1.0
                };
                inc *= extrap_fac;

                let s = self.scale_vec10();
                let mut inc_scaled = inc;
                for i in 0..10 {
                    inc_scaled[i] *= s[i];
                }
                if !inc_scaled.iter().all(|v| v.is_finite()) {
                    inc_scaled = Vec10d::zeros();
                }

                let pose_new = se3::exp(inc_scaled.fixed_rows::<6>(0).into_owned()) * *pose;
                let aff_new = AffLight::new(
                    aff.a + inc_scaled[6] as Float,
                    aff.b + inc_scaled[7] as Float,
                );
                let aff_r_new = AffLight::new(
                    aff_r.a + inc_scaled[8] as Float,
                    aff_r.b + inc_scaled[9] as Float,
                );

                let res_new = self.calc_res_stereo(
                    l,
                    new_frame,
                    new_frame_right,
                    &pose_new,
                    aff_new,
                    aff_r_new,
                    self.settings.coarse_cutoff_th * level_cutoff_repeat,
                );
                let accept = res_new.mean() < res_old.mean();
                diagnostics.iterations += 1;

                if accept {
                    let gs =
                        self.calc_gs_stereo(l, new_frame, new_frame_right, aff_new, aff_r_new);
                    h = gs.0;
                    b = gs.1;
                    res_old = res_new;
                    *aff = aff_new;
                    *aff_r = aff_r_new;
                    *pose = pose_new;
                    lambda *= 0.5;
                } else {
                    lambda *= 4.0;
                    if lambda < LAMBDA_EXTRAPOLATION_LIMIT {
                        lambda = LAMBDA_EXTRAPOLATION_LIMIT;
                    }
                }

                if !(inc.norm() > 1e-3) {
                    break;
                }
            }

            self.last_residuals[l] = res_old.mean().sqrt() as Float;
            self.last_flow_indicators = Vec3::new(res_old.flow_t, 0.0, res_old.flow_rt);
            if self.last_residuals[l] > 1.5 * min_res_for_abort[l] {
                return Err(TrackingError::ResidualAboveAbort {
                    level: l,
                    rmse: self.last_residuals[l],
                });
            }

            if level_cutoff_repeat > 1.0 && !have_repeated {
                have_repeated = true;
                diagnostics.repeated_level = true;
                info!("REPEAT LEVEL!");
            } else {
                lvl -= 1;
            }
        }
        Ok(())
    }

    /// Reduced or full solve of the damped mono system, depending on the
    /// affine optimization modes.
    fn solve_mono(&self, hl: &Mat8d, b: &Vec8d) -> Vec8d {
        let fix_a = self.settings.affine_opt_mode_a.is_fixed();
        let fix_b = self.settings.affine_opt_mode_b.is_fixed();
        if fix_a && fix_b {
            solve_reduced::<8, 6>(hl, b, [0, 1, 2, 3, 4, 5])
        } else if fix_b {
            solve_reduced::<8, 7>(hl, b, [0, 1, 2, 3, 4, 5, 6])
        } else if fix_a {
            solve_reduced::<8, 7>(hl, b, [0, 1, 2, 3, 4, 5, 7])
        } else {
            solve_reduced::<8, 8>(hl, b, [0, 1, 2, 3, 4, 5, 6, 7])
        }
        .unwrap_or_else(Vec8d::zeros)
    }

    /// Reduced or full solve of the damped stereo system. Fixing `a` (or
    /// `b`) eliminates both the left and right slot of that variable.
    fn solve_stereo(&self, hl: &Mat10d, b: &Vec10d) -> Vec10d {
        let fix_a = self.settings.affine_opt_mode_a.is_fixed();
        let fix_b = self.settings.affine_opt_mode_b.is_fixed();
        if fix_a && fix_b {
            solve_reduced::<10, 6>(hl, b, [0, 1, 2, 3, 4, 5])
        } else if fix_b {
            solve_reduced::<10, 8>(hl, b, [0, 1, 2, 3, 4, 5, 6, 8])
        } else if fix_a {
            solve_reduced::<10, 8>(hl, b, [0, 1, 2, 3, 4, 5, 7, 9])
        } else {
            solve_reduced::<10, 10>(hl, b, [0, 1, 2, 3, 4, 5, 6, 7, 8, 9])
        }
        .unwrap_or_else(Vec10d::zeros)
    }

    /// Final affine sanity checks shared by all tracking paths.
    pub(crate) fn validate_affine(
        &self,
        aff: &mut AffLight,
        new_exposure: Float,
    ) -> Result<(), TrackingError> {
        let reference = self.reference.expect("tracking reference not set");
        let mode_a = self.settings.affine_opt_mode_a;
        let mode_b = self.settings.affine_opt_mode_b;

        if (!mode_a.is_free() && aff.a.abs() > 1.2) || (!mode_b.is_free() && aff.b.abs() > 200.0) {
            return Err(TrackingError::AffineOutOfBounds);
        }

        let rel_aff =
            AffLight::from_to_exposure(reference.exposure, new_exposure, reference.aff_g2l, *aff);
        if (mode_a.is_free() && rel_aff[0].ln().abs() > 1.5)
            || (mode_b.is_free() && rel_aff[1].abs() > 200.0)
        {
            return Err(TrackingError::RelativeAffineOutOfBounds);
        }

        if mode_a.is_fixed() {
            aff.a = 0.0;
        }
        if mode_b.is_fixed() {
            aff.b = 0.0;
        }
        Ok(())
    }
}

/// Solve the sub-system over the selected variable indices and scatter the
/// solution back into a full-size step (eliminated slots stay zero).
fn solve_reduced<const D: usize, const R: usize>(
    h: &SMatrix<f64, D, D>,
    b: &SVector<f64, D>,
    idx: [usize; R],
) -> Option<SVector<f64, D>> {
    let mut hr = SMatrix::<f64, R, R>::zeros();
    let mut br = SVector::<f64, R>::zeros();
    for i in 0..R {
        for j in 0..R {
            hr[(i, j)] = h[(idx[i], idx[j])];
        }
        br[i] = b[idx[i]];
    }
    let sol = hr.cholesky()?.solve(&-br);
    let mut inc = SVector::<f64, D>::zeros();
    for i in 0..R {
        inc[idx[i]] = sol[i];
    }
    Some(inc)
}

// TESTS #############################################################
