// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Frame and keyframe data model.
//!
//! A frame carries, per pyramid level, a dense array of
//! `(intensity, dx, dy)` records (the image-pyramid provider contract),
//! plus its photometric and inertial state. Frames are borrowed by the
//! tracker per call; the tracker never stores a reference to one.

use crate::misc::type_aliases::{Float, Iso3, SpeedAndBias, Vec3};

/// One dense pyramid sample: linearized radiance and its x/y gradients.
pub type Dip = [Float; 3];

/// Identifier of a frame in the surrounding system.
pub type FrameId = u32;

/// State of a point-frame residual.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum ResState {
    /// Inlier; contributes to the depth splat and the Hessian.
    #[default]
    In,
    /// Projects outside the valid pyramid area.
    Oob,
    /// Energy above the frame threshold; clamped and excluded.
    Outlier,
}

/// Affine illumination parameters, mapping a reference intensity `c` to
/// its prediction in the target as `exp(a) * c + b` (in exposure-relative
/// form, see [`AffLight::from_to_exposure`]).
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct AffLight {
    pub a: Float,
    pub b: Float,
}

impl AffLight {
    pub fn new(a: Float, b: Float) -> Self {
        AffLight { a, b }
    }

    /// Relative affine mapping from a reference frame to a target frame,
    /// accounting for their exposure times. Non-positive exposures are
    /// treated as 1.
    pub fn from_to_exposure(
        exposure_ref: Float,
        exposure_new: Float,
        g2l_ref: AffLight,
        g2l_new: AffLight,
    ) -> [Float; 2] {
        let exposure_ref = if exposure_ref > 0.0 { exposure_ref } else { 1.0 };
        let exposure_new = if exposure_new > 0.0 { exposure_new } else { 1.0 };
        let a = (exposure_new * g2l_new.a.exp()) / (exposure_ref * g2l_ref.a.exp());
        let b = g2l_new.b - a * g2l_ref.b;
        [a, b]
    }
}

/// A frame as seen by the tracker.
pub struct FrameData {
    pub id: FrameId,
    pub timestamp: f64,
    /// Exposure time in ms; non-positive means unknown.
    pub exposure: Float,
    pub aff_g2l: AffLight,
    pub aff_g2l_r: AffLight,
    /// World-to-camera pose at the evaluation point.
    pub world_to_cam: Iso3,
    pub speed_and_bias: SpeedAndBias,
    /// Per-level dense `(intensity, dx, dy)` arrays, length `w_l * h_l`.
    pub dip: Vec<Vec<Dip>>,
    pub width: usize,
    pub height: usize,
}

impl FrameData {
    /// Build a frame from a level-0 intensity image: 2x2 mean downsampling
    /// for the coarser levels, central-difference gradients everywhere
    /// (borders keep zero gradients and are never sampled).
    pub fn from_image(intensities: &[Float], width: usize, height: usize, levels: usize) -> Self {
        assert_eq!(intensities.len(), width * height);
        let mut images: Vec<Vec<Float>> = Vec::with_capacity(levels);
        images.push(intensities.to_vec());
        let mut wl = width;
        let mut hl = height;
        for _ in 1..levels {
            let prev = images.last().unwrap();
            let (whalf, hhalf) = (wl / 2, hl / 2);
            let mut half = vec![0.0; whalf * hhalf];
            for y in 0..hhalf {
                for x in 0..whalf {
                    let i = 2 * x + 2 * y * wl;
                    half[x + y * whalf] =
                        0.25 * (prev[i] + prev[i + 1] + prev[i + wl] + prev[i + wl + 1]);
                }
            }
            images.push(half);
            wl = whalf;
            hl = hhalf;
        }

        let mut dip = Vec::with_capacity(levels);
        wl = width;
        hl = height;
        for img in &images {
            let mut level = vec![[0.0; 3]; wl * hl];
            for y in 0..hl {
                for x in 0..wl {
                    let i = x + y * wl;
                    let dx = if x > 0 && x < wl - 1 {
                        0.5 * (img[i + 1] - img[i - 1])
                    } else {
                        0.0
                    };
                    let dy = if y > 0 && y < hl - 1 {
                        0.5 * (img[i + wl] - img[i - wl])
                    } else {
                        0.0
                    };
                    level[i] = [img[i], dx, dy];
                }
            }
            dip.push(level);
            wl /= 2;
            hl /= 2;
        }

        FrameData {
            id: 0,
            timestamp: 0.0,
            exposure: 1.0,
            aff_g2l: AffLight::default(),
            aff_g2l_r: AffLight::default(),
            world_to_cam: Iso3::identity(),
            speed_and_bias: SpeedAndBias::zeros(),
            dip,
            width,
            height,
        }
    }
}

/// Bilinear interpolation of the three-channel pyramid records.
///
/// The caller guarantees `1 <= x < w - 2` and a valid y range; the coarse
/// tracker enforces a 2-pixel border before sampling.
#[inline]
pub fn interpolate33(dip: &[Dip], x: Float, y: Float, w: usize) -> Vec3 {
    let ix = x as usize;
    let iy = y as usize;
    let dx = x - ix as Float;
    let dy = y - iy as Float;
    let dxdy = dx * dy;
    let i = ix + iy * w;

    let p00 = dip[i];
    let p10 = dip[i + 1];
    let p01 = dip[i + w];
    let p11 = dip[i + w + 1];

    let w00 = 1.0 - dx - dy + dxdy;
    let w10 = dx - dxdy;
    let w01 = dy - dxdy;
    let w11 = dxdy;

    Vec3::new(
        w00 * p00[0] + w10 * p10[0] + w01 * p01[0] + w11 * p11[0],
        w00 * p00[1] + w10 * p10[1] + w01 * p01[1] + w11 * p11[1],
        w00 * p00[2] + w10 * p10[2] + w01 * p01[2] + w11 * p11[2],
    )
}

/// A keyframe point as provided by the point source.
#[derive(Copy, Clone, Debug)]
pub struct KeyframePoint {
    pub u: Float,
    pub v: Float,
    pub idepth: Float,
    /// Inverse-depth information weight of the point.
    pub hdi_f: Float,
    /// State of the point's last residual.
    pub status: ResState,
    /// Target frame of the point's last residual.
    pub target_id: FrameId,
    /// Projection of the point center into that target: `(u, v, idepth)`.
    pub center_projected: [Float; 3],
}

/// A host keyframe together with its active points.
pub struct HostFrame<'a> {
    pub frame: &'a FrameData,
    pub points: &'a [KeyframePoint],
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn exposure_identity_gives_unit_affine() {
        let aff = AffLight::from_to_exposure(1.0, 1.0, AffLight::default(), AffLight::default());
        assert_eq!(aff, [1.0, 0.0]);
    }

    #[test]
    fn zero_exposure_treated_as_one() {
        let aff = AffLight::from_to_exposure(0.0, 0.0, AffLight::default(), AffLight::new(0.0, 3.0));
        assert_eq!(aff, [1.0, 3.0]);
    }

    #[test]
    fn interpolation_is_exact_on_grid() {
        let frame = FrameData::from_image(
            &(0..64).map(|i| i as Float).collect::<Vec<_>>(),
            8,
            8,
            1,
        );
        let sample = interpolate33(&frame.dip[0], 3.0, 2.0, 8);
        assert_eq!(sample[0], 19.0);
    }

    #[test]
    fn interpolation_midpoint() {
        let frame = FrameData::from_image(
            &(0..64).map(|i| (i % 8) as Float).collect::<Vec<_>>(),
            8,
            8,
            1,
        );
        // Linear ramp along x: midpoint sampling stays on the ramp.
        let sample = interpolate33(&frame.dip[0], 3.5, 3.0, 8);
        assert!((sample[0] - 3.5).abs() < 1e-6);
        assert!((sample[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn pyramid_halves_resolution() {
        let frame = FrameData::from_image(&vec![7.0; 64 * 32], 64, 32, 3);
        assert_eq!(frame.dip[0].len(), 64 * 32);
        assert_eq!(frame.dip[1].len(), 32 * 16);
        assert_eq!(frame.dip[2].len(), 16 * 8);
        assert_eq!(frame.dip[2][5][0], 7.0);
    }
}
