// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dense, dilated inverse-depth pyramid of the reference keyframe.
//!
//! Sparse points are splatted into a weighted level-0 inverse-depth image,
//! downsampled by 2x2 accumulation, dilated to fill holes, then normalized
//! and compacted into per-level point clouds used by the warper.

use crate::core::camera::{CameraPyramid, MAX_PYR_LEVELS};
use crate::core::frame::{Dip, FrameId, HostFrame, KeyframePoint, ResState};
use crate::math::simd::LaneBuffer;
use crate::misc::type_aliases::Float;

/// Weight of a splatted point, emphasizing well-constrained inverse depths.
#[inline]
fn splat_weight(hdi_f: Float) -> Float {
    (1e-3 / (hdi_f + 1e-12)).sqrt()
}

/// The tracker-owned depth pyramid. All buffers are allocated once at
/// construction and sized by the level-0 dimensions.
pub struct DepthPyramid {
    levels: usize,
    w: [usize; MAX_PYR_LEVELS],
    h: [usize; MAX_PYR_LEVELS],
    idepth: Vec<Vec<Float>>,
    weight_sums: Vec<Vec<Float>>,
    weight_sums_bak: Vec<Vec<Float>>,
    pc_u: Vec<LaneBuffer>,
    pc_v: Vec<LaneBuffer>,
    pc_idepth: Vec<LaneBuffer>,
    pc_color: Vec<LaneBuffer>,
    pc_n: [usize; MAX_PYR_LEVELS],
}

impl DepthPyramid {
    pub fn new(cam: &CameraPyramid) -> Self {
        let levels = cam.levels;
        let mut idepth = Vec::with_capacity(levels);
        let mut weight_sums = Vec::with_capacity(levels);
        let mut weight_sums_bak = Vec::with_capacity(levels);
        let mut pc_u = Vec::with_capacity(levels);
        let mut pc_v = Vec::with_capacity(levels);
        let mut pc_idepth = Vec::with_capacity(levels);
        let mut pc_color = Vec::with_capacity(levels);
        for level in 0..levels {
            let size = cam.w[level] * cam.h[level];
            idepth.push(vec![0.0; size]);
            weight_sums.push(vec![0.0; size]);
            weight_sums_bak.push(vec![0.0; size]);
            pc_u.push(LaneBuffer::zeros(size));
            pc_v.push(LaneBuffer::zeros(size));
            pc_idepth.push(LaneBuffer::zeros(size));
            pc_color.push(LaneBuffer::zeros(size));
        }
        DepthPyramid {
            levels,
            w: cam.w,
            h: cam.h,
            idepth,
            weight_sums,
            weight_sums_bak,
            pc_u,
            pc_v,
            pc_idepth,
            pc_color,
            pc_n: [0; MAX_PYR_LEVELS],
        }
    }

    /// Rebuild the pyramid from the active points of all host keyframes.
    ///
    /// Only points whose last residual targets the reference (`ref_id`)
    /// with state [`ResState::In`] contribute, splatted at their projected
    /// center. Idempotent on identical inputs.
    pub fn make(&mut self, hosts: &[HostFrame], ref_id: FrameId, ref_dip: &[Vec<Dip>]) {
        self.clear_level0();
        let (w0, h0) = (self.w[0], self.h[0]);
        for host in hosts {
            for point in host.points {
                if point.status != ResState::In || point.target_id != ref_id {
                    continue;
                }
                let u = (point.center_projected[0] + 0.5) as usize;
                let v = (point.center_projected[1] + 0.5) as usize;
                if u >= w0 || v >= h0 {
                    continue;
                }
                let weight = splat_weight(point.hdi_f);
                self.idepth[0][u + w0 * v] += point.center_projected[2] * weight;
                self.weight_sums[0][u + w0 * v] += weight;
            }
        }
        self.finish_pyramid(ref_dip);
    }

    /// First-frame variant: splat every point at its raw `(u, v, idepth)`
    /// without the residual-status filter.
    pub fn make_for_first_frame(&mut self, points: &[KeyframePoint], ref_dip: &[Vec<Dip>]) {
        self.clear_level0();
        let (w0, h0) = (self.w[0], self.h[0]);
        for point in points {
            let u = (point.u + 0.5) as usize;
            let v = (point.v + 0.5) as usize;
            if u >= w0 || v >= h0 {
                continue;
            }
            let weight = splat_weight(point.hdi_f);
            self.idepth[0][u + w0 * v] += point.idepth * weight;
            self.weight_sums[0][u + w0 * v] += weight;
        }
        self.finish_pyramid(ref_dip);
    }

    fn clear_level0(&mut self) {
        self.idepth[0].fill(0.0);
        self.weight_sums[0].fill(0.0);
    }

    fn finish_pyramid(&mut self, ref_dip: &[Vec<Dip>]) {
        self.downsample();
        for level in 0..self.levels.min(2) {
            self.dilate_diagonal(level);
        }
        for level in 2..self.levels {
            self.dilate_cross(level);
        }
        self.normalize_and_compact(ref_dip);
    }

    /// Each coarser pixel is the plain sum of its 2x2 parent block, on
    /// both the weighted inverse depths and the weights. Normalization is
    /// deferred to the final pass.
    fn downsample(&mut self) {
        for level in 1..self.levels {
            let (wl, hl) = (self.w[level], self.h[level]);
            let wlm1 = self.w[level - 1];
            let (fine, coarse) = self.idepth.split_at_mut(level);
            let (fine_ws, coarse_ws) = self.weight_sums.split_at_mut(level);
            let src = &fine[level - 1];
            let src_ws = &fine_ws[level - 1];
            let dst = &mut coarse[0];
            let dst_ws = &mut coarse_ws[0];
            for y in 0..hl {
                for x in 0..wl {
                    let bidx = 2 * x + 2 * y * wlm1;
                    dst[x + y * wl] =
                        src[bidx] + src[bidx + 1] + src[bidx + wlm1] + src[bidx + wlm1 + 1];
                    dst_ws[x + y * wl] = src_ws[bidx]
                        + src_ws[bidx + 1]
                        + src_ws[bidx + wlm1]
                        + src_ws[bidx + wlm1 + 1];
                }
            }
        }
    }

    /// One dilation pass over the four diagonal neighbours, used at the
    /// two finest levels.
    ///
    /// Neighbour weights are read from an immutable snapshot so that
    /// writes within the pass never influence subsequent reads; neighbour
    /// inverse depths may be read live because only pixels with snapshot
    /// weight <= 0 are written, and those never pass the > 0 gate.
    fn dilate_diagonal(&mut self, level: usize) {
        let wl = self.w[level];
        let end = self.w[level] * self.h[level] - wl;
        self.weight_sums_bak[level].copy_from_slice(&self.weight_sums[level]);
        let bak = std::mem::take(&mut self.weight_sums_bak[level]);
        {
            let idepth = &mut self.idepth[level];
            let ws = &mut self.weight_sums[level];
            for i in wl..end {
                if bak[i] > 0.0 {
                    continue;
                }
                let mut sum = 0.0;
                let mut num = 0.0;
                let mut numn = 0.0;
                for j in [i + 1 + wl, i - 1 - wl, i + wl - 1, i - wl + 1] {
                    if bak[j] > 0.0 {
                        sum += idepth[j];
                        num += bak[j];
                        numn += 1.0;
                    }
                }
                if numn > 0.0 {
                    idepth[i] = sum / numn;
                    ws[i] = num / numn;
                }
            }
        }
        self.weight_sums_bak[level] = bak;
    }

    /// One dilation pass over the axis-aligned cross, used at the coarser
    /// levels. Same snapshot rule as [`Self::dilate_diagonal`].
    fn dilate_cross(&mut self, level: usize) {
        let wl = self.w[level];
        let end = self.w[level] * self.h[level] - wl;
        self.weight_sums_bak[level].copy_from_slice(&self.weight_sums[level]);
        let bak = std::mem::take(&mut self.weight_sums_bak[level]);
        {
            let idepth = &mut self.idepth[level];
            let ws = &mut self.weight_sums[level];
            for i in wl..end {
                if bak[i] > 0.0 {
                    continue;
                }
                let mut sum = 0.0;
                let mut num = 0.0;
                let mut numn = 0.0;
                for j in [i + 1, i - 1, i + wl, i - wl] {
                    if bak[j] > 0.0 {
                        sum += idepth[j];
                        num += bak[j];
                        numn += 1.0;
                    }
                }
                if numn > 0.0 {
                    idepth[i] = sum / numn;
                    ws[i] = num / numn;
                }
            }
        }
        self.weight_sums_bak[level] = bak;
    }

    /// Normalize the weighted sums inside a 2-pixel border and compact the
    /// valid pixels into the per-level point clouds. Entries with a
    /// non-finite reference color or a non-positive inverse depth are
    /// dropped and marked with `idepth = -1`; weights are forced to 1.
    fn normalize_and_compact(&mut self, ref_dip: &[Vec<Dip>]) {
        for level in 0..self.levels {
            let (wl, hl) = (self.w[level], self.h[level]);
            let dip = &ref_dip[level];
            let idepth = &mut self.idepth[level];
            let ws = &mut self.weight_sums[level];
            let pc_u = self.pc_u[level].as_mut_slice();
            let pc_v = self.pc_v[level].as_mut_slice();
            let pc_idepth = self.pc_idepth[level].as_mut_slice();
            let pc_color = self.pc_color[level].as_mut_slice();

            let mut n = 0;
            for y in 2..hl - 2 {
                for x in 2..wl - 2 {
                    let i = x + y * wl;
                    if ws[i] > 0.0 {
                        idepth[i] /= ws[i];
                        pc_u[n] = x as Float;
                        pc_v[n] = y as Float;
                        pc_idepth[n] = idepth[i];
                        pc_color[n] = dip[i][0];
                        if !pc_color[n].is_finite() || !(idepth[i] > 0.0) {
                            idepth[i] = -1.0;
                        } else {
                            n += 1;
                        }
                    } else {
                        idepth[i] = -1.0;
                    }
                    ws[i] = 1.0;
                }
            }
            self.pc_n[level] = n;
        }
    }

    #[inline]
    pub fn levels(&self) -> usize {
        self.levels
    }

    #[inline]
    pub fn pc_n(&self, level: usize) -> usize {
        self.pc_n[level]
    }

    #[inline]
    pub fn pc(&self, level: usize) -> (&[Float], &[Float], &[Float], &[Float]) {
        let n = self.pc_n[level];
        (
            &self.pc_u[level].as_slice()[..n],
            &self.pc_v[level].as_slice()[..n],
            &self.pc_idepth[level].as_slice()[..n],
            &self.pc_color[level].as_slice()[..n],
        )
    }

    /// Normalized inverse-depth image of a level (invalid pixels are -1).
    #[inline]
    pub fn idepth(&self, level: usize) -> &[Float] {
        &self.idepth[level]
    }

    #[cfg(test)]
    pub(crate) fn weight_sums(&self, level: usize) -> &[Float] {
        &self.weight_sums[level]
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::core::camera::Calibration;
    use crate::core::frame::FrameData;

    fn setup(width: usize, height: usize, levels: usize) -> (CameraPyramid, FrameData) {
        let cam = CameraPyramid::make(
            &Calibration {
                fx: 100.0,
                fy: 100.0,
                cx: width as Float / 2.0 - 0.5,
                cy: height as Float / 2.0 - 0.5,
                width,
                height,
                baseline: 0.0,
            },
            levels,
        );
        let img: Vec<Float> = (0..width * height).map(|i| 50.0 + (i % 7) as Float).collect();
        let frame = FrameData::from_image(&img, width, height, levels);
        (cam, frame)
    }

    fn point_at(u: Float, v: Float, idepth: Float) -> KeyframePoint {
        KeyframePoint {
            u,
            v,
            idepth,
            hdi_f: 1e-3,
            status: ResState::In,
            target_id: 0,
            center_projected: [u, v, idepth],
        }
    }

    #[test]
    fn dilation_fills_diagonal_neighbours_only() {
        let (cam, frame) = setup(32, 32, 1);
        let mut pyr = DepthPyramid::new(&cam);
        pyr.make_for_first_frame(&[point_at(16.0, 16.0, 0.5)], &frame.dip);

        let w = 32;
        let center = 16 + 16 * w;
        let idepth = pyr.idepth(0);
        assert!((idepth[center] - 0.5).abs() < 1e-6);
        for diag in [center + 1 + w, center - 1 - w, center + w - 1, center - w + 1] {
            assert!((idepth[diag] - 0.5).abs() < 1e-6, "diagonal not filled");
        }
        // Direct 4-neighbours stay invalid (marked -1 by normalization).
        for cross in [center + 1, center - 1, center + w, center - w] {
            assert_eq!(idepth[cross], -1.0, "cross neighbour must stay empty");
        }
    }

    #[test]
    fn make_is_idempotent() {
        let (cam, frame) = setup(64, 48, 3);
        let mut pyr = DepthPyramid::new(&cam);
        let points: Vec<KeyframePoint> = (0..40)
            .map(|i| point_at(5.0 + (i % 8) as Float * 7.0, 6.0 + (i / 8) as Float * 9.0, 0.3))
            .collect();
        let hosts = [HostFrame {
            frame: &frame,
            points: &points,
        }];

        pyr.make(&hosts, 0, &frame.dip);
        let first: Vec<Vec<Float>> = (0..3)
            .map(|l| {
                let (u, v, id, c) = pyr.pc(l);
                u.iter().chain(v).chain(id).chain(c).copied().collect()
            })
            .collect();
        let n_first: Vec<usize> = (0..3).map(|l| pyr.pc_n(l)).collect();

        pyr.make(&hosts, 0, &frame.dip);
        for l in 0..3 {
            assert_eq!(pyr.pc_n(l), n_first[l]);
            let (u, v, id, c) = pyr.pc(l);
            let again: Vec<Float> = u.iter().chain(v).chain(id).chain(c).copied().collect();
            assert_eq!(again, first[l]);
        }
    }

    #[test]
    fn pc_entries_are_valid() {
        let (cam, frame) = setup(64, 48, 3);
        let mut pyr = DepthPyramid::new(&cam);
        let points: Vec<KeyframePoint> = (0..60)
            .map(|i| point_at(4.0 + (i % 10) as Float * 5.0, 4.0 + (i / 10) as Float * 7.0, 0.8))
            .collect();
        pyr.make_for_first_frame(&points, &frame.dip);
        for l in 0..3 {
            let (_, _, id, c) = pyr.pc(l);
            assert!(pyr.pc_n(l) > 0);
            for k in 0..pyr.pc_n(l) {
                assert!(id[k] > 0.0 && id[k].is_finite());
                assert!(c[k].is_finite());
            }
        }
    }

    #[test]
    fn dilation_is_noop_on_dense_weights() {
        let (cam, frame) = setup(32, 32, 1);
        let mut pyr = DepthPyramid::new(&cam);
        // Cover every interior pixel so weight sums are dense after splat.
        let points: Vec<KeyframePoint> = (0..32 * 32)
            .map(|i| point_at((i % 32) as Float, (i / 32) as Float, 0.4))
            .collect();
        pyr.make_for_first_frame(&points, &frame.dip);

        let before = pyr.idepth(0).to_vec();
        let ws_before = pyr.weight_sums(0).to_vec();
        pyr.dilate_diagonal(0);
        assert_eq!(pyr.idepth(0), &before[..]);
        assert_eq!(pyr.weight_sums(0), &ws_before[..]);
    }

    #[test]
    fn splat_filters_on_residual_state() {
        let (cam, frame) = setup(32, 32, 1);
        let mut pyr = DepthPyramid::new(&cam);
        let mut outlier = point_at(10.0, 10.0, 0.5);
        outlier.status = ResState::Outlier;
        let mut wrong_target = point_at(20.0, 20.0, 0.5);
        wrong_target.target_id = 7;
        let hosts = [HostFrame {
            frame: &frame,
            points: &[outlier, wrong_target],
        }];
        pyr.make(&hosts, 0, &frame.dip);
        assert_eq!(pyr.pc_n(0), 0);
    }
}
