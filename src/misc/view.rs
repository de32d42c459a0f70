// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Rendering of the coarse inverse-depth map for visualization sinks.

use image::{Rgb, RgbImage};

use crate::core::frame::{Dip, FrameId};
use crate::core::track::CoarseTracker;
use crate::misc::colormap;
use crate::misc::helper::sorted_quantile;
use crate::misc::type_aliases::Float;

/// A visualization sink. Must be callable from the tracking thread
/// without blocking.
pub trait DepthMapSink {
    /// Receives the jet-mapped depth image over the reference intensities.
    fn push_depth_image(&mut self, image: &RgbImage);
    /// Receives the raw level-0 inverse-depth buffer (invalid pixels -1).
    fn push_depth_image_float(&mut self, idepth: &[Float], width: usize, height: usize);
}

impl CoarseTracker {
    /// Render the level-0 inverse-depth map with percentile normalization
    /// and push it to the sinks. `min_id`/`max_id` hold the adaptive
    /// display range across calls (negative values reset it).
    pub fn debug_plot_idepth_map(
        &self,
        ref_dip0: &[Dip],
        new_frame_id: FrameId,
        min_id: &mut Float,
        max_id: &mut Float,
        sinks: &mut [&mut dyn DepthMapSink],
    ) {
        let (w, h) = (self.cam.w[0], self.cam.h[0]);
        if self.cam.levels < 2 {
            return;
        }
        let idepth = self.depth_map().idepth(0);

        let mut all_id: Vec<Float> = idepth.iter().copied().filter(|&d| d > 0.0).collect();
        if all_id.is_empty() {
            return;
        }
        all_id.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mut min_new = sorted_quantile(&all_id, 0.05);
        let mut max_new = sorted_quantile(&all_id, 0.95);

        if *min_id < 0.0 || *max_id < 0.0 {
            *min_id = min_new;
            *max_id = max_new;
        } else {
            // Slowly adapt: change by at most 30% of the old span.
            let max_change = 0.3 * (*max_id - *min_id);
            min_new = min_new.clamp(*min_id - max_change, *min_id + max_change);
            max_new = max_new.clamp(*max_id - max_change, *max_id + max_change);
            *min_id = min_new;
            *max_id = max_new;
        }

        let mut image = RgbImage::new(w as u32, h as u32);
        for (i, dip) in ref_dip0.iter().enumerate() {
            let c = (dip[0] * 0.9).min(255.0) as u8;
            image.put_pixel((i % w) as u32, (i / w) as u32, Rgb([c, c, c]));
        }

        for y in 3..h - 3 {
            for x in 3..w - 3 {
                let idx = x + y * w;
                let mut sid = 0.0;
                let mut nid = 0.0;
                for j in [idx, idx + 1, idx - 1, idx + w, idx - w] {
                    if idepth[j] > 0.0 {
                        sid += idepth[j];
                        nid += 1.0;
                    }
                }
                if idepth[idx] > 0.0 || nid >= 3.0 {
                    let id_norm = (sid / nid - *min_id) / (*max_id - *min_id);
                    let (r, g, b) = colormap::jet(id_norm);
                    put_disc(&mut image, x, y, Rgb([r, g, b]));
                }
            }
        }

        for sink in sinks.iter_mut() {
            sink.push_depth_image(&image);
        }

        if self.settings.debug_save_images {
            if let Some(ref_id) = self.ref_frame_id() {
                let _ = std::fs::create_dir_all("images_out");
                let path = format!("images_out/predicted_{ref_id:05}_{new_frame_id:05}.png");
                let _ = image.save(path);
            }
        }
    }

    /// Push the raw float inverse-depth map of level 0 to the sinks.
    pub fn debug_plot_idepth_map_float(&self, sinks: &mut [&mut dyn DepthMapSink]) {
        let (w, h) = (self.cam.w[0], self.cam.h[0]);
        if self.cam.levels < 2 {
            return;
        }
        for sink in sinks.iter_mut() {
            sink.push_depth_image_float(self.depth_map().idepth(0), w, h);
        }
    }
}

/// Small filled disc around a pixel; the borders guarantee room.
fn put_disc(image: &mut RgbImage, x: usize, y: usize, color: Rgb<u8>) {
    for (dx, dy) in [
        (0i64, 0i64),
        (1, 0),
        (-1, 0),
        (0, 1),
        (0, -1),
        (1, 1),
        (1, -1),
        (-1, 1),
        (-1, -1),
    ] {
        image.put_pixel((x as i64 + dx) as u32, (y as i64 + dy) as u32, color);
    }
}

// TESTS #############################################################

#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::TrackerSettings;
    use crate::core::camera::Calibration;
    use crate::core::frame::{FrameData, HostFrame, KeyframePoint, ResState};

    struct CollectingSink {
        images: usize,
        floats: usize,
    }

    impl DepthMapSink for CollectingSink {
        fn push_depth_image(&mut self, _image: &RgbImage) {
            self.images += 1;
        }
        fn push_depth_image_float(&mut self, idepth: &[Float], width: usize, height: usize) {
            assert_eq!(idepth.len(), width * height);
            self.floats += 1;
        }
    }

    #[test]
    fn sinks_receive_rendered_maps() {
        let calib = Calibration {
            fx: 80.0,
            fy: 80.0,
            cx: 31.5,
            cy: 23.5,
            width: 64,
            height: 48,
            baseline: 0.0,
        };
        let mut tracker = CoarseTracker::new(&calib, 3, TrackerSettings::default());
        let img: Vec<Float> = (0..64 * 48).map(|i| (i % 97) as Float).collect();
        let frame = FrameData::from_image(&img, 64, 48, 3);
        let points: Vec<KeyframePoint> = (0..50)
            .map(|i| KeyframePoint {
                u: 6.0 + (i % 10) as Float * 5.0,
                v: 6.0 + (i / 10) as Float * 7.0,
                idepth: 0.5,
                hdi_f: 1e-3,
                status: ResState::In,
                target_id: 0,
                center_projected: [0.0; 3],
            })
            .collect();
        tracker.set_ref_for_first_frame(&HostFrame {
            frame: &frame,
            points: &points,
        });

        let mut sink = CollectingSink {
            images: 0,
            floats: 0,
        };
        let mut min_id = -1.0;
        let mut max_id = -1.0;
        {
            let mut sinks: [&mut dyn DepthMapSink; 1] = [&mut sink];
            tracker.debug_plot_idepth_map(&frame.dip[0], 1, &mut min_id, &mut max_id, &mut sinks);
        }
        {
            let mut sinks: [&mut dyn DepthMapSink; 1] = [&mut sink];
            tracker.debug_plot_idepth_map_float(&mut sinks);
        }
        assert_eq!(sink.images, 1);
        assert_eq!(sink.floats, 1);
        assert!(min_id > 0.0 && max_id >= min_id);
    }
}
