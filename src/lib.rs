// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Coarse tracker and inner numerical kernels for a direct, sparse
//! visual(-inertial) odometry front-end.
//!
//! Given a reference keyframe with a sparse depth estimate and a newly
//! arrived image (monocular or stereo, optionally with inertial
//! measurements), the coarse tracker estimates the rigid-body pose of the
//! new frame relative to the reference, jointly with per-frame photometric
//! affine parameters and, in the inertial case, speed/bias states, by
//! Levenberg-Marquardt minimization of a robust photometric cost over a
//! multi-resolution image pyramid.

pub mod config;
pub mod core;
pub mod imu;
pub mod math;
pub mod misc;
