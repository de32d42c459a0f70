// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Type aliases for common types used all over the code base.
//!
//! Image-domain kernels run in `Float` (f32); pose and inertial math runs
//! in f64.

use nalgebra as na;

pub type Float = f32;

pub type Point2 = na::Point2<Float>;
pub type Point3 = na::Point3<Float>;

pub type Vec2 = na::Vector2<Float>;
pub type Vec3 = na::Vector3<Float>;
pub type Vec6 = na::Vector6<Float>;

pub type Mat3 = na::Matrix3<Float>;

// f64 family, used by the pose solver and the inertial path.

pub type Vec3d = na::Vector3<f64>;
pub type Vec6d = na::Vector6<f64>;
pub type Vec8d = na::SVector<f64, 8>;
pub type Vec9d = na::SVector<f64, 9>;
pub type Vec10d = na::SVector<f64, 10>;
pub type Vec15d = na::SVector<f64, 15>;

pub type Mat3d = na::Matrix3<f64>;
pub type Mat4d = na::Matrix4<f64>;
pub type Mat6d = na::Matrix6<f64>;
pub type Mat8d = na::SMatrix<f64, 8, 8>;
pub type Mat10d = na::SMatrix<f64, 10, 10>;
pub type Mat15d = na::SMatrix<f64, 15, 15>;
pub type Mat15x6d = na::SMatrix<f64, 15, 6>;
pub type Mat15x9d = na::SMatrix<f64, 15, 9>;

pub type Iso3 = na::Isometry3<f64>;

/// Speed-and-bias state: velocity, gyro bias, accelerometer bias.
pub type SpeedAndBias = Vec9d;
