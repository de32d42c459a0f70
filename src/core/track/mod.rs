// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful types and functions for tracking a camera.

pub mod coarse;
pub mod inertial;

pub use coarse::{
    CoarseTracker, ResEval, TrackingDiagnostics, TrackingError, TrackingGuess, TrackingResult,
};
pub use inertial::InertialTrackingResult;
