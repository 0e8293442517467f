/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Minute-mark tone detection.
//!
//! Two detectors share this module: the startup onset detector
//! ([`onset`]), tuned for edge-timing precision, and the full-buffer
//! matched-filter detector ([`matched`]), tuned for classification
//! robustness over a complete archived minute.

pub mod matched;
pub mod onset;

use crate::station::Station;
use serde::Serialize;

/// One detected minute-mark tone in an archived minute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToneDetection {
    pub station: Station,
    pub freq_hz: f32,
    /// Sub-sample onset time of the tone's rising edge.
    pub onset_utc: f64,
    pub snr_db: f32,
    /// True only for WWV and CHU; WWVH is tracked for propagation studies
    /// and never used as a time reference.
    pub use_for_time_snap: bool,
}
