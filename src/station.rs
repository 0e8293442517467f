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

//! The time-standard stations this system knows about and the per-station
//! constants used by both tone detectors.

use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Station {
    #[serde(rename = "WWV")]
    Wwv,
    #[serde(rename = "WWVH")]
    Wwvh,
    #[serde(rename = "CHU")]
    Chu,
}

impl Station {
    pub const ALL: [Station; 3] = [Station::Wwv, Station::Wwvh, Station::Chu];

    /// Frequency of the minute-mark tone.
    pub fn tone_freq_hz(&self) -> f32 {
        match self {
            Station::Wwv | Station::Chu => 1000.0,
            Station::Wwvh => 1200.0,
        }
    }

    /// Nominal duration of the minute-mark tone.
    pub fn tone_duration_secs(&self) -> f32 {
        match self {
            Station::Wwv | Station::Wwvh => 0.8,
            Station::Chu => 0.5,
        }
    }

    /// WWVH is tracked for propagation studies only and must never be used
    /// as a time reference.
    pub fn use_for_time_snap(&self) -> bool {
        !matches!(self, Station::Wwvh)
    }
}

impl Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Station::Wwv => write!(f, "WWV"),
            Station::Wwvh => write!(f, "WWVH"),
            Station::Chu => write!(f, "CHU"),
        }
    }
}

impl FromStr for Station {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WWV" => Ok(Station::Wwv),
            "WWVH" => Ok(Station::Wwvh),
            "CHU" => Ok(Station::Chu),
            other => Err(format!("unknown station: {other}")),
        }
    }
}
