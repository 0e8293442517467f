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

//! Multicast IQ recorder and analytics for the time-standard stations WWV,
//! WWVH and CHU.
//!
//! The recorder ingests RTP streams of int16 IQ samples from radiod, reorders
//! and gap-fills them per channel, and writes one compressed minute archive
//! per channel per UTC minute with an embedded timing anchor. The analytics
//! service consumes finished archives and produces quality metrics, tone
//! detections and a decimated 10 Hz data product.

pub mod analytics;
pub mod archive;
pub mod channel;
pub mod config;
pub mod dsp;
pub mod error;
pub mod recorder;
pub mod resequencer;
pub mod rtp;
pub mod socket;
pub mod station;
pub mod status;
pub mod timing;
pub mod tone;
pub mod writer;

use crate::error::TimemarkResult;
use tracing_subscriber::EnvFilter;

/// Initializes the process wide tracing subscriber. `RUST_LOG` overrides the
/// default `info` level.
pub fn init_tracing() -> TimemarkResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| crate::error::TimemarkError::Other(e.to_string()))?;
    Ok(())
}
