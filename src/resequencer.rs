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

//! Per-channel packet resequencing.
//!
//! Presents RTP packets downstream in strictly non-decreasing RTP timestamp
//! order. Missing samples are zero-filled and accounted for in exactly one
//! [`SequencedEvent::Gap`] each, so sample-count integrity holds end to end.
//! The recorder never stretches, slews or interpolates time.

use crate::{
    rtp::IqPacket,
    timing::{rtp_delta, seq_delta},
};
use num_complex::Complex;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Output of [`Resequencer::push`], in emit order.
#[derive(Debug, Clone, PartialEq)]
pub enum SequencedEvent {
    /// A contiguous run of received samples.
    Samples {
        rtp_timestamp: u32,
        samples: Vec<Complex<f32>>,
    },
    /// A zero-filled discontinuity. `fill` holds exactly the missing
    /// samples; `start_timestamp` is the first missing RTP timestamp and
    /// `resume_timestamp` the first real sample after the gap.
    Gap {
        start_timestamp: u32,
        resume_timestamp: u32,
        fill: Vec<Complex<f32>>,
        packets_lost: u32,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResequencerCounters {
    pub duplicates: u64,
    pub late_drops: u64,
    pub forced_advances: u64,
    pub resyncs: u64,
}

/// Bounded reorder buffer keyed on unwrapped sequence numbers.
///
/// Never panics; anomalous input is counted and recording continues.
pub struct Resequencer {
    capacity: usize,
    /// Timestamp jumps larger than this many samples are treated as a
    /// stream reset (radiod restart) instead of a gap to zero-fill.
    resync_threshold: i64,
    next_seq: Option<i64>,
    next_ts: u32,
    pending: BTreeMap<i64, IqPacket>,
    counters: ResequencerCounters,
}

impl Resequencer {
    /// `capacity` is the reorder depth in packets, sized to roughly two
    /// seconds of the expected packet rate.
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            capacity: capacity.max(2),
            resync_threshold: sample_rate as i64 * 600,
            next_seq: None,
            next_ts: 0,
            pending: BTreeMap::new(),
            counters: ResequencerCounters::default(),
        }
    }

    pub fn counters(&self) -> ResequencerCounters {
        self.counters
    }

    pub fn push(&mut self, packet: IqPacket) -> Vec<SequencedEvent> {
        let mut events = Vec::new();

        let Some(next_seq) = self.next_seq else {
            self.next_seq = Some(packet.sequence as i64);
            self.next_ts = packet.timestamp;
            self.emit(packet, &mut events);
            return events;
        };

        let delta = seq_delta((next_seq & 0xFFFF) as u16, packet.sequence) as i64;
        let unwrapped = next_seq + delta;

        if unwrapped < next_seq {
            if next_seq - unwrapped > self.capacity as i64 {
                self.counters.late_drops += 1;
                debug!(
                    "dropping late packet seq {} ({} behind emit cursor)",
                    packet.sequence,
                    next_seq - unwrapped
                );
            } else {
                self.counters.duplicates += 1;
            }
            return events;
        }

        if unwrapped == next_seq {
            self.emit_with_gap_check(packet, 0, &mut events);
            self.drain(&mut events);
            return events;
        }

        if self.pending.insert(unwrapped, packet).is_some() {
            self.counters.duplicates += 1;
            return events;
        }

        if self.pending.len() >= self.capacity {
            self.force_advance(&mut events);
            self.drain(&mut events);
        }

        events
    }

    /// Drains all buffered packets, zero-filling the holes between them.
    /// Called once at shutdown so the final partial minute is accounted.
    pub fn flush(&mut self) -> Vec<SequencedEvent> {
        let mut events = Vec::new();
        while !self.pending.is_empty() {
            self.force_advance(&mut events);
            self.drain(&mut events);
        }
        events
    }

    fn drain(&mut self, events: &mut Vec<SequencedEvent>) {
        while let Some(next_seq) = self.next_seq {
            match self.pending.remove(&next_seq) {
                Some(packet) => self.emit_with_gap_check(packet, 0, events),
                None => break,
            }
        }
    }

    /// The reorder buffer is full (or being flushed) and the oldest buffered
    /// packet is not consecutive: declare the hole a gap and move on.
    fn force_advance(&mut self, events: &mut Vec<SequencedEvent>) {
        let Some(next_seq) = self.next_seq else {
            return;
        };
        let Some((&unwrapped, _)) = self.pending.iter().next() else {
            return;
        };
        let packet = match self.pending.remove(&unwrapped) {
            Some(it) => it,
            None => return,
        };
        let lost = (unwrapped - next_seq) as u32;
        self.counters.forced_advances += 1;
        self.next_seq = Some(unwrapped);
        self.emit_with_gap_check(packet, lost, events);
    }

    /// Emits one packet at the cursor position, preceded by a gap event if
    /// its timestamp is ahead of the expected one.
    fn emit_with_gap_check(&mut self, packet: IqPacket, packets_lost: u32, events: &mut Vec<SequencedEvent>) {
        let missing = rtp_delta(self.next_ts, packet.timestamp);
        if missing != 0 {
            if missing > 0 && missing <= self.resync_threshold {
                events.push(SequencedEvent::Gap {
                    start_timestamp: self.next_ts,
                    resume_timestamp: packet.timestamp,
                    fill: vec![Complex::new(0.0, 0.0); missing as usize],
                    packets_lost,
                });
            } else {
                self.counters.resyncs += 1;
                warn!(
                    "RTP timestamp discontinuity of {missing} samples at seq {}, resynchronizing",
                    packet.sequence
                );
            }
        }
        self.emit(packet, events);
    }

    fn emit(&mut self, packet: IqPacket, events: &mut Vec<SequencedEvent>) {
        self.next_seq = self.next_seq.map(|s| s + 1);
        self.next_ts = packet.timestamp.wrapping_add(packet.samples.len() as u32);
        events.push(SequencedEvent::Samples {
            rtp_timestamp: packet.timestamp,
            samples: packet.samples,
        });
    }
}
