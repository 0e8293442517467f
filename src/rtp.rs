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

//! RTP packet parsing for radiod IQ streams.
//!
//! The payload is interleaved signed 16 bit big endian I/Q pairs; one RTP
//! timestamp tick is one IQ sample.

use crate::error::{PacketError, WrappedRtpError};
use num_complex::Complex;
use rtp_rs::RtpReader;

pub const RTP_HEADER_LEN: usize = 12;

/// Bytes on the wire per IQ sample: 16 bit I + 16 bit Q.
pub const BYTES_PER_SAMPLE: usize = 4;

const I16_SCALE: f32 = 32768.0;

/// A decoded IQ packet, owned by the receiver until it is handed to exactly
/// one channel processor.
#[derive(Debug, Clone)]
pub struct IqPacket {
    pub ssrc: u32,
    pub sequence: u16,
    pub timestamp: u32,
    pub samples: Vec<Complex<f32>>,
}

/// Parses raw datagrams into [`IqPacket`]s, rejecting payload types that are
/// not configured as int16 IQ formats.
#[derive(Debug, Clone)]
pub struct PacketParser {
    allowed_payload_types: Vec<u8>,
}

impl PacketParser {
    pub fn new(allowed_payload_types: &[u8]) -> Self {
        Self {
            allowed_payload_types: allowed_payload_types.to_vec(),
        }
    }

    pub fn parse(&self, data: &[u8]) -> Result<IqPacket, PacketError> {
        let rtp = RtpReader::new(data).map_err(|e| PacketError::MalformedHeader(WrappedRtpError(e)))?;
        let payload_type = rtp.payload_type();
        if !self.allowed_payload_types.contains(&payload_type) {
            return Err(PacketError::UnsupportedPayload(payload_type));
        }
        let samples = decode_iq_payload(rtp.payload())?;
        Ok(IqPacket {
            ssrc: rtp.ssrc(),
            sequence: rtp.sequence_number().into(),
            timestamp: rtp.timestamp(),
            samples,
        })
    }
}

/// Decodes interleaved signed 16 bit big endian I/Q pairs, normalized to
/// [-1, 1) by 2^15.
pub fn decode_iq_payload(payload: &[u8]) -> Result<Vec<Complex<f32>>, PacketError> {
    if payload.len() % BYTES_PER_SAMPLE != 0 {
        return Err(PacketError::TruncatedPayload(payload.len()));
    }
    let mut samples = Vec::with_capacity(payload.len() / BYTES_PER_SAMPLE);
    for pair in payload.chunks_exact(BYTES_PER_SAMPLE) {
        let re = i16::from_be_bytes([pair[0], pair[1]]) as f32 / I16_SCALE;
        let im = i16::from_be_bytes([pair[2], pair[3]]) as f32 / I16_SCALE;
        samples.push(Complex::new(re, im));
    }
    Ok(samples)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// Builds a raw RTP packet with version 2 and no extensions.
    pub(crate) fn raw_packet(pt: u8, seq: u16, ts: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        data.push(0x80);
        data.push(pt & 0x7F);
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&ts.to_be_bytes());
        data.extend_from_slice(&ssrc.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn parses_iq_packet() {
        let payload = [
            0x40, 0x00, 0xC0, 0x00, // +0.5, -0.5
            0x00, 0x00, 0x7F, 0xFF, // 0.0, ~+1.0
        ];
        let raw = raw_packet(97, 42, 1_000_000, 0xDEADBEEF, &payload);
        let parser = PacketParser::new(&[97]);
        let pkt = parser.parse(&raw).expect("parse");
        assert_eq!(pkt.ssrc, 0xDEADBEEF);
        assert_eq!(pkt.sequence, 42);
        assert_eq!(pkt.timestamp, 1_000_000);
        assert_eq!(pkt.samples.len(), 2);
        assert!((pkt.samples[0].re - 0.5).abs() < 1e-6);
        assert!((pkt.samples[0].im + 0.5).abs() < 1e-6);
        assert!((pkt.samples[1].re).abs() < 1e-6);
        assert!((pkt.samples[1].im - 32767.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn rejects_short_packet() {
        let parser = PacketParser::new(&[97]);
        assert!(matches!(
            parser.parse(&[0x80, 97, 0, 0]),
            Err(PacketError::MalformedHeader(_))
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let payload = [0u8; 4];
        let mut raw = raw_packet(97, 0, 0, 1, &payload);
        raw[0] = 0x40; // version 1
        let parser = PacketParser::new(&[97]);
        assert!(matches!(
            parser.parse(&raw),
            Err(PacketError::MalformedHeader(_))
        ));
    }

    #[test]
    fn rejects_unknown_payload_type() {
        let raw = raw_packet(33, 0, 0, 1, &[0u8; 4]);
        let parser = PacketParser::new(&[96, 97]);
        assert!(matches!(
            parser.parse(&raw),
            Err(PacketError::UnsupportedPayload(33))
        ));
    }

    #[test]
    fn rejects_ragged_payload() {
        let raw = raw_packet(97, 0, 0, 1, &[0u8; 6]);
        let parser = PacketParser::new(&[97]);
        assert!(matches!(
            parser.parse(&raw),
            Err(PacketError::TruncatedPayload(6))
        ));
    }
}
