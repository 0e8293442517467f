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

use miette::Diagnostic;
use rtp_rs::RtpReaderError;
use std::{fmt::Display, io};
use thiserror::Error;
use tracing_subscriber::{filter::ParseError, util::TryInitError};

#[derive(Error, Debug, Diagnostic)]
pub enum TimemarkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON serde error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Tracing init error: {0}")]
    TryInit(#[from] TryInitError),
    #[error("Tracing filter parse error: {0}")]
    FilterParse(#[from] ParseError),
    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("System clock error: {0}")]
    SystemClock(String),
    #[error("General error: {0}")]
    Other(String),
}

pub type TimemarkResult<T> = Result<T, TimemarkError>;

/// Errors produced while reading or writing minute archive containers.
///
/// `Schema` covers everything that makes a file unusable for analytics even
/// though the container itself opened fine: missing or ill-typed metadata
/// fields, inconsistent gap accounting, or an IQ entry of the wrong length.
#[derive(Error, Debug, Diagnostic)]
pub enum ArchiveError {
    #[error("container error: {0}")]
    Container(#[from] zip::result::ZipError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed metadata: {0}")]
    Meta(#[from] serde_json::Error),
    #[error("schema violation: {0}")]
    Schema(String),
}

impl ArchiveError {
    /// True for errors that mean the file itself is bad (as opposed to a
    /// transient I/O problem) and should be quarantined.
    pub fn is_corrupt_file(&self) -> bool {
        match self {
            ArchiveError::Container(_) | ArchiveError::Meta(_) | ArchiveError::Schema(_) => true,
            ArchiveError::Io(_) => false,
        }
    }
}

/// Errors produced by the RTP packet parser.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("malformed RTP header: {0}")]
    MalformedHeader(WrappedRtpError),
    #[error("unsupported payload type {0}")]
    UnsupportedPayload(u8),
    #[error("IQ payload length {0} is not a whole number of samples")]
    TruncatedPayload(usize),
}

/// `RtpReaderError` does not implement `std::error::Error`, so it is wrapped
/// for use in error chains.
#[derive(Debug)]
pub struct WrappedRtpError(pub RtpReaderError);

impl Display for WrappedRtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::error::Error for WrappedRtpError {}
