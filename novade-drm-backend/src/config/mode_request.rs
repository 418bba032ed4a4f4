// novade-drm-backend/src/config/mode_request.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ModeRequestParseError;

/// How an output's mode should be chosen at mode-set time.
///
/// Grammar: `preferred | current | <uint>x<uint>[@<uint>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModeRequest {
    /// The first advertised mode, which the kernel lists as the
    /// manufacturer-preferred one.
    #[default]
    Preferred,
    /// Keep the mode the output was already driven with.
    Current,
    /// First advertised mode with this size, and refresh rate if given.
    Resolution {
        width: u32,
        height: u32,
        refresh: Option<u32>,
    },
}

fn parse_uint(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl FromStr for ModeRequest {
    type Err = ModeRequestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preferred" => return Ok(ModeRequest::Preferred),
            "current" => return Ok(ModeRequest::Current),
            _ => {}
        }

        let invalid = || ModeRequestParseError(s.to_string());
        let (resolution, refresh) = match s.split_once('@') {
            Some((resolution, refresh)) => (resolution, Some(parse_uint(refresh).ok_or_else(invalid)?)),
            None => (s, None),
        };
        let (width, height) = resolution.split_once('x').ok_or_else(invalid)?;

        Ok(ModeRequest::Resolution {
            width: parse_uint(width).ok_or_else(invalid)?,
            height: parse_uint(height).ok_or_else(invalid)?,
            refresh,
        })
    }
}

impl TryFrom<String> for ModeRequest {
    type Error = ModeRequestParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModeRequest> for String {
    fn from(request: ModeRequest) -> Self {
        request.to_string()
    }
}

impl fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeRequest::Preferred => f.write_str("preferred"),
            ModeRequest::Current => f.write_str("current"),
            ModeRequest::Resolution { width, height, refresh: None } => {
                write!(f, "{width}x{height}")
            }
            ModeRequest::Resolution { width, height, refresh: Some(refresh) } => {
                write!(f, "{width}x{height}@{refresh}")
            }
        }
    }
}
