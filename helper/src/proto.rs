//! Line-oriented sync protocol: frame classification and encoding.
//!
//! Every frame is one newline-terminated UTF-8 line. Commands (`time`, `sync`) match
//! case-insensitively; the `OFFSET_REQUEST:`, `OFFSET:` and `ADJUST:` prefixes are
//! case-sensitive. Anything else is chat text.

use core::fmt;
use thiserror::Error;

use crate::clock::{ClockTime, MINUTES_PER_DAY};

pub const TIME_COMMAND: &str = "time";
pub const SYNC_COMMAND: &str = "sync";
pub const OFFSET_REQUEST_PREFIX: &str = "OFFSET_REQUEST:";
pub const OFFSET_PREFIX: &str = "OFFSET:";
pub const ADJUST_PREFIX: &str = "ADJUST:";

/// Largest magnitude an `OFFSET:`/`ADJUST:` payload may carry. Offsets stay within one
/// day either way, so an adjustment (`average - offset`) stays within two.
pub const MAX_FRAME_MINUTES: i64 = 2 * MINUTES_PER_DAY;

/// One protocol line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// Request a time report of the coordinator and every participant.
    Time,
    /// Trigger one sync round.
    Sync,
    /// Coordinator asks for an offset relative to its current time.
    OffsetRequest(ClockTime),
    /// Participant's signed offset in minutes.
    Offset(i64),
    /// Signed minute delta a participant must apply.
    Adjust(i64),
    /// Free text.
    Text(String),
}

impl Frame {
    /// Classify a received line. Only a recognized prefix with a malformed payload is
    /// an error; unknown lines become [`Frame::Text`].
    pub fn parse(line: &str) -> Result<Self, ProtoError> {
        if line.eq_ignore_ascii_case(TIME_COMMAND) {
            return Ok(Frame::Time);
        }
        if line.eq_ignore_ascii_case(SYNC_COMMAND) {
            return Ok(Frame::Sync);
        }
        if let Some(rest) = line.strip_prefix(OFFSET_REQUEST_PREFIX) {
            return Ok(Frame::OffsetRequest(rest.parse()?));
        }
        if let Some(rest) = line.strip_prefix(OFFSET_PREFIX) {
            return parse_minutes(rest)
                .map(Frame::Offset)
                .ok_or_else(|| ProtoError::MalformedOffset(rest.to_string()));
        }
        if let Some(rest) = line.strip_prefix(ADJUST_PREFIX) {
            return parse_minutes(rest)
                .map(Frame::Adjust)
                .ok_or_else(|| ProtoError::MalformedAdjust(rest.to_string()));
        }
        Ok(Frame::Text(line.to_string()))
    }

    /// Encode without the trailing newline.
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Time => f.write_str(TIME_COMMAND),
            Frame::Sync => f.write_str(SYNC_COMMAND),
            Frame::OffsetRequest(t) => write!(f, "{OFFSET_REQUEST_PREFIX}{t}"),
            Frame::Offset(m) => write!(f, "{OFFSET_PREFIX}{m}"),
            Frame::Adjust(m) => write!(f, "{ADJUST_PREFIX}{m}"),
            Frame::Text(s) => f.write_str(s),
        }
    }
}

fn parse_minutes(raw: &str) -> Option<i64> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|m| m.unsigned_abs() < MAX_FRAME_MINUTES as u64)
}

/// Malformed payload behind a recognized frame prefix.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    #[error("malformed OFFSET payload: {0:?}")]
    MalformedOffset(String),
    #[error("malformed ADJUST payload: {0:?}")]
    MalformedAdjust(String),
    #[error("malformed time (expected HH:mm): {0:?}")]
    MalformedTime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(Frame::parse("time").unwrap(), Frame::Time);
        assert_eq!(Frame::parse("TiMe").unwrap(), Frame::Time);
        assert_eq!(Frame::parse("SYNC").unwrap(), Frame::Sync);
        assert_eq!(Frame::parse("sync now").unwrap(), Frame::Text("sync now".into()));
    }

    #[test]
    fn protocol_prefixes() {
        let t = ClockTime::from_hm(13, 7).unwrap();
        assert_eq!(Frame::parse("OFFSET_REQUEST:13:07").unwrap(), Frame::OffsetRequest(t));
        assert_eq!(Frame::parse("OFFSET:-42").unwrap(), Frame::Offset(-42));
        assert_eq!(Frame::parse("ADJUST:90").unwrap(), Frame::Adjust(90));
        assert_eq!(Frame::OffsetRequest(t).encode(), "OFFSET_REQUEST:13:07");
        assert_eq!(Frame::Adjust(-5).encode(), "ADJUST:-5");
    }

    #[test]
    fn prefixes_are_case_sensitive() {
        assert_eq!(Frame::parse("offset:5").unwrap(), Frame::Text("offset:5".into()));
        assert_eq!(Frame::parse("Adjust:5").unwrap(), Frame::Text("Adjust:5".into()));
    }

    #[test]
    fn malformed_payloads() {
        assert_eq!(
            Frame::parse("OFFSET:PT5M"),
            Err(ProtoError::MalformedOffset("PT5M".into()))
        );
        assert_eq!(Frame::parse("ADJUST:"), Err(ProtoError::MalformedAdjust(String::new())));
        assert_eq!(
            Frame::parse("OFFSET:9223372036854775807"),
            Err(ProtoError::MalformedOffset("9223372036854775807".into()))
        );
        assert_eq!(
            Frame::parse("ADJUST:-2880"),
            Err(ProtoError::MalformedAdjust("-2880".into()))
        );
        assert_eq!(
            Frame::parse("ADJUST:-9223372036854775808"),
            Err(ProtoError::MalformedAdjust("-9223372036854775808".into()))
        );
        assert_eq!(Frame::parse("ADJUST:-2879").unwrap(), Frame::Adjust(-2879));
        assert!(matches!(
            Frame::parse("OFFSET_REQUEST:25:00"),
            Err(ProtoError::MalformedTime(_))
        ));
    }
}
