#![forbid(unsafe_code)]

use crate::error::Error;
use serde::Deserialize;

/// Sentinels framing the structured payload of a scripted request. Anything
/// outside them is diagnostic text and is ignored.
pub const START_SENTINEL: &str = "STARTJSON";
pub const END_SENTINEL: &str = "ENDJSON";

#[derive(Debug, Clone, Deserialize)]
pub struct FramedResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Machine-readable discriminator for `success: false` replies, e.g.
    /// `session-not-found`. Messages are for humans and may be reworded.
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

/// Extract the substring between the sentinel lines. Tolerant of CRLF and
/// surrounding whitespace; both sentinels must appear on their own lines,
/// in order, exactly once each.
pub fn extract_frame(text: &str) -> Result<&str, Error> {
    let mut start_end: Option<usize> = None;
    let mut payload_end: Option<usize> = None;

    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed == START_SENTINEL {
            if start_end.is_some() {
                return Err(Error::ParseFailure("duplicate STARTJSON sentinel".into()));
            }
            start_end = Some(offset + line.len());
        } else if trimmed == END_SENTINEL {
            if start_end.is_none() {
                return Err(Error::ParseFailure("ENDJSON before STARTJSON".into()));
            }
            if payload_end.is_some() {
                return Err(Error::ParseFailure("duplicate ENDJSON sentinel".into()));
            }
            payload_end = Some(offset);
        }
        offset += line.len();
    }

    match (start_end, payload_end) {
        (Some(start), Some(end)) if start <= end => Ok(text[start..end].trim()),
        (Some(_), Some(_)) => Err(Error::ParseFailure("sentinels out of order".into())),
        (Some(_), None) => Err(Error::ParseFailure("missing ENDJSON sentinel".into())),
        (None, _) => Err(Error::ParseFailure("missing STARTJSON sentinel".into())),
    }
}

/// Extract and decode the framed payload of a control-plane reply.
pub fn parse_framed(text: &str) -> Result<FramedResponse, Error> {
    let payload = extract_frame(text)?;
    serde_json::from_str(payload)
        .map_err(|err| Error::ParseFailure(format!("framed payload is not valid JSON: {err}")))
}
