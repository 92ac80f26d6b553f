#[cfg(test)]
mod sdp_test;

use std::fmt::Write as _;
use std::sync::Arc;

use crate::candidate::{unmarshal_candidate, Candidate};
use crate::error::*;

/// The ICE-relevant content of a line-oriented session description:
/// credentials, candidates and the end-of-candidates marker.
#[derive(Default)]
pub struct IceDescription {
    pub ufrag: String,
    pub pwd: String,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
}

/// Serializes the local half of a session. Only the session-level lines a
/// minimal answerer needs are emitted; candidates trickle in as gathered
/// and `a=end-of-candidates` closes the list.
pub fn marshal_description(
    session_id: u64,
    ufrag: &str,
    pwd: &str,
    candidates: &[Arc<Candidate>],
    gathering_done: bool,
) -> String {
    let mut out = String::new();
    let _ = write!(out, "v=0\r\n");
    let _ = write!(out, "o=- {session_id} 2 IN IP4 0.0.0.0\r\n");
    let _ = write!(out, "s=-\r\n");
    let _ = write!(out, "t=0 0\r\n");
    let _ = write!(out, "a=ice-ufrag:{ufrag}\r\n");
    let _ = write!(out, "a=ice-pwd:{pwd}\r\n");
    let _ = write!(out, "a=ice-options:trickle\r\n");
    for c in candidates {
        let _ = write!(out, "a=candidate:{}\r\n", c.marshal());
    }
    if gathering_done {
        let _ = write!(out, "a=end-of-candidates\r\n");
    }
    out
}

/// Parses a remote session description.
///
/// The parser is deliberately loose: attribute order is irrelevant,
/// session-level lines may be missing and unknown attributes are skipped.
/// It insists on ice-ufrag, ice-pwd and at least one parsable candidate.
pub fn parse_description(raw: &str) -> Result<IceDescription> {
    let mut desc = IceDescription::default();

    for line in raw.lines() {
        let line = line.trim();

        if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
            desc.ufrag = value.to_owned();
        } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
            desc.pwd = value.to_owned();
        } else if line == "a=end-of-candidates" {
            desc.end_of_candidates = true;
        } else if let Some(value) = candidate_attribute_value(line) {
            match unmarshal_candidate(value) {
                Ok(c) => desc.candidates.push(c),
                Err(err) => {
                    log::warn!("skipping unparsable candidate {value}: {err}");
                }
            }
        }
    }

    if desc.ufrag.is_empty() {
        return Err(Error::ErrRemoteUfragEmpty);
    }
    if desc.pwd.is_empty() {
        return Err(Error::ErrRemotePwdEmpty);
    }
    if desc.candidates.is_empty() {
        return Err(Error::ErrSdpMissingAttribute);
    }

    Ok(desc)
}

/// Parses one trickled candidate attribute. Both the bare attribute value
/// and the `a=candidate:`/`candidate:` prefixed forms are accepted.
pub fn parse_candidate(raw: &str) -> Result<Candidate> {
    let raw = raw.trim();
    let value = candidate_attribute_value(raw)
        .or_else(|| raw.strip_prefix("candidate:"))
        .unwrap_or(raw);
    unmarshal_candidate(value)
}

fn candidate_attribute_value(line: &str) -> Option<&str> {
    line.strip_prefix("a=candidate:")
}
