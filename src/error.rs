use std::num::ParseIntError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the scheme type could not be parsed or names an
    /// unsupported server kind (only `stun:` is accepted).
    #[error("unknown scheme type")]
    ErrSchemeType,

    /// Indicates malformed hostname is provided.
    #[error("invalid hostname")]
    ErrHost,

    /// Indicates malformed port is provided.
    #[error("invalid port number")]
    ErrPort,

    /// Indicates a malformed server URL.
    #[error("invalid url")]
    ErrInvalidUrl,

    /// Indicates local username fragment insufficient bits are provided.
    /// Have to be at least 24 bits long.
    #[error("local username fragment is less than 24 bits long")]
    ErrLocalUfragInsufficientBits,

    /// Indicates local password insufficient bits are provided.
    /// Have to be at least 128 bits long.
    #[error("local password is less than 128 bits long")]
    ErrLocalPwdInsufficientBits,

    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates the agent reached the terminal failed state.
    #[error("the agent failed to establish connectivity")]
    ErrAgentFailed,

    /// Indicates agent does not have a valid candidate pair.
    #[error("no candidate pairs available")]
    ErrNoCandidatePairs,

    /// Indicates a remote description was set with an empty ufrag.
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,

    /// Indicates a remote description was set with an empty pwd.
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,

    /// Indicates a trickled candidate arrived before the remote description.
    #[error("no remote description set")]
    ErrNoRemoteDescription,

    /// Indicates GatherCandidates has been called multiple times.
    #[error("attempting to gather candidates during gathering state")]
    ErrMultipleGatherAttempted,

    /// Indicates no usable local interface address could be found.
    #[error("no usable local interface addresses")]
    ErrNoUsableInterfaces,

    /// Indicates we were unable to parse a candidate address.
    #[error("failed to parse address")]
    ErrAddressParseFailed,

    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse related addresses")]
    ErrParseRelatedAddr,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,

    /// Indicates a required session description attribute is missing.
    #[error("session description is missing a required attribute")]
    ErrSdpMissingAttribute,

    /// Indicates an outbound payload exceeds the configured maximum.
    #[error("packet exceeds maximum message size")]
    ErrPacketTooLarge,

    /// Indicates application payloads may not be raw STUN messages.
    #[error("the agent can't send STUN messages as application data")]
    ErrWriteStunMessage,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Util(#[from] util::Error),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    ParseUrl(#[from] url::ParseError),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
