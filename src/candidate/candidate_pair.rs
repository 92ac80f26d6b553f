use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use super::Candidate;

/// State of a candidate pair in the check list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum CandidatePairState {
    /// A check for this pair is deferred until its foundation group has
    /// no check under way.
    #[serde(rename = "frozen")]
    Frozen = 0,

    /// The pair is eligible for the pacer but no check has been sent yet.
    #[serde(rename = "waiting")]
    Waiting = 1,

    /// A check has been sent and the transaction is outstanding.
    #[serde(rename = "in-progress")]
    InProgress = 2,

    /// A verified success response was received for this pair.
    #[serde(rename = "succeeded")]
    Succeeded = 3,

    /// The check never produced a response or produced an unrecoverable
    /// error response.
    #[serde(rename = "failed")]
    Failed = 4,
}

impl From<u8> for CandidatePairState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Waiting,
            2 => Self::InProgress,
            3 => Self::Succeeded,
            4 => Self::Failed,
            _ => Self::Frozen,
        }
    }
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Frozen
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Waiting => "waiting",
            Self::InProgress => "in-progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A combination of a local and a remote candidate.
pub struct CandidatePair {
    pub local: Arc<Candidate>,
    pub remote: Arc<Candidate>,
    /// Role held when the pair was scored; flipped on role switches so the
    /// G/D assignment in the priority formula stays correct.
    pub(crate) controlling: AtomicBool,
    pub(crate) state: AtomicU8,
    pub(crate) nominated: AtomicBool,
    /// Set when the remote controlling agent asked for nomination via
    /// USE-CANDIDATE before our own check on this pair succeeded.
    pub(crate) nomination_requested: AtomicBool,
}

impl fmt::Display for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "prio {} (local, prio {}) {} <-> {} (remote, prio {})",
            self.priority(),
            self.local.priority(),
            self.local,
            self.remote,
            self.remote.priority()
        )
    }
}

impl fmt::Debug for CandidatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl PartialEq for CandidatePair {
    fn eq(&self, other: &Self) -> bool {
        self.local.equal(&other.local) && self.remote.equal(&other.remote)
    }
}

impl CandidatePair {
    #[must_use]
    pub fn new(local: Arc<Candidate>, remote: Arc<Candidate>, controlling: bool) -> Self {
        Self {
            local,
            remote,
            controlling: AtomicBool::new(controlling),
            state: AtomicU8::new(CandidatePairState::Frozen as u8),
            nominated: AtomicBool::new(false),
            nomination_requested: AtomicBool::new(false),
        }
    }

    /// The key pairs are deduplicated by: the local base (the address
    /// checks actually leave from) and the remote transport address.
    pub(crate) fn key(&self) -> (SocketAddr, SocketAddr) {
        (self.local.base_addr(), self.remote.addr())
    }

    pub fn state(&self) -> CandidatePairState {
        CandidatePairState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: CandidatePairState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn nominated(&self) -> bool {
        self.nominated.load(Ordering::SeqCst)
    }

    /// The freezing algorithm groups pairs by the concatenation of both
    /// candidates' foundations.
    pub(crate) fn foundation(&self) -> String {
        format!("{}{}", self.local.foundation(), self.remote.foundation())
    }

    /// Pair priority, RFC 8445 section 6.1.2.3: with G the controlling
    /// side's candidate priority and D the controlled side's,
    /// `2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)`.
    pub fn priority(&self) -> u64 {
        let (g, d) = if self.controlling.load(Ordering::SeqCst) {
            (self.local.priority(), self.remote.priority())
        } else {
            (self.remote.priority(), self.local.priority())
        };

        (1u64 << 32) * u64::from(std::cmp::min(g, d))
            + 2 * u64::from(std::cmp::max(g, d))
            + u64::from(g > d)
    }
}
