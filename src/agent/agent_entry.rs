use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use stun::agent::TransactionId;
use tokio::time::{Duration, Instant};
use util::sync::Mutex as SyncMutex;

use super::agent_config::MAX_STUN_RETRANSMISSION_COUNT;
use crate::attr::Role;
use crate::candidate::CandidatePair;
use crate::url::Url;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// Server-reflexive discovery toward a STUN server.
    Server,
    /// Connectivity check / keepalive toward a remote candidate.
    Check,
}

/// One outstanding or periodically re-armed STUN transaction.
///
/// Entries are owned by the agent's entry table and driven by the worker;
/// the `armed` flag is the only field other threads touch, as a CAS
/// one-shot requesting an immediate (re)transmission.
pub(crate) struct StunEntry {
    pub(crate) kind: EntryKind,
    /// Backing pair for Check entries.
    pub(crate) pair: Option<Arc<CandidatePair>>,
    /// Server record for Server entries, kept for logging.
    pub(crate) server: Option<Url>,
    pub(crate) destination: SocketAddr,

    transaction_id: SyncMutex<TransactionId>,
    next_transmission: SyncMutex<Instant>,
    rto: SyncMutex<Duration>,
    retransmissions: AtomicU8,
    finished: AtomicBool,
    armed: AtomicBool,

    /// The next fresh transmission nominates the pair (USE-CANDIDATE).
    pub(crate) use_candidate: AtomicBool,
    /// Role attribute the outstanding request carried; a 487 response
    /// switches relative to this, not to the current role.
    sent_role: AtomicU8,
}

impl StunEntry {
    pub(crate) fn new_check(pair: Arc<CandidatePair>, now: Instant) -> Self {
        let destination = pair.remote.addr();
        Self::new(EntryKind::Check, Some(pair), None, destination, now)
    }

    pub(crate) fn new_server(server: Url, destination: SocketAddr, now: Instant) -> Self {
        let entry = Self::new(EntryKind::Server, None, Some(server), destination, now);
        entry.arm();
        entry
    }

    fn new(
        kind: EntryKind,
        pair: Option<Arc<CandidatePair>>,
        server: Option<Url>,
        destination: SocketAddr,
        now: Instant,
    ) -> Self {
        Self {
            kind,
            pair,
            server,
            destination,
            transaction_id: SyncMutex::new(TransactionId::default()),
            next_transmission: SyncMutex::new(now),
            rto: SyncMutex::new(Duration::from_secs(0)),
            retransmissions: AtomicU8::new(0),
            finished: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            use_candidate: AtomicBool::new(false),
            sent_role: AtomicU8::new(Role::Unspecified as u8),
        }
    }

    pub(crate) fn set_sent_role(&self, role: Role) {
        self.sent_role.store(role as u8, Ordering::SeqCst);
    }

    pub(crate) fn sent_role(&self) -> Role {
        Role::from(self.sent_role.load(Ordering::SeqCst))
    }

    /// One-shot trigger: requests an immediate fresh transmission on the
    /// next pacer slot. Callable from any thread; returns false if the
    /// trigger was already pending.
    pub(crate) fn arm(&self) -> bool {
        self.armed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Consumes the trigger. Worker only.
    pub(crate) fn disarm(&self) -> bool {
        self.armed.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub(crate) fn transaction_id(&self) -> TransactionId {
        *self.transaction_id.lock()
    }

    /// An inbound response belongs to this entry if the transaction id of
    /// the single outstanding request matches.
    pub(crate) fn matches_transaction(&self, id: TransactionId) -> bool {
        !self.is_finished() && *self.transaction_id.lock() == id
    }

    pub(crate) fn retransmissions(&self) -> u8 {
        self.retransmissions.load(Ordering::SeqCst)
    }

    /// True once the current transaction has used up all transmissions.
    pub(crate) fn is_exhausted(&self) -> bool {
        self.retransmissions() >= MAX_STUN_RETRANSMISSION_COUNT
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        *self.next_transmission.lock() <= now
    }

    /// The instant the timer scan must wake up for this entry.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        if self.is_finished() {
            None
        } else {
            Some(*self.next_transmission.lock())
        }
    }

    /// Accounts for one transmission and returns the transaction id to
    /// send. A fresh transaction (armed, first send, or keepalive re-arm)
    /// gets a new id and the initial RTO; a retransmission reuses the id
    /// and doubles the timeout.
    pub(crate) fn begin_transmission(
        &self,
        now: Instant,
        initial_rto: Duration,
    ) -> (TransactionId, bool) {
        let fresh = self.disarm() || self.retransmissions() == 0;

        let rto = {
            let mut rto = self.rto.lock();
            if fresh {
                *self.transaction_id.lock() = TransactionId::new();
                self.retransmissions.store(0, Ordering::SeqCst);
                *rto = initial_rto;
            } else {
                *rto *= 2;
            }
            *rto
        };

        self.retransmissions.fetch_add(1, Ordering::SeqCst);
        *self.next_transmission.lock() = now + rto;

        (*self.transaction_id.lock(), fresh)
    }

    /// Reopens the entry for a fresh transaction due after `delay`:
    /// keepalives on the selected pair, revived triggered checks and
    /// nomination re-issues all go through here.
    pub(crate) fn reopen(&self, now: Instant, delay: Duration) {
        self.retransmissions.store(0, Ordering::SeqCst);
        *self.next_transmission.lock() = now + delay;
        self.finished.store(false, Ordering::SeqCst);
    }
}
