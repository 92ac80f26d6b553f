use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use portable_atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize};
use stun::attributes::{ATTR_ICE_CONTROLLED, ATTR_ICE_CONTROLLING, ATTR_USERNAME};
use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::{
    Getter, Message, Setter, BINDING_ERROR, BINDING_REQUEST, BINDING_SUCCESS, CLASS_ERROR_RESPONSE,
    CLASS_INDICATION, CLASS_REQUEST, CLASS_SUCCESS_RESPONSE, METHOD_BINDING,
};
use stun::textattrs::Username;
use stun::xoraddr::XorMappedAddress;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};
use util::sync::Mutex as SyncMutex;
use util::Conn;
use waitgroup::WaitGroup;

use super::agent_config::*;
use super::agent_entry::{EntryKind, StunEntry};
use super::{OnCandidateHdlrFn, OnGatheringDoneHdlrFn, OnRecvHdlrFn, OnStateChangeHdlrFn};
use crate::attr::{AttrControlled, AttrControlling, PriorityAttr, Role, UseCandidateAttr};
use crate::candidate::*;
use crate::error::*;
use crate::sdp::IceDescription;
use crate::state::{AgentState, GatheringState};

#[derive(Default)]
pub(crate) struct UfragPwd {
    pub(crate) local_ufrag: String,
    pub(crate) local_pwd: String,
    pub(crate) remote_ufrag: String,
    pub(crate) remote_pwd: String,
}

pub(crate) struct ChanReceivers {
    pub(crate) chan_state_rx: mpsc::Receiver<AgentState>,
    pub(crate) chan_candidate_rx: mpsc::Receiver<Option<Arc<Candidate>>>,
}

pub struct AgentInternal {
    /// The agent's one UDP socket.
    pub(crate) conn: Arc<dyn Conn + Send + Sync>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) session_id: u64,

    // State for closing.
    pub(crate) done_tx: Mutex<Option<mpsc::Sender<()>>>,
    // Wakes the event loop so it reconsiders its deadline after an
    // external mutation.
    pub(crate) interrupt_tx: mpsc::Sender<()>,
    pub(crate) loop_rx: Mutex<Option<(mpsc::Receiver<()>, mpsc::Receiver<()>)>>,

    pub(crate) chan_state_tx: Mutex<Option<mpsc::Sender<AgentState>>>,
    pub(crate) chan_candidate_tx: Mutex<Option<mpsc::Sender<Option<Arc<Candidate>>>>>,

    pub(crate) on_state_change_hdlr: ArcSwapOption<Mutex<OnStateChangeHdlrFn>>,
    pub(crate) on_candidate_hdlr: ArcSwapOption<Mutex<OnCandidateHdlrFn>>,
    pub(crate) on_gathering_done_hdlr: ArcSwapOption<Mutex<OnGatheringDoneHdlrFn>>,
    pub(crate) on_recv_hdlr: ArcSwapOption<Mutex<OnRecvHdlrFn>>,

    pub(crate) tie_breaker: AtomicU64,
    pub(crate) role: AtomicU8,
    pub(crate) state: AtomicU8,
    pub(crate) gathering_state: AtomicU8,
    pub(crate) remote_description_set: AtomicBool,
    pub(crate) remote_gathering_done: AtomicBool,

    pub(crate) ufrag_pwd: Mutex<UfragPwd>,

    pub(crate) local_candidates: Mutex<Vec<Arc<Candidate>>>,
    pub(crate) remote_candidates: Mutex<Vec<Arc<Candidate>>>,
    /// Pair table, kept sorted by descending pair priority.
    pub(crate) checklist: Mutex<Vec<Arc<CandidatePair>>>,
    /// Transaction table. Lock order: checklist before entries.
    pub(crate) entries: Mutex<Vec<Arc<StunEntry>>>,

    /// The nominated Check entry, readable without the agent lock so the
    /// send path can copy the destination.
    pub(crate) selected_entry: ArcSwapOption<StunEntry>,

    pub(crate) last_transmission: SyncMutex<Option<Instant>>,
    pub(crate) fail_deadline: SyncMutex<Option<Instant>>,

    pub(crate) bytes_received: AtomicUsize,
    pub(crate) bytes_sent: AtomicUsize,

    // The following are fixed by init_with_defaults().
    pub(crate) initial_rto: Duration,
    pub(crate) keepalive_period: Duration,
    pub(crate) fail_timeout: Duration,
    pub(crate) max_message_size: usize,
}

impl AgentInternal {
    pub(super) fn new(
        config: &AgentConfig,
        conn: Arc<dyn Conn + Send + Sync>,
        local_addr: SocketAddr,
    ) -> (Self, ChanReceivers) {
        let (chan_state_tx, chan_state_rx) = mpsc::channel(1);
        let (chan_candidate_tx, chan_candidate_rx) = mpsc::channel(1);
        let (done_tx, done_rx) = mpsc::channel(1);
        let (interrupt_tx, interrupt_rx) = mpsc::channel(1);

        let ai = AgentInternal {
            conn,
            local_addr,
            session_id: rand::random::<u64>(),

            done_tx: Mutex::new(Some(done_tx)),
            interrupt_tx,
            loop_rx: Mutex::new(Some((done_rx, interrupt_rx))),

            chan_state_tx: Mutex::new(Some(chan_state_tx)),
            chan_candidate_tx: Mutex::new(Some(chan_candidate_tx)),

            on_state_change_hdlr: ArcSwapOption::empty(),
            on_candidate_hdlr: ArcSwapOption::empty(),
            on_gathering_done_hdlr: ArcSwapOption::empty(),
            on_recv_hdlr: ArcSwapOption::empty(),

            tie_breaker: AtomicU64::new(rand::random::<u64>()),
            role: AtomicU8::new(config.role as u8),
            state: AtomicU8::new(AgentState::Disconnected as u8),
            gathering_state: AtomicU8::new(GatheringState::New as u8),
            remote_description_set: AtomicBool::new(false),
            remote_gathering_done: AtomicBool::new(false),

            ufrag_pwd: Mutex::new(UfragPwd::default()),

            local_candidates: Mutex::new(vec![]),
            remote_candidates: Mutex::new(vec![]),
            checklist: Mutex::new(vec![]),
            entries: Mutex::new(vec![]),

            selected_entry: ArcSwapOption::empty(),

            last_transmission: SyncMutex::new(None),
            fail_deadline: SyncMutex::new(None),

            bytes_received: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),

            // fixed by init_with_defaults()
            initial_rto: Duration::from_secs(0),
            keepalive_period: Duration::from_secs(0),
            fail_timeout: Duration::from_secs(0),
            max_message_size: 0,
        };

        let chan_receivers = ChanReceivers {
            chan_state_rx,
            chan_candidate_rx,
        };
        (ai, chan_receivers)
    }

    pub(crate) fn state(&self) -> AgentState {
        AgentState::from(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn role(&self) -> Role {
        Role::from(self.role.load(Ordering::SeqCst))
    }

    pub(crate) fn gathering_state(&self) -> GatheringState {
        GatheringState::from(self.gathering_state.load(Ordering::SeqCst))
    }

    pub(crate) fn get_name(&self) -> &'static str {
        match self.role() {
            Role::Controlling => "controlling",
            Role::Controlled => "controlled",
            Role::Unspecified => "undecided",
        }
    }

    /// Pulses the interrupt channel; the worker wakes and re-evaluates its
    /// deadline. Safe from any thread, never blocks.
    pub(crate) fn interrupt(&self) {
        let _ = self.interrupt_tx.try_send(());
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Spawns the single worker driving this agent: one iteration is
    /// receive (drain the socket) then bookkeep (timers, transmissions,
    /// state), blocking only on the select below.
    pub(super) fn start_event_loop(self: &Arc<Self>, wg: &WaitGroup) {
        let ai = Arc::clone(self);
        let w = wg.worker();
        tokio::spawn(async move {
            let _d = w;

            let (mut done_rx, mut interrupt_rx) = {
                let mut loop_rx = ai.loop_rx.lock().await;
                match loop_rx.take() {
                    Some(rx) => rx,
                    None => return,
                }
            };

            let mut buffer = vec![0_u8; RECEIVE_MTU];
            loop {
                let deadline = ai.next_deadline().await;

                tokio::select! {
                    result = ai.conn.recv_from(&mut buffer) => {
                        match result {
                            Ok((n, src)) => ai.handle_read(&buffer[..n], src).await,
                            Err(err) => {
                                // Transient socket errors are retried on the
                                // next iteration.
                                log::warn!("[{}]: read error: {}", ai.get_name(), err);
                            }
                        }
                    },
                    _ = interrupt_rx.recv() => {},
                    _ = sleep_until_deadline(deadline) => {},
                    _ = done_rx.recv() => break,
                }

                ai.bookkeep().await;
            }

            log::debug!("[{}]: event loop exited", ai.get_name());
        });
    }

    /// Drains the state and candidate channels into the user handlers.
    /// Runs as its own task so a slow handler never blocks the worker and
    /// no agent lock is held across a callback.
    pub(super) fn start_callback_routine(
        self: &Arc<Self>,
        chan_receivers: ChanReceivers,
        wg: &WaitGroup,
    ) {
        let ai = Arc::clone(self);
        let w = wg.worker();
        tokio::spawn(async move {
            let _d = w;

            let mut chan_state_rx = chan_receivers.chan_state_rx;
            let mut chan_candidate_rx = chan_receivers.chan_candidate_rx;
            loop {
                tokio::select! {
                    opt_state = chan_state_rx.recv() => {
                        if let Some(state) = opt_state {
                            ai.notify_state(state).await;
                        } else {
                            while let Some(c) = chan_candidate_rx.recv().await {
                                ai.notify_candidate(c).await;
                            }
                            break;
                        }
                    },
                    opt_cand = chan_candidate_rx.recv() => {
                        if let Some(c) = opt_cand {
                            ai.notify_candidate(c).await;
                        } else {
                            while let Some(state) = chan_state_rx.recv().await {
                                ai.notify_state(state).await;
                            }
                            break;
                        }
                    }
                }
            }
        });
    }

    async fn notify_state(&self, state: AgentState) {
        let handler = self.on_state_change_hdlr.load_full();
        if let Some(handler) = handler {
            let mut f = handler.lock().await;
            f(state).await;
        }
    }

    /// `None` is the end-of-gathering marker; it rides the candidate
    /// channel so handlers observe candidates and completion in order.
    async fn notify_candidate(&self, candidate: Option<Arc<Candidate>>) {
        match candidate {
            Some(candidate) => {
                let handler = self.on_candidate_hdlr.load_full();
                if let Some(handler) = handler {
                    let mut f = handler.lock().await;
                    f(candidate).await;
                }
            }
            None => {
                let handler = self.on_gathering_done_hdlr.load_full();
                if let Some(handler) = handler {
                    let mut f = handler.lock().await;
                    f().await;
                }
            }
        }
    }

    /// The instant the worker must wake up at even if nothing arrives:
    /// the earliest pending transmission (pushed past the pacing gate),
    /// or the fail deadline, whichever is first.
    async fn next_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut transmission: Option<Instant> = None;
        let mut armed = false;

        {
            let entries = self.entries.lock().await;
            for entry in entries.iter() {
                if entry.is_finished() {
                    continue;
                }
                if let Some(pair) = &entry.pair {
                    if matches!(
                        pair.state(),
                        CandidatePairState::Frozen | CandidatePairState::Failed
                    ) && !entry.is_armed()
                    {
                        continue;
                    }
                }
                if entry.is_armed() {
                    armed = true;
                    continue;
                }
                let d = entry.deadline();
                if let Some(d) = d {
                    transmission = Some(transmission.map_or(d, |t| t.min(d)));
                }
            }
        }

        if armed {
            transmission = Some(transmission.map_or(now, |t| t.min(now)));
        }

        // A due transmission still waits for the pacer slot to open.
        if let (Some(t), Some(last)) = (transmission, *self.last_transmission.lock()) {
            transmission = Some(t.max(last + STUN_PACING_TIME));
        }

        let mut deadline = transmission;
        if let Some(fd) = *self.fail_deadline.lock() {
            deadline = Some(deadline.map_or(fd, |d| d.min(fd)));
        }
        deadline
    }

    /// The non-blocking half of an event-loop iteration: advance timers,
    /// expire exhausted transactions, fire at most one paced transmission
    /// and progress the agent state machine.
    pub(crate) async fn bookkeep(&self) {
        let now = Instant::now();

        self.check_fail_deadline(now).await;
        if self.state() == AgentState::Failed {
            return;
        }

        self.expire_exhausted_entries(now).await;
        self.check_gathering_done().await;
        self.unfreeze_pairs().await;
        self.check_connecting().await;
        self.fire_due_transmission(now).await;
    }

    async fn check_fail_deadline(&self, now: Instant) {
        let expired = (*self.fail_deadline.lock()).map_or(false, |d| now >= d);
        if !expired {
            return;
        }

        if self.best_pair_in_state(CandidatePairState::Succeeded).await.is_some() {
            *self.fail_deadline.lock() = None;
            return;
        }

        log::info!(
            "[{}]: no verified pair within the fail timeout",
            self.get_name()
        );

        // Abandon in-flight transactions silently.
        {
            let entries = self.entries.lock().await;
            for entry in entries.iter() {
                entry.finish();
            }
        }
        self.update_state(AgentState::Failed).await;
    }

    async fn expire_exhausted_entries(&self, now: Instant) {
        let entries = { self.entries.lock().await.clone() };
        for entry in entries {
            if entry.is_finished() || entry.is_armed() {
                continue;
            }
            if entry.is_due(now) && entry.is_exhausted() {
                entry.finish();
                match entry.kind {
                    EntryKind::Server => {
                        if let Some(server) = &entry.server {
                            log::warn!(
                                "[{}]: STUN server {} unreachable, skipping",
                                self.get_name(),
                                server
                            );
                        }
                    }
                    EntryKind::Check => {
                        if let Some(pair) = &entry.pair {
                            log::trace!(
                                "[{}]: max retransmissions reached for pair {}, marking it as failed",
                                self.get_name(),
                                pair
                            );
                            pair.set_state(CandidatePairState::Failed);
                        }
                    }
                }
            }
        }
    }

    async fn check_gathering_done(&self) {
        if self.gathering_state() != GatheringState::Gathering {
            return;
        }

        let pending = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .any(|e| e.kind == EntryKind::Server && !e.is_finished())
        };
        if pending {
            return;
        }

        self.gathering_state
            .store(GatheringState::Complete as u8, Ordering::SeqCst);
        log::debug!("[{}]: candidate gathering complete", self.get_name());

        // The end-of-gathering marker travels the candidate channel so
        // handlers observe candidates and completion in order.
        {
            let chan_candidate_tx = self.chan_candidate_tx.lock().await;
            if let Some(tx) = &*chan_candidate_tx {
                let _ = tx.send(None).await;
            }
        }
    }

    /// Frozen pairs whose foundation group has no check under way become
    /// Waiting, highest priority first.
    pub(crate) async fn unfreeze_pairs(&self) {
        let checklist = self.checklist.lock().await;
        let mut active: HashSet<String> = checklist
            .iter()
            .filter(|p| {
                matches!(
                    p.state(),
                    CandidatePairState::Waiting | CandidatePairState::InProgress
                )
            })
            .map(|p| p.foundation())
            .collect();

        for pair in checklist.iter() {
            if pair.state() == CandidatePairState::Frozen && active.insert(pair.foundation()) {
                pair.set_state(CandidatePairState::Waiting);
            }
        }
    }

    /// A verified check for one pair unfreezes the rest of its foundation
    /// group.
    pub(crate) async fn unfreeze_foundation(&self, foundation: &str) {
        let checklist = self.checklist.lock().await;
        for pair in checklist.iter() {
            if pair.state() == CandidatePairState::Frozen && pair.foundation() == foundation {
                pair.set_state(CandidatePairState::Waiting);
            }
        }
    }

    async fn check_connecting(&self) {
        if self.state() == AgentState::Gathering
            && self.remote_description_set.load(Ordering::SeqCst)
            && !self.local_candidates.lock().await.is_empty()
        {
            self.update_state(AgentState::Connecting).await;
        }
    }

    /// Fires the highest-ranked eligible transmission, if the pacer allows
    /// one: armed entries first, then Waiting pairs by priority, then due
    /// retransmissions, then the selected-pair keepalive.
    async fn fire_due_transmission(&self, now: Instant) {
        {
            let last = *self.last_transmission.lock();
            if let Some(last) = last {
                if now < last + STUN_PACING_TIME {
                    return;
                }
            }
        }

        let picked = {
            let entries = self.entries.lock().await;
            let mut best: Option<(u8, u64, Arc<StunEntry>)> = None;
            for entry in entries.iter() {
                if entry.is_finished() {
                    continue;
                }
                let armed = entry.is_armed();
                if !armed && !entry.is_due(now) {
                    continue;
                }

                let (rank, priority) = match (&entry.kind, &entry.pair) {
                    (EntryKind::Server, _) => (u8::from(!armed), u64::MAX),
                    (EntryKind::Check, Some(pair)) => {
                        let rank = match pair.state() {
                            CandidatePairState::Frozen | CandidatePairState::Failed if !armed => {
                                continue
                            }
                            _ if armed => 0,
                            CandidatePairState::Waiting => 2,
                            CandidatePairState::InProgress => 3,
                            _ => 4,
                        };
                        (rank, pair.priority())
                    }
                    (EntryKind::Check, None) => continue,
                };

                let better = match &best {
                    None => true,
                    Some((r, p, _)) => rank < *r || (rank == *r && priority > *p),
                };
                if better {
                    best = Some((rank, priority, Arc::clone(entry)));
                }
            }
            best.map(|(_, _, e)| e)
        };

        if let Some(entry) = picked {
            self.transmit(&entry, now).await;
            *self.last_transmission.lock() = Some(now);
        }
    }

    async fn transmit(&self, entry: &Arc<StunEntry>, now: Instant) {
        let (transaction_id, fresh) = entry.begin_transmission(now, self.initial_rto);

        let msg = match entry.kind {
            EntryKind::Server => {
                let mut msg = Message::new();
                match msg.build(&[Box::new(BINDING_REQUEST), Box::new(transaction_id)]) {
                    Ok(()) => msg,
                    Err(err) => {
                        log::error!("{err}");
                        return;
                    }
                }
            }
            EntryKind::Check => {
                let Some(pair) = entry.pair.as_ref() else {
                    return;
                };
                if fresh && pair.state() == CandidatePairState::Waiting {
                    pair.set_state(CandidatePairState::InProgress);
                }

                let (username, remote_pwd) = {
                    let ufrag_pwd = self.ufrag_pwd.lock().await;
                    (
                        ufrag_pwd.remote_ufrag.clone() + ":" + ufrag_pwd.local_ufrag.as_str(),
                        ufrag_pwd.remote_pwd.clone(),
                    )
                };

                let mut setters: Vec<Box<dyn Setter>> = vec![
                    Box::new(BINDING_REQUEST),
                    Box::new(transaction_id),
                    Box::new(Username::new(ATTR_USERNAME, username)),
                ];
                let role = self.role();
                entry.set_sent_role(role);
                if role == Role::Controlled {
                    setters.push(Box::new(AttrControlled(
                        self.tie_breaker.load(Ordering::SeqCst),
                    )));
                } else {
                    setters.push(Box::new(AttrControlling(
                        self.tie_breaker.load(Ordering::SeqCst),
                    )));
                    if entry.use_candidate.load(Ordering::SeqCst) {
                        setters.push(Box::<UseCandidateAttr>::default());
                    }
                }
                setters.push(Box::new(PriorityAttr(pair.local.priority())));
                setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
                    remote_pwd,
                )));
                setters.push(Box::new(FINGERPRINT));

                let mut msg = Message::new();
                match msg.build(&setters) {
                    Ok(()) => msg,
                    Err(err) => {
                        log::error!("{err}");
                        return;
                    }
                }
            }
        };

        log::trace!(
            "[{}]: ping STUN from {} to {}",
            self.get_name(),
            self.local_addr,
            entry.destination
        );
        if let Err(err) = self.conn.send_to(&msg.raw, entry.destination).await {
            log::trace!("[{}]: failed to send STUN message: {}", self.get_name(), err);
        } else if let Some(pair) = &entry.pair {
            pair.local.seen(true);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    pub(crate) async fn handle_read(&self, buf: &[u8], src: SocketAddr) {
        if buf.len() > self.max_message_size {
            log::warn!(
                "[{}]: discard oversized packet ({} bytes) from {}",
                self.get_name(),
                buf.len(),
                src
            );
            return;
        }

        if stun::message::is_message(buf) {
            let mut m = Message {
                raw: vec![],
                ..Message::default()
            };
            // Explicitly copy the raw buffer so the message owns its memory.
            m.raw.extend_from_slice(buf);

            if let Err(err) = m.decode() {
                log::warn!(
                    "[{}]: failed to decode STUN from {}: {}",
                    self.get_name(),
                    src,
                    err
                );
                return;
            }
            self.handle_inbound(&mut m, src).await;
        } else {
            self.handle_inbound_payload(buf, src).await;
        }
    }

    /// Non-STUN bytes are application data, but only from a source we
    /// recognize as a remote candidate.
    async fn handle_inbound_payload(&self, buf: &[u8], src: SocketAddr) {
        let Some(remote) = self.find_remote_candidate(src).await else {
            log::warn!(
                "[{}]: discarded message from {}, not a valid remote candidate",
                self.get_name(),
                src
            );
            return;
        };
        remote.seen(false);
        self.bytes_received.fetch_add(buf.len(), Ordering::SeqCst);

        let handler = self.on_recv_hdlr.load_full();
        if let Some(handler) = handler {
            let mut f = handler.lock().await;
            f(buf.to_vec()).await;
        }
    }

    pub(crate) async fn handle_inbound(&self, m: &mut Message, src: SocketAddr) {
        if m.typ.method != METHOD_BINDING {
            log::trace!(
                "[{}]: unhandled STUN method from {}: {}",
                self.get_name(),
                src,
                m.typ.method
            );
            return;
        }

        if m.typ.class == CLASS_REQUEST {
            self.handle_inbound_request(m, src).await;
        } else if m.typ.class == CLASS_SUCCESS_RESPONSE || m.typ.class == CLASS_ERROR_RESPONSE {
            self.handle_inbound_response(m, src).await;
        } else if m.typ.class == CLASS_INDICATION {
            // Consent/keepalive; refreshes liveness, nothing else.
            if let Some(remote) = self.find_remote_candidate(src).await {
                remote.seen(false);
            }
        }
    }

    async fn handle_inbound_request(&self, m: &mut Message, src: SocketAddr) {
        {
            let ufrag_pwd = self.ufrag_pwd.lock().await;
            if ufrag_pwd.remote_ufrag.is_empty() {
                log::trace!(
                    "[{}]: discard request from {}, no remote credentials yet",
                    self.get_name(),
                    src
                );
                return;
            }

            let username = ufrag_pwd.local_ufrag.clone() + ":" + ufrag_pwd.remote_ufrag.as_str();
            if let Err(err) = assert_inbound_username(m, &username) {
                log::warn!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
                return;
            }
            if let Err(err) = assert_inbound_message_integrity(m, ufrag_pwd.local_pwd.as_bytes()) {
                log::warn!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
                return;
            }
        }
        if FINGERPRINT.check(m).is_err() {
            log::warn!(
                "[{}]: discard message from ({}), fingerprint mismatch",
                self.get_name(),
                src
            );
            return;
        }

        if !self.resolve_role_conflict(m, src).await {
            return;
        }

        let remote = match self.find_remote_candidate(src).await {
            Some(remote) => remote,
            None => {
                // An authenticated check from an unknown source reveals a
                // peer-reflexive candidate, with the priority the peer put
                // in the request.
                let mut priority = PriorityAttr::default();
                let _ = priority.get_from(m);

                let prflx = Arc::new(Candidate::peer_reflexive(src, priority.0));
                log::debug!(
                    "[{}]: adding a new peer-reflexive candidate: {}",
                    self.get_name(),
                    src
                );
                self.add_remote_candidate_internal(&prflx).await;
                prflx
            }
        };
        remote.seen(false);

        log::trace!(
            "[{}]: inbound STUN (Request) from {} to {}",
            self.get_name(),
            src,
            self.local_addr
        );

        let Some(entry) = self.find_or_create_check(&remote).await else {
            return;
        };
        self.handle_binding_request(m, &entry, src).await;
    }

    /// RFC 8445 section 7.3.1.1: resolves a role conflict carried by an
    /// inbound request. Returns false when the request was answered with
    /// 487 and must not be processed further.
    async fn resolve_role_conflict(&self, m: &Message, src: SocketAddr) -> bool {
        let ours = self.tie_breaker.load(Ordering::SeqCst);

        if m.contains(ATTR_ICE_CONTROLLING) {
            let mut theirs = AttrControlling::default();
            if theirs.get_from(m).is_err() {
                return false;
            }
            match self.role() {
                Role::Controlling => {
                    if ours >= theirs.0 {
                        self.send_role_conflict(m, src).await;
                        return false;
                    }
                    self.switch_role(Role::Controlled).await;
                }
                Role::Unspecified => self.adopt_role(Role::Controlled),
                Role::Controlled => {}
            }
        } else if m.contains(ATTR_ICE_CONTROLLED) {
            let mut theirs = AttrControlled::default();
            if theirs.get_from(m).is_err() {
                return false;
            }
            match self.role() {
                Role::Controlled => {
                    if ours >= theirs.0 {
                        self.switch_role(Role::Controlling).await;
                    } else {
                        self.send_role_conflict(m, src).await;
                        return false;
                    }
                }
                Role::Unspecified => self.adopt_role(Role::Controlling),
                Role::Controlling => {}
            }
        }

        true
    }

    fn adopt_role(&self, role: Role) {
        self.role.store(role as u8, Ordering::SeqCst);
        log::debug!("[{}]: adopted role from peer", self.get_name());
    }

    /// Switches role mid-session: pair priorities are rescored, the
    /// ordered index rebuilt, and any pending nomination withdrawn (the
    /// next transmission goes out without USE-CANDIDATE).
    pub(crate) async fn switch_role(&self, role: Role) {
        let leaving_controlling = self.role() == Role::Controlling;
        self.role.store(role as u8, Ordering::SeqCst);
        log::info!("[{}]: switched role to {}", self.get_name(), role);

        {
            let mut checklist = self.checklist.lock().await;
            let controlling = role == Role::Controlling;
            for pair in checklist.iter() {
                pair.controlling.store(controlling, Ordering::SeqCst);
            }
            checklist.sort_by(|a, b| b.priority().cmp(&a.priority()));
        }

        if leaving_controlling {
            let entries = self.entries.lock().await;
            for entry in entries.iter() {
                entry.use_candidate.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn handle_inbound_response(&self, m: &mut Message, src: SocketAddr) {
        let entry = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .find(|e| e.matches_transaction(m.transaction_id))
                .cloned()
        };
        let Some(entry) = entry else {
            log::warn!(
                "[{}]: discard message from ({}), unknown TransactionID 0x{:?}",
                self.get_name(),
                src,
                m.transaction_id
            );
            return;
        };

        // Assert that NAT is not symmetric: the response must come from
        // the address the request went to.
        if src != entry.destination {
            log::debug!(
                "[{}]: discard message: transaction source and destination does not match expected({}), actual({})",
                self.get_name(),
                entry.destination,
                src
            );
            return;
        }

        if entry.kind == EntryKind::Server {
            if m.typ.class == CLASS_SUCCESS_RESPONSE {
                self.handle_server_response(m, &entry).await;
            } else {
                entry.finish();
            }
            return;
        }

        {
            let ufrag_pwd = self.ufrag_pwd.lock().await;
            if let Err(err) = assert_inbound_message_integrity(m, ufrag_pwd.remote_pwd.as_bytes()) {
                log::warn!("[{}]: discard message from ({}), {}", self.get_name(), src, err);
                return;
            }
        }
        if FINGERPRINT.check(m).is_err() {
            log::warn!(
                "[{}]: discard message from ({}), fingerprint mismatch",
                self.get_name(),
                src
            );
            return;
        }

        if let Some(remote) = self.find_remote_candidate(src).await {
            remote.seen(false);
        }

        if m.typ.class == CLASS_ERROR_RESPONSE {
            self.handle_error_response(m, &entry).await;
        } else {
            self.handle_success_response(m, &entry, src).await;
        }
    }

    /// A server-reflexive mapping came back: surface it as a local
    /// candidate unless the transport address is already known.
    async fn handle_server_response(&self, m: &mut Message, entry: &Arc<StunEntry>) {
        entry.finish();

        let mut mapped = XorMappedAddress::default();
        if let Err(err) = mapped.get_from(m) {
            log::warn!(
                "[{}]: invalid STUN server response: {}",
                self.get_name(),
                err
            );
            return;
        }

        let addr = SocketAddr::new(mapped.ip, mapped.port);
        let base = self
            .local_base_for(addr)
            .await
            .map_or(self.local_addr, |c| c.addr());

        log::debug!(
            "[{}]: discovered server-reflexive address {}",
            self.get_name(),
            addr
        );
        let srflx = Arc::new(Candidate::server_reflexive(addr, base));
        self.add_local_candidate(&srflx).await;
    }

    async fn handle_error_response(&self, m: &Message, entry: &Arc<StunEntry>) {
        let mut code = ErrorCodeAttribute::default();
        if code.get_from(m).is_err() {
            self.fail_check(entry).await;
            return;
        }

        if code.code == CODE_ROLE_CONFLICT {
            // Section 7.2.5.1: switch relative to the role the request
            // carried; if the role moved on in the meantime, just retry.
            let target = match entry.sent_role() {
                Role::Controlling => Role::Controlled,
                Role::Controlled => Role::Controlling,
                Role::Unspecified => return,
            };
            if self.role() != target {
                log::info!(
                    "[{}]: remote reported role conflict, retrying as {}",
                    self.get_name(),
                    target
                );
                self.switch_role(target).await;
            }
            entry.arm();
            self.interrupt();
        } else {
            log::warn!(
                "[{}]: binding error from {}: {}",
                self.get_name(),
                entry.destination,
                code
            );
            self.fail_check(entry).await;
        }
    }

    pub(crate) async fn fail_check(&self, entry: &Arc<StunEntry>) {
        entry.finish();
        if let Some(pair) = &entry.pair {
            pair.set_state(CandidatePairState::Failed);
        }
    }

    pub(crate) async fn send_binding_success(&self, m: &Message, src: SocketAddr) {
        let local_pwd = {
            let ufrag_pwd = self.ufrag_pwd.lock().await;
            ufrag_pwd.local_pwd.clone()
        };

        let (out, result) = {
            let mut out = Message::new();
            let result = out.build(&[
                Box::new(m.clone()),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress {
                    ip: src.ip(),
                    port: src.port(),
                }),
                Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
                Box::new(FINGERPRINT),
            ]);
            (out, result)
        };

        match result {
            Err(err) => {
                log::warn!(
                    "[{}]: failed to build success response for {}: {}",
                    self.get_name(),
                    src,
                    err
                );
            }
            Ok(()) => {
                if let Err(err) = self.conn.send_to(&out.raw, src).await {
                    log::trace!(
                        "[{}]: failed to send STUN message: {}",
                        self.get_name(),
                        err
                    );
                }
            }
        }
    }

    async fn send_role_conflict(&self, m: &Message, src: SocketAddr) {
        let local_pwd = {
            let ufrag_pwd = self.ufrag_pwd.lock().await;
            ufrag_pwd.local_pwd.clone()
        };

        let (out, result) = {
            let mut out = Message::new();
            let result = out.build(&[
                Box::new(m.clone()),
                Box::new(BINDING_ERROR),
                Box::new(ErrorCodeAttribute {
                    code: CODE_ROLE_CONFLICT,
                    reason: b"Role Conflict".to_vec(),
                }),
                Box::new(MessageIntegrity::new_short_term_integrity(local_pwd)),
                Box::new(FINGERPRINT),
            ]);
            (out, result)
        };

        match result {
            Err(err) => log::warn!(
                "[{}]: failed to build 487 for {}: {}",
                self.get_name(),
                src,
                err
            ),
            Ok(()) => {
                log::debug!("[{}]: role conflict, replying 487 to {}", self.get_name(), src);
                if let Err(err) = self.conn.send_to(&out.raw, src).await {
                    log::trace!(
                        "[{}]: failed to send STUN message: {}",
                        self.get_name(),
                        err
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Candidate / pair table
    // ------------------------------------------------------------------

    pub(crate) async fn find_remote_candidate(&self, addr: SocketAddr) -> Option<Arc<Candidate>> {
        let remote_candidates = self.remote_candidates.lock().await;
        remote_candidates.iter().find(|c| c.addr() == addr).cloned()
    }

    /// The host candidate checks toward `addr` leave from: same address
    /// family preferred.
    pub(crate) async fn local_base_for(&self, addr: SocketAddr) -> Option<Arc<Candidate>> {
        let local_candidates = self.local_candidates.lock().await;
        local_candidates
            .iter()
            .find(|c| {
                c.candidate_type() == CandidateType::Host
                    && c.addr().is_ipv4() == addr.is_ipv4()
            })
            .or_else(|| {
                local_candidates
                    .iter()
                    .find(|c| c.candidate_type() == CandidateType::Host)
            })
            .cloned()
    }

    /// Registers a local candidate, pairs it against the known remotes and
    /// emits it through the candidate channel.
    pub(crate) async fn add_local_candidate(&self, c: &Arc<Candidate>) {
        {
            let mut local_candidates = self.local_candidates.lock().await;
            if local_candidates.iter().any(|x| x.equal(c)) {
                return;
            }
            local_candidates.push(Arc::clone(c));
        }

        let remotes = { self.remote_candidates.lock().await.clone() };
        for remote in remotes {
            self.add_pair(Arc::clone(c), remote).await;
        }
        self.unfreeze_pairs().await;
        self.check_connecting().await;

        {
            let chan_candidate_tx = self.chan_candidate_tx.lock().await;
            if let Some(tx) = &*chan_candidate_tx {
                let _ = tx.send(Some(Arc::clone(c))).await;
            }
        }
        self.interrupt();
    }

    /// Registers a remote candidate and pairs it with every local base.
    pub(crate) async fn add_remote_candidate_internal(&self, c: &Arc<Candidate>) {
        {
            let mut remote_candidates = self.remote_candidates.lock().await;
            if remote_candidates.iter().any(|x| x.equal(c)) {
                return;
            }
            remote_candidates.push(Arc::clone(c));
        }

        let bases: Vec<Arc<Candidate>> = {
            let local_candidates = self.local_candidates.lock().await;
            local_candidates
                .iter()
                .filter(|x| x.candidate_type() == CandidateType::Host)
                .cloned()
                .collect()
        };
        for base in bases {
            self.add_pair(base, Arc::clone(c)).await;
        }
        self.unfreeze_pairs().await;
        self.interrupt();
    }

    /// Adds a pair (and its Check entry) unless one with the same
    /// (local base, remote) key exists. The ordered index stays sorted by
    /// descending pair priority.
    pub(crate) async fn add_pair(
        &self,
        local: Arc<Candidate>,
        remote: Arc<Candidate>,
    ) -> Option<Arc<StunEntry>> {
        let controlling = self.role() == Role::Controlling;
        let pair = Arc::new(CandidatePair::new(local, remote, controlling));
        let key = pair.key();

        let mut checklist = self.checklist.lock().await;
        let mut entries = self.entries.lock().await;

        if let Some(existing) = checklist.iter().find(|p| p.key() == key) {
            let existing = Arc::clone(existing);
            return entries
                .iter()
                .find(|e| {
                    e.kind == EntryKind::Check
                        && e.pair
                            .as_ref()
                            .map_or(false, |p| Arc::ptr_eq(p, &existing))
                })
                .cloned();
        }

        if checklist.len() >= MAX_CANDIDATE_PAIRS_COUNT {
            let victim = checklist
                .iter()
                .enumerate()
                .filter(|(_, p)| {
                    matches!(
                        p.state(),
                        CandidatePairState::Frozen | CandidatePairState::Failed
                    )
                })
                .min_by_key(|(_, p)| p.priority())
                .map(|(i, _)| i);
            match victim {
                Some(i) => {
                    let evicted = checklist.remove(i);
                    entries.retain(|e| {
                        e.pair
                            .as_ref()
                            .map_or(true, |p| !Arc::ptr_eq(p, &evicted))
                    });
                    log::trace!("[{}]: evicted pair {}", self.get_name(), evicted);
                }
                None => {
                    log::warn!(
                        "[{}]: pair table full, dropping candidate pair {}",
                        self.get_name(),
                        pair
                    );
                    return None;
                }
            }
        }

        let pos = checklist
            .iter()
            .position(|p| p.priority() < pair.priority())
            .unwrap_or(checklist.len());
        checklist.insert(pos, Arc::clone(&pair));

        let entry = Arc::new(StunEntry::new_check(pair, Instant::now()));
        entries.push(Arc::clone(&entry));
        Some(entry)
    }

    /// Resolves the Check entry for (best local base, remote), creating
    /// pair and entry if this source was never paired.
    pub(crate) async fn find_or_create_check(
        &self,
        remote: &Arc<Candidate>,
    ) -> Option<Arc<StunEntry>> {
        let local = self.local_base_for(remote.addr()).await?;
        self.add_pair(local, Arc::clone(remote)).await
    }

    pub(crate) async fn best_pair_in_state(
        &self,
        state: CandidatePairState,
    ) -> Option<Arc<CandidatePair>> {
        let checklist = self.checklist.lock().await;
        // the index is ordered, the first match is the best one
        checklist.iter().find(|p| p.state() == state).cloned()
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Advances the agent state. Transitions are forward-only along the
    /// state DAG; Failed is terminal and surfaced exactly once.
    pub(crate) async fn update_state(&self, new_state: AgentState) {
        let current = self.state();
        if current == AgentState::Failed || new_state <= current {
            return;
        }

        log::info!(
            "[{}]: setting new connection state: {}",
            self.get_name(),
            new_state
        );
        self.state.store(new_state as u8, Ordering::SeqCst);

        match new_state {
            AgentState::Connecting => {
                *self.fail_deadline.lock() = Some(Instant::now() + self.fail_timeout);
            }
            AgentState::Connected | AgentState::Completed => {
                *self.fail_deadline.lock() = None;
            }
            _ => {}
        }

        // Handlers run from the dispatch task with no agent lock held.
        {
            let chan_state_tx = self.chan_state_tx.lock().await;
            if let Some(tx) = &*chan_state_tx {
                let _ = tx.send(new_state).await;
            }
        }
    }

    /// Marks the entry's pair nominated and publishes it as the selected
    /// path. The entry stays live as the keepalive transaction.
    pub(crate) async fn set_selected_entry(&self, entry: &Arc<StunEntry>) {
        let Some(pair) = &entry.pair else { return };

        pair.nominated.store(true, Ordering::SeqCst);
        self.selected_entry.store(Some(Arc::clone(entry)));
        log::info!("[{}]: selected pair {}", self.get_name(), pair);

        entry.reopen(Instant::now(), self.keepalive_period);

        self.update_state(AgentState::Connected).await;
        self.update_state(AgentState::Completed).await;
        self.interrupt();
    }

    pub(crate) fn selected_pair(&self) -> Option<Arc<CandidatePair>> {
        self.selected_entry.load().as_ref().and_then(|e| e.pair.clone())
    }

    // ------------------------------------------------------------------
    // External mutators (called from API tasks)
    // ------------------------------------------------------------------

    pub(crate) async fn set_remote_description_internal(
        &self,
        desc: IceDescription,
    ) -> Result<()> {
        {
            let mut ufrag_pwd = self.ufrag_pwd.lock().await;
            ufrag_pwd.remote_ufrag = desc.ufrag;
            ufrag_pwd.remote_pwd = desc.pwd;
        }
        self.remote_description_set.store(true, Ordering::SeqCst);

        if self.role() == Role::Unspecified {
            // The side that started gathering before learning about its
            // peer acts as the controlling agent.
            let role = if self.gathering_state() == GatheringState::New {
                Role::Controlled
            } else {
                Role::Controlling
            };
            self.role.store(role as u8, Ordering::SeqCst);
            log::debug!("[{}]: resolved role automatically", self.get_name());
        }

        for c in desc.candidates {
            self.add_remote_candidate_internal(&Arc::new(c)).await;
        }
        if desc.end_of_candidates {
            self.remote_gathering_done.store(true, Ordering::SeqCst);
        }

        self.check_connecting().await;
        self.interrupt();
        Ok(())
    }

    pub(crate) async fn close(&self) -> Result<()> {
        {
            let mut done_tx = self.done_tx.lock().await;
            if done_tx.is_none() {
                return Err(Error::ErrClosed);
            }
            done_tx.take();
        }

        {
            let mut chan_state_tx = self.chan_state_tx.lock().await;
            chan_state_tx.take();
        }
        {
            let mut chan_candidate_tx = self.chan_candidate_tx.lock().await;
            chan_candidate_tx.take();
        }

        // In-flight transactions are abandoned silently.
        {
            let entries = self.entries.lock().await;
            for entry in entries.iter() {
                entry.finish();
            }
        }
        self.selected_entry.store(None);

        Ok(())
    }

    pub(crate) async fn is_closed(&self) -> bool {
        let done_tx = self.done_tx.lock().await;
        done_tx.is_none()
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

pub(crate) fn assert_inbound_username(m: &Message, expected_username: &str) -> Result<()> {
    let mut username = Username::new(ATTR_USERNAME, String::new());
    username.get_from(m)?;

    if username.to_string() != expected_username {
        return Err(Error::Other(format!(
            "username mismatch expected({}) actual({})",
            expected_username, username,
        )));
    }

    Ok(())
}

pub(crate) fn assert_inbound_message_integrity(m: &mut Message, key: &[u8]) -> Result<()> {
    let message_integrity_attr = MessageIntegrity(key.to_vec());
    Ok(message_integrity_attr.check(m)?)
}
