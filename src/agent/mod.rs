#[cfg(test)]
mod agent_test;
#[cfg(test)]
mod agent_transport_test;

pub mod agent_config;
pub(crate) mod agent_entry;
pub mod agent_gather;
pub(crate) mod agent_internal;
pub mod agent_selector;
pub mod agent_transport;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use agent_config::*;
use agent_gather::{listen_udp_in_port_range, GatherCandidatesInternalParams};
use agent_internal::*;
use tokio::sync::Mutex;
use util::vnet::net::*;
use waitgroup::WaitGroup;

use crate::attr::Role;
use crate::candidate::Candidate;
use crate::error::*;
use crate::rand::{generate_pwd, generate_ufrag};
use crate::sdp;
use crate::state::{AgentState, GatheringState};
use crate::url::Url;

pub type OnStateChangeHdlrFn = Box<
    dyn (FnMut(AgentState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnCandidateHdlrFn = Box<
    dyn (FnMut(Arc<Candidate>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnGatheringDoneHdlrFn =
    Box<dyn (FnMut() -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync>;
pub type OnRecvHdlrFn = Box<
    dyn (FnMut(Vec<u8>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

/// Represents the ICE agent.
pub struct Agent {
    pub(crate) internal: Arc<AgentInternal>,

    pub(crate) urls: Vec<Url>,
    pub(crate) net: Arc<Net>,
    pub(crate) interface_filter: Arc<Option<InterfaceFilterFn>>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    pub(crate) include_loopback: bool,

    wg: Mutex<Option<WaitGroup>>,
}

impl Agent {
    /// Creates a new agent: binds the UDP socket and starts the worker.
    /// Candidate gathering only begins with [`Agent::gather_candidates`].
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let mut ufrag = config.local_ufrag.clone();
        let mut pwd = config.local_pwd.clone();
        if ufrag.is_empty() {
            ufrag = generate_ufrag();
        }
        if pwd.is_empty() {
            pwd = generate_pwd();
        }
        if ufrag.len() * 8 < 24 {
            return Err(Error::ErrLocalUfragInsufficientBits);
        }
        if pwd.len() * 8 < 128 {
            return Err(Error::ErrLocalPwdInsufficientBits);
        }

        let net = if let Some(net) = &config.net {
            if net.is_virtual() {
                log::warn!("vnet is enabled");
            }
            Arc::clone(net)
        } else {
            Arc::new(Net::new(None))
        };

        let bind_ip = config
            .bind_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let conn = listen_udp_in_port_range(
            &net,
            config.port_max,
            config.port_min,
            SocketAddr::new(bind_ip, 0),
        )
        .await?;
        let local_addr = conn.local_addr().await?;

        let (mut ai, chan_receivers) = AgentInternal::new(&config, conn, local_addr);
        config.init_with_defaults(&mut ai);
        {
            let ufrag_pwd = ai.ufrag_pwd.get_mut();
            ufrag_pwd.local_ufrag = ufrag;
            ufrag_pwd.local_pwd = pwd;
        }

        let agent = Self {
            internal: Arc::new(ai),
            urls: config.urls.clone(),
            net,
            interface_filter: Arc::clone(&config.interface_filter),
            ip_filter: Arc::clone(&config.ip_filter),
            include_loopback: config.include_loopback || bind_ip.is_loopback(),
            wg: Mutex::new(Some(WaitGroup::new())),
        };

        {
            let wg = agent.wg.lock().await;
            if let Some(wg) = &*wg {
                agent.internal.start_callback_routine(chan_receivers, wg);
                agent.internal.start_event_loop(wg);
            }
        }

        Ok(agent)
    }

    /// Sets a handler that is fired when the agent state changes.
    pub fn on_state_change(&self, f: OnStateChangeHdlrFn) {
        self.internal
            .on_state_change_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired for every local candidate as it is
    /// gathered (trickle).
    pub fn on_candidate(&self, f: OnCandidateHdlrFn) {
        self.internal
            .on_candidate_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired once local gathering finished.
    pub fn on_gathering_done(&self, f: OnGatheringDoneHdlrFn) {
        self.internal
            .on_gathering_done_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Sets a handler that is fired for every inbound application payload.
    pub fn on_recv(&self, f: OnRecvHdlrFn) {
        self.internal
            .on_recv_hdlr
            .store(Some(Arc::new(Mutex::new(f))));
    }

    /// Initiates the trickle based gathering process: host candidates are
    /// enumerated and each configured STUN server is queried for a
    /// server-reflexive mapping.
    pub async fn gather_candidates(&self) -> Result<()> {
        if self.internal.is_closed().await {
            return Err(Error::ErrClosed);
        }
        if self.internal.gathering_state() != GatheringState::New {
            return Err(Error::ErrMultipleGatherAttempted);
        }
        self.internal
            .gathering_state
            .store(GatheringState::Gathering as u8, Ordering::SeqCst);

        let params = GatherCandidatesInternalParams {
            urls: self.urls.clone(),
            net: Arc::clone(&self.net),
            interface_filter: Arc::clone(&self.interface_filter),
            ip_filter: Arc::clone(&self.ip_filter),
            include_loopback: self.include_loopback,
            agent_internal: Arc::clone(&self.internal),
        };
        tokio::spawn(async move {
            Self::gather_candidates_internal(params).await;
        });

        Ok(())
    }

    /// Serializes the local description: credentials, the candidates
    /// gathered so far and, once gathering finished, the end marker.
    pub async fn local_description(&self) -> String {
        let (ufrag, pwd) = self.local_credentials().await;
        let candidates = self.local_candidates().await;
        sdp::marshal_description(
            self.internal.session_id,
            &ufrag,
            &pwd,
            &candidates,
            self.internal.gathering_state() == GatheringState::Complete,
        )
    }

    /// Applies the peer's description: remote credentials plus any
    /// candidates it already knows. More may trickle in afterwards via
    /// [`Agent::add_remote_candidate`].
    pub async fn set_remote_description(&self, raw: &str) -> Result<()> {
        if self.internal.is_closed().await {
            return Err(Error::ErrClosed);
        }

        let desc = sdp::parse_description(raw)?;
        self.internal.set_remote_description_internal(desc).await
    }

    /// Adds one trickled remote candidate attribute. The remote
    /// description must have been set first (it carries the credentials
    /// that authenticate checks toward the new candidate).
    pub async fn add_remote_candidate(&self, raw: &str) -> Result<()> {
        if self.internal.is_closed().await {
            return Err(Error::ErrClosed);
        }
        if !self
            .internal
            .remote_description_set
            .load(Ordering::SeqCst)
        {
            return Err(Error::ErrNoRemoteDescription);
        }

        let trimmed = raw.trim();
        if trimmed == "a=end-of-candidates" || trimmed == "end-of-candidates" {
            self.set_remote_gathering_done();
            return Ok(());
        }

        let candidate = sdp::parse_candidate(raw)?;
        self.internal
            .add_remote_candidate_internal(&Arc::new(candidate))
            .await;
        Ok(())
    }

    /// Marks the remote candidate list complete.
    pub fn set_remote_gathering_done(&self) {
        self.internal
            .remote_gathering_done
            .store(true, Ordering::SeqCst);
        self.internal.interrupt();
    }

    /// Returns the current agent state.
    pub fn state(&self) -> AgentState {
        self.internal.state()
    }

    /// Returns the gathering state.
    pub fn gathering_state(&self) -> GatheringState {
        self.internal.gathering_state()
    }

    /// Returns the role the agent currently plays.
    pub fn role(&self) -> Role {
        self.internal.role()
    }

    /// Returns the local candidates gathered so far.
    pub async fn local_candidates(&self) -> Vec<Arc<Candidate>> {
        let local_candidates = self.internal.local_candidates.lock().await;
        local_candidates.clone()
    }

    /// Returns the local user credentials.
    pub async fn local_credentials(&self) -> (String, String) {
        let ufrag_pwd = self.internal.ufrag_pwd.lock().await;
        (ufrag_pwd.local_ufrag.clone(), ufrag_pwd.local_pwd.clone())
    }

    /// Returns the remote user credentials.
    pub async fn remote_credentials(&self) -> (String, String) {
        let ufrag_pwd = self.internal.ufrag_pwd.lock().await;
        (ufrag_pwd.remote_ufrag.clone(), ufrag_pwd.remote_pwd.clone())
    }

    /// Cleans up the agent: stops the worker, abandons in-flight
    /// transactions and joins the background tasks.
    pub async fn close(&self) -> Result<()> {
        self.internal.close().await?;

        let wg = {
            let mut wg = self.wg.lock().await;
            wg.take()
        };
        if let Some(wg) = wg {
            wg.wait().await;
        }

        Ok(())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("local_addr", &self.internal.local_addr)
            .field("state", &self.internal.state())
            .field("role", &self.internal.role())
            .finish()
    }
}
