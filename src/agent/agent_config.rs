use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use util::vnet::net::*;

use super::agent_internal::AgentInternal;
use crate::attr::Role;
use crate::candidate::RECEIVE_MTU;
use crate::url::Url;

/// Minimum spacing between any two STUN transmissions by one agent (Ta).
pub(crate) const STUN_PACING_TIME: Duration = Duration::from_millis(50);

/// Floor for the retransmission timeout; doubles on every retry.
pub(crate) const MIN_STUN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(500);

/// Transmissions per transaction before the entry is abandoned.
pub(crate) const MAX_STUN_RETRANSMISSION_COUNT: u8 = 5;

/// Keepalive cadence on the selected pair once nominated.
pub(crate) const STUN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// How long connectivity checks may run without a verified pair before
/// the agent becomes Failed. Counted from entering Connecting.
pub(crate) const ICE_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Table capacities. Tables never reallocate past these.
pub(crate) const MAX_HOST_CANDIDATES_COUNT: usize = 8;
pub(crate) const MAX_STUN_SERVER_RECORDS_COUNT: usize = 2;
pub(crate) const MAX_CANDIDATE_PAIRS_COUNT: usize = 32;

pub type InterfaceFilterFn = Box<dyn (Fn(&str) -> bool) + Send + Sync>;
pub type IpFilterFn = Box<dyn (Fn(IpAddr) -> bool) + Send + Sync>;

/// Collects the arguments to `Agent` construction into a single structure,
/// for future-proofness of the interface.
#[derive(Default)]
pub struct AgentConfig {
    /// STUN servers used for server-reflexive discovery. At most
    /// `MAX_STUN_SERVER_RECORDS_COUNT` are consulted.
    pub urls: Vec<Url>,

    /// Role hint. `Role::Unspecified` resolves automatically: the side
    /// whose gathering started before the remote description arrived
    /// takes the controlling role.
    pub role: Role,

    /// It is used to perform connectivity checks. The values MUST be
    /// unguessable, with at least 128 bits of random number generator
    /// output used to generate the password, and at least 24 bits of
    /// output to generate the username fragment.
    pub local_ufrag: String,
    pub local_pwd: String,

    /// Address to bind the agent's UDP socket to. Unset means the
    /// unspecified IPv4 address. Binding to a loopback address implies
    /// `include_loopback`.
    pub bind_address: Option<IpAddr>,

    /// Restrict the ephemeral port chosen for the socket. Zero means any.
    pub port_min: u16,
    pub port_max: u16,

    /// Largest datagram accepted or sent. Zero selects the receive MTU.
    pub max_message_size: usize,

    /// Include loopback addresses when enumerating host candidates.
    pub include_loopback: bool,

    /// Initial STUN retransmission timeout; clamped up to
    /// `MIN_STUN_RETRANSMISSION_TIMEOUT`.
    pub initial_rto: Option<Duration>,

    /// Keepalive cadence on the selected pair. Only useful for testing.
    pub keepalive_period: Option<Duration>,

    /// How long connectivity checks may run without a verified pair.
    /// Only useful for testing.
    pub fail_timeout: Option<Duration>,

    /// Whitelist/blacklist the interfaces considered for host candidates.
    pub interface_filter: Arc<Option<InterfaceFilterFn>>,

    /// Whitelist/blacklist the addresses considered for host candidates.
    pub ip_filter: Arc<Option<IpFilterFn>>,

    /// Abstracted network interface, swappable for a virtual one in tests.
    pub net: Option<Arc<Net>>,
}

impl AgentConfig {
    /// Populates an agent and falls back to defaults if fields are unset.
    pub(crate) fn init_with_defaults(&self, a: &mut AgentInternal) {
        a.initial_rto = self
            .initial_rto
            .map_or(MIN_STUN_RETRANSMISSION_TIMEOUT, |rto| {
                rto.max(MIN_STUN_RETRANSMISSION_TIMEOUT)
            });

        a.keepalive_period = self.keepalive_period.unwrap_or(STUN_KEEPALIVE_PERIOD);
        a.fail_timeout = self.fail_timeout.unwrap_or(ICE_FAIL_TIMEOUT);

        a.max_message_size = if self.max_message_size == 0 {
            RECEIVE_MTU
        } else {
            self.max_message_size.min(RECEIVE_MTU)
        };
    }
}
