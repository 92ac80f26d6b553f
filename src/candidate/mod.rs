#[cfg(test)]
mod candidate_pair_test;

pub mod candidate_pair;

pub use candidate_pair::*;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};

use crate::error::*;

/// Largest datagram the agent will read from its socket.
pub(crate) const RECEIVE_MTU: usize = 8192;

/// The single data component this agent supports.
pub(crate) const COMPONENT_DATA: u16 = 1;

/// Local preferences ordering address families within a candidate type:
/// global IPv6 above IPv4, link-local IPv6 below both.
pub(crate) const LOCAL_PREFERENCE_IPV6: u16 = 65535;
pub(crate) const LOCAL_PREFERENCE_IPV4: u16 = 32767;
pub(crate) const LOCAL_PREFERENCE_LINK_LOCAL: u16 = 16383;

/// The type of an ICE candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum CandidateType {
    #[serde(rename = "host")]
    Host,
    #[serde(rename = "srflx")]
    ServerReflexive,
    #[serde(rename = "prflx")]
    PeerReflexive,
    /// Accepted from remote descriptions; never gathered locally.
    #[serde(rename = "relay")]
    Relayed,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        };
        write!(f, "{s}")
    }
}

impl CandidateType {
    /// Type preference per RFC 8445 section 5.1.2.2: 126 for host, 110
    /// for peer reflexive, 100 for server reflexive, 0 for relayed.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relayed => 0,
        }
    }
}

/// A single transport address an agent can exchange data from.
///
/// All local candidates share the agent's one UDP socket, so a candidate
/// is pure description: address, type, priority, foundation. Liveness
/// timestamps are atomics because the worker and API threads both touch
/// them.
pub struct Candidate {
    candidate_type: CandidateType,
    addr: SocketAddr,
    /// Address checks for this candidate are actually sent from. Equals
    /// `addr` for host candidates.
    base_addr: SocketAddr,
    related_addr: Option<SocketAddr>,
    component: u16,

    foundation_override: String,
    priority_override: u32,

    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.candidate_type, self.addr)
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (prio {})", self.candidate_type, self.addr, self.priority())
    }
}

impl Candidate {
    /// A candidate on a local interface address.
    pub fn host(addr: SocketAddr) -> Self {
        Self::new(CandidateType::Host, addr, addr, None)
    }

    /// A candidate discovered through a STUN server; `base` is the local
    /// socket address the mapping was observed for.
    pub fn server_reflexive(addr: SocketAddr, base: SocketAddr) -> Self {
        Self::new(CandidateType::ServerReflexive, addr, base, Some(base))
    }

    /// A remote candidate synthesized from the source address of an
    /// authenticated inbound check, with the priority the peer advertised.
    pub fn peer_reflexive(addr: SocketAddr, priority: u32) -> Self {
        let mut c = Self::new(CandidateType::PeerReflexive, addr, addr, None);
        c.priority_override = priority;
        c
    }

    fn new(
        candidate_type: CandidateType,
        addr: SocketAddr,
        base_addr: SocketAddr,
        related_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            candidate_type,
            addr,
            base_addr,
            related_addr,
            component: COMPONENT_DATA,
            foundation_override: String::new(),
            priority_override: 0,
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    pub fn candidate_type(&self) -> CandidateType {
        self.candidate_type
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_addr(&self) -> SocketAddr {
        self.base_addr
    }

    pub fn related_addr(&self) -> Option<SocketAddr> {
        self.related_addr
    }

    pub fn component(&self) -> u16 {
        self.component
    }

    fn local_preference(&self) -> u16 {
        match self.base_addr.ip() {
            IpAddr::V6(ip) => {
                if (ip.segments()[0] & 0xffc0) == 0xfe80 {
                    LOCAL_PREFERENCE_LINK_LOCAL
                } else {
                    LOCAL_PREFERENCE_IPV6
                }
            }
            IpAddr::V4(_) => LOCAL_PREFERENCE_IPV4,
        }
    }

    /// Candidate priority per RFC 8445 section 5.1.2.1.
    pub fn priority(&self) -> u32 {
        if self.priority_override != 0 {
            return self.priority_override;
        }

        (1 << 24) * u32::from(self.candidate_type.preference())
            + (1 << 8) * u32::from(self.local_preference())
            + (256 - u32::from(self.component))
    }

    /// An opaque string grouping candidates that share type, base address
    /// and transport, so freezing acts per group.
    pub fn foundation(&self) -> String {
        if !self.foundation_override.is_empty() {
            return self.foundation_override.clone();
        }

        let mut buf = vec![];
        buf.extend_from_slice(self.candidate_type.to_string().as_bytes());
        buf.extend_from_slice(self.base_addr.ip().to_string().as_bytes());
        buf.extend_from_slice(b"udp");

        let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);
        format!("{checksum}")
    }

    /// The candidate-attribute value exchanged in session descriptions.
    pub fn marshal(&self) -> String {
        let mut val = format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation(),
            self.component,
            self.priority(),
            self.addr.ip(),
            self.addr.port(),
            self.candidate_type
        );

        if let Some(related) = self.related_addr {
            val += format!(" raddr {} rport {}", related.ip(), related.port()).as_str();
        }

        val
    }

    pub(crate) fn seen(&self, outbound: bool) {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));

        #[allow(clippy::cast_possible_truncation)]
        let nanos = d.as_nanos() as u64;
        if outbound {
            self.last_sent.store(nanos, Ordering::SeqCst);
        } else {
            self.last_received.store(nanos, Ordering::SeqCst);
        }
    }

    /// The last time traffic left through this candidate.
    pub fn last_sent(&self) -> SystemTime {
        UNIX_EPOCH.add(Duration::from_nanos(self.last_sent.load(Ordering::SeqCst)))
    }

    /// The last time traffic arrived from this candidate.
    pub fn last_received(&self) -> SystemTime {
        UNIX_EPOCH.add(Duration::from_nanos(
            self.last_received.load(Ordering::SeqCst),
        ))
    }

    /// Value equality: two candidates describe the same path if type and
    /// transport address agree.
    pub fn equal(&self, other: &Candidate) -> bool {
        self.candidate_type == other.candidate_type
            && self.addr == other.addr
            && self.related_addr == other.related_addr
    }
}

/// Creates a candidate from its attribute-value representation,
/// `<foundation> <component> udp <priority> <address> <port> typ <type>
/// [raddr <address> rport <port>]`.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::Other(format!(
            "{:?} ({})",
            Error::ErrAttributeTooShortIceCandidate,
            split.len()
        )));
    }

    let foundation = split[0].to_owned();
    let component: u16 = split[1].parse()?;
    let priority: u32 = split[3].parse()?;

    let ip: IpAddr = split[4].parse().map_err(|_| Error::ErrAddressParseFailed)?;
    let port: u16 = split[5].parse()?;
    let addr = SocketAddr::new(ip, port);

    let mut related_addr = None;
    if split.len() > 8 {
        let split2 = &split[8..];
        if split2[0] == "raddr" {
            if split2.len() < 4 {
                return Err(Error::Other(format!(
                    "{:?}: incorrect length",
                    Error::ErrParseRelatedAddr
                )));
            }

            let rel_ip: IpAddr = split2[1].parse().map_err(|_| Error::ErrAddressParseFailed)?;
            let rel_port: u16 = split2[3].parse()?;
            related_addr = Some(SocketAddr::new(rel_ip, rel_port));
        }
    }

    let candidate_type = match split[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relayed,
        typ => {
            return Err(Error::Other(format!(
                "{:?} ({})",
                Error::ErrUnknownCandidateType,
                typ
            )))
        }
    };

    let mut c = Candidate::new(candidate_type, addr, addr, related_addr);
    c.component = component;
    c.priority_override = priority;
    c.foundation_override = foundation;
    Ok(c)
}
