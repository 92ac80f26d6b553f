use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::time::Instant;
use util::vnet::net::*;
use util::Conn;

use super::agent_config::*;
use super::agent_entry::StunEntry;
use super::agent_internal::AgentInternal;
use super::Agent;
use crate::candidate::Candidate;
use crate::error::*;
use crate::state::AgentState;
use crate::url::Url;

pub(crate) struct GatherCandidatesInternalParams {
    pub(crate) urls: Vec<Url>,
    pub(crate) net: Arc<Net>,
    pub(crate) interface_filter: Arc<Option<InterfaceFilterFn>>,
    pub(crate) ip_filter: Arc<Option<IpFilterFn>>,
    pub(crate) include_loopback: bool,
    pub(crate) agent_internal: Arc<AgentInternal>,
}

impl Agent {
    pub(crate) async fn gather_candidates_internal(params: GatherCandidatesInternalParams) {
        let ai = Arc::clone(&params.agent_internal);

        ai.update_state(AgentState::Gathering).await;

        Self::gather_host_candidates(
            &ai,
            &params.net,
            &params.interface_filter,
            &params.ip_filter,
            params.include_loopback,
        )
        .await;
        Self::gather_server_reflexive(&ai, &params.urls).await;

        // Completion is observed by the worker: gathering is done once
        // every Server entry finished (or there were none).
        ai.interrupt();
    }

    async fn gather_host_candidates(
        ai: &Arc<AgentInternal>,
        net: &Arc<Net>,
        interface_filter: &Arc<Option<InterfaceFilterFn>>,
        ip_filter: &Arc<Option<IpFilterFn>>,
        include_loopback: bool,
    ) {
        let port = ai.local_addr.port();

        let ips: Vec<IpAddr> = if ai.local_addr.ip().is_unspecified() {
            local_interfaces(
                net,
                interface_filter,
                ip_filter,
                ai.local_addr.is_ipv4(),
                include_loopback,
            )
            .await
            .into_iter()
            .collect()
        } else {
            // An explicit bind address is the single usable base.
            vec![ai.local_addr.ip()]
        };

        if ips.is_empty() {
            log::error!(
                "[{}]: {}",
                ai.get_name(),
                Error::ErrNoUsableInterfaces
            );
            return;
        }

        for ip in ips.into_iter().take(MAX_HOST_CANDIDATES_COUNT) {
            let candidate = Arc::new(Candidate::host(SocketAddr::new(ip, port)));
            log::debug!("[{}]: gathered host candidate {}", ai.get_name(), candidate);
            ai.add_local_candidate(&candidate).await;
        }
    }

    /// One armed Server entry per resolved STUN server; the worker paces
    /// the transactions and collects XOR-MAPPED-ADDRESS results.
    async fn gather_server_reflexive(ai: &Arc<AgentInternal>, urls: &[Url]) {
        for url in urls.iter().take(MAX_STUN_SERVER_RECORDS_COUNT) {
            let destination = match url.resolve(ai.local_addr.is_ipv4()).await {
                Ok(destination) => destination,
                Err(err) => {
                    log::warn!(
                        "[{}]: failed to resolve STUN server {}: {}",
                        ai.get_name(),
                        url,
                        err
                    );
                    continue;
                }
            };

            let entry = Arc::new(StunEntry::new_server(url.clone(), destination, Instant::now()));
            let mut entries = ai.entries.lock().await;
            entries.push(entry);
        }
    }
}

/// Walks the host's interfaces and returns the addresses usable as host
/// candidate bases for a socket of the given family.
pub(crate) async fn local_interfaces(
    vnet: &Arc<Net>,
    interface_filter: &Option<InterfaceFilterFn>,
    ip_filter: &Option<IpFilterFn>,
    want_ipv4: bool,
    include_loopback: bool,
) -> HashSet<IpAddr> {
    let mut ips = HashSet::new();
    let interfaces = vnet.get_interfaces().await;

    for iface in interfaces {
        if let Some(filter) = interface_filter {
            if !filter(iface.name()) {
                continue;
            }
        }

        for ipnet in iface.addrs() {
            let ipaddr = ipnet.addr();

            if (!ipaddr.is_loopback() || include_loopback)
                && ipaddr.is_ipv4() == want_ipv4
                && ip_filter
                    .as_ref()
                    .map(|filter| filter(ipaddr))
                    .unwrap_or(true)
            {
                ips.insert(ipaddr);
            }
        }
    }

    ips
}

/// Binds the agent's UDP socket, honouring an optional port range when the
/// requested port is ephemeral.
pub(crate) async fn listen_udp_in_port_range(
    vnet: &Arc<Net>,
    port_max: u16,
    port_min: u16,
    laddr: SocketAddr,
) -> Result<Arc<dyn Conn + Send + Sync>> {
    if laddr.port() != 0 || (port_min == 0 && port_max == 0) {
        return Ok(vnet.bind(laddr).await?);
    }
    let i = if port_min == 0 { 1 } else { port_min };
    let j = if port_max == 0 { 0xFFFF } else { port_max };
    if i > j {
        return Err(Error::ErrPort);
    }

    let port_start = rand::random::<u16>() % (j - i + 1) + i;
    let mut port_current = port_start;
    loop {
        let laddr = SocketAddr::new(laddr.ip(), port_current);
        match vnet.bind(laddr).await {
            Ok(c) => return Ok(c),
            Err(err) => log::debug!("failed to listen {}: {}", laddr, err),
        };

        port_current += 1;
        if port_current > j {
            port_current = i;
        }
        if port_current == port_start {
            break;
        }
    }

    Err(Error::ErrPort)
}
