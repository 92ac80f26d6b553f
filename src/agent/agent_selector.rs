use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use stun::message::Message;
use tokio::time::{Duration, Instant};

use super::agent_entry::StunEntry;
use super::agent_internal::AgentInternal;
use crate::attr::{Role, UseCandidateAttr};
use crate::candidate::CandidatePairState;
use crate::state::AgentState;

#[async_trait]
trait ControllingSelector {
    async fn handle_success_response(&self, m: &Message, entry: &Arc<StunEntry>, src: SocketAddr);
    async fn handle_binding_request(&self, m: &Message, entry: &Arc<StunEntry>, src: SocketAddr);
}

#[async_trait]
trait ControlledSelector {
    async fn handle_success_response(&self, m: &Message, entry: &Arc<StunEntry>, src: SocketAddr);
    async fn handle_binding_request(&self, m: &Message, entry: &Arc<StunEntry>, src: SocketAddr);
}

impl AgentInternal {
    pub(crate) async fn handle_success_response(
        &self,
        m: &Message,
        entry: &Arc<StunEntry>,
        src: SocketAddr,
    ) {
        if self.role() == Role::Controlling {
            ControllingSelector::handle_success_response(self, m, entry, src).await;
        } else {
            ControlledSelector::handle_success_response(self, m, entry, src).await;
        }
    }

    pub(crate) async fn handle_binding_request(
        &self,
        m: &Message,
        entry: &Arc<StunEntry>,
        src: SocketAddr,
    ) {
        if self.role() == Role::Controlling {
            ControllingSelector::handle_binding_request(self, m, entry, src).await;
        } else {
            ControlledSelector::handle_binding_request(self, m, entry, src).await;
        }
    }

    /// Shared bookkeeping for a verified success response on a Check
    /// entry: the pair is proven, its foundation group thaws, and the
    /// agent is at least Connected.
    async fn record_pair_success(&self, entry: &Arc<StunEntry>) {
        let Some(pair) = &entry.pair else { return };

        pair.set_state(CandidatePairState::Succeeded);
        log::trace!("[{}]: found valid candidate pair: {}", self.get_name(), pair);

        self.unfreeze_foundation(&pair.foundation()).await;
        self.update_state(AgentState::Connected).await;
    }

    /// Keeps the selected entry alive as the keepalive transaction;
    /// everything else is done once its response arrived.
    fn settle_entry(&self, entry: &Arc<StunEntry>) {
        let selected = self
            .selected_entry
            .load()
            .as_ref()
            .map_or(false, |s| Arc::ptr_eq(s, entry));
        if selected {
            entry.reopen(Instant::now(), self.keepalive_period);
        } else {
            entry.finish();
        }
    }

    /// A check succeeded while we are controlling and nothing is selected
    /// yet: nominate the best verified pair by re-issuing its check with
    /// USE-CANDIDATE on the next pacer slot.
    async fn nominate_best_pair(&self) {
        if self.selected_entry.load().is_some() {
            return;
        }

        let Some(best) = self.best_pair_in_state(CandidatePairState::Succeeded).await else {
            return;
        };

        let entry = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .find(|e| {
                    e.pair
                        .as_ref()
                        .map_or(false, |p| Arc::ptr_eq(p, &best))
                })
                .cloned()
        };
        let Some(entry) = entry else { return };

        if !entry.use_candidate.swap(true, Ordering::SeqCst) {
            log::trace!(
                "[{}]: nominating pair {} with USE-CANDIDATE",
                self.get_name(),
                best
            );
            // the original check settled this entry, bring it back for
            // the nominating transaction
            entry.reopen(Instant::now(), Duration::from_secs(0));
            entry.arm();
            self.interrupt();
        }
    }

    /// Triggered check: an inbound request guarantees the reverse path is
    /// worth probing right away.
    async fn trigger_check(&self, entry: &Arc<StunEntry>) {
        let Some(pair) = &entry.pair else { return };
        match pair.state() {
            CandidatePairState::Succeeded | CandidatePairState::InProgress => {}
            _ => {
                // a Failed pair gets another chance here, so its finished
                // entry must come back to life too
                if entry.is_finished() {
                    entry.reopen(Instant::now(), Duration::from_secs(0));
                }
                pair.set_state(CandidatePairState::Waiting);
                entry.arm();
                self.interrupt();
            }
        }
    }
}

#[async_trait]
impl ControllingSelector for AgentInternal {
    async fn handle_success_response(&self, _m: &Message, entry: &Arc<StunEntry>, src: SocketAddr) {
        log::trace!(
            "[{}]: inbound STUN (SuccessResponse) from {}",
            self.get_name(),
            src
        );

        let nominating = entry.use_candidate.load(Ordering::SeqCst);
        self.record_pair_success(entry).await;

        if nominating && self.selected_entry.load().is_none() {
            // The peer confirmed the nominated check: the pair is selected
            // and the session is complete.
            self.set_selected_entry(entry).await;
        } else {
            self.settle_entry(entry);
            self.nominate_best_pair().await;
        }
    }

    async fn handle_binding_request(&self, m: &Message, entry: &Arc<StunEntry>, src: SocketAddr) {
        self.send_binding_success(m, src).await;

        // A conformant controlled peer never sets USE-CANDIDATE; if it
        // appears here the role conflict was already resolved in our
        // favor, so the attribute is ignored.
        self.trigger_check(entry).await;

        if entry
            .pair
            .as_ref()
            .map_or(false, |p| p.state() == CandidatePairState::Succeeded)
        {
            self.nominate_best_pair().await;
        }
    }
}

#[async_trait]
impl ControlledSelector for AgentInternal {
    async fn handle_success_response(&self, _m: &Message, entry: &Arc<StunEntry>, src: SocketAddr) {
        // https://tools.ietf.org/html/rfc8445#section-7.3.1.5
        // The controlled side never nominates; it validates pairs and
        // waits for the peer's USE-CANDIDATE.
        log::trace!(
            "[{}]: inbound STUN (SuccessResponse) from {}",
            self.get_name(),
            src
        );

        self.record_pair_success(entry).await;

        let requested = entry
            .pair
            .as_ref()
            .map_or(false, |p| p.nomination_requested.load(Ordering::SeqCst));
        if requested && self.selected_entry.load().is_none() {
            self.set_selected_entry(entry).await;
        } else {
            self.settle_entry(entry);
        }
    }

    async fn handle_binding_request(&self, m: &Message, entry: &Arc<StunEntry>, src: SocketAddr) {
        self.send_binding_success(m, src).await;

        let Some(pair) = &entry.pair else { return };

        if UseCandidateAttr::is_set(m) {
            pair.nomination_requested.store(true, Ordering::SeqCst);

            if pair.state() == CandidatePairState::Succeeded {
                // The check previously sent on this pair produced a
                // verified result; accept the nomination as-is.
                if self.selected_entry.load().is_none() {
                    self.set_selected_entry(entry).await;
                }
                return;
            }
        }

        self.trigger_check(entry).await;
    }
}
