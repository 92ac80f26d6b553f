use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::agent_internal::AgentInternal;
use super::Agent;
use crate::candidate::{CandidatePair, CandidatePairState};
use crate::error::*;
use crate::state::AgentState;

impl Agent {
    /// Sends an application payload to the peer over the selected pair.
    ///
    /// Until nomination completes the best verified pair is used, so data
    /// queued right after the first check succeeds is not dropped.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.internal.send_payload(data).await
    }

    /// Returns the nominated pair, or `None` before nomination.
    pub fn selected_candidate_pair(&self) -> Option<Arc<CandidatePair>> {
        self.internal.selected_pair()
    }

    /// Returns the number of application bytes sent.
    pub fn bytes_sent(&self) -> usize {
        self.internal.bytes_sent.load(Ordering::SeqCst)
    }

    /// Returns the number of application bytes received.
    pub fn bytes_received(&self) -> usize {
        self.internal.bytes_received.load(Ordering::SeqCst)
    }
}

impl AgentInternal {
    pub(crate) async fn send_payload(&self, data: &[u8]) -> Result<usize> {
        if self.is_closed().await {
            return Err(Error::ErrClosed);
        }
        if self.state() == AgentState::Failed {
            return Err(Error::ErrAgentFailed);
        }
        if data.len() > self.max_message_size {
            return Err(Error::ErrPacketTooLarge);
        }
        if stun::message::is_message(data) {
            return Err(Error::ErrWriteStunMessage);
        }

        // The selected entry is read lock-free so sending never contends
        // with the worker.
        let (destination, pair) = match self.selected_entry.load_full() {
            Some(entry) => (entry.destination, entry.pair.clone()),
            None => match self.best_pair_in_state(CandidatePairState::Succeeded).await {
                Some(pair) => (pair.remote.addr(), Some(pair)),
                None => return Err(Error::ErrNoCandidatePairs),
            },
        };

        let n = self.conn.send_to(data, destination).await?;
        if let Some(pair) = pair {
            pair.local.seen(true);
        }
        self.bytes_sent.fetch_add(n, Ordering::SeqCst);

        Ok(n)
    }
}
