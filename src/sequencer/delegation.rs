use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Outbound delegation bookkeeping for one sequencer. The envelope is
/// re-sent until the remote coordinator acknowledges; the transaction then
/// parks in `Delegating` until a terminal result arrives. Everything keys
/// off the transaction id so redelivered frames are idempotent.
#[derive(Debug, Default)]
pub struct DelegationTracker {
    outbound: HashMap<Uuid, OutboundDelegation>,
}

#[derive(Debug)]
struct OutboundDelegation {
    delegation_id: Uuid,
    target_node: String,
    last_sent: Instant,
    acked: bool,
}

impl DelegationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, tx_id: Uuid, target_node: impl Into<String>) -> Uuid {
        let delegation_id = Uuid::new_v4();
        self.outbound.insert(
            tx_id,
            OutboundDelegation {
                delegation_id,
                target_node: target_node.into(),
                last_sent: Instant::now(),
                acked: false,
            },
        );
        delegation_id
    }

    pub fn target_of(&self, tx_id: &Uuid) -> Option<&str> {
        self.outbound.get(tx_id).map(|d| d.target_node.as_str())
    }

    /// Marks the delegation acknowledged. Unknown or stale delegation ids
    /// are ignored.
    pub fn record_ack(&mut self, delegation_id: &Uuid) {
        for delegation in self.outbound.values_mut() {
            if delegation.delegation_id == *delegation_id {
                delegation.acked = true;
            }
        }
    }

    /// Delegations with no ack whose last send is older than the timeout,
    /// as `(tx_id, delegation_id, target_node)`.
    pub fn due_resends(&mut self, ack_timeout: Duration) -> Vec<(Uuid, Uuid, String)> {
        let mut due = Vec::new();
        for (tx_id, delegation) in self.outbound.iter_mut() {
            if !delegation.acked && delegation.last_sent.elapsed() >= ack_timeout {
                delegation.last_sent = Instant::now();
                due.push((
                    *tx_id,
                    delegation.delegation_id,
                    delegation.target_node.clone(),
                ));
            }
        }
        due
    }

    /// Drops tracking once a terminal result arrived.
    pub fn finish(&mut self, tx_id: &Uuid) {
        self.outbound.remove(tx_id);
    }

    pub fn is_delegated(&self, tx_id: &Uuid) -> bool {
        self.outbound.contains_key(tx_id)
    }
}
