use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::types::{AttestationKind, AttestationRequest, AttestationResult, PostAssembly};

/// Progress of one transaction's attestation plan. The sequencer performs
/// the actual sends; this tracks what is expected, what has arrived, and
/// what is due for a re-send. Responses are matched on
/// `(attestation name, party)` and duplicates are idempotent.
#[derive(Debug)]
pub struct GatherState {
    expected: Vec<(AttestationRequest, String)>,
    received: HashSet<(String, String)>,
    outstanding: HashMap<(String, String), Instant>,
    deadline: Instant,
}

impl GatherState {
    pub fn new(plan: &[AttestationRequest], gather_timeout: Duration) -> Self {
        let mut expected = Vec::new();
        for request in plan {
            for party in &request.parties {
                expected.push((request.clone(), party.clone()));
            }
        }
        Self {
            expected,
            received: HashSet::new(),
            outstanding: HashMap::new(),
            deadline: Instant::now() + gather_timeout,
        }
    }

    /// Everything still missing: `(request, party)` pairs with no result.
    pub fn missing(&self) -> Vec<(AttestationRequest, String)> {
        self.expected
            .iter()
            .filter(|(request, party)| {
                !self
                    .received
                    .contains(&(request.name.clone(), party.clone()))
            })
            .cloned()
            .collect()
    }

    /// Marks a request as sent (first send or re-send).
    pub fn mark_sent(&mut self, name: &str, party: &str) {
        self.outstanding
            .insert((name.to_string(), party.to_string()), Instant::now());
    }

    /// Records a result. Returns false for duplicates and results that do
    /// not match any expected `(name, party)` pair.
    pub fn record(&mut self, party: &str, result: &AttestationResult) -> bool {
        let matches_plan = self.expected.iter().any(|(request, expected_party)| {
            request.name == result.name
                && expected_party == party
                && request.algorithm == result.verifier.algorithm
        });
        if !matches_plan {
            return false;
        }
        let key = (result.name.clone(), party.to_string());
        if !self.received.insert(key.clone()) {
            return false;
        }
        self.outstanding.remove(&key);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() == self.expected.len()
    }

    /// Requests whose last send is older than the per-request timeout.
    pub fn due_resends(&self, request_timeout: Duration) -> Vec<(AttestationRequest, String)> {
        self.expected
            .iter()
            .filter(|(request, party)| {
                let key = (request.name.clone(), party.clone());
                if self.received.contains(&key) {
                    return false;
                }
                match self.outstanding.get(&key) {
                    Some(sent_at) => sent_at.elapsed() >= request_timeout,
                    None => false,
                }
            })
            .cloned()
            .collect()
    }

    pub fn deadline_breached(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn reset_deadline(&mut self, gather_timeout: Duration) {
        self.deadline = Instant::now() + gather_timeout;
        self.outstanding.clear();
    }
}

/// Attaches a collected result to the right list on the post-assembly.
/// Signatures and endorsements are kept apart so prepare can hand the
/// domain exactly what it asked for.
pub fn attach_result(post_assembly: &mut PostAssembly, result: AttestationResult) {
    let duplicate = post_assembly
        .attestations()
        .any(|existing| existing.name == result.name && existing.verifier == result.verifier);
    if duplicate {
        return;
    }
    match result.kind {
        AttestationKind::Sign => post_assembly.signatures.push(result),
        AttestationKind::Endorse => post_assembly.endorsements.push(result),
    }
}
