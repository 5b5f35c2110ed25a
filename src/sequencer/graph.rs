use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::types::{Address, B256};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepState {
    Pending,
    Dispatched,
    Confirmed,
}

#[derive(Debug, Default)]
struct DepNode {
    parents: HashSet<Uuid>,
    children: HashSet<Uuid>,
    state: DepState,
    signer: Option<Address>,
}

impl Default for DepState {
    fn default() -> Self {
        DepState::Pending
    }
}

/// Dependency DAG for one sequencer, keyed by state id: a transaction that
/// consumes a state another produced is its dependent. Arena of records
/// plus an adjacency map; entries drop once a transaction and its
/// dependents are terminal, so there are no cycles to manage.
#[derive(Debug, Default)]
pub struct DepGraph {
    nodes: HashMap<Uuid, DepNode>,
    producers: HashMap<B256, Uuid>,
}

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an assembled transaction: links it under the producers of
    /// its inputs and registers it as producer of its outputs.
    pub fn record_assembly(&mut self, tx: Uuid, inputs: &[B256], outputs: &[B256]) {
        let mut parents = HashSet::new();
        for input in inputs {
            if let Some(producer) = self.producers.get(input) {
                if *producer != tx {
                    parents.insert(*producer);
                }
            }
        }
        for parent in &parents {
            self.nodes.entry(*parent).or_default().children.insert(tx);
        }
        let node = self.nodes.entry(tx).or_default();
        node.parents = parents;
        for output in outputs {
            self.producers.insert(*output, tx);
        }
    }

    pub fn set_signer(&mut self, tx: Uuid, signer: Address) {
        self.nodes.entry(tx).or_default().signer = Some(signer);
    }

    /// Whether the transaction may dispatch: every ancestor is dispatched
    /// on the same signing address, or confirmed if it used a different
    /// one.
    pub fn is_ready(&self, tx: &Uuid) -> bool {
        let Some(node) = self.nodes.get(tx) else {
            return true;
        };
        node.parents.iter().all(|parent| {
            let Some(parent_node) = self.nodes.get(parent) else {
                // parent already pruned, therefore confirmed
                return true;
            };
            match parent_node.state {
                DepState::Confirmed => true,
                DepState::Dispatched => {
                    parent_node.signer.is_some() && parent_node.signer == node.signer
                }
                DepState::Pending => false,
            }
        })
    }

    pub fn mark_dispatched(&mut self, tx: &Uuid) {
        if let Some(node) = self.nodes.get_mut(tx) {
            node.state = DepState::Dispatched;
        }
    }

    pub fn mark_confirmed(&mut self, tx: &Uuid) {
        if let Some(node) = self.nodes.get_mut(tx) {
            node.state = DepState::Confirmed;
        }
        self.prune();
    }

    /// Removes a failed transaction and returns its transitive dependents,
    /// which are invalid without it and must be reverted as well.
    pub fn remove_with_dependents(&mut self, tx: &Uuid) -> Vec<Uuid> {
        let mut doomed = Vec::new();
        let mut stack = vec![*tx];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if current != *tx {
                doomed.push(current);
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.children.iter().copied());
            }
        }
        for id in std::iter::once(*tx).chain(doomed.iter().copied()) {
            self.detach(&id);
        }
        doomed
    }

    /// Pending transactions whose ancestors allow dispatch.
    pub fn ready_transactions(&self) -> Vec<Uuid> {
        self.nodes
            .iter()
            .filter(|(id, node)| node.state == DepState::Pending && self.is_ready(id))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn contains(&self, tx: &Uuid) -> bool {
        self.nodes.contains_key(tx)
    }

    fn detach(&mut self, tx: &Uuid) {
        if let Some(node) = self.nodes.remove(tx) {
            for parent in node.parents {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.remove(tx);
                }
            }
            for child in node.children {
                if let Some(child_node) = self.nodes.get_mut(&child) {
                    child_node.parents.remove(tx);
                }
            }
        }
        self.producers.retain(|_, producer| producer != tx);
    }

    /// Drops confirmed entries with no live dependents. Keeps the arena
    /// bounded by in-flight work.
    fn prune(&mut self) {
        loop {
            let prunable: Vec<Uuid> = self
                .nodes
                .iter()
                .filter(|(_, node)| {
                    node.state == DepState::Confirmed
                        && node
                            .children
                            .iter()
                            .all(|child| !self.nodes.contains_key(child))
                })
                .map(|(id, _)| *id)
                .collect();
            if prunable.is_empty() {
                break;
            }
            for id in prunable {
                self.detach(&id);
            }
        }
    }

    /// Parent transactions of `tx` that are still tracked.
    pub fn parents_of(&self, tx: &Uuid) -> Vec<Uuid> {
        self.nodes
            .get(tx)
            .map(|node| node.parents.iter().copied().collect())
            .unwrap_or_default()
    }
}
