//! Remote-notary delegation: the submitting node hands coordination to
//! the node hosting the endorser and tracks the remote outcome.

mod common;

use std::time::Duration;

use ptx_node::domain::CoordinatorSelection;
use ptx_node::testbed::derived_address;

use common::{mint_tx, poll_for_status, two_nodes};

const DEADLINE: Duration = Duration::from_secs(15);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_notary_takes_over_coordination() {
    let (local, remote) = two_nodes(CoordinatorSelection::Endorser, "notary@node2").await;
    let contract = derived_address("tokens.delegated1");

    // hold the remote endorsement so the local node stays in delegating
    remote.domain.gate_endorsements();

    let mint = mint_tx(contract, "alice@node1", "alice@node1", 42);
    let tx_id = local.handle.ptm.handle_new_tx(mint).await.expect("accepted");

    poll_for_status(&local, tx_id, "delegating", DEADLINE).await;

    // the remote coordinator drives the rest once the endorsement is free
    remote.domain.release_endorsement(tx_id);
    poll_for_status(&remote, tx_id, "dispatched", DEADLINE).await;

    // the terminal result is relayed back to the submitter
    poll_for_status(&local, tx_id, "dispatched", DEADLINE).await;

    // the dispatched state writes happened on the coordinating node
    let remote_states = remote
        .handle
        .ptm
        .storage()
        .unspent_states(&contract)
        .unwrap();
    assert_eq!(remote_states.len(), 1);
    assert_eq!(remote_states[0].data["amount"], serde_json::json!(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delegation_request_redelivery_is_idempotent() {
    let (local, remote) = two_nodes(CoordinatorSelection::Endorser, "notary@node2").await;
    let contract = derived_address("tokens.delegated2");

    let mint = mint_tx(contract, "alice@node1", "alice@node1", 7);
    let tx_id = local.handle.ptm.handle_new_tx(mint).await.expect("accepted");
    poll_for_status(&remote, tx_id, "dispatched", DEADLINE).await;
    poll_for_status(&local, tx_id, "dispatched", DEADLINE).await;

    // exactly one copy of the transaction exists on the remote node
    let all = remote
        .handle
        .ptm
        .storage()
        .query_private_txs(100, false)
        .unwrap();
    assert_eq!(all.iter().filter(|tx| tx.id == tx_id).count(), 1);
}
