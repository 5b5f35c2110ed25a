//! Dependency sequencing: a transaction consuming another's output may
//! not reach the chain first, however the endorsements arrive.

mod common;

use std::time::Duration;

use ptx_node::domain::CoordinatorSelection;
use ptx_node::testbed::derived_address;
use tokio::time::sleep;

use common::{mint_tx, poll_for_status, transfer_tx, two_nodes};

const DEADLINE: Duration = Duration::from_secs(15);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_order_endorsement_preserves_nonce_order() {
    // coordination stays with the submitter; only endorsements go remote
    let (local, remote) = two_nodes(CoordinatorSelection::Submitter, "notary@node2").await;
    let contract = derived_address("tokens.deps1");

    remote.domain.gate_endorsements();

    // T1 mints what T2 spends
    let t1 = mint_tx(contract, "alice@node1", "alice@node1", 100);
    let t1_id = local.handle.ptm.handle_new_tx(t1).await.expect("t1");
    let t2 = transfer_tx(contract, "alice@node1", "bob@node1", 100);
    let t2_id = local.handle.ptm.handle_new_tx(t2).await.expect("t2");

    poll_for_status(&local, t1_id, "gathering_endorsements", DEADLINE).await;
    poll_for_status(&local, t2_id, "gathering_endorsements", DEADLINE).await;

    // endorse T2 first: it becomes dispatchable but must wait for T1
    remote.domain.release_endorsement(t2_id);
    poll_for_status(&local, t2_id, "dispatching", DEADLINE).await;
    sleep(Duration::from_millis(300)).await;

    let t1_status = local.handle.ptm.transaction_status(t1_id).await.unwrap();
    let t2_status = local.handle.ptm.transaction_status(t2_id).await.unwrap();
    assert_ne!(t1_status.as_ref().map(|s| s.as_str()), Some("dispatched"));
    assert_ne!(t2_status.as_ref().map(|s| s.as_str()), Some("dispatched"));

    // endorse T1: both dispatch, in dependency order
    remote.domain.release_endorsement(t1_id);
    poll_for_status(&local, t1_id, "dispatched", DEADLINE).await;
    poll_for_status(&local, t2_id, "dispatched", DEADLINE).await;

    let public = local
        .handle
        .pubtm
        .query_for_transactions(&[t1_id, t2_id])
        .unwrap();
    let t1_nonce = public.get(&t1_id).and_then(|txs| txs.first()).unwrap().tx.nonce;
    let t2_nonce = public.get(&t2_id).and_then(|txs| txs.first()).unwrap().tx.nonce;
    assert!(
        t1_nonce < t2_nonce,
        "dependency order violated: t1 nonce {t1_nonce}, t2 nonce {t2_nonce}"
    );
    assert_eq!(t2_nonce, t1_nonce + 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dependency_introspection_reports_both_directions() {
    let (local, _remote) = two_nodes(CoordinatorSelection::Submitter, "notary@node2").await;
    let contract = derived_address("tokens.deps2");

    let t1 = mint_tx(contract, "alice@node1", "alice@node1", 10);
    let t1_id = local.handle.ptm.handle_new_tx(t1).await.expect("t1");
    poll_for_status(&local, t1_id, "dispatched", DEADLINE).await;
    let t2 = transfer_tx(contract, "alice@node1", "bob@node1", 10);
    let t2_id = local.handle.ptm.handle_new_tx(t2).await.expect("t2");
    poll_for_status(&local, t2_id, "dispatched", DEADLINE).await;

    let t1_row = local
        .handle
        .ptm
        .storage()
        .read_private_tx(&t1_id)
        .unwrap()
        .unwrap();
    let t2_row = local
        .handle
        .ptm
        .storage()
        .read_private_tx(&t2_id)
        .unwrap()
        .unwrap();
    let t1_outputs = t1_row.output_state_ids();
    assert!(t2_row
        .input_state_ids()
        .iter()
        .all(|id| t1_outputs.contains(id)));
}
