//! JSON-RPC surface checks driven straight against the router.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use ptx_node::domain::CoordinatorSelection;
use ptx_node::testbed::derived_address;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::single_node;

async fn call(router: axum::Router, method: &str, params: Value) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            })
            .to_string(),
        ))
        .expect("request");
    let response = router.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json response")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abi_store_and_decode_round_trip() {
    let node = single_node(CoordinatorSelection::Endorser, "notary@node1").await;
    let router = ptx_node::api::router(node.handle.api_state());

    let abi = json!([
        {
            "type": "error",
            "name": "BadValue",
            "inputs": [{"name": "value", "type": "uint256"}]
        }
    ]);
    let stored = call(router.clone(), "ptx_storeABI", json!([abi])).await;
    let hash = stored["result"].as_str().expect("hash").to_string();

    let fetched = call(router.clone(), "ptx_getStoredABI", json!([hash])).await;
    assert_eq!(fetched["result"][0]["name"], json!("BadValue"));

    let listed = call(router.clone(), "ptx_queryStoredABIs", json!([{ "limit": 10 }])).await;
    assert_eq!(listed["result"].as_array().expect("array").len(), 1);

    // decode BadValue(12345) revert data through the stored ABI
    let selector = alloy_primitives::keccak256(b"BadValue(uint256)");
    let mut data = selector[..4].to_vec();
    let mut value = [0u8; 32];
    value[30] = 0x30;
    value[31] = 0x39;
    data.extend_from_slice(&value);
    let decoded = call(
        router.clone(),
        "ptx_decodeError",
        json!([format!("0x{}", hex::encode(&data))]),
    )
    .await;
    assert_eq!(decoded["result"]["error"], json!("BadValue"));
    assert_eq!(decoded["result"]["args"][0], json!("12345"));

    // builtin Error(string) decodes without any stored ABI
    let mut builtin = vec![0x08, 0xc3, 0x79, 0xa0];
    // offset 32, length 4, "boom"
    builtin.extend_from_slice(&{
        let mut word = [0u8; 32];
        word[31] = 32;
        word
    });
    builtin.extend_from_slice(&{
        let mut word = [0u8; 32];
        word[31] = 4;
        word
    });
    let mut padded = [0u8; 32];
    padded[..4].copy_from_slice(b"boom");
    builtin.extend_from_slice(&padded);
    let decoded = call(
        router.clone(),
        "ptx_decodeError",
        json!([format!("0x{}", hex::encode(&builtin))]),
    )
    .await;
    assert_eq!(decoded["result"]["error"], json!("Error"));
    assert_eq!(decoded["result"]["args"][0], json!("boom"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn public_transaction_lifecycle_over_rpc() {
    let node = single_node(CoordinatorSelection::Endorser, "notary@node1").await;
    let router = ptx_node::api::router(node.handle.api_state());

    // no domain makes it a raw public transaction
    let sent = call(
        router.clone(),
        "ptx_sendTransaction",
        json!([{
            "from": "rpc.signer",
            "to": derived_address("some.contract"),
            "data": "0x010203",
            "idempotencyKey": "rpc-tx-1",
        }]),
    )
    .await;
    let id = sent["result"].as_str().expect("id").to_string();

    // idempotent resubmit returns the same id
    let resent = call(
        router.clone(),
        "ptx_sendTransaction",
        json!([{
            "from": "rpc.signer",
            "to": derived_address("some.contract"),
            "data": "0x010203",
            "idempotencyKey": "rpc-tx-1",
        }]),
    )
    .await;
    assert_eq!(resent["result"].as_str().expect("id"), id);

    let from = derived_address("rpc.signer");
    let by_nonce = call(
        router.clone(),
        "ptx_getPublicTransactionByNonce",
        json!([from, 0]),
    )
    .await;
    assert_eq!(by_nonce["result"]["nonce"], json!(0));

    let queried = call(
        router.clone(),
        "ptx_queryPublicTransactions",
        json!([{ "limit": 10 }]),
    )
    .await;
    assert_eq!(queried["result"].as_array().expect("array").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_method_and_bad_params_return_errors() {
    let node = single_node(CoordinatorSelection::Endorser, "notary@node1").await;
    let router = ptx_node::api::router(node.handle.api_state());

    let unknown = call(router.clone(), "ptx_nonesuch", json!([])).await;
    assert_eq!(unknown["error"]["code"], json!(-32602));
    assert!(unknown["error"]["data"]["code"]
        .as_str()
        .expect("engine code")
        .starts_with("PX01"));

    let missing = call(router.clone(), "ptx_getTransaction", json!([])).await;
    assert_eq!(missing["error"]["code"], json!(-32602));

    let not_found = call(
        router.clone(),
        "ptx_getStateReceipt",
        json!([uuid::Uuid::new_v4()]),
    )
    .await;
    assert_eq!(not_found["error"]["code"], json!(-32001));
}
