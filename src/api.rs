use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::abi::AbiStore;
use crate::dispatcher::PrivateTxManager;
use crate::errors::{EngineError, EngineResult};
use crate::pubtm::PublicTxManager;
use crate::types::{
    Address, Bytes, FullState, PrivateTransaction, StateReceipt, TransactionIntent,
    TransactionType, TxBinding, B256,
};
use crate::types::{PublicTxInput, PublicTxSubmission};

const DEFAULT_QUERY_LIMIT: usize = 100;
const MAX_QUERY_LIMIT: usize = 1_000;

#[derive(Clone)]
pub struct ApiState {
    pub ptm: PrivateTxManager,
    pub pubtm: PublicTxManager,
    pub abi: AbiStore,
}

#[derive(Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i64,
    message: String,
    data: Value,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node: String,
}

/// The transaction envelope accepted by `ptx_sendTransaction`. A missing
/// domain makes it a raw public transaction submitted directly through the
/// public transaction manager.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiTransactionInput {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    to: Option<Address>,
    from: String,
    #[serde(default)]
    inputs: Value,
    #[serde(default)]
    data: Option<Bytes>,
    #[serde(default)]
    gas: Option<u64>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryOptions {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    success: Option<bool>,
}

impl QueryOptions {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/", post(rpc))
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> EngineResult<()> {
    let router = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "JSON-RPC server listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, err)))
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node: state.ptm.node_name().to_string(),
    })
}

async fn rpc(State(state): State<ApiState>, Json(request): Json<RpcRequest>) -> Json<RpcResponse> {
    let id = request.id.clone();
    let result = dispatch(&state, &request.method, &request.params).await;
    let response = match result {
        Ok(result) => RpcResponse {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        },
        Err(err) => RpcResponse {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(to_rpc_error(err)),
        },
    };
    Json(response)
}

fn to_rpc_error(err: EngineError) -> RpcError {
    let code = match &err {
        EngineError::InvalidInput(_) | EngineError::Json(_) => -32602,
        EngineError::NotFound(_) => -32001,
        _ => -32000,
    };
    RpcError {
        code,
        message: err.to_string(),
        data: json!({ "code": err.code() }),
    }
}

fn param<T: serde::de::DeserializeOwned>(params: &Value, index: usize) -> EngineResult<T> {
    let value = params
        .get(index)
        .cloned()
        .ok_or_else(|| EngineError::InvalidInput(format!("missing parameter {index}")))?;
    serde_json::from_value(value)
        .map_err(|err| EngineError::InvalidInput(format!("parameter {index}: {err}")))
}

fn opt_param<T: serde::de::DeserializeOwned>(params: &Value, index: usize) -> EngineResult<Option<T>> {
    match params.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|err| EngineError::InvalidInput(format!("parameter {index}: {err}"))),
    }
}

async fn dispatch(state: &ApiState, method: &str, params: &Value) -> EngineResult<Value> {
    match method {
        "ptx_sendTransaction" => {
            let input: ApiTransactionInput = param(params, 0)?;
            let id = send_one(state, input, TransactionIntent::SendTransaction).await?;
            Ok(json!(id))
        }
        "ptx_sendTransactions" => {
            let inputs: Vec<ApiTransactionInput> = param(params, 0)?;
            let mut ids = Vec::with_capacity(inputs.len());
            for input in inputs {
                ids.push(send_one(state, input, TransactionIntent::SendTransaction).await?);
            }
            Ok(json!(ids))
        }
        "ptx_prepareTransaction" => {
            let input: ApiTransactionInput = param(params, 0)?;
            let id = send_one(state, input, TransactionIntent::PrepareTransaction).await?;
            Ok(json!(id))
        }
        "ptx_prepareTransactions" => {
            let inputs: Vec<ApiTransactionInput> = param(params, 0)?;
            let mut ids = Vec::with_capacity(inputs.len());
            for input in inputs {
                ids.push(send_one(state, input, TransactionIntent::PrepareTransaction).await?);
            }
            Ok(json!(ids))
        }
        "ptx_getTransaction" => {
            let id: Uuid = param(params, 0)?;
            let tx = state.ptm.storage().read_private_tx(&id)?;
            Ok(json!(tx.map(redacted_view)))
        }
        "ptx_getTransactionFull" => {
            let id: Uuid = param(params, 0)?;
            match state.ptm.storage().read_private_tx(&id)? {
                Some(tx) => full_view(state, tx).await,
                None => Ok(Value::Null),
            }
        }
        "ptx_queryTransactions" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            let txs = state.ptm.storage().query_private_txs(query.limit(), false)?;
            Ok(json!(txs.into_iter().map(redacted_view).collect::<Vec<_>>()))
        }
        "ptx_queryTransactionsFull" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            let txs = state.ptm.storage().query_private_txs(query.limit(), false)?;
            let mut out = Vec::with_capacity(txs.len());
            for tx in txs {
                out.push(full_view(state, tx).await?);
            }
            Ok(Value::Array(out))
        }
        "ptx_queryPendingTransactions" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            let full: bool = opt_param(params, 1)?.unwrap_or(false);
            let txs = state.ptm.storage().query_private_txs(query.limit(), true)?;
            if full {
                let mut out = Vec::with_capacity(txs.len());
                for tx in txs {
                    out.push(full_view(state, tx).await?);
                }
                Ok(Value::Array(out))
            } else {
                Ok(json!(txs.into_iter().map(redacted_view).collect::<Vec<_>>()))
            }
        }
        "ptx_getTransactionByIdempotencyKey" => {
            let key: String = param(params, 0)?;
            match state.ptm.storage().idempotency_key_lookup(&key)? {
                Some(id) => {
                    let tx = state.ptm.storage().read_private_tx(&id)?;
                    Ok(json!(tx.map(redacted_view)))
                }
                None => Ok(Value::Null),
            }
        }
        "ptx_getTransactionReceipt" | "ptx_getTransactionReceiptFull" => {
            let id: Uuid = param(params, 0)?;
            Ok(json!(state.ptm.storage().read_receipt(&id)?))
        }
        "ptx_queryTransactionReceipts" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            Ok(json!(state
                .ptm
                .storage()
                .query_receipts(query.limit(), query.success)?))
        }
        "ptx_getStateReceipt" => {
            let id: Uuid = param(params, 0)?;
            let Some(tx) = state.ptm.storage().read_private_tx(&id)? else {
                return Err(EngineError::NotFound(format!("transaction {id}")));
            };
            let (created, spent) = state.ptm.storage().states_touched_by(&tx.to, &id)?;
            let receipt = StateReceipt {
                confirmed: created.into_iter().map(to_full_state).collect(),
                spent: spent.into_iter().map(to_full_state).collect(),
            };
            Ok(json!(receipt))
        }
        "ptx_getDomainReceipt" => {
            let _domain: String = param(params, 0)?;
            let id: Uuid = param(params, 1)?;
            let Some(tx) = state.ptm.storage().read_private_tx(&id)? else {
                return Err(EngineError::NotFound(format!("transaction {id}")));
            };
            match tx.post_assembly {
                Some(post_assembly) => Ok(json!(post_assembly)),
                None => Err(EngineError::NotFound(format!(
                    "no domain receipt for {id}"
                ))),
            }
        }
        "ptx_getTransactionDependencies" => {
            let id: Uuid = param(params, 0)?;
            transaction_dependencies(state, id)
        }
        "ptx_resolveVerifier" => {
            let lookup: String = param(params, 0)?;
            let algorithm: String = param(params, 1)?;
            let verifier_type: String = param(params, 2)?;
            let verifier = state
                .ptm
                .resolve_verifier(&lookup, &algorithm, &verifier_type)
                .await?;
            Ok(json!(verifier))
        }
        "ptx_queryPublicTransactions" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            Ok(json!(state.pubtm.query_public_txs(query.limit(), false)?))
        }
        "ptx_queryPendingPublicTransactions" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            Ok(json!(state.pubtm.query_public_txs(query.limit(), true)?))
        }
        "ptx_getPublicTransactionByNonce" => {
            let from: Address = param(params, 0)?;
            let nonce: u64 = param(params, 1)?;
            Ok(json!(state.pubtm.get_by_nonce(&from, nonce)?))
        }
        "ptx_getPublicTransactionByHash" => {
            let hash: B256 = param(params, 0)?;
            Ok(json!(state.pubtm.get_by_hash(&hash)?))
        }
        "ptx_getPreparedTransaction" => {
            let id: Uuid = param(params, 0)?;
            Ok(json!(state.ptm.storage().read_prepared(&id)?))
        }
        "ptx_queryPreparedTransactions" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            Ok(json!(state.ptm.storage().query_prepared(query.limit())?))
        }
        "ptx_storeABI" => {
            let abi: Value = param(params, 0)?;
            Ok(json!(state.abi.store(&abi)?))
        }
        "ptx_getStoredABI" => {
            let hash: B256 = param(params, 0)?;
            Ok(json!(state.abi.get(&hash)?))
        }
        "ptx_queryStoredABIs" => {
            let query: QueryOptions = opt_param(params, 0)?.unwrap_or_default();
            let abis = state.abi.query(query.limit())?;
            Ok(json!(abis
                .into_iter()
                .map(|(hash, abi)| json!({ "hash": hash, "abi": abi }))
                .collect::<Vec<_>>()))
        }
        "ptx_decodeCall" => {
            let data: Bytes = param(params, 0)?;
            Ok(json!(state.abi.decode_call(&data)?))
        }
        "ptx_decodeEvent" => {
            let topics: Vec<B256> = param(params, 0)?;
            let data: Bytes = param(params, 1)?;
            Ok(json!(state.abi.decode_event(&topics, &data)?))
        }
        "ptx_decodeError" => {
            let data: Bytes = param(params, 0)?;
            Ok(json!(state.abi.decode_error(&data)?))
        }
        "ptx_suspendPublicTransaction" => {
            let from: Address = param(params, 0)?;
            let nonce: u64 = param(params, 1)?;
            state.pubtm.dispatch_action(from, nonce, true)?;
            Ok(json!(true))
        }
        "ptx_resumePublicTransaction" => {
            let from: Address = param(params, 0)?;
            let nonce: u64 = param(params, 1)?;
            state.pubtm.dispatch_action(from, nonce, false)?;
            Ok(json!(true))
        }
        other => Err(EngineError::InvalidInput(format!("unknown method {other}"))),
    }
}

async fn send_one(
    state: &ApiState,
    input: ApiTransactionInput,
    intent: TransactionIntent,
) -> EngineResult<Uuid> {
    match input.domain {
        Some(domain) if !domain.is_empty() => {
            let to = input
                .to
                .ok_or_else(|| EngineError::InvalidInput("to is required".into()))?;
            let mut tx = PrivateTransaction::new(domain, to, input.from, input.inputs);
            tx.intent = intent;
            tx.idempotency_key = input.idempotency_key;
            state.ptm.handle_new_tx(tx).await
        }
        _ => {
            // no domain: a raw public transaction through the public
            // transaction manager
            let id = Uuid::new_v4();
            if let Some(key) = &input.idempotency_key {
                if let Some(existing) = state.ptm.storage().bind_idempotency_key(key, &id)? {
                    return Ok(existing);
                }
            }
            state
                .pubtm
                .single_transaction_submit(PublicTxSubmission {
                    bindings: vec![TxBinding {
                        transaction: id,
                        tx_type: TransactionType::Public,
                    }],
                    input: PublicTxInput {
                        from: input.from,
                        to: input.to,
                        data: input.data.unwrap_or_default(),
                        gas: input.gas,
                        value: None,
                        gas_pricing: None,
                    },
                })
                .await?;
            Ok(id)
        }
    }
}

/// The default read view: everything except the bulky state data carried
/// in the post-assembly.
fn redacted_view(tx: PrivateTransaction) -> Value {
    json!({
        "id": tx.id,
        "domain": tx.domain,
        "to": tx.to,
        "from": tx.from,
        "status": tx.status,
        "intent": tx.intent,
        "idempotencyKey": tx.idempotency_key,
        "createdAt": tx.created_at,
    })
}

async fn full_view(state: &ApiState, tx: PrivateTransaction) -> EngineResult<Value> {
    let receipt = state.ptm.storage().read_receipt(&tx.id)?;
    let public = state.pubtm.query_for_transactions(&[tx.id])?;
    let activity = state.ptm.storage().activity_records(&tx.id)?;
    Ok(json!({
        "transaction": tx,
        "receipt": receipt,
        "public": public.get(&tx.id),
        "activity": activity,
    }))
}

fn transaction_dependencies(state: &ApiState, id: Uuid) -> EngineResult<Value> {
    let Some(tx) = state.ptm.storage().read_private_tx(&id)? else {
        return Err(EngineError::NotFound(format!("transaction {id}")));
    };
    let inputs = tx.input_state_ids();
    let outputs = tx.output_state_ids();
    let mut depends_on = Vec::new();
    let mut prerequisite_of = Vec::new();
    for other in state.ptm.storage().query_private_txs(usize::MAX, false)? {
        if other.id == id {
            continue;
        }
        if other
            .output_state_ids()
            .iter()
            .any(|state_id| inputs.contains(state_id))
        {
            depends_on.push(other.id);
        }
        if other
            .input_state_ids()
            .iter()
            .any(|state_id| outputs.contains(state_id))
        {
            prerequisite_of.push(other.id);
        }
    }
    Ok(json!({
        "dependsOn": depends_on,
        "prerequisiteOf": prerequisite_of,
    }))
}

fn to_full_state(state: crate::storage::StoredState) -> FullState {
    FullState {
        id: state.id,
        schema: state.schema,
        data: state.data,
    }
}
