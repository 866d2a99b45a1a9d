use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use ember_consensus::{ConsensusError, Miner, ProofOfWork};
use ember_core::{ChainStore, CoreError, Mempool, Transaction, UtxoSet};
use ember_network::{GossipNode, NetworkError};
use ember_wallet::{Wallet, WalletError};

mod metrics;

const MAX_BLOCKS_PAGE: usize = 100;
const DEFAULT_BLOCKS_PAGE: usize = 20;

/// Long-lived components the handlers drive. Constructed in `main` and
/// injected; there are no process-wide singletons.
#[derive(Clone)]
pub struct RpcState {
    pub chain: Arc<ChainStore>,
    pub utxos: Arc<UtxoSet>,
    pub mempool: Arc<Mempool>,
    pub pow: Arc<ProofOfWork>,
    pub miner: Arc<Miner>,
    pub gossip: Arc<GossipNode>,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::InvalidInput(_)
            | CoreError::InvalidSignature(_)
            | CoreError::InsufficientBalance { .. }
            | CoreError::DuplicateTransaction(_)
            | CoreError::InvalidBlock(_) => StatusCode::BAD_REQUEST,
            CoreError::Archive(_)
            | CoreError::Serialization(_)
            | CoreError::ConsensusInvariantViolated(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ConsensusError> for ApiError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::Core(core) => core.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Core(core) => core.into(),
            NetworkError::Consensus(consensus) => consensus.into(),
            NetworkError::Io(io) => Self::bad_request(format!("peer unreachable: {io}")),
        }
    }
}

impl From<WalletError> for ApiError {
    fn from(e: WalletError) -> Self {
        Self::bad_request(e.to_string())
    }
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/blockchain/blocks", get(list_blocks))
        .route("/blockchain/block/:hash", get(block_by_hash))
        .route("/blockchain/tx/:txid", get(transaction_status))
        .route("/wallet/new", get(new_wallet))
        .route("/wallet/sign", post(sign_transaction))
        .route("/tx", post(submit_transaction))
        .route("/mempool", get(mempool_contents))
        .route("/mine", post(mine))
        .route("/balance/:address", get(balance))
        .route("/peers", get(list_peers).post(add_peer))
        .route("/metrics", get(metrics::render))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: RpcState) -> anyhow::Result<()> {
    let app = router(state);
    info!("REST listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "height": state.chain.height(),
        "mempool": state.mempool.size(),
        "peers": state.gossip.peer_count(),
    }))
}

#[derive(Deserialize)]
struct BlocksQuery {
    start: Option<u64>,
    limit: Option<usize>,
}

async fn list_blocks(
    State(state): State<RpcState>,
    Query(query): Query<BlocksQuery>,
) -> Json<Value> {
    let start = query.start.unwrap_or(0);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_BLOCKS_PAGE)
        .min(MAX_BLOCKS_PAGE);
    let blocks = state.chain.blocks_range(start, limit);
    Json(json!({
        "blocks": blocks,
        "start": start,
        "limit": limit,
        "total": state.chain.height() + 1,
    }))
}

async fn block_by_hash(
    State(state): State<RpcState>,
    Path(hash): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state
        .chain
        .block_by_hash(&hash)
        .map(|block| Json(json!(block)))
        .ok_or_else(|| ApiError::not_found(format!("no block with hash {hash}")))
}

async fn transaction_status(
    State(state): State<RpcState>,
    Path(txid): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if let Some(tx) = state.mempool.get_transaction(&txid) {
        return Ok(Json(json!({ "transaction": tx, "status": "pending" })));
    }
    if let Some((tx, block_index, block_hash)) = state.chain.find_transaction(&txid) {
        return Ok(Json(json!({
            "transaction": tx,
            "status": "confirmed",
            "block": block_hash,
            "block_index": block_index,
        })));
    }
    Err(ApiError::not_found(format!("no transaction {txid}")))
}

async fn new_wallet(
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    if query.get("consent").map(String::as_str) != Some("true") {
        return Err(ApiError::bad_request(
            "pass consent=true to receive a plaintext private key",
        ));
    }
    let wallet = Wallet::generate();
    Ok(Json(json!({
        "address": wallet.address,
        "private_key": wallet.private_key,
        "warning": "the private key is returned in plaintext; store it safely and never share it",
    })))
}

#[derive(Deserialize)]
struct SignRequest {
    private_key: String,
    transaction: Transaction,
}

async fn sign_transaction(
    Json(request): Json<SignRequest>,
) -> Result<Json<Transaction>, ApiError> {
    let mut tx = request.transaction;
    ember_wallet::sign_transaction(&request.private_key, &mut tx)?;
    Ok(Json(tx))
}

async fn submit_transaction(
    State(state): State<RpcState>,
    Json(tx): Json<Transaction>,
) -> Result<Json<Value>, ApiError> {
    state.gossip.admit_transaction(&tx)?;
    let tx_id = tx.id.clone();
    state.gossip.announce_transaction(tx).await;
    Ok(Json(json!({
        "message": "transaction admitted to mempool",
        "tx_id": tx_id,
    })))
}

async fn mempool_contents(State(state): State<RpcState>) -> Json<Value> {
    let transactions = state.mempool.by_fee(usize::MAX);
    Json(json!({
        "count": transactions.len(),
        "transactions": transactions,
    }))
}

#[derive(Deserialize)]
struct MineRequest {
    miner_address: String,
}

async fn mine(
    State(state): State<RpcState>,
    Json(request): Json<MineRequest>,
) -> Result<Json<Value>, ApiError> {
    let miner = state.miner.clone();
    let block = tokio::task::spawn_blocking(move || miner.mine_block(&request.miner_address))
        .await
        .map_err(|e| ApiError::internal(format!("mining task failed: {e}")))??;
    state.gossip.announce_block(block.clone()).await;
    Ok(Json(json!({ "message": "block mined", "block": block })))
}

async fn balance(State(state): State<RpcState>, Path(address): Path<String>) -> Json<Value> {
    Json(json!({
        "address": address,
        "balance": state.utxos.balance(&address),
        "utxos": state.utxos.utxos_for(&address),
    }))
}

async fn list_peers(State(state): State<RpcState>) -> Json<Value> {
    Json(json!({ "peers": state.gossip.peer_addresses() }))
}

#[derive(Deserialize)]
struct PeerRequest {
    address: String,
}

async fn add_peer(
    State(state): State<RpcState>,
    Json(request): Json<PeerRequest>,
) -> Result<Json<Value>, ApiError> {
    state.gossip.add_peer(&request.address).await?;
    Ok(Json(json!({ "message": format!("peer {} added", request.address) })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use ember_core::GenesisParams;
    use ember_crypto::sign_digest;
    use ember_network::GossipConfig;
    use ember_storage::MemoryArchive;
    use std::time::Duration;
    use tower::ServiceExt;

    const GENESIS_KEY: &str =
        "0000000000000000000000000000000000000000000000000000000000000001";

    fn state() -> RpcState {
        let archive = Arc::new(MemoryArchive::new());
        let chain = Arc::new(ChainStore::new(archive, GenesisParams::default()));
        let utxos = Arc::new(UtxoSet::new());
        chain.initialize(&utxos).unwrap();
        let mempool = Arc::new(Mempool::new());
        let pow = Arc::new(ProofOfWork::new(1, Duration::from_secs(10)));
        let miner = Arc::new(Miner::new(
            chain.clone(),
            utxos.clone(),
            mempool.clone(),
            pow.clone(),
        ));
        let gossip = Arc::new(GossipNode::new(
            GossipConfig {
                listen_addr: "127.0.0.1:0".into(),
                bootstrap_peers: Vec::new(),
            },
            chain.clone(),
            utxos.clone(),
            mempool.clone(),
            pow.clone(),
            Arc::new(tokio::sync::Notify::new()),
        ));
        RpcState {
            chain,
            utxos,
            mempool,
            pow,
            miner,
            gossip,
        }
    }

    fn transfer(to: &str, amount: u64, fee: u64) -> Transaction {
        let from = ember_crypto::address_from_private_key(GENESIS_KEY).unwrap();
        let mut tx = Transaction::new(&from, to, amount, fee);
        let sig = sign_digest(GENESIS_KEY, &tx.signing_payload()).unwrap();
        tx.attach_signature(sig);
        tx
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_genesis_state() {
        let app = router(state());
        let (status, body) = call(&app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["height"], 0);
        assert_eq!(body["mempool"], 0);
    }

    #[tokio::test]
    async fn wallet_new_requires_consent() {
        let app = router(state());
        let (status, body) = call(&app, get_req("/wallet/new")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        let (status, body) = call(&app, get_req("/wallet/new?consent=true")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["address"].as_str().unwrap().starts_with("04"));
        assert!(body["warning"].is_string());
    }

    #[tokio::test]
    async fn sign_then_submit_then_mine() {
        let st = state();
        let app = router(st.clone());
        let bob = ember_crypto::generate_keypair();
        let miner_wallet = ember_crypto::generate_keypair();

        let tx = transfer(&bob.address, 100, 10);
        let (status, body) = call(&app, post_req("/tx", &serde_json::to_value(&tx).unwrap())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tx_id"], tx.id);

        let (_, body) = call(&app, get_req("/mempool")).await;
        assert_eq!(body["count"], 1);

        let (status, body) = call(
            &app,
            post_req("/mine", &json!({ "miner_address": miner_wallet.address })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["block"]["index"], 1);

        let (_, body) = call(&app, get_req("/mempool")).await;
        assert_eq!(body["count"], 0);

        let (_, body) = call(&app, get_req(&format!("/balance/{}", bob.address))).await;
        assert_eq!(body["balance"], 100);
        let (_, body) = call(
            &app,
            get_req(&format!("/balance/{}", miner_wallet.address)),
        )
        .await;
        assert_eq!(body["balance"], 60);

        let (status, body) = call(&app, get_req(&format!("/blockchain/tx/{}", tx.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "confirmed");
        assert_eq!(body["block_index"], 1);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let st = state();
        let app = router(st);
        let bob = ember_crypto::generate_keypair();
        let tx = serde_json::to_value(transfer(&bob.address, 100, 10)).unwrap();
        let (status, _) = call(&app, post_req("/tx", &tx)).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, post_req("/tx", &tx)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("duplicate transaction"));
    }

    #[tokio::test]
    async fn flipped_signature_is_rejected() {
        let st = state();
        let app = router(st.clone());
        let bob = ember_crypto::generate_keypair();
        let mut tx = transfer(&bob.address, 100, 10);
        let flipped = if tx.signature.starts_with('3') { "4" } else { "3" };
        tx.signature.replace_range(0..1, flipped);
        tx.id = tx.compute_id();
        let (status, body) =
            call(&app, post_req("/tx", &serde_json::to_value(&tx).unwrap())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert_eq!(st.mempool.size(), 0);
    }

    #[tokio::test]
    async fn unfunded_wallet_cannot_spend() {
        let st = state();
        let app = router(st.clone());
        let carol = ember_crypto::generate_keypair();
        let dave = ember_crypto::generate_keypair();
        let mut tx = Transaction::new(&carol.address, &dave.address, 1, 1);
        let sig = sign_digest(&carol.private_key, &tx.signing_payload()).unwrap();
        tx.attach_signature(sig);
        let (status, body) =
            call(&app, post_req("/tx", &serde_json::to_value(&tx).unwrap())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("insufficient balance"));
        assert_eq!(st.mempool.size(), 0);
    }

    #[tokio::test]
    async fn unknown_block_and_tx_are_404() {
        let app = router(state());
        let (status, _) = call(&app, get_req("/blockchain/block/feed")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, get_req("/blockchain/tx/feed")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn blocks_page_caps_limit() {
        let app = router(state());
        let (status, body) = call(&app, get_req("/blockchain/blocks?start=0&limit=500")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["limit"], 100);
        assert_eq!(body["total"], 1);
        assert_eq!(body["blocks"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn metrics_render_in_text_format() {
        let app = router(state());
        let response = app
            .clone()
            .oneshot(get_req("/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("ember_chain_height"));
    }
}
