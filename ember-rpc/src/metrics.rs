use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use prometheus::{register_int_gauge, IntGauge, TextEncoder};

use crate::RpcState;

static CHAIN_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ember_chain_height", "Height of the local best chain")
        .expect("register ember_chain_height")
});

static MEMPOOL_SIZE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ember_mempool_size", "Pending transactions in the mempool")
        .expect("register ember_mempool_size")
});

static PEER_COUNT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ember_peer_count", "Known gossip peers")
        .expect("register ember_peer_count")
});

static BLOCKS_MINED: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ember_blocks_mined", "Blocks mined by this node since startup")
        .expect("register ember_blocks_mined")
});

static DIFFICULTY: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("ember_difficulty", "Current proof-of-work difficulty")
        .expect("register ember_difficulty")
});

/// Prometheus text endpoint. Gauges are sampled at scrape time.
pub async fn render(State(state): State<RpcState>) -> Response {
    CHAIN_HEIGHT.set(state.chain.height() as i64);
    MEMPOOL_SIZE.set(state.mempool.size() as i64);
    PEER_COUNT.set(state.gossip.peer_count() as i64);
    BLOCKS_MINED.set(state.miner.blocks_mined() as i64);
    DIFFICULTY.set(i64::from(state.pow.difficulty()));

    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response(),
    }
}
