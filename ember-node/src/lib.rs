mod config;

pub use config::NodeConfig;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ember_consensus::{ConsensusError, Miner, ProofOfWork};
use ember_core::{ChainStore, GenesisParams, Mempool, UtxoSet};
use ember_network::{GossipConfig, GossipNode};
use ember_rpc::RpcState;
use ember_storage::{BlockArchive, SledArchive};

const TARGET_BLOCK_TIME: Duration = Duration::from_secs(10);

/// Builds every component, wires them together and runs until a shutdown
/// signal, a fatal consensus error, or an HTTP server failure.
pub async fn run_node(config: NodeConfig) -> Result<()> {
    init_logging();
    info!(
        api_port = config.api_port,
        p2p_port = config.p2p_port,
        difficulty = config.difficulty,
        "starting emberchain node"
    );

    let archive =
        Arc::new(SledArchive::open(&config.db_path).context("opening block archive")?);
    // Once open, the archive is released on every exit path with the
    // flush result observed, init failures included.
    let result = run_services(config, archive.clone()).await;
    let closed = archive.close().context("flushing block archive");
    match (result, closed) {
        (Ok(()), Ok(())) => {
            info!("node stopped");
            Ok(())
        }
        (Ok(()), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!("flushing block archive also failed: {close_err}");
            Err(e)
        }
    }
}

async fn run_services(config: NodeConfig, archive: Arc<SledArchive>) -> Result<()> {
    let chain = Arc::new(ChainStore::new(archive, GenesisParams::default()));
    let utxos = Arc::new(UtxoSet::new());
    chain
        .initialize(&utxos)
        .context("initialising blockchain")?;
    let mempool = Arc::new(Mempool::new());
    let pow = Arc::new(ProofOfWork::new(config.difficulty, TARGET_BLOCK_TIME));
    let miner = Arc::new(Miner::new(
        chain.clone(),
        utxos.clone(),
        mempool.clone(),
        pow.clone(),
    ));

    let fatal = Arc::new(Notify::new());
    let gossip = Arc::new(GossipNode::new(
        GossipConfig {
            listen_addr: format!("0.0.0.0:{}", config.p2p_port),
            bootstrap_peers: config.peers.clone(),
        },
        chain.clone(),
        utxos.clone(),
        mempool.clone(),
        pow.clone(),
        fatal.clone(),
    ));
    gossip
        .clone()
        .start()
        .await
        .context("starting gossip listener")?;

    let (mined_tx, mut mined_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut miner_task: Option<JoinHandle<std::result::Result<(), ConsensusError>>> =
        if config.mining {
            let reward_address = config
                .miner_address
                .clone()
                .ok_or_else(|| anyhow!("--miner-address is required when --mining is set"))?;
            Some(tokio::spawn(miner.clone().run(reward_address, mined_tx)))
        } else {
            None
        };

    // Blocks the miner commits still have to reach the peers.
    let forwarder = {
        let gossip = gossip.clone();
        tokio::spawn(async move {
            while let Some(block) = mined_rx.recv().await {
                gossip.announce_block(block).await;
            }
        })
    };

    let rpc_addr: SocketAddr = ([0, 0, 0, 0], config.api_port).into();
    let rpc_state = RpcState {
        chain: chain.clone(),
        utxos: utxos.clone(),
        mempool: mempool.clone(),
        pow: pow.clone(),
        miner: miner.clone(),
        gossip: gossip.clone(),
    };
    let mut rpc_task = tokio::spawn(ember_rpc::serve(rpc_addr, rpc_state));

    let result: Result<()> = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
        _ = sigterm() => {
            info!("termination requested, shutting down");
            Ok(())
        }
        _ = fatal.notified() => Err(anyhow!("consensus invariant violated; halting node")),
        res = wait_for_miner(&mut miner_task) => res,
        res = &mut rpc_task => match res {
            Ok(inner) => inner,
            Err(e) => Err(anyhow!("http server task failed: {e}")),
        },
    };

    miner.stop();
    gossip.stop().await;
    rpc_task.abort();
    forwarder.abort();
    if let Some(handle) = miner_task.take() {
        if !handle.is_finished() {
            let _ = handle.await;
        }
    }
    result
}

async fn wait_for_miner(
    task: &mut Option<JoinHandle<std::result::Result<(), ConsensusError>>>,
) -> Result<()> {
    match task {
        Some(handle) => match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::from(e)),
            Err(e) => Err(anyhow!("miner task panicked: {e}")),
        },
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending().await
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
