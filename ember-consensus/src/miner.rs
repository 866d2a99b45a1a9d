use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::pow::{ProofOfWork, DIFFICULTY_WINDOW};
use crate::ConsensusError;
use ember_core::{Block, ChainStore, CoreError, Mempool, Transaction, UtxoSet, BLOCK_REWARD};

/// Most transactions a single block will carry, coinbase excluded.
pub const MAX_BLOCK_TRANSACTIONS: usize = 100;

const IDLE_POLL: Duration = Duration::from_millis(500);

/// Assembles, mines and commits blocks. The nonce search itself runs
/// lock-free; only the final commit takes the chain write lock.
pub struct Miner {
    chain: Arc<ChainStore>,
    utxos: Arc<UtxoSet>,
    mempool: Arc<Mempool>,
    pow: Arc<ProofOfWork>,
    mining: AtomicBool,
    cancel: AtomicBool,
    mined: AtomicU64,
}

impl Miner {
    pub fn new(
        chain: Arc<ChainStore>,
        utxos: Arc<UtxoSet>,
        mempool: Arc<Mempool>,
        pow: Arc<ProofOfWork>,
    ) -> Self {
        Self {
            chain,
            utxos,
            mempool,
            pow,
            mining: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
            mined: AtomicU64::new(0),
        }
    }

    /// Blocks committed by this miner since startup.
    pub fn blocks_mined(&self) -> u64 {
        self.mined.load(Ordering::Relaxed)
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    /// One full mining round: select fee-ordered transactions, prepend the
    /// coinbase, find a proof of work and commit. The selected
    /// transactions leave the mempool only after the commit succeeds.
    pub fn mine_block(&self, reward_address: &str) -> Result<Block, ConsensusError> {
        let selected = self.mempool.by_fee(MAX_BLOCK_TRANSACTIONS);
        let fees: u64 = selected.iter().map(|tx| tx.fee).sum();
        let coinbase = Transaction::coinbase(reward_address, BLOCK_REWARD + fees);

        let tip = self
            .chain
            .latest_block()
            .ok_or_else(|| CoreError::InvalidBlock("chain not initialised".into()))?;
        let mut transactions = Vec::with_capacity(selected.len() + 1);
        transactions.push(coinbase);
        transactions.extend(selected.iter().cloned());
        let mut block = Block::new(
            tip.index + 1,
            &tip.hash,
            self.pow.difficulty(),
            transactions,
        );

        self.pow.mine(&mut block, &self.cancel)?;
        self.pow.validate_block(&block)?;
        self.chain.add_block(block.clone(), &self.utxos)?;
        for tx in &selected {
            self.mempool.remove_transaction(&tx.id);
        }
        self.mined.fetch_add(1, Ordering::Relaxed);
        self.maybe_adjust_difficulty();
        Ok(block)
    }

    // Re-evaluate the difficulty once per full window of fresh blocks.
    fn maybe_adjust_difficulty(&self) {
        let height = self.chain.height();
        let window = DIFFICULTY_WINDOW as u64;
        if height == 0 || height % window != 0 {
            return;
        }
        let recent = self.chain.blocks_range(height + 1 - window, DIFFICULTY_WINDOW);
        self.pow.adjust_difficulty(&recent);
    }

    /// Long-running loop: sleeps while the mempool is empty, otherwise
    /// mines rounds until [`Self::stop`]. Every committed block goes out on
    /// `mined_blocks` for the caller to gossip. A consensus invariant
    /// violation is fatal and surfaces as the loop's error.
    pub async fn run(
        self: Arc<Self>,
        reward_address: String,
        mined_blocks: UnboundedSender<Block>,
    ) -> Result<(), ConsensusError> {
        self.cancel.store(false, Ordering::SeqCst);
        self.mining.store(true, Ordering::SeqCst);
        info!(%reward_address, "miner started");
        while self.mining.load(Ordering::SeqCst) {
            if self.mempool.size() == 0 {
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
            let miner = Arc::clone(&self);
            let address = reward_address.clone();
            let round = tokio::task::spawn_blocking(move || miner.mine_block(&address))
                .await
                .map_err(|e| ConsensusError::Task(e.to_string()))?;
            match round {
                Ok(block) => {
                    debug!(height = block.index, hash = %block.hash, "mined block");
                    let _ = mined_blocks.send(block);
                }
                Err(ConsensusError::Cancelled) => break,
                Err(e @ ConsensusError::Core(CoreError::ConsensusInvariantViolated(_))) => {
                    error!("halting miner: {e}");
                    return Err(e);
                }
                Err(e) => {
                    warn!("mining round failed: {e}");
                    tokio::time::sleep(IDLE_POLL).await;
                }
            }
        }
        info!("miner stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.mining.store(false, Ordering::SeqCst);
        self.cancel.store(true, Ordering::SeqCst);
    }
}
