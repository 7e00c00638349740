//! Block-height validation for height-bounded queries.
//!
//! A query bounded by a block number ahead of the node's chain head would
//! silently return incomplete data. Guarded calls compare their bounds
//! against a freshly queried head and wait, within a ceiling, for the node
//! to catch up.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ethers_core::types::BlockNumber;

use crate::error::{JsonRpcError, JsonRpcResult};
use crate::{Client, EthGetLogsParams, EthJsonRpcClient};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Height-validation settings applied to height-bounded calls.
#[derive(Debug, Clone, Copy)]
pub struct BlockHeightPolicy {
    /// Whether height-bounded calls wait for the node to reach the
    /// requested block before being sent.
    pub validate_block_number: bool,
    /// Interval between `eth_blockNumber` polls while waiting.
    pub poll_interval: Duration,
    /// Ceiling on the total time spent waiting for the head to catch up.
    pub wait_timeout: Duration,
}

impl Default for BlockHeightPolicy {
    fn default() -> Self {
        Self {
            validate_block_number: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// The height a set of log-query parameters asks the node to have reached:
/// `toBlock` when it is a concrete number, otherwise `fromBlock`. Tag
/// bounds (`latest`, `earliest`, ...) never need validation.
pub(crate) fn requested_height(params: &EthGetLogsParams) -> Option<u64> {
    match (&params.to_block, &params.from_block) {
        (Some(to), _) => numeric_block(to),
        (None, Some(from)) => numeric_block(from),
        (None, None) => None,
    }
}

pub(crate) fn numeric_block(block: &BlockNumber) -> Option<u64> {
    block.as_number().map(|n| n.as_u64())
}

impl<C: Client> EthJsonRpcClient<C> {
    /// Waits until the node's chain head reaches `requested`, polling
    /// `eth_blockNumber` at the policy's interval. Fails with
    /// [`JsonRpcError::BlockHeightTimeout`] once the policy's ceiling
    /// elapses.
    pub(crate) async fn wait_for_block_height(&self, requested: u64) -> JsonRpcResult<()> {
        if requested <= self.observed_head().await? {
            return Ok(());
        }

        let policy = *self.block_height_policy();
        let started = Instant::now();
        loop {
            if started.elapsed() >= policy.wait_timeout {
                return Err(JsonRpcError::BlockHeightTimeout {
                    requested,
                    waited: started.elapsed(),
                });
            }
            log::debug!(
                "chain head behind requested block {requested}, polling again in {:?}",
                policy.poll_interval
            );
            tokio::time::sleep(policy.poll_interval).await;

            if requested <= self.observed_head().await? {
                return Ok(());
            }
        }
    }

    /// Applies the height guard to a single `block` argument. Tag blocks
    /// and disabled validation forward immediately without querying the
    /// head.
    pub(crate) async fn ensure_block_height(&self, block: &BlockNumber) -> JsonRpcResult<()> {
        if !self.block_height_policy().validate_block_number {
            return Ok(());
        }
        match numeric_block(block) {
            Some(requested) => self.wait_for_block_height(requested).await,
            None => Ok(()),
        }
    }

    /// Freshly queries the head, never letting the comparison value regress
    /// below a head observed earlier.
    async fn observed_head(&self) -> JsonRpcResult<u64> {
        let head = self.get_block_number().await?;
        Ok(head.max(self.last_seen_block.load(Ordering::Relaxed)))
    }
}
