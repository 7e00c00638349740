use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ethers_core::types::{
    Block, BlockNumber, Log, Transaction, TransactionReceipt, TransactionRequest, H160, H256, U64,
    U256,
};
pub use jsonrpc_core::{
    Call, Failure, Id, MethodCall, Output, Params, Request, Response, Success, Version,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod block_height;
pub mod bulk;
pub mod error;

#[cfg(feature = "reqwest")]
pub mod reqwest;

pub use block_height::BlockHeightPolicy;
pub use bulk::{BulkRequest, CallHandle};
pub use error::{JsonRpcError, JsonRpcResult};

pub(crate) const ETH_CHAIN_ID_METHOD: &str = "eth_chainId";
pub(crate) const ETH_GET_BALANCE_METHOD: &str = "eth_getBalance";
pub(crate) const ETH_GAS_PRICE_METHOD: &str = "eth_gasPrice";
pub(crate) const ETH_GET_CODE_METHOD: &str = "eth_getCode";
pub(crate) const ETH_GET_TRANSACTION_COUNT_METHOD: &str = "eth_getTransactionCount";
pub(crate) const ETH_GET_BLOCK_BY_NUMBER_METHOD: &str = "eth_getBlockByNumber";
pub(crate) const ETH_BLOCK_NUMBER_METHOD: &str = "eth_blockNumber";
pub(crate) const ETH_GET_TRANSACTION_RECEIPT_METHOD: &str = "eth_getTransactionReceipt";
pub(crate) const ETH_CALL_METHOD: &str = "eth_call";
pub(crate) const ETH_GET_TRANSACTION_BY_HASH_METHOD: &str = "eth_getTransactionByHash";
pub(crate) const ETH_GET_LOGS_METHOD: &str = "eth_getLogs";
pub(crate) const ETH_MAX_PRIORITY_FEE_PER_GAS_METHOD: &str = "eth_maxPriorityFeePerGas";
pub(crate) const ETH_SEND_RAW_TRANSACTION_METHOD: &str = "eth_sendRawTransaction";

macro_rules! make_params_array {
    ($($items:expr),*) => {
        Params::Array(vec![$(serde_json::to_value($items)?, )*])
    };
}
pub(crate) use make_params_array;

/// A client for interacting with an Ethereum node over JSON-RPC.
#[derive(Clone)]
pub struct EthJsonRpcClient<C: Client> {
    client: C,
    policy: BlockHeightPolicy,
    next_id: Arc<AtomicU64>,
    pub(crate) last_seen_block: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl<C: Client> EthJsonRpcClient<C> {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `client` - The transport client.
    pub fn new(client: C) -> Self {
        Self::new_with_policy(client, BlockHeightPolicy::default())
    }

    /// Create a new client with a custom block-height policy.
    pub fn new_with_policy(client: C, policy: BlockHeightPolicy) -> Self {
        Self {
            client,
            policy,
            next_id: Arc::new(AtomicU64::new(1)),
            last_seen_block: Arc::new(AtomicU64::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns chain block number
    pub async fn get_block_number(&self) -> JsonRpcResult<u64> {
        let head = self
            .single_request::<U64>(ETH_BLOCK_NUMBER_METHOD.to_string(), make_params_array!())
            .await?
            .as_u64();
        self.last_seen_block.fetch_max(head, Ordering::Relaxed);
        Ok(head)
    }

    /// Returns chain id
    pub async fn get_chain_id(&self) -> JsonRpcResult<u64> {
        self.single_request::<U64>(ETH_CHAIN_ID_METHOD.to_string(), make_params_array!())
            .await
            .map(|v| v.as_u64())
    }

    /// Returns balance of the address.
    ///
    /// When `block` is a concrete number ahead of the node's chain head, the
    /// call waits for the node to reach it first.
    pub async fn get_balance(&self, address: H160, block: BlockNumber) -> JsonRpcResult<U256> {
        self.ensure_block_height(&block).await?;
        self.single_request(
            ETH_GET_BALANCE_METHOD.to_string(),
            make_params_array!(address, block),
        )
        .await
    }

    /// Returns the gas price
    pub async fn gas_price(&self) -> JsonRpcResult<U256> {
        self.single_request(ETH_GAS_PRICE_METHOD.to_string(), make_params_array!())
            .await
    }

    /// Returns the max priority fee per gas
    pub async fn max_priority_fee_per_gas(&self) -> JsonRpcResult<U256> {
        self.single_request(
            ETH_MAX_PRIORITY_FEE_PER_GAS_METHOD.to_string(),
            make_params_array!(),
        )
        .await
    }

    /// Returns code of the given contract.
    pub async fn get_code(&self, address: H160, block: BlockNumber) -> JsonRpcResult<String> {
        self.ensure_block_height(&block).await?;
        self.single_request(
            ETH_GET_CODE_METHOD.to_string(),
            make_params_array!(address, block),
        )
        .await
    }

    /// Returns transaction count of the address.
    pub async fn get_transaction_count(
        &self,
        address: H160,
        block: BlockNumber,
    ) -> JsonRpcResult<u64> {
        self.ensure_block_height(&block).await?;
        self.single_request::<U64>(
            ETH_GET_TRANSACTION_COUNT_METHOD.to_string(),
            make_params_array!(address, block),
        )
        .await
        .map(|v| v.as_u64())
    }

    /// Performs eth call and return the result.
    pub async fn eth_call(
        &self,
        params: &TransactionRequest,
        block: BlockNumber,
    ) -> JsonRpcResult<String> {
        self.single_request(ETH_CALL_METHOD.to_string(), make_params_array!(params, block))
            .await
    }

    /// Returns block with transaction hashes by number
    pub async fn get_block_by_number(&self, block: BlockNumber) -> JsonRpcResult<Block<H256>> {
        self.single_request(
            ETH_GET_BLOCK_BY_NUMBER_METHOD.to_string(),
            make_params_array!(block, false),
        )
        .await
    }

    /// Returns full block by number
    pub async fn get_full_block_by_number(
        &self,
        block: BlockNumber,
    ) -> JsonRpcResult<Block<Transaction>> {
        self.single_request(
            ETH_GET_BLOCK_BY_NUMBER_METHOD.to_string(),
            make_params_array!(block, true),
        )
        .await
    }

    /// Returns full blocks by number
    pub async fn get_full_blocks_by_number(
        &self,
        blocks: impl IntoIterator<Item = BlockNumber>,
        max_batch_size: usize,
    ) -> JsonRpcResult<Vec<Block<Transaction>>> {
        let params = blocks
            .into_iter()
            .map(|block| -> JsonRpcResult<Params> { Ok(make_params_array!(block, true)) })
            .collect::<JsonRpcResult<Vec<_>>>()?;
        self.batch_request(ETH_GET_BLOCK_BY_NUMBER_METHOD, params, max_batch_size)
            .await
    }

    /// Gets transaction by hash.
    pub async fn get_transaction_by_hash(&self, hash: H256) -> JsonRpcResult<Option<Transaction>> {
        self.single_request(
            ETH_GET_TRANSACTION_BY_HASH_METHOD.to_string(),
            make_params_array!(hash),
        )
        .await
    }

    /// Get receipt by hash
    pub async fn get_receipt_by_hash(&self, hash: H256) -> JsonRpcResult<TransactionReceipt> {
        self.single_request(
            ETH_GET_TRANSACTION_RECEIPT_METHOD.to_string(),
            make_params_array!(hash),
        )
        .await
    }

    /// Get receipts by hash
    pub async fn get_receipts_by_hash(
        &self,
        hashes: impl IntoIterator<Item = H256>,
        max_batch_size: usize,
    ) -> JsonRpcResult<Vec<TransactionReceipt>> {
        let params = hashes
            .into_iter()
            .map(|hash| -> JsonRpcResult<Params> { Ok(make_params_array!(hash)) })
            .collect::<JsonRpcResult<Vec<_>>>()?;
        self.batch_request(ETH_GET_TRANSACTION_RECEIPT_METHOD, params, max_batch_size)
            .await
    }

    /// Sends raw transaction and takes the arguments in bytes.
    pub async fn send_raw_transaction_bytes(&self, transaction: &[u8]) -> JsonRpcResult<H256> {
        let transaction = format!("0x{}", hex::encode(transaction));
        self.single_request(
            ETH_SEND_RAW_TRANSACTION_METHOD.to_string(),
            make_params_array!(transaction),
        )
        .await
    }

    /// Get EVM logs according to the given parameters.
    ///
    /// When the parameters carry a numeric block bound ahead of the node's
    /// current head, waits for the node to catch up before issuing the
    /// query.
    pub async fn get_logs(&self, params: EthGetLogsParams) -> JsonRpcResult<Vec<Log>> {
        if self.policy.validate_block_number {
            if let Some(requested) = block_height::requested_height(&params) {
                self.wait_for_block_height(requested).await?;
            }
        }
        self.get_logs_unvalidated(params).await
    }

    /// Get EVM logs without waiting for the node to reach the requested
    /// block bounds. The node answers with whatever it has indexed.
    pub async fn get_logs_unvalidated(&self, params: EthGetLogsParams) -> JsonRpcResult<Vec<Log>> {
        self.single_request(ETH_GET_LOGS_METHOD.to_string(), make_params_array!(params))
            .await
    }

    /// Creates an empty bulk request. Calls registered on it are sent as a
    /// single wire-level batch when it is executed.
    pub fn bulk(&self) -> BulkRequest<'_, C> {
        BulkRequest::new(self)
    }

    /// Closes the client, releasing the underlying transport. Subsequent
    /// calls fail with [`JsonRpcError::Closed`]. Closing twice is a no-op.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.client.close().await;
        }
    }

    /// Performs a request.
    pub async fn request(&self, request: Request) -> JsonRpcResult<Response> {
        self.ensure_open()?;
        self.client
            .send_rpc_request(request)
            .await
            .map_err(JsonRpcError::transport)
    }

    /// Performs a single request.
    pub async fn single_request<R: DeserializeOwned>(
        &self,
        method: String,
        params: Params,
    ) -> JsonRpcResult<R> {
        let call = self.method_call(method, params);
        let id = call.id.clone();

        let response = self.request(Request::Single(Call::MethodCall(call))).await?;

        match response {
            Response::Single(Output::Success(success)) if success.id == id => {
                Ok(serde_json::from_value(success.result)?)
            }
            Response::Single(Output::Success(success)) => Err(JsonRpcError::Protocol(format!(
                "response id {:?} does not match request id {id:?}",
                success.id
            ))),
            Response::Single(Output::Failure(failure)) => Err(JsonRpcError::Remote(failure.error)),
            Response::Batch(_) => Err(JsonRpcError::UnexpectedBatch),
        }
    }

    /// Performs a batch request of a single method over many parameter sets,
    /// `max_batch_size` calls per wire-level batch. Any failed call fails
    /// the whole request; use [`EthJsonRpcClient::bulk`] for per-call error
    /// isolation.
    pub async fn batch_request<R: DeserializeOwned>(
        &self,
        method: &str,
        params: impl IntoIterator<Item = Params>,
        max_batch_size: usize,
    ) -> JsonRpcResult<Vec<R>> {
        use itertools::Itertools;

        let mut results = Vec::new();

        // Collect chunks before iteration, otherwise the future won't be `Send`
        let chunks: Vec<Vec<Params>> = params
            .into_iter()
            .chunks(max_batch_size)
            .into_iter()
            .map(Iterator::collect::<Vec<_>>)
            .collect::<Vec<_>>();
        for chunk in chunks {
            let calls: Vec<MethodCall> = chunk
                .into_iter()
                .map(|params| self.method_call(method.to_string(), params))
                .collect();
            let expected = calls.len();

            let request = Request::Batch(calls.iter().cloned().map(Call::MethodCall).collect());
            let response = self.request(request).await?;

            let outputs = match response {
                Response::Batch(outputs) => outputs,
                Response::Single(output) if expected == 1 => vec![output],
                Response::Single(_) => {
                    return Err(JsonRpcError::UnexpectedResultsAmount {
                        expected,
                        actual: 1,
                    });
                }
            };
            if outputs.len() != expected {
                return Err(JsonRpcError::UnexpectedResultsAmount {
                    expected,
                    actual: outputs.len(),
                });
            }

            // The node may answer in any order; correlate by id.
            let mut by_id = outputs
                .into_iter()
                .map(|output| match output {
                    Output::Success(success) => (success.id, Ok(success.result)),
                    Output::Failure(failure) => {
                        (failure.id, Err(JsonRpcError::Remote(failure.error)))
                    }
                })
                .collect::<HashMap<_, _>>();
            for call in calls {
                match by_id.remove(&call.id) {
                    Some(Ok(value)) => results.push(serde_json::from_value(value)?),
                    Some(Err(err)) => return Err(err),
                    None => return Err(JsonRpcError::MissingResponse(call.id)),
                }
            }
        }

        Ok(results)
    }

    pub(crate) fn method_call(&self, method: String, params: Params) -> MethodCall {
        MethodCall {
            jsonrpc: Some(Version::V2),
            method,
            params,
            id: Id::Num(self.next_id.fetch_add(1, Ordering::Relaxed)),
        }
    }

    pub(crate) fn ensure_open(&self) -> JsonRpcResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JsonRpcError::Closed);
        }
        Ok(())
    }

    pub(crate) fn block_height_policy(&self) -> &BlockHeightPolicy {
        &self.policy
    }
}

/// Parameters to `eth_getLogs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EthGetLogsParams {
    /// Addresses of contracts to filter logs for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Vec<H160>>,

    /// Start search logs from this block number.
    #[serde(rename = "fromBlock", skip_serializing_if = "Option::is_none")]
    pub from_block: Option<BlockNumber>,

    /// Finish search logs on this block number.
    #[serde(rename = "toBlock", skip_serializing_if = "Option::is_none")]
    pub to_block: Option<BlockNumber>,

    /// Filter logs by topics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<Vec<H256>>>,
}

/// Transport capability the client is written against.
///
/// A request goes out as a single JSON object or a batch array; the response
/// mirrors the request shape. Implementations must be behaviorally
/// interchangeable.
pub trait Client: Clone + Send + Sync {
    /// Send RPC request.
    fn send_rpc_request(
        &self,
        request: Request,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Response>> + Send>>;

    /// Release the transport's resources. Must be idempotent. The default
    /// implementation does nothing, which fits connection-pooled transports.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}
