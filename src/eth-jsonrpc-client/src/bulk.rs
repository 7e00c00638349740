//! Bulk JSON-RPC requests: many calls, one wire-level round trip.
//!
//! Each registered call gets a [`CallHandle`] resolved when the bulk
//! request executes. Failures are isolated per call; only a failure of the
//! whole transport round trip resolves every call to the same error.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::OnceLock;

use ethers_core::types::{Block, BlockNumber, Log, TransactionReceipt, H160, H256, U64, U256};
use jsonrpc_core::{Call, Id, MethodCall, Output, Params, Request, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{JsonRpcError, JsonRpcResult};
use crate::{
    make_params_array, Client, EthGetLogsParams, EthJsonRpcClient, ETH_BLOCK_NUMBER_METHOD,
    ETH_CHAIN_ID_METHOD, ETH_GAS_PRICE_METHOD, ETH_GET_BALANCE_METHOD,
    ETH_GET_BLOCK_BY_NUMBER_METHOD, ETH_GET_CODE_METHOD, ETH_GET_LOGS_METHOD,
    ETH_GET_TRANSACTION_COUNT_METHOD, ETH_GET_TRANSACTION_RECEIPT_METHOD,
};

type OutcomeSlot = Arc<OnceLock<JsonRpcResult<Value>>>;

struct PendingCall {
    call: MethodCall,
    slot: OutcomeSlot,
}

/// Handle to one call registered on a [`BulkRequest`].
///
/// The result becomes readable once the bulk request has executed; before
/// that, [`CallHandle::result`] fails with [`JsonRpcError::NotReady`]. After
/// resolution it can be read any number of times.
pub struct CallHandle<R> {
    slot: OutcomeSlot,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> CallHandle<R> {
    /// Returns the outcome of this call.
    pub fn result(&self) -> JsonRpcResult<R> {
        match self.slot.get() {
            None => Err(JsonRpcError::NotReady),
            Some(Ok(value)) => Ok(serde_json::from_value(value.clone())?),
            Some(Err(err)) => Err(err.clone()),
        }
    }
}

/// A batch of calls sent to the node as one JSON-RPC array.
///
/// Registration order determines encoding order; outcomes are correlated
/// strictly by request id, so a node answering out of order is handled
/// correctly. Bulk calls never wait for block heights: the node's own
/// answer (or error) for an out-of-range bound is surfaced as-is.
pub struct BulkRequest<'a, C: Client> {
    client: &'a EthJsonRpcClient<C>,
    calls: Vec<PendingCall>,
    executed: bool,
}

impl<'a, C: Client> BulkRequest<'a, C> {
    pub(crate) fn new(client: &'a EthJsonRpcClient<C>) -> Self {
        Self {
            client,
            calls: Vec::new(),
            executed: false,
        }
    }

    /// Number of calls registered so far.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns true if no call was registered yet.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Enqueues an arbitrary method call and returns its handle.
    pub fn register<R: DeserializeOwned>(
        &mut self,
        method: impl Into<String>,
        params: Params,
    ) -> CallHandle<R> {
        let call = self.client.method_call(method.into(), params);
        let slot: OutcomeSlot = Arc::new(OnceLock::new());
        self.calls.push(PendingCall {
            call,
            slot: Arc::clone(&slot),
        });
        CallHandle {
            slot,
            _result: PhantomData,
        }
    }

    /// Enqueues `eth_blockNumber`.
    pub fn block_number(&mut self) -> JsonRpcResult<CallHandle<U64>> {
        Ok(self.register(ETH_BLOCK_NUMBER_METHOD, make_params_array!()))
    }

    /// Enqueues `eth_chainId`.
    pub fn chain_id(&mut self) -> JsonRpcResult<CallHandle<U64>> {
        Ok(self.register(ETH_CHAIN_ID_METHOD, make_params_array!()))
    }

    /// Enqueues `eth_getBalance` for the address.
    pub fn balance(&mut self, address: H160, block: BlockNumber) -> JsonRpcResult<CallHandle<U256>> {
        Ok(self.register(ETH_GET_BALANCE_METHOD, make_params_array!(address, block)))
    }

    /// Enqueues `eth_gasPrice`.
    pub fn gas_price(&mut self) -> JsonRpcResult<CallHandle<U256>> {
        Ok(self.register(ETH_GAS_PRICE_METHOD, make_params_array!()))
    }

    /// Enqueues `eth_getTransactionCount` for the address.
    pub fn transaction_count(
        &mut self,
        address: H160,
        block: BlockNumber,
    ) -> JsonRpcResult<CallHandle<U64>> {
        Ok(self.register(
            ETH_GET_TRANSACTION_COUNT_METHOD,
            make_params_array!(address, block),
        ))
    }

    /// Enqueues `eth_getCode` for the contract.
    pub fn code(&mut self, address: H160, block: BlockNumber) -> JsonRpcResult<CallHandle<String>> {
        Ok(self.register(ETH_GET_CODE_METHOD, make_params_array!(address, block)))
    }

    /// Enqueues `eth_getBlockByNumber` with transaction hashes.
    pub fn block_by_number(
        &mut self,
        block: BlockNumber,
    ) -> JsonRpcResult<CallHandle<Block<H256>>> {
        Ok(self.register(
            ETH_GET_BLOCK_BY_NUMBER_METHOD,
            make_params_array!(block, false),
        ))
    }

    /// Enqueues `eth_getTransactionReceipt` for the hash.
    pub fn receipt_by_hash(
        &mut self,
        hash: H256,
    ) -> JsonRpcResult<CallHandle<TransactionReceipt>> {
        Ok(self.register(ETH_GET_TRANSACTION_RECEIPT_METHOD, make_params_array!(hash)))
    }

    /// Enqueues `eth_getLogs` with the given parameters.
    pub fn logs(&mut self, params: EthGetLogsParams) -> JsonRpcResult<CallHandle<Vec<Log>>> {
        Ok(self.register(ETH_GET_LOGS_METHOD, make_params_array!(params)))
    }

    /// Sends every registered call as one wire-level batch and resolves all
    /// handles.
    ///
    /// Returns the outcomes in registration order. A per-call error from
    /// the node resolves only that call; a failed transport round trip (or
    /// a closed client) resolves every call to the same error. A second
    /// `execute` fails with [`JsonRpcError::AlreadyExecuted`].
    pub async fn execute(&mut self) -> JsonRpcResult<Vec<JsonRpcResult<Value>>> {
        if self.executed {
            return Err(JsonRpcError::AlreadyExecuted);
        }
        self.executed = true;

        if self.calls.is_empty() {
            return Ok(Vec::new());
        }

        let request = Request::Batch(
            self.calls
                .iter()
                .map(|pending| Call::MethodCall(pending.call.clone()))
                .collect(),
        );

        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(err) => {
                self.resolve_all(err);
                return Ok(self.outcomes());
            }
        };

        let outputs = match response {
            Response::Batch(outputs) => outputs,
            Response::Single(Output::Failure(failure)) => {
                // The node rejected the batch as a whole with one error.
                self.resolve_all(JsonRpcError::Remote(failure.error));
                return Ok(self.outcomes());
            }
            Response::Single(output) => vec![output],
        };

        let mut by_id: HashMap<Id, &PendingCall> = self
            .calls
            .iter()
            .map(|pending| (pending.call.id.clone(), pending))
            .collect();
        for output in outputs {
            let (id, outcome) = match output {
                Output::Success(success) => (success.id, Ok(success.result)),
                Output::Failure(failure) => (failure.id, Err(JsonRpcError::Remote(failure.error))),
            };
            match by_id.remove(&id) {
                Some(pending) => {
                    let _ = pending.slot.set(outcome);
                }
                None => log::warn!("dropping batch response with unknown id {id:?}"),
            }
        }
        for (id, pending) in by_id {
            let _ = pending.slot.set(Err(JsonRpcError::MissingResponse(id)));
        }

        Ok(self.outcomes())
    }

    fn resolve_all(&self, err: JsonRpcError) {
        for pending in &self.calls {
            let _ = pending.slot.set(Err(err.clone()));
        }
    }

    fn outcomes(&self) -> Vec<JsonRpcResult<Value>> {
        self.calls
            .iter()
            .map(|pending| {
                pending
                    .slot
                    .get()
                    .cloned()
                    .unwrap_or(Err(JsonRpcError::NotReady))
            })
            .collect()
    }
}
