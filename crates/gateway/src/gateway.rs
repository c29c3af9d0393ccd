use crate::{compute_fee_estimates, GasEstimateRing, GatewayError};
use async_trait::async_trait;
use courier_primitives::consts::gateway::{
    FALLBACK_GAS_LIMIT, FEE_HISTORY_BLOCKS, FEE_HISTORY_PERCENTILE, RESUBSCRIBE_DELAY_SECS,
};
use ethers::{
    providers::{JsonRpcClient, Middleware, Provider, PubsubClient, RpcError},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes,
        Eip1559TransactionRequest, Filter, Log as EthLog, TransactionReceipt, H256, U256, U64,
    },
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of waiting for a submitted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// Mined with a successful receipt status
    Success,
    /// Mined, but the receipt reports failure
    Reverted,
    /// No receipt within the wait window
    Timeout,
}

/// The engine's contract with the execution client. Everything the queue,
/// reconciler, and RPC layer need from the chain goes through this trait so
/// those components can be exercised against a mock.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> U256;

    async fn nonce_at(&self, account: Address) -> Result<u64, GatewayError>;

    /// `(max_fee_per_gas, max_priority_fee_per_gas)` from recent blocks.
    async fn fee_estimates(&self) -> Result<(U256, U256), GatewayError>;

    /// Assemble an unsigned dynamic-fee transaction: estimated fees,
    /// estimated gas with a 20% buffer (falling back to the rolling average
    /// of recent estimates, else 500k), the given nonce and calldata.
    async fn build_tx(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        nonce: u64,
    ) -> Result<TypedTransaction, GatewayError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, GatewayError>;

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, GatewayError>;

    /// Poll for the receipt until it lands or the window closes.
    async fn wait_for_tx(&self, hash: H256, timeout: Duration) -> Result<TxOutcome, GatewayError>;

    /// Verbatim JSON-RPC passthrough; `params` is the positional array.
    async fn call_raw(&self, method: &str, params: Value) -> Result<Value, GatewayError>;

    /// Timestamp of a block, in seconds.
    async fn block_time(&self, number: u64) -> Result<u64, GatewayError>;

    async fn latest_block(&self) -> Result<u64, GatewayError>;

    async fn code_at(&self, account: Address) -> Result<Bytes, GatewayError>;

    async fn storage_at(&self, account: Address, slot: H256) -> Result<H256, GatewayError>;
}

/// Restartable log subscriptions; implemented for gateways whose transport
/// supports pubsub.
#[async_trait]
pub trait LogSubscriber: Send + Sync {
    /// Stream logs matching `filter` into `tx`. On subscription errors the
    /// stream is re-established after a short pause; the method only
    /// returns on cancellation or when the receiver goes away.
    async fn listen_for_logs(
        &self,
        filter: Filter,
        tx: mpsc::Sender<EthLog>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError>;
}

/// Some chains deviate from the standard block shape, so timestamps are
/// read through a minimal view instead of the full block type.
#[derive(Debug, Deserialize, Serialize)]
struct RawBlock {
    number: String,
    timestamp: String,
}

/// Gateway over an ethers provider.
pub struct EthGateway<P> {
    provider: Arc<Provider<P>>,
    chain_id: U256,
    gas_ring: GasEstimateRing,
}

impl<P: JsonRpcClient + 'static> EthGateway<P> {
    pub async fn new(provider: Arc<Provider<P>>) -> Result<Self, GatewayError> {
        let chain_id = provider.get_chainid().await.map_err(provider_error)?;

        Ok(Self { provider, chain_id, gas_ring: GasEstimateRing::new() })
    }

    pub fn provider(&self) -> Arc<Provider<P>> {
        self.provider.clone()
    }

    async fn estimate_gas_limit(&self, tx: &TypedTransaction) -> u64 {
        match self.provider.estimate_gas(tx, None).await {
            Ok(gas) => {
                let gas = gas.as_u64();
                self.gas_ring.track(gas);
                gas
            }
            Err(err) => {
                let fallback = self.gas_ring.average().unwrap_or(FALLBACK_GAS_LIMIT);
                warn!(error = %err, fallback, "gas estimation failed, using fallback limit");
                fallback
            }
        }
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainClient for EthGateway<P> {
    fn chain_id(&self) -> U256 {
        self.chain_id
    }

    async fn nonce_at(&self, account: Address) -> Result<u64, GatewayError> {
        let nonce = self
            .provider
            .get_transaction_count(account, None)
            .await
            .map_err(provider_error)?;
        Ok(nonce.as_u64())
    }

    async fn fee_estimates(&self) -> Result<(U256, U256), GatewayError> {
        let history = self
            .provider
            .fee_history(FEE_HISTORY_BLOCKS, BlockNumber::Latest, &[FEE_HISTORY_PERCENTILE])
            .await
            .map_err(provider_error)?;

        let latest_base_fee = history
            .base_fee_per_gas
            .last()
            .copied()
            .ok_or_else(|| GatewayError::Provider("no base fee data in fee history".into()))?;

        let rewards: Vec<U256> = history
            .reward
            .iter()
            .filter_map(|r| r.first().copied())
            .filter(|r| !r.is_zero())
            .collect();

        let hint = if rewards.is_empty() {
            let fee: U256 = self
                .provider
                .request("eth_maxPriorityFeePerGas", ())
                .await
                .map_err(provider_error)?;
            Some(fee)
        } else {
            None
        };

        compute_fee_estimates(latest_base_fee, &rewards, hint)
            .map_err(|e| GatewayError::Provider(e.to_string()))
    }

    async fn build_tx(
        &self,
        from: Address,
        to: Address,
        data: Bytes,
        nonce: u64,
    ) -> Result<TypedTransaction, GatewayError> {
        let (max_fee_per_gas, max_priority_fee_per_gas) = self.fee_estimates().await?;

        let mut tx: TypedTransaction = Eip1559TransactionRequest {
            from: Some(from),
            to: Some(to.into()),
            data: Some(data),
            nonce: Some(nonce.into()),
            chain_id: Some(U64::from(self.chain_id.as_u64())),
            max_fee_per_gas: Some(max_fee_per_gas),
            max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
            value: None,
            gas: None,
            access_list: Default::default(),
        }
        .into();

        let gas_limit = self.estimate_gas_limit(&tx).await;
        tx.set_gas(gas_limit + gas_limit / 5);

        Ok(tx)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, GatewayError> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(provider_error)?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, GatewayError> {
        self.provider.get_transaction_receipt(hash).await.map_err(provider_error)
    }

    async fn wait_for_tx(&self, hash: H256, timeout: Duration) -> Result<TxOutcome, GatewayError> {
        let poll = async {
            loop {
                if let Some(receipt) =
                    self.provider.get_transaction_receipt(hash).await.map_err(provider_error)?
                {
                    return if receipt.status == Some(U64::one()) {
                        Ok(TxOutcome::Success)
                    } else {
                        Ok(TxOutcome::Reverted)
                    };
                }

                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(TxOutcome::Timeout),
        }
    }

    async fn call_raw(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        self.provider.request(method, params).await.map_err(provider_error)
    }

    async fn block_time(&self, number: u64) -> Result<u64, GatewayError> {
        let block: Option<RawBlock> = self
            .provider
            .request("eth_getBlockByNumber", (format!("{:#x}", number), false))
            .await
            .map_err(provider_error)?;

        let block =
            block.ok_or_else(|| GatewayError::Provider(format!("block {number} not found")))?;
        debug!(number = %block.number, "resolved block timestamp");

        u64::from_str_radix(block.timestamp.trim_start_matches("0x"), 16)
            .map_err(|e| GatewayError::Provider(e.to_string()))
    }

    async fn latest_block(&self) -> Result<u64, GatewayError> {
        let number = self.provider.get_block_number().await.map_err(provider_error)?;
        Ok(number.as_u64())
    }

    async fn code_at(&self, account: Address) -> Result<Bytes, GatewayError> {
        self.provider.get_code(account, None).await.map_err(provider_error)
    }

    async fn storage_at(&self, account: Address, slot: H256) -> Result<H256, GatewayError> {
        self.provider.get_storage_at(account, slot, None).await.map_err(provider_error)
    }
}

#[async_trait]
impl<P> LogSubscriber for EthGateway<P>
where
    P: PubsubClient + 'static,
{
    async fn listen_for_logs(
        &self,
        filter: Filter,
        tx: mpsc::Sender<EthLog>,
        cancel: CancellationToken,
    ) -> Result<(), GatewayError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut stream = match self.provider.subscribe_logs(&filter).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(error = %err, "error subscribing to logs, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(RESUBSCRIBE_DELAY_SECS)) => {}
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    item = stream.next() => match item {
                        Some(log) => {
                            if tx.send(log).await.is_err() {
                                // receiver gone, the listener shut down
                                return Ok(());
                            }
                        }
                        None => {
                            warn!("log subscription dropped, resubscribing");
                            tokio::select! {
                                _ = cancel.cancelled() => return Ok(()),
                                _ = tokio::time::sleep(
                                    Duration::from_secs(RESUBSCRIBE_DELAY_SECS),
                                ) => {}
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn provider_error<E: RpcError + std::fmt::Display>(err: E) -> GatewayError {
    if let Some(rpc) = err.as_error_response() {
        return GatewayError::Rpc { code: rpc.code, message: rpc.message.clone() };
    }

    GatewayError::Provider(err.to_string())
}
