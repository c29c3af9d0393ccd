use crate::{error::JsonRpcError, eth_api::EthApiServer};
use async_trait::async_trait;
use courier_gateway::ChainClient;
use courier_primitives::{PaymasterAndData, UserOperation};
use courier_queue::{Message, Service, UserOpMessage};
use courier_store::Store;
use ethers::{
    types::{Address, H256, U64},
    utils::to_checksum,
};
use jsonrpsee::core::RpcResult;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct EthApiServerImpl {
    pub store: Store,
    pub chain: Arc<dyn ChainClient>,
    pub queue: Arc<Service<UserOpMessage>>,
}

#[async_trait]
impl EthApiServer for EthApiServerImpl {
    async fn chain_id(&self) -> RpcResult<U64> {
        Ok(U64::from(self.chain.chain_id().as_u64()))
    }

    async fn send_user_operation(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
        data: Option<Value>,
        extra_data: Option<Value>,
    ) -> RpcResult<H256> {
        let pmd = PaymasterAndData::decode(&user_operation.paymaster_and_data)
            .map_err(|err| JsonRpcError::from(err).0)?;

        let user_op_hash = user_operation.hash(&entry_point, self.chain.chain_id());
        let hash_str = format!("{user_op_hash:?}");

        let user_op_json =
            serde_json::to_value(&user_operation).map_err(|err| {
                JsonRpcError::internal(err.to_string()).0
            })?;

        self.store
            .userops
            .add_user_op(
                &hash_str,
                pmd.valid_until as i64,
                pmd.valid_after as i64,
                &to_checksum(&user_operation.sender, None),
                &to_checksum(&pmd.paymaster, None),
                &to_checksum(&entry_point, None),
                &user_op_json,
            )
            .await
            .map_err(|err| JsonRpcError::from(err).0)?;

        let (respond, mut result) = mpsc::channel(1);
        let message = Message::new(
            &hash_str,
            UserOpMessage {
                entry_point,
                paymaster: pmd.paymaster,
                user_op: user_operation,
                data,
                extra_data,
            },
            respond,
        );

        self.queue.enqueue(message).await;

        // The processor drives the stored operation through its states;
        // this waiter only observes the outcome. A failed submission
        // leaves the operation pending for the reconciler to expire.
        tokio::spawn(async move {
            match result.recv().await {
                Some(Ok(tx_hash)) => {
                    debug!(user_op = %hash_str, tx_hash = ?tx_hash, "user operation bundled")
                }
                Some(Err(err)) => {
                    warn!(user_op = %hash_str, error = %err, "user operation failed")
                }
                None => {}
            }
        });

        Ok(user_op_hash)
    }

    async fn get_transaction_receipt(&self, hash: H256) -> RpcResult<Value> {
        let hash_str = format!("{hash:?}");

        let user_op = self
            .store
            .userops
            .get_user_op(&hash_str)
            .await
            .map_err(|err| JsonRpcError::from(err).0)?;

        match user_op {
            Some(op) => match op.tx_hash {
                // Resolve through the bundle so the receipt's
                // transactionHash is the bundle hash.
                Some(tx_hash) => self
                    .chain
                    .call_raw("eth_getTransactionReceipt", json!([tx_hash]))
                    .await
                    .map_err(|err| JsonRpcError::from(err).0),
                // Known but not yet bundled.
                None => Ok(Value::Null),
            },
            None => self
                .chain
                .call_raw("eth_getTransactionReceipt", json!([hash_str]))
                .await
                .map_err(|err| JsonRpcError::from(err).0),
        }
    }
}
