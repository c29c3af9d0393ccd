use crate::{error::JsonRpcError, paymaster_api::PaymasterApiServer};
use async_trait::async_trait;
use chrono::Utc;
use courier_gateway::ChainClient;
use courier_primitives::{PaymasterAndData, UserOperation, Wallet};
use courier_store::Store;
use ethers::{
    abi::{encode as abi_encode, Token},
    types::{Address, Bytes, U256},
    utils::{keccak256, to_checksum},
};
use jsonrpsee::core::RpcResult;
use std::sync::Arc;
use tracing::debug;

/// How far into the past the window opens, absorbing clock skew.
const VALIDITY_LOOKBACK_SECS: u64 = 10;
/// Standard sponsorship window.
const VALIDITY_WINDOW_SECS: u64 = 300;
/// Window for operations prepared off-line.
const OO_VALIDITY_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

pub struct PaymasterApiServerImpl {
    pub store: Store,
    pub chain: Arc<dyn ChainClient>,
}

impl PaymasterApiServerImpl {
    /// The digest the paymaster contract verifies: the operation's core
    /// fields bound to the validity window, chain, and entry point.
    fn sponsorship_digest(
        user_operation: &UserOperation,
        entry_point: &Address,
        chain_id: U256,
        valid_until: u64,
        valid_after: u64,
    ) -> [u8; 32] {
        keccak256(abi_encode(&[
            Token::Address(user_operation.sender),
            Token::Uint(user_operation.nonce),
            Token::FixedBytes(keccak256(&user_operation.call_data).to_vec()),
            Token::Uint(U256::from(valid_until)),
            Token::Uint(U256::from(valid_after)),
            Token::Uint(chain_id),
            Token::Address(*entry_point),
        ]))
    }

    async fn sponsor(
        &self,
        mut user_operation: UserOperation,
        entry_point: Address,
        window_secs: u64,
    ) -> Result<UserOperation, JsonRpcError> {
        let paymaster = user_operation
            .paymaster()
            .ok_or_else(|| JsonRpcError::invalid_params("operation carries no paymaster"))?;

        let sponsor = self.store.sponsors.get_sponsor(&to_checksum(&paymaster, None)).await?;
        let wallet = Wallet::from_key(&sponsor.private_key, self.chain.chain_id().as_u64())?;

        let now = Utc::now().timestamp() as u64;
        let valid_after = now - VALIDITY_LOOKBACK_SECS;
        let valid_until = now + window_secs;

        let digest = Self::sponsorship_digest(
            &user_operation,
            &entry_point,
            self.chain.chain_id(),
            valid_until,
            valid_after,
        );
        let signature = wallet.sign_message(&digest).await?;

        let pmd = PaymasterAndData::new(
            paymaster,
            valid_until,
            valid_after,
            Bytes::from(signature.to_vec()),
        )?;
        user_operation.paymaster_and_data = pmd.encode();

        debug!(
            sender = %to_checksum(&user_operation.sender, None),
            paymaster = %to_checksum(&paymaster, None),
            valid_until,
            "sponsored user operation"
        );

        Ok(user_operation)
    }
}

#[async_trait]
impl PaymasterApiServer for PaymasterApiServerImpl {
    async fn sponsor_user_operation(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
    ) -> RpcResult<UserOperation> {
        self.sponsor(user_operation, entry_point, VALIDITY_WINDOW_SECS)
            .await
            .map_err(|err| err.0)
    }

    async fn oo_sponsor_user_operation(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
    ) -> RpcResult<UserOperation> {
        self.sponsor(user_operation, entry_point, OO_VALIDITY_WINDOW_SECS)
            .await
            .map_err(|err| err.0)
    }
}
