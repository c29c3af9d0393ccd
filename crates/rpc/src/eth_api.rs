pub use crate::eth::EthApiServerImpl;
use courier_primitives::UserOperation;
use ethers::types::{Address, H256, U64};
use jsonrpsee::{core::RpcResult, proc_macros::rpc};
use serde_json::Value;

/// The `eth` namespace: user operation submission and the unified receipt
/// lookup. Plain chain methods are answered by the proxy layer.
#[rpc(server, namespace = "eth")]
pub trait EthApi {
    /// Retrieve the chain id the engine runs against, hex-encoded.
    #[method(name = "chainId")]
    async fn chain_id(&self) -> RpcResult<U64>;

    /// Enqueue a user operation for sponsored, bundled submission.
    ///
    /// Returns the operation hash synchronously; the operation's status is
    /// updated asynchronously as the bundle progresses. The optional
    /// `data` map carries the event attributes the operation is expected
    /// to emit and drives the optimistic log record.
    #[method(name = "sendUserOperation")]
    async fn send_user_operation(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
        data: Option<Value>,
        extra_data: Option<Value>,
    ) -> RpcResult<H256>;

    /// Receipt lookup that accepts either a user operation hash or a
    /// transaction hash.
    ///
    /// A known operation hash resolves through its bundle transaction (so
    /// the returned `transactionHash` is the bundle hash), a pending one
    /// yields null, and anything else is forwarded verbatim.
    #[method(name = "getTransactionReceipt")]
    async fn get_transaction_receipt(&self, hash: H256) -> RpcResult<Value>;
}
