pub use crate::paymaster::PaymasterApiServerImpl;
use courier_primitives::UserOperation;
use ethers::types::Address;
use jsonrpsee::{core::RpcResult, proc_macros::rpc};

/// The `pm` namespace: paymaster sponsorship of user operations.
#[rpc(server, namespace = "pm")]
pub trait PaymasterApi {
    /// Sponsor a user operation: sign it with the paymaster's key over a
    /// short validity window and return the operation with its
    /// paymaster-and-data filled in.
    #[method(name = "sponsorUserOperation")]
    async fn sponsor_user_operation(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
    ) -> RpcResult<UserOperation>;

    /// Sponsor with a long validity window, for operations prepared
    /// off-line and submitted later.
    #[method(name = "ooSponsorUserOperation")]
    async fn oo_sponsor_user_operation(
        &self,
        user_operation: UserOperation,
        entry_point: Address,
    ) -> RpcResult<UserOperation>;
}
