//! The Courier JSON-RPC surface: user operation submission and sponsorship
//! plus the receipt shim, with everything else proxied to the chain.
mod error;
mod eth;
pub mod eth_api;
mod paymaster;
pub mod paymaster_api;
mod rpc;

pub use error::JsonRpcError;
pub use eth::EthApiServerImpl;
pub use paymaster::PaymasterApiServerImpl;
pub use rpc::JsonRpcServer;
