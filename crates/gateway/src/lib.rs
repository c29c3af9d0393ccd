//! The chain gateway: the engine's only contact with the execution client.
mod entry_point;
mod error;
mod gas;
mod gateway;

pub use entry_point::{handle_ops_calldata, EntryPointCall};
pub use error::GatewayError;
pub use gas::{compute_fee_estimates, GasEstimateRing};
pub use gateway::{ChainClient, EthGateway, LogSubscriber, TxOutcome};
