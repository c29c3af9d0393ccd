//! Primitive types for the Courier engine: log records, event subscriptions,
//! user operations, paymaster data, and the WebSocket wire format.
pub mod consts;
mod event;
mod log;
mod paymaster;
pub mod provider;
mod secrets;
mod topic;
mod user_operation;
mod wallet;
mod ws;

pub use event::{Event, EventArg, ParsedSignature};
pub use log::{Log, LogStatus};
pub use paymaster::{
    PaymasterAndData, SIGNATURE_LENGTH, SIGNATURE_OFFSET, VALID_TIMESTAMP_OFFSET,
};
pub use secrets::{decrypt, encrypt};
pub use topic::{parse_topics_from_log, token_to_json};
pub use user_operation::{parse_execute_destination, UserOperation};
pub use wallet::Wallet;
pub use ws::{WsMessage, WsMessageKind, WS_DATA_TYPE_LOG};
