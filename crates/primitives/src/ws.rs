use crate::Log;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of change a WebSocket envelope announces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsMessageKind {
    New,
    Update,
    Remove,
}

impl fmt::Display for WsMessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WsMessageKind::New => "new",
            WsMessageKind::Update => "update",
            WsMessageKind::Remove => "remove",
        };
        f.write_str(s)
    }
}

pub const WS_DATA_TYPE_LOG: &str = "log";

/// The envelope pushed to subscribed clients.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WsMessage {
    pub pool_id: String,
    #[serde(rename = "type")]
    pub kind: WsMessageKind,
    pub id: String,
    pub data_type: String,
    pub data: Log,
}

impl Log {
    /// Wrap this record in a broadcast envelope; `None` when the record
    /// carries no topic and therefore addresses no pool.
    pub fn to_ws_message(&self, kind: WsMessageKind) -> Option<WsMessage> {
        Some(WsMessage {
            pool_id: self.pool_topic()?,
            kind,
            id: self.hash.clone(),
            data_type: WS_DATA_TYPE_LOG.to_string(),
            data: self.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogStatus;
    use chrono::Utc;
    use ethers::types::U256;
    use serde_json::json;

    #[test]
    fn envelope_carries_pool_id_and_record_hash() {
        let log = Log {
            hash: "0xabc".into(),
            tx_hash: "0x01".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: "0xS".into(),
            to: "0xCONTRACT".into(),
            value: U256::zero(),
            data: Some(json!({"topic": "0xTOPIC"})),
            extra_data: None,
            status: LogStatus::Sending,
        };

        let msg = log.to_ws_message(WsMessageKind::New).unwrap();
        assert_eq!(msg.pool_id, "0xcontract/0xtopic");
        assert_eq!(msg.id, "0xabc");
        assert_eq!(msg.data_type, WS_DATA_TYPE_LOG);

        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], "new");
    }

    #[test]
    fn records_without_topic_produce_no_envelope() {
        let log = Log {
            hash: "0xabc".into(),
            tx_hash: "0x01".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: "0xS".into(),
            to: "0xCONTRACT".into(),
            value: U256::zero(),
            data: None,
            extra_data: None,
            status: LogStatus::Sending,
        };

        assert!(log.to_ws_message(WsMessageKind::New).is_none());
    }
}
