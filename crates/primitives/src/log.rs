use chrono::{DateTime, Utc};
use ethers::{types::U256, utils::keccak256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

/// Lifecycle status of a log record.
///
/// `Sending` and `Pending` are optimistic states written by the user
/// operation queue; the indexer writes `Success` once the event is observed
/// on chain. `Success` is terminal and can never be downgraded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Sending,
    Pending,
    Success,
    Fail,
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogStatus::Sending => "sending",
            LogStatus::Pending => "pending",
            LogStatus::Success => "success",
            LogStatus::Fail => "fail",
        };
        f.write_str(s)
    }
}

impl FromStr for LogStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(LogStatus::Sending),
            "pending" => Ok(LogStatus::Pending),
            "success" => Ok(LogStatus::Success),
            "fail" => Ok(LogStatus::Fail),
            _ => Err(eyre::eyre!("unknown log status: {s}")),
        }
    }
}

/// A stable, content-addressed record of a contract event.
///
/// Records are keyed by [`Log::generate_unique_hash`], which depends only on
/// `(value, data, tx_hash)`. The queue and the indexer derive the same hash
/// for the same on-chain event, so re-indexing and optimistic inserts
/// deduplicate for free.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub hash: String,
    pub tx_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub nonce: i64,
    pub sender: String,
    pub to: String,
    #[serde(with = "u256_dec")]
    pub value: U256,
    pub data: Option<Value>,
    pub extra_data: Option<Value>,
    pub status: LogStatus,
}

impl Log {
    /// Derive the content hash:
    /// `keccak256(pad32(value) || sorted_json_bytes(data) || bytes(tx_hash))`.
    ///
    /// Data keys are concatenated in lexicographic order so the hash is
    /// invariant under JSON key ordering.
    pub fn generate_unique_hash(&self) -> String {
        let mut buf = Vec::new();

        let mut value_bytes = [0u8; 32];
        self.value.to_big_endian(&mut value_bytes);
        buf.extend_from_slice(&value_bytes);

        if let Some(data) = &self.data {
            buf.extend_from_slice(&sorted_json_bytes(data));
        }

        buf.extend_from_slice(
            &hex::decode(self.tx_hash.trim_start_matches("0x")).unwrap_or_default(),
        );

        format!("0x{}", hex::encode(keccak256(&buf)))
    }

    /// The pool this record broadcasts to: `lowercase("{to}/{data.topic}")`.
    pub fn pool_topic(&self) -> Option<String> {
        let topic = self.data.as_ref()?.get("topic")?.as_str()?;
        Some(format!("{}/{}", self.to, topic).to_lowercase())
    }

    /// Whether this record matches a client's URL query predicate.
    ///
    /// The empty query matches everything; otherwise every `key=value` pair
    /// must equal the corresponding `data` attribute. Comparison is
    /// case-insensitive so hex addresses compare naturally.
    pub fn matches_query(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }

        let Some(data) = self.data.as_ref().and_then(Value::as_object) else {
            return false;
        };

        url::form_urlencoded::parse(query.as_bytes()).all(|(k, v)| {
            data.get(k.as_ref())
                .map(json_value_to_string)
                .is_some_and(|dv| dv.eq_ignore_ascii_case(&v))
        })
    }

    /// Replace all fields with the given record's, stamping `updated_at`.
    pub fn update_from(&mut self, other: &Log) {
        *self = Log { updated_at: Utc::now(), ..other.clone() };
    }
}

fn json_value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-encode `key` then `value` for every top-level key of `data`, in
/// lexicographic key order. Non-object values fall back to their raw JSON
/// encoding.
fn sorted_json_bytes(data: &Value) -> Vec<u8> {
    let Some(map) = data.as_object() else {
        return serde_json::to_vec(data).unwrap_or_default();
    };

    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    let mut buf = Vec::new();
    for k in keys {
        if let Ok(kb) = serde_json::to_vec(k) {
            buf.extend_from_slice(&kb);
        }
        if let Ok(vb) = serde_json::to_vec(&map[k]) {
            buf.extend_from_slice(&vb);
        }
    }

    buf
}

/// Arbitrary-precision values travel as decimal strings.
mod u256_dec {
    use ethers::types::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(U256::from(n)),
            Raw::Str(s) => U256::from_dec_str(&s).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log_with(value: u64, data: Value, tx_hash: &str) -> Log {
        Log {
            hash: String::new(),
            tx_hash: tx_hash.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            nonce: 0,
            sender: "0xA".into(),
            to: "0xB".into(),
            value: U256::from(value),
            data: Some(data),
            extra_data: None,
            status: LogStatus::Sending,
        }
    }

    #[test]
    fn unique_hash_is_deterministic() {
        let data = json!({"topic": "0xddf252ad", "from": "0xA", "to": "0xB"});
        let a = log_with(1_000_000, data.clone(), "0x01");
        let b = log_with(1_000_000, data, "0x01");

        assert_eq!(a.generate_unique_hash(), b.generate_unique_hash());
    }

    #[test]
    fn unique_hash_ignores_data_key_order() {
        let a: Value =
            serde_json::from_str(r#"{"topic":"0xddf","from":"0xA","to":"0xB"}"#).unwrap();
        let b: Value =
            serde_json::from_str(r#"{"to":"0xB","topic":"0xddf","from":"0xA"}"#).unwrap();

        let la = log_with(1_000_000, a, "0x01");
        let lb = log_with(1_000_000, b, "0x01");

        assert_eq!(la.generate_unique_hash(), lb.generate_unique_hash());
    }

    #[test]
    fn unique_hash_depends_on_inputs() {
        let data = json!({"topic": "0xddf", "from": "0xA"});
        let base = log_with(1000, data.clone(), "0x01");

        let other_value = log_with(1001, data.clone(), "0x01");
        assert_ne!(base.generate_unique_hash(), other_value.generate_unique_hash());

        let other_tx = log_with(1000, data.clone(), "0x02");
        assert_ne!(base.generate_unique_hash(), other_tx.generate_unique_hash());

        let other_data = log_with(1000, json!({"topic": "0xddf", "from": "0xC"}), "0x01");
        assert_ne!(base.generate_unique_hash(), other_data.generate_unique_hash());
    }

    #[test]
    fn unique_hash_does_not_depend_on_destination() {
        let data = json!({"topic": "0xddf"});
        let mut a = log_with(5, data.clone(), "0x01");
        let mut b = log_with(5, data, "0x01");
        a.to = "0xAAA".into();
        b.to = "0xBBB".into();

        assert_eq!(a.generate_unique_hash(), b.generate_unique_hash());
    }

    #[test]
    fn pool_topic_is_lowercased() {
        let log = Log {
            to: "0xAbCd".into(),
            ..log_with(0, json!({"topic": "0xDDF252AD"}), "0x01")
        };

        assert_eq!(log.pool_topic().as_deref(), Some("0xabcd/0xddf252ad"));
    }

    #[test]
    fn pool_topic_requires_topic_attribute() {
        let log = log_with(0, json!({"from": "0xA"}), "0x01");
        assert!(log.pool_topic().is_none());
    }

    #[test]
    fn empty_query_matches_everything() {
        let log = log_with(0, json!({"from": "0xA"}), "0x01");
        assert!(log.matches_query(""));
    }

    #[test]
    fn query_matches_data_attributes() {
        let log = log_with(0, json!({"from": "0xA", "to": "0xB"}), "0x01");

        assert!(log.matches_query("from=0xA"));
        assert!(log.matches_query("from=0xa"));
        assert!(log.matches_query("from=0xA&to=0xB"));
        assert!(!log.matches_query("from=0xB"));
        assert!(!log.matches_query("from=0xA&to=0xC"));
        assert!(!log.matches_query("missing=1"));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [LogStatus::Sending, LogStatus::Pending, LogStatus::Success, LogStatus::Fail]
        {
            assert_eq!(status.to_string().parse::<LogStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<LogStatus>().is_err());
    }
}
