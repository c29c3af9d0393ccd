use crate::Event;
use base64::Engine;
use ethers::{
    abi::{RawLog, Token},
    utils::to_checksum,
};
use serde_json::{Map, Value};

/// Decode a raw chain log against a configured event, producing the JSON
/// attribute map stored in a log record's `data` field.
///
/// Indexed topics are decoded first, then the non-indexed tail from the
/// log's data. The map always carries a `topic` key holding the event's
/// topic0 hex, which is what ties a record to its pool.
pub fn parse_topics_from_log(event: &Event, raw: &RawLog) -> eyre::Result<Value> {
    let abi_event = event.abi_event()?;
    let parsed = abi_event.parse_log(raw.clone())?;

    let mut map = Map::new();
    map.insert("topic".to_string(), Value::String(format!("{:?}", event.topic0()?)));

    for param in parsed.params {
        map.insert(param.name, token_to_json(&param.value));
    }

    Ok(Value::Object(map))
}

/// Render an ABI token as a JSON value: addresses checksummed, integers as
/// decimal strings, byte arrays base64.
pub fn token_to_json(token: &Token) -> Value {
    match token {
        Token::Address(addr) => Value::String(to_checksum(addr, None)),
        Token::Uint(n) | Token::Int(n) => Value::String(n.to_string()),
        Token::Bool(b) => Value::Bool(*b),
        Token::String(s) => Value::String(s.clone()),
        Token::Bytes(b) | Token::FixedBytes(b) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.iter().map(token_to_json).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address, H256, U256};

    fn address_topic(addr: Address) -> H256 {
        H256::from(addr)
    }

    #[test]
    fn decodes_indexed_topics_and_data() {
        let event = Event::new(
            "0x0000000000000000000000000000000000000001",
            "Transfer(from indexed address, to indexed address, value uint256)",
            "Transfer",
        );

        let from: Address =
            "0x66aB6D9362d4F35596279692F0251Db635165871".parse().unwrap();
        let to: Address = "0x33A4622B82D4c04a53e170c638B944ce27cffce3".parse().unwrap();

        let mut data = [0u8; 32];
        U256::from(100_000u64).to_big_endian(&mut data);

        let raw = RawLog {
            topics: vec![event.topic0().unwrap(), address_topic(from), address_topic(to)],
            data: data.to_vec(),
        };

        let decoded = parse_topics_from_log(&event, &raw).unwrap();
        let map = decoded.as_object().unwrap();

        assert_eq!(
            map.get("topic").unwrap(),
            &Value::String(format!("{:?}", event.topic0().unwrap()))
        );
        assert_eq!(map.get("from").unwrap(), &Value::String(to_checksum(&from, None)));
        assert_eq!(map.get("to").unwrap(), &Value::String(to_checksum(&to, None)));
        assert_eq!(map.get("value").unwrap(), &Value::String("100000".to_string()));
    }

    #[test]
    fn compact_signatures_decode_with_ordinal_keys() {
        let event = Event::new(
            "0x0000000000000000000000000000000000000001",
            "Transfer(address,address,uint256)",
            "Transfer",
        );

        // Without `indexed` markers every argument lives in the data tail.
        let from: Address =
            "0x66aB6D9362d4F35596279692F0251Db635165871".parse().unwrap();
        let to: Address = "0x33A4622B82D4c04a53e170c638B944ce27cffce3".parse().unwrap();

        let mut data = Vec::new();
        data.extend_from_slice(H256::from(from).as_bytes());
        data.extend_from_slice(H256::from(to).as_bytes());
        let mut value = [0u8; 32];
        U256::from(42u64).to_big_endian(&mut value);
        data.extend_from_slice(&value);

        let raw = RawLog { topics: vec![event.topic0().unwrap()], data };

        let decoded = parse_topics_from_log(&event, &raw).unwrap();
        let map = decoded.as_object().unwrap();

        assert_eq!(map.get("0").unwrap(), &Value::String(to_checksum(&from, None)));
        assert_eq!(map.get("1").unwrap(), &Value::String(to_checksum(&to, None)));
        assert_eq!(map.get("2").unwrap(), &Value::String("42".to_string()));
    }

    #[test]
    fn rejects_logs_with_mismatched_topics() {
        let event = Event::new(
            "0x0000000000000000000000000000000000000001",
            "Transfer(from indexed address, to indexed address, value uint256)",
            "Transfer",
        );

        // Only topic0 present; the two indexed arguments are missing.
        let raw = RawLog { topics: vec![event.topic0().unwrap()], data: vec![] };

        assert!(parse_topics_from_log(&event, &raw).is_err());
    }
}
