use chrono::{DateTime, Utc};
use ethers::{
    abi::{Event as AbiEvent, EventParam, ParamType},
    types::H256,
    utils::keccak256,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A configured event subscription: one contract address and one event
/// signature the indexer listens for.
///
/// The signature admits two forms:
/// * `Transfer(address,address,uint256)` — positional, argument names are
///   ordinals
/// * `Transfer(from indexed address, to indexed address, value uint256)` —
///   named, with an optional `indexed` marker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub contract: String,
    pub event_signature: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One parsed event argument.
#[derive(Clone, Debug, PartialEq)]
pub struct EventArg {
    pub name: String,
    pub kind: ParamType,
    pub indexed: bool,
}

/// A fully parsed event signature.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedSignature {
    pub name: String,
    pub args: Vec<EventArg>,
}

impl ParsedSignature {
    /// The canonical form: argument names and `indexed` markers stripped,
    /// type aliases normalized (`uint` becomes `uint256`).
    pub fn canonical(&self) -> String {
        let types: Vec<String> = self.args.iter().map(|a| a.kind.to_string()).collect();
        format!("{}({})", self.name, types.join(","))
    }
}

impl Event {
    pub fn new(contract: &str, event_signature: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            contract: contract.to_string(),
            event_signature: event_signature.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the configured signature into its name and arguments.
    /// Unnamed arguments are labeled by their ordinal.
    pub fn parse_signature(&self) -> eyre::Result<ParsedSignature> {
        let sig = self.event_signature.trim();
        let open = sig
            .find('(')
            .ok_or_else(|| eyre::eyre!("invalid event signature: {sig}"))?;
        let close = sig
            .rfind(')')
            .ok_or_else(|| eyre::eyre!("invalid event signature: {sig}"))?;

        let name = sig[..open].trim();
        if name.is_empty() {
            eyre::bail!("invalid event signature: {sig}");
        }

        let inner = sig[open + 1..close].trim();
        let mut args = Vec::new();

        if !inner.is_empty() {
            for (i, raw) in inner.split(',').enumerate() {
                let tokens: Vec<&str> = raw.split_whitespace().collect();
                let arg = match tokens.as_slice() {
                    [kind] => EventArg {
                        name: i.to_string(),
                        kind: parse_param_type(kind)?,
                        indexed: false,
                    },
                    [arg_name, kind] => EventArg {
                        name: (*arg_name).to_string(),
                        kind: parse_param_type(kind)?,
                        indexed: false,
                    },
                    [arg_name, "indexed", kind] => EventArg {
                        name: (*arg_name).to_string(),
                        kind: parse_param_type(kind)?,
                        indexed: true,
                    },
                    _ => eyre::bail!("invalid event argument: {raw}"),
                };
                args.push(arg);
            }
        }

        Ok(ParsedSignature { name: name.to_string(), args })
    }

    /// `keccak256` of the canonical signature; the first topic of every
    /// matching chain log.
    pub fn topic0(&self) -> eyre::Result<H256> {
        let parsed = self.parse_signature()?;
        Ok(H256::from(keccak256(parsed.canonical().as_bytes())))
    }

    /// The ABI event used to decode raw chain logs.
    pub fn abi_event(&self) -> eyre::Result<AbiEvent> {
        let parsed = self.parse_signature()?;
        Ok(AbiEvent {
            name: parsed.name,
            inputs: parsed
                .args
                .into_iter()
                .map(|a| EventParam { name: a.name, kind: a.kind, indexed: a.indexed })
                .collect(),
            anonymous: false,
        })
    }

    /// Whether the given data map could have been produced by this event:
    /// every argument name must be a key of the map. Used by the queue to
    /// decide if an outgoing user operation warrants an optimistic record.
    pub fn is_valid_data(&self, data: &Map<String, Value>) -> bool {
        let Ok(parsed) = self.parse_signature() else {
            return false;
        };

        parsed.args.iter().all(|a| data.contains_key(&a.name))
    }
}

fn parse_param_type(s: &str) -> eyre::Result<ParamType> {
    if let Some(inner) = s.strip_suffix("[]") {
        return Ok(ParamType::Array(Box::new(parse_param_type(inner)?)));
    }

    Ok(match s {
        "address" => ParamType::Address,
        "bool" => ParamType::Bool,
        "string" => ParamType::String,
        "bytes" => ParamType::Bytes,
        "uint" => ParamType::Uint(256),
        "int" => ParamType::Int(256),
        _ if s.starts_with("uint") => ParamType::Uint(s[4..].parse()?),
        _ if s.starts_with("int") => ParamType::Int(s[3..].parse()?),
        _ if s.starts_with("bytes") => ParamType::FixedBytes(s[5..].parse()?),
        _ => eyre::bail!("unsupported event argument type: {s}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TRANSFER_TOPIC0: &str =
        "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

    fn event(signature: &str) -> Event {
        Event::new("0x0000000000000000000000000000000000000001", signature, "Transfer")
    }

    #[test]
    fn parses_named_signature_with_spaces() {
        let parsed =
            event("Transfer(from address, to address, value uint256)").parse_signature().unwrap();

        assert_eq!(parsed.name, "Transfer");
        assert_eq!(
            parsed.args.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["from", "to", "value"]
        );
        assert_eq!(
            parsed.args.iter().map(|a| a.kind.clone()).collect::<Vec<_>>(),
            vec![ParamType::Address, ParamType::Address, ParamType::Uint(256)]
        );
        assert!(parsed.args.iter().all(|a| !a.indexed));
    }

    #[test]
    fn parses_named_signature_without_spaces() {
        let parsed =
            event("Transfer(from address,to address,value uint256)").parse_signature().unwrap();

        assert_eq!(parsed.name, "Transfer");
        assert_eq!(
            parsed.args.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["from", "to", "value"]
        );
    }

    #[test]
    fn parses_compact_signature_with_ordinal_names() {
        let parsed = event("Transfer(address,address,uint256)").parse_signature().unwrap();

        assert_eq!(parsed.name, "Transfer");
        assert_eq!(
            parsed.args.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["0", "1", "2"]
        );
    }

    #[test]
    fn parses_indexed_markers() {
        let parsed =
            event("Transfer(from indexed address, to indexed address, value uint256)")
                .parse_signature()
                .unwrap();

        assert_eq!(
            parsed.args.iter().map(|a| a.indexed).collect::<Vec<_>>(),
            vec![true, true, false]
        );
    }

    #[test]
    fn canonical_strips_names_and_indexed() {
        let named = event("Transfer(from indexed address, to indexed address, value uint256)");
        let renamed = event("Transfer(src indexed address, dst address, wad uint256)");
        let compact = event("Transfer(address,address,uint256)");

        for ev in [&named, &renamed, &compact] {
            assert_eq!(
                ev.parse_signature().unwrap().canonical(),
                "Transfer(address,address,uint256)"
            );
        }
    }

    #[test]
    fn canonical_normalizes_type_aliases() {
        let parsed = event("Transfer(from address, value uint)").parse_signature().unwrap();
        assert_eq!(parsed.canonical(), "Transfer(address,uint256)");
    }

    #[test]
    fn topic0_matches_known_transfer_hash() {
        let named = event("Transfer(from indexed address, to indexed address, value uint256)");
        let compact = event("Transfer(address,address,uint256)");

        assert_eq!(format!("{:?}", named.topic0().unwrap()), TRANSFER_TOPIC0);
        assert_eq!(format!("{:?}", compact.topic0().unwrap()), TRANSFER_TOPIC0);
    }

    #[test]
    fn rejects_malformed_signatures() {
        assert!(event("Transfer").parse_signature().is_err());
        assert!(event("(address)").parse_signature().is_err());
        assert!(event("Transfer(address, bogus_type)").parse_signature().is_err());
    }

    #[test]
    fn is_valid_data_requires_every_argument() {
        let ev = event("Transfer(from indexed address, to indexed address, value uint256)");

        let full = json!({"topic": "0xddf", "from": "0xA", "to": "0xB", "value": "10"});
        assert!(ev.is_valid_data(full.as_object().unwrap()));

        let missing = json!({"topic": "0xddf", "from": "0xA"});
        assert!(!ev.is_valid_data(missing.as_object().unwrap()));
    }
}
