//! Contract descriptors: ABI-derived event metadata and log decoding.
//!
//! A descriptor is built once per tracked contract. It owns a selector map
//! (topic0 → event fragment) so decoding a log is one hash lookup followed by
//! ABI decoding of the indexed topics and the data payload.
//!
//! # EVM indexed-parameter encoding
//! - Value types (uint, int, bool, address, bytes1–bytes32) are padded to 32
//!   bytes and stored directly in the topic, so they decode to their value.
//! - Reference types (string, bytes, arrays, tuples) are stored as the
//!   keccak256 of their encoding. The value cannot be recovered; the raw
//!   topic hex is kept instead.

use std::collections::HashMap;

use alloy_core::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::{JsonAbi, Param};
use alloy_primitives::B256;
use serde_json::Value;

use kwhindex_core::{ArgValue, Args, ContractSlot, IndexerError};
use kwhindex_rpc::RawLog;

/// One declared event parameter.
#[derive(Debug, Clone)]
pub struct InputSpec {
    /// Declared name, or `arg{i}` when the ABI leaves it empty.
    pub name: String,
    pub ty: DynSolType,
    pub indexed: bool,
    /// Tuple component declarations, used to name nested fields.
    pub components: Vec<Param>,
}

impl InputSpec {
    fn is_reference(&self) -> bool {
        matches!(
            self.ty,
            DynSolType::String
                | DynSolType::Bytes
                | DynSolType::Array(_)
                | DynSolType::FixedArray(..)
                | DynSolType::Tuple(_)
        )
    }
}

/// One non-anonymous event fragment.
#[derive(Debug, Clone)]
pub struct EventSpec {
    pub name: String,
    pub selector: B256,
    pub inputs: Vec<InputSpec>,
}

impl EventSpec {
    /// The selector as a `0x`-prefixed topic string.
    pub fn topic0(&self) -> String {
        format!("0x{}", hex::encode(self.selector))
    }
}

/// A raw log resolved to its event name and named arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLog {
    pub name: String,
    pub args: Args,
}

/// Static metadata for one tracked contract.
#[derive(Debug, Clone)]
pub struct ContractDescriptor {
    name: String,
    address: String,
    events: Vec<EventSpec>,
    by_selector: HashMap<B256, usize>,
}

impl ContractDescriptor {
    /// Build a descriptor from ABI JSON, either a bare array or a build
    /// artifact carrying an `abi` field.
    pub fn from_abi_json(
        name: impl Into<String>,
        address: impl AsRef<str>,
        abi_json: &str,
    ) -> Result<Self, IndexerError> {
        let name = name.into();
        let raw: Value = serde_json::from_str(abi_json)
            .map_err(|e| IndexerError::Abi(format!("{name}: invalid JSON: {e}")))?;
        let raw = match raw {
            Value::Object(mut artifact) => artifact
                .remove("abi")
                .ok_or_else(|| IndexerError::Abi(format!("{name}: artifact has no `abi` field")))?,
            other => other,
        };
        let declared = declared_event_names(&raw);
        let abi: JsonAbi = serde_json::from_value(raw)
            .map_err(|e| IndexerError::Abi(format!("{name}: {e}")))?;

        // JsonAbi keys events by name; walk them in declaration order instead.
        let ordered = declared
            .iter()
            .filter_map(|n| abi.events.get(n))
            .flatten();
        let mut events = Vec::new();
        for event in ordered.filter(|e| !e.anonymous) {
            let mut inputs = Vec::with_capacity(event.inputs.len());
            for (i, param) in event.inputs.iter().enumerate() {
                let ty: DynSolType = param.resolve().map_err(|e| {
                    IndexerError::Abi(format!("{name}.{}: parameter {i}: {e}", event.name))
                })?;
                inputs.push(InputSpec {
                    name: if param.name.is_empty() {
                        format!("arg{i}")
                    } else {
                        param.name.clone()
                    },
                    ty,
                    indexed: param.indexed,
                    components: param.components.clone(),
                });
            }
            events.push(EventSpec {
                name: event.name.clone(),
                selector: event.selector(),
                inputs,
            });
        }

        let by_selector = events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.selector, i))
            .collect();

        Ok(Self {
            name,
            address: address.as_ref().trim().to_lowercase(),
            events,
            by_selector,
        })
    }

    /// Build a descriptor from a configured contract slot.
    pub fn from_slot(slot: &ContractSlot) -> Result<Self, IndexerError> {
        Self::from_abi_json(&slot.name, &slot.address, &slot.abi)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lowercased contract address.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn events(&self) -> &[EventSpec] {
        &self.events
    }

    /// Declared event names in ABI order, overloads listed once.
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for event in &self.events {
            if !names.contains(&event.name) {
                names.push(event.name.clone());
            }
        }
        names
    }

    /// Topic0 values for every fragment called `name`.
    pub fn topics_for(&self, name: &str) -> Vec<String> {
        self.events
            .iter()
            .filter(|e| e.name == name)
            .map(EventSpec::topic0)
            .collect()
    }

    /// Decode a raw log.
    ///
    /// Returns `Ok(None)` when topic0 matches no known fragment, and an error
    /// when the fragment matches but the topics or data do not fit it.
    pub fn decode(&self, log: &RawLog) -> Result<Option<DecodedLog>, IndexerError> {
        let Some(selector) = log.topic0().and_then(|t| t.parse::<B256>().ok()) else {
            return Ok(None);
        };
        let Some(&idx) = self.by_selector.get(&selector) else {
            return Ok(None);
        };
        let event = &self.events[idx];
        let fail = |reason: String| IndexerError::Decode {
            event: event.name.clone(),
            reason,
        };

        let mut indexed = Vec::new();
        let mut topic_idx = 1;
        for input in event.inputs.iter().filter(|i| i.indexed) {
            let topic = log
                .topics
                .get(topic_idx)
                .ok_or_else(|| fail(format!("missing topic for `{}`", input.name)))?;
            topic_idx += 1;
            indexed.push(decode_topic(input, topic).map_err(fail)?);
        }

        let data_inputs: Vec<&InputSpec> = event.inputs.iter().filter(|i| !i.indexed).collect();
        let data_values = if data_inputs.is_empty() {
            Vec::new()
        } else {
            let data = hex::decode(strip_0x(&log.data))
                .map_err(|e| fail(format!("invalid data hex: {e}")))?;
            let tuple = DynSolType::Tuple(data_inputs.iter().map(|i| i.ty.clone()).collect());
            match tuple
                .abi_decode_params(&data)
                .map_err(|e| fail(format!("data decode: {e}")))?
            {
                DynSolValue::Tuple(values) => values,
                other => vec![other],
            }
        };
        if data_values.len() != data_inputs.len() {
            return Err(fail(format!(
                "expected {} data values, decoded {}",
                data_inputs.len(),
                data_values.len()
            )));
        }

        // Reassemble in declaration order.
        let mut indexed = indexed.into_iter();
        let mut data = data_values.into_iter();
        let mut args = Args::new();
        for input in &event.inputs {
            let value = if input.indexed {
                indexed.next()
            } else {
                data.next().map(|v| to_arg(v, &input.components))
            };
            args.insert(input.name.clone(), value.unwrap_or(ArgValue::Null));
        }

        Ok(Some(DecodedLog {
            name: event.name.clone(),
            args,
        }))
    }
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

fn decode_topic(input: &InputSpec, topic: &str) -> Result<ArgValue, String> {
    let bytes = hex::decode(strip_0x(topic)).map_err(|e| format!("invalid topic hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("topic is {} bytes, expected 32", bytes.len()));
    }
    if input.is_reference() {
        return Ok(ArgValue::Str(format!("0x{}", hex::encode(&bytes))));
    }
    input
        .ty
        .abi_decode(&bytes)
        .map(|v| to_arg(v, &input.components))
        .map_err(|e| format!("topic decode for `{}`: {e}", input.name))
}

/// Convert a decoded ABI value into an argument value.
///
/// Integers narrower than 64 bits become native integers; wider ones keep
/// their full width for the normalizer. Addresses use EIP-55 checksums.
fn to_arg(value: DynSolValue, components: &[Param]) -> ArgValue {
    match value {
        DynSolValue::Bool(b) => ArgValue::Bool(b),
        DynSolValue::Uint(u, bits) => {
            match u64::try_from(u).ok().and_then(|v| i64::try_from(v).ok()) {
                Some(v) if bits < 64 => ArgValue::Int(v),
                _ => ArgValue::Uint(u),
            }
        }
        DynSolValue::Int(i, bits) => match i64::try_from(i) {
            Ok(v) if bits < 64 => ArgValue::Int(v),
            _ => ArgValue::Signed(i),
        },
        DynSolValue::Address(a) => ArgValue::Str(a.to_checksum(None)),
        DynSolValue::FixedBytes(word, size) => {
            ArgValue::Str(format!("0x{}", hex::encode(&word[..size.min(32)])))
        }
        DynSolValue::Bytes(b) => ArgValue::Str(format!("0x{}", hex::encode(b))),
        DynSolValue::Function(f) => ArgValue::Str(format!("0x{}", hex::encode(f.as_slice()))),
        DynSolValue::String(s) => ArgValue::Str(s),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
            ArgValue::List(items.into_iter().map(|v| to_arg(v, components)).collect())
        }
        DynSolValue::Tuple(fields) => {
            let named = components.len() == fields.len()
                && components.iter().all(|c| !c.name.is_empty());
            if named {
                ArgValue::Map(
                    components
                        .iter()
                        .zip(fields)
                        .map(|(c, v)| (c.name.clone(), to_arg(v, &c.components)))
                        .collect(),
                )
            } else {
                ArgValue::List(
                    fields
                        .into_iter()
                        .enumerate()
                        .map(|(i, v)| to_arg(v, components.get(i).map_or(&[][..], |c| &c.components)))
                        .collect(),
                )
            }
        }
        #[allow(unreachable_patterns)]
        _ => ArgValue::Null,
    }
}

/// Event names in the order the raw ABI array declares them.
fn declared_event_names(raw: &Value) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for item in raw.as_array().into_iter().flatten() {
        if item.get("type").and_then(Value::as_str) != Some("event") {
            continue;
        }
        if let Some(name) = item.get("name").and_then(Value::as_str) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{keccak256, Address, U256};

    const TOKEN: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const USER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    const KWH_ABI: &str = r#"[
        {"type":"event","name":"KWHConsumed","anonymous":false,"inputs":[
            {"name":"user","type":"address","indexed":true},
            {"name":"kwh","type":"uint256","indexed":false}]},
        {"type":"event","name":"Transfer","anonymous":false,"inputs":[
            {"name":"from","type":"address","indexed":true},
            {"name":"to","type":"address","indexed":true},
            {"name":"value","type":"uint256","indexed":false}]},
        {"type":"event","name":"Note","anonymous":false,"inputs":[
            {"name":"tag","type":"string","indexed":true},
            {"name":"","type":"uint8","indexed":false},
            {"name":"text","type":"string","indexed":false}]},
        {"type":"event","name":"Hidden","anonymous":true,"inputs":[]},
        {"type":"function","name":"burn","inputs":[{"name":"amount","type":"uint256"}],
            "outputs":[],"stateMutability":"nonpayable"}
    ]"#;

    fn topic_of(sig: &str) -> String {
        format!("0x{}", hex::encode(keccak256(sig.as_bytes())))
    }

    fn address_topic(addr: &str) -> String {
        let a: Address = addr.parse().unwrap();
        format!("0x{}", hex::encode(a.into_word()))
    }

    fn log(topics: Vec<String>, data: Vec<u8>) -> RawLog {
        RawLog {
            address: TOKEN.to_lowercase(),
            topics,
            data: format!("0x{}", hex::encode(data)),
            block_number: Some("0x69".into()),
            block_hash: None,
            tx_hash: Some("0xdead".into()),
            log_index: Some("0x2".into()),
            removed: None,
        }
    }

    fn descriptor() -> ContractDescriptor {
        ContractDescriptor::from_abi_json("KWHToken", TOKEN, KWH_ABI).unwrap()
    }

    #[test]
    fn event_names_skip_anonymous_and_functions() {
        let d = descriptor();
        assert_eq!(d.event_names(), vec!["KWHConsumed", "Transfer", "Note"]);
        assert_eq!(d.address(), TOKEN.to_lowercase());
        assert_eq!(d.name(), "KWHToken");
    }

    #[test]
    fn event_order_follows_declaration() {
        let abi = r#"[
            {"type":"event","name":"Zeta","anonymous":false,"inputs":[]},
            {"type":"event","name":"Alpha","anonymous":false,"inputs":[
                {"name":"x","type":"uint256","indexed":false}]},
            {"type":"event","name":"Mid","anonymous":false,"inputs":[]},
            {"type":"event","name":"Alpha","anonymous":false,"inputs":[]}
        ]"#;
        let d = ContractDescriptor::from_abi_json("Ordered", TOKEN, abi).unwrap();
        assert_eq!(d.event_names(), vec!["Zeta", "Alpha", "Mid"]);
        assert_eq!(d.topics_for("Alpha"), vec![topic_of("Alpha(uint256)"), topic_of("Alpha()")]);
    }

    #[test]
    fn topics_match_signature_hash() {
        let d = descriptor();
        assert_eq!(
            d.topics_for("KWHConsumed"),
            vec![topic_of("KWHConsumed(address,uint256)")]
        );
        assert!(d.topics_for("Missing").is_empty());
    }

    #[test]
    fn decodes_kwh_consumed() {
        let d = descriptor();
        let data = DynSolValue::Uint(U256::from(5), 256).abi_encode();
        let raw = log(
            vec![topic_of("KWHConsumed(address,uint256)"), address_topic(USER)],
            data,
        );

        let decoded = d.decode(&raw).unwrap().unwrap();
        assert_eq!(decoded.name, "KWHConsumed");
        let keys: Vec<_> = decoded.args.keys().cloned().collect();
        assert_eq!(keys, vec!["user", "kwh"]);
        assert_eq!(decoded.args["user"], ArgValue::Str(USER.to_string()));
        assert_eq!(decoded.args["kwh"], ArgValue::Uint(U256::from(5)));
    }

    #[test]
    fn unknown_topic_is_none() {
        let d = descriptor();
        let raw = log(vec![topic_of("Approval(address,address,uint256)")], vec![]);
        assert!(d.decode(&raw).unwrap().is_none());
        let bare = log(vec![], vec![]);
        assert!(d.decode(&bare).unwrap().is_none());
    }

    #[test]
    fn missing_indexed_topic_is_decode_error() {
        let d = descriptor();
        let data = DynSolValue::Uint(U256::from(5), 256).abi_encode();
        let raw = log(vec![topic_of("KWHConsumed(address,uint256)")], data);
        assert!(matches!(d.decode(&raw), Err(IndexerError::Decode { .. })));
    }

    #[test]
    fn indexed_string_keeps_topic_and_unnamed_gets_placeholder() {
        let d = descriptor();
        let tag_hash = topic_of("solar");
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(7), 8),
            DynSolValue::String("rooftop".into()),
        ])
        .abi_encode_params();
        let raw = log(vec![topic_of("Note(string,uint8,string)"), tag_hash.clone()], data);

        let decoded = d.decode(&raw).unwrap().unwrap();
        assert_eq!(decoded.args["tag"], ArgValue::Str(tag_hash));
        assert_eq!(decoded.args["arg1"], ArgValue::Int(7));
        assert_eq!(decoded.args["text"], ArgValue::Str("rooftop".into()));
    }

    #[test]
    fn artifact_envelope_accepted() {
        let artifact = format!(r#"{{"contractName":"KWHToken","abi":{KWH_ABI}}}"#);
        let d = ContractDescriptor::from_abi_json("KWHToken", TOKEN, &artifact).unwrap();
        assert_eq!(d.events().len(), 3);
    }

    #[test]
    fn invalid_abi_rejected() {
        assert!(matches!(
            ContractDescriptor::from_abi_json("X", TOKEN, "not json"),
            Err(IndexerError::Abi(_))
        ));
        assert!(matches!(
            ContractDescriptor::from_abi_json("X", TOKEN, r#"{"bytecode":"0x"}"#),
            Err(IndexerError::Abi(_))
        ));
    }

    #[test]
    fn named_tuple_becomes_map() {
        let abi = r#"[{"type":"event","name":"BillPaid","anonymous":false,"inputs":[
            {"name":"bill","type":"tuple","indexed":false,"components":[
                {"name":"id","type":"uint64"},{"name":"amount","type":"uint256"}]}]}]"#;
        let d = ContractDescriptor::from_abi_json("EnergyBilling", TOKEN, abi).unwrap();
        let data = DynSolValue::Tuple(vec![DynSolValue::Tuple(vec![
            DynSolValue::Uint(U256::from(9), 64),
            DynSolValue::Uint(U256::from(1_000u64), 256),
        ])])
        .abi_encode_params();
        let raw = log(vec![topic_of("BillPaid((uint64,uint256))")], data);

        let decoded = d.decode(&raw).unwrap().unwrap();
        let ArgValue::Map(bill) = &decoded.args["bill"] else {
            panic!("expected map, got {:?}", decoded.args["bill"]);
        };
        assert_eq!(bill["id"], ArgValue::Uint(U256::from(9)));
        assert_eq!(bill["amount"], ArgValue::Uint(U256::from(1_000u64)));
    }
}
