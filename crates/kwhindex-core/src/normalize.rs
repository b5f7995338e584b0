//! Canonical storable form for decoded event arguments.
//!
//! Decoded ABI values can be arbitrarily nested and carry integers far wider
//! than any native numeric type (wei-scale token amounts). Before anything is
//! written to storage it passes through [`normalize`], which:
//!
//! - renders wide integers as base-10 strings (never floating point),
//! - normalizes lists element-wise, preserving order,
//! - normalizes maps field-wise, dropping decimal-numeral keys and `length`
//!   (artifacts of array-like decoded structures),
//! - passes every other value through unchanged.
//!
//! `normalize(normalize(v)) == normalize(v)` for every `v`.

use alloy_primitives::{I256, U256};
use indexmap::IndexMap;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Named event arguments in declaration order.
pub type Args = IndexMap<String, ArgValue>;

/// A decoded event argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    /// Integer that already fits a native 64-bit signed value.
    Int(i64),
    /// Unsigned integer of up to 256 bits.
    Uint(U256),
    /// Signed integer of up to 256 bits.
    Signed(I256),
    /// Text, including `0x`-prefixed hex for addresses and byte strings.
    Str(String),
    List(Vec<ArgValue>),
    Map(Args),
}

impl ArgValue {
    /// Returns the value as a string slice, if it is textual.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns `true` if the value still holds a wide integer.
    pub fn is_wide_int(&self) -> bool {
        matches!(self, Self::Uint(_) | Self::Signed(_))
    }
}

/// Normalize a decoded value into its storable form.
pub fn normalize(value: ArgValue) -> ArgValue {
    match value {
        ArgValue::Uint(u) => ArgValue::Str(u.to_string()),
        ArgValue::Signed(i) => ArgValue::Str(i.to_string()),
        ArgValue::List(items) => ArgValue::List(items.into_iter().map(normalize).collect()),
        ArgValue::Map(fields) => ArgValue::Map(normalize_args(fields)),
        other => other,
    }
}

/// Normalize a whole argument map (same key rules as nested maps).
pub fn normalize_args(args: Args) -> Args {
    args.into_iter()
        .filter(|(k, _)| !is_decoding_artifact(k))
        .map(|(k, v)| (k, normalize(v)))
        .collect()
}

fn is_decoding_artifact(key: &str) -> bool {
    key == "length" || (!key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()))
}

// ─── serde ────────────────────────────────────────────────────────────────────

impl Serialize for ArgValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            // Wide integers are always written as decimal text.
            Self::Uint(u) => serializer.serialize_str(&u.to_string()),
            Self::Signed(i) => serializer.serialize_str(&i.to_string()),
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(items) => items.serialize(serializer),
            Self::Map(fields) => fields.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ArgValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ArgValueVisitor)
    }
}

struct ArgValueVisitor;

impl<'de> Visitor<'de> for ArgValueVisitor {
    type Value = ArgValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a decoded event argument")
    }

    fn visit_unit<E: de::Error>(self) -> Result<ArgValue, E> {
        Ok(ArgValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<ArgValue, E> {
        Ok(ArgValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<ArgValue, D::Error> {
        ArgValue::deserialize(d)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<ArgValue, E> {
        Ok(ArgValue::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, i: i64) -> Result<ArgValue, E> {
        Ok(ArgValue::Int(i))
    }

    fn visit_u64<E: de::Error>(self, u: u64) -> Result<ArgValue, E> {
        Ok(i64::try_from(u).map(ArgValue::Int).unwrap_or(ArgValue::Uint(U256::from(u))))
    }

    fn visit_f64<E: de::Error>(self, f: f64) -> Result<ArgValue, E> {
        Ok(ArgValue::Str(f.to_string()))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<ArgValue, E> {
        Ok(ArgValue::Str(s.to_string()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<ArgValue, E> {
        Ok(ArgValue::Str(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ArgValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(ArgValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<ArgValue, A::Error> {
        let mut fields = Args::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry::<String, ArgValue>()? {
            fields.insert(k, v);
        }
        Ok(ArgValue::Map(fields))
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<U256> for ArgValue {
    fn from(u: U256) -> Self {
        Self::Uint(u)
    }
}
