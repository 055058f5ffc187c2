use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{self, LocalResult, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::de::{MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::util::{byte_offset, f64_to_i64_safe};

lazy_static! {
    static ref VERSION_NUMERIC_COMPONENTS_REGEX: Regex =
        Regex::new(r"^\d+(\.\d+)?(\.\d+)?").unwrap();
}

/// The type tag of an [AttributeValue].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

/// A JSON-like value. Used both for context attributes and for flag variations.
///
/// Objects keep their keys in insertion order so that a value parsed from JSON serializes back
/// with the same layout; equality between objects does not depend on that order.
#[derive(Clone, Debug, Default)]
pub enum AttributeValue {
    /// A null value.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. All numbers are stored as IEEE-754 doubles.
    Number(f64),
    /// A string value.
    String(String),
    /// An array of values.
    Array(Vec<AttributeValue>),
    /// An object, as key/value pairs in insertion order. Keys are unique.
    Object(Vec<(String, AttributeValue)>),
}

/// Returned by [AttributeValue::parse] when the input is not valid JSON.
#[derive(thiserror::Error, Debug, Clone)]
#[error("invalid value at byte offset {offset}: {source}")]
pub struct InvalidValueError {
    /// Byte offset into the input where parsing failed.
    pub offset: usize,
    #[source]
    source: Arc<serde_json::Error>,
}

impl PartialEq for AttributeValue {
    #[allow(clippy::float_cmp)]
    fn eq(&self, other: &Self) -> bool {
        use AttributeValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Object(a), Object(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter()
                            .find(|(other_k, _)| other_k == k)
                            .map_or(false, |(_, other_v)| other_v == v)
                    })
            }
            _ => false,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> AttributeValue {
        AttributeValue::String(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> AttributeValue {
        AttributeValue::String(s)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> AttributeValue {
        AttributeValue::Bool(b)
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<i32> for AttributeValue {
    fn from(i: i32) -> Self {
        AttributeValue::Number(i as f64)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        AttributeValue::Number(f)
    }
}

impl<T> From<Vec<T>> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from(v: Vec<T>) -> AttributeValue {
        v.into_iter().collect()
    }
}

impl<S, T> From<HashMap<S, T>> for AttributeValue
where
    String: From<S>,
    AttributeValue: From<T>,
{
    fn from(hashmap: HashMap<S, T>) -> AttributeValue {
        hashmap.into_iter().collect()
    }
}

impl<T> FromIterator<T> for AttributeValue
where
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        AttributeValue::Array(iter.into_iter().map(AttributeValue::from).collect())
    }
}

impl<S, T> FromIterator<(S, T)> for AttributeValue
where
    String: From<S>,
    AttributeValue: From<T>,
{
    fn from_iter<I: IntoIterator<Item = (S, T)>>(iter: I) -> Self {
        let mut object = AttributeValue::Object(Vec::new());
        for (k, v) in iter {
            object.insert(k.into(), v.into());
        }
        object
    }
}

impl From<&serde_json::Value> for AttributeValue {
    fn from(v: &serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Bool(*b),
            Value::Number(n) => match n.as_f64() {
                Some(float) => AttributeValue::Number(float),
                None => {
                    warn!("could not interpret '{:?}' as f64", n);
                    AttributeValue::String(n.to_string())
                }
            },
            Value::String(str) => AttributeValue::String(str.clone()),
            Value::Array(arr) => {
                AttributeValue::Array(arr.iter().map(AttributeValue::from).collect())
            }
            Value::Object(obj) => obj.iter().map(|(k, v)| (k.clone(), v)).collect(),
        }
    }
}

impl From<&AttributeValue> for serde_json::Value {
    fn from(v: &AttributeValue) -> Self {
        use serde_json::Value;
        match v {
            AttributeValue::Null => Value::Null,
            AttributeValue::Bool(b) => Value::Bool(*b),
            AttributeValue::Number(f) => match integral(*f) {
                Some(i) => Value::from(i),
                None => serde_json::Number::from_f64(*f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            },
            AttributeValue::String(s) => Value::String(s.clone()),
            AttributeValue::Array(values) => {
                Value::Array(values.iter().map(serde_json::Value::from).collect())
            }
            AttributeValue::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

#[allow(clippy::float_cmp)]
fn integral(f: f64) -> Option<i64> {
    f64_to_i64_safe(f).filter(|i| *i as f64 == f)
}

impl AttributeValue {
    /// Parse a JSON document into a value.
    ///
    /// On failure the returned error carries the byte offset at which the parser gave up.
    pub fn parse(json: &str) -> Result<AttributeValue, InvalidValueError> {
        serde_json::from_str(json).map_err(|e| InvalidValueError {
            offset: byte_offset(json, e.line(), e.column()),
            source: Arc::new(e),
        })
    }

    /// Returns the type tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            AttributeValue::Null => ValueType::Null,
            AttributeValue::Bool(_) => ValueType::Bool,
            AttributeValue::Number(_) => ValueType::Number,
            AttributeValue::String(_) => ValueType::String,
            AttributeValue::Array(_) => ValueType::Array,
            AttributeValue::Object(_) => ValueType::Object,
        }
    }

    /// Returns true if this is [AttributeValue::Null].
    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Returns None unless self is a String. It will not convert.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the wrapped value as a float for numeric types, and None otherwise.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns None unless self is a bool. It will not convert.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttributeValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the wrapped value as an integer if it is a number with no fractional part that
    /// fits in 53 bits.
    pub fn as_int(&self) -> Option<i64> {
        self.to_f64().and_then(integral)
    }

    /// Returns the elements if self is an Array.
    pub fn as_array(&self) -> Option<&[AttributeValue]> {
        match self {
            AttributeValue::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Looks up a property of an Object. Returns None for other types.
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        match self {
            AttributeValue::Object(entries) => {
                entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    /// Sets a property on an Object, keeping the original position if the key already exists.
    /// Does nothing for other types.
    pub fn insert(&mut self, key: String, value: AttributeValue) {
        if let AttributeValue::Object(entries) = self {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    /// The boolean value, or false for any other type.
    pub fn bool_value(&self) -> bool {
        self.as_bool().unwrap_or_default()
    }

    /// The numeric value, or zero for any other type.
    pub fn float_value(&self) -> f64 {
        self.to_f64().unwrap_or_default()
    }

    /// The numeric value truncated towards zero, or zero for any other type.
    pub fn int_value(&self) -> i64 {
        self.to_f64().and_then(f64_to_i64_safe).unwrap_or_default()
    }

    /// The string value, or an empty string for any other type.
    pub fn string_value(&self) -> &str {
        self.as_str().unwrap_or_default()
    }

    /// Attempt to convert any of the following into a chrono::DateTime in UTC:
    ///  * RFC3339/ISO8601 timestamp (example: "2016-04-16T17:09:12.759-07:00")
    ///  * Unix epoch milliseconds as number
    /// It will return None if the conversion fails or if no conversion is possible.
    pub fn as_datetime(&self) -> Option<chrono::DateTime<Utc>> {
        match self {
            AttributeValue::Number(millis) => {
                f64_to_i64_safe(*millis).and_then(|millis| match Utc.timestamp_millis_opt(millis) {
                    LocalResult::None | LocalResult::Ambiguous(_, _) => None,
                    LocalResult::Single(time) => Some(time),
                })
            }
            AttributeValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            _ => None,
        }
    }

    /// Attempt to parse a string attribute into a semver version.
    ///
    /// Versions with missing minor or patch components ("2", "2.1") are zero-padded. Build
    /// metadata is accepted but dropped, so it never affects comparisons.
    ///
    /// It will return None if it cannot parse it, or for non-string attributes.
    pub fn as_semver(&self) -> Option<semver::Version> {
        let version_str = self.as_str()?;
        semver::Version::parse(version_str)
            .ok()
            .or_else(|| AttributeValue::parse_semver_loose(version_str))
            .map(|mut version| {
                version.build = semver::BuildMetadata::EMPTY;
                version
            })
    }

    fn parse_semver_loose(version_str: &str) -> Option<semver::Version> {
        let parts = VERSION_NUMERIC_COMPONENTS_REGEX.captures(version_str)?;

        let numeric_parts = parts.get(0)?;
        let mut transformed_version_str = numeric_parts.as_str().to_string();

        for i in 1..parts.len() {
            if parts.get(i).is_none() {
                transformed_version_str.push_str(".0");
            }
        }

        let rest = &version_str[numeric_parts.end()..];
        transformed_version_str.push_str(rest);

        semver::Version::parse(&transformed_version_str).ok()
    }

    /// Find the AttributeValue based off the provided predicate `p`.
    ///
    /// Arrays are searched element by element; any other non-null value is tested directly.
    pub fn find<P>(&self, p: P) -> Option<&AttributeValue>
    where
        P: Fn(&AttributeValue) -> bool,
    {
        match self {
            AttributeValue::String(_)
            | AttributeValue::Number(_)
            | AttributeValue::Bool(_)
            | AttributeValue::Object(_) => {
                if p(self) {
                    Some(self)
                } else {
                    None
                }
            }
            AttributeValue::Array(values) => values.iter().find(|v| p(v)),
            AttributeValue::Null => None,
        }
    }

    pub(crate) fn as_bucketable(&self) -> Option<String> {
        match self {
            AttributeValue::String(s) => Some(s.clone()),
            // We only support integer values as bucketable
            AttributeValue::Number(f) => integral(*f).map(|i| i.to_string()),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("null"),
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            AttributeValue::Null => serializer.serialize_unit(),
            AttributeValue::Bool(b) => serializer.serialize_bool(*b),
            AttributeValue::Number(f) => match integral(*f) {
                Some(i) => serializer.serialize_i64(i),
                None => serializer.serialize_f64(*f),
            },
            AttributeValue::String(s) => serializer.serialize_str(s),
            AttributeValue::Array(values) => {
                let mut seq = serializer.serialize_seq(Some(values.len()))?;
                for v in values {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
            AttributeValue::Object(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct AttributeValueVisitor;

        impl<'de> Visitor<'de> for AttributeValueVisitor {
            type Value = AttributeValue;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("any JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<AttributeValue, E> {
                Ok(AttributeValue::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<AttributeValue, E> {
                Ok(AttributeValue::Number(v as f64))
            }

            fn visit_u64<E>(self, v: u64) -> Result<AttributeValue, E> {
                Ok(AttributeValue::Number(v as f64))
            }

            fn visit_f64<E>(self, v: f64) -> Result<AttributeValue, E> {
                Ok(AttributeValue::Number(v))
            }

            fn visit_str<E>(self, v: &str) -> Result<AttributeValue, E> {
                Ok(AttributeValue::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<AttributeValue, E> {
                Ok(AttributeValue::String(v))
            }

            fn visit_unit<E>(self) -> Result<AttributeValue, E> {
                Ok(AttributeValue::Null)
            }

            fn visit_none<E>(self) -> Result<AttributeValue, E> {
                Ok(AttributeValue::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<AttributeValue, D::Error>
            where
                D: Deserializer<'de>,
            {
                Deserialize::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<AttributeValue, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut values = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(v) = seq.next_element()? {
                    values.push(v);
                }
                Ok(AttributeValue::Array(values))
            }

            fn visit_map<A>(self, mut map: A) -> Result<AttributeValue, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut object = AttributeValue::Object(Vec::with_capacity(
                    map.size_hint().unwrap_or(0),
                ));
                while let Some((k, v)) = map.next_entry::<String, AttributeValue>()? {
                    object.insert(k, v);
                }
                Ok(object)
            }
        }

        deserializer.deserialize_any(AttributeValueVisitor)
    }
}
