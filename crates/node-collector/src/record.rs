// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Internal representation of ingested telemetry.
//!
//! Both intake transports decode into [`Record`]s. Downstream stages only ever add
//! attributes to a record (see [`Record::insert_attribute`]); nothing after intake
//! removes or overwrites an attribute the workload supplied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::mem::size_of;

/// Per-entry bookkeeping overhead assumed for a map entry.
const MAP_ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

impl AttributeValue {
    fn heap_size(&self) -> usize {
        match self {
            AttributeValue::String(s) => s.len(),
            _ => 0,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Double(d) => write!(f, "{d}"),
            AttributeValue::String(s) => write!(f, "{s}"),
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Kind of telemetry a record belongs to, decided by the intake path it arrived on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    #[default]
    Metric,
    Trace,
    Log,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Metric => write!(f, "metric"),
            Signal::Trace => write!(f, "trace"),
            Signal::Log => write!(f, "log"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Structured(serde_json::Value),
}

impl Value {
    fn heap_size(&self) -> usize {
        match self {
            Value::Number(_) => 0,
            Value::Structured(v) => json_size(v),
        }
    }
}

/// Approximate number of bytes a JSON value occupies once parsed.
fn json_size(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(_) | serde_json::Value::Number(_) => 8,
        serde_json::Value::String(s) => s.len(),
        serde_json::Value::Array(items) => items.iter().map(json_size).sum::<usize>() + 8,
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| k.len() + json_size(v) + MAP_ENTRY_OVERHEAD)
            .sum(),
    }
}

/// Origin of a record on the node: the key used to look up workload metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub node: String,
    pub pod: String,
    pub container: String,
}

impl ResourceIdentity {
    pub fn new(
        node: impl Into<String>,
        pod: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            pod: pod.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.pod, self.container)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub signal: Signal,
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub timestamp_unix_nano: u64,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceIdentity>,
}

impl Record {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            signal: Signal::default(),
            name: name.into(),
            value,
            timestamp_unix_nano: 0,
            attributes: Attributes::new(),
            resource: None,
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource: ResourceIdentity) -> Self {
        self.resource = Some(resource);
        self
    }

    #[must_use]
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp_unix_nano: u64) -> Self {
        self.timestamp_unix_nano = timestamp_unix_nano;
        self
    }

    /// Adds an attribute unless the key is already present.
    ///
    /// Returns whether the attribute was added.
    pub fn insert_attribute(&mut self, key: &str, value: &AttributeValue) -> bool {
        if self.attributes.contains_key(key) {
            return false;
        }
        self.attributes.insert(key.to_string(), value.clone());
        true
    }

    /// Estimated number of bytes this record holds in memory.
    pub fn estimated_size(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(k, v)| {
                k.len() + v.heap_size() + size_of::<AttributeValue>() + MAP_ENTRY_OVERHEAD
            })
            .sum();
        let resource = self
            .resource
            .as_ref()
            .map_or(0, |r| r.node.len() + r.pod.len() + r.container.len());
        size_of::<Record>() + self.name.len() + self.value.heap_size() + attributes + resource
    }
}

/// An ordered group of records released by the batcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Batch {
    /// Monotonic sequence number assigned by the batcher.
    pub sequence: u64,
    pub records: Vec<Record>,
    /// Sum of the admission-time size estimates of `records`.
    #[serde(skip)]
    pub estimated_bytes: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A record travelling between pipeline stages together with the bytes it was
/// admitted with, so the exact same amount is released later.
#[derive(Debug, Clone)]
pub struct Entry {
    pub record: Record,
    pub bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_attribute_never_overwrites() {
        let mut record = Record::new("cpu", Value::Number(1.0)).with_attribute("env", "dev");
        assert!(!record.insert_attribute("env", &AttributeValue::from("prod")));
        assert!(record.insert_attribute("team", &AttributeValue::from("core")));
        assert_eq!(record.attributes["env"], AttributeValue::from("dev"));
        assert_eq!(record.attributes["team"], AttributeValue::from("core"));
    }

    #[test]
    fn test_estimated_size_grows_with_content() {
        let small = Record::new("a", Value::Number(1.0));
        let large = Record::new("a", Value::Number(1.0))
            .with_attribute("key", "a fairly long attribute value")
            .with_resource(ResourceIdentity::new("node-1", "pod-1", "app"));
        assert!(large.estimated_size() > small.estimated_size());
        assert!(small.estimated_size() >= size_of::<Record>());
    }

    #[test]
    fn test_deserialize_record() {
        let json = r#"{
            "name": "http.requests",
            "value": 3,
            "timestamp_unix_nano": 42,
            "attributes": {"endpoint": "/items", "status": 200, "ok": true, "ratio": 0.5},
            "resource": {"node": "n1", "pod": "pod-7", "container": "web"}
        }"#;
        let record: Record = serde_json::from_str(json).expect("failed to parse record");
        assert_eq!(record.signal, Signal::Metric);
        assert_eq!(record.value, Value::Number(3.0));
        assert_eq!(record.attributes["status"], AttributeValue::Int(200));
        assert_eq!(record.attributes["ok"], AttributeValue::Bool(true));
        assert_eq!(record.attributes["ratio"], AttributeValue::Double(0.5));
        assert_eq!(
            record.resource,
            Some(ResourceIdentity::new("n1", "pod-7", "web"))
        );
    }

    #[test]
    fn test_structured_value() {
        let json = r#"{"name": "log", "value": {"message": "hello"}}"#;
        let record: Record = serde_json::from_str(json).expect("failed to parse record");
        assert!(matches!(record.value, Value::Structured(_)));
        assert!(record.resource.is_none());
    }
}
