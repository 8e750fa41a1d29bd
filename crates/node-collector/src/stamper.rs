// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::record::{AttributeValue, Attributes, Record};

/// Fixed attributes stamped on every record (cluster name, environment, ...).
///
/// Built once at startup and never modified afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticAttributes {
    attributes: Attributes,
}

impl StaticAttributes {
    pub fn new(attributes: Attributes) -> Self {
        Self { attributes }
    }

    /// Parses `key:value` pairs separated by commas and/or whitespace. The key ends at
    /// the first `:`, so values may contain colons. Pairs without a key are skipped.
    pub fn from_env_string(env_attributes: &str) -> Self {
        let mut attributes = Attributes::new();
        let normalized = env_attributes.replace(',', " ");
        for kv in normalized.split_whitespace() {
            match kv.split_once(':') {
                Some((key, value)) if !key.is_empty() => {
                    attributes.insert(key.to_string(), AttributeValue::from(value));
                }
                _ => {}
            }
        }
        Self { attributes }
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Adds every configured attribute the record does not carry yet.
    pub fn stamp(&self, record: &mut Record) {
        for (key, value) in &self.attributes {
            record.insert_attribute(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    #[test]
    fn test_from_env_string() {
        let stamper = StaticAttributes::from_env_string(
            "k8s.cluster.name:prod-eu, deployment.environment:production bogus :orphan",
        );
        assert_eq!(stamper.attributes().len(), 2);
        assert_eq!(
            stamper.attributes()["k8s.cluster.name"],
            AttributeValue::from("prod-eu")
        );
    }

    #[test]
    fn test_values_may_contain_colons() {
        let stamper = StaticAttributes::from_env_string(
            "collector.endpoint:http://localhost:4318,image:registry.local/app:1.2",
        );
        assert_eq!(stamper.attributes().len(), 2);
        assert_eq!(
            stamper.attributes()["collector.endpoint"],
            AttributeValue::from("http://localhost:4318")
        );
        assert_eq!(
            stamper.attributes()["image"],
            AttributeValue::from("registry.local/app:1.2")
        );
    }

    #[test]
    fn test_stamp_keeps_record_values() {
        let stamper = StaticAttributes::from_env_string("env:prod,cluster:c1");
        let mut record = Record::new("cpu", Value::Number(1.0)).with_attribute("env", "dev");
        stamper.stamp(&mut record);
        assert_eq!(record.attributes["env"], AttributeValue::from("dev"));
        assert_eq!(record.attributes["cluster"], AttributeValue::from("c1"));

        let once = record.clone();
        stamper.stamp(&mut record);
        assert_eq!(record, once);
    }
}
