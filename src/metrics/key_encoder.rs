//! Key encoding for aggregation sinks
//!
//! Encodes a metric's string identifiers into the keys written to the
//! external key-value tier.
//!
//! Key format: `<ns>_<name>[_<tag>...]_<OP>`
//!
//! Examples:
//! - `srini_testmetric_tag1_tag2_SUM`
//! - `app_latency_ANOMALY`

use super::types::{ReductionOp, TagList};

/// Encodes and decodes aggregation keys
pub struct MetricKeyEncoder;

impl MetricKeyEncoder {
    /// Stringified identity: `ns_name_tag1_tag2...` in creation order
    pub fn stringify(namespace: &str, name: &str, tags: &TagList) -> String {
        let extra: usize = tags.iter().map(|t| t.len() + 1).sum();
        let mut key = String::with_capacity(namespace.len() + name.len() + 1 + extra);
        key.push_str(namespace);
        key.push('_');
        key.push_str(name);
        for tag in tags.iter() {
            key.push('_');
            key.push_str(tag);
        }
        key
    }

    /// Encode the sink key for a reduced value
    ///
    /// Format: `<stringified>_<OP>`
    pub fn encode(stringified: &str, op: ReductionOp) -> String {
        format!("{}_{}", stringified, op.op_name())
    }

    /// Split a sink key back into its stringified identity and operator
    pub fn decode(key: &str) -> Option<(&str, ReductionOp)> {
        let (stringified, op) = key.rsplit_once('_')?;
        if stringified.is_empty() {
            return None;
        }
        let op = ReductionOp::from_name(op)?;
        Some((stringified, op))
    }

    /// Check if a key carries a reduced value
    pub fn is_reduction_key(key: &str) -> bool {
        Self::decode(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stringify_keeps_tag_order() {
        let tags = TagList::from_slice(&["tag1", "tag2", "tag3"]).unwrap();
        assert_eq!(
            MetricKeyEncoder::stringify("srini", "testmetric", &tags),
            "srini_testmetric_tag1_tag2_tag3"
        );
    }

    #[test]
    fn test_stringify_without_tags() {
        assert_eq!(
            MetricKeyEncoder::stringify("app", "latency", &TagList::empty()),
            "app_latency"
        );
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let key = MetricKeyEncoder::encode("app_latency_host1", ReductionOp::Max);
        assert_eq!(key, "app_latency_host1_MAX");
        assert_eq!(
            MetricKeyEncoder::decode(&key),
            Some(("app_latency_host1", ReductionOp::Max))
        );
    }

    #[test]
    fn test_decode_invalid_key() {
        assert!(MetricKeyEncoder::decode("nounderscore").is_none());
        assert!(MetricKeyEncoder::decode("app_latency_MEDIAN").is_none());
        assert!(MetricKeyEncoder::decode("_SUM").is_none());
        assert!(!MetricKeyEncoder::is_reduction_key("app_latency"));
    }
}
