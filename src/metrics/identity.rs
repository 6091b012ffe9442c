//! Metric identity
//!
//! A metric is identified by the XOR of the djb2 hashes of its namespace,
//! its name and each of its tags. XOR makes the result independent of tag
//! order, so a remote client holding only `(ns, name, tags)` derives the
//! same identity the provider registered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable, order-independent key of a `(namespace, name, tags)` tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricId(pub u32);

impl MetricId {
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl From<u32> for MetricId {
    fn from(v: u32) -> Self {
        MetricId(v)
    }
}

/// djb2: `h = h * 33 + c`, seeded at 5381
#[inline]
pub fn djb2(s: &str) -> u32 {
    s.bytes().fold(5381u32, |h, c| {
        (h << 5).wrapping_add(h).wrapping_add(u32::from(c))
    })
}

/// Identity of a metric from its string identifiers.
///
/// Callers validate that `namespace` and `name` are non-empty before
/// registering; the hash itself accepts any input.
pub fn compute_identity<'a, I>(namespace: &str, name: &str, tags: I) -> MetricId
where
    I: IntoIterator<Item = &'a str>,
{
    let id = tags
        .into_iter()
        .fold(djb2(namespace) ^ djb2(name), |acc, tag| acc ^ djb2(tag));
    MetricId(id)
}
