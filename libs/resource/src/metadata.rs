use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a resource. A resource enters `TearingDown` through the
/// store's teardown operation and stays visible until its finalizer set
/// empties and it is destroyed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Running,
    TearingDown,
}

/// Identity of a resource: `(namespace, kind, id)` is globally unique within
/// one state store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub namespace: String,
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.id)
    }
}

/// Resource metadata. `version` strictly increases on every successful
/// mutation; readers carry the version they observed back into updates for
/// optimistic concurrency.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub namespace: String,
    pub kind: String,
    pub id: String,
    pub version: u64,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Insertion-ordered set of controller names blocking destruction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Metadata {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            id: id.into(),
            version: 0,
            phase: Phase::Running,
            owner: None,
            finalizers: Vec::new(),
            labels: BTreeMap::new(),
            created: now,
            updated: now,
        }
    }

    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(&self.namespace, &self.kind, &self.id)
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a finalizer, keeping insertion order. Returns false if it was
    /// already present.
    pub fn add_finalizer(&mut self, name: &str) -> bool {
        if self.finalizers.iter().any(|f| f == name) {
            return false;
        }
        self.finalizers.push(name.to_string());
        true
    }

    /// Remove a finalizer. Returns false if it was not present.
    pub fn remove_finalizer(&mut self, name: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != name);
        self.finalizers.len() != before
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers.iter().any(|f| f == name)
    }
}

/// A single label predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelTerm {
    Equals(String, String),
    Exists(String),
}

impl LabelTerm {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            LabelTerm::Equals(key, value) => labels.get(key) == Some(value),
            LabelTerm::Exists(key) => labels.contains_key(key),
        }
    }
}

/// Conjunction of label predicates used to filter list and watch results. The
/// empty query matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelQuery {
    terms: Vec<LabelTerm>,
}

impl LabelQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn equals(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Equals(key.into(), value.into()));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.terms.push(LabelTerm::Exists(key.into()));
        self
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.terms.iter().all(|t| t.matches(&metadata.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizers_keep_insertion_order() {
        let mut meta = Metadata::new("runtime", "Service", "etcd");
        assert!(meta.add_finalizer("a"));
        assert!(meta.add_finalizer("b"));
        assert!(!meta.add_finalizer("a"));
        assert_eq!(meta.finalizers, vec!["a", "b"]);

        assert!(meta.remove_finalizer("a"));
        assert!(!meta.remove_finalizer("a"));
        assert_eq!(meta.finalizers, vec!["b"]);
    }

    #[test]
    fn test_label_query() {
        let meta = Metadata::new("cluster", "Affiliate", "node-1")
            .label("local", "")
            .label("cluster-id", "c1");

        assert!(LabelQuery::new().matches(&meta));
        assert!(LabelQuery::new().exists("local").matches(&meta));
        assert!(
            LabelQuery::new()
                .equals("cluster-id", "c1")
                .exists("local")
                .matches(&meta)
        );
        assert!(!LabelQuery::new().equals("cluster-id", "c2").matches(&meta));
        assert!(!LabelQuery::new().exists("missing").matches(&meta));
    }
}
