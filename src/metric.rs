//! Metric and namespace types exchanged with collector plugins.
//!
//! ## Responsibility
//! Model the pieces of a metric the routing/caching core looks at: the
//! ordered namespace (with optional dynamic positions), the plugin version
//! and an opaque payload.
//!
//! ## Guarantees
//! - `Namespace` renders as `/a/b/c`; the rendered string is the cache key
//!   prefix.
//! - A namespace element is dynamic iff it carries a name.
//!
//! ## NOT Responsible For
//! - Wire encoding of metrics (owned by the plugin transport)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Marker substituted for dynamic namespace positions when grouping.
pub const WILDCARD: &str = "*";

/// One segment of a metric namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceElement {
    /// Concrete value of this segment (e.g. `cpu0`).
    pub value: String,
    /// Name of the dynamic element (e.g. `cpu_id`); `None` for static segments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl NamespaceElement {
    /// A static segment.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            name: None,
            description: String::new(),
        }
    }

    /// A dynamic segment whose concrete value varies per host/resource.
    pub fn dynamic(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            name: Some(name.into()),
            description: String::new(),
        }
    }

    /// Whether this segment is a dynamic position.
    pub fn is_dynamic(&self) -> bool {
        self.name.is_some()
    }
}

/// Ordered sequence of namespace segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(Vec<NamespaceElement>);

impl Namespace {
    /// Build a namespace of static segments.
    ///
    /// ```rust
    /// use telemetry_plugin_pool::metric::Namespace;
    /// let ns = Namespace::from_strs(["intel", "mock", "foo"]);
    /// assert_eq!(ns.to_string(), "/intel/mock/foo");
    /// ```
    pub fn from_strs<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(parts.into_iter().map(NamespaceElement::new).collect())
    }

    /// Turn the segment at `index` into a dynamic position named `name`.
    /// Out-of-range indexes are ignored.
    pub fn with_dynamic(mut self, index: usize, name: impl Into<String>) -> Self {
        if let Some(el) = self.0.get_mut(index) {
            el.name = Some(name.into());
        }
        self
    }

    /// Segment values in order.
    pub fn strings(&self) -> Vec<&str> {
        self.0.iter().map(|e| e.value.as_str()).collect()
    }

    /// Segments in order.
    pub fn elements(&self) -> &[NamespaceElement] {
        &self.0
    }

    /// Whether the namespace has dynamic positions, and which.
    pub fn is_dynamic(&self) -> (bool, Vec<usize>) {
        let indexes: Vec<usize> = self
            .0
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_dynamic())
            .map(|(i, _)| i)
            .collect();
        (!indexes.is_empty(), indexes)
    }

    /// Copy of this namespace with every dynamic position replaced by
    /// [`WILDCARD`].
    pub fn wildcarded(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|e| {
                    if e.is_dynamic() {
                        NamespaceElement {
                            value: WILDCARD.to_string(),
                            ..e.clone()
                        }
                    } else {
                        e.clone()
                    }
                })
                .collect(),
        )
    }
}

impl From<Vec<NamespaceElement>> for Namespace {
    fn from(elements: Vec<NamespaceElement>) -> Self {
        Self(elements)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for el in &self.0 {
            write!(f, "/{}", el.value)?;
        }
        Ok(())
    }
}

/// A metric as requested from, or returned by, a collector plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Where the metric lives.
    pub namespace: Namespace,
    /// Version of the plugin that produced (or should produce) the metric.
    pub version: i64,
    /// Collected value; `Null` for requests.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Arbitrary string tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Metric {
    /// A metric with no data, as used in collection requests.
    pub fn request(namespace: Namespace, version: i64) -> Self {
        Self {
            namespace,
            version,
            data: serde_json::Value::Null,
            tags: BTreeMap::new(),
        }
    }

    /// Replace the payload.
    pub fn with_data(mut self, data: impl Into<serde_json::Value>) -> Self {
        self.data = data.into();
        self
    }

    /// Namespace of the metric.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Plugin version of the metric.
    pub fn version(&self) -> i64 {
        self.version
    }
}
