use std::{collections::BTreeMap, fmt};

use crate::{MetricKey, METRIC_NAME_LABEL};

/// Series identity: the metric name plus its label set.
///
/// The name is stored under the [`METRIC_NAME_LABEL`] label, so every label
/// name is unique within a metric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Metric {
    labels: BTreeMap<String, String>,
}
impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(METRIC_NAME_LABEL.to_string(), name.into());
        Self { labels }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name.into(), value.into());
        self
    }
    /// Returns the previous value if the label was already set.
    pub fn insert(&mut self, name: String, value: String) -> Option<String> {
        self.labels.insert(name, value)
    }

    pub fn name(&self) -> &str {
        self.get(METRIC_NAME_LABEL).unwrap_or_default()
    }
    pub fn get(&self, label: &str) -> Option<&str> {
        self.labels.get(label).map(String::as_str)
    }
    /// Labels other than the metric name, sorted by label name.
    pub fn labels(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels
            .iter()
            .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL)
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Canonical series key, e.g. `http_requests_total{code="200",method="get"}`.
    pub fn key(&self) -> MetricKey {
        self.to_string()
    }
}
impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())?;
        let mut labels = self.labels().peekable();
        if labels.peek().is_none() {
            return Ok(());
        }
        f.write_str("{")?;
        let mut first = true;
        for (name, value) in labels {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{name}=\"")?;
            for c in value.chars() {
                match c {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}
