use std::fmt::Display;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

/// Unix timestamp in milliseconds.
pub type Timestamp = i64;

pub static METRIC_NAME_LABEL: &str = "__name__";

/// ALERT_METRIC_NAME is the metric name for synthetic alert timeseries.
pub static ALERT_METRIC_NAME: &str = "ALERTS";
/// ALERT_FOR_STATE_METRIC_NAME is the metric name for 'for' state of alert.
pub static ALERT_FOR_STATE_METRIC_NAME: &str = "ALERTS_FOR_STATE";
/// ALERT_NAME_LABEL is the label name indicating the name of an alert.
pub static ALERT_NAME_LABEL: &str = "alertname";
/// ALERT_STATE_LABEL is the label name indicating the state of an alert.
pub static ALERT_STATE_LABEL: &str = "alertstate";
/// ALERT_GROUP_NAME_LABEL defines the label name attached for generated time series.
pub static ALERT_GROUP_NAME_LABEL: &str = "alertgroup";

const STALE_NAN_BITS: u64 = 0x7ff0000000000002;

/// Returns the sentinel NaN marking the end of a series' existence.
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

pub fn is_stale_nan(value: f64) -> bool {
    value.to_bits() == STALE_NAN_BITS
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Label {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A label set, kept sorted by label name. At most one value per name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort();
        labels.dedup_by(|a, b| a.name == b.name);
        Labels(labels)
    }

    pub fn from_map(map: &AHashMap<String, String>) -> Self {
        let labels = map
            .iter()
            .map(|(k, v)| Label::new(k.clone(), v.clone()))
            .collect();
        Labels::new(labels)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    /// Returns the value for the given label name, empty string if missing.
    pub fn get(&self, name: &str) -> &str {
        match self.0.binary_search_by(|l| l.name.as_str().cmp(name)) {
            Ok(i) => &self.0[i].value,
            Err(_) => "",
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .is_ok()
    }

    /// Adds or replaces the label with the given name.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.binary_search_by(|l| l.name.as_str().cmp(name)) {
            Ok(i) => self.0[i].value = value.to_string(),
            Err(i) => self.0.insert(i, Label::new(name, value)),
        }
    }

    pub fn del(&mut self, name: &str) {
        if let Ok(i) = self.0.binary_search_by(|l| l.name.as_str().cmp(name)) {
            self.0.remove(i);
        }
    }

    /// True when every label of `other` is present here with an equal value.
    pub fn contains_all(&self, other: &Labels) -> bool {
        other.iter().all(|l| self.get(&l.name) == l.value)
    }
}

impl Display for Labels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Labels::new(iter.into_iter().map(|(k, v)| Label::new(k, v)).collect())
    }
}

/// One point of an instant vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub labels: Labels,
    pub timestamp: Timestamp,
    pub value: f64,
}

/// The result of an instant query.
pub type Vector = Vec<Sample>;

/// A labelled series over a time range.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub labels: Labels,
    pub timestamps: Vec<Timestamp>,
    pub values: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduped() {
        let labels = Labels::new(vec![
            Label::new("job", "api"),
            Label::new("env", "prod"),
            Label::new("env", "dup"),
        ]);
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("env"), "prod");
        assert_eq!(labels.get("job"), "api");
        assert_eq!(labels.get("missing"), "");
    }

    #[test]
    fn test_labels_set_and_del() {
        let mut labels = Labels::default();
        labels.set("instance", "a:9090");
        labels.set("job", "api");
        labels.set("instance", "b:9090");
        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("instance"), "b:9090");
        labels.del("instance");
        assert!(!labels.contains("instance"));
    }

    #[test]
    fn test_contains_all() {
        let full = Labels::new(vec![Label::new("a", "1"), Label::new("b", "2")]);
        let sub = Labels::new(vec![Label::new("a", "1")]);
        let other = Labels::new(vec![Label::new("a", "2")]);
        assert!(full.contains_all(&sub));
        assert!(full.contains_all(&Labels::default()));
        assert!(!full.contains_all(&other));
        assert!(!sub.contains_all(&full));
    }

    #[test]
    fn test_stale_nan_is_distinguishable() {
        assert!(stale_nan().is_nan());
        assert!(is_stale_nan(stale_nan()));
        assert!(!is_stale_nan(f64::NAN));
        assert!(!is_stale_nan(1.0));
    }
}
