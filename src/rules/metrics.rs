//! Per-group metrics. Every vector is labelled by the group key and the
//! label values are removed when a reload drops the group.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, register_int_gauge_vec,
    GaugeVec, HistogramVec, IntCounterVec, IntGaugeVec,
};

const GROUP_LABEL: &str = "rule_group";

lazy_static! {
    /// count of rule group evaluation iterations scheduled
    pub(crate) static ref ITERATIONS_SCHEDULED: IntCounterVec = register_int_counter_vec!(
        "rule_group_iterations_total",
        "The total number of scheduled rule group evaluations.",
        &[GROUP_LABEL]
    )
    .unwrap();

    /// iterations skipped because the previous one was still running
    pub(crate) static ref ITERATIONS_MISSED: IntCounterVec = register_int_counter_vec!(
        "rule_group_iterations_missed_total",
        "The total number of rule group evaluations missed due to slow rule group evaluation.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref ITERATION_DURATION: HistogramVec = register_histogram_vec!(
        "rule_group_duration_seconds",
        "The duration of rule group evaluations.",
        &[GROUP_LABEL],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    )
    .unwrap();

    pub(crate) static ref EVALUATIONS: IntCounterVec = register_int_counter_vec!(
        "rule_evaluations_total",
        "The total number of rule evaluations.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref EVALUATION_FAILURES: IntCounterVec = register_int_counter_vec!(
        "rule_evaluation_failures_total",
        "The total number of rule evaluation failures.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref GROUP_INTERVAL: GaugeVec = register_gauge_vec!(
        "rule_group_interval_seconds",
        "The interval of a rule group.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref GROUP_LAST_EVAL_TIME: GaugeVec = register_gauge_vec!(
        "rule_group_last_evaluation_timestamp_seconds",
        "The timestamp of the last rule group evaluation.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref GROUP_LAST_DURATION: GaugeVec = register_gauge_vec!(
        "rule_group_last_duration_seconds",
        "The duration of the last rule group evaluation.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref GROUP_LAST_SAMPLES: IntGaugeVec = register_int_gauge_vec!(
        "rule_group_last_evaluation_samples",
        "The number of samples returned during the last rule group evaluation.",
        &[GROUP_LABEL]
    )
    .unwrap();

    pub(crate) static ref GROUP_RULES: IntGaugeVec = register_int_gauge_vec!(
        "rule_group_rules",
        "The number of rules in a rule group.",
        &[GROUP_LABEL]
    )
    .unwrap();
}

/// Drops every metric series of a removed group.
pub(crate) fn remove_group_metrics(key: &str) {
    let labels = &[key];
    let _ = ITERATIONS_SCHEDULED.remove_label_values(labels);
    let _ = ITERATIONS_MISSED.remove_label_values(labels);
    let _ = ITERATION_DURATION.remove_label_values(labels);
    let _ = EVALUATIONS.remove_label_values(labels);
    let _ = EVALUATION_FAILURES.remove_label_values(labels);
    let _ = GROUP_INTERVAL.remove_label_values(labels);
    let _ = GROUP_LAST_EVAL_TIME.remove_label_values(labels);
    let _ = GROUP_LAST_DURATION.remove_label_values(labels);
    let _ = GROUP_LAST_SAMPLES.remove_label_values(labels);
    let _ = GROUP_RULES.remove_label_values(labels);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_group_metrics() {
        let key = "metrics-test.yml;g";
        ITERATIONS_SCHEDULED.with_label_values(&[key]).inc();
        GROUP_RULES.with_label_values(&[key]).set(3);
        assert_eq!(ITERATIONS_SCHEDULED.with_label_values(&[key]).get(), 1);

        remove_group_metrics(key);
        // a fresh series starts over from zero
        assert_eq!(ITERATIONS_SCHEDULED.with_label_values(&[key]).get(), 0);
        remove_group_metrics(key);
    }
}
