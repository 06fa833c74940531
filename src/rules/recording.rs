use std::time::{Duration, Instant};

use ahash::AHashSet;
use async_trait::async_trait;

use crate::common::types::{Labels, Sample, Timestamp, Vector, METRIC_NAME_LABEL};
use crate::common::{current_time_millis, duration_to_millis, hash_labels};
use crate::rules::datasource::QueryFunc;
use crate::rules::error::{RulesError, RulesResult};
use crate::rules::rule::{normalise_expr, DependencySets, EvalState, EvalStateCell, Rule, RuleType};

/// RecordingRule evaluates a configured expression and persists the result
/// as samples of a new series named after the rule.
#[derive(Debug)]
pub struct RecordingRule {
    name: String,
    expr: String,
    labels: Labels,
    pub(crate) state: EvalStateCell,
    pub(crate) deps: DependencySets,
}

impl RecordingRule {
    pub fn new(name: impl Into<String>, expr: impl Into<String>, labels: Labels) -> Self {
        RecordingRule {
            name: name.into(),
            expr: expr.into(),
            labels,
            state: EvalStateCell::default(),
            deps: DependencySets::default(),
        }
    }

    pub fn equals(&self, other: &RecordingRule) -> bool {
        self.name == other.name
            && normalise_expr(&self.expr) == normalise_expr(&other.expr)
            && self.labels == other.labels
    }

    fn to_output_labels(&self, sample_labels: &Labels) -> Labels {
        let mut labels = sample_labels.clone();
        labels.set(METRIC_NAME_LABEL, &self.name);
        // configured labels override the ones coming from the query result
        for l in self.labels.iter() {
            labels.set(&l.name, &l.value);
        }
        labels
    }
}

#[async_trait]
impl Rule for RecordingRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self) -> &str {
        &self.expr
    }

    fn labels(&self) -> &Labels {
        &self.labels
    }

    fn rule_type(&self) -> RuleType {
        RuleType::Recording
    }

    async fn eval(
        &self,
        eval_time: Timestamp,
        query_offset: Duration,
        query_fn: &QueryFunc,
        _external_url: &str,
        limit: usize,
    ) -> RulesResult<Vector> {
        let started = current_time_millis();
        let clock = Instant::now();
        let query_time = eval_time - duration_to_millis(query_offset);

        let vector = match (query_fn)(self.expr.clone(), query_time).await {
            Ok(vector) => vector,
            Err(err) => {
                self.state.note_err(started, clock.elapsed(), err.clone());
                return Err(err);
            }
        };

        if limit > 0 && vector.len() > limit {
            let err = RulesError::SeriesLimitExceeded {
                limit,
                actual: vector.len(),
            };
            self.state.note_err(started, clock.elapsed(), err.clone());
            return Err(err);
        }

        let mut seen = AHashSet::with_capacity(vector.len());
        let mut out = Vector::with_capacity(vector.len());
        for sample in &vector {
            let labels = self.to_output_labels(&sample.labels);
            if !seen.insert(hash_labels(&labels)) {
                let err = RulesError::DuplicateSeries(format!(
                    "rule {:?}: result contains series with the same labelset {} after applying rule labels",
                    self.name, labels
                ));
                self.state.note_err(started, clock.elapsed(), err.clone());
                return Err(err);
            }
            out.push(Sample {
                labels,
                timestamp: eval_time,
                value: sample.value,
            });
        }

        self.state.note_ok(started, clock.elapsed(), out.len());
        Ok(out)
    }

    fn eval_state(&self) -> EvalState {
        self.state.snapshot()
    }

    fn dependency_rules(&self) -> Option<Vec<usize>> {
        self.deps.dependencies()
    }

    fn dependent_rules(&self) -> Option<Vec<usize>> {
        self.deps.dependents()
    }

    fn no_dependency_rules(&self) -> bool {
        self.deps.is_isolated()
    }

    fn set_dependency_rules(&self, rules: Option<Vec<usize>>) {
        self.deps.set_dependencies(rules)
    }

    fn set_dependent_rules(&self, rules: Option<Vec<usize>>) {
        self.deps.set_dependents(rules)
    }
}
