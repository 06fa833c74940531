use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::common::types::{Labels, Timestamp, Vector};
use crate::rules::alerting::AlertingRule;
use crate::rules::datasource::QueryFunc;
use crate::rules::error::{RulesError, RulesResult};
use crate::rules::recording::RecordingRule;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleType {
    Recording,
    #[default]
    Alerting,
}

impl RuleType {
    pub fn name(&self) -> &'static str {
        match self {
            RuleType::Recording => "recording",
            RuleType::Alerting => "alerting",
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, RuleType::Recording)
    }

    pub fn is_alerting(&self) -> bool {
        matches!(self, RuleType::Alerting)
    }
}

impl Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            value if value.eq_ignore_ascii_case("recording") => Ok(RuleType::Recording),
            value if value.eq_ignore_ascii_case("alerting") => Ok(RuleType::Alerting),
            _ => Err(format!("unknown rule type: {}", s)),
        }
    }
}

/// The health of a rule based on the success or failure of its latest
/// evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleHealth {
    #[default]
    Unknown,
    Good,
    Bad,
}

/// Snapshot of a rule's most recent evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalState {
    /// wall time at which the last evaluation started
    pub last_evaluation: Timestamp,
    /// duration of the last evaluation
    pub last_duration: Duration,
    /// last error that happened during evaluation, reset on every success
    pub last_error: Option<RulesError>,
    /// number of series produced during the last evaluation
    pub last_samples: usize,
    pub health: RuleHealth,
}

/// Owner of a rule's [`EvalState`]. Mutated only by the scheduler task of
/// the group owning the rule; snapshots are safe from any task.
#[derive(Debug, Default)]
pub(crate) struct EvalStateCell(RwLock<EvalState>);

impl EvalStateCell {
    pub fn note_ok(&self, at: Timestamp, duration: Duration, samples: usize) {
        let mut state = self.0.write().unwrap();
        *state = EvalState {
            last_evaluation: at,
            last_duration: duration,
            last_error: None,
            last_samples: samples,
            health: RuleHealth::Good,
        };
    }

    pub fn note_err(&self, at: Timestamp, duration: Duration, err: RulesError) {
        let mut state = self.0.write().unwrap();
        *state = EvalState {
            last_evaluation: at,
            last_duration: duration,
            last_error: Some(err),
            last_samples: 0,
            health: RuleHealth::Bad,
        };
    }

    pub fn snapshot(&self) -> EvalState {
        self.0.read().unwrap().clone()
    }

    pub fn copy_from(&self, other: &EvalStateCell) {
        *self.0.write().unwrap() = other.snapshot();
    }
}

#[derive(Debug, Default)]
struct DependencyInner {
    /// rules this rule reads the output of, by index within the group;
    /// None until the analyser has resolved the group
    dependencies: Option<Vec<usize>>,
    /// rules reading this rule's output, by index within the group
    dependents: Option<Vec<usize>>,
}

/// Per-rule adjacency lists of the group's dependency DAG, stored as stable
/// rule indices to avoid pointer cycles between rules.
#[derive(Debug, Default)]
pub(crate) struct DependencySets(RwLock<DependencyInner>);

impl DependencySets {
    pub fn dependencies(&self) -> Option<Vec<usize>> {
        self.0.read().unwrap().dependencies.clone()
    }

    pub fn dependents(&self) -> Option<Vec<usize>> {
        self.0.read().unwrap().dependents.clone()
    }

    pub fn set_dependencies(&self, rules: Option<Vec<usize>>) {
        self.0.write().unwrap().dependencies = rules;
    }

    pub fn set_dependents(&self, rules: Option<Vec<usize>>) {
        self.0.write().unwrap().dependents = rules;
    }

    /// True only when the analyser proved both adjacency lists empty.
    pub fn is_isolated(&self) -> bool {
        let inner = self.0.read().unwrap();
        matches!(inner.dependencies.as_deref(), Some([]))
            && matches!(inner.dependents.as_deref(), Some([]))
    }
}

/// Rule represents an alerting or recording rule that can be evaluated
/// against a query engine at a point in time.
#[async_trait]
pub trait Rule: Send + Sync + Debug {
    fn name(&self) -> &str;
    /// the rule's expression
    fn query(&self) -> &str;
    fn labels(&self) -> &Labels;
    fn rule_type(&self) -> RuleType;

    /// Evaluates the rule at `eval_time`. The query runs at
    /// `eval_time - query_offset`; the returned samples are stamped with
    /// `eval_time` and are what the caller persists. Returns an error if the
    /// number of produced series exceeds `limit` (0 means unlimited).
    async fn eval(
        &self,
        eval_time: Timestamp,
        query_offset: Duration,
        query_fn: &QueryFunc,
        external_url: &str,
        limit: usize,
    ) -> RulesResult<Vector>;

    fn eval_state(&self) -> EvalState;

    fn dependency_rules(&self) -> Option<Vec<usize>>;
    fn dependent_rules(&self) -> Option<Vec<usize>>;
    /// True when the dependency analyser proved the rule has neither
    /// dependencies nor dependants within its group.
    fn no_dependency_rules(&self) -> bool;
    fn set_dependency_rules(&self, rules: Option<Vec<usize>>);
    fn set_dependent_rules(&self, rules: Option<Vec<usize>>);
}

/// A rule held by a group, a tagged variant over the two rule kinds.
#[derive(Debug)]
pub enum GroupRule {
    Recording(RecordingRule),
    Alerting(AlertingRule),
}

impl GroupRule {
    pub fn as_alerting(&self) -> Option<&AlertingRule> {
        match self {
            GroupRule::Alerting(rule) => Some(rule),
            GroupRule::Recording(_) => None,
        }
    }

    pub fn as_recording(&self) -> Option<&RecordingRule> {
        match self {
            GroupRule::Recording(rule) => Some(rule),
            GroupRule::Alerting(_) => None,
        }
    }

    /// Structural equality used by hot reload to decide whether a group may
    /// be kept: same kind, same normalised expression, same labels and, for
    /// alerting rules, same annotations and hold-down durations.
    pub fn equals(&self, other: &GroupRule) -> bool {
        match (self, other) {
            (GroupRule::Recording(a), GroupRule::Recording(b)) => a.equals(b),
            (GroupRule::Alerting(a), GroupRule::Alerting(b)) => a.equals(b),
            _ => false,
        }
    }

    fn inner(&self) -> &dyn Rule {
        match self {
            GroupRule::Recording(rule) => rule,
            GroupRule::Alerting(rule) => rule,
        }
    }
}

#[async_trait]
impl Rule for GroupRule {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn query(&self) -> &str {
        self.inner().query()
    }

    fn labels(&self) -> &Labels {
        self.inner().labels()
    }

    fn rule_type(&self) -> RuleType {
        self.inner().rule_type()
    }

    async fn eval(
        &self,
        eval_time: Timestamp,
        query_offset: Duration,
        query_fn: &QueryFunc,
        external_url: &str,
        limit: usize,
    ) -> RulesResult<Vector> {
        match self {
            GroupRule::Recording(rule) => {
                rule.eval(eval_time, query_offset, query_fn, external_url, limit)
                    .await
            }
            GroupRule::Alerting(rule) => {
                rule.eval(eval_time, query_offset, query_fn, external_url, limit)
                    .await
            }
        }
    }

    fn eval_state(&self) -> EvalState {
        self.inner().eval_state()
    }

    fn dependency_rules(&self) -> Option<Vec<usize>> {
        self.inner().dependency_rules()
    }

    fn dependent_rules(&self) -> Option<Vec<usize>> {
        self.inner().dependent_rules()
    }

    fn no_dependency_rules(&self) -> bool {
        self.inner().no_dependency_rules()
    }

    fn set_dependency_rules(&self, rules: Option<Vec<usize>>) {
        self.inner().set_dependency_rules(rules)
    }

    fn set_dependent_rules(&self, rules: Option<Vec<usize>>) {
        self.inner().set_dependent_rules(rules)
    }
}

/// Collapses whitespace runs so that reformatted but otherwise identical
/// expressions compare equal across reloads.
pub(crate) fn normalise_expr(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut last_was_space = false;
    for ch in expr.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(ch);
            last_was_space = false;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_type_round_trip() {
        assert_eq!("recording".parse::<RuleType>().unwrap(), RuleType::Recording);
        assert_eq!("Alerting".parse::<RuleType>().unwrap(), RuleType::Alerting);
        assert!("neither".parse::<RuleType>().is_err());
    }

    #[test]
    fn test_normalise_expr() {
        assert_eq!(normalise_expr("  up \n  + 1 "), "up + 1");
        assert_eq!(normalise_expr("rate(x[5m])"), "rate(x[5m])");
    }

    #[test]
    fn test_eval_state_cell_transitions() {
        let cell = EvalStateCell::default();
        assert_eq!(cell.snapshot().health, RuleHealth::Unknown);

        cell.note_ok(100, Duration::from_millis(5), 3);
        let state = cell.snapshot();
        assert_eq!(state.health, RuleHealth::Good);
        assert_eq!(state.last_samples, 3);
        assert!(state.last_error.is_none());

        cell.note_err(200, Duration::from_millis(1), RulesError::Generic("boom".into()));
        let state = cell.snapshot();
        assert_eq!(state.health, RuleHealth::Bad);
        assert_eq!(state.last_samples, 0);
        assert!(state.last_error.is_some());
    }

    #[test]
    fn test_dependency_sets_isolated() {
        let sets = DependencySets::default();
        assert!(!sets.is_isolated());
        sets.set_dependencies(Some(vec![]));
        sets.set_dependents(Some(vec![]));
        assert!(sets.is_isolated());
        sets.set_dependents(Some(vec![1]));
        assert!(!sets.is_isolated());
    }
}
