use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::common::types::{ALERT_FOR_STATE_METRIC_NAME, ALERT_METRIC_NAME};
use crate::rules::group::Group;
use crate::rules::rule::{GroupRule, Rule, RuleType};

/// A set of rule indices that may be evaluated with no ordering constraint
/// between them.
pub type ConcurrentRules = Vec<usize>;

/// RuleConcurrencyController controls whether rules can be evaluated
/// concurrently. Its implementations purposefully never block: a rejected
/// admission means the caller evaluates inline.
pub trait RuleConcurrencyController: Send + Sync {
    /// Slices the group's rules into an ordered list of batches; evaluating
    /// every rule of batch `k` before starting batch `k + 1` is sufficient
    /// to respect inter-rule dependencies.
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules>;

    /// Non-blocking admission for one concurrent rule evaluation. When it
    /// returns true the caller must call [`RuleConcurrencyController::done`]
    /// exactly once after the evaluation finished.
    fn allow(&self, group: &Group, rule_index: usize) -> bool;

    /// Releases an admission slot acquired through `allow`.
    fn done(&self);
}

/// The default controller: everything runs inline, one rule after another.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequentialRuleEvalController;

impl RuleConcurrencyController for SequentialRuleEvalController {
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules> {
        sequential_plan(group.rules().len())
    }

    fn allow(&self, _group: &Group, _rule_index: usize) -> bool {
        false
    }

    fn done(&self) {}
}

/// Bounds concurrent rule evaluations across all groups with a process-wide
/// weighted semaphore.
#[derive(Debug)]
pub struct ConcurrentRuleEvalController {
    sem: Semaphore,
}

impl ConcurrentRuleEvalController {
    pub fn new(max_concurrency: usize) -> Self {
        ConcurrentRuleEvalController {
            sem: Semaphore::new(max_concurrency.max(1)),
        }
    }
}

impl RuleConcurrencyController for ConcurrentRuleEvalController {
    fn split_group_into_batches(&self, group: &Group) -> Vec<ConcurrentRules> {
        split_rules_into_batches(&group.key(), group.rules())
    }

    fn allow(&self, _group: &Group, _rule_index: usize) -> bool {
        match self.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    fn done(&self) {
        self.sem.add_permits(1);
    }
}

pub(crate) fn sequential_plan(len: usize) -> Vec<ConcurrentRules> {
    (0..len).map(|i| vec![i]).collect()
}

/// Topological layering (Kahn) over the group's dependency DAG. Falls back
/// to the sequential plan when the dependency map is absent, when no rule is
/// provably independent, or when a cycle is detected.
fn split_rules_into_batches(group_key: &str, rules: &[Arc<GroupRule>]) -> Vec<ConcurrentRules> {
    if rules.len() < 2 {
        return sequential_plan(rules.len());
    }

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(rules.len());
    let mut dependents: Vec<Vec<usize>> = Vec::with_capacity(rules.len());
    for rule in rules {
        match (rule.dependency_rules(), rule.dependent_rules()) {
            (Some(d), Some(t)) => {
                deps.push(d);
                dependents.push(t);
            }
            _ => {
                debug!(group = group_key, "rule dependencies indeterminate, using sequential plan");
                return sequential_plan(rules.len());
            }
        }
    }

    let first: ConcurrentRules = (0..rules.len())
        .filter(|&i| deps[i].is_empty() && dependents[i].is_empty())
        .collect();
    if first.is_empty() {
        if has_cycle(&deps) {
            warn!(
                group = group_key,
                "cyclic rule dependencies detected, falling back to sequential rule evaluation"
            );
        } else {
            info!(
                group = group_key,
                "no rules without dependencies found, falling back to sequential rule evaluation"
            );
        }
        return sequential_plan(rules.len());
    }

    // per-rule set of not-yet-evaluated dependencies; None once batched
    let mut pending: Vec<Option<AHashSet<usize>>> = deps
        .iter()
        .map(|d| Some(d.iter().copied().collect()))
        .collect();
    for &i in &first {
        pending[i] = None;
    }

    let mut order = vec![first];
    loop {
        for &i in order.last().unwrap() {
            for &d in &dependents[i] {
                if let Some(set) = pending[d].as_mut() {
                    set.remove(&i);
                }
            }
        }
        let next: ConcurrentRules = (0..rules.len())
            .filter(|&i| pending[i].as_ref().is_some_and(|set| set.is_empty()))
            .collect();
        if next.is_empty() {
            if pending.iter().any(Option::is_some) {
                warn!(
                    group = group_key,
                    "cyclic rule dependencies detected, falling back to sequential rule evaluation"
                );
                return sequential_plan(rules.len());
            }
            break;
        }
        for &i in &next {
            pending[i] = None;
        }
        order.push(next);
    }
    order
}

fn has_cycle(deps: &[Vec<usize>]) -> bool {
    let n = deps.len();
    let mut indegree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, d) in deps.iter().enumerate() {
        for &p in d {
            dependents[p].push(i);
        }
    }
    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut processed = 0;
    while let Some(i) = queue.pop() {
        processed += 1;
        for &d in &dependents[i] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                queue.push(d);
            }
        }
    }
    processed < n
}

/// RuleDependencyController analyses the rules of one group and records on
/// each rule which other rules it depends on and which depend on it, by
/// stable index within the group.
pub trait RuleDependencyController: Send + Sync {
    fn analyse_rules(&self, rules: &[Arc<GroupRule>]);
}

/// The default analyser. It extracts the series selectors of each rule
/// expression lexically and joins them against the output names of the
/// group's recording rules. The extraction is deliberately conservative:
/// whenever an expression cannot be proven to read a closed set of series
/// the whole group is marked indeterminate and evaluates sequentially.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRuleDependencyController;

impl RuleDependencyController for DefaultRuleDependencyController {
    fn analyse_rules(&self, rules: &[Arc<GroupRule>]) {
        match build_dependency_map(rules) {
            Some((deps, dependents)) => {
                for (i, rule) in rules.iter().enumerate() {
                    rule.set_dependency_rules(Some(deps[i].clone()));
                    rule.set_dependent_rules(Some(dependents[i].clone()));
                }
            }
            None => {
                for rule in rules {
                    rule.set_dependency_rules(None);
                    rule.set_dependent_rules(None);
                }
            }
        }
    }
}

/// Builds the bidirectional dependency map of a rule list, or None when the
/// rules cannot be proven reorderable: fewer than two rules, an expression
/// that resists analysis, an output series produced by more than one rule,
/// or a reference to the synthetic alert series.
#[allow(clippy::type_complexity)]
fn build_dependency_map(rules: &[Arc<GroupRule>]) -> Option<(Vec<Vec<usize>>, Vec<Vec<usize>>)> {
    if rules.len() < 2 {
        return None;
    }

    let mut producers: AHashMap<&str, usize> = AHashMap::with_capacity(rules.len());
    for (i, rule) in rules.iter().enumerate() {
        if rule.rule_type() == RuleType::Recording {
            let name = rule.name();
            if is_reserved_word(name) {
                return None;
            }
            if producers.insert(name, i).is_some() {
                // ambiguous producer
                return None;
            }
        }
    }

    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); rules.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); rules.len()];
    for (i, rule) in rules.iter().enumerate() {
        let names = selector_names(rule.query())?;
        if names.contains(ALERT_METRIC_NAME) || names.contains(ALERT_FOR_STATE_METRIC_NAME) {
            // reading alert outputs ties the rule to every alerting rule
            return None;
        }
        for name in &names {
            if let Some(&p) = producers.get(name.as_str()) {
                // a rule reading its own output sees the previous iteration
                if p != i {
                    deps[i].push(p);
                    dependents[p].push(i);
                }
            }
        }
    }
    for list in deps.iter_mut().chain(dependents.iter_mut()) {
        list.sort_unstable();
        list.dedup();
    }
    Some((deps, dependents))
}

/// reserved words the scanner skips; a producer with such a name would be
/// invisible to it
const RESERVED: &[&str] = &[
    "and",
    "or",
    "unless",
    "by",
    "without",
    "on",
    "ignoring",
    "group_left",
    "group_right",
    "bool",
    "offset",
    "atan2",
    "sum",
    "min",
    "max",
    "avg",
    "group",
    "stddev",
    "stdvar",
    "count",
    "count_values",
    "bottomk",
    "topk",
    "quantile",
    "limitk",
    "limit_ratio",
];

fn is_reserved_word(word: &str) -> bool {
    RESERVED.contains(&word)
}

/// operators whose parenthesised argument is a label list, not an expression
const LABEL_LIST_WORDS: &[&str] = &[
    "by",
    "without",
    "on",
    "ignoring",
    "group_left",
    "group_right",
];

fn is_label_list_word(word: &str) -> bool {
    LABEL_LIST_WORDS.contains(&word)
}

/// Extracts the metric names an expression selects from, or None when the
/// expression cannot be analysed to a closed set: nameless selectors,
/// `__name__` matchers and malformed syntax all make the result
/// indeterminate. Over-approximation is fine (a stray name only ever adds
/// ordering); missing a real selector is not, so anything unclear bails.
fn selector_names(expr: &str) -> Option<AHashSet<String>> {
    let bytes = expr.as_bytes();
    let mut names = AHashSet::new();
    let mut i = 0;
    // whether the previous token was an identifier a matcher block may follow
    let mut after_selector = false;
    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        match c {
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'"' | b'\'' | b'`' => {
                i = skip_string(bytes, i)?;
                after_selector = false;
            }
            b'{' => {
                if !after_selector {
                    // a selector without a metric name
                    return None;
                }
                let end = matching_brace(bytes, i)?;
                if expr[i..end].contains("__name__") {
                    return None;
                }
                i = end + 1;
                after_selector = false;
            }
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                if i == bytes.len() {
                    return None;
                }
                i += 1;
                after_selector = false;
            }
            _ if is_ident_start(c) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                let word = &expr[start..i];
                let mut j = i;
                while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                    j += 1;
                }
                if is_label_list_word(word) {
                    // the parenthesised argument holds label names, skip it
                    after_selector = false;
                    if bytes.get(j) == Some(&b'(') {
                        i = matching_paren(bytes, j)? + 1;
                    }
                } else if bytes.get(j) == Some(&b'(') || is_reserved_word(word) {
                    // a function or aggregation call, or an operator keyword
                    after_selector = false;
                } else {
                    names.insert(word.to_string());
                    after_selector = true;
                }
            }
            _ if c.is_ascii_digit() => {
                // numbers and durations, e.g. 1e3, 0x1f, 5m
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
                after_selector = false;
            }
            _ => {
                i += 1;
                after_selector = false;
            }
        }
    }
    Some(names)
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':'
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b':'
}

/// Returns the index one past the closing quote, None if unterminated.
fn skip_string(bytes: &[u8], start: usize) -> Option<usize> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Returns the index of the matching `}`, skipping strings inside.
fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => i = skip_string(bytes, i)?,
            b'}' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Returns the index of the matching `)` of a label list.
fn matching_paren(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => i = skip_string(bytes, i)?,
            b')' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Labels;
    use crate::rules::recording::RecordingRule;
    use test_case::test_case;

    fn record(name: &str, expr: &str) -> Arc<GroupRule> {
        Arc::new(GroupRule::Recording(RecordingRule::new(
            name,
            expr,
            Labels::default(),
        )))
    }

    #[test_case("up", &["up"]; "bare selector")]
    #[test_case("r1 + 1", &["r1"]; "arithmetic")]
    #[test_case("rate(http_requests_total[5m])", &["http_requests_total"]; "function call")]
    #[test_case("sum by (job) (up{env=\"prod\"})", &["up"]; "aggregation with grouping")]
    #[test_case("a / on(job) b", &["a", "b"]; "vector matching")]
    #[test_case("foo offset 5m", &["foo"]; "offset modifier")]
    #[test_case("scalar(vector(1))", &[]; "nested functions")]
    fn test_selector_names(expr: &str, expected: &[&str]) {
        let names = selector_names(expr).unwrap();
        let expected: AHashSet<String> = expected.iter().map(|s| s.to_string()).collect();
        assert_eq!(names, expected);
    }

    #[test_case("{job=\"api\"}"; "nameless selector")]
    #[test_case("{__name__=~\"job:.*\"}"; "name matcher")]
    #[test_case("foo{__name__=\"bar\"}"; "name matcher with selector")]
    #[test_case("foo{job=\"unterminated"; "unterminated string")]
    fn test_selector_names_indeterminate(expr: &str) {
        assert!(selector_names(expr).is_none());
    }

    #[test]
    fn test_selector_names_skips_label_values() {
        // the selector name inside a label value string must not count
        let names = selector_names("up{job=\"r1\"}").unwrap();
        let expected: AHashSet<String> = ["up".to_string()].into_iter().collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_build_dependency_map_chain() {
        let rules = vec![record("r1", "up"), record("r2", "r1 + 1")];
        let (deps, dependents) = build_dependency_map(&rules).unwrap();
        assert_eq!(deps, vec![vec![], vec![0]]);
        assert_eq!(dependents, vec![vec![1], vec![]]);
    }

    #[test]
    fn test_build_dependency_map_ambiguous_producer() {
        let rules = vec![record("r1", "up"), record("r1", "down")];
        assert!(build_dependency_map(&rules).is_none());
    }

    #[test]
    fn test_build_dependency_map_alert_series_reference() {
        let rules = vec![record("r1", "up"), record("r2", "ALERTS")];
        assert!(build_dependency_map(&rules).is_none());
    }

    #[test]
    fn test_build_dependency_map_self_reference() {
        let rules = vec![record("r1", "r1 + up"), record("r2", "down")];
        let (deps, _) = build_dependency_map(&rules).unwrap();
        assert_eq!(deps, vec![vec![], vec![]]);
    }

    #[test]
    fn test_single_rule_has_no_map() {
        let rules = vec![record("r1", "up")];
        assert!(build_dependency_map(&rules).is_none());
    }

    fn analysed(rules: Vec<Arc<GroupRule>>) -> Vec<Arc<GroupRule>> {
        DefaultRuleDependencyController.analyse_rules(&rules);
        rules
    }

    fn batch_sets(batches: &[ConcurrentRules]) -> Vec<AHashSet<usize>> {
        batches
            .iter()
            .map(|b| b.iter().copied().collect())
            .collect()
    }

    #[test]
    fn test_split_independent_rules_into_one_batch() {
        let rules = analysed(vec![record("x", "up"), record("y", "down")]);
        let batches = split_rules_into_batches("g", &rules);
        let expected: Vec<AHashSet<usize>> = vec![[0, 1].into_iter().collect()];
        assert_eq!(batch_sets(&batches), expected);
    }

    #[test]
    fn test_split_chain_falls_back_to_sequential() {
        let rules = analysed(vec![
            record("a", "up"),
            record("b", "a + 1"),
            record("c", "b + 1"),
        ]);
        let batches = split_rules_into_batches("g", &rules);
        assert_eq!(batches, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn test_split_mixed_graph_layers_after_isolated_batch() {
        let rules = analysed(vec![
            record("x", "up"),
            record("y", "down"),
            record("a", "node_cpu"),
            record("b", "a * 2"),
        ]);
        let batches = split_rules_into_batches("g", &rules);
        let expected: Vec<AHashSet<usize>> = vec![
            [0, 1].into_iter().collect(),
            [2].into_iter().collect(),
            [3].into_iter().collect(),
        ];
        assert_eq!(batch_sets(&batches), expected);
    }

    #[test]
    fn test_split_cycle_falls_back_to_sequential() {
        let rules = analysed(vec![record("a", "b"), record("b", "a")]);
        let batches = split_rules_into_batches("g", &rules);
        assert_eq!(batches, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_split_indeterminate_falls_back_to_sequential() {
        let rules = analysed(vec![record("a", "up"), record("b", "{__name__=\"a\"}")]);
        assert!(rules[0].dependency_rules().is_none());
        let batches = split_rules_into_batches("g", &rules);
        assert_eq!(batches, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_batches_partition_all_rules_exactly_once() {
        let rules = analysed(vec![
            record("x", "up"),
            record("y", "down"),
            record("a", "x + y"),
            record("b", "a * 2"),
            record("c", "node_load1"),
        ]);
        let batches = split_rules_into_batches("g", &rules);
        let mut seen: Vec<usize> = batches.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);

        // dependency soundness: every dependency sits in an earlier batch
        let batch_of = |idx: usize| batches.iter().position(|b| b.contains(&idx)).unwrap();
        for (i, rule) in rules.iter().enumerate() {
            for dep in rule.dependency_rules().unwrap() {
                assert!(batch_of(dep) < batch_of(i), "rule {} depends on {}", i, dep);
            }
        }
    }

    #[test]
    fn test_semaphore_admission_and_release() {
        let controller = ConcurrentRuleEvalController::new(2);
        let group = Group::detached_for_tests(vec![record("x", "up")]);
        assert!(controller.allow(&group, 0));
        assert!(controller.allow(&group, 0));
        assert!(!controller.allow(&group, 0));
        controller.done();
        assert!(controller.allow(&group, 0));
        controller.done();
        controller.done();
    }

    #[test]
    fn test_sequential_controller_never_admits() {
        let controller = SequentialRuleEvalController;
        let group = Group::detached_for_tests(vec![record("x", "up"), record("y", "down")]);
        assert_eq!(
            controller.split_group_into_batches(&group),
            vec![vec![0], vec![1]]
        );
        assert!(!controller.allow(&group, 0));
        controller.done();
    }
}
