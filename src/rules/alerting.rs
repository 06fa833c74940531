use std::fmt::Display;
use std::str::FromStr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::types::{
    Labels, Sample, Timestamp, Vector, ALERT_FOR_STATE_METRIC_NAME, ALERT_GROUP_NAME_LABEL,
    ALERT_METRIC_NAME, ALERT_NAME_LABEL, ALERT_STATE_LABEL, METRIC_NAME_LABEL,
};
use crate::common::{current_time_millis, duration_to_millis, hash_labels_without_metric_name};
use crate::rules::datasource::{QueryFunc, Queryable};
use crate::rules::error::{RulesError, RulesResult};
use crate::rules::notifier::{generator_url, NotificationAlert};
use crate::rules::rule::{normalise_expr, DependencySets, EvalState, EvalStateCell, Rule, RuleType};

/// the duration for which a resolved alert instance is kept in memory state,
/// so a flapping series re-enters pending with its identity preserved
const RESOLVED_RETENTION: Duration = Duration::from_secs(15 * 60);

/// AlertState is the state of an alert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlertState {
    /// neither firing nor pending
    #[default]
    Inactive,
    /// active for less than the configured threshold duration
    Pending,
    /// active for longer than the configured threshold duration
    Firing,
}

impl Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertState::Inactive => "inactive",
            AlertState::Pending => "pending",
            AlertState::Firing => "firing",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for AlertState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(AlertState::Inactive),
            "pending" => Ok(AlertState::Pending),
            "firing" => Ok(AlertState::Firing),
            _ => Err(format!("unknown alert state: {}", s)),
        }
    }
}

/// One alert instance, keyed by its label fingerprint within the rule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Alert {
    pub labels: Labels,
    pub annotations: AHashMap<String, String>,
    pub state: AlertState,
    /// the moment the alert series first appeared in evaluation results
    pub active_at: Timestamp,
    /// the moment the alert started firing
    pub fired_at: Timestamp,
    /// the moment the alert was switched from firing to inactive
    pub resolved_at: Timestamp,
    /// until when an unresolved alert is considered valid by the notifier
    pub valid_until: Timestamp,
    pub last_sent_at: Timestamp,
    /// set while `keep_firing_for` sustains the alert after its series
    /// disappeared from the results
    pub keep_firing_since: Timestamp,
    pub value: f64,
    /// true if the alert's for-state was recovered from storage
    pub restored: bool,
}

/// AlertingRule evaluates a configured expression and manages one alert
/// instance per distinct label set in the result.
#[derive(Debug)]
pub struct AlertingRule {
    name: String,
    expr: String,
    r#for: Duration,
    keep_firing_for: Duration,
    labels: Labels,
    annotations: AHashMap<String, String>,
    group_name: String,
    /// active alerts, keyed by label fingerprint
    active: RwLock<AHashMap<u64, Alert>>,
    state: EvalStateCell,
    pub(crate) deps: DependencySets,
}

impl AlertingRule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        expr: impl Into<String>,
        r#for: Duration,
        keep_firing_for: Duration,
        labels: Labels,
        annotations: AHashMap<String, String>,
        group_name: impl Into<String>,
    ) -> Self {
        AlertingRule {
            name: name.into(),
            expr: expr.into(),
            r#for,
            keep_firing_for,
            labels,
            annotations,
            group_name: group_name.into(),
            active: RwLock::new(AHashMap::new()),
            state: EvalStateCell::default(),
            deps: DependencySets::default(),
        }
    }

    pub fn r#for(&self) -> Duration {
        self.r#for
    }

    pub fn keep_firing_for(&self) -> Duration {
        self.keep_firing_for
    }

    pub fn annotations(&self) -> &AHashMap<String, String> {
        &self.annotations
    }

    pub fn equals(&self, other: &AlertingRule) -> bool {
        self.name == other.name
            && normalise_expr(&self.expr) == normalise_expr(&other.expr)
            && self.r#for == other.r#for
            && self.keep_firing_for == other.keep_firing_for
            && self.labels == other.labels
            && self.annotations == other.annotations
    }

    /// Snapshot of the rule's current alerts, for external readers.
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.active.read().unwrap().values().cloned().collect()
    }

    fn count_in_state(&self, state: AlertState) -> usize {
        self.active
            .read()
            .unwrap()
            .values()
            .filter(|a| a.state == state)
            .count()
    }

    pub fn count_firing_alerts(&self) -> usize {
        self.count_in_state(AlertState::Firing)
    }

    pub fn count_pending_alerts(&self) -> usize {
        self.count_in_state(AlertState::Pending)
    }

    /// Transfers active alerts from an old instance of the rule during hot
    /// reload, after the old group drained and before the new one starts.
    pub(crate) fn copy_state_from(&self, other: &AlertingRule) {
        let mut active = self.active.write().unwrap();
        *active = other.active.read().unwrap().clone();
        drop(active);
        self.state.copy_from(&other.state);
    }

    /// labels attached to an alert instance: result labels with the rule's
    /// labels applied on top, then the reserved identity labels, which
    /// nothing may override
    fn alert_labels(&self, sample_labels: &Labels) -> Labels {
        let mut labels = sample_labels.clone();
        labels.del(METRIC_NAME_LABEL);
        for l in self.labels.iter() {
            labels.set(&l.name, &l.value);
        }
        labels.set(ALERT_NAME_LABEL, &self.name);
        labels.set(ALERT_GROUP_NAME_LABEL, &self.group_name);
        labels
    }

    /// Runs the alert state machine against one evaluation result and
    /// returns the synthetic `ALERTS`/`ALERTS_FOR_STATE` series to persist.
    fn update_active(
        &self,
        eval_time: Timestamp,
        vector: &Vector,
        limit: usize,
    ) -> RulesResult<Vector> {
        let for_ms = duration_to_millis(self.r#for);
        let kff_ms = duration_to_millis(self.keep_firing_for);
        let retention_ms = duration_to_millis(RESOLVED_RETENTION);

        let mut active = self.active.write().unwrap();

        // resolved alerts past retention lose their identity
        active.retain(|_, a| {
            a.state != AlertState::Inactive || eval_time - a.resolved_at <= retention_ms
        });

        let mut seen = AHashSet::with_capacity(vector.len());
        for sample in vector {
            let labels = self.alert_labels(&sample.labels);
            let fp = hash_labels_without_metric_name(&labels);
            if !seen.insert(fp) {
                return Err(RulesError::DuplicateSeries(format!(
                    "alert {:?}: result contains series with the same labelset {} after applying alert labels",
                    self.name, labels
                )));
            }
            match active.get_mut(&fp) {
                Some(alert) => {
                    if alert.state == AlertState::Inactive {
                        // the series came back within the retention window
                        alert.state = AlertState::Pending;
                        alert.active_at = eval_time;
                        alert.fired_at = 0;
                        alert.resolved_at = 0;
                    }
                    alert.value = sample.value;
                    alert.keep_firing_since = 0;
                }
                None => {
                    active.insert(
                        fp,
                        Alert {
                            labels,
                            annotations: self.annotations.clone(),
                            state: AlertState::Pending,
                            active_at: eval_time,
                            value: sample.value,
                            ..Default::default()
                        },
                    );
                }
            }
        }

        let mut to_delete: Vec<u64> = Vec::new();
        for (fp, alert) in active.iter_mut() {
            if seen.contains(fp) {
                if alert.state == AlertState::Pending && eval_time - alert.active_at >= for_ms {
                    alert.state = AlertState::Firing;
                    alert.fired_at = alert.active_at;
                    debug!(alert = %self.name, labels = %alert.labels, "PENDING => FIRING");
                }
                continue;
            }
            match alert.state {
                // a pending alert whose series disappeared is dropped outright
                AlertState::Pending => to_delete.push(*fp),
                AlertState::Firing => {
                    if kff_ms > 0 {
                        if alert.keep_firing_since == 0 {
                            alert.keep_firing_since = eval_time;
                        }
                        if eval_time - alert.keep_firing_since >= kff_ms {
                            alert.state = AlertState::Inactive;
                            alert.resolved_at = eval_time;
                            debug!(alert = %self.name, labels = %alert.labels, "FIRING => INACTIVE");
                        }
                    } else {
                        alert.state = AlertState::Inactive;
                        alert.resolved_at = eval_time;
                        debug!(alert = %self.name, labels = %alert.labels, "FIRING => INACTIVE");
                    }
                }
                AlertState::Inactive => {}
            }
        }
        for fp in to_delete {
            active.remove(&fp);
        }

        let num_active = active
            .values()
            .filter(|a| a.state != AlertState::Inactive)
            .count();
        if limit > 0 && num_active > limit {
            active.clear();
            return Err(RulesError::SeriesLimitExceeded {
                limit,
                actual: num_active,
            });
        }

        let mut out = Vector::with_capacity(num_active * 2);
        for alert in active.values().filter(|a| a.state != AlertState::Inactive) {
            let mut labels = alert.labels.clone();
            labels.set(METRIC_NAME_LABEL, ALERT_METRIC_NAME);
            labels.set(ALERT_STATE_LABEL, &alert.state.to_string());
            out.push(Sample {
                labels,
                timestamp: eval_time,
                value: 1.0,
            });

            let mut labels = alert.labels.clone();
            labels.set(METRIC_NAME_LABEL, ALERT_FOR_STATE_METRIC_NAME);
            out.push(Sample {
                labels,
                timestamp: eval_time,
                // the for-state value is the activation time in unix seconds
                value: (alert.active_at / 1000) as f64,
            });
        }
        Ok(out)
    }

    /// Walks the current alerts and returns those due for (re)notification,
    /// marking them sent. Resolution is notified exactly once; firing alerts
    /// are re-sent no more often than `resend_delay`.
    pub(crate) fn alerts_to_send(
        &self,
        ts: Timestamp,
        resolve_duration: Duration,
        resend_delay: Duration,
        external_url: &str,
    ) -> Vec<NotificationAlert> {
        let resend_ms = duration_to_millis(resend_delay);
        let kff_ms = duration_to_millis(self.keep_firing_for);
        let needs_sending = |a: &Alert| match a.state {
            AlertState::Pending => false,
            AlertState::Inactive => a.resolved_at > a.last_sent_at,
            AlertState::Firing => a.last_sent_at == 0 || ts - a.last_sent_at >= resend_ms,
        };

        let mut out = Vec::new();
        let mut active = self.active.write().unwrap();
        for alert in active.values_mut() {
            if !needs_sending(alert) {
                continue;
            }
            alert.valid_until = ts + duration_to_millis(resolve_duration);
            let ends_at = if alert.resolved_at > 0 {
                alert.resolved_at
            } else if alert.keep_firing_since > 0 {
                alert.keep_firing_since + kff_ms
            } else {
                alert.valid_until
            };
            out.push(NotificationAlert {
                labels: alert.labels.clone(),
                annotations: alert.annotations.clone(),
                starts_at: alert.fired_at,
                ends_at,
                generator_url: generator_url(external_url, &self.expr),
            });
            alert.last_sent_at = ts;
        }
        out
    }

    /// Recovers the activation time of pending alerts from the previously
    /// written `ALERTS_FOR_STATE` series. Only rules with `for > 0` restore.
    /// Alerts whose series went silent for longer than `outage_tolerance`
    /// start over; restored alerts may not fire before `for_grace_period`
    /// has passed since the restart.
    pub(crate) async fn restore_for_state(
        &self,
        ts: Timestamp,
        queryable: &dyn Queryable,
        outage_tolerance: Duration,
        for_grace_period: Duration,
    ) -> RulesResult<()> {
        if self.r#for.is_zero() {
            return Ok(());
        }

        let pending: Vec<(u64, Labels)> = {
            let active = self.active.read().unwrap();
            active
                .iter()
                .filter(|(_, a)| !a.restored && a.state == AlertState::Pending)
                .map(|(fp, a)| (*fp, a.labels.clone()))
                .collect()
        };

        for (fp, labels) in pending {
            let mut matchers = labels.clone();
            matchers.set(METRIC_NAME_LABEL, ALERT_FOR_STATE_METRIC_NAME);
            let series = queryable
                .select(&matchers)
                .await
                .map_err(|err| RulesError::RuleRestore(format!("{}: {}", self.expr, err)))?;

            // take the newest sample across the matched series
            let newest = series
                .iter()
                .filter_map(|s| match (s.timestamps.last(), s.values.last()) {
                    (Some(t), Some(v)) => Some((*t, *v)),
                    _ => None,
                })
                .max_by_key(|(t, _)| *t);
            let Some((last_ts, stored)) = newest else {
                debug!(alert = %self.name, "no stored for-state found");
                continue;
            };

            if ts - last_ts > duration_to_millis(outage_tolerance) {
                debug!(alert = %self.name, "outage longer than tolerance, skipping restore");
                continue;
            }

            let hold = duration_to_millis(self.r#for);
            let grace = duration_to_millis(for_grace_period);
            let mut restored_active_at = (stored as i64) * 1000;
            if restored_active_at + hold < ts + grace {
                // a restored alert may not fire before the grace period ends
                restored_active_at = ts + grace - hold;
            }

            let mut active = self.active.write().unwrap();
            if let Some(alert) = active.get_mut(&fp) {
                alert.active_at = restored_active_at;
                alert.restored = true;
                info!(alert = %self.name, labels = %alert.labels, active_at = alert.active_at,
                    "restored alert state");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Rule for AlertingRule {
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
        RuleType::Alerting
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

        match self.update_active(eval_time, &vector, limit) {
            Ok(out) => {
                self.state.note_ok(started, clock.elapsed(), out.len());
                Ok(out)
            }
            Err(err) => {
                warn!(alert = %self.name, "evaluation failed: {}", err);
                self.state.note_err(started, clock.elapsed(), err.clone());
                Err(err)
            }
        }
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
