use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::types::{Labels, Timestamp};
use crate::common::{current_time_millis, duration_to_millis, hash_labels, stable_hash};
use crate::common::types::stale_nan;
use crate::rules::manager::ManagerContext;
use crate::rules::metrics;
use crate::rules::rule::{GroupRule, Rule};

/// Joins a group's file and name into the stable key used for maps and
/// metric labels.
pub fn group_key(file: &str, name: &str) -> String {
    format!("{};{}", file, name)
}

/// Returns one admission slot to the controller when dropped.
struct AdmissionSlot(Arc<dyn crate::rules::concurrency::RuleConcurrencyController>);

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// One iteration of a group, pluggable for tests and embedders. The default
/// implementation evaluates the group and updates its timing state.
pub type GroupEvalIterationFunc =
    Arc<dyn Fn(Arc<Group>, Timestamp) -> BoxFuture<'static, ()> + Send + Sync>;

pub fn default_eval_iteration_func() -> GroupEvalIterationFunc {
    Arc::new(|group: Arc<Group>, eval_ts: Timestamp| {
        Box::pin(async move {
            metrics::ITERATIONS_SCHEDULED
                .with_label_values(&[&group.key()])
                .inc();
            let clock = Instant::now();
            group.eval(eval_ts).await;
            group.note_iteration(eval_ts, clock.elapsed());
        })
    })
}

pub(crate) struct GroupOptions {
    pub name: String,
    pub file: String,
    pub interval: Duration,
    pub query_offset: Option<Duration>,
    pub limit: usize,
    pub rules: Vec<Arc<GroupRule>>,
    pub should_restore: bool,
    pub external_url: String,
    pub eval_iteration_func: GroupEvalIterationFunc,
}

#[derive(Default)]
struct GroupState {
    /// scheduled timestamp of the last evaluation
    last_eval_timestamp: Timestamp,
    /// wall time at which the last iteration finished
    last_evaluation: Timestamp,
    last_duration: Duration,
    /// cumulative sum of per-rule evaluation durations
    rule_eval_time_sum: Duration,
    /// series produced by the previous iteration, fingerprint to labels
    seen_series: AHashMap<u64, Labels>,
}

/// Group is a set of rules that are evaluated together on a fixed interval,
/// at a phase derived from the group's identity.
pub struct Group {
    name: String,
    file: String,
    interval: Duration,
    query_offset: Option<Duration>,
    limit: usize,
    rules: Vec<Arc<GroupRule>>,
    external_url: String,
    should_restore: AtomicBool,
    mark_stale: AtomicBool,
    state: Mutex<GroupState>,
    ctx: Arc<ManagerContext>,
    eval_iteration_func: GroupEvalIterationFunc,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Group {
    pub(crate) fn new(opts: GroupOptions, ctx: Arc<ManagerContext>) -> Arc<Group> {
        ctx.dependency_controller.analyse_rules(&opts.rules);

        let group = Arc::new(Group {
            name: opts.name,
            file: opts.file,
            interval: opts.interval,
            query_offset: opts.query_offset,
            limit: opts.limit,
            rules: opts.rules,
            external_url: opts.external_url,
            should_restore: AtomicBool::new(opts.should_restore),
            mark_stale: AtomicBool::new(false),
            state: Mutex::new(GroupState::default()),
            ctx,
            eval_iteration_func: opts.eval_iteration_func,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });

        let key = group.key();
        metrics::GROUP_INTERVAL
            .with_label_values(&[&key])
            .set(group.interval.as_secs_f64());
        metrics::GROUP_RULES
            .with_label_values(&[&key])
            .set(group.rules.len() as i64);
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn key(&self) -> String {
        group_key(&self.file, &self.name)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn query_offset(&self) -> Option<Duration> {
        self.query_offset
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn rules(&self) -> &[Arc<GroupRule>] {
        &self.rules
    }

    /// scheduled timestamp of the last completed iteration
    pub fn last_eval_timestamp(&self) -> Timestamp {
        self.state.lock().unwrap().last_eval_timestamp
    }

    /// wall time at which the last iteration finished
    pub fn last_evaluation(&self) -> Timestamp {
        self.state.lock().unwrap().last_evaluation
    }

    pub fn last_duration(&self) -> Duration {
        self.state.lock().unwrap().last_duration
    }

    /// True iff the other group would evaluate the same rules the same way:
    /// identity, pacing and an element-wise equal rule list.
    pub fn equals(&self, other: &Group) -> bool {
        self.name == other.name
            && self.file == other.file
            && self.interval == other.interval
            && self.query_offset == other.query_offset
            && self.limit == other.limit
            && self.rules.len() == other.rules.len()
            && self
                .rules
                .iter()
                .zip(other.rules.iter())
                .all(|(a, b)| a.equals(b))
    }

    pub(crate) fn set_mark_stale(&self) {
        self.mark_stale.store(true, Ordering::Relaxed);
    }

    /// The group's deterministic phase within its interval, derived from a
    /// stable hash of (file, name). Spreads groups sharing an interval
    /// without randomness.
    fn phase_offset_millis(&self) -> i64 {
        let interval_ms = duration_to_millis(self.interval).max(1);
        (stable_hash(&[&self.file, &self.name]) % interval_ms as u64) as i64
    }

    fn effective_query_offset(&self) -> Duration {
        if let Some(offset) = self.query_offset {
            return offset;
        }
        match &self.ctx.default_rule_query_offset {
            Some(f) => f(),
            None => Duration::ZERO,
        }
    }

    /// the duration after which a firing alert stops being valid unless
    /// re-sent
    fn resolve_duration(&self) -> Duration {
        self.interval.max(self.ctx.resend_delay) * 4
    }

    /// Spawns the group's scheduler task. Ticking begins once the manager
    /// releases the `block` gate.
    pub(crate) fn start(self: &Arc<Self>, block: watch::Receiver<bool>) {
        let group = Arc::clone(self);
        let handle = tokio::spawn(async move { group.run(block).await });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Signals termination and waits for the in-flight iteration to finish.
    /// After stop no further ticks occur.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>, mut block: watch::Receiver<bool>) {
        // hold every group until the manager enters its run loop, so no rule
        // queries a still-bootstrapping backend
        loop {
            if *block.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = block.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        info!(group = %self.key(), "started rule group");
        let interval_ms = duration_to_millis(self.interval).max(1);
        let offset_ms = self.phase_offset_millis();
        let now = current_time_millis();
        let mut next = now - now.rem_euclid(interval_ms) + offset_ms;
        while next <= now {
            next += interval_ms;
        }

        loop {
            let wait = (next - current_time_millis()).max(0) as u64;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
            }

            let eval_ts = next;
            let iteration = (self.eval_iteration_func)(Arc::clone(&self), eval_ts);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = iteration => {}
            }

            // restore the alert state after the first evaluation, so only
            // active alerts are restored
            if self.should_restore.swap(false, Ordering::Relaxed) {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.restore_for_state(eval_ts) => {}
                }
            }

            // an iteration that overran its interval skips the missed ticks
            let now = current_time_millis();
            next += interval_ms;
            if next <= now {
                let missed = (now - next) / interval_ms + 1;
                metrics::ITERATIONS_MISSED
                    .with_label_values(&[&self.key()])
                    .inc_by(missed as u64);
                next += missed * interval_ms;
            }
        }

        if self.mark_stale.load(Ordering::Relaxed) {
            self.write_all_stale().await;
        }
        info!(group = %self.key(), "stopped rule group");
    }

    /// Evaluates all rules of the group at the given timestamp: obtains the
    /// batch plan, dispatches admitted rules as parallel tasks and the rest
    /// inline, waits per batch, then emits staleness markers for series that
    /// disappeared since the previous iteration.
    pub async fn eval(self: &Arc<Self>, eval_ts: Timestamp) {
        let batches = self.ctx.concurrency_controller.split_group_into_batches(self);
        let produced: Arc<Mutex<AHashMap<u64, Labels>>> = Arc::new(Mutex::new(AHashMap::new()));

        for batch in batches {
            let mut tasks = JoinSet::new();
            for index in batch {
                if self.ctx.concurrency_controller.allow(self, index) {
                    let group = Arc::clone(self);
                    let produced = Arc::clone(&produced);
                    tasks.spawn(async move {
                        // the slot is released even when cancellation aborts
                        // the task mid-evaluation
                        let _slot = AdmissionSlot(Arc::clone(&group.ctx.concurrency_controller));
                        group.eval_one(index, eval_ts, &produced).await;
                    });
                } else {
                    self.eval_one(index, eval_ts, &produced).await;
                }
            }
            while tasks.join_next().await.is_some() {}
        }

        self.cleanup_stale_series(eval_ts, &produced).await;
    }

    /// Evaluates one rule and persists its output. A failure is recorded and
    /// never aborts the iteration.
    async fn eval_one(&self, index: usize, eval_ts: Timestamp, produced: &Mutex<AHashMap<u64, Labels>>) {
        let rule = &self.rules[index];
        let key = self.key();
        metrics::EVALUATIONS.with_label_values(&[&key]).inc();

        let vector = match rule
            .eval(
                eval_ts,
                self.effective_query_offset(),
                &self.ctx.query_func,
                &self.external_url,
                self.limit,
            )
            .await
        {
            Ok(vector) => vector,
            Err(err) => {
                metrics::EVALUATION_FAILURES
                    .with_label_values(&[&key])
                    .inc();
                warn!(group = %key, rule = rule.name(), "rule evaluation failed: {}", err);
                return;
            }
        };

        {
            let mut produced = produced.lock().unwrap();
            for sample in &vector {
                produced.insert(hash_labels(&sample.labels), sample.labels.clone());
            }
        }

        let mut appender = self.ctx.appendable.appender();
        let mut append_failed = false;
        for sample in &vector {
            if let Err(err) = appender
                .append(sample.labels.clone(), sample.timestamp, sample.value)
                .await
            {
                metrics::EVALUATION_FAILURES
                    .with_label_values(&[&key])
                    .inc();
                warn!(group = %key, rule = rule.name(), "failed to append series: {}", err);
                append_failed = true;
                break;
            }
        }
        if !append_failed {
            if let Err(err) = appender.commit().await {
                warn!(group = %key, rule = rule.name(), "failed to commit samples: {}", err);
            }
        }

        if let Some(alerting) = rule.as_alerting() {
            let alerts = alerting.alerts_to_send(
                eval_ts,
                self.resolve_duration(),
                self.ctx.resend_delay,
                &self.external_url,
            );
            if !alerts.is_empty() {
                (self.ctx.notify_func)(alerting.query().to_string(), alerts).await;
            }
        }
    }

    /// Appends staleness markers for every series produced by the previous
    /// iteration but absent from this one. Runs after all batches completed.
    async fn cleanup_stale_series(&self, eval_ts: Timestamp, produced: &Mutex<AHashMap<u64, Labels>>) {
        let current = std::mem::take(&mut *produced.lock().unwrap());
        let stale: Vec<Labels> = {
            let mut state = self.state.lock().unwrap();
            let previous = std::mem::replace(&mut state.seen_series, current);
            previous
                .into_iter()
                .filter(|(fp, _)| !state.seen_series.contains_key(fp))
                .map(|(_, labels)| labels)
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        debug!(group = %self.key(), count = stale.len(), "marking disappeared series stale");
        self.append_stale_markers(stale, eval_ts).await;
    }

    /// Marks every series the group is still tracking as stale; used when a
    /// reload removed the group.
    async fn write_all_stale(&self) {
        let (series, ts) = {
            let mut state = self.state.lock().unwrap();
            let ts = if state.last_eval_timestamp > 0 {
                state.last_eval_timestamp + duration_to_millis(self.interval)
            } else {
                current_time_millis()
            };
            let series: Vec<Labels> = state.seen_series.drain().map(|(_, l)| l).collect();
            (series, ts)
        };
        if series.is_empty() {
            return;
        }
        self.append_stale_markers(series, ts).await;
    }

    async fn append_stale_markers(&self, series: Vec<Labels>, ts: Timestamp) {
        let mut appender = self.ctx.appendable.appender();
        for labels in series {
            if let Err(err) = appender.append(labels, ts, stale_nan()).await {
                warn!(group = %self.key(), "failed to append staleness marker: {}", err);
                return;
            }
        }
        if let Err(err) = appender.commit().await {
            warn!(group = %self.key(), "failed to commit staleness markers: {}", err);
        }
    }

    async fn restore_for_state(&self, ts: Timestamp) {
        for rule in &self.rules {
            if let Some(alerting) = rule.as_alerting() {
                if let Err(err) = alerting
                    .restore_for_state(
                        ts,
                        self.ctx.queryable.as_ref(),
                        self.ctx.outage_tolerance,
                        self.ctx.for_grace_period,
                    )
                    .await
                {
                    warn!(group = %self.key(), rule = alerting.name(),
                        "error while restoring alert state: {}", err);
                }
            }
        }
    }

    /// Records the outcome of one iteration. Invoked by the evaluation
    /// iteration function after [`Group::eval`] returns.
    pub fn note_iteration(&self, eval_ts: Timestamp, duration: Duration) {
        let key = self.key();
        let rule_time: Duration = self
            .rules
            .iter()
            .map(|r| r.eval_state().last_duration)
            .sum();
        let samples: usize = self.rules.iter().map(|r| r.eval_state().last_samples).sum();

        let mut state = self.state.lock().unwrap();
        state.last_eval_timestamp = eval_ts;
        state.last_evaluation = current_time_millis();
        state.last_duration = duration;
        state.rule_eval_time_sum += rule_time;
        drop(state);

        metrics::ITERATION_DURATION
            .with_label_values(&[&key])
            .observe(duration.as_secs_f64());
        metrics::GROUP_LAST_DURATION
            .with_label_values(&[&key])
            .set(duration.as_secs_f64());
        metrics::GROUP_LAST_EVAL_TIME
            .with_label_values(&[&key])
            .set(eval_ts as f64 / 1000.0);
        metrics::GROUP_LAST_SAMPLES
            .with_label_values(&[&key])
            .set(samples as i64);
    }

    /// Transfers runtime state from an old instance of the group during hot
    /// reload: staleness tracking, iteration timing and per-rule alert
    /// state. Called after the old instance drained and before this one's
    /// first tick.
    pub(crate) fn copy_state(&self, old: &Group) {
        {
            let old_state = old.state.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            state.last_eval_timestamp = old_state.last_eval_timestamp;
            state.last_evaluation = old_state.last_evaluation;
            state.last_duration = old_state.last_duration;
            state.rule_eval_time_sum = old_state.rule_eval_time_sum;
            state.seen_series = old_state.seen_series.clone();
        }

        let mut used = vec![false; old.rules.len()];
        for rule in &self.rules {
            let matched = old.rules.iter().enumerate().find(|(i, old_rule)| {
                !used[*i]
                    && old_rule.rule_type() == rule.rule_type()
                    && old_rule.name() == rule.name()
                    && old_rule.labels() == rule.labels()
            });
            let Some((i, old_rule)) = matched else {
                continue;
            };
            used[i] = true;
            match (rule.as_ref(), old_rule.as_ref()) {
                (GroupRule::Alerting(new_rule), GroupRule::Alerting(old_rule)) => {
                    new_rule.copy_state_from(old_rule);
                }
                (GroupRule::Recording(new_rule), GroupRule::Recording(old_rule)) => {
                    new_rule.state.copy_from(&old_rule.state);
                }
                _ => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(rules: Vec<Arc<GroupRule>>) -> Arc<Group> {
        Group::new(
            GroupOptions {
                name: "test".to_string(),
                file: "test.yml".to_string(),
                interval: Duration::from_secs(10),
                query_offset: None,
                limit: 0,
                rules,
                should_restore: false,
                external_url: String::new(),
                eval_iteration_func: default_eval_iteration_func(),
            },
            crate::rules::fakes::manager_context(),
        )
    }
}
