use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::common::types::Labels;
use crate::rules::alerting::AlertingRule;
use crate::rules::concurrency::{
    ConcurrentRuleEvalController, DefaultRuleDependencyController, RuleConcurrencyController,
    RuleDependencyController, SequentialRuleEvalController,
};
use crate::rules::config::{FileLoader, GroupConfig, GroupLoader, RuleConfig};
use crate::rules::datasource::{Appendable, QueryFunc, Queryable};
use crate::rules::error::{RulesError, RulesResult};
use crate::rules::group::{
    default_eval_iteration_func, group_key, Group, GroupEvalIterationFunc, GroupOptions,
};
use crate::rules::metrics;
use crate::rules::notifier::NotifyFunc;
use crate::rules::recording::RecordingRule;
use crate::rules::rule::{GroupRule, Rule, RuleType};

/// Options for the rule manager. The controllers and the loader are
/// defaulted when not set.
pub struct ManagerOptions {
    /// base URL stamped on outgoing alerts
    pub external_url: String,
    pub query_func: QueryFunc,
    pub notify_func: NotifyFunc,
    pub appendable: Arc<dyn Appendable>,
    pub queryable: Arc<dyn Queryable>,
    /// the maximum silence of a stored for-state before restoration gives up
    pub outage_tolerance: Duration,
    /// the minimum wait before a restored alert may fire
    pub for_grace_period: Duration,
    /// the minimum interval between notifications for a still-firing alert
    pub resend_delay: Duration,
    /// returns the duration subtracted from the evaluation timestamp before
    /// querying, for groups without their own query_offset
    pub default_rule_query_offset: Option<Arc<dyn Fn() -> Duration + Send + Sync>>,
    pub max_concurrent_evals: usize,
    pub concurrent_evals_enabled: bool,
    pub group_loader: Option<Arc<dyn GroupLoader>>,
    pub rule_concurrency_controller: Option<Arc<dyn RuleConcurrencyController>>,
    pub rule_dependency_controller: Option<Arc<dyn RuleDependencyController>>,
}

/// The resolved, shared dependencies every group evaluates against.
pub(crate) struct ManagerContext {
    pub query_func: QueryFunc,
    pub notify_func: NotifyFunc,
    pub appendable: Arc<dyn Appendable>,
    pub queryable: Arc<dyn Queryable>,
    pub outage_tolerance: Duration,
    pub for_grace_period: Duration,
    pub resend_delay: Duration,
    pub default_rule_query_offset: Option<Arc<dyn Fn() -> Duration + Send + Sync>>,
    pub concurrency_controller: Arc<dyn RuleConcurrencyController>,
    pub dependency_controller: Arc<dyn RuleDependencyController>,
}

/// Manager owns the rule groups and reconciles them against declarative
/// configuration with a drain-and-swap hot reload.
pub struct Manager {
    ctx: Arc<ManagerContext>,
    external_url: String,
    group_loader: Arc<dyn GroupLoader>,
    groups: RwLock<AHashMap<String, Arc<Group>>>,
    /// released once by `run`, holds every group's first tick until then
    block: watch::Sender<bool>,
    done: CancellationToken,
    stopped: AtomicBool,
    /// set by the first successful update; later loads skip alert-state
    /// restoration
    restored: AtomicBool,
}

impl Manager {
    pub fn new(opts: ManagerOptions) -> Manager {
        let concurrency_controller = opts.rule_concurrency_controller.unwrap_or_else(|| {
            if opts.concurrent_evals_enabled && opts.max_concurrent_evals > 0 {
                Arc::new(ConcurrentRuleEvalController::new(opts.max_concurrent_evals))
            } else {
                Arc::new(SequentialRuleEvalController)
            }
        });
        let dependency_controller = opts
            .rule_dependency_controller
            .unwrap_or_else(|| Arc::new(DefaultRuleDependencyController));
        let group_loader = opts.group_loader.unwrap_or_else(|| Arc::new(FileLoader));
        let (block, _) = watch::channel(false);

        Manager {
            ctx: Arc::new(ManagerContext {
                query_func: opts.query_func,
                notify_func: opts.notify_func,
                appendable: opts.appendable,
                queryable: opts.queryable,
                outage_tolerance: opts.outage_tolerance,
                for_grace_period: opts.for_grace_period,
                resend_delay: opts.resend_delay,
                default_rule_query_offset: opts.default_rule_query_offset,
                concurrency_controller,
                dependency_controller,
            }),
            external_url: opts.external_url,
            group_loader,
            groups: RwLock::new(AHashMap::new()),
            block,
            done: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            restored: AtomicBool::new(false),
        }
    }

    /// Releases all groups to begin ticking, then blocks until `stop`.
    pub async fn run(&self) {
        info!("rule manager started");
        self.block.send_replace(true);
        self.done.cancelled().await;
    }

    /// Stops every group and unblocks `run`. Idempotent; after stop,
    /// `update` is rejected.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let groups = self.groups.write().await;
        info!("stopping rule manager...");
        let mut tasks = JoinSet::new();
        for group in groups.values() {
            let group = Arc::clone(group);
            tasks.spawn(async move { group.stop().await });
        }
        while tasks.join_next().await.is_some() {}
        self.done.cancel();
        info!("rule manager stopped");
    }

    /// True once the first successful update completed.
    pub fn restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    /// Hot reload: loads the given files into a fresh group set and swaps it
    /// in. Groups structurally equal to a running one are kept as-is;
    /// changed groups drain the old instance, copy its state and start
    /// fresh; removed groups mark their series stale and go away. On a load
    /// error nothing changes.
    pub async fn update(
        &self,
        interval: Duration,
        files: &[PathBuf],
        external_labels: Labels,
        external_url: &str,
        eval_iteration_func: Option<GroupEvalIterationFunc>,
    ) -> RulesResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RulesError::ManagerStopped);
        }
        let mut groups = self.groups.write().await;

        let loaded = self.load_groups(
            interval,
            files,
            &external_labels,
            external_url,
            eval_iteration_func,
        )?;
        self.restored.store(true, Ordering::SeqCst);

        let mut old = std::mem::take(&mut *groups);
        let mut next = AHashMap::with_capacity(loaded.len());
        let mut tasks = JoinSet::new();
        for (key, new_group) in loaded {
            match old.remove(&key) {
                Some(old_group) if old_group.equals(&new_group) => {
                    // unchanged; the running instance is retained untouched
                    next.insert(key, old_group);
                }
                maybe_old => {
                    let block = self.block.subscribe();
                    let group = Arc::clone(&new_group);
                    tasks.spawn(async move {
                        if let Some(old_group) = maybe_old {
                            old_group.stop().await;
                            group.copy_state(&old_group);
                        }
                        group.start(block);
                    });
                    next.insert(key, new_group);
                }
            }
        }
        for (key, old_group) in old {
            tasks.spawn(async move {
                old_group.set_mark_stale();
                old_group.stop().await;
                metrics::remove_group_metrics(&key);
                info!(group = %key, "removed rule group");
            });
        }
        while tasks.join_next().await.is_some() {}

        *groups = next;
        Ok(())
    }

    fn load_groups(
        &self,
        interval: Duration,
        files: &[PathBuf],
        external_labels: &Labels,
        external_url: &str,
        eval_iteration_func: Option<GroupEvalIterationFunc>,
    ) -> RulesResult<AHashMap<String, Arc<Group>>> {
        let external_url = if external_url.is_empty() {
            self.external_url.clone()
        } else {
            external_url.to_string()
        };
        let should_restore = !self.restored.load(Ordering::SeqCst);

        let mut out = AHashMap::new();
        for path in files {
            let config = self.group_loader.load(path)?;
            let file = path.display().to_string();
            for group_config in config.groups {
                let key = group_key(&file, &group_config.name);
                if out.contains_key(&key) {
                    return Err(RulesError::InvalidConfiguration(format!(
                        "group {:?} loaded more than once from {}",
                        group_config.name, file
                    )));
                }
                let group_interval = group_config.interval.unwrap_or(interval);
                if group_interval.is_zero() {
                    return Err(RulesError::InvalidConfiguration(format!(
                        "group {:?}: evaluation interval must be greater than zero",
                        group_config.name
                    )));
                }
                let rules = group_config
                    .rules
                    .iter()
                    .map(|rule_config| {
                        Arc::new(build_rule(rule_config, &group_config, external_labels))
                    })
                    .collect();
                let group = Group::new(
                    GroupOptions {
                        name: group_config.name.clone(),
                        file: file.clone(),
                        interval: group_interval,
                        query_offset: group_config.query_offset,
                        limit: group_config.limit,
                        rules,
                        should_restore,
                        external_url: external_url.clone(),
                        eval_iteration_func: eval_iteration_func
                            .clone()
                            .unwrap_or_else(default_eval_iteration_func),
                    },
                    Arc::clone(&self.ctx),
                );
                out.insert(key, group);
            }
        }
        Ok(out)
    }

    /// All groups, sorted by (file, name).
    pub async fn rule_groups(&self) -> Vec<Arc<Group>> {
        let groups = self.groups.read().await;
        let mut out: Vec<Arc<Group>> = groups.values().cloned().collect();
        out.sort_by(|a, b| (a.file(), a.name()).cmp(&(b.file(), b.name())));
        out
    }

    /// All rules; with matcher sets given, only rules whose labels contain
    /// at least one of the sets.
    pub async fn rules(&self, matcher_sets: &[Labels]) -> Vec<Arc<GroupRule>> {
        let mut out = Vec::new();
        for group in self.rule_groups().await {
            for rule in group.rules() {
                if matcher_sets.is_empty()
                    || matcher_sets.iter().any(|set| rule.labels().contains_all(set))
                {
                    out.push(Arc::clone(rule));
                }
            }
        }
        out
    }

    pub async fn alerting_rules(&self) -> Vec<Arc<GroupRule>> {
        self.rules(&[])
            .await
            .into_iter()
            .filter(|rule| rule.rule_type() == RuleType::Alerting)
            .collect()
    }
}

/// Builds a rule from its config, merging labels with rule labels over
/// group labels over external labels. Reserved identity labels are applied
/// at evaluation time and cannot be overridden here.
fn build_rule(
    rule_config: &RuleConfig,
    group_config: &GroupConfig,
    external_labels: &Labels,
) -> GroupRule {
    let mut labels = external_labels.clone();
    for (name, value) in &group_config.labels {
        labels.set(name, value);
    }
    for (name, value) in &rule_config.labels {
        labels.set(name, value);
    }
    match rule_config.rule_type() {
        RuleType::Recording => GroupRule::Recording(RecordingRule::new(
            rule_config.name(),
            rule_config.expr.clone(),
            labels,
        )),
        RuleType::Alerting => GroupRule::Alerting(AlertingRule::new(
            rule_config.name(),
            rule_config.expr.clone(),
            rule_config.r#for,
            rule_config.keep_firing_for,
            labels,
            rule_config.annotations.clone(),
            group_config.name.clone(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::{Label, Sample, METRIC_NAME_LABEL};
    use crate::rules::error::RulesResult;
    use crate::rules::fakes::{self, TestAppendable};
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    fn manager_with(appendable: Arc<TestAppendable>) -> Arc<Manager> {
        let query_func = fakes::query_fn_from(|expr, _ts| -> RulesResult<Vec<Sample>> {
            match expr {
                "up" => Ok(vec![Sample {
                    labels: Labels::default(),
                    timestamp: 0,
                    value: 1.0,
                }]),
                "r1 + 1" => Ok(vec![Sample {
                    labels: Labels::default(),
                    timestamp: 0,
                    value: 2.0,
                }]),
                "up == 0" => Ok(vec![Sample {
                    labels: Labels::new(vec![Label::new("instance", "a")]),
                    timestamp: 0,
                    value: 0.0,
                }]),
                _ => Ok(vec![]),
            }
        });
        Arc::new(Manager::new(ManagerOptions {
            external_url: "http://prom:9090".to_string(),
            query_func,
            notify_func: fakes::noop_notify_func(),
            appendable,
            queryable: Arc::new(fakes::TestQueryable::default()),
            outage_tolerance: Duration::from_secs(3600),
            for_grace_period: Duration::from_secs(600),
            resend_delay: Duration::from_secs(60),
            default_rule_query_offset: None,
            max_concurrent_evals: 0,
            concurrent_evals_enabled: false,
            group_loader: None,
            rule_concurrency_controller: None,
            rule_dependency_controller: None,
        }))
    }

    const THREE_GROUPS: &str = r#"
groups:
  - name: one
    rules:
      - record: r1
        expr: up
  - name: two
    rules:
      - record: r2
        expr: r1 + 1
  - name: three
    rules:
      - alert: InstanceDown
        expr: up == 0
        for: 5m
"#;

    #[tokio::test]
    async fn test_update_loads_groups_sorted() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "rules.yml", THREE_GROUPS);
        let manager = manager_with(Arc::new(TestAppendable::default()));

        manager
            .update(Duration::from_secs(10), &[path], Labels::default(), "", None)
            .await
            .unwrap();
        assert!(manager.restored());

        let groups = manager.rule_groups().await;
        assert_eq!(groups.len(), 3);
        let names: Vec<&str> = groups.iter().map(|g| g.name()).collect();
        assert_eq!(names, vec!["one", "three", "two"]);

        assert_eq!(manager.rules(&[]).await.len(), 3);
        assert_eq!(manager.alerting_rules().await.len(), 1);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_update_error_keeps_previous_set() {
        let dir = TempDir::new().unwrap();
        let good = write_file(&dir, "rules.yml", THREE_GROUPS);
        let bad = write_file(&dir, "bad.yml", "groups: [{rules: []}]");
        let manager = manager_with(Arc::new(TestAppendable::default()));

        manager
            .update(Duration::from_secs(10), &[good.clone()], Labels::default(), "", None)
            .await
            .unwrap();
        let before = manager.rule_groups().await;

        let err = manager
            .update(Duration::from_secs(10), &[bad], Labels::default(), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RulesError::InvalidConfiguration(_)));

        let after = manager.rule_groups().await;
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reload_keeps_identical_groups() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "rules.yml", THREE_GROUPS);
        let manager = manager_with(Arc::new(TestAppendable::default()));

        manager
            .update(Duration::from_secs(10), &[path.clone()], Labels::default(), "", None)
            .await
            .unwrap();
        let before = manager.rule_groups().await;

        manager
            .update(Duration::from_secs(10), &[path], Labels::default(), "", None)
            .await
            .unwrap();
        let after = manager.rule_groups().await;

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert!(Arc::ptr_eq(a, b), "group {} was replaced", a.name());
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reload_copies_state_into_changed_group() {
        let dir = TempDir::new().unwrap();
        let v1 = r#"
groups:
  - name: alerts
    rules:
      - alert: InstanceDown
        expr: up == 0
        for: 5m
"#;
        // same group key, one more rule: structurally different
        let v2 = r#"
groups:
  - name: alerts
    rules:
      - alert: InstanceDown
        expr: up == 0
        for: 5m
      - record: r1
        expr: up
"#;
        let path = write_file(&dir, "rules.yml", v1);
        let manager = manager_with(Arc::new(TestAppendable::default()));
        manager
            .update(Duration::from_secs(10), &[path.clone()], Labels::default(), "", None)
            .await
            .unwrap();

        // drive one evaluation by hand so the alert becomes pending
        let old = manager.rule_groups().await.remove(0);
        old.eval(10_000).await;
        let old_alerts = old.rules()[0].as_alerting().unwrap().active_alerts();
        assert_eq!(old_alerts.len(), 1);

        write_file(&dir, "rules.yml", v2);
        manager
            .update(Duration::from_secs(10), &[path], Labels::default(), "", None)
            .await
            .unwrap();

        let new = manager.rule_groups().await.remove(0);
        assert!(!Arc::ptr_eq(&old, &new));
        let new_alerts = new.rules()[0].as_alerting().unwrap().active_alerts();
        assert_eq!(new_alerts, old_alerts);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_reload_drops_removed_groups() {
        let dir = TempDir::new().unwrap();
        let both = write_file(&dir, "rules.yml", THREE_GROUPS);
        let manager = manager_with(Arc::new(TestAppendable::default()));
        manager
            .update(Duration::from_secs(10), &[both.clone()], Labels::default(), "", None)
            .await
            .unwrap();
        assert_eq!(manager.rule_groups().await.len(), 3);

        let only_one = r#"
groups:
  - name: one
    rules:
      - record: r1
        expr: up
"#;
        write_file(&dir, "rules.yml", only_one);
        manager
            .update(Duration::from_secs(10), &[both], Labels::default(), "", None)
            .await
            .unwrap();
        let groups = manager.rule_groups().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name(), "one");
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_update_rejected_after_stop() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "rules.yml", THREE_GROUPS);
        let manager = manager_with(Arc::new(TestAppendable::default()));
        manager.stop().await;
        let err = manager
            .update(Duration::from_secs(10), &[path], Labels::default(), "", None)
            .await
            .unwrap_err();
        assert_eq!(err, RulesError::ManagerStopped);
    }

    #[tokio::test]
    async fn test_external_and_group_labels_merge_in_priority_order() {
        let dir = TempDir::new().unwrap();
        let content = r#"
groups:
  - name: g
    labels:
      env: group
      team: infra
    rules:
      - alert: A
        expr: up == 0
        labels:
          env: rule
"#;
        let path = write_file(&dir, "rules.yml", content);
        let manager = manager_with(Arc::new(TestAppendable::default()));
        let external = Labels::new(vec![
            Label::new("env", "external"),
            Label::new("region", "eu"),
        ]);
        manager
            .update(Duration::from_secs(10), &[path], external, "", None)
            .await
            .unwrap();

        let rules = manager.rules(&[]).await;
        let labels = rules[0].labels().clone();
        assert_eq!(labels.get("env"), "rule");
        assert_eq!(labels.get("team"), "infra");
        assert_eq!(labels.get("region"), "eu");

        // matcher filtering
        let matched = manager
            .rules(&[Labels::new(vec![Label::new("team", "infra")])])
            .await;
        assert_eq!(matched.len(), 1);
        let unmatched = manager
            .rules(&[Labels::new(vec![Label::new("team", "web")])])
            .await;
        assert!(unmatched.is_empty());
        manager.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_evaluates_groups_end_to_end() {
        let dir = TempDir::new().unwrap();
        let content = r#"
groups:
  - name: fast
    interval: 25ms
    rules:
      - record: r1
        expr: up
      - record: r2
        expr: r1 + 1
"#;
        let path = write_file(&dir, "rules.yml", content);
        let appendable = Arc::new(TestAppendable::default());
        let manager = manager_with(appendable.clone());
        manager
            .update(Duration::from_secs(10), &[path], Labels::default(), "", None)
            .await
            .unwrap();

        // nothing runs before the gate opens
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(appendable.collected().is_empty());

        let runner = Arc::clone(&manager);
        let run_task = tokio::spawn(async move { runner.run().await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        manager.stop().await;
        run_task.await.unwrap();

        let samples = appendable.collected();
        assert!(!samples.is_empty());
        let r1: Vec<&Sample> = samples
            .iter()
            .filter(|s| s.labels.get(METRIC_NAME_LABEL) == "r1")
            .collect();
        let r2: Vec<&Sample> = samples
            .iter()
            .filter(|s| s.labels.get(METRIC_NAME_LABEL) == "r2")
            .collect();
        assert!(!r1.is_empty());
        assert!(!r2.is_empty());
        assert!(r1.iter().all(|s| s.value == 1.0));
        assert!(r2.iter().all(|s| s.value == 2.0));

        // a second stop is a no-op
        manager.stop().await;
    }
}
