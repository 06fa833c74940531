//! In-process fakes for the external seams, test support only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::common::types::{Labels, Sample, TimeSeries, Timestamp, Vector};
use crate::rules::concurrency::{DefaultRuleDependencyController, SequentialRuleEvalController};
use crate::rules::datasource::{Appendable, Appender, QueryFunc, Queryable};
use crate::rules::error::RulesResult;
use crate::rules::manager::ManagerContext;
use crate::rules::notifier::{NotificationAlert, NotifyFunc};

/// Collects appended samples; an appender buffers until commit.
#[derive(Default)]
pub(crate) struct TestAppendable {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl TestAppendable {
    pub fn collected(&self) -> Vec<Sample> {
        self.samples.lock().unwrap().clone()
    }
}

struct TestAppender {
    buffer: Vec<Sample>,
    sink: Arc<Mutex<Vec<Sample>>>,
}

impl Appendable for TestAppendable {
    fn appender(&self) -> Box<dyn Appender> {
        Box::new(TestAppender {
            buffer: Vec::new(),
            sink: Arc::clone(&self.samples),
        })
    }
}

#[async_trait]
impl Appender for TestAppender {
    async fn append(&mut self, labels: Labels, ts: Timestamp, value: f64) -> RulesResult<()> {
        self.buffer.push(Sample {
            labels,
            timestamp: ts,
            value,
        });
        Ok(())
    }

    async fn commit(&mut self) -> RulesResult<()> {
        self.sink.lock().unwrap().append(&mut self.buffer);
        Ok(())
    }
}

/// Serves stored series to for-state restoration.
#[derive(Default)]
pub(crate) struct TestQueryable {
    pub series: Mutex<Vec<TimeSeries>>,
}

#[async_trait]
impl Queryable for TestQueryable {
    async fn select(&self, matchers: &Labels) -> RulesResult<Vec<TimeSeries>> {
        Ok(self
            .series
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.labels.contains_all(matchers))
            .cloned()
            .collect())
    }
}

/// Wraps a synchronous closure as a [`QueryFunc`].
pub(crate) fn query_fn_from(
    f: impl Fn(&str, Timestamp) -> RulesResult<Vector> + Send + Sync + 'static,
) -> QueryFunc {
    let f = Arc::new(f);
    Arc::new(move |expr: String, ts: Timestamp| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(&expr, ts) })
    })
}

/// Tracks how many queries run at once, for overlap assertions.
#[derive(Default)]
pub(crate) struct ConcurrencyTracker {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyTracker {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// A query that holds for `delay` while recording overlap, then returns one
/// unlabelled sample.
pub(crate) fn tracking_query_fn(delay: Duration, tracker: Arc<ConcurrencyTracker>) -> QueryFunc {
    Arc::new(move |_expr: String, _ts: Timestamp| {
        let tracker = Arc::clone(&tracker);
        Box::pin(async move {
            tracker.enter();
            tokio::time::sleep(delay).await;
            tracker.exit();
            Ok(vec![Sample {
                labels: Labels::default(),
                timestamp: 0,
                value: 1.0,
            }])
        })
    })
}

pub(crate) fn noop_notify_func() -> NotifyFunc {
    Arc::new(|_expr, _alerts| Box::pin(async {}))
}

/// Returns a notify func plus the shared store it fills.
#[allow(clippy::type_complexity)]
pub(crate) fn collecting_notify_func() -> (NotifyFunc, Arc<Mutex<Vec<(String, Vec<NotificationAlert>)>>>) {
    let store: Arc<Mutex<Vec<(String, Vec<NotificationAlert>)>>> = Arc::default();
    let sink = Arc::clone(&store);
    let func: NotifyFunc = Arc::new(move |expr, alerts| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().unwrap().push((expr, alerts));
        })
    });
    (func, store)
}

/// A context with inert seams, for tests that never evaluate.
pub(crate) fn manager_context() -> Arc<ManagerContext> {
    manager_context_with(
        query_fn_from(|_expr, _ts| Ok(vec![])),
        Arc::new(TestAppendable::default()),
    )
}

pub(crate) fn manager_context_with(
    query_func: QueryFunc,
    appendable: Arc<TestAppendable>,
) -> Arc<ManagerContext> {
    Arc::new(manager_context_parts(query_func, appendable))
}

/// Same as [`manager_context_with`] but open for field overrides.
pub(crate) fn manager_context_parts(
    query_func: QueryFunc,
    appendable: Arc<TestAppendable>,
) -> ManagerContext {
    ManagerContext {
        query_func,
        notify_func: noop_notify_func(),
        appendable,
        queryable: Arc::new(TestQueryable::default()),
        outage_tolerance: Duration::from_secs(3600),
        for_grace_period: Duration::from_secs(600),
        resend_delay: Duration::from_secs(60),
        default_rule_query_offset: None,
        concurrency_controller: Arc::new(SequentialRuleEvalController),
        dependency_controller: Arc::new(DefaultRuleDependencyController),
    }
}
