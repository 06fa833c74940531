//! The rule evaluation engine: a hot-reloadable manager of rule groups,
//! each periodically evaluating recording and alerting rules against a
//! pluggable query engine, with intra-group concurrency derived from static
//! dependency analysis and bounded by a process-wide admission semaphore.

pub mod alerting;
pub mod concurrency;
pub mod config;
pub mod datasource;
mod error;
#[cfg(test)]
mod fakes;
pub mod group;
pub mod manager;
mod metrics;
pub mod notifier;
pub mod recording;
mod rule;

pub use alerting::{Alert, AlertState, AlertingRule};
pub use concurrency::{
    ConcurrentRuleEvalController, ConcurrentRules, DefaultRuleDependencyController,
    RuleConcurrencyController, RuleDependencyController, SequentialRuleEvalController,
};
pub use config::{
    parse_duration, FileLoader, GroupConfig, GroupLoader, RuleConfig, RuleGroupsConfig,
};
pub use datasource::{
    engine_query_func, Appendable, Appender, QueryEngine, QueryFunc, QueryValue, Queryable,
};
pub use error::{RulesError, RulesResult};
pub use group::{default_eval_iteration_func, group_key, Group, GroupEvalIterationFunc};
pub use manager::{Manager, ManagerOptions};
pub use notifier::{notifier_notify_func, NotificationAlert, Notifier, NotifyFunc};
pub use recording::RecordingRule;
pub use rule::{EvalState, GroupRule, Rule, RuleHealth, RuleType};
