use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::warn;

use crate::common::types::{Labels, Timestamp};
use crate::rules::error::RulesResult;

/// One alert as handed to the notification layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationAlert {
    pub labels: Labels,
    pub annotations: AHashMap<String, String>,
    /// the moment the alert started firing
    pub starts_at: Timestamp,
    /// resolution time if resolved, otherwise the time until which the alert
    /// is considered valid
    pub ends_at: Timestamp,
    pub generator_url: String,
}

/// Notifier is a common interface for an alert manager provider.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends the given list of alerts. The list is never empty.
    async fn send(&self, alerts: &[NotificationAlert]) -> RulesResult<()>;
    /// Address where the alerts are sent, for diagnostics.
    fn addr(&self) -> String;
}

/// Sends the firing alerts of one rule, identified by its expression.
/// Invoked only with non-empty batches.
pub type NotifyFunc =
    Arc<dyn Fn(String, Vec<NotificationAlert>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapts a set of notifiers into a [`NotifyFunc`]. Send failures are logged
/// per notifier and never propagate into rule evaluation.
pub fn notifier_notify_func(notifiers: Vec<Arc<dyn Notifier>>) -> NotifyFunc {
    let notifiers = Arc::new(notifiers);
    Arc::new(move |expr: String, alerts: Vec<NotificationAlert>| {
        let notifiers = Arc::clone(&notifiers);
        Box::pin(async move {
            if alerts.is_empty() {
                return;
            }
            for nt in notifiers.iter() {
                if let Err(err) = nt.send(&alerts).await {
                    warn!(addr = %nt.addr(), expr = %expr, "failed to send alerts: {}", err);
                }
            }
        })
    })
}

/// Builds the expression link stamped on outgoing alerts.
pub(crate) fn generator_url(external_url: &str, expr: &str) -> String {
    format!(
        "{}/graph?g0.expr={}&g0.tab=1",
        external_url.trim_end_matches('/'),
        urlencode(expr)
    )
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
