use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::common::types::{Labels, Sample, TimeSeries, Timestamp, Vector};
use crate::rules::error::{RulesError, RulesResult};

/// Executes an instant query at the given timestamp and returns the
/// resulting vector. Implementations are produced by [`engine_query_func`]
/// or supplied directly by the embedder.
pub type QueryFunc =
    Arc<dyn Fn(String, Timestamp) -> BoxFuture<'static, RulesResult<Vector>> + Send + Sync>;

/// The shapes a query engine may produce for an instant query.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum QueryValue {
    Vector(Vector),
    Scalar { timestamp: Timestamp, value: f64 },
    Matrix(Vec<TimeSeries>),
}

impl QueryValue {
    pub fn kind(&self) -> &'static str {
        match self {
            QueryValue::Vector(_) => "vector",
            QueryValue::Scalar { .. } => "scalar",
            QueryValue::Matrix(_) => "matrix",
        }
    }
}

/// QueryEngine wraps the instant-query entry point of the query engine.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, expr: &str, ts: Timestamp) -> RulesResult<QueryValue>;
}

/// Adapts a [`QueryEngine`] into a [`QueryFunc`]. A scalar result is wrapped
/// as a one-sample vector with empty labels; any other non-vector shape is
/// an error.
pub fn engine_query_func(engine: Arc<dyn QueryEngine>) -> QueryFunc {
    Arc::new(move |expr: String, ts: Timestamp| {
        let engine = Arc::clone(&engine);
        Box::pin(async move {
            match engine.query(&expr, ts).await? {
                QueryValue::Vector(vector) => Ok(vector),
                QueryValue::Scalar { timestamp, value } => Ok(vec![Sample {
                    labels: Labels::default(),
                    timestamp,
                    value,
                }]),
                other => Err(RulesError::UnexpectedResultType(format!(
                    "rule result is not a vector or scalar: {}",
                    other.kind()
                ))),
            }
        })
    })
}

/// Appender ingests the samples of one evaluation; `commit` makes them
/// durable. Dropping an uncommitted appender discards its samples.
#[async_trait]
pub trait Appender: Send {
    async fn append(&mut self, labels: Labels, ts: Timestamp, value: f64) -> RulesResult<()>;
    async fn commit(&mut self) -> RulesResult<()>;
}

/// Appendable hands out per-iteration appenders over the backing storage.
pub trait Appendable: Send + Sync {
    fn appender(&self) -> Box<dyn Appender>;
}

/// Queryable reads back previously written series; the scheduler uses it to
/// recover alert for-state after a restart.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Returns all series whose label sets contain every given matcher with
    /// an equal value.
    async fn select(&self, matchers: &Labels) -> RulesResult<Vec<TimeSeries>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Label;

    struct StubEngine(QueryValue);

    #[async_trait]
    impl QueryEngine for StubEngine {
        async fn query(&self, _expr: &str, _ts: Timestamp) -> RulesResult<QueryValue> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_scalar_becomes_one_sample_vector() {
        let qf = engine_query_func(Arc::new(StubEngine(QueryValue::Scalar {
            timestamp: 42,
            value: 1.5,
        })));
        let vector = (qf)("scalar(1.5)".to_string(), 42).await.unwrap();
        assert_eq!(vector.len(), 1);
        assert!(vector[0].labels.is_empty());
        assert_eq!(vector[0].timestamp, 42);
        assert_eq!(vector[0].value, 1.5);
    }

    #[tokio::test]
    async fn test_vector_passes_through() {
        let sample = Sample {
            labels: Labels::new(vec![Label::new("job", "api")]),
            timestamp: 7,
            value: 2.0,
        };
        let qf = engine_query_func(Arc::new(StubEngine(QueryValue::Vector(vec![sample.clone()]))));
        let vector = (qf)("up".to_string(), 7).await.unwrap();
        assert_eq!(vector, vec![sample]);
    }

    #[tokio::test]
    async fn test_matrix_is_rejected() {
        let qf = engine_query_func(Arc::new(StubEngine(QueryValue::Matrix(vec![]))));
        let err = (qf)("up[5m]".to_string(), 7).await.unwrap_err();
        assert!(matches!(err, RulesError::UnexpectedResultType(_)));
    }
}
