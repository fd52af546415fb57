//! Processing metrics.
//!
//! Every message produces two metrics, tagged with the message type, the
//! short message name and whether processing succeeded:
//!
//! - `lineage_processing_seconds`: wall time spent in the rest of the chain
//! - `lineage_messages_total`: a counter increment of 1
//!
//! Exporters are called one after another. A failing exporter is logged and
//! skipped; it never affects the dispatch or the other exporters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::error::Result;
use crate::middleware::{Middleware, Next};

pub const PROCESSING_SECONDS: &str = "lineage_processing_seconds";
pub const MESSAGES_TOTAL: &str = "lineage_messages_total";

/// One data point handed to an exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, value: f64, tags: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            value,
            tags,
            timestamp: Utc::now(),
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Ships metrics to a monitoring backend.
#[async_trait]
pub trait MetricsExporter: Send + Sync {
    /// Name used when logging export failures.
    fn name(&self) -> &str;

    async fn export(&self, metric: &Metric) -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct MetricsMiddleware {
    exporters: Vec<Arc<dyn MetricsExporter>>,
}

impl MetricsMiddleware {
    pub fn new(exporters: Vec<Arc<dyn MetricsExporter>>) -> Self {
        Self { exporters }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn MetricsExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }

    async fn record(&self, tags: BTreeMap<String, String>, seconds: f64) {
        let metrics = [
            Metric::new(PROCESSING_SECONDS, seconds, tags.clone()),
            Metric::new(MESSAGES_TOTAL, 1.0, tags),
        ];

        for metric in &metrics {
            for exporter in &self.exporters {
                tracing::debug!(metric = %metric.name, exporter = exporter.name(), "exporting metric");
                if let Err(error) = exporter.export(metric).await {
                    tracing::error!(
                        metric = %metric.name,
                        exporter = exporter.name(),
                        error = %error,
                        "failed to export metric"
                    );
                }
            }
        }
    }
}

impl fmt::Debug for MetricsMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsMiddleware")
            .field(
                "exporters",
                &self.exporters.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn handle(&self, envelope: Envelope, next: Next) -> Result<Envelope> {
        if self.exporters.is_empty() {
            return next.run(envelope).await;
        }

        let mut tags = BTreeMap::new();
        tags.insert("type".to_string(), envelope.message_type().as_str().to_string());
        tags.insert("name".to_string(), short_name(envelope.message_name()).to_string());

        let started = Instant::now();
        let mut cancelled = CancelGuard {
            pending: Some((self.clone(), tags.clone())),
            started,
        };
        let result = next.run(envelope).await;
        cancelled.pending = None;
        let seconds = started.elapsed().as_secs_f64();

        tags.insert("success".to_string(), result.is_ok().to_string());
        self.record(tags, seconds).await;

        result
    }
}

/// Records a failed run when the dispatch future is dropped before the rest
/// of the chain returns.
struct CancelGuard {
    pending: Option<(MetricsMiddleware, BTreeMap<String, String>)>,
    started: Instant,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let Some((middleware, mut tags)) = self.pending.take() else {
            return;
        };
        let seconds = self.started.elapsed().as_secs_f64();
        tags.insert("success".to_string(), "false".to_string());

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { middleware.record(tags, seconds).await });
            }
            Err(_) => tracing::warn!(
                name = tags.get("name").map(String::as_str),
                "dispatch cancelled outside a runtime; metrics not exported"
            ),
        }
    }
}

/// `my_app::orders::PlaceOrder` -> `PlaceOrder`.
fn short_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::middleware::MessageBus;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct Restock;
    crate::impl_command!(Restock);

    #[derive(Default)]
    struct Collect {
        metrics: Mutex<Vec<Metric>>,
    }

    #[async_trait]
    impl MetricsExporter for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn export(&self, metric: &Metric) -> anyhow::Result<()> {
            self.metrics.lock().unwrap().push(metric.clone());
            Ok(())
        }
    }

    struct Offline;

    #[async_trait]
    impl MetricsExporter for Offline {
        fn name(&self) -> &str {
            "offline"
        }

        async fn export(&self, _metric: &Metric) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    struct Fail;

    #[async_trait]
    impl Middleware for Fail {
        async fn handle(&self, _envelope: Envelope, _next: Next) -> Result<Envelope> {
            Err(BusError::NoHandler { message: "Restock" })
        }
    }

    struct Stall;

    #[async_trait]
    impl Middleware for Stall {
        async fn handle(&self, envelope: Envelope, _next: Next) -> Result<Envelope> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(envelope)
        }
    }

    #[test]
    fn short_name_strips_the_module_path() {
        assert_eq!(short_name("shop::orders::Restock"), "Restock");
        assert_eq!(short_name("Restock"), "Restock");
        assert_eq!(short_name("shop::Wrapper<shop::Inner>"), "Wrapper");
    }

    #[tokio::test]
    async fn records_both_metrics_on_success() {
        let collect = Arc::new(Collect::default());
        let bus = MessageBus::new(
            "metrics",
            vec![Arc::new(MetricsMiddleware::new(vec![collect.clone()]))],
        );

        bus.dispatch(Envelope::new(Restock)).await.unwrap();

        let metrics = collect.metrics.lock().unwrap();
        let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec![PROCESSING_SECONDS, MESSAGES_TOTAL]);
        assert_eq!(metrics[1].value, 1.0);
        assert_eq!(metrics[0].tag("type"), Some("command"));
        assert_eq!(metrics[0].tag("name"), Some("Restock"));
        assert_eq!(metrics[0].tag("success"), Some("true"));
    }

    #[tokio::test]
    async fn records_failure_and_returns_the_error() {
        let collect = Arc::new(Collect::default());
        let bus = MessageBus::new(
            "metrics",
            vec![
                Arc::new(MetricsMiddleware::new(vec![collect.clone()])),
                Arc::new(Fail),
            ],
        );

        let err = bus.dispatch(Envelope::new(Restock)).await.unwrap_err();

        assert!(matches!(err, BusError::NoHandler { .. }));
        let metrics = collect.metrics.lock().unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.tag("success") == Some("false")));
    }

    #[tokio::test]
    async fn failing_exporter_does_not_starve_the_others() {
        let collect = Arc::new(Collect::default());
        let middleware = MetricsMiddleware::default()
            .with_exporter(Arc::new(Offline))
            .with_exporter(collect.clone());
        let bus = MessageBus::new("metrics", vec![Arc::new(middleware)]);

        bus.dispatch(Envelope::new(Restock)).await.unwrap();

        assert_eq!(collect.metrics.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_dispatch_is_recorded_as_failed() {
        let collect = Arc::new(Collect::default());
        let bus = MessageBus::new(
            "metrics",
            vec![
                Arc::new(MetricsMiddleware::new(vec![collect.clone()])),
                Arc::new(Stall),
            ],
        );

        let outcome =
            tokio::time::timeout(Duration::from_millis(20), bus.dispatch(Envelope::new(Restock)))
                .await;
        assert!(outcome.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let metrics = collect.metrics.lock().unwrap();
        let names: Vec<_> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec![PROCESSING_SECONDS, MESSAGES_TOTAL]);
        assert!(metrics.iter().all(|m| m.tag("success") == Some("false")));
    }
}
