// =============================================================================
// Ingestion Orchestrator: runs every configured task, isolating failures
// =============================================================================
//
// For each task, in declaration order:
//   1. resolve the source by name (miss → the task fails, nothing else does)
//   2. log what is about to run
//   3. fetch
//   4. record the outcome and log it
//
// A task failure never aborts the run and is never retried.  With
// `max_concurrent_tasks > 1` up to that many fetches are in flight at once;
// outcomes still come back in declaration order.  Cancelling the token
// drops in-flight fetches and marks every unfinished task as cancelled.
// =============================================================================

use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{FetchParams, IngestionConfig, TaskConfig};
use crate::error::{FetchError, TaskError};
use crate::market_data::{IngestionResult, SymbolSeriesMap};
use crate::sources::SourceRegistry;

// =============================================================================
// Outcomes
// =============================================================================

/// What a successful task produced.
#[derive(Debug, Default)]
pub struct TaskData {
    pub series: SymbolSeriesMap,
    /// Symbols the source skipped under a lenient policy.
    pub skipped: BTreeMap<String, FetchError>,
}

impl TaskData {
    pub fn total_rows(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }
}

/// Result of one task.
#[derive(Debug)]
pub struct TaskOutcome {
    pub name: String,
    pub source: String,
    pub result: Result<TaskData, TaskError>,
    pub elapsed: Duration,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-task outcomes of one run, in declaration order.
#[derive(Debug)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub outcomes: Vec<TaskOutcome>,
}

impl IngestionReport {
    pub fn get(&self, task: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.name == task)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    /// Failed tasks with their error.
    pub fn failed(&self) -> impl Iterator<Item = (&str, &TaskError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }

    pub fn total_rows(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(TaskData::total_rows)
            .sum()
    }

    /// Keep only the successful tasks: task name → symbol → series.
    pub fn into_result(self) -> IngestionResult {
        self.outcomes
            .into_iter()
            .filter_map(|o| o.result.ok().map(|data| (o.name, data.series)))
            .collect()
    }

    pub fn log_summary(&self) {
        let failed: Vec<&str> = self.failed().map(|(name, _)| name).collect();
        info!(
            run_id = %self.run_id,
            tasks = self.outcomes.len(),
            succeeded = self.succeeded().count(),
            failed = failed.len(),
            rows = self.total_rows(),
            "ingestion finished"
        );
        if !failed.is_empty() {
            warn!(run_id = %self.run_id, tasks = ?failed, "some tasks produced no data");
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs ingestion tasks against a source registry.
pub struct Ingestion {
    registry: SourceRegistry,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Ingestion {
    /// Sequential, non-cancellable orchestrator.
    pub fn new(registry: SourceRegistry) -> Self {
        Self {
            registry,
            concurrency: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Fetch up to `n` tasks at once (`0` is treated as `1`).
    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Attempt every task exactly once.  Never fails as a whole.
    pub async fn run(&self, config: &IngestionConfig) -> IngestionReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion", run_id = %run_id);

        async move {
            info!(
                tasks = config.tasks.len(),
                concurrency = self.concurrency,
                sources = ?self.registry.names(),
                "ingestion started"
            );

            let rejected = reject_ambiguous_names(config);
            let outcomes: Vec<TaskOutcome> = stream::iter(config.tasks.iter().zip(rejected))
                .map(|(task, rejected)| self.run_task(task, rejected))
                .buffered(self.concurrency)
                .collect()
                .await;

            let report = IngestionReport { run_id, outcomes };
            report.log_summary();
            report
        }
        .instrument(span)
        .await
    }

    async fn run_task(&self, task: &TaskConfig, rejected: Option<String>) -> TaskOutcome {
        let started = Instant::now();
        let result = self.execute(task, rejected).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(data) => info!(
                task = %task.name,
                source = %task.source,
                symbols = data.series.len(),
                rows = data.total_rows(),
                skipped = data.skipped.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "task completed"
            ),
            Err(TaskError::Cancelled) => warn!(task = %task.name, "task cancelled"),
            Err(e) => error!(
                task = %task.name,
                source = %task.source,
                kind = e.kind(),
                error = %e,
                "task failed"
            ),
        }

        TaskOutcome {
            name: task.name.clone(),
            source: task.source.clone(),
            result,
            elapsed,
        }
    }

    async fn execute(
        &self,
        task: &TaskConfig,
        rejected: Option<String>,
    ) -> Result<TaskData, TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        if let Some(reason) = rejected {
            return Err(TaskError::InvalidTask(reason));
        }

        let source = self
            .registry
            .get(&task.source)
            .ok_or_else(|| TaskError::UnknownSource(task.source.clone()))?;

        if let FetchParams::Invalid { reason } = &task.params {
            return Err(FetchError::Validation(reason.clone()).into());
        }

        info!(
            task = %task.name,
            source = %task.source,
            params = %task.params,
            "running task"
        );

        let batch = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
            batch = source.fetch(&task.params) => batch?,
        };

        Ok(TaskData {
            series: batch.series,
            skipped: batch.skipped,
        })
    }
}

/// Per task, why it must not run: a blank name, or a name already used by
/// an earlier task.  Configs from `IngestionConfig::load` never trip this;
/// configs built in code might.
fn reject_ambiguous_names(config: &IngestionConfig) -> Vec<Option<String>> {
    let mut seen = HashSet::new();
    config
        .tasks
        .iter()
        .enumerate()
        .map(|(i, task)| {
            if task.name.trim().is_empty() {
                Some(format!("task #{i} has an empty name"))
            } else if !seen.insert(task.name.as_str()) {
                Some(format!("task name '{}' is declared more than once", task.name))
            } else {
                None
            }
        })
        .collect()
}

/// Run every task of `config` and keep only what succeeded.
pub async fn run(config: &IngestionConfig, registry: &SourceRegistry) -> IngestionResult {
    Ingestion::new(registry.clone())
        .with_concurrency(config.runner.max_concurrent_tasks)
        .run(config)
        .await
        .into_result()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use serde_json::Map;
    use tracing::field::{Field, Visit};
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;
    use crate::market_data::candle::tests::sample_candle;
    use crate::market_data::SymbolSeries;
    use crate::sources::{DataSource, SourceBatch};

    // ── Stub source ──────────────────────────────────────────────────────

    struct Stub {
        outcome: Result<Vec<(&'static str, usize)>, &'static str>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl Stub {
        fn ok(symbols: &[(&'static str, usize)]) -> Arc<Self> {
            Arc::new(Self {
                outcome: Ok(symbols.to_vec()),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(msg: &'static str) -> Arc<Self> {
            Arc::new(Self {
                outcome: Err(msg),
                delay: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn slow(symbols: &[(&'static str, usize)], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                outcome: Ok(symbols.to_vec()),
                delay: Some(delay),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for Stub {
        fn kind(&self) -> &'static str {
            "stub"
        }

        async fn fetch(&self, _params: &FetchParams) -> Result<SourceBatch, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.outcome {
                Ok(symbols) => {
                    let series = symbols
                        .iter()
                        .map(|&(symbol, rows)| {
                            let candles = (0..rows as i64)
                                .map(|i| sample_candle(i * 60_000, dec!(1)))
                                .collect();
                            (symbol.to_string(), SymbolSeries::new(symbol, candles).unwrap())
                        })
                        .collect();
                    Ok(SourceBatch::new(series))
                }
                Err(msg) => Err(FetchError::Transport(msg.to_string())),
            }
        }
    }

    /// Records how many fetches overlap.
    struct InFlight {
        delay: Duration,
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl InFlight {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DataSource for InFlight {
        fn kind(&self) -> &'static str {
            "in-flight"
        }

        async fn fetch(&self, _params: &FetchParams) -> Result<SourceBatch, FetchError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(SourceBatch::default())
        }
    }

    fn task(name: &str, source: &str) -> TaskConfig {
        TaskConfig::new(name, source, FetchParams::Opaque(Map::new()))
    }

    // ── Log capture ──────────────────────────────────────────────────────

    #[derive(Debug, Clone)]
    struct Captured {
        level: Level,
        fields: BTreeMap<String, String>,
    }

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Captured>>>);

    struct FieldVisitor<'a>(&'a mut BTreeMap<String, String>);

    impl Visit for FieldVisitor<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    impl<S: Subscriber> Layer<S> for Capture {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            let mut fields = BTreeMap::new();
            event.record(&mut FieldVisitor(&mut fields));
            if let Ok(mut events) = self.0.lock() {
                events.push(Captured {
                    level: *event.metadata().level(),
                    fields,
                });
            }
        }
    }

    impl Capture {
        fn at(&self, level: Level) -> Vec<Captured> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.level == level)
                .cloned()
                .collect()
        }
    }

    // ── Tests ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failing_task_does_not_affect_others() {
        let registry = SourceRegistry::builder()
            .register_shared("good", Stub::ok(&[("BTCUSDT", 3)]))
            .register_shared("bad", Stub::failing("connection refused"))
            .build();
        let config = IngestionConfig::with_tasks(vec![
            task("first", "good"),
            task("broken", "bad"),
            task("third", "good"),
        ]);

        let report = Ingestion::new(registry).run(&config).await;

        let failed: Vec<(&str, &str)> = report.failed().map(|(n, e)| (n, e.kind())).collect();
        assert_eq!(failed, vec![("broken", "transport")]);
        assert_eq!(report.total_rows(), 6);

        let result = report.into_result();
        let keys: Vec<&str> = result.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["first", "third"]);
        assert_eq!(result["first"]["BTCUSDT"].len(), 3);
    }

    #[tokio::test]
    async fn unknown_source_logs_exactly_one_error() {
        let capture = Capture::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

        let good = Stub::ok(&[("ETHUSDT", 1)]);
        let registry = SourceRegistry::builder()
            .register_shared("binance", good.clone())
            .build();
        let config = IngestionConfig::with_tasks(vec![
            task("typo", "binanse"),
            task("ok", "binance"),
        ]);

        let report = Ingestion::new(registry).run(&config).await;

        assert!(matches!(
            report.get("typo").map(|o| &o.result),
            Some(Err(TaskError::UnknownSource(s))) if s == "binanse"
        ));
        assert_eq!(good.calls(), 1);

        let errors = capture.at(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].fields.get("task").map(String::as_str), Some("typo"));
        assert_eq!(errors[0].fields.get("kind").map(String::as_str), Some("configuration"));

        let result = report.into_result();
        assert!(!result.contains_key("typo"));
        assert!(result.contains_key("ok"));
    }

    #[tokio::test]
    async fn running_task_event_names_task_and_params() {
        let capture = Capture::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

        let registry = SourceRegistry::builder()
            .register_shared("s", Stub::ok(&[("BTCUSDT", 1)]))
            .build();
        let config = IngestionConfig::with_tasks(vec![task("daily", "s")]);
        Ingestion::new(registry).run(&config).await;

        let running: Vec<Captured> = capture
            .at(Level::INFO)
            .into_iter()
            .filter(|e| e.fields.get("message").map(String::as_str) == Some("running task"))
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].fields.get("task").map(String::as_str), Some("daily"));
        assert_eq!(running[0].fields.get("params").map(String::as_str), Some("{}"));
    }

    #[tokio::test]
    async fn empty_task_list_yields_empty_result() {
        let registry = SourceRegistry::builder()
            .register_shared("s", Stub::ok(&[("BTCUSDT", 1)]))
            .build();

        let report = Ingestion::new(registry.clone())
            .run(&IngestionConfig::default())
            .await;
        assert!(report.outcomes.is_empty());
        assert!(run(&IngestionConfig::default(), &registry).await.is_empty());
    }

    #[tokio::test]
    async fn result_does_not_depend_on_declaration_order() {
        let registry = SourceRegistry::builder()
            .register_shared("a", Stub::ok(&[("BTCUSDT", 2), ("ETHUSDT", 1)]))
            .register_shared("b", Stub::ok(&[("SOLUSDT", 4)]))
            .register_shared("x", Stub::failing("down"))
            .build();

        let forward = IngestionConfig::with_tasks(vec![
            task("one", "a"),
            task("two", "b"),
            task("three", "x"),
        ]);
        let backward = IngestionConfig::with_tasks(vec![
            task("three", "x"),
            task("two", "b"),
            task("one", "a"),
        ]);

        let left = run(&forward, &registry).await;
        let right = run(&backward, &registry).await;
        assert_eq!(left, right);
        assert_eq!(left.len(), 2);
    }

    #[tokio::test]
    async fn each_task_is_attempted_once() {
        let flaky = Stub::failing("timeout");
        let registry = SourceRegistry::builder()
            .register_shared("flaky", flaky.clone())
            .build();
        let config = IngestionConfig::with_tasks(vec![task("a", "flaky"), task("b", "flaky")]);

        let result = run(&config, &registry).await;
        assert!(result.is_empty());
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_run_keeps_declaration_order() {
        let registry = SourceRegistry::builder()
            .register_shared("slow", Stub::slow(&[("BTCUSDT", 1)], Duration::from_millis(60)))
            .register_shared("fast", Stub::ok(&[("ETHUSDT", 1)]))
            .build();
        let config = IngestionConfig::with_tasks(vec![
            task("slow", "slow"),
            task("fast-1", "fast"),
            task("fast-2", "fast"),
        ]);

        let report = Ingestion::new(registry)
            .with_concurrency(3)
            .run(&config)
            .await;

        let names: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["slow", "fast-1", "fast-2"]);
        assert_eq!(report.succeeded().count(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_every_fetch() {
        let stub = Stub::ok(&[("BTCUSDT", 1)]);
        let registry = SourceRegistry::builder()
            .register_shared("s", stub.clone())
            .build();
        let token = CancellationToken::new();
        token.cancel();

        let config = IngestionConfig::with_tasks(vec![task("a", "s"), task("b", "s")]);
        let report = Ingestion::new(registry)
            .with_cancellation(token)
            .run(&config)
            .await;

        assert_eq!(stub.calls(), 0);
        assert!(report
            .outcomes
            .iter()
            .all(|o| matches!(o.result, Err(TaskError::Cancelled))));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_fetch() {
        let stub = Stub::slow(&[("BTCUSDT", 1)], Duration::from_secs(30));
        let registry = SourceRegistry::builder()
            .register_shared("s", stub.clone())
            .build();
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let config = IngestionConfig::with_tasks(vec![task("a", "s"), task("b", "s")]);
        let report = Ingestion::new(registry)
            .with_cancellation(token)
            .run(&config)
            .await;

        assert_eq!(stub.calls(), 1);
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes[0].elapsed < Duration::from_secs(30));
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.result.as_ref().err().map(TaskError::kind) == Some("cancelled")));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let tasks: Vec<TaskConfig> = (0..4).map(|i| task(&format!("t{i}"), "s")).collect();
        let config = IngestionConfig::with_tasks(tasks);

        let source = InFlight::new(Duration::from_millis(30));
        let registry = SourceRegistry::builder()
            .register_shared("s", source.clone())
            .build();
        let report = Ingestion::new(registry)
            .with_concurrency(2)
            .run(&config)
            .await;
        assert_eq!(report.succeeded().count(), 4);
        assert_eq!(source.peak(), 2);

        let source = InFlight::new(Duration::from_millis(10));
        let registry = SourceRegistry::builder()
            .register_shared("s", source.clone())
            .build();
        Ingestion::new(registry).run(&config).await;
        assert_eq!(source.peak(), 1);
    }

    #[tokio::test]
    async fn task_with_unparseable_params_fails_alone() {
        let capture = Capture::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

        let config = IngestionConfig::from_json_str(
            r#"{ "tasks": [
                { "name": "good", "source": "binance",
                  "params": { "symbols": ["BTCUSDT"], "interval": "1h", "start_time": "2024-01-01" } },
                { "name": "typo", "source": "binance",
                  "params": { "symbols": ["BTCUSDT"], "interval": "7m", "start_time": "2024-01-01" } }
            ] }"#,
        )
        .unwrap();

        let binance = Stub::ok(&[("BTCUSDT", 2)]);
        let registry = SourceRegistry::builder()
            .register_shared("binance", binance.clone())
            .build();
        let report = Ingestion::new(registry).run(&config).await;

        assert!(matches!(
            report.get("typo").map(|o| &o.result),
            Some(Err(TaskError::Fetch(FetchError::Validation(_))))
        ));
        assert_eq!(binance.calls(), 1);

        let errors = capture.at(Level::ERROR);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].fields.get("task").map(String::as_str), Some("typo"));
        assert_eq!(errors[0].fields.get("kind").map(String::as_str), Some("validation"));

        let result = report.into_result();
        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["good"]);
        assert_eq!(result["good"]["BTCUSDT"].len(), 2);
    }

    #[tokio::test]
    async fn reused_task_name_only_runs_once() {
        let first = Stub::ok(&[("BTCUSDT", 1)]);
        let second = Stub::ok(&[("ETHUSDT", 1)]);
        let registry = SourceRegistry::builder()
            .register_shared("first", first.clone())
            .register_shared("second", second.clone())
            .build();
        let config = IngestionConfig::with_tasks(vec![
            task("daily", "first"),
            task("daily", "second"),
            task(" ", "first"),
        ]);

        let report = Ingestion::new(registry).run(&config).await;

        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 0);
        let kinds: Vec<&str> = report.failed().map(|(_, e)| e.kind()).collect();
        assert_eq!(kinds, vec!["configuration", "configuration"]);

        let result = report.into_result();
        assert_eq!(result.len(), 1);
        assert!(result["daily"].contains_key("BTCUSDT"));
    }
}
