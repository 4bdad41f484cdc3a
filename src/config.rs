// =============================================================================
// Ingestion Configuration: sources, logging, runner settings and tasks
// =============================================================================
//
// The config file is JSON.  Every optional block carries `#[serde(default)]`
// so a file containing only `tasks` loads fine.
//
// Task parameters are typed here, at load time, not inside `fetch`: each
// task's free-form `params` object is parsed into the typed variant that
// matches its source (`binance` → `ExchangeFetchParams`, `file` →
// `FileFetchParams`).  Sources this layer does not know keep the raw object
// as `FetchParams::Opaque` and interpret it themselves.
//
// A task whose params do not parse still loads, as `FetchParams::Invalid`;
// only that task fails when the run reaches it.  Malformed JSON and
// empty or duplicate task names fail the whole load.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::binance::client::DEFAULT_BASE_URL;
use crate::binance::KlineInterval;
use crate::error::{ConfigError, FetchError};

/// Registry name of the Binance historical-candle source.
pub const BINANCE_SOURCE: &str = "binance";
/// Registry name of the CSV file source.
pub const FILE_SOURCE: &str = "file";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_handlers() -> Vec<LogHandler> {
    vec![LogHandler::Console]
}

fn default_max_concurrent_tasks() -> usize {
    1
}

// =============================================================================
// Source blocks
// =============================================================================

/// Exchange credentials and endpoint.  Blank credentials are filled in from
/// the environment by the startup code.
#[derive(Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub api_secret: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            base_url: default_base_url(),
        }
    }
}

impl std::fmt::Debug for BinanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceConfig")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Root directory of the CSV file source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub base_path: PathBuf,
}

// =============================================================================
// Logging & runner
// =============================================================================

/// Where log events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogHandler {
    Console,
    File,
}

/// Log sink settings, consumed by `logging::init`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory for the file handler.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_handlers")]
    pub handlers: Vec<LogHandler>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_dir: default_log_dir(),
            handlers: default_handlers(),
        }
    }
}

/// Orchestrator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Upper bound on tasks fetched at the same time.  `1` keeps the run
    /// strictly sequential.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

// =============================================================================
// TimeBound
// =============================================================================

/// A point in time given in the config, normalized to UTC.
///
/// Accepted forms: RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD`,
/// `1 Jan, 2024`, a millisecond epoch (number or string), and relative
/// `"<n> <unit>s ago"` with an optional trailing `UTC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBound(pub DateTime<Utc>);

impl TimeBound {
    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// Parse `text`, resolving relative forms against `now`.
    pub fn parse(text: &str, now: DateTime<Utc>) -> Result<Self, String> {
        let s = text.trim();

        if let Ok(ms) = s.parse::<i64>() {
            return epoch_millis(ms).map(Self);
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(Self(dt.with_timezone(&Utc)));
        }
        for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(Self(Utc.from_utc_datetime(&naive)));
            }
        }
        for fmt in ["%Y-%m-%d", "%d %b, %Y", "%d %b %Y", "%d %B, %Y", "%d %B %Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
                if let Some(naive) = date.and_hms_opt(0, 0, 0) {
                    return Ok(Self(Utc.from_utc_datetime(&naive)));
                }
            }
        }
        if let Some(ago) = parse_relative(s) {
            let at = match ago {
                Ago::Span(span) => now.checked_sub_signed(span),
                Ago::Months(months) => now.checked_sub_months(Months::new(months)),
            };
            return at
                .map(Self)
                .ok_or_else(|| format!("relative time out of range: '{s}'"));
        }

        Err(format!("unrecognised date/time '{s}'"))
    }
}

/// Smallest accepted epoch: ten digits.  Shorter integers (`2024`,
/// `20240101`) are years or compact dates, not milliseconds.
const MIN_EPOCH_MILLIS: i64 = 1_000_000_000;

fn epoch_millis(ms: i64) -> Result<DateTime<Utc>, String> {
    if ms < MIN_EPOCH_MILLIS {
        return Err(format!(
            "'{ms}' is not a millisecond epoch; use a date such as \"2024-01-01\""
        ));
    }
    DateTime::from_timestamp_millis(ms).ok_or_else(|| format!("epoch millis out of range: {ms}"))
}

/// How far back a relative time points.
enum Ago {
    Span(Duration),
    Months(u32),
}

/// `"3 days ago"`, `"1 hour ago UTC"`, `"90 minutes ago"`, `"2 years ago"`.
fn parse_relative(s: &str) -> Option<Ago> {
    let lower = s.to_ascii_lowercase();
    let body = lower.strip_suffix(" utc").unwrap_or(&lower);
    let body = body.strip_suffix(" ago")?;

    let mut parts = body.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if parts.next().is_some() || amount < 0 {
        return None;
    }

    let months = |n: i64| u32::try_from(n).ok().map(Ago::Months);
    match unit.trim_end_matches('s') {
        "second" | "sec" => Duration::try_seconds(amount).map(Ago::Span),
        "minute" | "min" => Duration::try_minutes(amount).map(Ago::Span),
        "hour" => Duration::try_hours(amount).map(Ago::Span),
        "day" => Duration::try_days(amount).map(Ago::Span),
        "week" => Duration::try_weeks(amount).map(Ago::Span),
        "month" => months(amount),
        "year" => amount.checked_mul(12).and_then(months),
        _ => None,
    }
}

impl Serialize for TimeBound {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for TimeBound {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => epoch_millis(ms).map(Self).map_err(serde::de::Error::custom),
            Raw::Text(text) => Self::parse(&text, Utc::now()).map_err(serde::de::Error::custom),
        }
    }
}

// =============================================================================
// Fetch parameters
// =============================================================================

/// What the exchange source does when one symbol fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolErrorPolicy {
    /// Any symbol failure fails the whole task.
    #[default]
    FailTask,
    /// Drop the failing symbol and keep the rest.
    Skip,
}

/// Parameters of the Binance historical-candle source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeFetchParams {
    pub symbols: Vec<String>,
    pub interval: KlineInterval,
    /// Inclusive lower bound.
    pub start_time: TimeBound,
    /// Exclusive upper bound; absent means "now".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<TimeBound>,
    #[serde(default)]
    pub on_symbol_error: SymbolErrorPolicy,
}

/// Parameters of the CSV file source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileFetchParams {
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<TimeBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<TimeBound>,
}

/// Source-specific parameter bag, resolved at load time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FetchParams {
    Exchange(ExchangeFetchParams),
    File(FileFetchParams),
    Opaque(Map<String, Value>),
    /// Params that did not parse for their source; the task fails when run.
    Invalid { reason: String },
}

impl FetchParams {
    /// Variant name, used in mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exchange(_) => "exchange",
            Self::File(_) => "file",
            Self::Opaque(_) => "opaque",
            Self::Invalid { .. } => "invalid",
        }
    }

    /// Parse a raw `params` object for the given source name.
    pub fn for_source(source: &str, raw: Map<String, Value>) -> Result<Self, serde_json::Error> {
        match source {
            BINANCE_SOURCE => serde_json::from_value(Value::Object(raw)).map(Self::Exchange),
            FILE_SOURCE => serde_json::from_value(Value::Object(raw)).map(Self::File),
            _ => Ok(Self::Opaque(raw)),
        }
    }
}

impl std::fmt::Display for FetchParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

fn check_symbols(symbols: &[String]) -> Result<(), FetchError> {
    if symbols.is_empty() {
        return Err(FetchError::Validation("`symbols` must not be empty".into()));
    }
    let mut seen = HashSet::new();
    for s in symbols {
        if s.trim().is_empty() {
            return Err(FetchError::Validation("`symbols` contains a blank entry".into()));
        }
        if !seen.insert(s.as_str()) {
            return Err(FetchError::Validation(format!("symbol '{s}' is listed twice")));
        }
    }
    Ok(())
}

fn check_window(start: Option<&TimeBound>, end: Option<&TimeBound>) -> Result<(), FetchError> {
    if let (Some(s), Some(e)) = (start, end) {
        if s >= e {
            return Err(FetchError::Validation(format!(
                "`start_time` {} is not before `end_time` {}",
                s.0.to_rfc3339(),
                e.0.to_rfc3339()
            )));
        }
    }
    Ok(())
}

impl ExchangeFetchParams {
    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), FetchError> {
        check_symbols(&self.symbols)?;
        check_window(Some(&self.start_time), self.end_time.as_ref())
    }
}

impl FileFetchParams {
    pub fn validate(&self) -> Result<(), FetchError> {
        check_symbols(&self.symbols)?;
        check_window(self.start_time.as_ref(), self.end_time.as_ref())
    }
}

// =============================================================================
// Tasks
// =============================================================================

/// One declared unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskConfig {
    /// Unique within a run; aggregation key and log correlation id.
    pub name: String,
    /// Registry name of the source to fetch from.
    pub source: String,
    pub params: FetchParams,
}

impl TaskConfig {
    pub fn new(name: impl Into<String>, source: impl Into<String>, params: FetchParams) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            params,
        }
    }
}

/// Task as written in the file, before its params are typed.
#[derive(Debug, Deserialize)]
struct RawTaskConfig {
    name: String,
    source: String,
    #[serde(default)]
    params: Map<String, Value>,
}

impl From<RawTaskConfig> for TaskConfig {
    fn from(raw: RawTaskConfig) -> Self {
        let params = FetchParams::for_source(&raw.source, raw.params).unwrap_or_else(|e| {
            warn!(
                task = %raw.name,
                source = %raw.source,
                error = %e,
                "task params rejected; the task will fail when run"
            );
            FetchParams::Invalid {
                reason: e.to_string(),
            }
        });

        Self {
            name: raw.name,
            source: raw.source,
            params,
        }
    }
}

// =============================================================================
// IngestionConfig
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawIngestionConfig {
    #[serde(default)]
    binance: Option<BinanceConfig>,
    #[serde(default)]
    file: Option<FileConfig>,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    runner: RunnerConfig,
    #[serde(default)]
    tasks: Vec<RawTaskConfig>,
}

/// Top-level configuration of an ingestion run.
#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub binance: Option<BinanceConfig>,
    pub file: Option<FileConfig>,
    pub logging: LoggingConfig,
    pub runner: RunnerConfig,
    /// Attempted in declaration order.
    pub tasks: Vec<TaskConfig>,
}

impl IngestionConfig {
    /// Config with the given tasks and default everything else.
    pub fn with_tasks(tasks: Vec<TaskConfig>) -> Self {
        Self {
            tasks,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_json_str(&content)?;

        info!(
            path = %path.display(),
            tasks = config.tasks.len(),
            binance = config.binance.is_some(),
            file = config.file.is_some(),
            "ingestion config loaded"
        );

        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawIngestionConfig = serde_json::from_str(content)?;

        let tasks: Vec<TaskConfig> = raw.tasks.into_iter().map(TaskConfig::from).collect();

        let config = Self {
            binance: raw.binance,
            file: raw.file,
            logging: raw.logging,
            runner: raw.runner,
            tasks,
        };
        config.validate()?;
        Ok(config)
    }

    /// Task names must be non-empty and unique: they key the result map.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (i, task) in self.tasks.iter().enumerate() {
            if task.name.trim().is_empty() {
                return Err(ConfigError::EmptyTaskName(i));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(ConfigError::DuplicateTask(task.name.clone()));
            }
        }
        Ok(())
    }
}
