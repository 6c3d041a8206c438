//! Usage accounting
//!
//! Every request that reports token usage produces exactly one record. Sinks
//! are shared across concurrent requests and must be cheap to call.

use crate::models::Usage;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info};

/// Where a request came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Api,
    Private,
    Group,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Api => "api",
            Channel::Private => "private",
            Channel::Group => "group",
        };
        f.write_str(name)
    }
}

/// Per-request attribution passed alongside usage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageContext {
    pub channel: Channel,
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

impl UsageContext {
    pub fn new(channel: Channel, model_id: impl Into<String>) -> Self {
        Self {
            channel,
            model_id: model_id.into(),
            room_id: None,
        }
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }
}

/// Receives one record per usage-reporting request
pub trait UsageSink: Send + Sync {
    fn record(&self, usage: &Usage, context: &UsageContext);
}

/// Emits a structured log line per record
#[derive(Debug, Default)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, usage: &Usage, context: &UsageContext) {
        info!(
            channel = %context.channel,
            model = %context.model_id,
            room = context.room_id.as_deref().unwrap_or("-"),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "📊 Usage recorded"
        );
    }
}

/// Running totals for one model
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl UsageTotals {
    fn add(&mut self, usage: &Usage) {
        self.requests += 1;
        self.prompt_tokens += u64::from(usage.prompt_tokens);
        self.completion_tokens += u64::from(usage.completion_tokens);
    }
}

/// Concurrent in-memory per-model totals
#[derive(Debug, Default)]
pub struct UsageLedger {
    totals: DashMap<String, UsageTotals>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn totals_for(&self, model_id: &str) -> Option<UsageTotals> {
        self.totals.get(model_id).map(|entry| *entry)
    }

    /// Snapshot of all totals, sorted by model id
    pub fn snapshot(&self) -> Vec<(String, UsageTotals)> {
        let mut rows: Vec<_> = self
            .totals
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }
}

impl UsageSink for UsageLedger {
    fn record(&self, usage: &Usage, context: &UsageContext) {
        self.totals
            .entry(context.model_id.clone())
            .or_default()
            .add(usage);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UsageLine<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    context: &'a UsageContext,
    #[serde(flatten)]
    usage: &'a Usage,
}

/// Appends one JSON object per record to a file
pub struct JsonlUsageSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlUsageSink {
    /// Open (creating parents) the log at `path`; `~/` is expanded
    pub fn open(path: &str) -> std::io::Result<Self> {
        let path = expand_tilde(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("📝 Usage log enabled: {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UsageSink for JsonlUsageSink {
    fn record(&self, usage: &Usage, context: &UsageContext) {
        let line = UsageLine {
            ts: Utc::now(),
            context,
            usage,
        };
        let Ok(json) = serde_json::to_string(&line) else {
            return;
        };

        if let Ok(mut file) = self.file.lock() {
            if let Err(e) = writeln!(file, "{}", json) {
                error!("Failed to write usage log: {}", e);
            }
        }
    }
}

/// Forwards every record to each inner sink
#[derive(Default)]
pub struct FanoutUsageSink {
    sinks: Vec<Arc<dyn UsageSink>>,
}

impl FanoutUsageSink {
    pub fn new(sinks: Vec<Arc<dyn UsageSink>>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn UsageSink>) {
        self.sinks.push(sink);
    }
}

impl UsageSink for FanoutUsageSink {
    fn record(&self, usage: &Usage, context: &UsageContext) {
        for sink in &self.sinks {
            sink.record(usage, context);
        }
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink(AtomicUsize);

    impl UsageSink for CountingSink {
        fn record(&self, _usage: &Usage, _context: &UsageContext) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_ledger_accumulates_per_model() {
        let ledger = UsageLedger::new();
        let ctx = UsageContext::new(Channel::Api, "gpt-4o");
        ledger.record(&Usage::new(10, 5), &ctx);
        ledger.record(&Usage::new(1, 2), &ctx);
        ledger.record(&Usage::new(3, 3), &UsageContext::new(Channel::Group, "llama"));

        let totals = ledger.totals_for("gpt-4o").unwrap();
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.prompt_tokens, 11);
        assert_eq!(totals.completion_tokens, 7);

        let names: Vec<_> = ledger.snapshot().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["gpt-4o", "llama"]);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usage.jsonl");
        let sink = JsonlUsageSink::open(path.to_str().unwrap()).unwrap();

        let ctx = UsageContext::new(Channel::Private, "sonnet").with_room("room-7");
        sink.record(&Usage::new(4, 2), &ctx);
        sink.record(&Usage::new(1, 1), &UsageContext::new(Channel::Api, "sonnet"));

        let content = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["channel"], "private");
        assert_eq!(lines[0]["roomId"], "room-7");
        assert_eq!(lines[0]["promptTokens"], 4);
        assert!(lines[0]["ts"].is_string());
        assert!(lines[1].get("roomId").is_none());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(CountingSink(AtomicUsize::new(0)));
        let b = Arc::new(UsageLedger::new());
        let fanout = FanoutUsageSink::new(vec![a.clone(), b.clone()]);

        fanout.record(&Usage::new(1, 1), &UsageContext::new(Channel::Api, "m"));
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.totals_for("m").unwrap().requests, 1);
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/tmp/u.jsonl"), PathBuf::from("/tmp/u.jsonl"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/u.jsonl"), home.join("u.jsonl"));
        }
    }
}
