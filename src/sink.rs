use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::engine::RawMatch;
use crate::error::SinkError;

/// Performance figures for one document (or one streaming session).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub matched_count: u64,
    pub processed_bytes: u64,
    pub duration_ms: f64,
    /// Megabits per second.
    pub throughput_mbps: f64,
    /// Fraction of the input consumed while skipping unselected values.
    pub skip_ratio: f64,
}

impl Stats {
    pub fn new(matched_count: u64, processed_bytes: u64, skipped_bytes: u64, elapsed: Duration) -> Self {
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let throughput_mbps = if duration_ms > 0.0 { (processed_bytes as f64 * 8.0) / (duration_ms * 1000.0) } else { 0.0 };
        let skip_ratio = if processed_bytes > 0 { skipped_bytes as f64 / processed_bytes as f64 } else { 0.0 };
        Self { matched_count, processed_bytes, duration_ms, throughput_mbps, skip_ratio }
    }
}

/// Receiver of query output.
///
/// Every handler is optional. Handlers are invoked in document order; the
/// runtime waits for all of them to settle before it calls `on_stats` and
/// `on_drain`.
#[async_trait]
pub trait Sink: Send + Sync {
    /// A projected record (materialize mode).
    async fn on_match(&self, _value: Value) -> Result<(), SinkError> {
        Ok(())
    }

    /// Source bytes of a matched leaf value (raw mode).
    async fn on_raw_match(&self, _raw: RawMatch) -> Result<(), SinkError> {
        Ok(())
    }

    async fn on_stats(&self, _stats: Stats) -> Result<(), SinkError> {
        Ok(())
    }

    /// Every callback for the document has settled.
    async fn on_drain(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Sink that stores everything it receives.
#[derive(Debug, Default)]
pub struct CollectSink {
    values: Mutex<Vec<Value>>,
    raw: Mutex<Vec<RawMatch>>,
    stats: Mutex<Option<Stats>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<Value> {
        self.values.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn raw(&self) -> Vec<RawMatch> {
        self.raw.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn stats(&self) -> Option<Stats> {
        self.stats.lock().ok().and_then(|s| *s)
    }
}

#[async_trait]
impl Sink for CollectSink {
    async fn on_match(&self, value: Value) -> Result<(), SinkError> {
        self.values.lock().map_err(|e| e.to_string())?.push(value);
        Ok(())
    }

    async fn on_raw_match(&self, raw: RawMatch) -> Result<(), SinkError> {
        self.raw.lock().map_err(|e| e.to_string())?.push(raw);
        Ok(())
    }

    async fn on_stats(&self, stats: Stats) -> Result<(), SinkError> {
        *self.stats.lock().map_err(|e| e.to_string())? = Some(stats);
        Ok(())
    }
}

/// Adapts a synchronous closure into a match-only sink.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: Fn(Value) -> Result<(), SinkError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Sink for FnSink<F>
where
    F: Fn(Value) -> Result<(), SinkError> + Send + Sync,
{
    async fn on_match(&self, value: Value) -> Result<(), SinkError> {
        (self.f)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_ratios() {
        let stats = Stats::new(3, 1000, 250, Duration::from_millis(2));
        assert_eq!(stats.matched_count, 3);
        assert!((stats.skip_ratio - 0.25).abs() < f64::EPSILON);
        assert!((stats.throughput_mbps - 4.0).abs() < 1e-9);
    }

    #[test]
    fn stats_without_input_are_zero() {
        let stats = Stats::new(0, 0, 0, Duration::ZERO);
        assert_eq!(stats.skip_ratio, 0.0);
        assert_eq!(stats.throughput_mbps, 0.0);
    }

    #[test]
    fn stats_serialize_camel_case() {
        let json = serde_json::to_value(Stats::new(1, 8, 0, Duration::ZERO)).unwrap();
        assert_eq!(json["matchedCount"], 1);
        assert_eq!(json["processedBytes"], 8);
        assert!(json.get("skipRatio").is_some());
    }
}
