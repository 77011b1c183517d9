use chrono::{DateTime, DurationRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::models::provider::{ContentType, GenerationRequest, GenerationResponse, UsageCounters};

const ERROR_KEY_LEN: usize = 120;
const TOP_ERRORS: usize = 5;
/// Distinct error texts kept per aggregate; the rarest is evicted first.
const MAX_ERROR_KEYS: usize = 32;
/// Distinct endpoint ids aggregated separately; the rest share one bucket.
const MAX_ENDPOINTS: usize = 64;
pub const OTHER_ENDPOINTS: &str = "(other)";
pub const MAX_RETENTION_HOURS: usize = 24 * 365 * 10;

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub max_history: usize,
    pub min_samples: u64,
    pub min_success_rate: f64,
    pub max_avg_latency: Duration,
    pub peak_load_ratio: f64,
    pub hourly_retention_hours: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_history: 10_000,
            min_samples: 10,
            min_success_rate: 0.8,
            max_avg_latency: Duration::from_secs(30),
            peak_load_ratio: 0.9,
            hourly_retention_hours: 168,
        }
    }
}

/// One completed gateway call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub endpoint: String,
    pub content_type: ContentType,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub success: bool,
    pub latency_ms: f64,
    pub tokens: u64,
    pub error: Option<String>,
}

impl AttemptRecord {
    pub fn from_response(request: &GenerationRequest, response: &GenerationResponse) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: request.id.clone(),
            endpoint: request.endpoint.clone(),
            content_type: request.content_type,
            provider: response.provider.clone(),
            model: response.model.clone(),
            success: response.success,
            latency_ms: response.elapsed_ms as f64,
            tokens: response.tokens_used,
            error: response.error.clone(),
        }
    }

    /// Aggregation key of the serving provider, e.g. `text:groq`.
    pub fn provider_key(&self) -> Option<String> {
        self.provider
            .as_ref()
            .map(|provider| format!("{}:{}", self.content_type, provider))
    }
}

#[derive(Debug, Default)]
struct Aggregate {
    counters: UsageCounters,
    models: HashMap<String, u64>,
    errors: HashMap<String, u64>,
}

impl Aggregate {
    fn record(&mut self, record: &AttemptRecord) {
        self.counters.record(
            record.success,
            Duration::from_secs_f64(record.latency_ms.max(0.0) / 1000.0),
            record.tokens,
        );
        if let Some(model) = &record.model {
            *self.models.entry(model.clone()).or_default() += 1;
        }
        if let Some(error) = &record.error {
            let key: String = error.chars().take(ERROR_KEY_LEN).collect();
            if !self.errors.contains_key(&key) && self.errors.len() >= MAX_ERROR_KEYS {
                let rarest = self
                    .errors
                    .iter()
                    .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
                    .map(|(k, _)| k.clone());
                if let Some(rarest) = rarest {
                    self.errors.remove(&rarest);
                }
            }
            *self.errors.entry(key).or_default() += 1;
        }
    }

    fn report(&self, name: &str) -> AggregateReport {
        let most_used_model = self
            .models
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(model, _)| model.clone());

        let mut top_errors: Vec<_> = self.errors.iter().map(|(e, n)| (e.clone(), *n)).collect();
        top_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_errors.truncate(TOP_ERRORS);

        AggregateReport {
            name: name.to_string(),
            total_requests: self.counters.total_requests,
            success_requests: self.counters.success_requests,
            fail_requests: self.counters.fail_requests,
            success_rate: self.counters.success_rate(),
            avg_latency_ms: self.counters.avg_latency_ms,
            total_tokens: self.counters.total_tokens,
            most_used_model,
            top_errors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub name: String,
    pub total_requests: u64,
    pub success_requests: u64,
    pub fail_requests: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub total_tokens: u64,
    pub most_used_model: Option<String>,
    pub top_errors: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBucket {
    pub hour: DateTime<Utc>,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_latency_ms: f64,
    pub tokens: u64,
}

impl HourlyBucket {
    fn new(hour: DateTime<Utc>) -> Self {
        Self {
            hour,
            requests: 0,
            successes: 0,
            failures: 0,
            avg_latency_ms: 0.0,
            tokens: 0,
        }
    }

    fn record(&mut self, record: &AttemptRecord) {
        self.requests += 1;
        if record.success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.tokens += record.tokens;
        self.avg_latency_ms += (record.latency_ms - self.avg_latency_ms) / self.requests as f64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendationKind {
    LowSuccessRate,
    HighLatency,
    NearPeakLoad,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub provider: String,
    pub kind: RecommendationKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Default)]
struct MetricsState {
    history: VecDeque<AttemptRecord>,
    providers: HashMap<String, Aggregate>,
    endpoints: HashMap<String, Aggregate>,
    hourly: BTreeMap<DateTime<Utc>, HourlyBucket>,
    provider_hourly: HashMap<String, BTreeMap<DateTime<Utc>, u64>>,
}

fn hour_of(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::hours(1)).unwrap_or(at)
}

/// Append-only recorder of completed calls with derived aggregates.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

impl MetricsCollector {
    pub fn new(mut config: MetricsConfig) -> Self {
        config.hourly_retention_hours = config.hourly_retention_hours.clamp(1, MAX_RETENTION_HOURS);
        Self {
            config,
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn record(&self, record: AttemptRecord) {
        let hour = hour_of(record.timestamp);
        let retention = chrono::Duration::hours(self.config.hourly_retention_hours as i64);
        let oldest_kept = hour - retention;

        let mut state = self.state.lock();

        if let Some(provider) = record.provider_key() {
            state
                .providers
                .entry(provider.clone())
                .or_default()
                .record(&record);
            let per_hour = state.provider_hourly.entry(provider).or_default();
            *per_hour.entry(hour).or_default() += 1;
            per_hour.retain(|h, _| *h > oldest_kept);
        }
        let endpoint = if state.endpoints.contains_key(&record.endpoint)
            || state.endpoints.len() < MAX_ENDPOINTS - 1
        {
            record.endpoint.clone()
        } else {
            OTHER_ENDPOINTS.to_string()
        };
        state.endpoints.entry(endpoint).or_default().record(&record);
        state
            .hourly
            .entry(hour)
            .or_insert_with(|| HourlyBucket::new(hour))
            .record(&record);
        state.hourly.retain(|h, _| *h > oldest_kept);

        debug!(
            "Recorded {} call for endpoint {} via {:?}",
            if record.success { "successful" } else { "failed" },
            record.endpoint,
            record.provider
        );

        state.history.push_back(record);
        while state.history.len() > self.config.max_history.max(1) {
            state.history.pop_front();
        }
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Most recent records first.
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        self.state.lock().history.iter().rev().take(n).cloned().collect()
    }

    pub fn provider_report(&self) -> BTreeMap<String, AggregateReport> {
        self.state
            .lock()
            .providers
            .iter()
            .map(|(name, agg)| (name.clone(), agg.report(name)))
            .collect()
    }

    pub fn endpoint_report(&self) -> BTreeMap<String, AggregateReport> {
        self.state
            .lock()
            .endpoints
            .iter()
            .map(|(name, agg)| (name.clone(), agg.report(name)))
            .collect()
    }

    pub fn hourly_trend(&self, hours: usize) -> Vec<HourlyBucket> {
        self.hourly_trend_at(Utc::now(), hours)
    }

    /// Buckets of the last `hours` hours ending at `now`, oldest first.
    /// Hours without traffic appear as empty buckets.
    pub fn hourly_trend_at(&self, now: DateTime<Utc>, hours: usize) -> Vec<HourlyBucket> {
        let current = hour_of(now);
        let state = self.state.lock();
        (0..hours as i64)
            .rev()
            .map(|back| {
                let hour = current - chrono::Duration::hours(back);
                state
                    .hourly
                    .get(&hour)
                    .cloned()
                    .unwrap_or_else(|| HourlyBucket::new(hour))
            })
            .collect()
    }

    pub fn recommendations(&self) -> Vec<Recommendation> {
        self.recommendations_at(Utc::now())
    }

    pub fn recommendations_at(&self, now: DateTime<Utc>) -> Vec<Recommendation> {
        let current = hour_of(now);
        let max_latency_ms = self.config.max_avg_latency.as_secs_f64() * 1000.0;
        let state = self.state.lock();
        let mut recommendations = Vec::new();

        let mut providers: Vec<_> = state.providers.iter().collect();
        providers.sort_by(|a, b| a.0.cmp(b.0));

        for (name, agg) in providers {
            let counters = &agg.counters;
            if counters.total_requests < self.config.min_samples {
                continue;
            }

            let success_rate = counters.success_rate();
            if success_rate < self.config.min_success_rate {
                recommendations.push(Recommendation {
                    provider: name.clone(),
                    kind: RecommendationKind::LowSuccessRate,
                    message: format!(
                        "Provider {} succeeds on {:.1}% of requests; consider lowering its priority or checking credentials",
                        name,
                        success_rate * 100.0
                    ),
                    value: success_rate,
                    threshold: self.config.min_success_rate,
                });
            }

            if counters.avg_latency_ms > max_latency_ms {
                recommendations.push(Recommendation {
                    provider: name.clone(),
                    kind: RecommendationKind::HighLatency,
                    message: format!(
                        "Provider {} averages {:.0} ms per request; consider a faster model or a shorter timeout",
                        name, counters.avg_latency_ms
                    ),
                    value: counters.avg_latency_ms,
                    threshold: max_latency_ms,
                });
            }

            if let Some(per_hour) = state.provider_hourly.get(name) {
                let peak = per_hour.values().copied().max().unwrap_or(0);
                let load = per_hour.get(&current).copied().unwrap_or(0);
                if per_hour.len() > 1 && peak > 0 && load as f64 >= peak as f64 * self.config.peak_load_ratio {
                    recommendations.push(Recommendation {
                        provider: name.clone(),
                        kind: RecommendationKind::NearPeakLoad,
                        message: format!(
                            "Provider {} is handling {} requests this hour against a peak of {}; consider raising its concurrency limit",
                            name, load, peak
                        ),
                        value: load as f64,
                        threshold: peak as f64 * self.config.peak_load_ratio,
                    });
                }
            }
        }

        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(at: DateTime<Utc>, provider: &str, model: &str, success: bool, latency_ms: f64) -> AttemptRecord {
        AttemptRecord {
            timestamp: at,
            request_id: "r".to_string(),
            endpoint: "lesson-plan".to_string(),
            content_type: ContentType::Text,
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            success,
            latency_ms,
            tokens: if success { 10 } else { 0 },
            error: (!success).then(|| "Upstream error 429: slow down".to_string()),
        }
    }

    #[test]
    fn test_history_is_bounded_ring() {
        let collector = MetricsCollector::new(MetricsConfig {
            max_history: 3,
            ..MetricsConfig::default()
        });
        let now = Utc::now();
        for i in 0..5 {
            let mut r = record(now, "groq", "m", true, 10.0);
            r.request_id = i.to_string();
            collector.record(r);
        }

        assert_eq!(collector.history_len(), 3);
        let recent = collector.recent(2);
        assert_eq!(recent[0].request_id, "4");
        assert_eq!(recent[1].request_id, "3");
    }

    #[test]
    fn test_provider_and_endpoint_aggregates() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        collector.record(record(now, "groq", "big", true, 100.0));
        collector.record(record(now, "groq", "big", true, 300.0));
        collector.record(record(now, "groq", "small", false, 200.0));

        let report = &collector.provider_report()["text:groq"];
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.fail_requests, 1);
        assert_eq!(report.most_used_model.as_deref(), Some("big"));
        assert!((report.avg_latency_ms - 200.0).abs() < 1e-6);
        assert_eq!(report.top_errors[0].1, 1);

        let endpoint = &collector.endpoint_report()["lesson-plan"];
        assert_eq!(endpoint.total_requests, 3);
        assert_eq!(endpoint.total_tokens, 20);
    }

    #[test]
    fn test_hourly_trend_fills_gaps() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        collector.record(record(now - chrono::Duration::hours(2), "groq", "m", true, 50.0));
        collector.record(record(now, "groq", "m", false, 50.0));

        let trend = collector.hourly_trend_at(now, 3);
        assert_eq!(trend.len(), 3);
        assert_eq!(trend[0].requests, 1);
        assert_eq!(trend[1].requests, 0);
        assert_eq!(trend[2].failures, 1);
    }

    #[test]
    fn test_recommendations_flag_unhealthy_provider() {
        let collector = MetricsCollector::new(MetricsConfig {
            min_samples: 4,
            max_avg_latency: Duration::from_secs(1),
            ..MetricsConfig::default()
        });
        let now = Utc::now();
        for _ in 0..3 {
            collector.record(record(now, "slow", "m", false, 5000.0));
        }
        collector.record(record(now, "slow", "m", true, 5000.0));
        for _ in 0..3 {
            collector.record(record(now, "small", "m", false, 10.0));
        }

        let recs = collector.recommendations_at(now);
        let kinds: Vec<_> = recs.iter().map(|r| (r.provider.as_str(), r.kind)).collect();
        assert!(kinds.contains(&("text:slow", RecommendationKind::LowSuccessRate)));
        assert!(kinds.contains(&("text:slow", RecommendationKind::HighLatency)));
        assert!(kinds.iter().all(|(p, _)| *p != "text:small"));
    }

    #[test]
    fn test_near_peak_load() {
        let collector = MetricsCollector::new(MetricsConfig {
            min_samples: 1,
            ..MetricsConfig::default()
        });
        let now = Utc::now();
        let earlier = now - chrono::Duration::hours(3);
        for _ in 0..10 {
            collector.record(record(earlier, "groq", "m", true, 10.0));
        }
        for _ in 0..9 {
            collector.record(record(now, "groq", "m", true, 10.0));
        }

        let recs = collector.recommendations_at(now);
        assert!(recs
            .iter()
            .any(|r| r.provider == "text:groq" && r.kind == RecommendationKind::NearPeakLoad));
    }

    #[test]
    fn test_same_name_across_content_types_kept_apart() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        collector.record(record(now, "together", "m", true, 10.0));
        let mut image = record(now, "together", "flux", true, 10.0);
        image.content_type = ContentType::Image;
        collector.record(image);

        let report = collector.provider_report();
        assert_eq!(report["text:together"].total_requests, 1);
        assert_eq!(report["image:together"].most_used_model.as_deref(), Some("flux"));
    }

    #[test]
    fn test_distinct_errors_and_endpoints_stay_bounded() {
        let collector = MetricsCollector::default();
        let now = Utc::now();
        for _ in 0..3 {
            collector.record(record(now, "groq", "m", false, 10.0));
        }
        for i in 0..500 {
            let mut r = record(now, "groq", "m", false, 10.0);
            r.error = Some(format!("Upstream error 500: request id req-{i}"));
            r.endpoint = format!("endpoint-{i}");
            collector.record(r);
        }

        let state = collector.state.lock();
        assert!(state.providers["text:groq"].errors.len() <= MAX_ERROR_KEYS);
        assert!(state.endpoints.len() <= MAX_ENDPOINTS);
        assert!(state.endpoints.contains_key(OTHER_ENDPOINTS));
        drop(state);

        let report = &collector.provider_report()["text:groq"];
        assert_eq!(report.total_requests, 503);
        assert_eq!(report.top_errors[0], ("Upstream error 429: slow down".to_string(), 3));
    }

    #[test]
    fn test_huge_retention_is_clamped() {
        let collector = MetricsCollector::new(MetricsConfig {
            hourly_retention_hours: usize::MAX,
            ..MetricsConfig::default()
        });
        let now = Utc::now();
        collector.record(record(now, "groq", "m", true, 10.0));
        assert_eq!(collector.hourly_trend_at(now, 1)[0].requests, 1);
    }
}
