use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
};

use voyage_common::types::{SyncFailureReason, SyncResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

#[derive(Default)]
pub struct RelayMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    sync_outcomes_total: Mutex<HashMap<String, u64>>,
}

const SYNC_OUTCOMES: [&str; 5] =
    ["applied", "conflicted", "lock_contention", "store_unavailable", "invalid"];
static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_request(operation: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(operation, is_error, latency_ms);
    }
}

pub fn record_sync_outcome(result: &SyncResult) {
    if let Some(metrics) = global_metrics() {
        metrics.record_sync_outcome(result);
    }
}

/// Empty exposition when no global registry was installed (tests).
pub fn render_global() -> String {
    global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default()
}

fn sync_outcome_label(result: &SyncResult) -> &'static str {
    match result.reason {
        None if result.has_conflicts() => "conflicted",
        None => "applied",
        Some(SyncFailureReason::LockContention) => "lock_contention",
        Some(SyncFailureReason::StoreUnavailable) => "store_unavailable",
        Some(SyncFailureReason::InvalidChangeSet) => "invalid",
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn record_ws_request(&self, operation: &str, is_error: bool, latency_ms: u64) {
        let normalized = normalize_ws_operation(operation);
        increment_label_counter(&self.ws_rate_total, &normalized, 1);
        increment_label_counter(&self.ws_duration_sum_ms, &normalized, latency_ms);
        increment_label_counter(&self.ws_duration_count, &normalized, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, &normalized, 1);
        }
    }

    pub fn record_sync_outcome(&self, result: &SyncResult) {
        increment_label_counter(&self.sync_outcomes_total, sync_outcome_label(result), 1);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE relay_request_rate_total counter\n");
        append_counter_lines(&mut output, "relay_request_rate_total", &self.request_rate_total);

        output.push_str("# HELP relay_request_errors_total Total HTTP error responses by endpoint.\n");
        output.push_str("# TYPE relay_request_errors_total counter\n");
        append_counter_lines(&mut output, "relay_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP relay_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_sum counter\n");
        append_counter_lines(&mut output, "relay_request_duration_ms_sum", &self.request_duration_sum_ms);

        output.push_str("# HELP relay_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE relay_request_duration_ms_count counter\n");
        append_counter_lines(&mut output, "relay_request_duration_ms_count", &self.request_duration_count);

        output.push_str("# HELP relay_ws_rate_total Total websocket operations by kind.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", "operation", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total failed websocket operations by kind.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", "operation", &self.ws_errors_total);

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket operation latency in milliseconds by kind.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(&mut output, "relay_ws_duration_ms_sum", "operation", &self.ws_duration_sum_ms);

        output.push_str("# HELP relay_ws_duration_ms_count Count of websocket latency samples by kind.\n");
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(&mut output, "relay_ws_duration_ms_count", "operation", &self.ws_duration_count);

        output.push_str("# HELP relay_sync_outcomes_total Change-set sync attempts by outcome.\n");
        output.push_str("# TYPE relay_sync_outcomes_total counter\n");
        append_sync_outcome_lines(&mut output, &self.sync_outcomes_total);

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    let mut normalized_segments = Vec::new();
    let mut previous: Option<&str> = None;
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        let is_identifier = uuid::Uuid::parse_str(segment).is_ok()
            || segment.chars().all(|character| character.is_ascii_digit())
            || previous.is_some_and(|parent| {
                matches!(parent, "state" | "history" | "user" | "itinerary" | "collaborators")
            })
            || (previous == Some("context") && !matches!(segment, "user" | "itinerary" | "preferences"))
            || (previous == Some("collaboration")
                && !matches!(segment, "sync" | "state" | "history"));

        normalized_segments.push(if is_identifier { "{id}" } else { segment });
        previous = Some(segment);
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_ws_operation(operation: &str) -> String {
    let normalized = operation.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(map: &Mutex<HashMap<EndpointMetricKey, u64>>, key: &EndpointMetricKey, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key.method.cmp(&right_key.method).then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn append_sync_outcome_lines(output: &mut String, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    for outcome in SYNC_OUTCOMES {
        let value = guard.get(outcome).copied().unwrap_or(0);
        output.push_str(&format!("relay_sync_outcomes_total{{outcome=\"{outcome}\"}} {value}\n"));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use voyage_common::types::{Conflict, SyncFailureReason, SyncResult};

    use super::{normalize_endpoint, RelayMetrics};

    #[test]
    fn render_prometheus_includes_red_and_sync_metrics() {
        let metrics = RelayMetrics::default();
        metrics.record_http_request("get", "/api/collaboration/state/trip-42", 200, 15);
        metrics.record_http_request("GET", "/api/collaboration/state/trip-7", 503, 25);
        metrics.record_ws_request("sync_change_set", false, 11);
        metrics.record_ws_request("sync_change_set", true, 19);
        metrics.record_sync_outcome(&SyncResult::applied(Vec::new(), json!({})));
        metrics.record_sync_outcome(&SyncResult::applied(
            vec![Conflict {
                field: "a".to_string(),
                expected: json!(1),
                actual: json!(2),
                attempted: json!(3),
            }],
            json!({}),
        ));
        metrics.record_sync_outcome(&SyncResult::failed(SyncFailureReason::LockContention));

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains(
            "relay_request_rate_total{method=\"GET\",endpoint=\"/api/collaboration/state/{id}\"} 2"
        ));
        assert!(rendered.contains(
            "relay_request_errors_total{method=\"GET\",endpoint=\"/api/collaboration/state/{id}\"} 1"
        ));
        assert!(rendered.contains("relay_ws_rate_total{operation=\"sync_change_set\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{operation=\"sync_change_set\"} 1"));
        assert!(rendered.contains("relay_ws_duration_ms_sum{operation=\"sync_change_set\"} 30"));
        assert!(rendered.contains("relay_sync_outcomes_total{outcome=\"applied\"} 1"));
        assert!(rendered.contains("relay_sync_outcomes_total{outcome=\"conflicted\"} 1"));
        assert!(rendered.contains("relay_sync_outcomes_total{outcome=\"lock_contention\"} 1"));
        assert!(rendered.contains("relay_sync_outcomes_total{outcome=\"store_unavailable\"} 0"));
    }

    #[test]
    fn endpoints_collapse_identifiers() {
        assert_eq!(normalize_endpoint("/api/collaboration/sync"), "/api/collaboration/sync");
        assert_eq!(normalize_endpoint("/api/collaboration/history/trip-1"), "/api/collaboration/history/{id}");
        assert_eq!(
            normalize_endpoint("/api/collaboration/trip-1/collaborators/bob"),
            "/api/collaboration/{id}/collaborators/{id}"
        );
        assert_eq!(normalize_endpoint("/api/context/user/alice"), "/api/context/user/{id}");
        assert_eq!(normalize_endpoint("/api/context/preferences"), "/api/context/preferences");
        assert_eq!(normalize_endpoint("/api/context/chat_alice_17"), "/api/context/{id}");
        assert_eq!(normalize_endpoint("/health"), "/health");
        assert_eq!(normalize_endpoint(""), "/");
    }
}
