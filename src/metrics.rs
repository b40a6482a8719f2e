//! Observability (§6 "Observability", SPEC_FULL A2/A3).
//!
//! Atomic counters matching the teacher's `Stats` (lock-free increments),
//! exposed by an `axum::Router` the same two-route shape as the teacher's
//! `api.rs` (`/health`, here also `/metrics` in Prometheus text format).

use axum::{ extract::State, response::IntoResponse, routing::get, Json, Router };
use std::collections::HashMap;
use std::sync::atomic::{ AtomicI64, AtomicU64, Ordering };
use std::sync::{ Arc, Mutex };
use tokio::net::TcpListener;
use tracing::info;

/// Lock-free call/provider/cache counters, process-wide.
#[derive(Debug)]
pub struct Metrics {
    pub calls_total: AtomicU64,
    pub calls_resolved: AtomicU64,
    pub calls_transferred: AtomicU64,
    pub calls_failed: AtomicU64,
    pub active_calls: AtomicI64,
    pub calls_rejected_cap: AtomicU64,
    pub tickets_inserted: AtomicU64,
    pub provider_requests: AtomicU64,
    pub provider_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    problem_type_counts: Mutex<HashMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls_total: AtomicU64::new(0),
            calls_resolved: AtomicU64::new(0),
            calls_transferred: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            active_calls: AtomicI64::new(0),
            calls_rejected_cap: AtomicU64::new(0),
            tickets_inserted: AtomicU64::new(0),
            provider_requests: AtomicU64::new(0),
            provider_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            problem_type_counts: Mutex::new(HashMap::new()),
        })
    }

    pub fn record_call_start(&self) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        self.active_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_call_end(&self, status: &str, problem_type: &str) {
        self.active_calls.fetch_sub(1, Ordering::Relaxed);
        match status {
            "resolved" => {
                self.calls_resolved.fetch_add(1, Ordering::Relaxed);
            }
            "transferred" => {
                self.calls_transferred.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.calls_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let mut counts = self.problem_type_counts.lock().unwrap();
        *counts.entry(problem_type.to_string()).or_insert(0) += 1;
    }

    pub fn record_cap_rejected(&self) {
        self.calls_rejected_cap.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ticket_inserted(&self) {
        self.tickets_inserted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_request(&self) {
        self.provider_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_provider_error(&self) {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Render counters in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("voicebot_calls_total {}\n", self.calls_total.load(Ordering::Relaxed)));
        out.push_str(&format!("voicebot_calls_resolved_total {}\n", self.calls_resolved.load(Ordering::Relaxed)));
        out.push_str(
            &format!("voicebot_calls_transferred_total {}\n", self.calls_transferred.load(Ordering::Relaxed))
        );
        out.push_str(&format!("voicebot_calls_failed_total {}\n", self.calls_failed.load(Ordering::Relaxed)));
        out.push_str(&format!("voicebot_active_calls {}\n", self.active_calls.load(Ordering::Relaxed)));
        out.push_str(
            &format!("voicebot_calls_rejected_cap_total {}\n", self.calls_rejected_cap.load(Ordering::Relaxed))
        );
        out.push_str(&format!("voicebot_tickets_inserted_total {}\n", self.tickets_inserted.load(Ordering::Relaxed)));
        out.push_str(
            &format!("voicebot_provider_requests_total {}\n", self.provider_requests.load(Ordering::Relaxed))
        );
        out.push_str(&format!("voicebot_provider_errors_total {}\n", self.provider_errors.load(Ordering::Relaxed)));
        out.push_str(&format!("voicebot_cache_hits_total {}\n", self.cache_hits.load(Ordering::Relaxed)));
        out.push_str(&format!("voicebot_cache_misses_total {}\n", self.cache_misses.load(Ordering::Relaxed)));
        for (problem_type, count) in self.problem_type_counts.lock().unwrap().iter() {
            out.push_str(&format!("voicebot_calls_by_problem_type{{problem_type=\"{problem_type}\"}} {count}\n"));
        }
        out
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_text(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    metrics.render_prometheus()
}

pub fn build_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .with_state(metrics)
}

pub async fn start_metrics_server(addr: &str, metrics: Arc<Metrics>) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = build_router(metrics);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics/health endpoint listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server error");
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_lifecycle_counts() {
        let m = Metrics::new();
        m.record_call_start();
        m.record_call_start();
        assert_eq!(m.active_calls.load(Ordering::Relaxed), 2);
        m.record_call_end("resolved", "mobile");
        assert_eq!(m.active_calls.load(Ordering::Relaxed), 1);
        assert_eq!(m.calls_resolved.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_render_prometheus_contains_counters() {
        let m = Metrics::new();
        m.record_call_start();
        let out = m.render_prometheus();
        assert!(out.contains("voicebot_calls_total 1"));
        assert!(out.contains("voicebot_active_calls 1"));
    }

    #[test]
    fn test_cap_rejection_does_not_touch_active_count() {
        let m = Metrics::new();
        m.record_call_start();
        m.record_cap_rejected();
        assert_eq!(m.active_calls.load(Ordering::Relaxed), 1);
        assert_eq!(m.calls_rejected_cap.load(Ordering::Relaxed), 1);
    }
}
