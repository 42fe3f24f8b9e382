use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
pub static FORWARD_AUTH_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static IMPERSONATION_AUDIT_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Build and register every collector. Safe to call more than once; only the
/// first call installs the globals.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    static INIT: Mutex<()> = Mutex::new(());
    let _guard = INIT.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = IntCounterVec::new(
        Opts::new("http_requests_total", "Total number of HTTP requests"),
        &["method", "path", "status"],
    )?;
    let request_duration = HistogramVec::new(
        HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request duration in seconds",
        ),
        &["method", "path", "status"],
    )?;
    let forward_auth = IntCounterVec::new(
        Opts::new(
            "forward_auth_decisions_total",
            "Forward-auth decisions by outcome",
        ),
        &["decision"],
    )?;
    let audit_failures = IntCounter::new(
        "impersonation_audit_failures_total",
        "Impersonation audit rows that could not be written",
    )?;

    registry.register(Box::new(requests_total.clone()))?;
    registry.register(Box::new(request_duration.clone()))?;
    registry.register(Box::new(forward_auth.clone()))?;
    registry.register(Box::new(audit_failures.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = HTTP_REQUESTS_TOTAL.set(requests_total);
    let _ = HTTP_REQUEST_DURATION_SECONDS.set(request_duration);
    let _ = FORWARD_AUTH_DECISIONS_TOTAL.set(forward_auth);
    let _ = IMPERSONATION_AUDIT_FAILURES_TOTAL.set(audit_failures);
    Ok(())
}

pub fn record_http_request(method: &str, path: &str, status: u16, seconds: f64) {
    let status = status.to_string();
    if let Some(counter) = HTTP_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, path, &status]).inc();
    }
    if let Some(histogram) = HTTP_REQUEST_DURATION_SECONDS.get() {
        histogram
            .with_label_values(&[method, path, &status])
            .observe(seconds);
    }
}

pub fn record_forward_auth(decision: &str) {
    if let Some(counter) = FORWARD_AUTH_DECISIONS_TOTAL.get() {
        counter.with_label_values(&[decision]).inc();
    }
}

pub fn record_audit_failure() {
    if let Some(counter) = IMPERSONATION_AUDIT_FAILURES_TOTAL.get() {
        counter.inc();
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to UTF-8: {}", e);
        format!("# Failed to convert metrics to UTF-8: {}\n", e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions_show_up_in_exposition() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        record_forward_auth("allow");
        record_audit_failure();

        let text = get_metrics();
        assert!(text.contains("forward_auth_decisions_total{decision=\"allow\"}"));
        assert!(text.contains("impersonation_audit_failures_total"));
    }
}
