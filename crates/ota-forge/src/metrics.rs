use std::process::Command;
use std::time::Duration;

use tracing::warn;

use crate::process::run_checked;

const LOG_NAME: &str = "ota-forge-builds";

/// Metric reporting seam. All methods are best-effort by contract; a metric
/// failure must never change the pipeline outcome.
pub trait MetricSink: Send + Sync {
    /// Report a fatal failure tagged with a short fixed reason string.
    fn failure(&self, device: &str, reason: &str);

    fn success(&self, device: &str, elapsed: Duration);
}

pub struct NoopMetrics;

impl MetricSink for NoopMetrics {
    fn failure(&self, _device: &str, _reason: &str) {}
    fn success(&self, _device: &str, _elapsed: Duration) {}
}

/// Writes structured entries to Cloud Logging via the `gcloud` CLI, from
/// which alerting policies pick them up.
pub struct CloudLoggingMetrics {
    pub project: String,
    pub timeout: Duration,
}

impl CloudLoggingMetrics {
    fn write(&self, severity: &str, payload: serde_json::Value) {
        let body = payload.to_string();
        let mut cmd = Command::new("gcloud");
        cmd.arg("logging")
            .arg("write")
            .arg(LOG_NAME)
            .arg(&body)
            .arg("--payload-type=json")
            .arg(format!("--severity={severity}"))
            .arg(format!("--project={}", self.project));
        if let Err(e) = run_checked(cmd, self.timeout) {
            warn!(error = %e, "failed to emit metric, continuing");
        }
    }
}

impl MetricSink for CloudLoggingMetrics {
    fn failure(&self, device: &str, reason: &str) {
        self.write(
            "ERROR",
            serde_json::json!({
                "event": "build_failed",
                "device": device,
                "reason": reason,
            }),
        );
    }

    fn success(&self, device: &str, elapsed: Duration) {
        self.write(
            "INFO",
            serde_json::json!({
                "event": "build_succeeded",
                "device": device,
                "elapsed_secs": elapsed.as_secs(),
            }),
        );
    }
}
