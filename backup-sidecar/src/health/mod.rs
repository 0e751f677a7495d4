//! Health reporting for an external liveness probe.

use crate::record::{BackupStatus, FailureReason};
use crate::scheduler::{ActiveJob, EngineStatus, JobOutcome};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub reasons: Vec<String>,
    pub last_job: Option<JobOutcome>,
    pub active_job: Option<ActiveJob>,
}

/// Pure health evaluation over an engine snapshot.
///
/// Unhealthy when nothing has finished (or started) within twice the
/// interval, or when one of the last `failure_window` outcomes is a quiesce
/// timeout or exhausted upload with no completed job after it.
pub fn evaluate(
    status: &EngineStatus,
    interval: Duration,
    failure_window: usize,
    now: DateTime<Utc>,
) -> HealthReport {
    let mut reasons = Vec::new();

    let reference = [
        status.last_finished.as_ref().map(|o| o.finished_at),
        status.active_job.as_ref().map(|j| j.started_at),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(status.started_at);

    let allowed = chrono::Duration::from_std(interval * 2).unwrap_or(chrono::Duration::MAX);
    if now - reference > allowed {
        reasons.push(format!(
            "no backup activity since {}",
            reference.to_rfc3339()
        ));
    }

    let skip = status.recent.len().saturating_sub(failure_window);
    let window: Vec<&JobOutcome> = status.recent.iter().skip(skip).collect();
    let last_critical = window.iter().rposition(|o| {
        matches!(
            o.failure,
            Some(FailureReason::QuiesceTimeout) | Some(FailureReason::UploadExhausted)
        )
    });
    if let Some(pos) = last_critical {
        let resolved = window[pos + 1..]
            .iter()
            .any(|o| o.status == BackupStatus::Completed);
        if !resolved {
            let outcome = window[pos];
            let reason = outcome
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default();
            reasons.push(format!("backup {} failed: {}", outcome.record_id, reason));
        }
    }

    HealthReport {
        healthy: reasons.is_empty(),
        reasons,
        last_job: status.last_finished.clone(),
        active_job: status.active_job.clone(),
    }
}

#[derive(Clone)]
pub struct HealthReporter {
    status: Arc<RwLock<EngineStatus>>,
    interval: Duration,
    failure_window: usize,
    hostname: String,
}

impl HealthReporter {
    pub fn new(status: Arc<RwLock<EngineStatus>>, interval: Duration, failure_window: usize) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            status,
            interval,
            failure_window,
            hostname,
        }
    }

    pub async fn report(&self) -> HealthReport {
        let status = self.status.read().await;
        evaluate(&status, self.interval, self.failure_window, Utc::now())
    }

    pub async fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.status.read().await.started_at
    }

    /// One line for chat and `/status`.
    pub async fn summary(&self) -> String {
        let report = self.report().await;
        let state = if report.healthy { "healthy" } else { "unhealthy" };
        let last = match &report.last_job {
            Some(job) => format!(
                "last backup {} ({}) {} at {}",
                job.record_id,
                job.kind,
                job.status,
                job.finished_at.format("%Y-%m-%d %H:%M:%S UTC")
            ),
            None => "no backup yet".to_string(),
        };
        let active = match &report.active_job {
            Some(job) => format!("; running {} ({})", job.record_id, job.status),
            None => String::new(),
        };
        let reasons = if report.reasons.is_empty() {
            String::new()
        } else {
            format!("; {}", report.reasons.join("; "))
        };
        format!("{}: {}{}{}", state, last, active, reasons)
    }
}

/// GET /health
async fn health(State(reporter): State<HealthReporter>) -> impl IntoResponse {
    let report = reporter.report().await;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let uptime = reporter.uptime().await;

    (
        code,
        Json(json!({
            "status": if report.healthy { "ok" } else { "unhealthy" },
            "version": env!("CARGO_PKG_VERSION"),
            "hostname": reporter.hostname,
            "uptime_secs": uptime.num_seconds(),
            "last_job": report.last_job,
            "active_job": report.active_job,
            "reasons": report.reasons,
        })),
    )
}

/// GET /status
async fn status(State(reporter): State<HealthReporter>) -> impl IntoResponse {
    reporter.summary().await
}

pub fn router(reporter: HealthReporter) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(reporter)
}
