//! Task metrics
//!
//! Prometheus collectors owned by one orchestrator, exported in text format
//! at `/metrics`.

use super::task::{OperationKind, TaskState};
use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

const NAMESPACE: &str = "brick_control_plane";

/// Counters and gauges for task execution
#[derive(Debug, Clone)]
pub struct TaskMetrics {
    registry: Registry,
    submitted: IntCounterVec,
    finished: IntCounterVec,
    step_retries: IntCounterVec,
    active: IntGauge,
}

impl TaskMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let submitted = IntCounterVec::new(
            Opts::new("tasks_submitted_total", "Tasks accepted by submit").namespace(NAMESPACE),
            &["operation"],
        )
        .map_err(metrics_error)?;
        let finished = IntCounterVec::new(
            Opts::new("tasks_finished_total", "Tasks that reached a terminal state")
                .namespace(NAMESPACE),
            &["operation", "state"],
        )
        .map_err(metrics_error)?;
        let step_retries = IntCounterVec::new(
            Opts::new("step_retries_total", "Step attempts retried after a transient error")
                .namespace(NAMESPACE),
            &["step"],
        )
        .map_err(metrics_error)?;
        let active = IntGauge::with_opts(
            Opts::new("tasks_active", "Tasks pending or running").namespace(NAMESPACE),
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(submitted.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(finished.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(step_retries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(active.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            submitted,
            finished,
            step_retries,
            active,
        })
    }

    pub fn task_submitted(&self, operation: OperationKind) {
        self.submitted
            .with_label_values(&[operation.as_str()])
            .inc();
        self.active.inc();
    }

    pub fn task_finished(&self, operation: OperationKind, state: TaskState) {
        self.finished
            .with_label_values(&[operation.as_str(), &state.to_string()])
            .inc();
        self.active.dec();
    }

    pub fn step_retried(&self, step: &str) {
        self.step_retries.with_label_values(&[step]).inc();
    }

    pub fn active(&self) -> i64 {
        self.active.get()
    }

    /// Render in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
