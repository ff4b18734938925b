//! Alert sink.
//!
//! Unrecoverable step failures and destination timeouts are reported to an
//! external notification collaborator as a `(subject, body)` pair before
//! cleanup runs. Cancellation is never alerted. Delivery failures are logged
//! and otherwise ignored; they never block cleanup or lock release.

use crate::error::FailureKind;
use crate::ob::StepRef;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

/// External notification collaborator.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Structured alert content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: FailureKind,
    pub message: String,
    pub ob_identity: String,
    /// Step that failed, when the failure belongs to one.
    pub step: Option<StepRef>,
    /// Value waited for, for destination timeouts.
    pub expected: Option<String>,
    /// Last value observed, for destination timeouts.
    pub actual: Option<String>,
    /// Run the alert belongs to.
    pub run_uid: Uuid,
}

impl Alert {
    /// One-line subject, e.g. `[obseq] DestinationTimeout in calibration[0]`.
    pub fn subject(&self, prefix: &str) -> String {
        let mut subject = format!("{prefix} {}", self.kind);
        if let Some(step) = self.step {
            subject.push_str(&format!(" in {step}"));
        }
        subject.trim().to_string()
    }

    /// Plain text body with one `Field: value` line per item.
    pub fn body(&self) -> String {
        let mut body = format!(
            "Failure: {}\nMessage: {}\nObserving block: {}\nStep: {}\n",
            self.kind,
            self.message,
            self.ob_identity,
            self.step
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
        if let (Some(expected), Some(actual)) = (&self.expected, &self.actual) {
            body.push_str(&format!("Expected: {expected}\nActual: {actual}\n"));
        }
        body.push_str(&format!("Run: {}\n", self.run_uid));
        body
    }
}

/// Hand `alert` to `sink`. Returns whether delivery succeeded.
pub async fn dispatch(sink: &dyn AlertSink, alert: &Alert, subject_prefix: &str) -> bool {
    let subject = alert.subject(subject_prefix);
    match sink.send(&subject, &alert.body()).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, %subject, "Alert delivery failed");
            false
        }
    }
}

/// Logs alerts at error level. Used when no other sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        error!(alert = subject, body, "ALERT");
        Ok(())
    }
}

/// Records alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    sent: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl MemoryAlertSink {
    /// An empty sink that accepts every alert.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that records every alert and then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    /// `(subject, body)` of every alert received, oldest first.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn send(&self, subject: &str, body: &str) -> anyhow::Result<()> {
        self.sent.lock().push((subject.to_string(), body.to_string()));
        if self.fail {
            anyhow::bail!("alert transport unavailable");
        }
        Ok(())
    }
}
