//! Device bus adapter.
//!
//! The device bus is the external channel through which individual hardware
//! set-points are read and written. This module only defines the interface the
//! sequencer relies on; the wire protocol of a real bus lives outside the crate.
//!
//! # Contract
//!
//! - [`DeviceBus::read`] returns the current value of a named control point.
//! - [`DeviceBus::write`] sets a control point, optionally blocking until the bus
//!   acknowledges the write.
//! - [`DeviceBus::wait_for`] polls a control point until a predicate holds or the
//!   timeout expires. The default implementation is built on [`poll::poll_until`],
//!   the single bounded polling primitive shared with the orchestrator.
//!
//! Control points follow a simple naming convention: a command point `X` reports
//! its achieved state on the readback point `X.rb`. See [`points`].
//!
//! # Implementations
//!
//! - [`mock::MockBus`] - In-memory bus with call logging and failure injection
//! - [`sim::SimulatedInstrument`] - Installs instrument-like behaviour on a `MockBus`

pub mod mock;
pub mod points;
pub mod poll;
pub mod sim;

pub use mock::{BusCall, MockBus};
pub use poll::poll_until;
pub use sim::SimulatedInstrument;

use crate::error::SequencerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default interval between polls of a control point.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Value carried by a control point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl BusValue {
    /// Empty text, used for cleared control points.
    pub fn empty() -> Self {
        BusValue::Text(String::new())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            BusValue::Bool(b) => Some(*b),
            BusValue::Int(i) => Some(*i != 0),
            BusValue::Text(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Some(true),
                "false" | "no" | "off" | "0" | "" => Some(false),
                _ => None,
            },
            BusValue::Float(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(i) => Some(*i),
            BusValue::Bool(b) => Some(i64::from(*b)),
            BusValue::Text(s) => s.trim().parse().ok(),
            BusValue::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Float(f) => Some(*f),
            BusValue::Int(i) => Some(*i as f64),
            BusValue::Text(s) => s.trim().parse().ok(),
            BusValue::Bool(_) => None,
        }
    }

    pub fn as_text(&self) -> String {
        self.to_string()
    }

    /// True for empty text, the representation of an unset string point.
    pub fn is_empty(&self) -> bool {
        matches!(self, BusValue::Text(s) if s.trim().is_empty())
    }

    /// Loose comparison used by postconditions.
    ///
    /// Numbers compare with a small tolerance, text compares case-insensitively and
    /// booleans accept their textual forms.
    pub fn matches(&self, expected: &BusValue) -> bool {
        match expected {
            BusValue::Bool(b) => self.as_bool() == Some(*b),
            BusValue::Int(i) => self.as_i64() == Some(*i),
            BusValue::Float(f) => self
                .as_f64()
                .map(|v| (v - f).abs() <= 1e-6 * f.abs().max(1.0))
                .unwrap_or(false),
            BusValue::Text(s) => self.as_text().trim().eq_ignore_ascii_case(s.trim()),
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Bool(b) => write!(f, "{b}"),
            BusValue::Int(i) => write!(f, "{i}"),
            BusValue::Float(v) => write!(f, "{v}"),
            BusValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for BusValue {
    fn from(value: bool) -> Self {
        BusValue::Bool(value)
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        BusValue::Int(value)
    }
}

impl From<u32> for BusValue {
    fn from(value: u32) -> Self {
        BusValue::Int(i64::from(value))
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        BusValue::Float(value)
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Text(value.to_string())
    }
}

impl From<String> for BusValue {
    fn from(value: String) -> Self {
        BusValue::Text(value)
    }
}

/// Predicate evaluated against a control point value.
pub type BusPredicate<'a> = &'a (dyn Fn(&BusValue) -> bool + Send + Sync);

/// Access to named control points on the instrument.
///
/// All synchronization in the sequencer is expressed through bounded polling
/// against this interface; no push mechanism is required.
#[async_trait]
pub trait DeviceBus: Send + Sync {
    /// Read the current value of `point`.
    async fn read(&self, point: &str) -> SequencerResult<BusValue>;

    /// Write `value` to `point`. With `wait` set, block until the bus
    /// acknowledges the write.
    async fn write(&self, point: &str, value: BusValue, wait: bool) -> SequencerResult<()>;

    /// Interval used by the default [`DeviceBus::wait_for`].
    fn poll_interval(&self) -> Duration {
        DEFAULT_POLL_INTERVAL
    }

    /// Poll `point` until `predicate` holds. Returns `false` on timeout.
    async fn wait_for(
        &self,
        point: &str,
        predicate: BusPredicate<'_>,
        timeout: Duration,
    ) -> SequencerResult<bool> {
        let hit = poll_until(timeout, self.poll_interval(), || async move {
            let value = self.read(point).await?;
            Ok(predicate(&value).then_some(()))
        })
        .await?;
        Ok(hit.is_some())
    }
}
