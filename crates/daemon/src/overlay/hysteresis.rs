//! Stable/scanning tracking for the dynamic overlay
//!
//! Every change above the threshold clears the text and flips the state to
//! scanning at once; the state only returns to stable after the dwell time
//! passes without another such change.

use std::time::{Duration, Instant};

/// Derived receiver state shown next to the dynamic text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicState {
    Stable,
    Scanning,
}

impl DynamicState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DynamicState::Stable => "stable",
            DynamicState::Scanning => "scanning",
        }
    }
}

/// Transition reported by [`ScanTracker::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    /// Nothing changed
    None,
    /// A retune was seen while stable; the dynamic text must be cleared
    StartedScanning,
    /// Another retune while already scanning; the text is cleared again
    Retuned,
    /// The dwell time passed without a retune
    Settled,
}

impl TrackerEvent {
    /// Whether the dynamic text has to be cleared
    pub fn clears_text(&self) -> bool {
        matches!(self, TrackerEvent::StartedScanning | TrackerEvent::Retuned)
    }
}

#[derive(Debug, Clone)]
pub struct ScanTracker {
    threshold: f64,
    dwell: Duration,
    reference: Option<f64>,
    state: DynamicState,
    last_change: Option<Instant>,
}

impl ScanTracker {
    pub fn new(threshold: f64, dwell: Duration) -> Self {
        Self {
            threshold,
            dwell,
            reference: None,
            state: DynamicState::Stable,
            last_change: None,
        }
    }

    pub fn state(&self) -> DynamicState {
        self.state
    }

    /// Value the next observation is compared against
    pub fn reference(&self) -> Option<f64> {
        self.reference
    }

    /// Rebase on a value set externally without touching the state
    pub fn set_reference(&mut self, value: f64) {
        self.reference = Some(value);
    }

    pub fn observe(&mut self, value: f64, now: Instant) -> TrackerEvent {
        let jumped = self
            .reference
            .map(|prev| (value - prev).abs() > self.threshold)
            .unwrap_or(false);
        self.reference = Some(value);

        if jumped {
            self.last_change = Some(now);
            if self.state == DynamicState::Stable {
                self.state = DynamicState::Scanning;
                return TrackerEvent::StartedScanning;
            }
            return TrackerEvent::Retuned;
        }

        if self.state == DynamicState::Scanning {
            let quiet_since = self.last_change.unwrap_or(now);
            if now.saturating_duration_since(quiet_since) >= self.dwell {
                self.state = DynamicState::Stable;
                return TrackerEvent::Settled;
            }
        }

        TrackerEvent::None
    }
}
