//! Scan-state detector
//!
//! Takes a fixed number of frequency samples and classifies the receiver as
//! locked (value steady) or scanning (value moving). A failed sample yields
//! `Unknown`, which callers treat as permission to proceed.

use crate::config::ScanConfig;
use crate::frequency::FrequencySource;
use std::time::Duration;
use tracing::debug;

/// Result of one classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Locked,
    Scanning,
    Unknown,
}

impl ScanState {
    /// Process exit code for the `scan-state` command
    pub fn exit_code(&self) -> u8 {
        match self {
            ScanState::Locked => 0,
            ScanState::Scanning => 1,
            ScanState::Unknown => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanState::Locked => "locked",
            ScanState::Scanning => "scanning",
            ScanState::Unknown => "unknown",
        }
    }

    /// Fail-open gate: only a positive scanning result blocks streaming
    pub fn allows_streaming(&self) -> bool {
        *self != ScanState::Scanning
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered window of readings taken for one classification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSample {
    pub values: Vec<f64>,
}

impl ScanSample {
    /// Number of adjacent pairs whose values differ
    pub fn transitions(&self) -> usize {
        self.values.windows(2).filter(|w| w[0] != w[1]).count()
    }

    pub fn classify(&self, threshold: usize) -> ScanState {
        if self.transitions() >= threshold {
            ScanState::Scanning
        } else {
            ScanState::Locked
        }
    }
}

/// Sampling parameters for one detector run
#[derive(Debug, Clone, Copy)]
pub struct Detector {
    pub samples: usize,
    pub delay: Duration,
    pub threshold: usize,
}

impl Detector {
    /// Low threshold used before a stream is started
    pub fn for_start(cfg: &ScanConfig) -> Self {
        Self::with_threshold(cfg, cfg.threshold_start)
    }

    /// More tolerant threshold used while a stream is running
    pub fn for_active(cfg: &ScanConfig) -> Self {
        Self::with_threshold(cfg, cfg.threshold_active)
    }

    pub fn with_threshold(cfg: &ScanConfig, threshold: usize) -> Self {
        Self {
            samples: cfg.samples.max(2),
            delay: Duration::from_millis(cfg.sample_delay_ms),
            threshold,
        }
    }

    /// Sample `source` and classify; any failed sample yields `Unknown`
    pub async fn detect<S: FrequencySource>(&self, source: &mut S) -> ScanState {
        let mut sample = ScanSample::default();

        for i in 0..self.samples {
            if i > 0 {
                tokio::time::sleep(self.delay).await;
            }
            match source.read().await {
                Ok(value) => sample.values.push(value),
                Err(e) => {
                    debug!(error = %e, sample = i, "Frequency sample failed");
                    return ScanState::Unknown;
                }
            }
        }

        let state = sample.classify(self.threshold);
        debug!(
            values = ?sample.values,
            transitions = sample.transitions(),
            threshold = self.threshold,
            %state,
            "Scan state classified"
        );
        state
    }
}
