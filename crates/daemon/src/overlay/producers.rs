//! Background loops feeding the overlay channels

use crate::frequency::{format_frequency, parse_frequency, FrequencySource};
use crate::overlay::channel::{ChannelPaths, OverlayChannel};
use crate::overlay::hysteresis::{ScanTracker, TrackerEvent};
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cadence matching the drawtext reload period
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(2);

/// Publishes the current frequency as overlay text
pub struct FrequencyProducer {
    channel: OverlayChannel,
}

impl FrequencyProducer {
    pub fn new(paths: &ChannelPaths) -> Self {
        Self {
            channel: OverlayChannel::new("frequency", &paths.frequency),
        }
    }

    /// Publish a reading; a missing one leaves the displayed value in place
    pub fn update(&self, reading: Option<f64>) -> io::Result<bool> {
        match reading {
            Some(value) => {
                self.channel.publish(&format_frequency(value))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Maintains the dynamic text and the stable/scanning indicator
pub struct DynamicProducer {
    tracker: ScanTracker,
    dynamic: OverlayChannel,
    scan_state: OverlayChannel,
    reference: OverlayChannel,
}

impl DynamicProducer {
    pub fn new(paths: &ChannelPaths, threshold: f64, dwell: Duration) -> Self {
        Self {
            tracker: ScanTracker::new(threshold, dwell),
            dynamic: OverlayChannel::new("dynamic", &paths.dynamic),
            scan_state: OverlayChannel::new("scan_state", &paths.scan_state),
            reference: OverlayChannel::new("dynamic_reference", &paths.dynamic_reference),
        }
    }

    pub fn tracker(&self) -> &ScanTracker {
        &self.tracker
    }

    /// Pick up a reference written by `set_dynamic_text` from another process
    fn sync_reference(&mut self) {
        let external = self
            .reference
            .read()
            .ok()
            .flatten()
            .and_then(|text| parse_frequency(&text));
        if let Some(value) = external {
            if self.tracker.reference() != Some(value) {
                self.tracker.set_reference(value);
            }
        }
    }

    /// Feed one reading; a missing one leaves the state unchanged
    pub fn update(&mut self, reading: Option<f64>, now: Instant) -> io::Result<TrackerEvent> {
        self.sync_reference();

        let Some(value) = reading else {
            return Ok(TrackerEvent::None);
        };

        let event = self.tracker.observe(value, now);
        if event.clears_text() {
            info!(value, ?event, "Frequency changed, clearing dynamic overlay");
            self.dynamic.publish("")?;
        } else if event == TrackerEvent::Settled {
            info!(value, "Frequency settled");
        }

        self.reference.publish(&value.to_string())?;
        self.scan_state.publish(self.tracker.state().as_str())?;
        Ok(event)
    }
}

/// Reads the frequency once per tick and feeds every enabled producer
///
/// A single reader keeps the producers from competing for the acquisition
/// lock of the sniffing source.
pub struct OverlayProducers<S> {
    source: S,
    frequency: Option<FrequencyProducer>,
    dynamic: Option<DynamicProducer>,
}

impl<S: FrequencySource> OverlayProducers<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            frequency: None,
            dynamic: None,
        }
    }

    pub fn with_frequency(mut self, producer: FrequencyProducer) -> Self {
        self.frequency = Some(producer);
        self
    }

    pub fn with_dynamic(mut self, producer: DynamicProducer) -> Self {
        self.dynamic = Some(producer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.frequency.is_none() && self.dynamic.is_none()
    }

    pub fn dynamic(&self) -> Option<&DynamicProducer> {
        self.dynamic.as_ref()
    }

    /// One reading fanned out to the producers
    pub async fn tick(&mut self, now: Instant) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let reading = match self.source.read().await {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(error = %e, "Frequency unavailable, keeping overlay values");
                None
            }
        };

        if let Some(producer) = &self.frequency {
            if let Err(e) = producer.update(reading) {
                warn!(error = %e, "Failed to publish frequency overlay");
            }
        }
        if let Some(producer) = &mut self.dynamic {
            if let Err(e) = producer.update(reading, now) {
                warn!(error = %e, "Failed to publish dynamic overlay");
            }
        }
        reading
    }

    pub async fn run(mut self) {
        let mut channels = Vec::new();
        if let Some(p) = &self.frequency {
            channels.push(&p.channel);
        }
        if let Some(p) = &self.dynamic {
            channels.extend([&p.dynamic, &p.scan_state]);
        }
        for channel in channels {
            if let Err(e) = channel.ensure_exists() {
                warn!(error = %e, channel = channel.name(), "Cannot create overlay channel");
            }
        }

        let mut interval = tokio::time::interval(UPDATE_INTERVAL);
        loop {
            interval.tick().await;
            self.tick(Instant::now()).await;
        }
    }
}

/// Replace the dynamic text without restarting the stream
///
/// Recording the current frequency as reference keeps the producer from
/// treating the next reading as a retune and clearing the new text.
pub fn set_dynamic_text(paths: &ChannelPaths, text: &str, current: Option<f64>) -> io::Result<()> {
    OverlayChannel::new("dynamic", &paths.dynamic).publish(text)?;
    if let Some(value) = current {
        OverlayChannel::new("dynamic_reference", &paths.dynamic_reference)
            .publish(&value.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frequency::FrequencyError;
    use crate::scan_state::tests::ScriptedSource;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn read(path: &std::path::Path) -> String {
        fs::read_to_string(path).unwrap().trim_end().to_string()
    }

    /// Scripted readings behind a single-flight guard, like the sniffing
    /// source: a read started while another is in flight fails with `Busy`
    #[derive(Clone)]
    struct SingleFlightSource {
        held: Arc<AtomicBool>,
        readings: Arc<std::sync::Mutex<ScriptedSource>>,
    }

    impl SingleFlightSource {
        fn new(readings: &[Option<f64>]) -> Self {
            Self {
                held: Arc::new(AtomicBool::new(false)),
                readings: Arc::new(std::sync::Mutex::new(ScriptedSource::new(readings))),
            }
        }
    }

    impl FrequencySource for SingleFlightSource {
        async fn read(&mut self) -> Result<f64, FrequencyError> {
            if self.held.swap(true, Ordering::SeqCst) {
                return Err(FrequencyError::Busy);
            }
            tokio::task::yield_now().await;
            let next = self.readings.lock().unwrap().readings.pop_front().flatten();
            self.held.store(false, Ordering::SeqCst);
            next.ok_or(FrequencyError::NoValue)
        }
    }

    fn both(paths: &ChannelPaths, source: SingleFlightSource) -> OverlayProducers<SingleFlightSource> {
        OverlayProducers::new(source)
            .with_frequency(FrequencyProducer::new(paths))
            .with_dynamic(DynamicProducer::new(paths, 5.0, Duration::from_secs(5)))
    }

    #[test]
    fn test_frequency_producer_keeps_value_on_failure() {
        let dir = TempDir::new().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let producer = FrequencyProducer::new(&paths);

        assert!(producer.update(Some(5800.0)).unwrap());
        assert_eq!(read(&paths.frequency), "5800 MHz");

        assert!(!producer.update(None).unwrap());
        assert_eq!(read(&paths.frequency), "5800 MHz");

        assert!(producer.update(Some(5865.0)).unwrap());
        assert_eq!(read(&paths.frequency), "5865 MHz");
    }

    #[test]
    fn test_dynamic_producer_clears_text_on_retune() {
        let dir = TempDir::new().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        set_dynamic_text(&paths, "Target A", None).unwrap();

        let mut producer = DynamicProducer::new(&paths, 5.0, Duration::from_secs(5));
        let t0 = Instant::now();

        producer.update(Some(5800.0), t0).unwrap();
        producer.update(Some(5800.0), t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(read(&paths.dynamic), "Target A");
        assert_eq!(read(&paths.scan_state), "stable");

        let event = producer.update(Some(5900.0), t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(event, TrackerEvent::StartedScanning);
        assert_eq!(read(&paths.dynamic), "");
        assert_eq!(read(&paths.scan_state), "scanning");
        assert_eq!(read(&paths.dynamic_reference), "5900");
    }

    #[test]
    fn test_text_set_while_scanning_cleared_by_next_retune() {
        let dir = TempDir::new().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let mut producer = DynamicProducer::new(&paths, 5.0, Duration::from_secs(5));
        let t0 = Instant::now();

        producer.update(Some(5800.0), t0).unwrap();
        producer.update(Some(5900.0), t0 + Duration::from_secs(2)).unwrap();
        set_dynamic_text(&paths, "Target C", None).unwrap();

        let event = producer.update(Some(6000.0), t0 + Duration::from_secs(4)).unwrap();
        assert_eq!(event, TrackerEvent::Retuned);
        assert_eq!(read(&paths.dynamic), "");
        assert_eq!(read(&paths.scan_state), "scanning");
    }

    #[test]
    fn test_set_text_reference_prevents_clear() {
        let dir = TempDir::new().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let mut producer = DynamicProducer::new(&paths, 5.0, Duration::from_secs(5));
        let t0 = Instant::now();
        producer.update(Some(5800.0), t0).unwrap();

        // Operator retunes to 5900 and sets text against it
        set_dynamic_text(&paths, "Target B", Some(5900.0)).unwrap();
        let event = producer.update(Some(5900.0), t0 + Duration::from_secs(2)).unwrap();

        assert_eq!(event, TrackerEvent::None);
        assert_eq!(read(&paths.dynamic), "Target B");
        assert_eq!(read(&paths.scan_state), "stable");
    }

    #[test]
    fn test_dynamic_producer_failure_leaves_state() {
        let dir = TempDir::new().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        let mut producer = DynamicProducer::new(&paths, 5.0, Duration::from_secs(5));

        assert_eq!(producer.update(None, Instant::now()).unwrap(), TrackerEvent::None);
        assert!(!paths.scan_state.exists());
        assert_eq!(producer.tracker().reference(), None);
    }

    #[tokio::test]
    async fn test_concurrent_reads_of_single_flight_source_collide() {
        let source = SingleFlightSource::new(&[Some(5800.0), Some(5800.0)]);
        let (mut a, mut b) = (source.clone(), source);
        let (first, second) = tokio::join!(a.read(), b.read());
        assert!(first.is_ok());
        assert!(matches!(second, Err(FrequencyError::Busy)));
    }

    #[tokio::test]
    async fn test_one_reading_feeds_both_producers() {
        let dir = TempDir::new().unwrap();
        let paths = ChannelPaths::in_dir(dir.path());
        set_dynamic_text(&paths, "Target D", None).unwrap();

        let source = SingleFlightSource::new(&[Some(5800.0), Some(5900.0)]);
        let mut producers = both(&paths, source);
        let t0 = Instant::now();

        assert_eq!(producers.tick(t0).await, Some(5800.0));
        assert_eq!(read(&paths.frequency), "5800 MHz");
        assert_eq!(read(&paths.scan_state), "stable");

        assert_eq!(producers.tick(t0 + Duration::from_secs(2)).await, Some(5900.0));
        assert_eq!(read(&paths.frequency), "5900 MHz");
        assert_eq!(read(&paths.scan_state), "scanning");
        assert_eq!(read(&paths.dynamic), "");
        assert_eq!(
            producers.dynamic().unwrap().tracker().reference(),
            Some(5900.0)
        );
    }

    #[tokio::test]
    async fn test_no_producers_skips_reading() {
        let source = SingleFlightSource::new(&[Some(5800.0)]);
        let mut producers = OverlayProducers::new(source.clone());
        assert!(producers.is_empty());
        assert_eq!(producers.tick(Instant::now()).await, None);
        assert_eq!(source.readings.lock().unwrap().readings.len(), 1);
    }
}
