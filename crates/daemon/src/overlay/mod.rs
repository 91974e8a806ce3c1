//! Overlay channels and the producers that keep them current

pub mod channel;
pub mod hysteresis;
pub mod producers;

pub use channel::{ChannelPaths, OverlayChannel};
pub use hysteresis::{DynamicState, ScanTracker, TrackerEvent};
pub use producers::{
    set_dynamic_text, DynamicProducer, FrequencyProducer, OverlayProducers, UPDATE_INTERVAL,
};
