//! Decoded therapy data: events, signal samples, waveforms, and sessions.
//!
//! Everything here is produced by the chunk decoder and treated as immutable
//! afterwards; the merger and aggregator only ever build new values.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of discrete event kinds reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObstructiveApnea,
    CentralApnea,
    Hypopnea,
    /// Hypopnea reported with an explicit duration field
    HypopneaVariant,
    FlowLimitation,
    Rera,
    VibratorySnore,
    /// Vibratory snore carrying a snore count
    VibratorySnoreVariant,
    LargeLeak,
    PeriodicBreathing,
    VariableBreathing,
    PressurePulse,
    PressureChange,
    SnoreAtPressure,
    BreathNotDetected,
}

impl EventKind {
    /// Whether the event counts towards the apnea-hypopnea index.
    pub fn counts_for_ahi(self) -> bool {
        matches!(
            self,
            EventKind::ObstructiveApnea
                | EventKind::CentralApnea
                | EventKind::Hypopnea
                | EventKind::HypopneaVariant
        )
    }

    pub fn is_snore(self) -> bool {
        matches!(
            self,
            EventKind::VibratorySnore
                | EventKind::VibratorySnoreVariant
                | EventKind::SnoreAtPressure
        )
    }
}

/// A discrete occurrence reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Elapsed seconds, duration, or count depending on the kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(timestamp: DateTime<Utc>, kind: EventKind, value: Option<f64>) -> Self {
        Self {
            timestamp,
            kind,
            value,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Continuous low-rate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    /// Therapy pressure (cmH2O)
    Pressure,
    /// Exhale-phase pressure (cmH2O)
    ExhalePressure,
    /// Total leak (L/min)
    Leak,
    /// Patient flow (L/min)
    Flow,
    /// 1.0 while pressure relief is active, 0.0 otherwise
    FlexActive,
}

/// One reading of a continuous channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub signal: SignalType,
}

impl SignalSample {
    pub fn new(timestamp: DateTime<Utc>, value: f64, signal: SignalType) -> Self {
        Self {
            timestamp,
            value,
            signal,
        }
    }
}

/// A fixed-rate high-resolution signal (flow, L/min).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformChannel {
    pub start: DateTime<Utc>,
    /// Samples per second
    pub sample_rate: f64,
    pub samples: Vec<f32>,
}

impl WaveformChannel {
    pub fn new(start: DateTime<Utc>, sample_rate: f64, samples: Vec<f32>) -> Self {
        Self {
            start,
            sample_rate,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Seconds of signal covered by the samples.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate <= 0.0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::milliseconds((self.duration_secs() * 1000.0).round() as i64)
    }

    /// Instant of the sample at `index`.
    pub fn time_at(&self, index: usize) -> DateTime<Utc> {
        let offset_ms = (index as f64 * 1000.0 / self.sample_rate).round() as i64;
        self.start + Duration::milliseconds(offset_ms)
    }
}

/// One segmented breath derived from a flow waveform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breath {
    pub start: DateTime<Utc>,
    pub duration_secs: f64,
    /// Inspired volume in millilitres
    pub tidal_volume_ml: f64,
    /// Breaths per minute implied by this breath's duration
    pub respiratory_rate: f64,
    /// Litres per minute
    pub minute_ventilation: f64,
    pub insp_time_secs: f64,
    pub exp_time_secs: f64,
    pub ie_ratio: f64,
    /// Inspiratory flattening score in [0, 1]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_limitation: Option<f64>,
}

/// Device settings recovered from a settings chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Best-effort minimum therapy pressure (cmH2O)
    pub min_pressure: f64,
}

/// One therapy run, possibly stitched from several files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: u32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub events: Vec<Event>,
    pub signals: Vec<SignalSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waveform: Option<WaveformChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breaths: Option<Vec<Breath>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<DeviceSettings>,
    /// Seconds of recorded intervals reported by interval chunks
    pub interval_secs: u64,
    /// Provenance (file name or label the session was decoded from)
    pub source: String,
}

impl Session {
    pub fn new(session_id: u32, start: DateTime<Utc>, source: impl Into<String>) -> Self {
        Self {
            session_id,
            start,
            end: start,
            events: Vec::new(),
            signals: Vec::new(),
            waveform: None,
            breaths: None,
            settings: None,
            interval_secs: 0,
            source: source.into(),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds().max(0) as f64 / 1000.0
    }

    /// Samples of a single channel, in stored order.
    pub fn samples_of(&self, signal: SignalType) -> impl Iterator<Item = &SignalSample> + '_ {
        self.signals.iter().filter(move |s| s.signal == signal)
    }

    pub fn has_signal(&self, signal: SignalType) -> bool {
        self.signals.iter().any(|s| s.signal == signal)
    }

    /// Extend `end` so it covers `t`.
    pub fn extend_to(&mut self, t: DateTime<Utc>) {
        if t > self.end {
            self.end = t;
        }
    }
}
