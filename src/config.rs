//! Bench settings loaded with Figment.
//!
//! Settings live in a directory of small JSON documents, one per concern, each
//! contributing its own top-level key:
//!
//! ```text
//! settings/
//! ├── device_selection.json   {"device_selection": [true, false, ...]}
//! ├── channel_voltages.json   {"channel_voltages": [220.0]}
//! ├── output_voltages.json    {"output_voltages": [18.0, 24.0, 30.0]}
//! ├── temperature.json        {"temperature": {"high": {...}, "low": {...}}}
//! ├── delay.json              {"delay": {"on_delay_ms": 500, ...}}
//! ├── product_info.json       {"product_info": {"model_name": "...", ...}}
//! ├── ports.json              {"ports": {"chamber": "/dev/ttyUSB0", ...}}
//! ├── timed_schedule.json     (optional)
//! ├── judgment.json           (optional)
//! ├── timing.json             (optional)
//! └── bench.json              (optional)
//! ```
//!
//! Environment variables prefixed with `CHAMBER_BENCH_` override any key, with
//! `__` separating nesting levels (e.g. `CHAMBER_BENCH_DELAY__CYCLE_COUNT=2`).
//!
//! The loaded [`BenchSettings`] is an immutable snapshot: a run takes it at
//! start and never mutates it.

use crate::error::{BenchError, BenchResult};
use crate::judgment::TolerancePolicy;
use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of device slots addressable by the relay bank.
pub const DEVICE_SLOTS: usize = 10;
/// Maximum number of load-analyzer channels.
pub const MAX_CHANNELS: usize = 4;
/// Number of input-voltage test points per sweep.
pub const VOLTAGE_POINTS: usize = 3;
/// Programmable source limit (absolute volts).
pub const SOURCE_LIMIT_V: f64 = 100.0;
/// Load analyzer read limit (absolute volts).
pub const READ_LIMIT_V: f64 = 300.0;

/// JSON documents merged, in order, by [`BenchSettings::load_dir`].
pub const SETTINGS_FILES: &[&str] = &[
    "device_selection.json",
    "channel_voltages.json",
    "output_voltages.json",
    "temperature.json",
    "delay.json",
    "product_info.json",
    "ports.json",
    "timed_schedule.json",
    "judgment.json",
    "timing.json",
    "bench.json",
];

/// Complete settings snapshot for one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchSettings {
    /// Which of the 10 device slots are populated.
    pub device_selection: [bool; DEVICE_SLOTS],
    /// Expected voltage per analyzer channel (1..=4 entries).
    pub channel_voltages: Vec<f64>,
    /// The three input-voltage test points.
    pub output_voltages: [f64; VOLTAGE_POINTS],
    /// High/low plateau settings.
    pub temperature: TemperatureSettings,
    /// Relay settle delays and cycle count.
    pub delay: DelaySettings,
    /// Model and per-slot product names, printed in reports.
    pub product_info: ProductInfo,
    /// Instrument to serial port mapping.
    pub ports: PortMapping,
    /// Interval lengths for the timed schedule.
    #[serde(default)]
    pub timed_schedule: TimedSchedule,
    /// Tolerance policies.
    #[serde(default)]
    pub judgment: JudgmentSettings,
    /// Timeouts, retry counts and pacing.
    #[serde(default)]
    pub timing: Timing,
    /// Output location, logging and relay routing.
    #[serde(default)]
    pub bench: BenchOptions,
}

/// One thermal plateau.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlateauSettings {
    /// Skip the plateau when false.
    pub enabled: bool,
    /// Target chamber temperature in °C.
    pub target_temp: f64,
    /// Stabilisation time once the target is reached.
    pub wait_time_minutes: f64,
    /// Number of sweeps run on the plateau (1..=999).
    pub read_count: u32,
}

/// High and low plateaus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemperatureSettings {
    /// Hot plateau, visited first.
    pub high: PlateauSettings,
    /// Cold plateau.
    pub low: PlateauSettings,
}

/// Relay settle times and cycle count.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelaySettings {
    /// Settle time after selecting a device, before sampling.
    pub on_delay_ms: u64,
    /// Settle time after deselecting a device.
    pub off_delay_ms: u64,
    /// Number of high/low cycles (1..=3).
    pub cycle_count: u32,
}

/// Labels printed in report headers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProductInfo {
    /// Model printed in every report header.
    pub model_name: String,
    /// Per-slot product names.
    #[serde(default)]
    pub product_names: Vec<String>,
}

impl ProductInfo {
    /// Product name for a device slot, empty when not configured.
    pub fn product_name(&self, slot: usize) -> &str {
        self.product_names.get(slot).map(String::as_str).unwrap_or("")
    }
}

/// Physical port for each logical instrument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortMapping {
    /// Chamber controller port.
    pub chamber: String,
    /// Programmable source port.
    pub power: String,
    /// Load analyzer port.
    pub load: String,
    /// Relay board port.
    pub relay: String,
    /// Shared baud rate.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Eight interval lengths `T1..T8` (minutes) for the timed schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimedSchedule {
    /// `T1..T8` in minutes.
    pub intervals_minutes: [f64; 8],
}

impl Default for TimedSchedule {
    fn default() -> Self {
        Self {
            intervals_minutes: [30.0, 60.0, 30.0, 60.0, 30.0, 60.0, 30.0, 10.0],
        }
    }
}

/// Deadlines of the timed schedule, measured from run start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOffsets {
    /// End of the first high window.
    pub high1: Duration,
    /// End of the first low window.
    pub low1: Duration,
    /// End of the second high window.
    pub high2: Duration,
    /// End of the second low window.
    pub low2: Duration,
    /// End of the run.
    pub end: Duration,
}

impl TimedSchedule {
    /// Cumulative phase deadlines.
    ///
    /// `T_high1=T1+T2`, `T_low1=T_high1+T3+T4`, `T_high2=T_low1+T5+T6`,
    /// `T_low2=T_high2+T3+T4`, `T_end=T_low2+T5+T7+T8`.
    ///
    /// Intervals must already be validated as finite and non-negative.
    pub fn offsets(&self) -> TimedOffsets {
        let t = self.intervals_minutes.map(|m| Duration::from_secs_f64(m * 60.0));
        let high1 = t[0] + t[1];
        let low1 = high1 + t[2] + t[3];
        let high2 = low1 + t[4] + t[5];
        let low2 = high2 + t[2] + t[3];
        let end = low2 + t[4] + t[6] + t[7];
        TimedOffsets {
            high1,
            low1,
            high2,
            low2,
            end,
        }
    }
}

/// Tolerance policy settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgmentSettings {
    /// Fractional tolerance for the thermal schedule (0.05 = ±5%).
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Absolute range that replaces the percentage band when set.
    #[serde(default)]
    pub fixed_range: Option<VoltageRange>,
    /// Absolute range used by the timed schedule.
    #[serde(default = "default_timed_range")]
    pub timed_range: VoltageRange,
}

impl Default for JudgmentSettings {
    fn default() -> Self {
        Self {
            tolerance: default_tolerance(),
            fixed_range: None,
            timed_range: default_timed_range(),
        }
    }
}

impl JudgmentSettings {
    /// Policy used by the temperature-driven schedule.
    pub fn thermal_policy(&self) -> TolerancePolicy {
        match self.fixed_range {
            Some(range) => TolerancePolicy::FixedRange {
                min: range.min,
                max: range.max,
            },
            None => TolerancePolicy::Percentage {
                tolerance: self.tolerance,
            },
        }
    }

    /// Policy used by the timed schedule.
    pub fn timed_policy(&self) -> TolerancePolicy {
        TolerancePolicy::FixedRange {
            min: self.timed_range.min,
            max: self.timed_range.max,
        }
    }
}

/// Inclusive voltage band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VoltageRange {
    /// Lower bound in volts.
    pub min: f64,
    /// Upper bound in volts.
    pub max: f64,
}

/// Every duration and retry count the run uses.
///
/// Defaults are the production values; tests shrink them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timing {
    /// Chamber polling interval while waiting for a target.
    #[serde(with = "humantime_serde")]
    pub chamber_poll: Duration,
    /// Granularity of interruptible waits.
    #[serde(with = "humantime_serde")]
    pub stop_check: Duration,
    /// Polling interval during stabilisation.
    #[serde(with = "humantime_serde")]
    pub stabilize_check: Duration,
    /// Pause between cycles.
    #[serde(with = "humantime_serde")]
    pub cycle_pacing: Duration,
    /// Source voltage and output attempts.
    pub voltage_attempts: u32,
    /// Delay between source attempts.
    #[serde(with = "humantime_serde")]
    pub voltage_backoff: Duration,
    /// Load analyzer read attempts.
    pub read_attempts: u32,
    /// Delay between read attempts.
    #[serde(with = "humantime_serde")]
    pub read_backoff: Duration,
    /// Relay transaction attempts.
    pub relay_attempts: u32,
    /// Delay between relay attempts.
    #[serde(with = "humantime_serde")]
    pub relay_backoff: Duration,
    /// Chamber read attempts (timeouts only).
    pub chamber_attempts: u32,
    /// Delay between chamber attempts.
    #[serde(with = "humantime_serde")]
    pub chamber_backoff: Duration,
    /// Chamber reply timeout.
    #[serde(with = "humantime_serde")]
    pub chamber_timeout: Duration,
    /// Source reply timeout.
    #[serde(with = "humantime_serde")]
    pub power_timeout: Duration,
    /// Load analyzer reply timeout.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
    /// Relay board reply timeout.
    #[serde(with = "humantime_serde")]
    pub relay_timeout: Duration,
    /// Polling interval while a port is busy.
    #[serde(with = "humantime_serde")]
    pub port_poll: Duration,
    /// Polls before giving up on a busy port.
    pub port_wait_attempts: u32,
    /// Longest a port lease may be held.
    #[serde(with = "humantime_serde")]
    pub lease_timeout: Duration,
    /// Minimum spacing between table broadcasts.
    #[serde(with = "humantime_serde")]
    pub table_debounce: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            chamber_poll: Duration::from_secs(60),
            stop_check: Duration::from_secs(1),
            stabilize_check: Duration::from_secs(5),
            cycle_pacing: Duration::from_secs(2),
            voltage_attempts: 5,
            voltage_backoff: Duration::from_secs(3),
            read_attempts: 5,
            read_backoff: Duration::from_millis(1500),
            relay_attempts: 3,
            relay_backoff: Duration::from_secs(1),
            chamber_attempts: 3,
            chamber_backoff: Duration::from_secs(1),
            chamber_timeout: Duration::from_secs(2),
            power_timeout: Duration::from_secs(5),
            load_timeout: Duration::from_secs(3),
            relay_timeout: Duration::from_secs(2),
            port_poll: Duration::from_secs(1),
            port_wait_attempts: 15,
            lease_timeout: Duration::from_secs(5),
            table_debounce: Duration::from_secs(1),
        }
    }
}

impl Timing {
    /// Millisecond-scale timing for simulations and tests.
    pub fn fast() -> Self {
        Self {
            chamber_poll: Duration::from_millis(5),
            stop_check: Duration::from_millis(1),
            stabilize_check: Duration::from_millis(1),
            cycle_pacing: Duration::from_millis(1),
            voltage_backoff: Duration::from_millis(1),
            read_backoff: Duration::from_millis(1),
            relay_backoff: Duration::from_millis(1),
            chamber_backoff: Duration::from_millis(1),
            chamber_timeout: Duration::from_millis(200),
            power_timeout: Duration::from_millis(200),
            load_timeout: Duration::from_millis(200),
            relay_timeout: Duration::from_millis(200),
            port_poll: Duration::from_millis(1),
            lease_timeout: Duration::from_millis(50),
            table_debounce: Duration::from_millis(20),
            ..Self::default()
        }
    }
}

/// Bench-level options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BenchOptions {
    /// Root directory for per-run report directories.
    pub output_root: PathBuf,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Relay indices per device slot, overriding the built-in routing.
    pub relay_routes: Option<Vec<[u8; 3]>>,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("reports"),
            log_level: "info".to_string(),
            relay_routes: None,
        }
    }
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_tolerance() -> f64 {
    TolerancePolicy::DEFAULT_TOLERANCE
}

fn default_timed_range() -> VoltageRange {
    VoltageRange {
        min: 200.0,
        max: 242.0,
    }
}

impl BenchSettings {
    /// Load and validate the settings directory, then apply environment overrides.
    pub fn load_dir<P: AsRef<Path>>(dir: P) -> BenchResult<Self> {
        let dir = dir.as_ref();
        let figment = SETTINGS_FILES
            .iter()
            .fold(Figment::new(), |figment, name| {
                figment.merge(Json::file(dir.join(name)))
            })
            .merge(Env::prefixed("CHAMBER_BENCH_").split("__"));

        let settings: BenchSettings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a single JSON document holding every key.
    pub fn from_json_str(json: &str) -> BenchResult<Self> {
        let settings: BenchSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the snapshot invariants before a run is allowed to start.
    pub fn validate(&self) -> BenchResult<()> {
        if !self.device_selection.iter().any(|&selected| selected) {
            return Err(invalid("no device slot is selected"));
        }

        if self.channel_voltages.is_empty() || self.channel_voltages.len() > MAX_CHANNELS {
            return Err(invalid(format!(
                "channel_voltages must hold 1..={} entries, got {}",
                MAX_CHANNELS,
                self.channel_voltages.len()
            )));
        }
        for (ch, &volts) in self.channel_voltages.iter().enumerate() {
            if !volts.is_finite() || volts.abs() > READ_LIMIT_V {
                return Err(invalid(format!(
                    "channel {} expected voltage {} is outside ±{} V",
                    ch + 1,
                    volts,
                    READ_LIMIT_V
                )));
            }
        }

        for (i, &volts) in self.output_voltages.iter().enumerate() {
            if !volts.is_finite() || volts.abs() > SOURCE_LIMIT_V {
                return Err(invalid(format!(
                    "output voltage {} ({} V) is outside ±{} V",
                    i + 1,
                    volts,
                    SOURCE_LIMIT_V
                )));
            }
        }

        for (name, plateau) in [
            ("high", &self.temperature.high),
            ("low", &self.temperature.low),
        ] {
            if !(1..=999).contains(&plateau.read_count) {
                return Err(invalid(format!(
                    "{} read_count must be 1..=999, got {}",
                    name, plateau.read_count
                )));
            }
            if !plateau.target_temp.is_finite() {
                return Err(invalid(format!("{} target_temp is not a number", name)));
            }
            if !plateau.wait_time_minutes.is_finite() || plateau.wait_time_minutes < 0.0 {
                return Err(invalid(format!(
                    "{} wait_time_minutes must be non-negative",
                    name
                )));
            }
        }

        if !(1..=3).contains(&self.delay.cycle_count) {
            return Err(invalid(format!(
                "cycle_count must be 1..=3, got {}",
                self.delay.cycle_count
            )));
        }

        if self.product_info.product_names.len() > DEVICE_SLOTS {
            return Err(invalid(format!(
                "at most {} product names allowed",
                DEVICE_SLOTS
            )));
        }

        for (name, port) in [
            ("chamber", &self.ports.chamber),
            ("power", &self.ports.power),
            ("load", &self.ports.load),
            ("relay", &self.ports.relay),
        ] {
            if port.trim().is_empty() {
                return Err(invalid(format!("no serial port mapped for {}", name)));
            }
        }

        if self
            .timed_schedule
            .intervals_minutes
            .iter()
            .any(|m| !m.is_finite() || *m < 0.0)
        {
            return Err(invalid("timed_schedule intervals must be non-negative"));
        }

        let tolerance = self.judgment.tolerance;
        if !(tolerance > 0.0 && tolerance < 1.0) {
            return Err(invalid(format!(
                "tolerance must be within (0, 1), got {}",
                tolerance
            )));
        }
        for range in self
            .judgment
            .fixed_range
            .iter()
            .chain(std::iter::once(&self.judgment.timed_range))
        {
            if !(range.min <= range.max) {
                return Err(invalid(format!(
                    "voltage range min {} exceeds max {}",
                    range.min, range.max
                )));
            }
        }

        if let Some(routes) = &self.bench.relay_routes {
            if routes.len() != DEVICE_SLOTS {
                return Err(invalid(format!(
                    "relay_routes must list {} device slots, got {}",
                    DEVICE_SLOTS,
                    routes.len()
                )));
            }
            if routes
                .iter()
                .flatten()
                .any(|&relay| relay as usize >= crate::hardware::relay::RELAY_COUNT)
            {
                return Err(invalid("relay_routes reference a relay index above 15"));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bench.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.bench.log_level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Indices of the populated device slots, in slot order.
    pub fn selected_devices(&self) -> impl Iterator<Item = usize> + '_ {
        self.device_selection
            .iter()
            .enumerate()
            .filter_map(|(slot, &selected)| selected.then_some(slot))
    }

    /// Expected voltage on an analyzer channel.
    pub fn expected_voltage(&self, channel: usize) -> f64 {
        self.channel_voltages.get(channel).copied().unwrap_or(0.0)
    }
}

fn invalid(message: impl Into<String>) -> BenchError {
    BenchError::Validation(message.into())
}
