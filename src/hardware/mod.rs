//! Instrument capabilities and the device channel.
//!
//! Each of the four instruments is a small `#[async_trait]` capability:
//!
//! - [`RelayBank`]: switches individual relays, or all of them off
//! - [`PowerSource`]: programmable DC source feeding the devices under test
//! - [`LoadAnalyzer`]: multi-channel voltage measurement
//! - [`Chamber`]: temperature readout of the environmental chamber
//!
//! Every call returns `Result<_, ChannelError>`; hardware failures are values,
//! never panics. [`DeviceChannel`] layers the retry policies from
//! [`Timing`](crate::config::Timing) and the relay queue on top, and is the
//! only hardware entry point used by the sweep engine and cycle runner.

pub mod chamber;
pub mod crc;
pub mod load;
pub mod mock;
pub mod power;
pub mod relay;
pub mod serial;

use crate::config::{BenchSettings, Timing};
use crate::control::RunControl;
use crate::error::ChannelError;
use crate::retry::{with_retry, with_retry_if, RetryError, RetryPolicy};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use relay::{RelayCommand, RelayIndex, RelayQueue, RelayRoutes};
use serial::{LeasePolicy, PortLocks, PortOpener, SerialLink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").expect("Invalid number regex")
});

/// First signed decimal in a text reply (`"+2.4000E+01 VDC"` → 24.0).
pub(crate) fn parse_numeric_reply(reply: &[u8]) -> Result<f64, ChannelError> {
    let text = String::from_utf8_lossy(reply);
    NUMBER
        .find(&text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .ok_or_else(|| ChannelError::Validation(format!("no number in reply '{}'", text.trim())))
}

/// Result of a [`DeviceChannel`] operation after its retry policy ran.
pub type ChannelResult<T> = Result<T, RetryError<ChannelError>>;

/// Relay board driver.
#[async_trait]
pub trait RelayBank: Send + Sync {
    /// Switch one relay.
    async fn set_relay(&self, relay: RelayIndex, on: bool) -> Result<(), ChannelError>;

    /// Switch every relay off.
    async fn all_off(&self) -> Result<(), ChannelError>;
}

/// Programmable source driver.
#[async_trait]
pub trait PowerSource: Send + Sync {
    /// Program the output voltage; returns the value read back.
    async fn set_voltage(&self, volts: f64) -> Result<f64, ChannelError>;

    /// Switch the output stage on or off.
    async fn set_output(&self, enabled: bool) -> Result<(), ChannelError>;
}

/// Load analyzer driver.
#[async_trait]
pub trait LoadAnalyzer: Send + Sync {
    /// Measure one channel (0-based) in volts.
    async fn read_channel(&self, channel: usize) -> Result<f64, ChannelError>;
}

/// Chamber controller driver.
#[async_trait]
pub trait Chamber: Send + Sync {
    /// Current chamber temperature in °C.
    ///
    /// A timeout is reported as [`ChannelError::Timeout`]; any other error
    /// means the chamber answered with something unusable or the port failed.
    async fn read_temperature(&self) -> Result<f64, ChannelError>;
}

/// The four instruments of one bench.
#[derive(Clone)]
pub struct Instruments {
    /// Relay board.
    pub relay: Arc<dyn RelayBank>,
    /// Programmable source.
    pub power: Arc<dyn PowerSource>,
    /// Load analyzer.
    pub load: Arc<dyn LoadAnalyzer>,
    /// Chamber controller.
    pub chamber: Arc<dyn Chamber>,
}

impl Instruments {
    /// Serial drivers on the mapped ports, opened through `opener`.
    ///
    /// All links share one lease registry, so instruments mapped to the same
    /// physical port never overlap.
    pub fn over_ports(opener: Arc<dyn PortOpener>, settings: &BenchSettings) -> Self {
        let locks = PortLocks::new();
        let timing = &settings.timing;
        let policy = LeasePolicy::from_timing(timing);
        let link = |name: &'static str, port: &str, timeout: Duration| {
            SerialLink::new(name, port, opener.clone(), locks.clone(), policy, timeout)
        };

        Self {
            relay: Arc::new(relay::SerialRelayBank::new(link(
                "relay bank",
                &settings.ports.relay,
                timing.relay_timeout,
            ))),
            power: Arc::new(power::SerialPowerSource::new(link(
                "power source",
                &settings.ports.power,
                timing.power_timeout,
            ))),
            load: Arc::new(load::SerialLoadAnalyzer::new(link(
                "load analyzer",
                &settings.ports.load,
                timing.load_timeout,
            ))),
            chamber: Arc::new(chamber::SerialChamber::new(link(
                "chamber",
                &settings.ports.chamber,
                timing.chamber_timeout,
            ))),
        }
    }

    /// Real serial instruments.
    #[cfg(feature = "serial")]
    pub fn serial(settings: &BenchSettings) -> crate::error::BenchResult<Self> {
        let opener = Arc::new(serial::TokioSerialOpener::new(settings.ports.baud_rate));
        Ok(Self::over_ports(opener, settings))
    }

    /// Always fails: built without serial support.
    #[cfg(not(feature = "serial"))]
    pub fn serial(_settings: &BenchSettings) -> crate::error::BenchResult<Self> {
        Err(crate::error::BenchError::SerialFeatureDisabled)
    }
}

/// Serialized, retrying access to the bench hardware.
#[derive(Clone)]
pub struct DeviceChannel {
    instruments: Instruments,
    relays: RelayQueue,
    routes: RelayRoutes,
    timing: Timing,
}

impl DeviceChannel {
    /// Spawns the relay queue worker; call inside a Tokio runtime.
    pub fn new(instruments: Instruments, routes: RelayRoutes, timing: Timing) -> Self {
        let relays = RelayQueue::spawn(instruments.relay.clone());
        Self {
            instruments,
            relays,
            routes,
            timing,
        }
    }

    /// Channel using the routes and timing from `settings`.
    pub fn from_settings(
        instruments: Instruments,
        settings: &BenchSettings,
    ) -> Result<Self, ChannelError> {
        let routes = RelayRoutes::from_config(settings.bench.relay_routes.as_deref())?;
        Ok(Self::new(instruments, routes, settings.timing.clone()))
    }

    /// Timeouts and retry budgets in use.
    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    fn relay_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.timing.relay_attempts, self.timing.relay_backoff)
    }

    async fn switch(&self, relay: RelayIndex, on: bool) -> ChannelResult<()> {
        let command = RelayCommand::Set { relay, on };
        with_retry(self.relay_policy(), None, "relay switch", |_| {
            self.relays.submit(command)
        })
        .await
    }

    fn route(&self, slot: usize) -> ChannelResult<relay::DeviceRoute> {
        self.routes.route(slot).ok_or_else(|| RetryError::Exhausted {
            attempts: 0,
            last: ChannelError::Validation(format!("no relay route for device slot {}", slot)),
        })
    }

    /// Energise a device slot: row, column and offset relays, in that order.
    #[instrument(skip(self))]
    pub async fn device_on(&self, slot: usize) -> ChannelResult<()> {
        for relay in self.route(slot)?.on_sequence() {
            self.switch(relay, true).await?;
        }
        debug!(slot, "device selected");
        Ok(())
    }

    /// De-energise a device slot in reverse order.
    ///
    /// Never interrupted by a stop request. Every relay is attempted even if
    /// an earlier one failed; the first failure is returned.
    #[instrument(skip(self))]
    pub async fn device_off(&self, slot: usize) -> ChannelResult<()> {
        let mut first_error = None;
        for relay in self.route(slot)?.off_sequence() {
            if let Err(err) = self.switch(relay, false).await {
                warn!(slot, %relay, error = %err, "relay did not switch off");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                debug!(slot, "device deselected");
                Ok(())
            }
        }
    }

    /// Switch every relay off.
    #[instrument(skip(self))]
    pub async fn all_relays_off(&self) -> ChannelResult<()> {
        with_retry(self.relay_policy(), None, "all relays off", |_| {
            self.relays.submit(RelayCommand::AllOff)
        })
        .await
    }

    /// Program the source voltage (voltage retry policy).
    #[instrument(skip(self, control))]
    pub async fn set_source_voltage(&self, volts: f64, control: &RunControl) -> ChannelResult<f64> {
        let policy = RetryPolicy::new(self.timing.voltage_attempts, self.timing.voltage_backoff);
        let power = &self.instruments.power;
        with_retry(policy, Some(control), "set source voltage", |_| {
            power.set_voltage(volts)
        })
        .await
    }

    /// Switch the source output (voltage retry policy). Pass `None` to keep
    /// retrying after the stop flag is set.
    #[instrument(skip(self, control))]
    pub async fn set_source_output(
        &self,
        enabled: bool,
        control: Option<&RunControl>,
    ) -> ChannelResult<()> {
        let policy = RetryPolicy::new(self.timing.voltage_attempts, self.timing.voltage_backoff);
        let power = &self.instruments.power;
        with_retry(policy, control, "switch source output", |_| {
            power.set_output(enabled)
        })
        .await
    }

    /// Sample an analyzer channel (read retry policy).
    #[instrument(skip(self, control))]
    pub async fn read_channel(&self, channel: usize, control: &RunControl) -> ChannelResult<f64> {
        let policy = RetryPolicy::new(self.timing.read_attempts, self.timing.read_backoff);
        let load = &self.instruments.load;
        with_retry(policy, Some(control), "read load channel", |_| {
            load.read_channel(channel)
        })
        .await
    }

    /// Read the chamber temperature. Timeouts are retried; any other failure
    /// is returned after the first attempt.
    #[instrument(skip(self, control))]
    pub async fn read_chamber(&self, control: &RunControl) -> ChannelResult<f64> {
        let policy = RetryPolicy::new(self.timing.chamber_attempts, self.timing.chamber_backoff);
        let chamber = &self.instruments.chamber;
        with_retry_if(
            policy,
            Some(control),
            "read chamber temperature",
            ChannelError::is_timeout,
            |_| chamber.read_temperature(),
        )
        .await
    }
}
