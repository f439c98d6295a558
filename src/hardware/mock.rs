//! Simulated bench hardware.
//!
//! The four simulated instruments share one [`SimBench`] state so the load
//! analyzer can tell which device slot the relays currently energise and
//! what the source is set to. Used by the test suites and by `--simulate`.
//!
//! Every instrument records a journal and supports failure injection
//! (`fail_next(n)` makes the next `n` calls fail).

use crate::config::SOURCE_LIMIT_V;
use crate::error::ChannelError;
use crate::hardware::relay::{RelayIndex, RelayRoutes};
use crate::hardware::{Chamber, Instruments, LoadAnalyzer, PowerSource, RelayBank};
use async_trait::async_trait;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::sleep;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decrement `counter` if positive; true when a failure should be injected.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug)]
struct BenchState {
    energized: BTreeSet<u8>,
    source_volts: f64,
    output_on: bool,
    routes: RelayRoutes,
}

impl BenchState {
    fn selected_slot(&self) -> Option<usize> {
        (0..crate::config::DEVICE_SLOTS).find(|&slot| {
            self.routes.route(slot).is_some_and(|route| {
                route
                    .on_sequence()
                    .iter()
                    .all(|relay| self.energized.contains(&relay.get()))
            })
        })
    }
}

type SharedState = Arc<Mutex<BenchState>>;

/// A complete simulated bench.
#[derive(Clone)]
pub struct SimBench {
    /// Relay bank.
    pub relay: Arc<SimRelayBank>,
    /// Power source.
    pub power: Arc<SimPowerSource>,
    /// Load analyzer.
    pub load: Arc<SimLoadAnalyzer>,
    /// Chamber controller.
    pub chamber: Arc<SimChamber>,
    state: SharedState,
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBench {
    /// Bench with the default relay wiring.
    pub fn new() -> Self {
        Self::with_routes(RelayRoutes::default())
    }

    /// Bench whose relay wiring matches `routes`.
    pub fn with_routes(routes: RelayRoutes) -> Self {
        let state = Arc::new(Mutex::new(BenchState {
            energized: BTreeSet::new(),
            source_volts: 0.0,
            output_on: false,
            routes,
        }));
        Self {
            relay: Arc::new(SimRelayBank::new(state.clone())),
            power: Arc::new(SimPowerSource::new(state.clone())),
            load: Arc::new(SimLoadAnalyzer::new(state.clone())),
            chamber: Arc::new(SimChamber::default()),
            state,
        }
    }

    /// Instrument handles for a [`crate::hardware::DeviceChannel`].
    pub fn instruments(&self) -> Instruments {
        Instruments {
            relay: self.relay.clone(),
            power: self.power.clone(),
            load: self.load.clone(),
            chamber: self.chamber.clone(),
        }
    }

    /// Slot whose three relays are all energised.
    pub fn selected_slot(&self) -> Option<usize> {
        lock(&self.state).selected_slot()
    }

    /// Relays currently energised, ascending.
    pub fn energized(&self) -> Vec<u8> {
        lock(&self.state).energized.iter().copied().collect()
    }

    /// Last accepted source setpoint.
    pub fn source_volts(&self) -> f64 {
        lock(&self.state).source_volts
    }

    /// Whether the source output is switched on.
    pub fn output_on(&self) -> bool {
        lock(&self.state).output_on
    }

    /// Snapshot of every successful relay operation.
    pub fn relay_journal(&self) -> RelayJournal {
        RelayJournal(lock(&self.relay.journal).clone())
    }
}

// =============================================================================
// Relay bank
// =============================================================================

/// A relay operation that reached the simulated bank and succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    /// One relay switched.
    Set {
        /// Relay number.
        relay: u8,
        /// New state.
        on: bool,
    },
    /// Bulk all-off.
    AllOff,
}

/// Snapshot of the relay journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayJournal(Vec<RelayEvent>);

impl RelayJournal {
    /// Events in the order they reached the bank.
    pub fn events(&self) -> &[RelayEvent] {
        &self.0
    }

    /// `(relay, on)` for every single-relay switch, in order.
    pub fn switches(&self) -> impl Iterator<Item = (u8, bool)> + '_ {
        self.0.iter().filter_map(|event| match event {
            RelayEvent::Set { relay, on } => Some((*relay, *on)),
            RelayEvent::AllOff => None,
        })
    }

    /// Every relay that was switched at least once.
    pub fn relays_touched(&self) -> BTreeSet<u8> {
        self.switches().map(|(relay, _)| relay).collect()
    }

    /// Number of bulk all-off commands.
    pub fn all_off_count(&self) -> usize {
        self.0
            .iter()
            .filter(|event| matches!(event, RelayEvent::AllOff))
            .count()
    }
}

/// Simulated relay board.
pub struct SimRelayBank {
    state: SharedState,
    journal: Mutex<Vec<RelayEvent>>,
    fail_next: AtomicU32,
    failing: Mutex<BTreeSet<u8>>,
    latency: Mutex<Duration>,
}

impl SimRelayBank {
    fn new(state: SharedState) -> Self {
        Self {
            state,
            journal: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            failing: Mutex::new(BTreeSet::new()),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Fail the next `n` operations with a timeout.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every switch of `relay` fail.
    pub fn fail_relay(&self, relay: u8) {
        lock(&self.failing).insert(relay);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    async fn simulate_io(&self) -> Result<(), ChannelError> {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if take_failure(&self.fail_next) {
            return Err(ChannelError::Timeout {
                operation: "relay bank",
                after: latency,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RelayBank for SimRelayBank {
    async fn set_relay(&self, relay: RelayIndex, on: bool) -> Result<(), ChannelError> {
        self.simulate_io().await?;
        if lock(&self.failing).contains(&relay.get()) {
            return Err(ChannelError::Validation(format!(
                "relay {} did not acknowledge",
                relay
            )));
        }
        {
            let mut state = lock(&self.state);
            if on {
                state.energized.insert(relay.get());
            } else {
                state.energized.remove(&relay.get());
            }
        }
        lock(&self.journal).push(RelayEvent::Set {
            relay: relay.get(),
            on,
        });
        Ok(())
    }

    async fn all_off(&self) -> Result<(), ChannelError> {
        self.simulate_io().await?;
        lock(&self.state).energized.clear();
        lock(&self.journal).push(RelayEvent::AllOff);
        Ok(())
    }
}

// =============================================================================
// Power source
// =============================================================================

/// Simulated programmable source.
pub struct SimPowerSource {
    state: SharedState,
    setpoints: Mutex<Vec<f64>>,
    fail_next: AtomicU32,
    fail_output: AtomicU32,
    output_commands: AtomicU32,
}

impl SimPowerSource {
    fn new(state: SharedState) -> Self {
        Self {
            state,
            setpoints: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            fail_output: AtomicU32::new(0),
            output_commands: AtomicU32::new(0),
        }
    }

    /// Reject the next `n` voltage setpoints.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Time out the next `n` output on/off commands.
    pub fn fail_output_next(&self, n: u32) {
        self.fail_output.store(n, Ordering::SeqCst);
    }

    /// Output commands received, failed ones included.
    pub fn output_commands(&self) -> u32 {
        self.output_commands.load(Ordering::SeqCst)
    }

    /// Every accepted setpoint, in order.
    pub fn setpoints(&self) -> Vec<f64> {
        lock(&self.setpoints).clone()
    }
}

#[async_trait]
impl PowerSource for SimPowerSource {
    async fn set_voltage(&self, volts: f64) -> Result<f64, ChannelError> {
        if !volts.is_finite() || volts.abs() > SOURCE_LIMIT_V {
            return Err(ChannelError::Validation(format!(
                "{} V is outside the source limit",
                volts
            )));
        }
        if take_failure(&self.fail_next) {
            return Err(ChannelError::Validation(
                "source reads back 0.00 V".to_string(),
            ));
        }
        lock(&self.state).source_volts = volts;
        lock(&self.setpoints).push(volts);
        Ok(volts)
    }

    async fn set_output(&self, enabled: bool) -> Result<(), ChannelError> {
        self.output_commands.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.fail_output) {
            return Err(ChannelError::Timeout {
                operation: "power source output",
                after: Duration::ZERO,
            });
        }
        lock(&self.state).output_on = enabled;
        Ok(())
    }
}

// =============================================================================
// Load analyzer
// =============================================================================

/// What the load analyzer "sees" when it is sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadContext {
    /// Analyzer channel being sampled.
    pub channel: usize,
    /// Slot whose route is fully energised, if any.
    pub slot: Option<usize>,
    /// Current source setpoint.
    pub source_volts: f64,
}

type ReadModel = dyn Fn(&ReadContext) -> Result<f64, ChannelError> + Send + Sync;

/// Simulated load analyzer driven by a reading model.
pub struct SimLoadAnalyzer {
    state: SharedState,
    model: Mutex<Arc<ReadModel>>,
    fail_next: AtomicU32,
    reads: Mutex<Vec<ReadContext>>,
}

/// 220 V plus a small per-slot offset when a device is selected, else 0 V.
pub fn nominal_model(ctx: &ReadContext) -> Result<f64, ChannelError> {
    Ok(match ctx.slot {
        Some(slot) => 220.0 + slot as f64 * 0.1,
        None => 0.0,
    })
}

impl SimLoadAnalyzer {
    fn new(state: SharedState) -> Self {
        Self {
            state,
            model: Mutex::new(Arc::new(nominal_model) as Arc<ReadModel>),
            fail_next: AtomicU32::new(0),
            reads: Mutex::new(Vec::new()),
        }
    }

    /// Replace the reading model.
    pub fn set_model(
        &self,
        model: impl Fn(&ReadContext) -> Result<f64, ChannelError> + Send + Sync + 'static,
    ) {
        let model: Arc<ReadModel> = Arc::new(model);
        *lock(&self.model) = model;
    }

    /// Time out the next `n` reads.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Context of every read attempt, failed ones included.
    pub fn reads(&self) -> Vec<ReadContext> {
        lock(&self.reads).clone()
    }
}

#[async_trait]
impl LoadAnalyzer for SimLoadAnalyzer {
    async fn read_channel(&self, channel: usize) -> Result<f64, ChannelError> {
        let ctx = {
            let state = lock(&self.state);
            ReadContext {
                channel,
                slot: state.selected_slot(),
                source_volts: state.source_volts,
            }
        };
        lock(&self.reads).push(ctx.clone());

        if take_failure(&self.fail_next) {
            return Err(ChannelError::Timeout {
                operation: "load analyzer",
                after: Duration::ZERO,
            });
        }
        let model = lock(&self.model).clone();
        model(&ctx)
    }
}

// =============================================================================
// Chamber
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Profile {
    Fixed(f64),
    /// Triangle wave between `min` and `max`, moving `step` per read.
    Ramp {
        current: f64,
        min: f64,
        max: f64,
        step: f64,
        rising: bool,
    },
}

impl Profile {
    fn next(&mut self) -> f64 {
        match self {
            Profile::Fixed(value) => *value,
            Profile::Ramp {
                current,
                min,
                max,
                step,
                rising,
            } => {
                let value = *current;
                let mut next = if *rising { value + *step } else { value - *step };
                if next >= *max {
                    next = *max;
                    *rising = false;
                } else if next <= *min {
                    next = *min;
                    *rising = true;
                }
                *current = next;
                value
            }
        }
    }
}

/// Chamber with scripted readings, then a fixed value or a ramp.
pub struct SimChamber {
    script: Mutex<VecDeque<Result<f64, ChannelError>>>,
    profile: Mutex<Profile>,
    reads: AtomicU32,
}

impl Default for SimChamber {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            profile: Mutex::new(Profile::Fixed(25.0)),
            reads: AtomicU32::new(0),
        }
    }
}

impl SimChamber {
    /// Readings returned, in order, before the profile takes over.
    pub fn script(&self, readings: impl IntoIterator<Item = Result<f64, ChannelError>>) {
        *lock(&self.script) = readings.into_iter().collect();
    }

    /// Report `celsius` once the script runs out.
    pub fn hold(&self, celsius: f64) {
        *lock(&self.profile) = Profile::Fixed(celsius);
    }

    /// Swing between `min` and `max`, starting at `min` heading up.
    pub fn ramp(&self, min: f64, max: f64, step: f64) {
        *lock(&self.profile) = Profile::Ramp {
            current: min,
            min,
            max,
            step: step.abs().max(f64::EPSILON),
            rising: true,
        };
    }

    /// Temperature reads served so far.
    pub fn read_count(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Chamber for SimChamber {
    async fn read_temperature(&self) -> Result<f64, ChannelError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = lock(&self.script).pop_front() {
            return scripted;
        }
        Ok(lock(&self.profile).next())
    }
}
