//! Run control: the ON/OFF input, the cooperative stop flag, and the
//! vocabulary used to describe where a run stopped.
//!
//! `RunControl` is an explicit context object handed down the call chain
//! (cycle runner → sweep engine → retry loops). Each clone shares the same
//! flags, so independent runs in tests simply use independent instances.
//!
//! The stop flag is deliberately sticky: once set it stays set until a new run
//! is started with [`RunControl::turn_on`].

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

/// Returned by checkpoints once a stop request has been observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Shared run/stop flags.
#[derive(Clone, Debug)]
pub struct RunControl {
    running: Arc<watch::Sender<bool>>,
    stop: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// Idle controller: not running, no stop requested.
    pub fn new() -> Self {
        let (running, _) = watch::channel(false);
        let (stop, _) = watch::channel(false);
        Self {
            running: Arc::new(running),
            stop: Arc::new(stop),
        }
    }

    /// ON: start a new run. Clears a stop flag left by the previous run.
    pub fn turn_on(&self) {
        self.stop.send_replace(false);
        self.running.send_replace(true);
    }

    /// OFF: request a cooperative stop and drop the running flag.
    pub fn turn_off(&self) {
        self.stop.send_replace(true);
        self.running.send_replace(false);
    }

    /// Set the stop flag without touching the running flag.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Force the running flag false at the end of a run.
    pub fn force_not_running(&self) {
        self.running.send_replace(false);
    }

    /// Whether the bench is switched on.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Whether a stop has been requested since the last ON.
    pub fn is_stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Receiver that observes the running flag.
    pub fn subscribe_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }

    /// Stop checkpoint.
    pub fn checkpoint(&self) -> Result<(), Interrupted> {
        if self.is_stop_requested() {
            Err(Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `total`, checking the stop flag every `granularity`.
    pub async fn wait(&self, total: Duration, granularity: Duration) -> Result<(), Interrupted> {
        self.wait_until(Instant::now() + total, granularity).await
    }

    /// Sleep until `deadline`, checking the stop flag every `granularity`.
    pub async fn wait_until(
        &self,
        deadline: Instant,
        granularity: Duration,
    ) -> Result<(), Interrupted> {
        let granularity = granularity.max(Duration::from_millis(1));
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            sleep((deadline - now).min(granularity)).await;
        }
    }
}

/// Phase of the cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No run yet.
    #[default]
    Idle,
    /// Relays off, source output on, run directory created.
    Initializing,
    /// Waiting for the chamber to reach the high target.
    WaitingHigh,
    /// Sweeping at the high plateau.
    TestingHigh,
    /// Waiting for the chamber to reach the low target.
    WaitingLow,
    /// Sweeping at the low plateau.
    TestingLow,
    /// Terminal.
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Phase::Idle => "idle",
            Phase::Initializing => "initializing",
            Phase::WaitingHigh => "waiting_high",
            Phase::TestingHigh => "testing_high",
            Phase::WaitingLow => "waiting_low",
            Phase::TestingLow => "testing_low",
            Phase::Done => "done",
        };
        f.write_str(text)
    }
}

/// Thermal plateau of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Plateau {
    /// Hot plateau.
    High,
    /// Cold plateau.
    Low,
}

impl Plateau {
    /// Lowercase name used in file names and progress text.
    pub fn as_str(self) -> &'static str {
        match self {
            Plateau::High => "high",
            Plateau::Low => "low",
        }
    }

    /// Phase spent waiting for this plateau.
    pub fn waiting_phase(self) -> Phase {
        match self {
            Plateau::High => Phase::WaitingHigh,
            Plateau::Low => Phase::WaitingLow,
        }
    }

    /// Phase spent sweeping at this plateau.
    pub fn testing_phase(self) -> Phase {
        match self {
            Plateau::High => Phase::TestingHigh,
            Plateau::Low => Phase::TestingLow,
        }
    }

    /// Whether `celsius` has reached the plateau target.
    pub fn reached(self, celsius: f64, target: f64) -> bool {
        match self {
            Plateau::High => celsius >= target,
            Plateau::Low => celsius <= target,
        }
    }
}

impl fmt::Display for Plateau {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step inside a sweep at which it halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStep {
    /// Before the source voltage was programmed.
    BeforeVoltageSetting,
    /// Before the device route was energised.
    BeforeDeviceSelect,
    /// While sampling channels.
    Measuring,
    /// Before the device route was released.
    BeforeDeselect,
}

/// Why a run or sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The run finished every phase.
    Completed,
    /// The running flag was false when the sweep was asked to start.
    PowerOff,
    /// The stop flag was observed at a checkpoint.
    UserStop,
    /// The source voltage could not be set within the retry budget.
    VoltageSettingFailed,
    /// A relay transaction failed within the retry budget.
    RelayFailure,
    /// The chamber could not be read.
    ChamberUnreadable,
    /// Anything else, including a panic caught at the top of the run.
    Unexpected,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::Completed => "completed",
            StopReason::PowerOff => "power_off",
            StopReason::UserStop => "user_stop",
            StopReason::VoltageSettingFailed => "voltage_setting_failed",
            StopReason::RelayFailure => "relay_failure",
            StopReason::ChamberUnreadable => "chamber_unreadable",
            StopReason::Unexpected => "unexpected",
        };
        f.write_str(text)
    }
}

/// Exact position at which a run ended. Also the payload of terminal events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopPoint {
    /// Why the run ended.
    pub reason: StopReason,
    /// One-based cycle index.
    pub cycle: Option<u32>,
    /// Phase the run was in.
    pub phase: Option<Phase>,
    /// Sweep step, when the halt happened inside a sweep.
    pub step: Option<SweepStep>,
    /// Output voltage index.
    pub voltage_index: Option<usize>,
    /// Device slot.
    pub device_index: Option<usize>,
    /// Read index within the sweep.
    pub read_index: Option<usize>,
    /// Analyzer channel.
    pub channel_index: Option<usize>,
    /// Detail for failures.
    pub message: Option<String>,
}

impl StopPoint {
    /// Stop point carrying only a reason.
    pub fn new(reason: StopReason) -> Self {
        Self {
            reason,
            cycle: None,
            phase: None,
            step: None,
            voltage_index: None,
            device_index: None,
            read_index: None,
            channel_index: None,
            message: None,
        }
    }

    /// Record cycle and phase.
    pub fn in_phase(mut self, cycle: u32, phase: Phase) -> Self {
        self.cycle = Some(cycle);
        self.phase = Some(phase);
        self
    }

    /// Record the sweep step.
    pub fn at_step(mut self, step: SweepStep) -> Self {
        self.step = Some(step);
        self
    }

    /// Record the matrix coordinates.
    pub fn at_cell(mut self, voltage: usize, device: usize, read: usize, channel: usize) -> Self {
        self.voltage_index = Some(voltage);
        self.device_index = Some(device);
        self.read_index = Some(read);
        self.channel_index = Some(channel);
        self
    }

    /// Attach a detail message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Observable state of the cycle state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleState {
    /// One-based cycle index, 0 before the first cycle.
    pub cycle_index: u32,
    /// Current phase.
    pub phase: Phase,
    /// Stop flag at the last transition.
    pub stop_requested: bool,
    /// Running flag at the last transition.
    pub running: bool,
}

impl Default for CycleState {
    fn default() -> Self {
        Self {
            cycle_index: 0,
            phase: Phase::Idle,
            stop_requested: false,
            running: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_is_sticky_until_next_run() {
        let control = RunControl::new();
        assert!(!control.is_running());

        control.turn_on();
        assert!(control.is_running());
        assert!(control.checkpoint().is_ok());

        control.turn_off();
        assert!(!control.is_running());
        assert_eq!(control.checkpoint(), Err(Interrupted));

        control.force_not_running();
        assert!(control.is_stop_requested());

        control.turn_on();
        assert!(!control.is_stop_requested());
    }

    #[test]
    fn clones_share_flags() {
        let control = RunControl::new();
        let other = control.clone();
        other.turn_on();
        assert!(control.is_running());
        other.request_stop();
        assert!(control.is_stop_requested());
        assert!(control.is_running());
    }

    #[tokio::test]
    async fn wait_completes_without_stop() {
        let control = RunControl::new();
        control.turn_on();
        let started = Instant::now();
        control
            .wait(Duration::from_millis(20), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn wait_is_interrupted_at_granularity() {
        let control = RunControl::new();
        control.turn_on();
        let stopper = control.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            stopper.turn_off();
        });

        let started = Instant::now();
        let result = control
            .wait(Duration::from_secs(30), Duration::from_millis(5))
            .await;
        assert_eq!(result, Err(Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn plateau_targets_are_directional() {
        assert!(Plateau::High.reached(85.0, 85.0));
        assert!(!Plateau::High.reached(84.9, 85.0));
        assert!(Plateau::Low.reached(-40.0, -40.0));
        assert!(!Plateau::Low.reached(-39.5, -40.0));
        assert_eq!(Plateau::Low.testing_phase(), Phase::TestingLow);
    }

    #[test]
    fn stop_point_serializes_vocabulary() {
        let point = StopPoint::new(StopReason::UserStop)
            .in_phase(1, Phase::TestingHigh)
            .at_step(SweepStep::BeforeDeselect)
            .at_cell(1, 2, 0, 0);
        let json = serde_json::to_value(&point).unwrap();
        assert_eq!(json["reason"], "user_stop");
        assert_eq!(json["phase"], "testing_high");
        assert_eq!(json["step"], "before_deselect");
        assert_eq!(json["voltage_index"], 1);
        assert_eq!(json["device_index"], 2);
    }
}
