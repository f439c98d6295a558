//! Control-input facade.
//!
//! `TestBench` owns the settings snapshot, the device channel, the broadcaster
//! and the run flags. The presentation layer only ever calls
//! [`TestBench::handle`] with ON/OFF and listens to the broadcast topic.

use crate::broadcast::{BenchEvent, Broadcaster};
use crate::config::BenchSettings;
use crate::control::RunControl;
use crate::cycle::{CycleRunner, RunOutcome, ScheduleMode};
use crate::error::{BenchError, BenchResult};
use crate::hardware::{DeviceChannel, Instruments};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Binary run/stop input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Start a run.
    On,
    /// Stop the active run.
    Off,
}

impl FromStr for ControlCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "on" | "start" => Ok(ControlCommand::On),
            "off" | "stop" => Ok(ControlCommand::Off),
            other => Err(format!("unknown control command '{}'", other)),
        }
    }
}

/// The bench as seen by the presentation layer.
pub struct TestBench {
    settings: Arc<BenchSettings>,
    channel: DeviceChannel,
    control: RunControl,
    broadcaster: Broadcaster,
    mode: ScheduleMode,
    active: Mutex<Option<JoinHandle<RunOutcome>>>,
}

impl TestBench {
    /// Validate the snapshot and wire the instruments up. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        settings: BenchSettings,
        instruments: Instruments,
        mode: ScheduleMode,
    ) -> BenchResult<Self> {
        settings.validate()?;
        let channel = DeviceChannel::from_settings(instruments, &settings)
            .map_err(|e| BenchError::Validation(e.to_string()))?;
        Ok(Self {
            settings: Arc::new(settings),
            channel,
            control: RunControl::new(),
            broadcaster: Broadcaster::default(),
            mode,
            active: Mutex::new(None),
        })
    }

    /// Validated settings snapshot.
    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    /// Shared run/stop flags.
    pub fn control(&self) -> &RunControl {
        &self.control
    }

    /// Event fan-out.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<BenchEvent> {
        self.broadcaster.subscribe()
    }

    /// True while a run task is still executing.
    pub fn is_run_active(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Apply a control input. Every input is echoed as a `RUNNING` event.
    pub fn handle(&self, command: ControlCommand) {
        match command {
            ControlCommand::On => self.start(),
            ControlCommand::Off => {
                info!("OFF received, requesting stop");
                self.control.turn_off();
            }
        }
        self.broadcaster.running(self.control.is_running());
    }

    fn start(&self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.as_ref().is_some_and(|handle| !handle.is_finished()) {
            warn!("ON ignored: a run is already in progress");
            return;
        }

        info!(mode = ?self.mode, "ON received, starting run");
        self.control.turn_on();
        let runner = CycleRunner::new(
            self.settings.clone(),
            self.channel.clone(),
            self.control.clone(),
            self.broadcaster.clone(),
            self.mode,
        );
        *active = Some(tokio::spawn(async move { runner.run().await }));
    }

    /// Wait for the current run, if any, and return how it ended.
    pub async fn wait_for_run(&self) -> Option<RunOutcome> {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "run task ended abnormally");
                None
            }
        }
    }
}
