//! Measurement sweep engine.
//!
//! One sweep walks `voltage → read → device → channel` in that order, writing
//! every cell of a fresh [`MeasurementMatrix`] at most once. Unselected device
//! slots keep the sentinel and never reach the hardware.
//!
//! The stop flag is observed before each voltage setting, before each device
//! is selected, inside every retry loop, and before each deselection. A
//! selected device is always deselected before the sweep returns.

use crate::broadcast::{Broadcaster, TableDebouncer};
use crate::config::{BenchSettings, DEVICE_SLOTS};
use crate::control::{Phase, RunControl, StopPoint, StopReason, SweepStep};
use crate::hardware::DeviceChannel;
use crate::judgment::{Judgment, TolerancePolicy};
use crate::matrix::{CellIndex, MeasurementMatrix, Reading};
use crate::retry::RetryError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Where in the run a sweep is taking place, for stop points and progress text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepContext {
    /// One-based cycle.
    pub cycle: u32,
    /// Testing phase the sweep runs in.
    pub phase: Phase,
}

impl SweepContext {
    /// Context for `cycle` and `phase`.
    pub fn new(cycle: u32, phase: Phase) -> Self {
        Self { cycle, phase }
    }
}

/// Result of one sweep. Every variant hands back the matrix as it stood.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// Every selected cell was written.
    Completed(MeasurementMatrix),
    /// Halted by a stop request or a voltage-setting failure.
    Stopped {
        /// Where the sweep halted.
        at: StopPoint,
        /// Cells written before the halt.
        matrix: MeasurementMatrix,
    },
    /// Halted by a relay failure or a crash.
    Failed {
        /// Where the sweep halted.
        at: StopPoint,
        /// Cells written before the halt.
        matrix: MeasurementMatrix,
    },
}

impl SweepOutcome {
    /// The matrix, however far it got.
    pub fn matrix(&self) -> &MeasurementMatrix {
        match self {
            SweepOutcome::Completed(matrix)
            | SweepOutcome::Stopped { matrix, .. }
            | SweepOutcome::Failed { matrix, .. } => matrix,
        }
    }

    /// `completed`, `stopped` or `error`.
    pub fn status(&self) -> &'static str {
        match self {
            SweepOutcome::Completed(_) => "completed",
            SweepOutcome::Stopped { .. } => "stopped",
            SweepOutcome::Failed { .. } => "error",
        }
    }
}

/// Early exit from the sweep loop.
enum Halt {
    Stopped(StopPoint),
    Failed(StopPoint),
}

/// Runs sweeps against one device channel. Owns the matrix between sweeps.
pub struct SweepEngine {
    settings: Arc<BenchSettings>,
    channel: DeviceChannel,
    control: RunControl,
    broadcaster: Broadcaster,
    tables: TableDebouncer,
    policy: TolerancePolicy,
    matrix: MeasurementMatrix,
}

impl SweepEngine {
    /// Engine with an empty matrix.
    pub fn new(
        settings: Arc<BenchSettings>,
        channel: DeviceChannel,
        control: RunControl,
        broadcaster: Broadcaster,
        tables: TableDebouncer,
        policy: TolerancePolicy,
    ) -> Self {
        Self {
            settings,
            channel,
            control,
            broadcaster,
            tables,
            policy,
            matrix: MeasurementMatrix::new(0, 0, 0, 0),
        }
    }

    /// Tolerance policy used for judgments.
    pub fn policy(&self) -> TolerancePolicy {
        self.policy
    }

    /// Matrix left by the most recent sweep.
    pub fn matrix(&self) -> &MeasurementMatrix {
        &self.matrix
    }

    /// Run one sweep with `read_count` reads per device.
    #[instrument(skip(self), fields(cycle = ctx.cycle, phase = %ctx.phase))]
    pub async fn run(&mut self, read_count: u32, ctx: SweepContext) -> SweepOutcome {
        if !self.control.is_running() {
            warn!("sweep refused: machine is not running");
            return SweepOutcome::Stopped {
                at: StopPoint::new(StopReason::PowerOff).in_phase(ctx.cycle, ctx.phase),
                matrix: self.matrix.clone(),
            };
        }

        self.matrix.reset(
            self.settings.output_voltages.len(),
            DEVICE_SLOTS,
            read_count as usize,
            self.settings.channel_voltages.len(),
        );
        self.flush_table().await;

        let result = self.sweep(read_count as usize, ctx).await;
        self.flush_table().await;

        let matrix = self.matrix.clone();
        match result {
            Ok(()) => {
                info!("sweep completed");
                SweepOutcome::Completed(matrix)
            }
            Err(Halt::Stopped(at)) => {
                info!(reason = %at.reason, "sweep stopped");
                SweepOutcome::Stopped { at, matrix }
            }
            Err(Halt::Failed(at)) => {
                error!(reason = %at.reason, message = ?at.message, "sweep failed");
                SweepOutcome::Failed { at, matrix }
            }
        }
    }

    async fn sweep(&mut self, reads: usize, ctx: SweepContext) -> Result<(), Halt> {
        let voltages = self.settings.output_voltages;
        let selected: Vec<usize> = self.settings.selected_devices().collect();
        let here = |reason| StopPoint::new(reason).in_phase(ctx.cycle, ctx.phase);

        for (vi, &volts) in voltages.iter().enumerate() {
            let before_setting = || {
                let mut point = here(StopReason::UserStop).at_step(SweepStep::BeforeVoltageSetting);
                point.voltage_index = Some(vi);
                point
            };
            if self.control.checkpoint().is_err() {
                return Err(Halt::Stopped(before_setting()));
            }

            match self.channel.set_source_voltage(volts, &self.control).await {
                Ok(actual) => debug!(volts, actual, "source settled"),
                Err(RetryError::Interrupted { .. }) => {
                    return Err(Halt::Stopped(before_setting()));
                }
                Err(RetryError::Exhausted { last, .. }) => {
                    let mut point = before_setting().with_message(last.to_string());
                    point.reason = StopReason::VoltageSettingFailed;
                    return Err(Halt::Stopped(point));
                }
            }

            for read in 0..reads {
                for &device in &selected {
                    self.broadcaster.progress(format!(
                        "Cycle {} {}: {:.2} V, device {}, read {}/{}",
                        ctx.cycle,
                        ctx.phase,
                        volts,
                        device + 1,
                        read + 1,
                        reads
                    ));
                    self.measure_device(vi, device, read, ctx).await?;
                }
            }
        }
        Ok(())
    }

    /// Select, sample every channel, deselect.
    async fn measure_device(
        &mut self,
        vi: usize,
        device: usize,
        read: usize,
        ctx: SweepContext,
    ) -> Result<(), Halt> {
        let here = |reason, step, channel| {
            StopPoint::new(reason)
                .in_phase(ctx.cycle, ctx.phase)
                .at_step(step)
                .at_cell(vi, device, read, channel)
        };

        if self.control.checkpoint().is_err() {
            return Err(Halt::Stopped(here(
                StopReason::UserStop,
                SweepStep::BeforeDeviceSelect,
                0,
            )));
        }

        if let Err(e) = self.channel.device_on(device).await {
            // Part of the route may be energized.
            let message = match self.deselect(device).await {
                Ok(()) => e.to_string(),
                Err(release) => format!("{}; deselect failed: {}", e, release),
            };
            return Err(Halt::Failed(
                here(StopReason::RelayFailure, SweepStep::BeforeDeviceSelect, 0)
                    .with_message(message),
            ));
        }
        settle(self.settings.delay.on_delay_ms).await;

        let channels = self.settings.channel_voltages.len();
        for ch in 0..channels {
            let idx = CellIndex {
                voltage: vi,
                device,
                read,
                channel: ch,
            };
            let expected = self.settings.expected_voltage(ch);
            let reading = match self.channel.read_channel(ch, &self.control).await {
                Ok(volts) => Reading::Volts(volts),
                Err(RetryError::Interrupted { .. }) => {
                    let stop = here(StopReason::UserStop, SweepStep::Measuring, ch);
                    return Err(self.abandon_device(device, stop).await);
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    warn!(device, channel = ch, attempts, error = %last, "read exhausted");
                    Reading::Error
                }
            };
            let judgment = self.policy.judge(&reading, expected);
            self.record(idx, reading, judgment);
        }

        let stop = self.control.checkpoint().is_err();
        if let Err(e) = self.deselect(device).await {
            return Err(Halt::Failed(
                here(
                    StopReason::RelayFailure,
                    SweepStep::BeforeDeselect,
                    channels - 1,
                )
                .with_message(e.to_string()),
            ));
        }
        if stop {
            return Err(Halt::Stopped(here(
                StopReason::UserStop,
                SweepStep::BeforeDeselect,
                channels - 1,
            )));
        }
        settle(self.settings.delay.off_delay_ms).await;
        Ok(())
    }

    fn record(&mut self, idx: CellIndex, reading: Reading, judgment: Judgment) {
        debug!(?idx, %reading, %judgment, "cell written");
        if let Err(e) = self.matrix.write(idx, reading, judgment) {
            error!(error = %e, "matrix write rejected");
            return;
        }
        self.tables
            .update(self.matrix.snapshot(&self.settings.output_voltages));
    }

    async fn deselect(&self, device: usize) -> Result<(), String> {
        self.channel.device_off(device).await.map_err(|e| {
            error!(device, error = %e, "device deselect failed");
            e.to_string()
        })
    }

    /// Deselect after a stop mid-measurement. A failing deselect turns the stop
    /// into a relay failure.
    async fn abandon_device(&self, device: usize, stop: StopPoint) -> Halt {
        match self.deselect(device).await {
            Ok(()) => Halt::Stopped(stop),
            Err(message) => {
                let mut point = stop.with_message(message);
                point.reason = StopReason::RelayFailure;
                Halt::Failed(point)
            }
        }
    }

    async fn flush_table(&self) {
        self.tables
            .flush(self.matrix.snapshot(&self.settings.output_voltages))
            .await;
    }
}

async fn settle(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BenchEvent;
    use crate::config::tests::sample_settings;
    use crate::hardware::mock::{ReadContext, SimBench};
    use crate::hardware::relay::RelayRoutes;
    use crate::matrix::UNSET_SENTINEL;

    struct Rig {
        sim: SimBench,
        control: RunControl,
        broadcaster: Broadcaster,
        engine: SweepEngine,
    }

    fn rig(settings: BenchSettings) -> Rig {
        let settings = Arc::new(settings);
        let sim = SimBench::new();
        let control = RunControl::new();
        control.turn_on();
        let broadcaster = Broadcaster::default();
        let tables = TableDebouncer::spawn(broadcaster.clone(), settings.timing.table_debounce);
        let channel = DeviceChannel::new(
            sim.instruments(),
            RelayRoutes::default(),
            settings.timing.clone(),
        );
        let engine = SweepEngine::new(
            settings.clone(),
            channel,
            control.clone(),
            broadcaster.clone(),
            tables,
            settings.judgment.thermal_policy(),
        );
        Rig {
            sim,
            control,
            broadcaster,
            engine,
        }
    }

    fn ctx() -> SweepContext {
        SweepContext::new(1, Phase::TestingHigh)
    }

    fn cell(voltage: usize, device: usize, read: usize) -> CellIndex {
        CellIndex {
            voltage,
            device,
            read,
            channel: 0,
        }
    }

    #[tokio::test]
    async fn sweep_fills_selected_devices_only() {
        let mut rig = rig(sample_settings());
        let outcome = rig.engine.run(2, ctx()).await;
        assert_eq!(outcome.status(), "completed");

        let matrix = outcome.matrix();
        assert_eq!(matrix.dims(), (3, DEVICE_SLOTS, 2, 1));
        for (idx, cell) in matrix.iter() {
            if idx.device == 1 || idx.device == 2 {
                assert_eq!(cell.judgment, Some(Judgment::Good), "{:?}", idx);
            } else {
                assert!(cell.is_unset(), "{:?}", idx);
                assert_eq!(cell.judgment_text(), UNSET_SENTINEL);
            }
        }

        // Relays only ever touched devices 1 and 2, and nothing is left on.
        let touched = rig.sim.relay_journal().relays_touched();
        let allowed: Vec<u8> = [1usize, 2]
            .iter()
            .flat_map(|&slot| RelayRoutes::default().route(slot).unwrap().relays())
            .collect();
        assert!(touched.iter().all(|r| allowed.contains(r)), "{:?}", touched);
        assert!(rig.sim.energized().is_empty());
        assert_eq!(rig.sim.power.setpoints(), vec![18.0, 24.0, 30.0]);
    }

    #[tokio::test]
    async fn out_of_band_reading_is_no_good() {
        let mut rig = rig(sample_settings());
        rig.sim.load.set_model(|ctx: &ReadContext| {
            if ctx.slot == Some(1) && (ctx.source_volts - 24.0).abs() < 1e-9 {
                Ok(150.0)
            } else {
                Ok(221.0)
            }
        });

        let outcome = rig.engine.run(1, ctx()).await;
        let matrix = outcome.matrix();
        let bad = matrix.get(cell(1, 1, 0)).unwrap();
        assert_eq!(bad.reading, Reading::Volts(150.0));
        assert_eq!(bad.judgment, Some(Judgment::NoGood));
        assert_eq!(
            matrix.get(cell(1, 2, 0)).unwrap().judgment,
            Some(Judgment::Good)
        );
        assert_eq!(
            matrix.get(cell(0, 1, 0)).unwrap().judgment,
            Some(Judgment::Good)
        );
    }

    #[tokio::test]
    async fn exhausted_read_writes_error_and_continues() {
        let mut rig = rig(sample_settings());
        let attempts = rig.engine.channel.timing().read_attempts;
        rig.sim.load.fail_next(attempts);

        let outcome = rig.engine.run(1, ctx()).await;
        assert_eq!(outcome.status(), "completed");
        let first = outcome.matrix().get(cell(0, 1, 0)).unwrap();
        assert_eq!(first.reading, Reading::Error);
        assert_eq!(first.judgment, Some(Judgment::NoGood));
        assert_eq!(
            outcome.matrix().get(cell(0, 2, 0)).unwrap().judgment,
            Some(Judgment::Good)
        );
    }

    #[tokio::test]
    async fn voltage_exhaustion_stops_before_voltage_setting() {
        let mut rig = rig(sample_settings());
        let attempts = rig.engine.channel.timing().voltage_attempts;
        rig.sim.power.fail_next(attempts);

        match rig.engine.run(1, ctx()).await {
            SweepOutcome::Stopped { at, matrix } => {
                assert_eq!(at.reason, StopReason::VoltageSettingFailed);
                assert_eq!(at.step, Some(SweepStep::BeforeVoltageSetting));
                assert_eq!(at.voltage_index, Some(0));
                assert!(matrix.iter().all(|(_, c)| c.is_unset()));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.sim.relay_journal().events().is_empty());
    }

    #[tokio::test]
    async fn refuses_to_run_when_not_running() {
        let mut rig = rig(sample_settings());
        rig.control.force_not_running();
        match rig.engine.run(1, ctx()).await {
            SweepOutcome::Stopped { at, .. } => assert_eq!(at.reason, StopReason::PowerOff),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.sim.power.setpoints().is_empty());
    }

    #[tokio::test]
    async fn stop_while_selected_deselects_first() {
        let mut rig = rig(sample_settings());
        let control = rig.control.clone();
        rig.sim.load.set_model(move |ctx: &ReadContext| {
            if ctx.slot == Some(2) && (ctx.source_volts - 24.0).abs() < 1e-9 {
                control.turn_off();
            }
            Ok(221.0)
        });

        match rig.engine.run(1, ctx()).await {
            SweepOutcome::Stopped { at, matrix } => {
                assert_eq!(at.reason, StopReason::UserStop);
                assert_eq!(at.step, Some(SweepStep::BeforeDeselect));
                assert_eq!(at.voltage_index, Some(1));
                assert_eq!(at.device_index, Some(2));
                assert_eq!(at.read_index, Some(0));
                // The reading taken before the stop was kept.
                assert!(!matrix.get(cell(1, 2, 0)).unwrap().is_unset());
                assert!(matrix.get(cell(2, 1, 0)).unwrap().is_unset());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.sim.energized().is_empty());
        assert!(!rig.control.is_running());
    }

    #[tokio::test]
    async fn relay_failure_fails_the_sweep_and_cleans_up() {
        let mut rig = rig(sample_settings());
        let route = RelayRoutes::default().route(1).unwrap();
        rig.sim.relay.fail_relay(route.relays()[2]);

        match rig.engine.run(1, ctx()).await {
            SweepOutcome::Failed { at, .. } => {
                assert_eq!(at.reason, StopReason::RelayFailure);
                assert_eq!(at.device_index, Some(1));
                // The failing relay also refuses to switch off.
                assert!(at.message.unwrap().contains("deselect failed"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.sim.energized().is_empty());
    }

    #[tokio::test]
    async fn select_failure_with_clean_release_reports_only_the_select_error() {
        let mut rig = rig(sample_settings());
        let attempts = rig.engine.channel.timing().relay_attempts;
        rig.sim.relay.fail_next(attempts);

        match rig.engine.run(1, ctx()).await {
            SweepOutcome::Failed { at, .. } => {
                assert_eq!(at.reason, StopReason::RelayFailure);
                let message = at.message.unwrap();
                assert!(message.contains("timed out"), "{}", message);
                assert!(!message.contains("deselect failed"), "{}", message);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.sim.energized().is_empty());
    }

    #[tokio::test]
    async fn publishes_clean_table_first_and_final_table_last() {
        let mut rig = rig(sample_settings());
        let mut rx = rig.broadcaster.subscribe();
        let outcome = rig.engine.run(1, ctx()).await;

        let mut tables = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BenchEvent::Table(snapshot) = event {
                tables.push(snapshot);
            }
        }
        let first = tables.first().unwrap();
        assert!(first
            .cells
            .iter()
            .flatten()
            .flatten()
            .flatten()
            .all(|c| c.is_unset()));
        assert_eq!(
            tables.last().unwrap(),
            &outcome.matrix().snapshot(&[18.0, 24.0, 30.0])
        );
    }

    #[tokio::test]
    async fn each_sweep_starts_from_a_clean_matrix() {
        let mut rig = rig(sample_settings());
        rig.engine.run(1, ctx()).await;
        assert!(rig.engine.matrix().iter().any(|(_, c)| !c.is_unset()));

        let control = rig.control.clone();
        rig.sim.load.set_model(move |_: &ReadContext| {
            control.turn_off();
            Ok(221.0)
        });
        let outcome = rig.engine.run(1, ctx()).await;
        let written = outcome
            .matrix()
            .iter()
            .filter(|(_, c)| !c.is_unset())
            .count();
        assert_eq!(written, 1);
    }
}
