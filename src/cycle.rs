//! Test cycle state machine.
//!
//! A run goes `Idle → Initializing → (WaitingHigh → TestingHigh → WaitingLow →
//! TestingLow) × cycles → Done`. In [`ScheduleMode::Thermal`] the waiting
//! phases poll the chamber until the plateau target is reached and then let it
//! stabilise. In [`ScheduleMode::Timed`] exactly four phases (high, low, high,
//! low) start at fixed offsets from the run start and the run ends at the
//! schedule's end offset.
//!
//! Whatever ends the run, the runner forces the running flag false, switches
//! every relay and the source output off, writes exactly one closing report
//! and broadcasts exactly one terminal event.

use crate::broadcast::{BenchEvent, Broadcaster, TableDebouncer};
use crate::config::{BenchSettings, PlateauSettings};
use crate::control::{CycleState, Phase, Plateau, RunControl, StopPoint, StopReason};
use crate::hardware::DeviceChannel;
use crate::judgment::TolerancePolicy;
use crate::matrix::MeasurementMatrix;
use crate::report::{PlateauSummary, ReportGenerator, RunAccumulator, RunDirectory, SweepRecord};
use crate::retry::RetryError;
use crate::sweep::{SweepContext, SweepEngine, SweepOutcome};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// How plateaus are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScheduleMode {
    /// Wait for the chamber to reach each target temperature.
    #[default]
    Thermal,
    /// Start each plateau at a fixed offset from the run start.
    Timed,
}

impl ScheduleMode {
    /// Tolerance policy used by sweeps in this mode.
    pub fn policy(self, settings: &BenchSettings) -> TolerancePolicy {
        match self {
            ScheduleMode::Thermal => settings.judgment.thermal_policy(),
            ScheduleMode::Timed => settings.judgment.timed_policy(),
        }
    }
}

/// How a run ended. Each variant carries the terminal payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every enabled plateau of every cycle ran.
    Completed(StopPoint),
    /// Stopped by the operator or by a voltage-setting failure.
    Stopped(StopPoint),
    /// Relay, chamber or unexpected failure.
    Failed(StopPoint),
}

impl RunOutcome {
    /// Terminal payload.
    pub fn stop_point(&self) -> &StopPoint {
        match self {
            RunOutcome::Completed(at) | RunOutcome::Stopped(at) | RunOutcome::Failed(at) => at,
        }
    }

    /// `completed`, `stopped` or `error`.
    pub fn status(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Stopped(_) => "stopped",
            RunOutcome::Failed(_) => "error",
        }
    }

    /// Whether the run finished normally.
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    fn event(&self) -> BenchEvent {
        match self {
            RunOutcome::Completed(at) => BenchEvent::Completed(at.clone()),
            RunOutcome::Stopped(at) => BenchEvent::Stopped(at.clone()),
            RunOutcome::Failed(at) => BenchEvent::Error(at.clone()),
        }
    }
}

enum Halt {
    Stopped(StopPoint),
    Failed(StopPoint),
}

/// Mutable state of one run.
#[derive(Default)]
struct RunState {
    dir: Option<RunDirectory>,
    runs: RunAccumulator,
    temperature: Option<f64>,
    partial: Option<MeasurementMatrix>,
    cycle: u32,
    phase: Phase,
}

/// Drives one complete run.
pub struct CycleRunner {
    settings: Arc<BenchSettings>,
    channel: DeviceChannel,
    control: RunControl,
    broadcaster: Broadcaster,
    reports: ReportGenerator,
    mode: ScheduleMode,
    state: watch::Sender<CycleState>,
}

impl CycleRunner {
    /// Runner reporting through `broadcaster` and observing `control`.
    pub fn new(
        settings: Arc<BenchSettings>,
        channel: DeviceChannel,
        control: RunControl,
        broadcaster: Broadcaster,
        mode: ScheduleMode,
    ) -> Self {
        let reports = ReportGenerator::new(settings.clone(), mode.policy(&settings));
        let (state, _) = watch::channel(CycleState::default());
        Self {
            settings,
            channel,
            control,
            broadcaster,
            reports,
            mode,
            state,
        }
    }

    /// Thermal or timed schedule.
    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// Observe phase transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    /// Execute the run to its end. Never panics; a panic inside the run is
    /// reported as a failed outcome.
    #[instrument(skip(self), fields(mode = ?self.mode))]
    pub async fn run(&self) -> RunOutcome {
        if !self.control.is_running() {
            warn!("run refused: machine is not running");
            let outcome = RunOutcome::Stopped(StopPoint::new(StopReason::PowerOff));
            self.broadcaster.terminal(outcome.event(), false);
            return outcome;
        }
        info!(cycles = self.settings.delay.cycle_count, "run started");

        let tables = TableDebouncer::spawn(
            self.broadcaster.clone(),
            self.settings.timing.table_debounce,
        );
        let mut sweep = SweepEngine::new(
            self.settings.clone(),
            self.channel.clone(),
            self.control.clone(),
            self.broadcaster.clone(),
            tables,
            self.mode.policy(&self.settings),
        );
        let mut run = RunState::default();

        let result = AssertUnwindSafe(self.execute(&mut run, &mut sweep))
            .catch_unwind()
            .await;
        let outcome = match result {
            Ok(Ok(())) => RunOutcome::Completed(
                StopPoint::new(StopReason::Completed).in_phase(run.cycle, Phase::Done),
            ),
            Ok(Err(Halt::Stopped(at))) => RunOutcome::Stopped(at),
            Ok(Err(Halt::Failed(at))) => RunOutcome::Failed(at),
            Err(panic) => {
                let message = panic_message(&*panic);
                error!(%message, "run panicked");
                RunOutcome::Failed(
                    StopPoint::new(StopReason::Unexpected)
                        .in_phase(run.cycle, run.phase)
                        .with_message(message),
                )
            }
        };

        self.finish(&mut run, &outcome).await;
        outcome
    }

    async fn execute(&self, run: &mut RunState, sweep: &mut SweepEngine) -> Result<(), Halt> {
        self.enter(run, Phase::Initializing, "Initializing: all relays off".to_string());
        self.checkpoint(run)?;

        if let Err(e) = self.channel.all_relays_off().await {
            return Err(Halt::Failed(
                self.point(run, StopReason::RelayFailure)
                    .with_message(e.to_string()),
            ));
        }
        match self.channel.set_source_output(true, Some(&self.control)).await {
            Ok(()) => {}
            Err(RetryError::Interrupted { .. }) => return Err(self.stopped(run)),
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(attempts, error = %last, "source output did not switch on");
                return Err(Halt::Stopped(
                    self.point(run, StopReason::VoltageSettingFailed)
                        .with_message(last.to_string()),
                ));
            }
        }

        run.dir = self.reports.create_run_directory();
        if let Some(dir) = &run.dir {
            self.broadcaster
                .publish(BenchEvent::DirectoryCreated(dir.path.clone()));
        }

        match self.mode {
            ScheduleMode::Thermal => self.run_thermal(run, sweep).await,
            ScheduleMode::Timed => self.run_timed(run, sweep).await,
        }
    }

    // =========================================================================
    // Thermal schedule
    // =========================================================================

    async fn run_thermal(&self, run: &mut RunState, sweep: &mut SweepEngine) -> Result<(), Halt> {
        let cycles = self.settings.delay.cycle_count;
        let timing = &self.settings.timing;

        for cycle in 1..=cycles {
            run.cycle = cycle;
            for plateau in [Plateau::High, Plateau::Low] {
                let target = self.plateau_settings(plateau);
                if !target.enabled {
                    debug!(cycle, %plateau, "plateau disabled");
                    continue;
                }
                self.wait_for_temperature(run, plateau, target.target_temp)
                    .await?;
                self.stabilize(run, target.wait_time_minutes).await?;
                self.test_plateau(run, sweep, plateau, target.read_count)
                    .await?;
            }
            if cycle < cycles {
                self.control
                    .wait(timing.cycle_pacing, timing.stop_check)
                    .await
                    .map_err(|_| self.stopped(run))?;
            }
        }
        Ok(())
    }

    async fn wait_for_temperature(
        &self,
        run: &mut RunState,
        plateau: Plateau,
        target: f64,
    ) -> Result<(), Halt> {
        let timing = &self.settings.timing;
        let text = format!(
            "Cycle {}/{}: waiting for {} temperature {:.1} °C",
            run.cycle, self.settings.delay.cycle_count, plateau, target
        );
        self.enter(run, plateau.waiting_phase(), text);

        loop {
            self.checkpoint(run)?;
            let celsius = match self.channel.read_chamber(&self.control).await {
                Ok(celsius) => celsius,
                Err(RetryError::Interrupted { .. }) => return Err(self.stopped(run)),
                Err(RetryError::Exhausted { attempts, last }) => {
                    let kind = if last.is_timeout() {
                        "chamber did not answer"
                    } else {
                        "chamber read failed"
                    };
                    error!(attempts, error = %last, "{}", kind);
                    return Err(Halt::Failed(
                        self.point(run, StopReason::ChamberUnreadable)
                            .with_message(format!("{}: {}", kind, last)),
                    ));
                }
            };
            run.temperature = Some(celsius);
            self.broadcaster.publish(BenchEvent::Temperature(celsius));

            if plateau.reached(celsius, target) {
                info!(celsius, target, %plateau, "plateau reached");
                return Ok(());
            }
            debug!(celsius, target, "waiting for chamber");
            self.control
                .wait(timing.chamber_poll, timing.stop_check)
                .await
                .map_err(|_| self.stopped(run))?;
        }
    }

    async fn stabilize(&self, run: &mut RunState, minutes: f64) -> Result<(), Halt> {
        if minutes <= 0.0 {
            return Ok(());
        }
        self.broadcaster.progress(format!(
            "Cycle {}: stabilizing for {} min",
            run.cycle, minutes
        ));
        self.control
            .wait(
                Duration::from_secs_f64(minutes * 60.0),
                self.settings.timing.stabilize_check,
            )
            .await
            .map_err(|_| self.stopped(run))
    }

    // =========================================================================
    // Timed schedule
    // =========================================================================

    async fn run_timed(&self, run: &mut RunState, sweep: &mut SweepEngine) -> Result<(), Halt> {
        let start = Instant::now();
        let offsets = self.settings.timed_schedule.offsets();
        let stop_check = self.settings.timing.stop_check;
        let schedule = [
            (1, Plateau::High, offsets.high1),
            (1, Plateau::Low, offsets.low1),
            (2, Plateau::High, offsets.high2),
            (2, Plateau::Low, offsets.low2),
        ];

        for (cycle, plateau, offset) in schedule {
            run.cycle = cycle;
            self.enter(
                run,
                plateau.waiting_phase(),
                format!(
                    "Timed cycle {}: {} phase at +{:.1} min",
                    cycle,
                    plateau,
                    offset.as_secs_f64() / 60.0
                ),
            );
            self.control
                .wait_until(start + offset, stop_check)
                .await
                .map_err(|_| self.stopped(run))?;
            let read_count = self.plateau_settings(plateau).read_count;
            self.test_plateau(run, sweep, plateau, read_count).await?;
        }

        self.broadcaster.progress(format!(
            "Timed schedule: finishing at +{:.1} min",
            offsets.end.as_secs_f64() / 60.0
        ));
        self.control
            .wait_until(start + offsets.end, stop_check)
            .await
            .map_err(|_| self.stopped(run))
    }

    // =========================================================================
    // Plateau testing
    // =========================================================================

    /// Run `read_count` sweeps, persisting each and folding them into one
    /// plateau summary.
    async fn test_plateau(
        &self,
        run: &mut RunState,
        sweep: &mut SweepEngine,
        plateau: Plateau,
        read_count: u32,
    ) -> Result<(), Halt> {
        let phase = plateau.testing_phase();
        let text = format!(
            "Cycle {}: testing {} plateau, {} sweep(s)",
            run.cycle, plateau, read_count
        );
        self.enter(run, phase, text);

        let mut summary = PlateauSummary::new(
            run.cycle,
            plateau,
            self.settings.output_voltages.len(),
            self.settings.channel_voltages.len(),
        );
        summary.temperature = run.temperature;

        for index in 1..=read_count {
            self.broadcaster.progress(format!(
                "Cycle {} {}: sweep {}/{}",
                run.cycle, plateau, index, read_count
            ));
            match sweep.run(1, SweepContext::new(run.cycle, phase)).await {
                SweepOutcome::Completed(matrix) => {
                    if let Some(dir) = &run.dir {
                        self.reports.write_sweep(
                            dir,
                            &SweepRecord {
                                cycle: run.cycle,
                                plateau,
                                index,
                                temperature: run.temperature,
                                matrix: &matrix,
                            },
                        );
                    }
                    summary.merge(&matrix);
                    run.partial = None;
                }
                SweepOutcome::Stopped { at, matrix } => {
                    run.partial = Some(matrix);
                    return Err(Halt::Stopped(at));
                }
                SweepOutcome::Failed { at, matrix } => {
                    run.partial = Some(matrix);
                    return Err(Halt::Failed(at));
                }
            }
        }

        if let Some(dir) = &run.dir {
            self.reports.write_plateau_summary(dir, &summary);
        }
        run.runs.push(summary);
        Ok(())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    async fn finish(&self, run: &mut RunState, outcome: &RunOutcome) {
        self.control.force_not_running();
        self.safe_state().await;

        if outcome.is_completed() {
            run.phase = Phase::Done;
        }
        self.publish_state(run);

        if run.dir.is_none() {
            // The run ended before its directory was created.
            run.dir = self.reports.create_run_directory();
            if let Some(dir) = &run.dir {
                self.broadcaster
                    .publish(BenchEvent::DirectoryCreated(dir.path.clone()));
            }
        }
        if let Some(dir) = &run.dir {
            match outcome {
                RunOutcome::Completed(_) => {
                    self.reports.write_final(dir, &run.runs);
                }
                RunOutcome::Stopped(at) | RunOutcome::Failed(at) => {
                    self.reports
                        .write_interrupted(dir, at, run.partial.as_ref(), &run.runs);
                }
            }
        }

        match outcome {
            RunOutcome::Completed(_) => info!("run completed"),
            RunOutcome::Stopped(at) => info!(reason = %at.reason, "run stopped"),
            RunOutcome::Failed(at) => {
                error!(reason = %at.reason, message = ?at.message, "run failed")
            }
        }
        self.broadcaster.terminal(outcome.event(), false);
    }

    /// Relays off, source output off. Failures are logged.
    async fn safe_state(&self) {
        if let Err(e) = self.channel.all_relays_off().await {
            error!(error = %e, "safety shutdown: relays did not switch off");
        }
        if let Err(e) = self.channel.set_source_output(false, None).await {
            error!(error = %e, "safety shutdown: source output did not switch off");
        }
    }

    // -------------------------------------------------------------------------

    fn plateau_settings(&self, plateau: Plateau) -> &PlateauSettings {
        match plateau {
            Plateau::High => &self.settings.temperature.high,
            Plateau::Low => &self.settings.temperature.low,
        }
    }

    fn enter(&self, run: &mut RunState, phase: Phase, text: String) {
        run.phase = phase;
        self.publish_state(run);
        self.broadcaster.phase(text, self.control.is_running());
    }

    fn publish_state(&self, run: &RunState) {
        self.state.send_replace(CycleState {
            cycle_index: run.cycle,
            phase: run.phase,
            stop_requested: self.control.is_stop_requested(),
            running: self.control.is_running(),
        });
    }

    fn point(&self, run: &RunState, reason: StopReason) -> StopPoint {
        StopPoint::new(reason).in_phase(run.cycle, run.phase)
    }

    fn stopped(&self, run: &RunState) -> Halt {
        Halt::Stopped(self.point(run, StopReason::UserStop))
    }

    fn checkpoint(&self, run: &RunState) -> Result<(), Halt> {
        self.control.checkpoint().map_err(|_| self.stopped(run))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::error::ChannelError;
    use crate::hardware::mock::{ReadContext, SimBench};
    use crate::report::{FINAL_REPORT, INTERRUPTED_REPORT};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Rig {
        sim: SimBench,
        control: RunControl,
        events: broadcast::Receiver<BenchEvent>,
        runner: CycleRunner,
        tmp: TempDir,
    }

    fn rig(settings: BenchSettings, mode: ScheduleMode) -> Rig {
        let tmp = TempDir::new().unwrap();
        let mut settings = settings;
        settings.bench.output_root = tmp.path().to_path_buf();
        let settings = Arc::new(settings);

        let sim = SimBench::new();
        let control = RunControl::new();
        control.turn_on();
        let broadcaster = Broadcaster::default();
        let events = broadcaster.subscribe();
        let channel = DeviceChannel::from_settings(sim.instruments(), &settings).unwrap();
        let runner = CycleRunner::new(settings, channel, control.clone(), broadcaster, mode);
        Rig {
            sim,
            control,
            events,
            runner,
            tmp,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<BenchEvent>) -> Vec<BenchEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn run_dir(root: &Path) -> Option<PathBuf> {
        std::fs::read_dir(root)
            .unwrap()
            .flatten()
            .next()
            .map(|entry| entry.path())
    }

    fn files_in_run(root: &Path) -> Vec<String> {
        let Some(run_dir) = run_dir(root) else {
            return Vec::new();
        };
        let mut names: Vec<String> = std::fs::read_dir(run_dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    fn terminal_events(events: &[BenchEvent]) -> Vec<&BenchEvent> {
        events.iter().filter(|e| e.is_terminal()).collect()
    }

    #[tokio::test]
    async fn thermal_run_completes_and_reports() {
        let mut rig = rig(sample_settings(), ScheduleMode::Thermal);
        rig.sim.chamber.ramp(-45.0, 90.0, 45.0);

        let outcome = rig.runner.run().await;
        assert!(outcome.is_completed(), "{:?}", outcome);
        assert!(!rig.control.is_running());
        assert!(rig.sim.energized().is_empty());
        assert!(!rig.sim.output_on());

        let files = files_in_run(rig.tmp.path());
        assert_eq!(
            files,
            vec![
                "cycle1_high_summary.csv",
                "cycle1_high_sweep1.csv",
                "cycle1_high_sweep2.csv",
                "cycle1_low_summary.csv",
                "cycle1_low_sweep1.csv",
                "cycle1_low_sweep2.csv",
                FINAL_REPORT,
            ]
        );

        let events = drain(&mut rig.events);
        let terminal = terminal_events(&events);
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], BenchEvent::Completed(_)));
        assert_eq!(events.last(), Some(&BenchEvent::Running(false)));
        assert!(events
            .iter()
            .any(|e| matches!(e, BenchEvent::DirectoryCreated(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, BenchEvent::Temperature(t) if *t >= 85.0)));
        assert_eq!(rig.runner.subscribe_state().borrow().phase, Phase::Done);
    }

    #[tokio::test]
    async fn first_action_is_all_relays_off() {
        let mut settings = sample_settings();
        settings.temperature.low.enabled = false;
        let rig = rig(settings, ScheduleMode::Thermal);
        rig.sim.chamber.hold(90.0);

        rig.runner.run().await;
        let journal = rig.sim.relay_journal();
        assert_eq!(
            journal.events().first(),
            Some(&crate::hardware::mock::RelayEvent::AllOff)
        );
    }

    #[tokio::test]
    async fn stop_during_temperature_wait() {
        let mut settings = sample_settings();
        settings.timing.chamber_poll = Duration::from_millis(20);
        let rig = rig(settings, ScheduleMode::Thermal);
        rig.sim.chamber.hold(20.0);

        let stopper = rig.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.turn_off();
        });

        match rig.runner.run().await {
            RunOutcome::Stopped(at) => {
                assert_eq!(at.reason, StopReason::UserStop);
                assert_eq!(at.phase, Some(Phase::WaitingHigh));
                assert_eq!(at.cycle, Some(1));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.control.is_stop_requested());
        assert_eq!(files_in_run(rig.tmp.path()), vec![INTERRUPTED_REPORT]);
    }

    #[tokio::test]
    async fn unreadable_chamber_fails_the_run() {
        let mut rig = rig(sample_settings(), ScheduleMode::Thermal);
        rig.sim.chamber.script([Err(ChannelError::Validation(
            "chamber replied 'NG'".to_string(),
        ))]);

        match rig.runner.run().await {
            RunOutcome::Failed(at) => {
                assert_eq!(at.reason, StopReason::ChamberUnreadable);
                assert!(at.message.unwrap().contains("chamber read failed"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        // Hard failures are not retried.
        assert_eq!(rig.sim.chamber.read_count(), 1);
        assert!(!rig.control.is_running());

        let events = drain(&mut rig.events);
        assert!(matches!(terminal_events(&events)[..], [BenchEvent::Error(_)]));
        assert_eq!(files_in_run(rig.tmp.path()), vec![INTERRUPTED_REPORT]);
    }

    #[tokio::test]
    async fn chamber_timeouts_are_retried_before_failing() {
        let rig = rig(sample_settings(), ScheduleMode::Thermal);
        let timeout = || ChannelError::Timeout {
            operation: "chamber",
            after: Duration::from_millis(1),
        };
        rig.sim.chamber.script([Err(timeout()), Err(timeout()), Ok(90.0)]);
        rig.sim.chamber.hold(-50.0);

        assert!(rig.runner.run().await.is_completed());
    }

    #[tokio::test]
    async fn panic_becomes_an_error_outcome_with_safe_shutdown() {
        let mut rig = rig(sample_settings(), ScheduleMode::Thermal);
        rig.sim.chamber.hold(90.0);
        rig.sim.load.set_model(|_: &ReadContext| panic!("analyzer driver bug"));

        match rig.runner.run().await {
            RunOutcome::Failed(at) => {
                assert_eq!(at.reason, StopReason::Unexpected);
                assert_eq!(at.message.as_deref(), Some("analyzer driver bug"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(rig.sim.energized().is_empty());
        assert!(!rig.control.is_running());
        let events = drain(&mut rig.events);
        assert_eq!(terminal_events(&events).len(), 1);
    }

    #[tokio::test]
    async fn refuses_to_start_when_not_running() {
        let mut rig = rig(sample_settings(), ScheduleMode::Thermal);
        rig.control.force_not_running();

        let outcome = rig.runner.run().await;
        assert_eq!(outcome.stop_point().reason, StopReason::PowerOff);
        assert!(rig.sim.relay_journal().events().is_empty());
        let events = drain(&mut rig.events);
        assert_eq!(events.last(), Some(&BenchEvent::Running(false)));
    }

    #[tokio::test]
    async fn timed_run_uses_fixed_range_and_four_phases() {
        let mut settings = sample_settings();
        settings.timed_schedule.intervals_minutes = [0.0; 8];
        settings.temperature.high.read_count = 1;
        settings.temperature.low.read_count = 1;
        let rig = rig(settings, ScheduleMode::Timed);
        // 205 V is outside ±5 % of 220 V but inside the 200..=242 V range.
        rig.sim.load.set_model(|_: &ReadContext| Ok(205.0));

        let mut states = rig.runner.subscribe_state();
        let outcome = rig.runner.run().await;
        assert!(outcome.is_completed(), "{:?}", outcome);
        assert!(states.has_changed().unwrap());
        assert_eq!(states.borrow_and_update().phase, Phase::Done);
        // No temperature feedback in timed mode.
        assert_eq!(rig.sim.chamber.read_count(), 0);

        let files = files_in_run(rig.tmp.path());
        assert_eq!(
            files,
            vec![
                "cycle1_high_summary.csv",
                "cycle1_high_sweep1.csv",
                "cycle1_low_summary.csv",
                "cycle1_low_sweep1.csv",
                "cycle2_high_summary.csv",
                "cycle2_high_sweep1.csv",
                "cycle2_low_summary.csv",
                "cycle2_low_sweep1.csv",
                FINAL_REPORT,
            ]
        );

        let final_report = run_dir(rig.tmp.path()).unwrap().join(FINAL_REPORT);
        let final_rows = crate::report::read_rows(&final_report).unwrap();
        assert!(final_rows.contains(&vec![
            "Passed".to_string(),
            "2".to_string(),
            "Failed".to_string(),
            "0".to_string(),
        ]));
    }

    #[tokio::test]
    async fn timed_run_waits_for_deadlines() {
        let mut settings = sample_settings();
        // 0.001 min = 60 ms per interval.
        settings.timed_schedule.intervals_minutes = [0.001; 8];
        settings.temperature.high.read_count = 1;
        settings.temperature.low.read_count = 1;
        let rig = rig(settings, ScheduleMode::Timed);

        let started = std::time::Instant::now();
        assert!(rig.runner.run().await.is_completed());
        // T_end spans 11 intervals.
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn stop_after_a_plateau_leaves_no_partial_matrix() {
        let mut settings = sample_settings();
        settings.timing.chamber_poll = Duration::from_millis(20);
        let rig = rig(settings, ScheduleMode::Thermal);
        rig.sim.chamber.script([Ok(90.0)]);
        rig.sim.chamber.hold(20.0);

        let mut states = rig.runner.subscribe_state();
        let stopper = rig.control.clone();
        tokio::spawn(async move {
            let _ = states
                .wait_for(|state| state.phase == Phase::WaitingLow)
                .await;
            stopper.turn_off();
        });

        match rig.runner.run().await {
            RunOutcome::Stopped(at) => {
                assert_eq!(at.reason, StopReason::UserStop);
                assert_eq!(at.phase, Some(Phase::WaitingLow));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let report = run_dir(rig.tmp.path()).unwrap().join(INTERRUPTED_REPORT);
        let rows = crate::report::read_rows(&report).unwrap();
        assert!(!rows.contains(&vec!["Partial Matrix".to_string()]));
        assert!(rows.contains(&vec!["Completed Plateaus".to_string()]));
    }

    #[tokio::test]
    async fn source_output_timeout_is_retried() {
        let mut settings = sample_settings();
        settings.temperature.low.enabled = false;
        let rig = rig(settings, ScheduleMode::Thermal);
        rig.sim.chamber.hold(90.0);
        rig.sim.power.fail_output_next(1);

        let outcome = rig.runner.run().await;
        assert!(outcome.is_completed(), "{:?}", outcome);
        // Failed on, retried on, then off in the safe state.
        assert_eq!(rig.sim.power.output_commands(), 3);
        assert!(!rig.sim.output_on());
    }

    #[tokio::test]
    async fn source_output_that_never_switches_stops_the_run() {
        let rig = rig(sample_settings(), ScheduleMode::Thermal);
        rig.sim.chamber.hold(90.0);
        rig.sim.power.fail_output_next(u32::MAX);

        match rig.runner.run().await {
            RunOutcome::Stopped(at) => {
                assert_eq!(at.reason, StopReason::VoltageSettingFailed);
                assert!(at.message.unwrap().contains("power source output"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let attempts = rig.runner.channel.timing().voltage_attempts;
        // Switch-on attempts plus the safe-state switch-off attempts.
        assert_eq!(rig.sim.power.output_commands(), attempts * 2);
        assert_eq!(rig.sim.chamber.read_count(), 0);
    }
}
