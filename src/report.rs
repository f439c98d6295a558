//! CSV run artifacts.
//!
//! Each run gets `<output_root>/<YYYYMMDD_HHMMSS>/` holding one CSV per sweep,
//! one averaged summary per plateau, and either `final_report.csv` or
//! `interrupted_report.csv`. Every file starts with the same header block
//! (model, run id, date, time, chamber temperature, channel settings).
//!
//! Writing a report never fails the run: errors are logged and the writer
//! returns `None`.

use crate::config::{BenchSettings, DEVICE_SLOTS};
use crate::control::{Plateau, StopPoint};
use crate::error::{BenchError, BenchResult};
use crate::judgment::{Judgment, TolerancePolicy};
use crate::matrix::{CellIndex, MeasurementMatrix, UNSET_SENTINEL};
use chrono::{DateTime, Local};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// File name of the report written when a run completes.
pub const FINAL_REPORT: &str = "final_report.csv";
/// File name of the report written when a run stops or fails.
pub const INTERRUPTED_REPORT: &str = "interrupted_report.csv";

/// Directory holding one run's artifacts.
#[derive(Debug, Clone, PartialEq)]
pub struct RunDirectory {
    /// Absolute directory path.
    pub path: PathBuf,
    /// Run identifier printed in report headers.
    pub run_id: Uuid,
    /// Local start time.
    pub started: DateTime<Local>,
}

/// One completed sweep, as persisted.
#[derive(Debug, Clone, Copy)]
pub struct SweepRecord<'a> {
    /// One-based cycle.
    pub cycle: u32,
    /// Plateau the sweep belongs to.
    pub plateau: Plateau,
    /// 1-based sweep number within the plateau.
    pub index: u32,
    /// Chamber temperature when the sweep started.
    pub temperature: Option<f64>,
    /// Measured grid.
    pub matrix: &'a MeasurementMatrix,
}

// =============================================================================
// Aggregation
// =============================================================================

/// Running totals for one `(voltage, device, channel)` across sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SummaryCell {
    sum: f64,
    numeric: u32,
    good: u32,
    total: u32,
}

impl SummaryCell {
    /// Mean of the numeric readings.
    pub fn average(&self) -> Option<f64> {
        (self.numeric > 0).then(|| self.sum / f64::from(self.numeric))
    }

    /// Majority vote: `G` when at least half of the readings were `G`.
    pub fn judgment(&self) -> Option<Judgment> {
        (self.total > 0).then(|| Judgment::from_pass(self.good * 2 >= self.total))
    }

    /// Judged readings folded in.
    pub fn samples(&self) -> u32 {
        self.total
    }
}

/// Repeated sweeps of one plateau folded together.
#[derive(Debug, Clone, PartialEq)]
pub struct PlateauSummary {
    /// One-based cycle.
    pub cycle: u32,
    /// Plateau summarised.
    pub plateau: Plateau,
    /// Chamber temperature at the start of the plateau.
    pub temperature: Option<f64>,
    voltages: usize,
    channels: usize,
    sweeps: u32,
    cells: Vec<SummaryCell>,
}

impl PlateauSummary {
    /// Empty summary sized for `voltages` and `channels`.
    pub fn new(cycle: u32, plateau: Plateau, voltages: usize, channels: usize) -> Self {
        Self {
            cycle,
            plateau,
            temperature: None,
            voltages,
            channels,
            sweeps: 0,
            cells: vec![SummaryCell::default(); voltages * DEVICE_SLOTS * channels],
        }
    }

    fn offset(&self, voltage: usize, device: usize, channel: usize) -> Option<usize> {
        (voltage < self.voltages && device < DEVICE_SLOTS && channel < self.channels)
            .then(|| (voltage * DEVICE_SLOTS + device) * self.channels + channel)
    }

    /// Fold every written cell of `matrix` in.
    pub fn merge(&mut self, matrix: &MeasurementMatrix) {
        for (idx, cell) in matrix.iter() {
            let Some(judgment) = cell.judgment else {
                continue;
            };
            let Some(offset) = self.offset(idx.voltage, idx.device, idx.channel) else {
                continue;
            };
            let summary = &mut self.cells[offset];
            if let Some(volts) = cell.reading.volts() {
                summary.sum += volts;
                summary.numeric += 1;
            }
            summary.total += 1;
            if judgment.is_good() {
                summary.good += 1;
            }
        }
        self.sweeps += 1;
    }

    /// Sweeps merged so far.
    pub fn sweeps(&self) -> u32 {
        self.sweeps
    }

    /// Totals for one cell; zeroed when out of range.
    pub fn cell(&self, voltage: usize, device: usize, channel: usize) -> SummaryCell {
        self.offset(voltage, device, channel)
            .map(|i| self.cells[i])
            .unwrap_or_default()
    }

    /// Per-voltage device judgment: `N` if any channel voted `N`.
    pub fn device_judgment(&self, voltage: usize, device: usize) -> Option<Judgment> {
        combine((0..self.channels).map(|ch| self.cell(voltage, device, ch).judgment()))
    }
}

/// AND of the known judgments; `None` when there are none.
fn combine(judgments: impl Iterator<Item = Option<Judgment>>) -> Option<Judgment> {
    judgments.flatten().fold(None, |acc, j| {
        let pass = acc.map_or(true, Judgment::is_good) && j.is_good();
        Some(Judgment::from_pass(pass))
    })
}

/// Final verdict for one device slot.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceVerdict {
    /// Zero-based slot.
    pub slot: usize,
    /// Whether the slot was selected for test.
    pub selected: bool,
    /// Judgment per output voltage.
    pub per_voltage: Vec<Option<Judgment>>,
    /// AND of every voltage on every plateau.
    pub overall: Option<Judgment>,
}

impl DeviceVerdict {
    /// `G`, `N` or the unset sentinel.
    pub fn overall_text(&self) -> &'static str {
        self.overall.map_or(UNSET_SENTINEL, Judgment::as_str)
    }
}

/// Every plateau summary of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunAccumulator {
    plateaus: Vec<PlateauSummary>,
}

impl RunAccumulator {
    /// Append a finished plateau.
    pub fn push(&mut self, summary: PlateauSummary) {
        self.plateaus.push(summary);
    }

    /// Summaries in run order.
    pub fn plateaus(&self) -> &[PlateauSummary] {
        &self.plateaus
    }

    /// Whether no plateau finished.
    pub fn is_empty(&self) -> bool {
        self.plateaus.is_empty()
    }

    /// A device is `G` only when every tested voltage is `G` on every
    /// plateau. Unselected slots are `-.-`.
    pub fn verdicts(
        &self,
        selection: &[bool; DEVICE_SLOTS],
        voltages: usize,
    ) -> Vec<DeviceVerdict> {
        (0..DEVICE_SLOTS)
            .map(|slot| {
                if !selection[slot] {
                    return DeviceVerdict {
                        slot,
                        selected: false,
                        per_voltage: vec![None; voltages],
                        overall: None,
                    };
                }
                let per_voltage: Vec<Option<Judgment>> = (0..voltages)
                    .map(|v| {
                        combine(self.plateaus.iter().map(|p| p.device_judgment(v, slot)))
                    })
                    .collect();
                let overall = combine(per_voltage.iter().copied());
                DeviceVerdict {
                    slot,
                    selected: true,
                    per_voltage,
                    overall,
                }
            })
            .collect()
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Writes run artifacts under the configured output root.
#[derive(Debug, Clone)]
pub struct ReportGenerator {
    root: PathBuf,
    settings: Arc<BenchSettings>,
    policy: TolerancePolicy,
}

impl ReportGenerator {
    /// Generator writing under `settings.bench.output_root`.
    pub fn new(settings: Arc<BenchSettings>, policy: TolerancePolicy) -> Self {
        Self {
            root: settings.bench.output_root.clone(),
            settings,
            policy,
        }
    }

    /// Write under `root` instead of the configured output root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Create a fresh timestamped run directory.
    pub fn create_run_directory(&self) -> Option<RunDirectory> {
        let started = Local::now();
        match self.try_create_run_directory(started) {
            Ok(path) => {
                info!(path = %path.display(), "run directory created");
                Some(RunDirectory {
                    path,
                    run_id: Uuid::new_v4(),
                    started,
                })
            }
            Err(e) => {
                error!(root = %self.root.display(), error = %e, "failed to create run directory");
                None
            }
        }
    }

    fn try_create_run_directory(&self, started: DateTime<Local>) -> BenchResult<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let stamp = started.format("%Y%m%d_%H%M%S").to_string();
        let mut path = self.root.join(&stamp);
        let mut suffix = 1;
        loop {
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    path = self.root.join(format!("{}_{}", stamp, suffix));
                    suffix += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `cycle<c>_<plateau>_sweep<k>.csv`
    pub fn write_sweep(&self, dir: &RunDirectory, record: &SweepRecord<'_>) -> Option<PathBuf> {
        let name = format!(
            "cycle{}_{}_sweep{}.csv",
            record.cycle, record.plateau, record.index
        );
        self.persist(dir, &name, |w| {
            self.write_header(w, dir, record.temperature)?;
            w.write_record([
                "Cycle".to_string(),
                record.cycle.to_string(),
                "Plateau".to_string(),
                record.plateau.to_string(),
                "Sweep".to_string(),
                record.index.to_string(),
            ])?;
            blank(w)?;
            self.write_matrix(w, record.matrix)
        })
    }

    /// `cycle<c>_<plateau>_summary.csv`: averages and majority votes.
    pub fn write_plateau_summary(
        &self,
        dir: &RunDirectory,
        summary: &PlateauSummary,
    ) -> Option<PathBuf> {
        let name = format!("cycle{}_{}_summary.csv", summary.cycle, summary.plateau);
        self.persist(dir, &name, |w| {
            self.write_header(w, dir, summary.temperature)?;
            w.write_record([
                "Cycle".to_string(),
                summary.cycle.to_string(),
                "Plateau".to_string(),
                summary.plateau.to_string(),
                "Sweeps".to_string(),
                summary.sweeps().to_string(),
            ])?;
            blank(w)?;
            self.write_summary(w, summary)
        })
    }

    /// `final_report.csv` for a completed run.
    pub fn write_final(&self, dir: &RunDirectory, runs: &RunAccumulator) -> Option<PathBuf> {
        self.persist(dir, FINAL_REPORT, |w| {
            self.write_header(w, dir, None)?;
            w.write_record(["Status", "completed"])?;
            blank(w)?;
            self.write_verdicts(w, runs)
        })
    }

    /// `interrupted_report.csv` for a stopped or failed run.
    pub fn write_interrupted(
        &self,
        dir: &RunDirectory,
        at: &StopPoint,
        partial: Option<&MeasurementMatrix>,
        runs: &RunAccumulator,
    ) -> Option<PathBuf> {
        self.persist(dir, INTERRUPTED_REPORT, |w| {
            self.write_header(w, dir, None)?;
            let opt = |value: Option<usize>| {
                value.map_or(UNSET_SENTINEL.to_string(), |v| v.to_string())
            };
            w.write_record(["Status".to_string(), "interrupted".to_string()])?;
            w.write_record(["Reason".to_string(), at.reason.to_string()])?;
            w.write_record([
                "Cycle".to_string(),
                at.cycle.map_or(UNSET_SENTINEL.to_string(), |c| c.to_string()),
            ])?;
            w.write_record([
                "Phase".to_string(),
                at.phase.map_or(UNSET_SENTINEL.to_string(), |p| p.to_string()),
            ])?;
            w.write_record([
                "Step".to_string(),
                at.step
                    .and_then(|s| serde_json::to_value(s).ok())
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| UNSET_SENTINEL.to_string()),
            ])?;
            w.write_record(["Voltage Index".to_string(), opt(at.voltage_index)])?;
            w.write_record([
                "Device".to_string(),
                at.device_index
                    .map_or(UNSET_SENTINEL.to_string(), |d| (d + 1).to_string()),
            ])?;
            w.write_record(["Read Index".to_string(), opt(at.read_index)])?;
            w.write_record([
                "Channel".to_string(),
                at.channel_index
                    .map_or(UNSET_SENTINEL.to_string(), |c| format!("CH{}", c + 1)),
            ])?;
            w.write_record([
                "Message".to_string(),
                at.message.clone().unwrap_or_default(),
            ])?;
            blank(w)?;
            if let Some(matrix) = partial {
                w.write_record(["Partial Matrix"])?;
                self.write_matrix(w, matrix)?;
                blank(w)?;
            }
            if !runs.is_empty() {
                w.write_record(["Completed Plateaus"])?;
                self.write_verdicts(w, runs)?;
            }
            Ok(())
        })
    }

    // -------------------------------------------------------------------------

    fn persist<F>(&self, dir: &RunDirectory, name: &str, body: F) -> Option<PathBuf>
    where
        F: FnOnce(&mut csv::Writer<fs::File>) -> BenchResult<()>,
    {
        let path = dir.path.join(name);
        let result = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(&path)
            .map_err(BenchError::from)
            .and_then(|mut writer| {
                body(&mut writer)?;
                writer.flush()?;
                Ok(())
            })
            .map_err(|e| BenchError::Report(format!("{}: {}", name, e)));
        match result {
            Ok(()) => {
                info!(path = %path.display(), "report written");
                Some(path)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to write report");
                None
            }
        }
    }

    fn write_header<W: io::Write>(
        &self,
        w: &mut csv::Writer<W>,
        dir: &RunDirectory,
        temperature: Option<f64>,
    ) -> BenchResult<()> {
        let now = Local::now();
        w.write_record(["Model", self.settings.product_info.model_name.as_str()])?;
        w.write_record(["Run ID".to_string(), dir.run_id.to_string()])?;
        w.write_record([
            "Started".to_string(),
            dir.started.format("%Y-%m-%d %H:%M:%S").to_string(),
        ])?;
        w.write_record(["Date".to_string(), now.format("%Y-%m-%d").to_string()])?;
        w.write_record(["Time".to_string(), now.format("%H:%M:%S").to_string()])?;
        w.write_record([
            "Chamber Temperature (C)".to_string(),
            temperature.map_or(UNSET_SENTINEL.to_string(), |t| format!("{:.2}", t)),
        ])?;
        for (ch, &expected) in self.settings.channel_voltages.iter().enumerate() {
            let (low, high) = self.policy.bounds(expected);
            w.write_record([
                format!("CH{}", ch + 1),
                format!("{:.2}", expected),
                self.policy.describe(),
                format!("{:.2}", low),
                format!("{:.2}", high),
            ])?;
        }
        blank(w)
    }

    fn write_matrix<W: io::Write>(
        &self,
        w: &mut csv::Writer<W>,
        matrix: &MeasurementMatrix,
    ) -> BenchResult<()> {
        let (voltages, devices, reads, channels) = matrix.dims();
        let mut header = vec![
            "Voltage (V)".to_string(),
            "Device".to_string(),
            "Product".to_string(),
            "Read".to_string(),
        ];
        for ch in 0..channels {
            header.push(format!("CH{}", ch + 1));
            header.push(format!("CH{} Judgment", ch + 1));
        }
        w.write_record(&header)?;

        for v in 0..voltages {
            for d in 0..devices {
                for r in 0..reads {
                    let mut row = vec![
                        self.voltage_label(v),
                        (d + 1).to_string(),
                        self.settings.product_info.product_name(d).to_string(),
                        (r + 1).to_string(),
                    ];
                    for ch in 0..channels {
                        let idx = CellIndex {
                            voltage: v,
                            device: d,
                            read: r,
                            channel: ch,
                        };
                        let cell = matrix.get(idx).copied().unwrap_or_default();
                        row.push(cell.reading.to_string());
                        row.push(cell.judgment_text().to_string());
                    }
                    w.write_record(&row)?;
                }
            }
        }

        blank(w)?;
        let mut passed = 0;
        let mut failed = 0;
        w.write_record(["Device", "Result"])?;
        for d in 0..devices {
            let result = combine(
                matrix
                    .iter()
                    .filter(|(idx, _)| idx.device == d)
                    .map(|(_, cell)| cell.judgment),
            );
            match result {
                Some(Judgment::Good) => passed += 1,
                Some(Judgment::NoGood) => failed += 1,
                None => {}
            }
            w.write_record([
                (d + 1).to_string(),
                result.map_or(UNSET_SENTINEL, Judgment::as_str).to_string(),
            ])?;
        }
        totals(w, passed, failed)
    }

    fn write_summary<W: io::Write>(
        &self,
        w: &mut csv::Writer<W>,
        summary: &PlateauSummary,
    ) -> BenchResult<()> {
        let channels = summary.channels;
        let mut header = vec![
            "Voltage (V)".to_string(),
            "Device".to_string(),
            "Product".to_string(),
            "Samples".to_string(),
        ];
        for ch in 0..channels {
            header.push(format!("CH{} Average", ch + 1));
            header.push(format!("CH{} Judgment", ch + 1));
        }
        w.write_record(&header)?;

        for v in 0..summary.voltages {
            for d in 0..DEVICE_SLOTS {
                let mut row = vec![
                    self.voltage_label(v),
                    (d + 1).to_string(),
                    self.settings.product_info.product_name(d).to_string(),
                    summary.cell(v, d, 0).samples().to_string(),
                ];
                for ch in 0..channels {
                    let cell = summary.cell(v, d, ch);
                    row.push(
                        cell.average()
                            .map_or(UNSET_SENTINEL.to_string(), |a| format!("{:.2}", a)),
                    );
                    row.push(
                        cell.judgment()
                            .map_or(UNSET_SENTINEL, Judgment::as_str)
                            .to_string(),
                    );
                }
                w.write_record(&row)?;
            }
        }
        Ok(())
    }

    fn write_verdicts<W: io::Write>(
        &self,
        w: &mut csv::Writer<W>,
        runs: &RunAccumulator,
    ) -> BenchResult<()> {
        let voltages = self.settings.output_voltages.len();
        let verdicts = runs.verdicts(&self.settings.device_selection, voltages);

        let mut header = vec!["Device".to_string(), "Product".to_string()];
        header.extend((0..voltages).map(|v| self.voltage_label(v)));
        header.push("Result".to_string());
        w.write_record(&header)?;

        let mut passed = 0;
        let mut failed = 0;
        for verdict in &verdicts {
            match verdict.overall {
                Some(Judgment::Good) => passed += 1,
                Some(Judgment::NoGood) => failed += 1,
                None => {}
            }
            let mut row = vec![
                (verdict.slot + 1).to_string(),
                self.settings.product_info.product_name(verdict.slot).to_string(),
            ];
            row.extend(
                verdict
                    .per_voltage
                    .iter()
                    .map(|j| j.map_or(UNSET_SENTINEL, Judgment::as_str).to_string()),
            );
            row.push(verdict.overall_text().to_string());
            w.write_record(&row)?;
        }
        blank(w)?;
        totals(w, passed, failed)
    }

    fn voltage_label(&self, index: usize) -> String {
        self.settings
            .output_voltages
            .get(index)
            .map_or(UNSET_SENTINEL.to_string(), |v| format!("{:.2}", v))
    }
}

fn blank<W: io::Write>(w: &mut csv::Writer<W>) -> BenchResult<()> {
    w.write_record([""])?;
    Ok(())
}

fn totals<W: io::Write>(w: &mut csv::Writer<W>, passed: u32, failed: u32) -> BenchResult<()> {
    w.write_record([
        "Passed".to_string(),
        passed.to_string(),
        "Failed".to_string(),
        failed.to_string(),
    ])?;
    Ok(())
}

/// Read back a report as rows, for inspection and tests.
pub fn read_rows(path: &Path) -> BenchResult<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::control::{Phase, StopReason};
    use crate::matrix::Reading;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    fn generator(root: &Path) -> ReportGenerator {
        let settings = Arc::new(sample_settings());
        let policy = settings.judgment.thermal_policy();
        ReportGenerator::new(settings, policy).with_root(root)
    }

    /// Matrix with devices 1 and 2 written; `bad` cells get 150 V.
    fn matrix(reads: usize, bad: &[(usize, usize, usize)]) -> MeasurementMatrix {
        let policy = TolerancePolicy::Percentage { tolerance: 0.05 };
        let mut m = MeasurementMatrix::new(3, DEVICE_SLOTS, reads, 1);
        for v in 0..3 {
            for d in [1, 2] {
                for r in 0..reads {
                    let volts = if bad.contains(&(v, d, r)) { 150.0 } else { 221.0 };
                    let reading = Reading::Volts(volts);
                    let idx = CellIndex {
                        voltage: v,
                        device: d,
                        read: r,
                        channel: 0,
                    };
                    m.write(idx, reading, policy.judge(&reading, 220.0)).unwrap();
                }
            }
        }
        m
    }

    fn selection() -> [bool; DEVICE_SLOTS] {
        sample_settings().device_selection
    }

    #[test]
    fn summary_averages_and_votes() {
        let mut summary = PlateauSummary::new(1, Plateau::High, 3, 1);
        summary.merge(&matrix(1, &[]));
        summary.merge(&matrix(1, &[(0, 1, 0)]));
        assert_eq!(summary.sweeps(), 2);

        // One G and one N: a tie passes.
        let cell = summary.cell(0, 1, 0);
        assert_eq!(cell.samples(), 2);
        assert_eq!(cell.average(), Some((221.0 + 150.0) / 2.0));
        assert_eq!(cell.judgment(), Some(Judgment::Good));

        summary.merge(&matrix(1, &[(0, 1, 0)]));
        assert_eq!(summary.cell(0, 1, 0).judgment(), Some(Judgment::NoGood));
        assert_eq!(summary.cell(0, 5, 0).judgment(), None);
    }

    #[test]
    fn one_no_good_voltage_fails_the_device() {
        let mut runs = RunAccumulator::default();
        let mut high = PlateauSummary::new(1, Plateau::High, 3, 1);
        high.merge(&matrix(1, &[(2, 1, 0)]));
        runs.push(high);

        let verdicts = runs.verdicts(&selection(), 3);
        assert_eq!(
            verdicts[1].per_voltage,
            vec![Some(Judgment::Good), Some(Judgment::Good), Some(Judgment::NoGood)]
        );
        assert_eq!(verdicts[1].overall, Some(Judgment::NoGood));
        assert_eq!(verdicts[2].overall, Some(Judgment::Good));
        assert_eq!(verdicts[0].overall_text(), "-.-");
        assert!(!verdicts[0].selected);
    }

    #[test]
    fn failure_on_any_plateau_fails_the_device() {
        let mut runs = RunAccumulator::default();
        let mut high = PlateauSummary::new(1, Plateau::High, 3, 1);
        high.merge(&matrix(1, &[]));
        let mut low = PlateauSummary::new(1, Plateau::Low, 3, 1);
        low.merge(&matrix(1, &[(1, 2, 0)]));
        runs.push(high);
        runs.push(low);

        let verdicts = runs.verdicts(&selection(), 3);
        assert_eq!(verdicts[1].overall, Some(Judgment::Good));
        assert_eq!(verdicts[2].overall, Some(Judgment::NoGood));
    }

    #[test]
    fn writes_run_artifacts() {
        let tmp = TempDir::new().unwrap();
        let reports = generator(tmp.path());
        let dir = reports.create_run_directory().unwrap();
        assert!(dir.path.is_dir());
        assert!(dir.path.starts_with(tmp.path()));

        let m = matrix(2, &[(1, 1, 0), (1, 1, 1)]);
        let record = SweepRecord {
            cycle: 1,
            plateau: Plateau::High,
            index: 1,
            temperature: Some(85.2),
            matrix: &m,
        };
        let path = reports.write_sweep(&dir, &record).unwrap();
        assert!(path.ends_with("cycle1_high_sweep1.csv"));

        let rows = read_rows(&path).unwrap();
        assert_eq!(rows[0], vec!["Model", "PSU-220"]);
        assert!(rows.contains(&vec!["Chamber Temperature (C)".to_string(), "85.20".to_string()]));
        assert!(rows.contains(&vec![
            "24.00".to_string(),
            "2".to_string(),
            String::new(),
            "1".to_string(),
            "150.00".to_string(),
            "N".to_string(),
        ]));
        assert!(rows.contains(&vec![
            "18.00".to_string(),
            "1".to_string(),
            String::new(),
            "1".to_string(),
            "-.-".to_string(),
            "-.-".to_string(),
        ]));

        let mut summary = PlateauSummary::new(1, Plateau::High, 3, 1);
        summary.merge(&m);
        let path = reports.write_plateau_summary(&dir, &summary).unwrap();
        assert!(path.ends_with("cycle1_high_summary.csv"));

        let mut runs = RunAccumulator::default();
        runs.push(summary);
        let path = reports.write_final(&dir, &runs).unwrap();
        let rows = read_rows(&path).unwrap();
        assert!(rows.contains(&vec![
            "3".to_string(),
            String::new(),
            "G".to_string(),
            "G".to_string(),
            "G".to_string(),
            "G".to_string(),
        ]));
        assert!(rows.contains(&vec![
            "Passed".to_string(),
            "1".to_string(),
            "Failed".to_string(),
            "1".to_string(),
        ]));
    }

    #[test]
    fn interrupted_report_records_stop_point() {
        let tmp = TempDir::new().unwrap();
        let reports = generator(tmp.path());
        let dir = reports.create_run_directory().unwrap();

        let at = StopPoint::new(StopReason::UserStop)
            .in_phase(1, Phase::TestingHigh)
            .at_cell(1, 2, 0, 0);
        let m = matrix(1, &[]);
        let path = reports
            .write_interrupted(&dir, &at, Some(&m), &RunAccumulator::default())
            .unwrap();
        assert!(path.ends_with(INTERRUPTED_REPORT));

        let rows = read_rows(&path).unwrap();
        assert!(rows.contains(&vec!["Reason".to_string(), "user_stop".to_string()]));
        assert!(rows.contains(&vec!["Phase".to_string(), "testing_high".to_string()]));
        assert!(rows.contains(&vec!["Device".to_string(), "3".to_string()]));
        assert!(rows.contains(&vec!["Partial Matrix".to_string()]));
    }

    #[test]
    fn run_directories_never_collide() {
        let tmp = TempDir::new().unwrap();
        let reports = generator(tmp.path());
        let a = reports.create_run_directory().unwrap();
        let b = reports.create_run_directory().unwrap();
        assert_ne!(a.path, b.path);
        assert_ne!(a.run_id, b.run_id);
    }

    #[traced_test]
    #[test]
    fn write_failures_are_logged_not_returned() {
        let tmp = TempDir::new().unwrap();
        let reports = generator(tmp.path());
        let dir = RunDirectory {
            path: tmp.path().join("missing").join("deeper"),
            run_id: Uuid::new_v4(),
            started: Local::now(),
        };
        assert!(reports.write_final(&dir, &RunAccumulator::default()).is_none());
        assert!(logs_contain("failed to write report"));
        assert!(logs_contain(&format!("Report error: {}", FINAL_REPORT)));
    }

    #[traced_test]
    #[test]
    fn unwritable_root_is_logged() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("not-a-dir");
        fs::write(&file, b"x").unwrap();
        assert!(generator(&file).create_run_directory().is_none());
        assert!(logs_contain("failed to create run directory"));
    }
}
