//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use chamber_bench::broadcast::{BenchEvent, Broadcaster};
use chamber_bench::control::RunControl;
use chamber_bench::hardware::mock::SimBench;
use chamber_bench::hardware::DeviceChannel;
use chamber_bench::{BenchSettings, CycleRunner, ScheduleMode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Two populated slots (2 and 3), one 220 V channel, millisecond timing.
pub fn settings_json(output_root: &Path) -> String {
    format!(
        r#"{{
            "device_selection": [false, true, true, false, false, false, false, false, false, false],
            "channel_voltages": [220.0],
            "output_voltages": [18.0, 24.0, 30.0],
            "temperature": {{
                "high": {{ "enabled": true, "target_temp": 85.0, "wait_time_minutes": 0.0, "read_count": 2 }},
                "low": {{ "enabled": true, "target_temp": -40.0, "wait_time_minutes": 0.0, "read_count": 2 }}
            }},
            "delay": {{ "on_delay_ms": 0, "off_delay_ms": 0, "cycle_count": 1 }},
            "product_info": {{ "model_name": "PSU-220", "product_names": ["", "Unit B", "Unit C"] }},
            "ports": {{ "chamber": "/dev/ttyUSB0", "power": "/dev/ttyUSB1", "load": "/dev/ttyUSB2", "relay": "/dev/ttyUSB3" }},
            "timing": {{
                "chamber_poll": "5ms",
                "stop_check": "1ms",
                "stabilize_check": "1ms",
                "cycle_pacing": "1ms",
                "voltage_backoff": "1ms",
                "read_backoff": "1ms",
                "relay_backoff": "1ms",
                "chamber_backoff": "1ms",
                "chamber_timeout": "200ms",
                "power_timeout": "200ms",
                "load_timeout": "200ms",
                "relay_timeout": "200ms",
                "port_poll": "1ms",
                "lease_timeout": "50ms",
                "table_debounce": "20ms"
            }},
            "bench": {{ "output_root": {root} }}
        }}"#,
        root = serde_json::to_string(&output_root.display().to_string()).unwrap()
    )
}

pub fn settings(output_root: &Path) -> BenchSettings {
    BenchSettings::from_json_str(&settings_json(output_root))
        .expect("fixture settings must be valid")
}

/// A runner wired to simulated instruments, already switched on.
pub struct Rig {
    pub sim: SimBench,
    pub control: RunControl,
    pub events: broadcast::Receiver<BenchEvent>,
    pub runner: CycleRunner,
}

pub fn rig(settings: BenchSettings, mode: ScheduleMode) -> Rig {
    let settings = Arc::new(settings);
    let sim = SimBench::new();
    let control = RunControl::new();
    control.turn_on();
    let broadcaster = Broadcaster::default();
    let events = broadcaster.subscribe();
    let channel =
        DeviceChannel::from_settings(sim.instruments(), &settings).expect("default relay routes");
    let runner = CycleRunner::new(settings, channel, control.clone(), broadcaster, mode);
    Rig {
        sim,
        control,
        events,
        runner,
    }
}

pub fn drain(rx: &mut broadcast::Receiver<BenchEvent>) -> Vec<BenchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The single run directory created under `root`.
pub fn run_dir(root: &Path) -> PathBuf {
    let dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .unwrap()
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "expected one run directory, got {:?}", dirs);
    dirs.into_iter().next().unwrap()
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

/// Value in the second column of the first row whose first column is `key`.
pub fn field<'a>(rows: &'a [Vec<String>], key: &str) -> Option<&'a str> {
    rows.iter()
        .find(|row| row.first().map(String::as_str) == Some(key))
        .and_then(|row| row.get(1))
        .map(String::as_str)
}
