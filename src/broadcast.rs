//! Progress and table broadcast.
//!
//! One [`Broadcaster`] topic fans every [`BenchEvent`] out to any number of
//! observers. Table snapshots go through a [`TableDebouncer`] first: an update
//! is published at once when the last publication is older than the debounce
//! interval, otherwise it waits for the next interval boundary and is
//! coalesced with whatever arrives in between. [`TableDebouncer::flush`]
//! bypasses the timer and returns once the snapshot is on the topic.
//!
//! On the wire every event is one line, `<TAG>:<payload>`:
//!
//! ```text
//! PROGRESS:Cycle 1 high: 24.00 V, device 3, read 1/2
//! TABLE:{"voltages":[18.0,24.0,30.0],"cells":[...]}
//! TEMP:85.20
//! DIR:reports/20240101_120000
//! STOPPED:{"reason":"user_stop",...}
//! RUNNING:false
//! ```

use crate::control::StopPoint;
use crate::matrix::TableSnapshot;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

/// Default topic capacity. Slow observers lag rather than block the run.
pub const DEFAULT_CAPACITY: usize = 1024;

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchEvent {
    /// Human-readable progress line.
    Progress(String),
    /// Debounced measurement table.
    Table(TableSnapshot),
    /// Chamber temperature in °C.
    Temperature(f64),
    /// A run directory was created.
    DirectoryCreated(PathBuf),
    /// The run finished normally.
    Completed(StopPoint),
    /// The run stopped on request or after a recoverable failure.
    Stopped(StopPoint),
    /// The run failed.
    Error(StopPoint),
    /// Running status.
    Running(bool),
}

impl BenchEvent {
    /// Wire tag, e.g. `TEMP`.
    pub fn tag(&self) -> &'static str {
        match self {
            BenchEvent::Progress(_) => "PROGRESS",
            BenchEvent::Table(_) => "TABLE",
            BenchEvent::Temperature(_) => "TEMP",
            BenchEvent::DirectoryCreated(_) => "DIR",
            BenchEvent::Completed(_) => "COMPLETED",
            BenchEvent::Stopped(_) => "STOPPED",
            BenchEvent::Error(_) => "ERROR",
            BenchEvent::Running(_) => "RUNNING",
        }
    }

    /// Completed, Stopped and Error end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BenchEvent::Completed(_) | BenchEvent::Stopped(_) | BenchEvent::Error(_)
        )
    }

    /// Encode as a single `<TAG>:<payload>` line (without newline).
    pub fn to_wire(&self) -> String {
        let payload = match self {
            BenchEvent::Progress(text) => text.replace('\n', " "),
            BenchEvent::Table(snapshot) => to_json(snapshot),
            BenchEvent::Temperature(celsius) => format!("{:.2}", celsius),
            BenchEvent::DirectoryCreated(path) => path.display().to_string(),
            BenchEvent::Completed(point)
            | BenchEvent::Stopped(point)
            | BenchEvent::Error(point) => to_json(point),
            BenchEvent::Running(running) => running.to_string(),
        };
        format!("{}:{}", self.tag(), payload)
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!("{{\"encoding_error\":{:?}}}", e.to_string()))
}

// =============================================================================
// Broadcaster
// =============================================================================

/// Fan-out point for bench events.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<BenchEvent>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Broadcaster {
    /// Topic holding at most `capacity` unread events per observer.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New observer; it sees only events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<BenchEvent> {
        self.tx.subscribe()
    }

    /// Publish one event. Having no observers is not an error.
    pub fn publish(&self, event: BenchEvent) {
        trace!(tag = event.tag(), "broadcast");
        if self.tx.send(event).is_err() {
            trace!("no observers subscribed");
        }
    }

    /// Publish a progress line.
    pub fn progress(&self, text: impl Into<String>) {
        self.publish(BenchEvent::Progress(text.into()));
    }

    /// Publish the running status.
    pub fn running(&self, running: bool) {
        self.publish(BenchEvent::Running(running));
    }

    /// Phase transition: progress text followed by the running status.
    pub fn phase(&self, text: impl Into<String>, running: bool) {
        let text = text.into();
        info!(phase = %text, "phase transition");
        self.progress(text);
        self.running(running);
    }

    /// Terminal event followed by the running status.
    pub fn terminal(&self, event: BenchEvent, running: bool) {
        debug_assert!(event.is_terminal());
        info!(event = %event.to_wire(), "run finished");
        self.publish(event);
        self.running(running);
    }
}

// =============================================================================
// Table debouncing
// =============================================================================

enum TableCommand {
    Update(TableSnapshot),
    Flush(TableSnapshot, oneshot::Sender<()>),
}

/// Timer-backed coalescing stage in front of the broadcaster for table events.
#[derive(Debug, Clone)]
pub struct TableDebouncer {
    tx: mpsc::UnboundedSender<TableCommand>,
}

impl TableDebouncer {
    /// Spawn the coalescing task. It ends once every handle is dropped, after
    /// publishing any pending snapshot.
    pub fn spawn(broadcaster: Broadcaster, interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_debouncer(rx, broadcaster, interval));
        Self { tx }
    }

    /// Debounced table update.
    pub fn update(&self, snapshot: TableSnapshot) {
        if self.tx.send(TableCommand::Update(snapshot)).is_err() {
            debug!("table debouncer has stopped; update dropped");
        }
    }

    /// Publish `snapshot` immediately, discarding any pending update.
    pub async fn flush(&self, snapshot: TableSnapshot) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(TableCommand::Flush(snapshot, ack_tx)).is_err() {
            debug!("table debouncer has stopped; flush dropped");
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_debouncer(
    mut rx: mpsc::UnboundedReceiver<TableCommand>,
    broadcaster: Broadcaster,
    interval: Duration,
) {
    let mut last_sent: Option<Instant> = None;
    let mut pending: Option<TableSnapshot> = None;
    let mut deadline: Option<Instant> = None;

    let publish = |snapshot: TableSnapshot, last_sent: &mut Option<Instant>| {
        broadcaster.publish(BenchEvent::Table(snapshot));
        *last_sent = Some(Instant::now());
    };

    loop {
        let timer = sleep_until(deadline.unwrap_or_else(Instant::now));
        tokio::select! {
            command = rx.recv() => match command {
                Some(TableCommand::Update(snapshot)) => {
                    let now = Instant::now();
                    match last_sent {
                        Some(at) if now < at + interval => {
                            pending = Some(snapshot);
                            deadline = Some(at + interval);
                        }
                        _ => {
                            pending = None;
                            deadline = None;
                            publish(snapshot, &mut last_sent);
                        }
                    }
                }
                Some(TableCommand::Flush(snapshot, ack)) => {
                    pending = None;
                    deadline = None;
                    publish(snapshot, &mut last_sent);
                    let _ = ack.send(());
                }
                None => {
                    if let Some(snapshot) = pending.take() {
                        publish(snapshot, &mut last_sent);
                    }
                    break;
                }
            },
            _ = timer, if deadline.is_some() => {
                deadline = None;
                if let Some(snapshot) = pending.take() {
                    publish(snapshot, &mut last_sent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{Phase, StopReason};
    use crate::matrix::MeasurementMatrix;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::{sleep, timeout};

    fn snapshot(tag: f64) -> TableSnapshot {
        MeasurementMatrix::new(1, 1, 1, 1).snapshot(&[tag])
    }

    fn drain(rx: &mut broadcast::Receiver<BenchEvent>) -> Vec<BenchEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    #[test]
    fn wire_format() {
        assert_eq!(BenchEvent::Temperature(85.204).to_wire(), "TEMP:85.20");
        assert_eq!(BenchEvent::Running(true).to_wire(), "RUNNING:true");
        assert_eq!(
            BenchEvent::Progress("a\nb".to_string()).to_wire(),
            "PROGRESS:a b"
        );
        assert_eq!(
            BenchEvent::DirectoryCreated(PathBuf::from("out/run")).to_wire(),
            "DIR:out/run"
        );

        let table = BenchEvent::Table(snapshot(24.0)).to_wire();
        assert_eq!(
            table,
            r#"TABLE:{"voltages":[24.0],"cells":[[[[{"voltage":"-.-","judgment":"-.-"}]]]]}"#
        );
    }

    #[test]
    fn terminal_payload_carries_stop_point() {
        let point = StopPoint::new(StopReason::UserStop)
            .in_phase(1, Phase::TestingHigh)
            .at_cell(1, 2, 0, 0);
        let wire = BenchEvent::Stopped(point).to_wire();
        let json: serde_json::Value =
            serde_json::from_str(wire.strip_prefix("STOPPED:").unwrap()).unwrap();
        assert_eq!(json["reason"], "user_stop");
        assert_eq!(json["voltage_index"], 1);
        assert_eq!(json["device_index"], 2);
        assert!(json["message"].is_null());
    }

    #[tokio::test]
    async fn terminal_and_phase_events_pair_with_running() {
        let broadcaster = Broadcaster::default();
        let mut rx = broadcaster.subscribe();

        broadcaster.phase("Cycle 1: waiting for high temperature", true);
        broadcaster.terminal(
            BenchEvent::Completed(StopPoint::new(StopReason::Completed)),
            false,
        );

        let tags: Vec<_> = drain(&mut rx).iter().map(|e| e.to_wire()).collect();
        assert_eq!(tags.len(), 4);
        assert!(tags[0].starts_with("PROGRESS:"));
        assert_eq!(tags[1], "RUNNING:true");
        assert!(tags[2].starts_with("COMPLETED:"));
        assert_eq!(tags[3], "RUNNING:false");
    }

    #[test]
    fn publishing_without_observers_is_fine() {
        Broadcaster::new(4).progress("nobody listening");
    }

    #[tokio::test]
    async fn rapid_updates_are_coalesced() {
        let broadcaster = Broadcaster::default();
        let mut rx = broadcaster.subscribe();
        let tables = TableDebouncer::spawn(broadcaster.clone(), Duration::from_millis(100));

        for i in 0..10 {
            tables.update(snapshot(i as f64));
        }

        // The first update goes out at once.
        let first = timeout(Duration::from_millis(50), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, BenchEvent::Table(snapshot(0.0)));

        sleep(Duration::from_millis(300)).await;
        let rest = drain(&mut rx);
        assert_eq!(rest, vec![BenchEvent::Table(snapshot(9.0))]);
    }

    #[tokio::test]
    async fn quiet_topic_publishes_immediately() {
        let broadcaster = Broadcaster::default();
        let mut rx = broadcaster.subscribe();
        let tables = TableDebouncer::spawn(broadcaster.clone(), Duration::from_millis(30));

        tables.update(snapshot(1.0));
        timeout(Duration::from_millis(20), rx.recv())
            .await
            .unwrap()
            .unwrap();

        sleep(Duration::from_millis(60)).await;
        tables.update(snapshot(2.0));
        let second = timeout(Duration::from_millis(20), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second, BenchEvent::Table(snapshot(2.0)));
    }

    #[tokio::test]
    async fn flush_bypasses_the_timer_and_drops_pending() {
        let broadcaster = Broadcaster::default();
        let mut rx = broadcaster.subscribe();
        let tables = TableDebouncer::spawn(broadcaster.clone(), Duration::from_secs(10));

        tables.update(snapshot(1.0));
        tables.update(snapshot(2.0));
        tables.flush(snapshot(3.0)).await;

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                BenchEvent::Table(snapshot(1.0)),
                BenchEvent::Table(snapshot(3.0)),
            ]
        );
    }

    #[tokio::test]
    async fn pending_update_is_published_on_shutdown() {
        let broadcaster = Broadcaster::default();
        let mut rx = broadcaster.subscribe();
        let tables = TableDebouncer::spawn(broadcaster.clone(), Duration::from_secs(10));

        tables.update(snapshot(1.0));
        tables.update(snapshot(2.0));
        drop(tables);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(event);
        }
        assert_eq!(seen[1], BenchEvent::Table(snapshot(2.0)));
    }
}
