//! Relay bank addressing, the MODBUS relay driver and the relay job queue.
//!
//! Sixteen relays sit on two MODBUS RTU boards (bank addresses 1 and 2, eight
//! coils each). Relay `r` is coil `r % 8` on bank `1 + r / 8`.
//!
//! A device slot is energised through three relays: a row relay on bank 1, a
//! column relay on bank 2 and an offset relay that selects the slot group.
//! Selection switches them on in that order; deselection switches them off in
//! reverse.
//!
//! Every relay transaction goes through [`RelayQueue`], a single worker task
//! that executes jobs strictly in submission order, one at a time.

use crate::config::DEVICE_SLOTS;
use crate::error::ChannelError;
use crate::hardware::crc::{self, build_frame, validate_frame};
use crate::hardware::serial::{ResponseKind, SerialLink};
use crate::hardware::RelayBank;
use async_trait::async_trait;
use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument};

/// Relays addressable on the two boards.
pub const RELAY_COUNT: usize = 16;
/// Coils per board.
pub const COILS_PER_BANK: u8 = 8;
/// MODBUS bank addresses.
pub const BANKS: [u8; 2] = [1, 2];

/// MODBUS function code for one coil.
pub const WRITE_SINGLE_COIL: u8 = 0x05;
/// MODBUS function code for a coil range.
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Index into the relay table (0..16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayIndex(u8);

impl RelayIndex {
    /// Rejects indices outside the relay table.
    pub fn new(index: u8) -> Result<Self, ChannelError> {
        if usize::from(index) < RELAY_COUNT {
            Ok(Self(index))
        } else {
            Err(ChannelError::Validation(format!(
                "relay index {} out of range 0..{}",
                index, RELAY_COUNT
            )))
        }
    }

    /// Table index.
    pub fn get(self) -> u8 {
        self.0
    }

    /// MODBUS slave address of the board carrying this relay.
    pub fn bank(self) -> u8 {
        1 + self.0 / COILS_PER_BANK
    }

    /// Coil number on its board.
    pub fn coil(self) -> u8 {
        self.0 % COILS_PER_BANK
    }
}

impl fmt::Display for RelayIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Write-single-coil frame switching one relay.
pub fn coil_frame(relay: RelayIndex, on: bool) -> Vec<u8> {
    let value = if on { 0xFF } else { 0x00 };
    build_frame(
        relay.bank(),
        WRITE_SINGLE_COIL,
        &[0x00, relay.coil(), value, 0x00],
    )
}

/// Write-multiple-coils frame clearing all eight coils of a bank.
pub fn clear_bank_frame(bank: u8) -> Vec<u8> {
    build_frame(
        bank,
        WRITE_MULTIPLE_COILS,
        &[0x00, 0x00, 0x00, COILS_PER_BANK, 0x01, 0x00],
    )
}

/// The three relays that energise one device slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRoute {
    relays: [RelayIndex; 3],
}

impl DeviceRoute {
    /// Route from `[row, column, offset]` relay numbers.
    pub fn new(relays: [u8; 3]) -> Result<Self, ChannelError> {
        Ok(Self {
            relays: [
                RelayIndex::new(relays[0])?,
                RelayIndex::new(relays[1])?,
                RelayIndex::new(relays[2])?,
            ],
        })
    }

    /// Built-in wiring: row `slot / 5`, column `8 + slot % 5`, offset `13 + slot / 5`.
    pub fn for_slot(slot: usize) -> Self {
        let slot = (slot % DEVICE_SLOTS) as u8;
        Self {
            relays: [
                RelayIndex(slot / 5),
                RelayIndex(8 + slot % 5),
                RelayIndex(13 + slot / 5),
            ],
        }
    }

    /// Relay numbers in switch-on order.
    pub fn relays(&self) -> [u8; 3] {
        self.relays.map(RelayIndex::get)
    }

    /// Row, column, offset.
    pub fn on_sequence(&self) -> [RelayIndex; 3] {
        self.relays
    }

    /// Offset, column, row.
    pub fn off_sequence(&self) -> [RelayIndex; 3] {
        let [row, column, offset] = self.relays;
        [offset, column, row]
    }
}

/// Route per device slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoutes {
    routes: Vec<DeviceRoute>,
}

impl Default for RelayRoutes {
    fn default() -> Self {
        Self {
            routes: (0..DEVICE_SLOTS).map(DeviceRoute::for_slot).collect(),
        }
    }
}

impl RelayRoutes {
    /// Routes from `bench.relay_routes`, or the built-in wiring.
    pub fn from_config(overrides: Option<&[[u8; 3]]>) -> Result<Self, ChannelError> {
        match overrides {
            None => Ok(Self::default()),
            Some(list) if list.len() == DEVICE_SLOTS => Ok(Self {
                routes: list
                    .iter()
                    .map(|relays| DeviceRoute::new(*relays))
                    .collect::<Result<_, _>>()?,
            }),
            Some(list) => Err(ChannelError::Validation(format!(
                "expected {} relay routes, got {}",
                DEVICE_SLOTS,
                list.len()
            ))),
        }
    }

    /// Route for `slot`, if the slot exists.
    pub fn route(&self, slot: usize) -> Option<DeviceRoute> {
        self.routes.get(slot).copied()
    }
}

// =============================================================================
// MODBUS relay driver
// =============================================================================

/// Relay bank on a MODBUS RTU serial link.
#[derive(Debug, Clone)]
pub struct SerialRelayBank {
    link: SerialLink,
}

impl SerialRelayBank {
    /// Bank reachable over `link`.
    pub fn new(link: SerialLink) -> Self {
        Self { link }
    }

    async fn exchange(&self, frame: &[u8], function: u8) -> Result<(), ChannelError> {
        let reply = self.link.transact(frame, ResponseKind::Modbus).await?;
        let payload = validate_frame(&reply, function)?;
        let expected = &frame[2..frame.len() - 2];
        // Both write functions echo address and value/quantity
        if reply[0] != frame[0] || payload.get(..4) != expected.get(..4) {
            return Err(ChannelError::Validation(format!(
                "relay echo mismatch: sent {}, got {}",
                crc::hex(frame),
                crc::hex(&reply)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RelayBank for SerialRelayBank {
    #[instrument(skip(self), fields(port = %self.link.port()), err)]
    async fn set_relay(&self, relay: RelayIndex, on: bool) -> Result<(), ChannelError> {
        self.exchange(&coil_frame(relay, on), WRITE_SINGLE_COIL)
            .await
    }

    #[instrument(skip(self), fields(port = %self.link.port()), err)]
    async fn all_off(&self) -> Result<(), ChannelError> {
        for bank in BANKS {
            self.exchange(&clear_bank_frame(bank), WRITE_MULTIPLE_COILS)
                .await?;
        }
        Ok(())
    }
}

// =============================================================================
// Relay queue
// =============================================================================

/// A relay job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// Switch one relay.
    Set {
        /// Relay to switch.
        relay: RelayIndex,
        /// Energise when true.
        on: bool,
    },
    /// Switch every relay off.
    AllOff,
}

impl fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayCommand::Set { relay, on: true } => write!(f, "{} ON", relay),
            RelayCommand::Set { relay, on: false } => write!(f, "{} OFF", relay),
            RelayCommand::AllOff => f.write_str("ALL OFF"),
        }
    }
}

struct RelayJob {
    command: RelayCommand,
    reply: oneshot::Sender<Result<(), ChannelError>>,
}

/// Single-lane relay job queue.
///
/// Jobs run in the order they were enqueued, one at a time. A failed or
/// panicking job reports its error to its own submitter and the worker moves on.
#[derive(Debug, Clone)]
pub struct RelayQueue {
    tx: mpsc::UnboundedSender<RelayJob>,
}

impl RelayQueue {
    /// Spawn the worker task. Must be called inside a Tokio runtime.
    pub fn spawn(bank: Arc<dyn RelayBank>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RelayJob>();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                debug!(command = %job.command, "relay job started");
                let result = AssertUnwindSafe(execute(bank.as_ref(), job.command))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        error!(command = %job.command, "relay job panicked");
                        Err(ChannelError::Transport {
                            port: "relay queue".to_string(),
                            message: format!("job {} panicked", job.command),
                        })
                    });
                // Submitter may have gone away
                let _ = job.reply.send(result);
            }
            debug!("relay queue closed");
        });

        Self { tx }
    }

    /// Queue a job; its position is fixed at this call.
    pub fn enqueue(
        &self,
        command: RelayCommand,
    ) -> Result<oneshot::Receiver<Result<(), ChannelError>>, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RelayJob { command, reply })
            .map_err(|_| ChannelError::QueueClosed)?;
        Ok(rx)
    }

    /// Queue a job and wait for its result.
    pub async fn submit(&self, command: RelayCommand) -> Result<(), ChannelError> {
        self.enqueue(command)?
            .await
            .map_err(|_| ChannelError::QueueClosed)?
    }
}

async fn execute(bank: &dyn RelayBank, command: RelayCommand) -> Result<(), ChannelError> {
    match command {
        RelayCommand::Set { relay, on } => bank.set_relay(relay, on).await,
        RelayCommand::AllOff => bank.all_off().await,
    }
}
