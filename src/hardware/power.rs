//! Programmable power source, SCPI-style text protocol.
//!
//! `VOLT <v>` programs the output, `VOLT?` reads it back and `OUTP ON|OFF`
//! switches the output stage. A set is only trusted once the read-back value
//! lands within [`SETPOINT_TOLERANCE_V`] of the request.

use crate::config::SOURCE_LIMIT_V;
use crate::error::ChannelError;
use crate::hardware::serial::{ResponseKind, SerialLink};
use crate::hardware::{parse_numeric_reply, PowerSource};
use async_trait::async_trait;
use tracing::{debug, instrument};

/// Maximum read-back deviation accepted after a set.
pub const SETPOINT_TOLERANCE_V: f64 = 0.5;

/// SCPI setpoint command.
pub fn set_command(volts: f64) -> String {
    format!("VOLT {:.2}\n", volts)
}

/// SCPI read-back query.
pub const QUERY: &[u8] = b"VOLT?\n";

/// Power source on a serial link.
#[derive(Debug, Clone)]
pub struct SerialPowerSource {
    link: SerialLink,
}

impl SerialPowerSource {
    /// Source reachable over `link`.
    pub fn new(link: SerialLink) -> Self {
        Self { link }
    }
}

#[async_trait]
impl PowerSource for SerialPowerSource {
    #[instrument(skip(self), fields(port = %self.link.port()), err)]
    async fn set_voltage(&self, volts: f64) -> Result<f64, ChannelError> {
        if !volts.is_finite() || volts.abs() > SOURCE_LIMIT_V {
            return Err(ChannelError::Validation(format!(
                "{} V is outside the source limit of ±{} V",
                volts, SOURCE_LIMIT_V
            )));
        }

        self.link.send(set_command(volts).as_bytes()).await?;
        let reply = self.link.transact(QUERY, ResponseKind::Line).await?;
        let actual = parse_numeric_reply(&reply)?;

        if (actual - volts).abs() > SETPOINT_TOLERANCE_V {
            return Err(ChannelError::Validation(format!(
                "source reads back {:.2} V after setting {:.2} V",
                actual, volts
            )));
        }
        debug!(requested = volts, actual, "source voltage set");
        Ok(actual)
    }

    #[instrument(skip(self), fields(port = %self.link.port()), err)]
    async fn set_output(&self, enabled: bool) -> Result<(), ChannelError> {
        let command: &[u8] = if enabled { b"OUTP ON\n" } else { b"OUTP OFF\n" };
        self.link.send(command).await
    }
}
