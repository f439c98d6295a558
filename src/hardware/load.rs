//! Multi-channel load analyzer. `MEAS:VOLT? CH<n>` returns one reading.

use crate::config::{MAX_CHANNELS, READ_LIMIT_V};
use crate::error::ChannelError;
use crate::hardware::serial::{ResponseKind, SerialLink};
use crate::hardware::{parse_numeric_reply, LoadAnalyzer};
use async_trait::async_trait;
use tracing::instrument;

/// Query for a 0-based channel (the analyzer numbers channels from 1).
pub fn measure_command(channel: usize) -> String {
    format!("MEAS:VOLT? CH{}\n", channel + 1)
}

/// Load analyzer on a serial link.
#[derive(Debug, Clone)]
pub struct SerialLoadAnalyzer {
    link: SerialLink,
}

impl SerialLoadAnalyzer {
    /// Analyzer reachable over `link`.
    pub fn new(link: SerialLink) -> Self {
        Self { link }
    }
}

#[async_trait]
impl LoadAnalyzer for SerialLoadAnalyzer {
    #[instrument(skip(self), fields(port = %self.link.port()), err)]
    async fn read_channel(&self, channel: usize) -> Result<f64, ChannelError> {
        if channel >= MAX_CHANNELS {
            return Err(ChannelError::Validation(format!(
                "channel {} does not exist",
                channel + 1
            )));
        }
        let reply = self
            .link
            .transact(measure_command(channel).as_bytes(), ResponseKind::Line)
            .await?;
        let volts = parse_numeric_reply(&reply)?;
        if volts.abs() > READ_LIMIT_V {
            return Err(ChannelError::Validation(format!(
                "reading {} V exceeds ±{} V",
                volts, READ_LIMIT_V
            )));
        }
        Ok(volts)
    }
}
