//! Chamber controller protocol.
//!
//! Query: `RRD,01,0001\r\n`. Reply: `OK,01,<code>\r\n`, where `<code>` is
//! four hex digits holding the temperature in hundredths of a degree with
//! its two bytes swapped: `280A` is `0x0A28` = 2600 = 26.00 °C. Codes above
//! 32767 are negative (two's complement).

use crate::error::ChannelError;
use crate::hardware::serial::{ResponseKind, SerialLink};
use crate::hardware::Chamber;
use async_trait::async_trait;
use tracing::instrument;

/// Temperature read request.
pub const QUERY: &[u8] = b"RRD,01,0001\r\n";

/// Decode a four-digit byte-swapped temperature code into °C.
pub fn decode_temperature(code: &str) -> Result<f64, ChannelError> {
    let code = code.trim();
    if code.len() != 4 {
        return Err(ChannelError::Validation(format!(
            "temperature code '{}' is not four hex digits",
            code
        )));
    }
    let raw = u16::from_str_radix(code, 16).map_err(|_| {
        ChannelError::Validation(format!("temperature code '{}' is not hex", code))
    })?;
    let hundredths = raw.swap_bytes() as i16;
    Ok(f64::from(hundredths) / 100.0)
}

/// Parse a complete reply line.
pub fn parse_reply(line: &str) -> Result<f64, ChannelError> {
    let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    match fields.as_slice() {
        ["OK", _, code, ..] => decode_temperature(code),
        [status, ..] => Err(ChannelError::Validation(format!(
            "chamber replied '{}' ({})",
            status,
            line.trim()
        ))),
        [] => Err(ChannelError::Validation("empty chamber reply".to_string())),
    }
}

/// Chamber on a serial link.
#[derive(Debug, Clone)]
pub struct SerialChamber {
    link: SerialLink,
}

impl SerialChamber {
    /// Chamber reachable over `link`.
    pub fn new(link: SerialLink) -> Self {
        Self { link }
    }
}

#[async_trait]
impl Chamber for SerialChamber {
    #[instrument(skip(self), fields(port = %self.link.port()), err)]
    async fn read_temperature(&self) -> Result<f64, ChannelError> {
        let reply = self.link.transact(QUERY, ResponseKind::Line).await?;
        parse_reply(&String::from_utf8_lossy(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::serial::testing::{link, ScriptedOpener};

    #[test]
    fn decodes_byte_swapped_codes() {
        assert_eq!(decode_temperature("280A").unwrap(), 26.0);
        assert_eq!(decode_temperature("0000").unwrap(), 0.0);
        // -40.00 °C = -4000 = 0xF060
        assert_eq!(decode_temperature("60F0").unwrap(), -40.0);
        // 85.50 °C = 8550 = 0x2166
        assert_eq!(decode_temperature("6621").unwrap(), 85.5);
        // 0x8000 is the most negative code
        assert_eq!(decode_temperature("0080").unwrap(), -327.68);
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(decode_temperature("28G0").is_err());
        assert!(decode_temperature("280").is_err());
    }

    #[test]
    fn parses_reply_status() {
        assert_eq!(parse_reply("OK,01,280A\r\n").unwrap(), 26.0);
        assert!(parse_reply("NG,01,0001").is_err());
        assert!(parse_reply("OK,01").is_err());
    }

    #[tokio::test]
    async fn reads_over_serial_link() {
        let opener = ScriptedOpener::new(|request| {
            (request == QUERY).then(|| b"OK,01,60F0\r\n".to_vec())
        });
        let chamber = SerialChamber::new(link("chamber", opener));
        assert_eq!(chamber.read_temperature().await.unwrap(), -40.0);
    }

    #[tokio::test]
    async fn silent_chamber_is_a_timeout_not_a_reading() {
        let opener = ScriptedOpener::new(|_| None);
        let chamber = SerialChamber::new(link("chamber", opener));
        assert!(chamber.read_temperature().await.unwrap_err().is_timeout());
    }
}
