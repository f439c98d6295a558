//! CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF) and RTU frame checks.
//!
//! The CRC is appended low byte first, as MODBUS RTU requires.

use crate::error::ChannelError;
use crc::{Crc, CRC_16_MODBUS};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Exception responses set the high bit of the function code.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// CRC of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

/// Append the CRC to `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Build a complete frame from address, function code and payload.
pub fn build_frame(address: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(address);
    frame.push(function);
    frame.extend_from_slice(payload);
    append_crc(&mut frame);
    frame
}

/// True when the trailing two bytes match the CRC of the rest.
pub fn crc_matches(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body).to_le_bytes() == [tail[0], tail[1]]
}

/// Check a response frame before trusting it.
///
/// Rejects short frames, bad CRCs, exception responses and function codes
/// other than `expected_function`. Returns the bytes between the function
/// code and the CRC.
pub fn validate_frame(frame: &[u8], expected_function: u8) -> Result<&[u8], ChannelError> {
    if frame.len() < 4 {
        return Err(ChannelError::Validation(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    if !crc_matches(frame) {
        return Err(ChannelError::Validation(format!(
            "CRC mismatch in frame {}",
            hex(frame)
        )));
    }

    let function = frame[1];
    if function == expected_function | EXCEPTION_FLAG {
        return Err(ChannelError::Validation(format!(
            "device exception 0x{:02X} for function 0x{:02X}",
            frame[2], expected_function
        )));
    }
    if function != expected_function {
        return Err(ChannelError::Validation(format!(
            "unexpected function code 0x{:02X}, expected 0x{:02X}",
            function, expected_function
        )));
    }

    Ok(&frame[2..frame.len() - 2])
}

/// Space-separated uppercase hex, for logs and error messages.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
