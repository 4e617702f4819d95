//! Modbus RTU wire codec: CRC, request builders, response framing and parsers.
//!
//! Pure functions with no I/O, usable with any transport.

use std::time::Duration;

use crate::AutoDetectError;

// --- Function codes ---
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_REPORT_SLAVE_ID: u8 = 0x11;
pub const FC_ENCAPSULATED_INTERFACE: u8 = 0x2B;

// --- Read Device Identification (FC 0x2B) ---
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;
pub const READ_DEVICE_ID_BASIC: u8 = 0x01;
pub const OBJECT_ID_VENDOR_NAME: u8 = 0x00;

pub const EXCEPTION_FLAG: u8 = 0x80;

/// Largest register count a single read may request.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest RTU frame (address + PDU + CRC).
pub const MAX_FRAME_LEN: usize = 256;

/// Modbus CRC-16 (poly 0xA001, init 0xFFFF). Sent low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// True when the trailing two bytes are the CRC of everything before them.
pub fn check_crc(frame: &[u8]) -> bool {
    if frame.len() < 4 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

/// Build a request frame: address + function + payload + CRC.
pub fn build_request(unit: u8, function: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.push(unit);
    frame.push(function);
    frame.extend_from_slice(payload);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Build a read request (function codes 1–4).
pub fn build_read_request(unit: u8, function: u8, start: u16, count: u16) -> Vec<u8> {
    let mut payload = [0u8; 4];
    payload[..2].copy_from_slice(&start.to_be_bytes());
    payload[2..].copy_from_slice(&count.to_be_bytes());
    build_request(unit, function, &payload)
}

/// Payload of a Read Device Identification request for the basic category.
pub fn device_id_request_payload() -> [u8; 3] {
    [MEI_READ_DEVICE_ID, READ_DEVICE_ID_BASIC, OBJECT_ID_VENDOR_NAME]
}

/// How many bytes of a response frame are needed, given what has arrived so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    /// Total length is known.
    Exact(usize),
    /// Need at least this many bytes before the length can be determined.
    AtLeast(usize),
}

/// Work out the length of a response frame from its leading bytes.
pub fn response_len(buf: &[u8]) -> Result<FrameLen, AutoDetectError> {
    if buf.len() < 2 {
        return Ok(FrameLen::AtLeast(2));
    }
    let function = buf[1];
    if function & EXCEPTION_FLAG != 0 {
        return Ok(FrameLen::Exact(5));
    }
    match function {
        FC_READ_COILS..=FC_READ_INPUT_REGISTERS | FC_REPORT_SLAVE_ID => {
            if buf.len() < 3 {
                Ok(FrameLen::AtLeast(3))
            } else {
                Ok(FrameLen::Exact(3 + buf[2] as usize + 2))
            }
        }
        FC_ENCAPSULATED_INTERFACE => device_id_response_len(buf),
        other => Err(AutoDetectError::Protocol(format!(
            "Unsupported function in response: {other:#04x}"
        ))),
    }
}

// addr, fc, mei, read code, conformity, more follows, next object, object count
const DEVICE_ID_HEADER: usize = 8;

fn device_id_response_len(buf: &[u8]) -> Result<FrameLen, AutoDetectError> {
    if buf.len() < 3 {
        return Ok(FrameLen::AtLeast(3));
    }
    if buf[2] != MEI_READ_DEVICE_ID {
        return Err(AutoDetectError::Protocol(format!(
            "Unexpected MEI type: {:#04x}",
            buf[2]
        )));
    }
    if buf.len() < DEVICE_ID_HEADER {
        return Ok(FrameLen::AtLeast(DEVICE_ID_HEADER));
    }
    let objects = buf[7] as usize;
    let mut pos = DEVICE_ID_HEADER;
    for _ in 0..objects {
        if buf.len() < pos + 2 {
            return Ok(FrameLen::AtLeast(pos + 2));
        }
        pos += 2 + buf[pos + 1] as usize;
    }
    let total = pos + 2;
    if total > MAX_FRAME_LEN {
        return Err(AutoDetectError::Protocol(format!(
            "Device identification frame too long ({total} bytes)"
        )));
    }
    Ok(FrameLen::Exact(total))
}

/// Validate a complete response frame and return the data after the function code.
///
/// Checks CRC, the echoed unit address and function code. An exception reply is
/// turned into [`AutoDetectError::Exception`].
pub fn parse_response(unit: u8, function: u8, frame: &[u8]) -> Result<&[u8], AutoDetectError> {
    if frame.len() < 4 {
        return Err(AutoDetectError::Protocol(format!(
            "Response too short ({} bytes)",
            frame.len()
        )));
    }
    if !check_crc(frame) {
        return Err(AutoDetectError::Protocol("CRC mismatch".into()));
    }
    if frame[0] != unit {
        return Err(AutoDetectError::Protocol(format!(
            "Reply from unit {} while addressing {}",
            frame[0], unit
        )));
    }
    if frame[1] == function | EXCEPTION_FLAG {
        return Err(AutoDetectError::Exception {
            function,
            code: frame[2],
        });
    }
    if frame[1] != function {
        return Err(AutoDetectError::Protocol(format!(
            "Expected function {:#04x}, got {:#04x}",
            function, frame[1]
        )));
    }
    Ok(&frame[2..frame.len() - 2])
}

/// Decode the data of a register read reply (byte count + big-endian words).
pub fn parse_registers(data: &[u8], count: u16) -> Result<Vec<u16>, AutoDetectError> {
    let expected = count as usize * 2;
    if data.is_empty() || data[0] as usize != expected || data.len() != expected + 1 {
        return Err(AutoDetectError::Protocol(format!(
            "Register reply carries {} bytes, expected {}",
            data.len().saturating_sub(1),
            expected
        )));
    }
    Ok(data[1..]
        .chunks_exact(2)
        .map(|w| u16::from_be_bytes([w[0], w[1]]))
        .collect())
}

/// Name of a standard Modbus exception code.
pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x0B => "Gateway Target Failed To Respond",
        _ => "Exception",
    }
}

/// RTU inter-frame silence: 3.5 character times (11 bits each), 1.75 ms above 19200 baud.
pub fn silent_interval(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    Duration::from_micros(38_500_000 / baud_rate as u64)
}
