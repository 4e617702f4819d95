//! Serial transport for Modbus RTU: the collaborator trait the scanner drives,
//! and the `serialport`-backed implementation.

use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort};
use std::io::Write;
use std::time::Duration;

use crate::protocol::{self, FrameLen};
use crate::types::{Parity, RegisterType, SerialTuple, StopBits};
use crate::AutoDetectError;

/// List the serial ports present on this machine, sorted by name.
pub fn find_ports() -> Vec<String> {
    let mut ports: Vec<String> = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|p| p.port_name)
        .collect();
    ports.sort();
    ports
}

/// A Modbus RTU link the scanner can reconfigure and query.
///
/// The engine only distinguishes success from failure; error details are for logs.
pub trait Transport: Send {
    /// (Re)open the port with the given line settings. Any previously open handle is closed.
    fn open(
        &mut self,
        port: &str,
        tuple: &SerialTuple,
        timeout: Duration,
    ) -> Result<(), AutoDetectError>;

    /// Close the port. Closing a closed transport is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<(), AutoDetectError>;

    /// Read `count` holding or input registers starting at `start`.
    fn read_registers(
        &mut self,
        device_id: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, AutoDetectError>;

    /// Send an arbitrary function code; returns the reply data after the function code.
    fn raw_command(
        &mut self,
        device_id: u8,
        function: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, AutoDetectError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(
        &mut self,
        port: &str,
        tuple: &SerialTuple,
        timeout: Duration,
    ) -> Result<(), AutoDetectError> {
        (**self).open(port, tuple, timeout)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn clear_buffers(&mut self) -> Result<(), AutoDetectError> {
        (**self).clear_buffers()
    }

    fn read_registers(
        &mut self,
        device_id: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, AutoDetectError> {
        (**self).read_registers(device_id, register_type, start, count, timeout)
    }

    fn raw_command(
        &mut self,
        device_id: u8,
        function: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, AutoDetectError> {
        (**self).raw_command(device_id, function, payload)
    }
}

/// Modbus RTU over a local serial port.
///
/// Flushes after every write and waits the RTU silent interval before each
/// request so back-to-back trials do not run frames together.
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self {
            port: None,
            baud_rate: 0,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, AutoDetectError> {
        self.port
            .as_mut()
            .ok_or_else(|| AutoDetectError::Serial("Port not open".into()))
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), AutoDetectError> {
        self.port()?
            .set_timeout(timeout)
            .map_err(|e| AutoDetectError::Serial(format!("Set timeout failed: {e}")))
    }

    /// Write one request frame and reassemble the reply frame.
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>, AutoDetectError> {
        let silence = protocol::silent_interval(self.baud_rate);
        let port = self.port()?;

        std::thread::sleep(silence);
        port.write_all(request)
            .map_err(|e| AutoDetectError::Serial(format!("Write failed: {e}")))?;
        port.flush()
            .map_err(|e| AutoDetectError::Serial(format!("Flush failed: {e}")))?;

        let mut frame = Vec::with_capacity(protocol::MAX_FRAME_LEN);
        loop {
            let (want, exact) = match protocol::response_len(&frame)? {
                FrameLen::Exact(n) => (n, true),
                FrameLen::AtLeast(n) => (n, false),
            };
            if want > protocol::MAX_FRAME_LEN {
                return Err(AutoDetectError::Protocol(format!(
                    "Reply length {want} exceeds RTU frame limit"
                )));
            }
            if frame.len() < want {
                let chunk = read_up_to(&mut **port, want - frame.len())?;
                if chunk.is_empty() {
                    return Err(if frame.is_empty() {
                        AutoDetectError::Timeout
                    } else {
                        AutoDetectError::Protocol(format!(
                            "Truncated reply: {} of {want} bytes",
                            frame.len()
                        ))
                    });
                }
                frame.extend_from_slice(&chunk);
                continue;
            }
            if exact {
                return Ok(frame);
            }
        }
    }
}

impl Default for SerialTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read up to `len` bytes (returns fewer on timeout).
fn read_up_to(port: &mut dyn SerialPort, len: usize) -> Result<Vec<u8>, AutoDetectError> {
    let mut buf = vec![0u8; len];
    let mut total = 0;
    while total < len {
        match port.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
            Err(e) => return Err(AutoDetectError::Serial(format!("Read failed: {e}"))),
        }
    }
    buf.truncate(total);
    Ok(buf)
}

fn to_data_bits(bits: u8) -> Result<DataBits, AutoDetectError> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => Err(AutoDetectError::Serial(format!(
            "Unsupported data bits: {other}"
        ))),
    }
}

fn to_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

fn to_stop_bits(stop_bits: StopBits) -> Result<serialport::StopBits, AutoDetectError> {
    match stop_bits {
        StopBits::One => Ok(serialport::StopBits::One),
        StopBits::Two => Ok(serialport::StopBits::Two),
        StopBits::OnePointFive => Err(AutoDetectError::Serial(
            "1.5 stop bits not supported by this driver".into(),
        )),
    }
}

impl Transport for SerialTransport {
    fn open(
        &mut self,
        port_name: &str,
        tuple: &SerialTuple,
        timeout: Duration,
    ) -> Result<(), AutoDetectError> {
        self.close();

        let port = serialport::new(port_name, tuple.baud_rate)
            .data_bits(to_data_bits(tuple.data_bits)?)
            .parity(to_parity(tuple.parity))
            .stop_bits(to_stop_bits(tuple.stop_bits)?)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| AutoDetectError::Serial(format!("Failed to open {port_name}: {e}")))?;

        port.clear(ClearBuffer::All)
            .map_err(|e| AutoDetectError::Serial(format!("Clear buffer failed: {e}")))?;

        self.port = Some(port);
        self.baud_rate = tuple.baud_rate;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the handle releases the OS port.
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn clear_buffers(&mut self) -> Result<(), AutoDetectError> {
        self.port()?
            .clear(ClearBuffer::All)
            .map_err(|e| AutoDetectError::Serial(format!("Clear buffer failed: {e}")))
    }

    fn read_registers(
        &mut self,
        device_id: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, AutoDetectError> {
        if count == 0 || count > protocol::MAX_READ_REGISTERS {
            return Err(AutoDetectError::InvalidInput(format!(
                "Register count {count} outside 1..={}",
                protocol::MAX_READ_REGISTERS
            )));
        }
        self.set_timeout(timeout)?;
        let function = register_type.function_code();
        let request = protocol::build_read_request(device_id, function, start, count);
        let frame = self.transact(&request)?;
        let data = protocol::parse_response(device_id, function, &frame)?;
        protocol::parse_registers(data, count)
    }

    fn raw_command(
        &mut self,
        device_id: u8,
        function: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, AutoDetectError> {
        let request = protocol::build_request(device_id, function, payload);
        let frame = self.transact(&request)?;
        protocol::parse_response(device_id, function, &frame).map(|data| data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_setting_conversions() {
        assert!(matches!(to_data_bits(8), Ok(DataBits::Eight)));
        assert!(matches!(to_data_bits(7), Ok(DataBits::Seven)));
        assert!(to_data_bits(9).is_err());
        assert_eq!(to_parity(Parity::Even), serialport::Parity::Even);
        assert!(matches!(to_stop_bits(StopBits::Two), Ok(serialport::StopBits::Two)));
        assert!(to_stop_bits(StopBits::OnePointFive).is_err());
    }

    #[test]
    fn closed_transport_rejects_io() {
        let mut t = SerialTransport::new();
        assert!(!t.is_open());
        assert!(t.clear_buffers().is_err());
        assert!(t
            .read_registers(1, RegisterType::HoldingRegisters, 0, 1, Duration::from_millis(10))
            .is_err());
        t.close();
    }

    #[test]
    fn open_bogus_port_fails() {
        let mut t = SerialTransport::new();
        let tuple = SerialTuple {
            baud_rate: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
        };
        assert!(t
            .open("/dev/nonexistent_port_xyz", &tuple, Duration::from_millis(100))
            .is_err());
        assert!(!t.is_open());
    }
}
