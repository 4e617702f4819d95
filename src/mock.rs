//! In-memory Modbus RTU bus for exercising the scanner without hardware.
//!
//! A [`MockTransport`] answers only for the [`MockDevice`]s registered on it,
//! and only while the port is open with the device's exact serial tuple.
//! Simulated latency advances a shared [`ManualClock`], so timing-dependent
//! scores are deterministic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::clock::ManualClock;
use crate::protocol::{FC_ENCAPSULATED_INTERFACE, FC_REPORT_SLAVE_ID, MEI_READ_DEVICE_ID};
use crate::serial::Transport;
use crate::types::{RegisterType, SerialTuple};
use crate::AutoDetectError;

/// Latency used when a device has none configured.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(10);

const ILLEGAL_FUNCTION: u8 = 0x01;
const ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Which identity probes a simulated slave supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    None,
    DeviceId,
    ReportSlaveId,
    Both,
    /// Answers both probes with structurally invalid data.
    Malformed,
}

type RegisterFn = Arc<dyn Fn(u16) -> u16 + Send + Sync>;

/// One simulated slave.
#[derive(Clone)]
pub struct MockDevice {
    tuple: SerialTuple,
    device_id: u8,
    register_type: RegisterType,
    registers: RegisterFn,
    latency: Vec<Duration>,
    identity: Identity,
    noisy: bool,
}

impl MockDevice {
    /// A holding-register slave at `device_id` that only talks on `tuple`.
    /// Registers read as zero.
    pub fn new(tuple: SerialTuple, device_id: u8) -> Self {
        Self {
            tuple,
            device_id,
            register_type: RegisterType::HoldingRegisters,
            registers: Arc::new(|_| 0),
            latency: vec![DEFAULT_LATENCY],
            identity: Identity::None,
            noisy: false,
        }
    }

    /// Register value as a function of its address.
    pub fn registers(mut self, f: impl Fn(u16) -> u16 + Send + Sync + 'static) -> Self {
        self.registers = Arc::new(f);
        self
    }

    /// Reply latencies, cycled per read.
    pub fn latency(mut self, cycle: Vec<Duration>) -> Self {
        if !cycle.is_empty() {
            self.latency = cycle;
        }
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Every read returns different values.
    pub fn noisy(mut self) -> Self {
        self.noisy = true;
        self
    }

    /// The only register table this slave serves; the other one raises an exception.
    pub fn register_type(mut self, register_type: RegisterType) -> Self {
        self.register_type = register_type;
        self
    }

    fn answers(&self, tuple: &SerialTuple, device_id: u8) -> bool {
        self.tuple == *tuple && self.device_id == device_id
    }

    fn identity_reply(&self, function: u8) -> Result<Vec<u8>, AutoDetectError> {
        let exception = Err(AutoDetectError::Exception {
            function,
            code: ILLEGAL_FUNCTION,
        });
        match (function, self.identity) {
            (FC_ENCAPSULATED_INTERFACE, Identity::DeviceId | Identity::Both) => Ok(vec![
                MEI_READ_DEVICE_ID,
                0x01,
                0x01,
                0x00,
                0x00,
                0x01,
                0x00,
                0x03,
                b'S',
                b'I',
                b'M',
            ]),
            (FC_ENCAPSULATED_INTERFACE, Identity::Malformed) => {
                Ok(vec![MEI_READ_DEVICE_ID - 1, 0x01, 0x01, 0x00, 0x00])
            }
            (FC_REPORT_SLAVE_ID, Identity::ReportSlaveId | Identity::Both) => {
                Ok(vec![5, self.device_id, 0xFF, b'S', b'I', b'M'])
            }
            (FC_REPORT_SLAVE_ID, Identity::Malformed) => Ok(vec![9, self.device_id]),
            _ => exception,
        }
    }
}

#[derive(Default)]
struct MockState {
    open: Option<SerialTuple>,
    timeout: Duration,
    opens: usize,
    closes: usize,
    reads: usize,
    probes: Vec<u8>,
    trials: Vec<(SerialTuple, u8)>,
    latency_cursor: HashMap<(SerialTuple, u8), usize>,
    noise: u16,
}

/// Read-only view of a [`MockTransport`]'s activity, usable after the
/// transport has moved into a scan worker.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    /// Tuple of the currently open port.
    pub fn open_tuple(&self) -> Option<SerialTuple> {
        self.state().open
    }

    /// Successful opens so far.
    pub fn opens(&self) -> usize {
        self.state().opens
    }

    /// Closes of an open port so far.
    pub fn closes(&self) -> usize {
        self.state().closes
    }

    /// Register read attempts so far, including failed ones.
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Function codes of every raw command, in order.
    pub fn probes(&self) -> Vec<u8> {
        self.state().probes.clone()
    }

    /// Distinct device ids read on `tuple`, in first-read order.
    pub fn ids_tried(&self, tuple: &SerialTuple) -> Vec<u8> {
        let mut ids = Vec::new();
        for (t, id) in &self.state().trials {
            if t == tuple && !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }
}

/// Simulated serial bus with any number of slaves.
pub struct MockTransport {
    clock: ManualClock,
    devices: Vec<MockDevice>,
    fail_open: Vec<SerialTuple>,
    on_read: Option<Box<dyn FnMut(u8) + Send>>,
    read_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            devices: Vec::new(),
            fail_open: Vec::new(),
            on_read: None,
            read_delay: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Opening the port with `tuple` fails.
    pub fn fail_open(mut self, tuple: SerialTuple) -> Self {
        self.fail_open.push(tuple);
        self
    }

    /// Called with the device id before every register read.
    pub fn on_read(mut self, hook: impl FnMut(u8) + Send + 'static) -> Self {
        self.on_read = Some(Box::new(hook));
        self
    }

    /// Real wall-clock sleep before every register read.
    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(&self, tuple: &SerialTuple, device_id: u8) -> Option<&MockDevice> {
        self.devices.iter().find(|d| d.answers(tuple, device_id))
    }
}

impl Transport for MockTransport {
    fn open(
        &mut self,
        port: &str,
        tuple: &SerialTuple,
        timeout: Duration,
    ) -> Result<(), AutoDetectError> {
        self.close();
        if self.fail_open.contains(tuple) {
            return Err(AutoDetectError::Serial(format!(
                "Failed to open {port} at {tuple}"
            )));
        }
        let mut state = self.state();
        state.open = Some(*tuple);
        state.timeout = timeout;
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.state();
        if state.open.take().is_some() {
            state.closes += 1;
        }
    }

    fn is_open(&self) -> bool {
        self.state().open.is_some()
    }

    fn clear_buffers(&mut self) -> Result<(), AutoDetectError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AutoDetectError::Serial("Port not open".into()))
        }
    }

    fn read_registers(
        &mut self,
        device_id: u8,
        register_type: RegisterType,
        start: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, AutoDetectError> {
        if let Some(hook) = self.on_read.as_mut() {
            hook(device_id);
        }
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }

        let tuple = {
            let mut state = self.state();
            state.reads += 1;
            state.timeout = timeout;
            let tuple = state
                .open
                .ok_or_else(|| AutoDetectError::Serial("Port not open".into()))?;
            state.trials.push((tuple, device_id));
            tuple
        };

        let Some(device) = self.device(&tuple, device_id) else {
            self.clock.advance(timeout);
            return Err(AutoDetectError::Timeout);
        };

        let (latency, noise) = {
            let mut state = self.state();
            let cursor = state.latency_cursor.entry((tuple, device_id)).or_insert(0);
            let latency = device.latency[*cursor % device.latency.len()];
            *cursor += 1;
            state.noise = state.noise.wrapping_add(1);
            (latency, state.noise)
        };
        if latency > timeout {
            self.clock.advance(timeout);
            return Err(AutoDetectError::Timeout);
        }
        self.clock.advance(latency);

        if register_type != device.register_type {
            return Err(AutoDetectError::Exception {
                function: register_type.function_code(),
                code: ILLEGAL_DATA_ADDRESS,
            });
        }

        let mut values: Vec<u16> = (0..count)
            .map(|i| (device.registers)(start.wrapping_add(i)))
            .collect();
        if device.noisy {
            if let Some(first) = values.first_mut() {
                *first = first.wrapping_add(noise);
            }
        }
        Ok(values)
    }

    fn raw_command(
        &mut self,
        device_id: u8,
        function: u8,
        _payload: &[u8],
    ) -> Result<Vec<u8>, AutoDetectError> {
        let (tuple, timeout) = {
            let mut state = self.state();
            state.probes.push(function);
            let tuple = state
                .open
                .ok_or_else(|| AutoDetectError::Serial("Port not open".into()))?;
            (tuple, state.timeout)
        };

        match self.device(&tuple, device_id) {
            Some(device) => {
                self.clock.advance(device.latency[0]);
                device.identity_reply(function)
            }
            None => {
                self.clock.advance(timeout);
                Err(AutoDetectError::Timeout)
            }
        }
    }
}
