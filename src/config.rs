//! Scan configuration: the option sets an operator picks before a scan.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::space::{self, ParameterSpace};
use crate::types::{Parity, RegisterType, StopBits};
use crate::AutoDetectError;

/// Baud rates offered by default.
pub const DEFAULT_BAUD_RATES: [u32; 5] = [9600, 115200, 19200, 38400, 57600];
pub const DEFAULT_PARITIES: [Parity; 3] = [Parity::None, Parity::Even, Parity::Odd];
pub const DEFAULT_DATA_BITS: [u8; 1] = [8];
pub const DEFAULT_STOP_BITS: [StopBits; 3] = [StopBits::One, StopBits::OnePointFive, StopBits::Two];
pub const DEFAULT_SAMPLE_SIZE: usize = 3;
pub const MIN_SAMPLE_SIZE: usize = 3;

/// Everything a scan needs to know up front.
///
/// Each axis can carry one extra custom value on top of the selected presets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub port: String,
    pub id_start: u8,
    pub id_end: u8,
    pub baud_rates: Vec<u32>,
    pub custom_baud_rate: Option<u32>,
    pub parities: Vec<Parity>,
    pub custom_parity: Option<Parity>,
    pub data_bits: Vec<u8>,
    pub custom_data_bits: Option<u8>,
    pub stop_bits: Vec<StopBits>,
    pub custom_stop_bits: Option<StopBits>,
    pub register_type: RegisterType,
    pub register_start: u16,
    pub register_end: u16,
    /// Try a few evenly spaced IDs per tuple first; sweep the full range only on a hit.
    pub quick_sample: bool,
    pub sample_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            id_start: 1,
            id_end: 247,
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            custom_baud_rate: None,
            parities: DEFAULT_PARITIES.to_vec(),
            custom_parity: None,
            data_bits: DEFAULT_DATA_BITS.to_vec(),
            custom_data_bits: None,
            stop_bits: DEFAULT_STOP_BITS.to_vec(),
            custom_stop_bits: None,
            register_type: RegisterType::HoldingRegisters,
            register_start: 0,
            register_end: 1,
            quick_sample: true,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

fn with_custom<T: Copy>(selected: &[T], custom: Option<T>) -> Vec<T> {
    let mut v = selected.to_vec();
    v.extend(custom);
    v
}

impl ScanConfig {
    /// Defaults for `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, AutoDetectError> {
        serde_json::from_str(json)
            .map_err(|e| AutoDetectError::InvalidInput(format!("Bad scan config: {e}")))
    }

    /// Load a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AutoDetectError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AutoDetectError::InvalidInput(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, AutoDetectError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| AutoDetectError::InvalidInput(format!("Cannot encode scan config: {e}")))
    }

    /// Set the device-ID range from text, as typed by an operator.
    pub fn with_id_range_str(mut self, start: &str, end: &str) -> Result<Self, AutoDetectError> {
        let (start, end) = space::parse_id_range(start, end)?;
        self.id_start = start;
        self.id_end = end;
        Ok(self)
    }

    /// Set the register read range from text.
    pub fn with_register_range_str(
        mut self,
        start: &str,
        end: &str,
    ) -> Result<Self, AutoDetectError> {
        let parse = |label: &str, s: &str| {
            s.trim().parse::<u16>().map_err(|_| {
                AutoDetectError::InvalidInput(format!("{label} register '{}' is not a valid address", s.trim()))
            })
        };
        self.register_start = parse("Start", start)?;
        self.register_end = parse("End", end)?;
        Ok(self)
    }

    /// Port name with surrounding whitespace removed.
    pub fn port_name(&self) -> &str {
        self.port.trim()
    }

    pub fn selected_baud_rates(&self) -> Vec<u32> {
        with_custom(&self.baud_rates, self.custom_baud_rate)
    }

    pub fn selected_parities(&self) -> Vec<Parity> {
        with_custom(&self.parities, self.custom_parity)
    }

    pub fn selected_data_bits(&self) -> Vec<u8> {
        with_custom(&self.data_bits, self.custom_data_bits)
    }

    pub fn selected_stop_bits(&self) -> Vec<StopBits> {
        with_custom(&self.stop_bits, self.custom_stop_bits)
    }

    /// Check everything a scan relies on before it starts.
    pub fn validate(&self) -> Result<(), AutoDetectError> {
        if self.port_name().is_empty() {
            return Err(AutoDetectError::InvalidInput("No serial port selected".into()));
        }
        if self.id_end < self.id_start {
            return Err(AutoDetectError::InvalidInput(format!(
                "Device ID range {}..{} is empty",
                self.id_start, self.id_end
            )));
        }
        if self.register_end < self.register_start {
            return Err(AutoDetectError::InvalidInput(format!(
                "Register range {}..{} is empty",
                self.register_start, self.register_end
            )));
        }
        if self.quick_sample && self.sample_size < MIN_SAMPLE_SIZE {
            return Err(AutoDetectError::InvalidInput(format!(
                "Sample size {} is below the minimum of {MIN_SAMPLE_SIZE}",
                self.sample_size
            )));
        }

        let bauds = self.selected_baud_rates();
        if bauds.is_empty() {
            return Err(AutoDetectError::InvalidInput("No baud rate selected".into()));
        }
        if bauds.contains(&0) {
            return Err(AutoDetectError::InvalidInput("Baud rate must be positive".into()));
        }
        if self.selected_parities().is_empty() {
            return Err(AutoDetectError::InvalidInput("No parity selected".into()));
        }
        let data_bits = self.selected_data_bits();
        if data_bits.is_empty() {
            return Err(AutoDetectError::InvalidInput("No data bits selected".into()));
        }
        if let Some(bad) = data_bits.iter().find(|b| !(5..=8).contains(*b)) {
            return Err(AutoDetectError::InvalidInput(format!(
                "Data bits {bad} outside 5..=8"
            )));
        }
        if self.selected_stop_bits().is_empty() {
            return Err(AutoDetectError::InvalidInput("No stop bits selected".into()));
        }
        Ok(())
    }

    /// Ordered search space including custom values.
    pub fn parameter_space(&self) -> Result<ParameterSpace, AutoDetectError> {
        ParameterSpace::build(
            &self.selected_baud_rates(),
            &self.selected_parities(),
            &self.selected_data_bits(),
            &self.selected_stop_bits(),
            self.id_start,
            self.id_end,
        )
    }
}
