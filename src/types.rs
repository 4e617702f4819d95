use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serial parity setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N")]
    None,
    #[serde(rename = "E")]
    Even,
    #[serde(rename = "O")]
    Odd,
}

impl Parity {
    /// Single-letter form used in `8N1`-style notation.
    pub fn letter(self) -> char {
        match self {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Parity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        match s.trim().to_ascii_uppercase().as_str() {
            "N" | "NONE" => Ok(Parity::None),
            "E" | "EVEN" => Ok(Parity::Even),
            "O" | "ODD" => Ok(Parity::Odd),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

impl StopBits {
    pub fn as_f32(self) -> f32 {
        match self {
            StopBits::One => 1.0,
            StopBits::OnePointFive => 1.5,
            StopBits::Two => 2.0,
        }
    }
}

impl TryFrom<f32> for StopBits {
    type Error = String;
    fn try_from(v: f32) -> Result<Self, String> {
        if v == 1.0 {
            Ok(StopBits::One)
        } else if v == 1.5 {
            Ok(StopBits::OnePointFive)
        } else if v == 2.0 {
            Ok(StopBits::Two)
        } else {
            Err(format!("unsupported stop bits {v}"))
        }
    }
}

impl From<StopBits> for f32 {
    fn from(s: StopBits) -> f32 {
        s.as_f32()
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopBits::One => f.write_str("1"),
            StopBits::OnePointFive => f.write_str("1.5"),
            StopBits::Two => f.write_str("2"),
        }
    }
}

/// Register table read during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegisterType {
    /// Function code 0x03.
    #[serde(rename = "holding")]
    HoldingRegisters = 0x03,
    /// Function code 0x04.
    #[serde(rename = "input")]
    InputRegisters = 0x04,
}

impl RegisterType {
    pub fn function_code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for RegisterType {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            0x03 => Ok(Self::HoldingRegisters),
            0x04 => Ok(Self::InputRegisters),
            _ => Err(v),
        }
    }
}

impl fmt::Display for RegisterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterType::HoldingRegisters => f.write_str("03: Holding Registers"),
            RegisterType::InputRegisters => f.write_str("04: Input Registers"),
        }
    }
}

/// One serial line configuration. Two consecutive equal tuples share an open port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SerialTuple {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: StopBits,
}

impl fmt::Display for SerialTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// Register values captured from the two verification blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockSample {
    pub a: Vec<u16>,
    pub b: Vec<u16>,
}

/// Outcome of verifying one (tuple, device id) pair.
#[derive(Debug, Clone)]
pub struct TrialResult {
    pub tuple: SerialTuple,
    pub device_id: u8,
    pub passed: bool,
    pub raw_score: f64,
    pub sample: Option<BlockSample>,
}

impl TrialResult {
    pub(crate) fn failed(tuple: SerialTuple, device_id: u8) -> Self {
        Self {
            tuple,
            device_id,
            passed: false,
            raw_score: 0.0,
            sample: None,
        }
    }
}

/// A scored PASS, including any identity-probe bonus.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub tuple: SerialTuple,
    pub device_id: u8,
    pub register_block_start: u16,
    pub register_block_end: u16,
    pub final_score: f64,
}

/// The settings handed back when a scan finds a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedLink {
    pub port: String,
    pub device_id: u8,
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub register_type: RegisterType,
    pub stability_score: f64,
    pub elapsed: Duration,
}

impl DetectedLink {
    pub fn tuple(&self) -> SerialTuple {
        SerialTuple {
            baud_rate: self.baud_rate,
            parity: self.parity,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
        }
    }
}

impl fmt::Display for DetectedLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ID={}, {} {} {}{} (score {:.2}, {})",
            self.port,
            self.device_id,
            self.baud_rate,
            self.parity,
            self.data_bits,
            self.stop_bits,
            self.stability_score,
            crate::progress::format_hms(self.elapsed),
        )
    }
}

/// Terminal result of a scan, delivered once through the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    Found(DetectedLink),
    NotFound,
    Cancelled,
}

/// Controller lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanState::Completed | ScanState::Cancelled | ScanState::Failed
        )
    }
}
