//! # rtu-autodetect
//!
//! Find the serial settings (baud rate, parity, data bits, stop bits) and unit
//! address of an unknown Modbus RTU slave, without knowing anything about it
//! up front.
//!
//! The scan walks every selected serial tuple in a fixed preference order,
//! verifies each device address with repeated reads over two register blocks,
//! ranks passing candidates by read stability and identity-probe support, and
//! reports the single best match. It runs on a worker thread; the caller gets
//! progress and the final outcome through a [`ScanSink`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::mpsc;
//! use rtu_autodetect::{ScanConfig, ScanController, ScanEvent, ScanOutcome, SerialTransport};
//!
//! let mut config = ScanConfig::new("/dev/ttyUSB0");
//! config.id_start = 1;
//! config.id_end = 10;
//!
//! let (tx, rx) = mpsc::channel::<ScanEvent>();
//! let mut scan = ScanController::new(config);
//! scan.start(SerialTransport::new(), tx)?;
//!
//! for event in rx {
//!     match event {
//!         ScanEvent::Progress(p) => println!("{:.1}% {}", p.percent, p.current),
//!         ScanEvent::Complete(ScanOutcome::Found(link)) => println!("Found: {link}"),
//!         ScanEvent::Complete(other) => println!("{other:?}"),
//!     }
//! }
//! # Ok::<(), rtu_autodetect::AutoDetectError>(())
//! ```

pub mod clock;
pub mod config;
pub mod identity;
pub mod mock;
pub mod progress;
pub mod protocol;
pub mod scanner;
pub mod scoreboard;
pub mod serial;
pub mod space;
pub mod types;
pub mod verify;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ScanConfig;
pub use progress::ProgressReport;
pub use scanner::{
    run_scan, score_tuple, CancellationToken, NoPortCheck, PortCheck, ScanController, ScanEvent,
    ScanPlan, ScanSink,
};
pub use serial::{find_ports, SerialTransport, Transport};
pub use space::{sample_ids, ParameterSpace};
pub use types::*;

/// Errors returned by the rtu-autodetect crate.
#[derive(Debug, thiserror::Error)]
pub enum AutoDetectError {
    /// Bad port name, device-ID range, register range or option set.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Another owner holds the serial port.
    #[error("Port {0} is already in use")]
    PortUnavailable(String),

    /// Serial open or I/O failure.
    #[error("Serial error: {0}")]
    Serial(String),

    /// No complete reply before the read timeout.
    #[error("Timed out waiting for reply")]
    Timeout,

    /// Malformed reply (framing, CRC, address or function mismatch).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The slave answered with a Modbus exception.
    #[error("Modbus exception {code:#04x} ({}) on function {function:#04x}", exception_label(.code))]
    Exception { function: u8, code: u8 },

    /// The scan worker could not be started.
    #[error("Worker error: {0}")]
    Worker(String),
}

fn exception_label(code: &u8) -> &'static str {
    protocol::exception_name(*code)
}
