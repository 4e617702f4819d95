//! Identity probes that corroborate a PASS.
//!
//! Only structural checks are made on the replies; their content is not decoded.

use log::debug;

use crate::protocol::{self, FC_ENCAPSULATED_INTERFACE, FC_REPORT_SLAVE_ID, MEI_READ_DEVICE_ID};
use crate::serial::Transport;

/// Bonus for a well-formed Read Device Identification (0x2B / 0x0E) reply.
pub const DEVICE_ID_BONUS: f64 = 140.0;
/// Bonus for a well-formed Report Slave ID (0x11) reply.
pub const REPORT_SLAVE_ID_BONUS: f64 = 100.0;

/// Which probe a slave answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityProbe {
    DeviceIdentification,
    ReportSlaveId,
}

impl IdentityProbe {
    pub fn bonus(self) -> f64 {
        match self {
            IdentityProbe::DeviceIdentification => DEVICE_ID_BONUS,
            IdentityProbe::ReportSlaveId => REPORT_SLAVE_ID_BONUS,
        }
    }
}

/// Reply data of 0x2B must echo the MEI type and carry at least the fixed header.
pub fn is_device_id_reply(data: &[u8]) -> bool {
    data.len() >= 5 && data[0] == MEI_READ_DEVICE_ID
}

/// Reply data of 0x11 starts with its own byte count.
pub fn is_report_slave_id_reply(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] as usize == data.len() - 1
}

/// Try Read Device Identification, then Report Slave ID. First success wins.
///
/// Probe errors mean "not supported" and are never returned.
pub fn probe<T: Transport + ?Sized>(transport: &mut T, device_id: u8) -> Option<IdentityProbe> {
    match transport.raw_command(
        device_id,
        FC_ENCAPSULATED_INTERFACE,
        &protocol::device_id_request_payload(),
    ) {
        Ok(data) if is_device_id_reply(&data) => return Some(IdentityProbe::DeviceIdentification),
        Ok(data) => debug!("id {device_id}: malformed 0x2B/0x0E reply ({} bytes)", data.len()),
        Err(e) => debug!("id {device_id}: 0x2B/0x0E probe failed: {e}"),
    }

    match transport.raw_command(device_id, FC_REPORT_SLAVE_ID, &[]) {
        Ok(data) if is_report_slave_id_reply(&data) => Some(IdentityProbe::ReportSlaveId),
        Ok(data) => {
            debug!("id {device_id}: malformed 0x11 reply ({} bytes)", data.len());
            None
        }
        Err(e) => {
            debug!("id {device_id}: 0x11 probe failed: {e}");
            None
        }
    }
}

/// Score bonus earned by `device_id`, zero when neither probe is supported.
pub fn identity_bonus<T: Transport + ?Sized>(transport: &mut T, device_id: u8) -> f64 {
    probe(transport, device_id).map_or(0.0, IdentityProbe::bonus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{Identity, MockDevice, MockTransport};
    use crate::types::{Parity, SerialTuple, StopBits};
    use std::time::Duration;

    fn tuple() -> SerialTuple {
        SerialTuple {
            baud_rate: 19200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::Two,
        }
    }

    fn transport(identity: Identity) -> MockTransport {
        let mut t = MockTransport::new(ManualClock::new())
            .with_device(MockDevice::new(tuple(), 9).identity(identity));
        t.open("sim", &tuple(), Duration::from_millis(150)).unwrap();
        t
    }

    #[test]
    fn device_id_reply_checks() {
        assert!(is_device_id_reply(&[0x0E, 0x01, 0x01, 0x00, 0x00]));
        assert!(!is_device_id_reply(&[0x0E, 0x01, 0x01, 0x00]));
        assert!(!is_device_id_reply(&[0x0D, 0x01, 0x01, 0x00, 0x00]));
        assert!(!is_device_id_reply(&[]));
    }

    #[test]
    fn report_slave_id_reply_checks() {
        assert!(is_report_slave_id_reply(&[0x01, 0x09]));
        assert!(is_report_slave_id_reply(&[0x03, 0x09, 0xFF, 0x41]));
        assert!(!is_report_slave_id_reply(&[0x05, 0x09]));
        assert!(!is_report_slave_id_reply(&[0x00]));
        assert!(!is_report_slave_id_reply(&[]));
    }

    #[test]
    fn device_id_preferred() {
        let mut t = transport(Identity::Both);
        assert_eq!(probe(&mut t, 9), Some(IdentityProbe::DeviceIdentification));
        assert_eq!(t.handle().probes(), vec![0x2B]);
    }

    #[test]
    fn falls_back_to_report_slave_id() {
        let mut t = transport(Identity::ReportSlaveId);
        assert_eq!(probe(&mut t, 9), Some(IdentityProbe::ReportSlaveId));
        assert_eq!(t.handle().probes(), vec![0x2B, 0x11]);
        assert_eq!(identity_bonus(&mut t, 9), REPORT_SLAVE_ID_BONUS);
    }

    #[test]
    fn unsupported_gives_no_bonus() {
        let mut t = transport(Identity::None);
        assert_eq!(probe(&mut t, 9), None);
        assert_eq!(identity_bonus(&mut t, 9), 0.0);
    }

    #[test]
    fn malformed_replies_rejected() {
        let mut t = transport(Identity::Malformed);
        assert_eq!(probe(&mut t, 9), None);
    }

    #[test]
    fn absent_device_swallowed() {
        let mut t = transport(Identity::Both);
        assert_eq!(probe(&mut t, 10), None);
    }

    #[test]
    fn device_id_bonus_outranks_report_slave_id() {
        let base = 100.0;
        assert!(base + IdentityProbe::DeviceIdentification.bonus() > base + IdentityProbe::ReportSlaveId.bonus());
    }
}
