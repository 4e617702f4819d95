//! Decide whether a (serial tuple, device id) pair is a real, stable slave.
//!
//! A well-formed reply is not enough: both register blocks must read back
//! identically several times in a row before the pair counts as a PASS.

use std::time::Duration;

use log::{debug, trace};

use crate::clock::Clock;
use crate::serial::Transport;
use crate::types::{BlockSample, RegisterType, SerialTuple, TrialResult};

/// Identical reads required per block at one timeout level.
pub const CONFIRM_READS: usize = 3;
/// Block B starts this many registers after block A.
pub const SECOND_BLOCK_OFFSET: u16 = 8;
/// Widest block read during verification.
pub const MAX_BLOCK_WIDTH: u16 = 10;
/// Read timeouts tried in order until a block is stable.
pub const TIMEOUT_LADDER: [Duration; 3] = [
    Duration::from_millis(150),
    Duration::from_millis(500),
    Duration::from_millis(1500),
];

pub const SUCCESS_BASELINE: f64 = 100.0;
pub const JITTER_WEIGHT: f64 = 10.0;
pub const NON_TRIVIAL_BONUS: f64 = 10.0;

/// A contiguous run of registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

impl RegisterBlock {
    pub fn end(&self) -> u16 {
        self.start + (self.count - 1)
    }
}

/// Blocks A and B for a requested register range.
///
/// Both are at most [`MAX_BLOCK_WIDTH`] wide, stay inside the 16-bit address
/// space and never start at the same address.
pub fn register_blocks(reg_start: u16, reg_end: u16) -> (RegisterBlock, RegisterBlock) {
    let requested = if reg_end >= reg_start {
        (reg_end - reg_start) as u32 + 1
    } else {
        1
    };
    let count = requested.min(MAX_BLOCK_WIDTH as u32) as u16;
    let max_start = u16::MAX - (count - 1);

    let a_start = reg_start.min(max_start);
    let mut b_start = reg_start.saturating_add(SECOND_BLOCK_OFFSET).min(max_start);
    if b_start == a_start {
        b_start = a_start - 1;
    }
    (
        RegisterBlock {
            start: a_start,
            count,
        },
        RegisterBlock {
            start: b_start,
            count,
        },
    )
}

/// Population standard deviation; zero for fewer than two samples or identical ones.
pub fn pstdev(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    if samples.iter().all(|&x| x == samples[0]) {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

/// Stability score of a verified pair.
///
/// `timings` are round-trip seconds of every successful read; `values` are the
/// stable words of both blocks.
pub fn stability_score(timings: &[f64], values: &[u16]) -> f64 {
    let non_trivial = values.iter().any(|&v| v != 0 && v != 0xFFFF);
    SUCCESS_BASELINE - JITTER_WEIGHT * pstdev(timings)
        + if non_trivial { NON_TRIVIAL_BONUS } else { 0.0 }
}

/// Runs the two-block stable-read check against one device id.
pub struct CandidateVerifier<'c> {
    clock: &'c dyn Clock,
}

impl<'c> CandidateVerifier<'c> {
    pub fn new(clock: &'c dyn Clock) -> Self {
        Self { clock }
    }

    /// Verify `device_id` on an already opened transport.
    ///
    /// Never fails: every transport error turns into a failed [`TrialResult`].
    pub fn verify<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        tuple: SerialTuple,
        device_id: u8,
        register_type: RegisterType,
        reg_start: u16,
        reg_end: u16,
    ) -> TrialResult {
        let (block_a, block_b) = register_blocks(reg_start, reg_end);
        let mut timings = Vec::with_capacity(CONFIRM_READS * 2);

        let Some(a) = self.stable_read(transport, device_id, register_type, block_a, &mut timings)
        else {
            return TrialResult::failed(tuple, device_id);
        };
        let Some(b) = self.stable_read(transport, device_id, register_type, block_b, &mut timings)
        else {
            return TrialResult::failed(tuple, device_id);
        };

        let values: Vec<u16> = a.iter().chain(b.iter()).copied().collect();
        let raw_score = stability_score(&timings, &values);
        trace!("{tuple} id={device_id}: stable, score {raw_score:.3}");

        TrialResult {
            tuple,
            device_id,
            passed: true,
            raw_score,
            sample: Some(BlockSample { a, b }),
        }
    }

    /// Read `block` [`CONFIRM_READS`] times per timeout level until all reads agree.
    fn stable_read<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        device_id: u8,
        register_type: RegisterType,
        block: RegisterBlock,
        timings: &mut Vec<f64>,
    ) -> Option<Vec<u16>> {
        'ladder: for timeout in TIMEOUT_LADDER {
            let mut first: Option<Vec<u16>> = None;
            let mut identical = true;
            for _ in 0..CONFIRM_READS {
                let t0 = self.clock.now();
                // A failed clear is not fatal; the read itself decides.
                let _ = transport.clear_buffers();
                match transport.read_registers(
                    device_id,
                    register_type,
                    block.start,
                    block.count,
                    timeout,
                ) {
                    Ok(values) => {
                        timings.push((self.clock.now() - t0).as_secs_f64());
                        match &first {
                            None => first = Some(values),
                            Some(f) if *f != values => identical = false,
                            Some(_) => {}
                        }
                    }
                    Err(e) => {
                        debug!(
                            "Block {}+{} read failed for id {device_id} (timeout {timeout:?}): {e}",
                            block.start, block.count
                        );
                        continue 'ladder;
                    }
                }
            }
            if identical {
                return first;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::{MockDevice, MockTransport};
    use crate::types::{Parity, StopBits};

    fn tuple() -> SerialTuple {
        SerialTuple {
            baud_rate: 9600,
            parity: Parity::Even,
            data_bits: 8,
            stop_bits: StopBits::One,
        }
    }

    #[test]
    fn blocks_default_range() {
        let (a, b) = register_blocks(0, 1);
        assert_eq!(a, RegisterBlock { start: 0, count: 2 });
        assert_eq!(b, RegisterBlock { start: 8, count: 2 });
    }

    #[test]
    fn blocks_capped_at_ten() {
        let (a, b) = register_blocks(100, 199);
        assert_eq!(a.count, 10);
        assert_eq!(b.count, 10);
        assert_eq!(a.end(), 109);
        assert_eq!(b.start, 108);
    }

    #[test]
    fn blocks_reversed_range_is_single_register() {
        let (a, b) = register_blocks(5, 2);
        assert_eq!(a, RegisterBlock { start: 5, count: 1 });
        assert_eq!(b, RegisterBlock { start: 13, count: 1 });
    }

    #[test]
    fn blocks_at_top_of_address_space() {
        let (a, b) = register_blocks(u16::MAX, u16::MAX);
        assert_eq!(a.start, u16::MAX);
        assert_ne!(a.start, b.start);
        let (a, b) = register_blocks(65530, 65535);
        assert_eq!(a.end(), 65535);
        assert!(b.end() <= u16::MAX);
        assert_ne!(a.start, b.start);
    }

    #[test]
    fn pstdev_values() {
        assert_eq!(pstdev(&[]), 0.0);
        assert_eq!(pstdev(&[0.3]), 0.0);
        assert_eq!(pstdev(&[0.1, 0.1, 0.1]), 0.0);
        assert_eq!(pstdev(&[0.012; 6]), 0.0);
        assert_eq!(stability_score(&[0.1, 0.1, 0.1, 0.1], &[0]), 100.0);
        assert!((pstdev(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn score_components() {
        assert_eq!(stability_score(&[0.01, 0.01], &[0, 0xFFFF]), 100.0);
        assert_eq!(stability_score(&[0.01, 0.01], &[0, 42]), 110.0);
        let s = stability_score(&[0.01, 0.05, 0.01, 0.05], &[0]);
        assert!((s - 99.8).abs() < 1e-9);
    }

    #[test]
    fn verify_passes_stable_device() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone())
            .with_device(MockDevice::new(tuple(), 3).registers(|addr| addr + 1));
        t.open("sim", &tuple(), TIMEOUT_LADDER[0]).unwrap();

        let result = CandidateVerifier::new(&clock).verify(
            &mut t,
            tuple(),
            3,
            RegisterType::HoldingRegisters,
            0,
            1,
        );
        assert!(result.passed);
        let sample = result.sample.unwrap();
        assert_eq!(sample.a, vec![1, 2]);
        assert_eq!(sample.b, vec![9, 10]);
        assert_eq!(result.raw_score, 110.0);
        assert_eq!(t.handle().reads(), 6);
    }

    #[test]
    fn verify_fails_silent_id() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone()).with_device(MockDevice::new(tuple(), 3));
        t.open("sim", &tuple(), TIMEOUT_LADDER[0]).unwrap();

        let result = CandidateVerifier::new(&clock).verify(
            &mut t,
            tuple(),
            4,
            RegisterType::HoldingRegisters,
            0,
            1,
        );
        assert!(!result.passed);
        assert_eq!(result.raw_score, 0.0);
        assert!(result.sample.is_none());
        // block A fails at every ladder level on the first read
        assert_eq!(t.handle().reads(), TIMEOUT_LADDER.len());
    }

    #[test]
    fn verify_fails_unstable_values() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone())
            .with_device(MockDevice::new(tuple(), 3).noisy());
        t.open("sim", &tuple(), TIMEOUT_LADDER[0]).unwrap();

        let result = CandidateVerifier::new(&clock).verify(
            &mut t,
            tuple(),
            3,
            RegisterType::HoldingRegisters,
            0,
            1,
        );
        assert!(!result.passed);
        assert_eq!(t.handle().reads(), CONFIRM_READS * TIMEOUT_LADDER.len());
    }

    #[test]
    fn verify_escalates_timeout() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone()).with_device(
            MockDevice::new(tuple(), 3)
                .register_type(RegisterType::InputRegisters)
                .latency(vec![Duration::from_millis(300)]),
        );
        t.open("sim", &tuple(), TIMEOUT_LADDER[0]).unwrap();

        let result = CandidateVerifier::new(&clock).verify(
            &mut t,
            tuple(),
            3,
            RegisterType::InputRegisters,
            0,
            1,
        );
        assert!(result.passed);
        // one timed-out read at 150 ms, then three good reads at 500 ms for A, same for B
        assert_eq!(t.handle().reads(), 8);
        assert_eq!(result.raw_score, 100.0);
    }

    #[test]
    fn verify_wrong_register_type_fails() {
        let clock = ManualClock::new();
        let mut t = MockTransport::new(clock.clone()).with_device(
            MockDevice::new(tuple(), 3).register_type(RegisterType::InputRegisters),
        );
        t.open("sim", &tuple(), TIMEOUT_LADDER[0]).unwrap();

        let result = CandidateVerifier::new(&clock).verify(
            &mut t,
            tuple(),
            3,
            RegisterType::HoldingRegisters,
            0,
            1,
        );
        assert!(!result.passed);
    }
}
