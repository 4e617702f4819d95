//! Candidate ordering: which serial tuples and device IDs to try, and in what order.

use crate::types::{Parity, SerialTuple, StopBits};
use crate::AutoDetectError;

/// Baud rates tried first, in this order.
pub const BAUD_PREFERENCE: [u32; 5] = [9600, 19200, 38400, 57600, 115200];
/// Even parity first, then none.
pub const PARITY_PREFERENCE: [Parity; 3] = [Parity::Even, Parity::None, Parity::Odd];
pub const DATA_BITS_PREFERENCE: [u8; 2] = [8, 7];
pub const STOP_BITS_PREFERENCE: [StopBits; 3] = [StopBits::Two, StopBits::One, StopBits::OnePointFive];

/// Sort `selected` by its position in `preference`; unlisted values go last.
/// Ties keep selection order. Duplicates are dropped.
pub fn prioritized<T: PartialEq + Copy>(selected: &[T], preference: &[T]) -> Vec<T> {
    let mut unique: Vec<T> = Vec::with_capacity(selected.len());
    for &v in selected {
        if !unique.contains(&v) {
            unique.push(v);
        }
    }
    // sort_by_key is stable
    unique.sort_by_key(|v| {
        preference
            .iter()
            .position(|p| p == v)
            .unwrap_or(preference.len())
    });
    unique
}

/// Parse a textual device-ID range. Bounds are trimmed before parsing.
pub fn parse_id_range(start: &str, end: &str) -> Result<(u8, u8), AutoDetectError> {
    let parse = |label: &str, s: &str| {
        s.trim().parse::<u8>().map_err(|_| {
            AutoDetectError::InvalidInput(format!("{label} device ID '{}' is not a valid address", s.trim()))
        })
    };
    let start = parse("Start", start)?;
    let end = parse("End", end)?;
    if end < start {
        return Err(AutoDetectError::InvalidInput(format!(
            "Device ID range {start}..{end} is empty"
        )));
    }
    Ok((start, end))
}

/// The ordered search space of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSpace {
    pub bauds: Vec<u32>,
    pub parities: Vec<Parity>,
    pub data_bits: Vec<u8>,
    pub stop_bits: Vec<StopBits>,
    pub device_ids: Vec<u8>,
}

impl ParameterSpace {
    /// Order each axis by preference and expand the inclusive ID range.
    pub fn build(
        bauds: &[u32],
        parities: &[Parity],
        data_bits: &[u8],
        stop_bits: &[StopBits],
        id_start: u8,
        id_end: u8,
    ) -> Result<Self, AutoDetectError> {
        if id_end < id_start {
            return Err(AutoDetectError::InvalidInput(format!(
                "Device ID range {id_start}..{id_end} is empty"
            )));
        }
        Ok(Self {
            bauds: prioritized(bauds, &BAUD_PREFERENCE),
            parities: prioritized(parities, &PARITY_PREFERENCE),
            data_bits: prioritized(data_bits, &DATA_BITS_PREFERENCE),
            stop_bits: prioritized(stop_bits, &STOP_BITS_PREFERENCE),
            device_ids: (id_start..=id_end).collect(),
        })
    }

    /// Number of serial tuples in the product.
    pub fn tuple_count(&self) -> usize {
        self.bauds.len() * self.parities.len() * self.data_bits.len() * self.stop_bits.len()
    }

    /// Tuples in nested order: baud outermost, stop bits innermost.
    pub fn tuples(&self) -> impl Iterator<Item = SerialTuple> + '_ {
        self.bauds.iter().flat_map(move |&baud_rate| {
            self.parities.iter().flat_map(move |&parity| {
                self.data_bits.iter().flat_map(move |&data_bits| {
                    self.stop_bits.iter().map(move |&stop_bits| SerialTuple {
                        baud_rate,
                        parity,
                        data_bits,
                        stop_bits,
                    })
                })
            })
        })
    }
}

/// Reduce `ids` to at most `n` evenly spaced entries, always keeping both ends.
///
/// `n` below 3 is treated as 3.
pub fn sample_ids(ids: &[u8], n: usize) -> Vec<u8> {
    let n = n.max(3);
    if ids.len() <= n {
        return ids.to_vec();
    }
    let last = ids.len() - 1;
    let step = last as f64 / (n - 1) as f64;
    let mut idxs: Vec<usize> = (0..n)
        .map(|i| ((i as f64 * step).round_ties_even() as usize).min(last))
        .collect();
    idxs.sort_unstable();
    idxs.dedup();
    idxs.into_iter().map(|i| ids[i]).collect()
}
