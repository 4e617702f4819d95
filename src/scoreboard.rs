//! Running best candidate.

use crate::types::{Candidate, Parity};

/// Parity order used to break exact score ties.
pub const PARITY_TIE_PREFERENCE: [Parity; 3] = [Parity::None, Parity::Even, Parity::Odd];

fn tie_rank(parity: Parity) -> usize {
    PARITY_TIE_PREFERENCE
        .iter()
        .position(|&p| p == parity)
        .unwrap_or(PARITY_TIE_PREFERENCE.len())
}

/// Keeps only the highest-ranked [`Candidate`] offered so far.
#[derive(Debug, Default)]
pub struct Scoreboard {
    best: Option<Candidate>,
}

impl Scoreboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `new` should replace `current`.
    pub fn beats(new: &Candidate, current: &Candidate) -> bool {
        new.final_score > current.final_score
            || (new.final_score == current.final_score
                && tie_rank(new.tuple.parity) < tie_rank(current.tuple.parity))
    }

    /// Fold a PASS in. Returns whether it became the new best.
    pub fn offer(&mut self, candidate: Candidate) -> bool {
        let replace = match &self.best {
            None => true,
            Some(current) => Self::beats(&candidate, current),
        };
        if replace {
            self.best = Some(candidate);
        }
        replace
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }

    pub fn into_best(self) -> Option<Candidate> {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SerialTuple, StopBits};

    fn cand(parity: Parity, device_id: u8, score: f64) -> Candidate {
        Candidate {
            tuple: SerialTuple {
                baud_rate: 9600,
                parity,
                data_bits: 8,
                stop_bits: StopBits::One,
            },
            device_id,
            register_block_start: 0,
            register_block_end: 1,
            final_score: score,
        }
    }

    #[test]
    fn first_offer_taken() {
        let mut board = Scoreboard::new();
        assert!(board.best().is_none());
        assert!(board.offer(cand(Parity::Odd, 1, 50.0)));
        assert_eq!(board.best().unwrap().device_id, 1);
    }

    #[test]
    fn higher_score_replaces() {
        let mut board = Scoreboard::new();
        board.offer(cand(Parity::None, 1, 100.0));
        assert!(board.offer(cand(Parity::Odd, 2, 100.5)));
        assert!(!board.offer(cand(Parity::None, 3, 99.0)));
        assert_eq!(board.into_best().unwrap().device_id, 2);
    }

    #[test]
    fn tie_prefers_no_parity() {
        let mut board = Scoreboard::new();
        board.offer(cand(Parity::Even, 1, 110.0));
        assert!(board.offer(cand(Parity::None, 2, 110.0)));
        assert_eq!(board.best().unwrap().tuple.parity, Parity::None);

        // and the reverse order keeps N
        let mut board = Scoreboard::new();
        board.offer(cand(Parity::None, 1, 110.0));
        assert!(!board.offer(cand(Parity::Even, 2, 110.0)));
        assert_eq!(board.best().unwrap().device_id, 1);
    }

    #[test]
    fn tie_prefers_even_over_odd() {
        let mut board = Scoreboard::new();
        board.offer(cand(Parity::Odd, 1, 110.0));
        assert!(board.offer(cand(Parity::Even, 2, 110.0)));
    }

    #[test]
    fn same_parity_tie_first_found_wins() {
        let mut board = Scoreboard::new();
        board.offer(cand(Parity::Even, 1, 110.0));
        assert!(!board.offer(cand(Parity::Even, 2, 110.0)));
        assert_eq!(board.best().unwrap().device_id, 1);
    }

    #[test]
    fn device_id_bonus_beats_report_slave_id_bonus() {
        use crate::identity::{DEVICE_ID_BONUS, REPORT_SLAVE_ID_BONUS};
        for base in [90.0, 99.8, 100.0, 110.0] {
            let mut board = Scoreboard::new();
            board.offer(cand(Parity::None, 1, base + REPORT_SLAVE_ID_BONUS));
            assert!(board.offer(cand(Parity::Odd, 2, base + DEVICE_ID_BONUS)));
        }
    }
}
