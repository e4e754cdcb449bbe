//! Fixed-K rating adjustment.
//!
//! Winner gains K, loser drops K, draws change nothing. No expected-score
//! term: the delta is the same regardless of the players' ratings.

use serde::{Deserialize, Serialize};

use crate::core::MatchOutcome;

/// Rating adjustment magnitude per decided match.
pub const K_FACTOR: i32 = 8;

/// Rating a newly registered player starts at.
pub const INITIAL_RATING: i32 = 600;

/// Deltas for both players of a match, in record order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingDelta {
    /// Change for player A.
    pub a: i32,
    /// Change for player B.
    pub b: i32,
}

impl RatingDelta {
    /// Deltas for `outcome` with the default K.
    pub fn for_outcome(outcome: MatchOutcome) -> Self {
        Self::with_k(outcome, K_FACTOR)
    }

    /// Deltas for `outcome` with an explicit K.
    pub fn with_k(outcome: MatchOutcome, k: i32) -> Self {
        match outcome {
            MatchOutcome::AWin => Self { a: k, b: -k },
            MatchOutcome::BWin => Self { a: -k, b: k },
            MatchOutcome::Draw => Self { a: 0, b: 0 },
        }
    }

    /// True when neither rating moves.
    pub fn is_zero(&self) -> bool {
        self.a == 0 && self.b == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_a_win() {
        let d = RatingDelta::for_outcome(MatchOutcome::AWin);
        assert_eq!(INITIAL_RATING + d.a, 608);
        assert_eq!(INITIAL_RATING + d.b, 592);
    }

    #[test]
    fn test_b_win() {
        let d = RatingDelta::for_outcome(MatchOutcome::BWin);
        assert_eq!(d, RatingDelta { a: -8, b: 8 });
    }

    #[test]
    fn test_draw_is_zero() {
        assert!(RatingDelta::for_outcome(MatchOutcome::Draw).is_zero());
    }

    #[test]
    fn test_deltas_are_symmetric() {
        for outcome in [MatchOutcome::AWin, MatchOutcome::BWin, MatchOutcome::Draw] {
            let d = RatingDelta::with_k(outcome, 16);
            assert_eq!(d.a + d.b, 0);
        }
    }
}
