//! Match Records
//!
//! Outcomes as reported by clients and as persisted after a room concludes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::Identity;

/// Outcome reported in a `game_over` event.
///
/// Either the winning member's identity, or a draw.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedOutcome {
    /// This member won.
    Winner(Identity),
    /// Nobody won.
    Draw,
}

/// Persisted outcome, relative to the record's player order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOutcome {
    /// Player A won.
    AWin,
    /// Player B won.
    BWin,
    /// Draw.
    Draw,
}

/// Result of a match from one participant's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalResult {
    /// Won.
    Win,
    /// Lost.
    Loss,
    /// Drew.
    Draw,
}

/// Append-only summary of a concluded match.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecord {
    /// First player (White).
    pub player_a: Identity,
    /// Second player (Black).
    pub player_b: Identity,
    /// Outcome.
    pub outcome: MatchOutcome,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl MatchRecord {
    /// Create a record stamped with the current time.
    pub fn new(player_a: Identity, player_b: Identity, outcome: MatchOutcome) -> Self {
        Self {
            player_a,
            player_b,
            outcome,
            created_at: Utc::now(),
        }
    }

    /// Winner, if any.
    pub fn winner(&self) -> Option<&Identity> {
        match self.outcome {
            MatchOutcome::AWin => Some(&self.player_a),
            MatchOutcome::BWin => Some(&self.player_b),
            MatchOutcome::Draw => None,
        }
    }

    /// Whether `identity` took part in this match.
    pub fn involves(&self, identity: &Identity) -> bool {
        &self.player_a == identity || &self.player_b == identity
    }

    /// The match from `identity`'s side, or None if they did not play.
    pub fn result_for(&self, identity: &Identity) -> Option<PersonalResult> {
        if !self.involves(identity) {
            return None;
        }
        Some(match self.winner() {
            None => PersonalResult::Draw,
            Some(w) if w == identity => PersonalResult::Win,
            Some(_) => PersonalResult::Loss,
        })
    }

    /// The other participant.
    pub fn opponent_of(&self, identity: &Identity) -> Option<&Identity> {
        if &self.player_a == identity {
            Some(&self.player_b)
        } else if &self.player_b == identity {
            Some(&self.player_a)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(outcome: MatchOutcome) -> MatchRecord {
        MatchRecord::new(Identity::new("alice"), Identity::new("bob"), outcome)
    }

    #[test]
    fn test_winner() {
        assert_eq!(record(MatchOutcome::AWin).winner(), Some(&Identity::new("alice")));
        assert_eq!(record(MatchOutcome::BWin).winner(), Some(&Identity::new("bob")));
        assert_eq!(record(MatchOutcome::Draw).winner(), None);
    }

    #[test]
    fn test_result_for_each_side() {
        let r = record(MatchOutcome::BWin);
        assert_eq!(r.result_for(&Identity::new("alice")), Some(PersonalResult::Loss));
        assert_eq!(r.result_for(&Identity::new("bob")), Some(PersonalResult::Win));
        assert_eq!(r.result_for(&Identity::new("carol")), None);

        let d = record(MatchOutcome::Draw);
        assert_eq!(d.result_for(&Identity::new("alice")), Some(PersonalResult::Draw));
    }

    #[test]
    fn test_opponent_of() {
        let r = record(MatchOutcome::Draw);
        assert_eq!(r.opponent_of(&Identity::new("alice")), Some(&Identity::new("bob")));
        assert_eq!(r.opponent_of(&Identity::new("bob")), Some(&Identity::new("alice")));
        assert_eq!(r.opponent_of(&Identity::new("carol")), None);
    }

    #[test]
    fn test_reported_outcome_wire_format() {
        let win = serde_json::to_string(&ReportedOutcome::Winner(Identity::new("alice"))).unwrap();
        assert_eq!(win, r#"{"winner":"alice"}"#);

        let draw = serde_json::to_string(&ReportedOutcome::Draw).unwrap();
        assert_eq!(draw, r#""draw""#);
    }
}
