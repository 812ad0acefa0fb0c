use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::types::{DisputeVote, VoteSide};

pub const DEFAULT_WIN_THRESHOLD: u32 = 248;
pub const DEFAULT_DISPUTE_HOURS: i64 = 72;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DisputeTally {
    pub performer: u32,
    pub customer: u32,
}

impl DisputeTally {
    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a DisputeVote>) -> Self {
        votes
            .into_iter()
            .fold(Self::default(), |mut tally, vote| {
                tally.record(vote.vote_side);
                tally
            })
    }

    pub fn record(&mut self, side: VoteSide) {
        match side {
            VoteSide::Performer => self.performer += 1,
            VoteSide::Customer => self.customer += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.performer + self.customer
    }

    /// Share of votes for the performer, 50 with no votes
    pub fn performer_percent(&self) -> f64 {
        match self.total() {
            0 => 50.0,
            total => f64::from(self.performer) / f64::from(total) * 100.0,
        }
    }

    /// Side with more votes; ties go to the customer
    pub fn leader(&self) -> VoteSide {
        if self.performer > self.customer {
            VoteSide::Performer
        } else {
            VoteSide::Customer
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DisputeRules {
    pub win_threshold: u32,
    pub window: Duration,
}

impl Default for DisputeRules {
    fn default() -> Self {
        Self {
            win_threshold: DEFAULT_WIN_THRESHOLD,
            window: Duration::hours(DEFAULT_DISPUTE_HOURS),
        }
    }
}

impl DisputeRules {
    pub fn ends_at(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        started_at + self.window
    }

    /// Winning side once the dispute is decided
    pub fn outcome(
        &self,
        tally: &DisputeTally,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<VoteSide> {
        if tally.performer >= self.win_threshold {
            return Some(VoteSide::Performer);
        }
        if tally.customer >= self.win_threshold {
            return Some(VoteSide::Customer);
        }
        if now >= self.ends_at(started_at) {
            return Some(tally.leader());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(performer: u32, customer: u32) -> DisputeTally {
        DisputeTally {
            performer,
            customer,
        }
    }

    #[test]
    fn empty_tally_shows_even_split() {
        assert_eq!(DisputeTally::default().performer_percent(), 50.0);
        assert_eq!(tally(3, 1).performer_percent(), 75.0);
    }

    #[test]
    fn threshold_wins_before_window_closes() {
        let rules = DisputeRules::default();
        let start = Utc::now();
        assert_eq!(
            rules.outcome(&tally(248, 10), start, start),
            Some(VoteSide::Performer)
        );
        assert_eq!(
            rules.outcome(&tally(0, 248), start, start),
            Some(VoteSide::Customer)
        );
        assert_eq!(rules.outcome(&tally(247, 0), start, start), None);
    }

    #[test]
    fn window_close_picks_majority_and_ties_go_to_customer() {
        let rules = DisputeRules::default();
        let start = Utc::now() - Duration::hours(73);
        let now = Utc::now();
        assert_eq!(rules.outcome(&tally(5, 4), start, now), Some(VoteSide::Performer));
        assert_eq!(rules.outcome(&tally(4, 4), start, now), Some(VoteSide::Customer));
        assert_eq!(rules.outcome(&tally(0, 0), start, now), Some(VoteSide::Customer));
    }
}
