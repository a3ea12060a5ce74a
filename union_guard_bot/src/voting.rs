use std::fmt::Display;

use serde::{Deserialize, Serialize};
use teloxide::types::UserId;

pub const MIN_COMMITTEE_SIZE: usize = 3;
pub const MAX_COMMITTEE_SIZE: usize = 9;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VoteChoice {
    InFavor,
    Against,
    Abstained,
}

impl Display for VoteChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InFavor => write!(f, "in favor"),
            Self::Against => write!(f, "against"),
            Self::Abstained => write!(f, "abstained"),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum VoteOutcome {
    Waiting,
    Approved,
    Denied,
}

/// One committee member's slot in a vote. The identity never changes;
/// `vote` is written at most once for the lifetime of a request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Voter {
    pub user_id: UserId,
    pub is_chair: bool,
    pub vote: Option<VoteChoice>,
}

/// A malformed committee. This is an operator configuration bug,
/// not a vote state; callers must treat it as fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitteeError {
    WrongSize(usize),
    WrongChairCount(usize),
}

impl Display for CommitteeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongSize(n) => write!(
                f,
                "committee has {} members, must have {} to {}",
                n, MIN_COMMITTEE_SIZE, MAX_COMMITTEE_SIZE
            ),
            Self::WrongChairCount(n) => {
                write!(f, "committee has {} chairs, must have exactly 1", n)
            }
        }
    }
}

/// Compute the outcome of a committee vote from whatever votes are in so far.
///
/// A decision is produced as soon as it is mathematically settled, so one
/// non-responsive member cannot sit on the whole request:
///
/// - Fewer cast votes than a simple majority: `Waiting`.
/// - Either side holding a majority of the *committee* wins outright.
/// - Everyone voted and the sides are tied: the chair's own vote decides,
///   with an abstaining chair counting as a no.
/// - One non-chair straggler left, the chair has voted, and the chair's
///   side holds a strict plurality: decided early, since the last vote
///   cannot flip it past the tie-break.
///
/// Any other spread stays `Waiting`.
pub fn calculate_outcome(voters: &[Voter]) -> Result<VoteOutcome, CommitteeError> {
    let n = voters.len();
    if !(MIN_COMMITTEE_SIZE..=MAX_COMMITTEE_SIZE).contains(&n) {
        return Err(CommitteeError::WrongSize(n));
    }
    let chair_count = voters.iter().filter(|v| v.is_chair).count();
    if chair_count != 1 {
        return Err(CommitteeError::WrongChairCount(chair_count));
    }

    let majority = n / 2 + 1;

    let mut cast = 0;
    let mut in_favor = 0;
    let mut against = 0;
    let mut chair_vote = None;
    for voter in voters {
        if voter.is_chair {
            chair_vote = voter.vote;
        }
        match voter.vote {
            Some(VoteChoice::InFavor) => {
                cast += 1;
                in_favor += 1;
            }
            Some(VoteChoice::Against) => {
                cast += 1;
                against += 1;
            }
            Some(VoteChoice::Abstained) => cast += 1,
            None => (),
        }
    }

    if cast < majority {
        return Ok(VoteOutcome::Waiting);
    }

    if in_favor >= majority {
        return Ok(VoteOutcome::Approved);
    }
    if against >= majority {
        return Ok(VoteOutcome::Denied);
    }

    if cast == n && in_favor == against {
        // Full house, dead even (all-abstained lands here too).
        // The chair's vote counts double; an abstaining chair denies.
        return Ok(match chair_vote {
            Some(VoteChoice::InFavor) => VoteOutcome::Approved,
            _ => VoteOutcome::Denied,
        });
    }

    if cast == n - 1 {
        // One straggler left and the chair is not it. If the chair's side
        // already leads, the straggler cannot flip the result: at worst
        // they force the tie the chair then breaks. Deliberately nothing
        // beyond this one shape is decided early.
        match chair_vote {
            Some(VoteChoice::InFavor) if in_favor > against => return Ok(VoteOutcome::Approved),
            Some(VoteChoice::Against) if against > in_favor => return Ok(VoteOutcome::Denied),
            _ => (),
        }
    }

    Ok(VoteOutcome::Waiting)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Committee of size `n` with the chair in front, nobody voted yet.
    fn committee(n: usize) -> Vec<Voter> {
        (0..n)
            .map(|i| Voter {
                user_id: UserId(1000 + i as u64),
                is_chair: i == 0,
                vote: None,
            })
            .collect()
    }

    /// Chair gets `votes[0]`, the rest follow in order. `None` = not voted.
    fn committee_with(votes: &[Option<VoteChoice>]) -> Vec<Voter> {
        let mut voters = committee(votes.len());
        for (voter, vote) in voters.iter_mut().zip(votes) {
            voter.vote = *vote;
        }
        voters
    }

    const F: Option<VoteChoice> = Some(VoteChoice::InFavor);
    const A: Option<VoteChoice> = Some(VoteChoice::Against);
    const S: Option<VoteChoice> = Some(VoteChoice::Abstained);
    const N: Option<VoteChoice> = None;

    #[test]
    fn committee_size_is_checked() {
        assert_eq!(
            calculate_outcome(&committee(2)),
            Err(CommitteeError::WrongSize(2))
        );
        assert_eq!(
            calculate_outcome(&committee(10)),
            Err(CommitteeError::WrongSize(10))
        );
        for n in MIN_COMMITTEE_SIZE..=MAX_COMMITTEE_SIZE {
            assert_eq!(calculate_outcome(&committee(n)), Ok(VoteOutcome::Waiting));
        }
    }

    #[test]
    fn chair_count_is_checked() {
        let mut no_chair = committee(5);
        no_chair[0].is_chair = false;
        assert_eq!(
            calculate_outcome(&no_chair),
            Err(CommitteeError::WrongChairCount(0))
        );

        let mut two_chairs = committee(5);
        two_chairs[1].is_chair = true;
        assert_eq!(
            calculate_outcome(&two_chairs),
            Err(CommitteeError::WrongChairCount(2))
        );
    }

    #[test]
    fn unanimous_votes() {
        for n in MIN_COMMITTEE_SIZE..=MAX_COMMITTEE_SIZE {
            let all = |vote| {
                let mut voters = committee(n);
                for voter in &mut voters {
                    voter.vote = Some(vote);
                }
                voters
            };
            assert_eq!(
                calculate_outcome(&all(VoteChoice::InFavor)),
                Ok(VoteOutcome::Approved)
            );
            assert_eq!(
                calculate_outcome(&all(VoteChoice::Against)),
                Ok(VoteOutcome::Denied)
            );
            // An all-abstaining committee denies the request.
            assert_eq!(
                calculate_outcome(&all(VoteChoice::Abstained)),
                Ok(VoteOutcome::Denied)
            );
        }
    }

    #[test]
    fn waiting_below_majority_of_cast_votes() {
        // n=5, majority=3, only 2 cast.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, F, N, N, N])),
            Ok(VoteOutcome::Waiting)
        );
        // Abstentions count as cast votes but decide nothing on their own.
        assert_eq!(
            calculate_outcome(&committee_with(&[S, S, N, N, N])),
            Ok(VoteOutcome::Waiting)
        );
    }

    #[test]
    fn majority_decides_before_everyone_votes() {
        // n=5, majority=3.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, F, F, N, N])),
            Ok(VoteOutcome::Approved)
        );
        assert_eq!(
            calculate_outcome(&committee_with(&[A, A, A, N, N])),
            Ok(VoteOutcome::Denied)
        );
    }

    #[test]
    fn majority_against_wins_regardless_of_chair() {
        // n=8, majority=5: 3 in favor (chair among them), 5 against.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, F, F, A, A, A, A, A])),
            Ok(VoteOutcome::Denied)
        );
    }

    #[test]
    fn full_tie_broken_by_chair() {
        // n=8: 4 in favor, 4 against, chair in the in-favor group.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, F, F, F, A, A, A, A])),
            Ok(VoteOutcome::Approved)
        );
        // Chair against.
        assert_eq!(
            calculate_outcome(&committee_with(&[A, F, F, F, F, A, A, A])),
            Ok(VoteOutcome::Denied)
        );
        // Chair abstained, remaining six split evenly: abstaining chair denies.
        assert_eq!(
            calculate_outcome(&committee_with(&[S, F, F, F, A, A, A, S])),
            Ok(VoteOutcome::Denied)
        );
    }

    #[test]
    fn straggler_cannot_flip_a_leading_chair_side() {
        // n=5, majority=3. Four votes in: 2 in favor (chair included),
        // 1 against, 1 abstained. The straggler can at best force the
        // tie the chair already wins.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, F, A, S, N])),
            Ok(VoteOutcome::Approved)
        );
        // Mirror image.
        assert_eq!(
            calculate_outcome(&committee_with(&[A, A, F, S, N])),
            Ok(VoteOutcome::Denied)
        );
    }

    #[test]
    fn no_early_decision_when_the_chair_is_the_straggler() {
        // n=5: four non-chair votes in, chair silent. Even with a lead,
        // the tie-break vote is still unknown.
        assert_eq!(
            calculate_outcome(&committee_with(&[N, F, F, A, S])),
            Ok(VoteOutcome::Waiting)
        );
    }

    #[test]
    fn no_early_decision_when_the_sides_are_level() {
        // n=5: chair in favor, 1 against, 2 abstained. The sides are
        // 1-1, no strict plurality, so nothing is decided early.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, A, S, S, N])),
            Ok(VoteOutcome::Waiting)
        );
    }

    #[test]
    fn full_house_without_majority_or_tie_stays_open() {
        // n=9, majority=5: 4 in favor, 3 against, 2 abstained.
        // Deliberately left undecided.
        assert_eq!(
            calculate_outcome(&committee_with(&[F, F, F, F, A, A, A, S, S])),
            Ok(VoteOutcome::Waiting)
        );
    }

    #[test]
    fn outcome_is_deterministic_and_total() {
        // Exhaust every vote assignment for a 3-member committee; the
        // engine must always return something and agree with itself.
        let options = [F, A, S, N];
        for a in options {
            for b in options {
                for c in options {
                    let voters = committee_with(&[a, b, c]);
                    let first = calculate_outcome(&voters);
                    assert!(first.is_ok());
                    assert_eq!(first, calculate_outcome(&voters));
                }
            }
        }
    }
}
