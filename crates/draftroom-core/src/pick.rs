// Draft picks: the client's claim, the persisted record, and the
// compare-after-insert commit that detects desync.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::db::{PickStore, PickTransaction, StoreError};
use crate::protocol::LeagueId;

/// A pick as submitted by a client. `pick` is the sequence position the
/// client believes this selection occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DraftPick {
    pub pick: i64,
    pub player: i64,
    pub team: i64,
    pub league: LeagueId,
}

/// One row of a league's persisted pick history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickRecord {
    pub pick: i64,
    pub player: i64,
    pub team: i64,
    pub drafted_at: DateTime<Utc>,
}

/// Result of attempting to commit a pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickOutcome {
    /// Durable and canonical.
    Committed,
    /// The store would have assigned `assigned`, not the client's `claimed`.
    /// Nothing was persisted.
    OutOfOrder { claimed: i64, assigned: i64 },
    /// The player already appears in the league's history. Nothing was
    /// persisted.
    PlayerTaken,
}

/// Persist `pick` only if the store-assigned sequence number equals the
/// client's claim.
///
/// The row is inserted inside a transaction and the store's autoincrement
/// picks the identifier. A mismatch means the client's view of the draft was
/// stale, so the transaction is rolled back and the row never becomes
/// visible. Callers must not run two of these concurrently for the same
/// league; the hub guarantees that by handling picks one at a time.
pub fn commit_pick(store: &dyn PickStore, pick: &DraftPick) -> Result<PickOutcome, StoreError> {
    let mut tx = store.begin()?;

    let assigned = match tx.insert_pick(pick) {
        Ok(id) => id,
        Err(StoreError::PlayerTaken { .. }) => {
            rollback_quietly(tx);
            return Ok(PickOutcome::PlayerTaken);
        }
        Err(e) => {
            rollback_quietly(tx);
            return Err(e);
        }
    };

    if assigned != pick.pick {
        tx.rollback()?;
        return Ok(PickOutcome::OutOfOrder {
            claimed: pick.pick,
            assigned,
        });
    }

    tx.commit()?;
    Ok(PickOutcome::Committed)
}

fn rollback_quietly(tx: Box<dyn PickTransaction + '_>) {
    if let Err(e) = tx.rollback() {
        warn!("Rollback after failed pick insert also failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn league() -> LeagueId {
        LeagueId::new(9).unwrap()
    }

    fn pick(pick: i64, player: i64) -> DraftPick {
        DraftPick {
            pick,
            player,
            team: 1,
            league: league(),
        }
    }

    #[test]
    fn matching_claim_commits() {
        let db = Database::open(":memory:").unwrap();

        assert_eq!(commit_pick(&db, &pick(1, 100)).unwrap(), PickOutcome::Committed);
        assert_eq!(commit_pick(&db, &pick(2, 101)).unwrap(), PickOutcome::Committed);

        let history = db.pick_history(league()).unwrap();
        let seqs: Vec<i64> = history.iter().map(|r| r.pick).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn stale_claim_rolls_back() {
        let db = Database::open(":memory:").unwrap();
        commit_pick(&db, &pick(1, 100)).unwrap();

        // Second team also believes it is on the clock for pick 1.
        let outcome = commit_pick(&db, &pick(1, 200)).unwrap();
        assert_eq!(
            outcome,
            PickOutcome::OutOfOrder {
                claimed: 1,
                assigned: 2,
            }
        );
        assert_eq!(db.pick_count(league()).unwrap(), 1);
    }

    #[test]
    fn claim_ahead_of_store_rolls_back() {
        let db = Database::open(":memory:").unwrap();

        let outcome = commit_pick(&db, &pick(5, 100)).unwrap();
        assert_eq!(
            outcome,
            PickOutcome::OutOfOrder {
                claimed: 5,
                assigned: 1,
            }
        );
        assert_eq!(db.pick_count(league()).unwrap(), 0);
    }

    #[test]
    fn rollback_leaves_no_gap() {
        let db = Database::open(":memory:").unwrap();
        commit_pick(&db, &pick(1, 100)).unwrap();
        commit_pick(&db, &pick(7, 101)).unwrap();

        // The rejected attempt must not have consumed sequence number 2.
        assert_eq!(commit_pick(&db, &pick(2, 101)).unwrap(), PickOutcome::Committed);
        let seqs: Vec<i64> = db
            .pick_history(league())
            .unwrap()
            .iter()
            .map(|r| r.pick)
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn drafted_player_cannot_be_picked_again() {
        let db = Database::open(":memory:").unwrap();
        commit_pick(&db, &pick(1, 100)).unwrap();

        assert_eq!(commit_pick(&db, &pick(2, 100)).unwrap(), PickOutcome::PlayerTaken);
        assert_eq!(db.pick_count(league()).unwrap(), 1);
    }

    #[test]
    fn racing_claims_for_one_slot_commit_exactly_once() {
        let db = Database::open(":memory:").unwrap();
        commit_pick(&db, &pick(1, 100)).unwrap();

        let outcomes: Vec<PickOutcome> = (0..5)
            .map(|i| commit_pick(&db, &pick(2, 200 + i)).unwrap())
            .collect();

        let committed = outcomes
            .iter()
            .filter(|o| **o == PickOutcome::Committed)
            .count();
        assert_eq!(committed, 1);
        assert_eq!(db.pick_count(league()).unwrap(), 2);
    }
}
