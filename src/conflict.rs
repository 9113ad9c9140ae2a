//! Conflict arbitration (C11, spec.md §4.11): last-write-wins, keyed on
//! `(updatedAt, clientId)` so that concurrent writes to the same row at the
//! same instant still resolve deterministically instead of depending on
//! arrival order.

use std::cmp::Ordering;

use uuid::Uuid;

use crate::model::Change;

/// Total order used to pick a winner between two changes to the same row:
/// the later `updatedAt` wins; a tie breaks toward the lexicographically
/// greater `clientId` (arbitrary but deterministic and total, since every
/// submitted change carries one).
pub fn winner<'a>(a: &'a Change, b: &'a Change) -> &'a Change {
    match arbitrate(a, b) {
        Ordering::Less => b,
        _ => a,
    }
}

/// `a`'s rank relative to `b`: `Greater` means `a` wins.
pub fn arbitrate(a: &Change, b: &Change) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| tiebreak_key(a).cmp(&tiebreak_key(b)))
}

fn tiebreak_key(change: &Change) -> Uuid {
    change.client_id().unwrap_or(Uuid::nil())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lsn::Lsn;
    use crate::model::{Op, Table};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn change(updated_at: chrono::DateTime<Utc>, client_id: Uuid) -> Change {
        Change::new(
            Table::Tasks,
            Op::Update,
            json!({"id": "t1", "clientId": client_id.to_string()}),
            Lsn::ZERO,
            updated_at,
        )
    }

    #[test]
    fn later_updated_at_wins() {
        let now = Utc::now();
        let earlier = change(now - Duration::seconds(1), Uuid::new_v4());
        let later = change(now, Uuid::new_v4());
        assert_eq!(winner(&earlier, &later), &later);
        assert_eq!(winner(&later, &earlier), &later);
    }

    #[test]
    fn tie_breaks_on_client_id() {
        let now = Utc::now();
        let low = change(now, Uuid::nil());
        let high = change(now, Uuid::max());
        assert_eq!(winner(&low, &high), &high);
    }

    #[test]
    fn arbitrate_is_antisymmetric() {
        let now = Utc::now();
        let a = change(now, Uuid::new_v4());
        let b = change(now + Duration::milliseconds(1), Uuid::new_v4());
        assert_eq!(arbitrate(&a, &b), Ordering::Less);
        assert_eq!(arbitrate(&b, &a), Ordering::Greater);
    }
}
