//! Identifier reservations

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{ReservationRow, ReservationState};

use super::scope::SequenceScope;

/// A contiguous block `[start, end]` of offsets issued within one scope.
///
/// Consumed by exactly one commit or released; never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierReservation {
    pub token: Uuid,
    pub scope: SequenceScope,
    pub start: u64,
    pub end: u64,
    /// Content hash of the source the range was reserved for
    pub source_hash: String,
    pub committed: bool,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdentifierReservation {
    /// Number of offsets in the range
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Never true; a reservation holds at least one offset
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn offsets(&self) -> RangeInclusive<u64> {
        self.start..=self.end
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl From<&ReservationRow> for IdentifierReservation {
    fn from(row: &ReservationRow) -> Self {
        Self {
            token: row.token,
            scope: row.scope.clone(),
            start: row.start,
            end: row.end,
            source_hash: row.source_hash.clone(),
            committed: row.state == ReservationState::Committed,
            issued_at: row.issued_at,
            expires_at: row.expires_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_len_and_offsets() {
        let now = Utc::now();
        let reservation = IdentifierReservation {
            token: Uuid::new_v4(),
            scope: SequenceScope::new("BR01", "20250428"),
            start: 4,
            end: 8,
            source_hash: "h".into(),
            committed: false,
            issued_at: now,
            expires_at: now + Duration::seconds(30),
        };

        assert_eq!(reservation.len(), 5);
        assert_eq!(reservation.offsets().collect::<Vec<_>>(), vec![4, 5, 6, 7, 8]);
        assert!(!reservation.is_expired(now));
        assert!(reservation.is_expired(now + Duration::seconds(31)));
    }
}
