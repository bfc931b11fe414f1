//! Sequence Authority - durable identifier range assignment
//!
//! - The ledger is the sole source of truth for every scope's
//!   high-water-mark; the authority keeps no counter of its own
//! - `reserve` is one transactional increment against the ledger: the read
//!   of the prior value and the durable write happen under one lock
//! - Released numbers are skipped forever, never reissued
//! - Scopes are independent; same-scope callers serialize only at the
//!   increment
//! - Transient ledger failures are retried locally with bounded backoff
//! - Ledger calls made on behalf of a file run on the blocking pool

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::crash_point::{maybe_crash, points};
use crate::ledger::{offload, LedgerStore, ReleasedRange, ReservationState, ReserveRequest, ScopeRow};
use crate::observability::{
    log_event_with_fields, record_audit, AuditAction, AuditLog, AuditOutcome, AuditRecord, Event,
};
use crate::retry::{retry_transient, RetryPolicy};

use super::errors::{AuthorityError, AuthorityResult};
use super::reservation::IdentifierReservation;
use super::scope::SequenceScope;

/// Release reason used when an outstanding reservation outlived its TTL
pub const REASON_EXPIRED: &str = "expired";

/// Authority configuration
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// How long a reservation stays committable
    pub reservation_ttl: Duration,
    /// Local retry of transient ledger failures
    pub retry: RetryPolicy,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: Duration::minutes(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Issues identifier ranges per scope.
pub struct SequenceAuthority {
    store: Arc<dyn LedgerStore>,
    audit: Arc<dyn AuditLog>,
    config: AuthorityConfig,
}

impl SequenceAuthority {
    pub fn new(store: Arc<dyn LedgerStore>, audit: Arc<dyn AuditLog>, config: AuthorityConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    /// Reserve `count` consecutive offsets in `scope` for `source_hash`.
    ///
    /// Returns `[old + 1, old + count]` where `old` is the durable
    /// high-water-mark at the moment of the increment.
    pub async fn reserve(
        &self,
        scope: &SequenceScope,
        count: u64,
        source_hash: &str,
    ) -> AuthorityResult<IdentifierReservation> {
        if count == 0 {
            return Err(AuthorityError::InvalidCount);
        }

        let row = retry_transient(&self.config.retry, "reserve", || {
            let request = ReserveRequest {
                scope: scope.clone(),
                count,
                source_hash: source_hash.to_string(),
                ttl: self.config.reservation_ttl,
                now: Utc::now(),
            };
            offload(&self.store, move |store| store.reserve_range(request))
        })
        .await?;

        maybe_crash(points::AFTER_RESERVATION);

        log_event_with_fields(
            Event::ReservationIssued,
            &[
                ("scope", &row.scope.to_string()),
                ("token", &row.token.to_string()),
                ("start", &row.start.to_string()),
                ("end", &row.end.to_string()),
                ("expires_at", &row.expires_at.to_rfc3339()),
            ],
        );

        Ok(IdentifierReservation::from(&row))
    }

    /// Release an outstanding reservation. Its offsets are never reissued.
    pub async fn release(
        &self,
        reservation: &IdentifierReservation,
        reason: &str,
    ) -> AuthorityResult<ReleasedRange> {
        self.release_token(reservation.token, reason, None).await
    }

    /// Read the durable high-water-mark, creating the scope at zero if absent.
    pub async fn recover(&self, scope: &SequenceScope) -> AuthorityResult<u64> {
        let row = retry_transient(&self.config.retry, "recover", || {
            let scope = scope.clone();
            offload(&self.store, move |store| store.ensure_scope(&scope, Utc::now()))
        })
        .await?;
        Ok(row.high_water_mark)
    }

    /// An unexpired, uncommitted reservation issued earlier for the same
    /// source content in the same scope.
    ///
    /// Outstanding reservations for the source whose TTL has passed are
    /// released with reason `expired` on the way.
    pub async fn outstanding_for_source(
        &self,
        source_hash: &str,
        scope: &SequenceScope,
        now: DateTime<Utc>,
    ) -> AuthorityResult<Option<IdentifierReservation>> {
        let rows = offload(&self.store, {
            let source_hash = source_hash.to_string();
            let scope = scope.clone();
            move |store| store.outstanding_for_source(&source_hash, &scope)
        })
        .await?;

        let mut resumable = None;
        for row in rows {
            if row.is_expired(now) {
                self.release_token(row.token, REASON_EXPIRED, None).await?;
            } else if resumable.is_none() {
                resumable = Some(IdentifierReservation::from(&row));
            }
        }

        if let Some(ref reservation) = resumable {
            log_event_with_fields(
                Event::ReservationResumed,
                &[
                    ("scope", &reservation.scope.to_string()),
                    ("token", &reservation.token.to_string()),
                    ("start", &reservation.start.to_string()),
                    ("end", &reservation.end.to_string()),
                ],
            );
        }
        Ok(resumable)
    }

    /// Operator release of an outstanding reservation whose TTL has passed.
    pub async fn force_release_expired(
        &self,
        token: Uuid,
        now: DateTime<Utc>,
        operator: &str,
    ) -> AuthorityResult<ReleasedRange> {
        let row = offload(&self.store, move |store| store.reservation(token))
            .await?
            .ok_or(AuthorityError::NotFound(token))?;

        if !row.is_expired(now) && row.state == ReservationState::Outstanding {
            return Err(AuthorityError::NotExpired {
                token,
                expires_at: row.expires_at,
            });
        }

        self.release_token(token, "force_release", Some(operator)).await
    }

    /// Highest offset inside a committed batch of `scope`
    pub fn highest_committed(&self, scope: &SequenceScope) -> AuthorityResult<Option<u64>> {
        Ok(self.store.scope(scope)?.and_then(|row| row.highest_committed))
    }

    pub fn scopes(&self) -> AuthorityResult<Vec<ScopeRow>> {
        Ok(self.store.scopes()?)
    }

    pub fn released_ranges(&self) -> AuthorityResult<Vec<ReleasedRange>> {
        Ok(self.store.released_ranges()?)
    }

    pub fn reservation(&self, token: Uuid) -> AuthorityResult<Option<IdentifierReservation>> {
        Ok(self
            .store
            .reservation(token)?
            .map(|row| IdentifierReservation::from(&row)))
    }

    async fn release_token(
        &self,
        token: Uuid,
        reason: &str,
        operator: Option<&str>,
    ) -> AuthorityResult<ReleasedRange> {
        let row = offload(&self.store, move |store| store.reservation(token))
            .await?
            .ok_or(AuthorityError::NotFound(token))?;
        match row.state {
            ReservationState::Committed => return Err(AuthorityError::AlreadyCommitted(token)),
            ReservationState::Released => return Err(AuthorityError::AlreadyReleased(token)),
            ReservationState::Outstanding => {}
        }

        let released = retry_transient(&self.config.retry, "release", || {
            let reason = reason.to_string();
            offload(&self.store, move |store| store.release_range(token, &reason, Utc::now()))
        })
        .await?;

        log_event_with_fields(
            Event::ReservationReleased,
            &[
                ("scope", &released.scope.to_string()),
                ("token", &token.to_string()),
                ("start", &released.start.to_string()),
                ("end", &released.end.to_string()),
                ("reason", reason),
            ],
        );

        let action = if operator.is_some() {
            AuditAction::ForceRelease
        } else {
            AuditAction::ReservationReleased
        };
        let mut record = AuditRecord::new(action, AuditOutcome::Success)
            .with_token(token)
            .with_scope(released.scope.to_string())
            .with_range(released.start, released.end)
            .with_content_hash(row.source_hash.clone())
            .with_error(reason);
        if let Some(operator) = operator {
            record = record.with_operator(operator);
        }
        record_audit(&self.audit, record).await;

        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::FileLedger;
    use crate::observability::MemoryAuditLog;
    use tempfile::TempDir;

    fn scope() -> SequenceScope {
        SequenceScope::new("BR01", "20250428")
    }

    fn authority(dir: &TempDir, ttl: Duration) -> (SequenceAuthority, Arc<MemoryAuditLog>) {
        let store = Arc::new(FileLedger::open(dir.path()).unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let config = AuthorityConfig {
            reservation_ttl: ttl,
            retry: RetryPolicy::default(),
        };
        (SequenceAuthority::new(store, audit.clone(), config), audit)
    }

    #[tokio::test]
    async fn test_reserve_is_contiguous() {
        let dir = TempDir::new().unwrap();
        let (authority, _) = authority(&dir, Duration::minutes(5));

        let a = authority.reserve(&scope(), 3, "h1").await.unwrap();
        let b = authority.reserve(&scope(), 2, "h2").await.unwrap();

        assert_eq!((a.start, a.end), (1, 3));
        assert_eq!((b.start, b.end), (4, 5));
        assert_eq!(authority.recover(&scope()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_zero_count_rejected() {
        let dir = TempDir::new().unwrap();
        let (authority, _) = authority(&dir, Duration::minutes(5));
        assert!(matches!(
            authority.reserve(&scope(), 0, "h").await,
            Err(AuthorityError::InvalidCount)
        ));
    }

    #[tokio::test]
    async fn test_recover_creates_scope_at_zero() {
        let dir = TempDir::new().unwrap();
        let (authority, _) = authority(&dir, Duration::minutes(5));
        assert_eq!(authority.recover(&scope()).await.unwrap(), 0);
        assert_eq!(authority.scopes().unwrap().len(), 1);
        assert_eq!(authority.highest_committed(&scope()).unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_is_audited_and_not_reused() {
        let dir = TempDir::new().unwrap();
        let (authority, audit) = authority(&dir, Duration::minutes(5));

        let r = authority.reserve(&scope(), 3, "h").await.unwrap();
        authority.release(&r, "validation failed").await.unwrap();

        let next = authority.reserve(&scope(), 1, "h").await.unwrap();
        assert_eq!(next.start, 4);

        let audited = audit.with_action(AuditAction::ReservationReleased);
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].range, Some((1, 3)));

        assert!(matches!(
            authority.release(&r, "again").await,
            Err(AuthorityError::AlreadyReleased(_))
        ));
    }

    #[tokio::test]
    async fn test_outstanding_for_source_resumes_and_expires() {
        let dir = TempDir::new().unwrap();
        let (authority, _) = authority(&dir, Duration::seconds(60));

        let r = authority.reserve(&scope(), 2, "same").await.unwrap();
        let now = Utc::now();

        let resumed = authority
            .outstanding_for_source("same", &scope(), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.token, r.token);

        // Past the TTL the reservation is released instead of resumed
        let later = now + Duration::seconds(120);
        assert!(authority
            .outstanding_for_source("same", &scope(), later)
            .await
            .unwrap()
            .is_none());
        let released = authority.released_ranges().unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].reason, REASON_EXPIRED);
    }

    #[tokio::test]
    async fn test_force_release_requires_expiry() {
        let dir = TempDir::new().unwrap();
        let (authority, audit) = authority(&dir, Duration::seconds(60));

        let r = authority.reserve(&scope(), 2, "h").await.unwrap();
        assert!(matches!(
            authority.force_release_expired(r.token, Utc::now(), "cli").await,
            Err(AuthorityError::NotExpired { .. })
        ));

        let later = Utc::now() + Duration::seconds(120);
        authority.force_release_expired(r.token, later, "cli").await.unwrap();
        assert_eq!(audit.with_action(AuditAction::ForceRelease).len(), 1);

        assert!(matches!(
            authority.force_release_expired(Uuid::new_v4(), later, "cli").await,
            Err(AuthorityError::NotFound(_))
        ));
    }
}
