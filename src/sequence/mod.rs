//! Sequence authority subsystem
//!
//! Issues gapless, never-reused identifier offsets per (branch, period)
//! scope. Offsets are the authority's only concern; rendering them into
//! receipt identifiers is the pure `IdentifierPattern`.

mod authority;
mod errors;
mod pattern;
mod reservation;
mod scope;

pub use authority::{AuthorityConfig, SequenceAuthority, REASON_EXPIRED};
pub use errors::{AuthorityError, AuthorityResult};
pub use pattern::{IdentifierPattern, DEFAULT_PATTERN};
pub use reservation::IdentifierReservation;
pub use scope::{ResetCadence, SequenceScope};
