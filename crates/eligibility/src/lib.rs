//! `lifelink-eligibility` — the donor cooling-period policy.
//!
//! Pure functions only: no store access, no clock access. Callers pass the
//! reference instant explicitly (now for broadcasts, the appointment date
//! for scheduling).

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use lifelink_core::{DomainError, DomainResult};

/// Minimum interval between a donor's consecutive donations, in days.
pub const COOLING_PERIOD_DAYS: i64 = 60;

/// A donor's recorded last donation.
///
/// Directory data arrives in three shapes: full timestamps with an offset,
/// naive timestamps, and bare dates. All three are normalized against the
/// reference instant's zone (UTC) before subtracting, so a record written
/// without an offset never shifts a donor across the eligibility boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LastDonation {
    At(DateTime<Utc>),
    Local(NaiveDateTime),
    Date(NaiveDate),
}

impl LastDonation {
    /// Parse a recorded donation instant.
    ///
    /// Accepts RFC 3339 timestamps, naive ISO timestamps and bare ISO dates.
    /// Anything else is an error — call sites decide whether to fail open
    /// (notification fan-out) or closed.
    pub fn parse(s: &str) -> DomainResult<Self> {
        let s = s.trim();
        if let Ok(at) = DateTime::parse_from_rfc3339(s) {
            return Ok(LastDonation::At(at.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(LastDonation::Local(naive));
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(LastDonation::Date(date));
        }
        Err(DomainError::validation(format!(
            "unparseable donation date '{s}'"
        )))
    }

    /// Normalize to an instant in the reference zone (UTC).
    ///
    /// Date-only records count from midnight; naive timestamps are taken
    /// as-is in UTC.
    fn instant(&self) -> DateTime<Utc> {
        match self {
            LastDonation::At(at) => *at,
            LastDonation::Local(naive) => naive.and_utc(),
            LastDonation::Date(date) => date.and_time(chrono::NaiveTime::MIN).and_utc(),
        }
    }

    /// The first instant at which the donor is eligible again.
    pub fn eligible_from(&self) -> DateTime<Utc> {
        self.instant() + Duration::days(COOLING_PERIOD_DAYS)
    }
}

impl From<DateTime<Utc>> for LastDonation {
    fn from(value: DateTime<Utc>) -> Self {
        LastDonation::At(value)
    }
}

/// Whether a donor may donate at `reference`.
///
/// True when no donation is on record, or when at least the cooling period
/// has elapsed (boundary inclusive: exactly 60 days ago is eligible).
pub fn is_eligible(last_donation: Option<LastDonation>, reference: DateTime<Utc>) -> bool {
    match last_donation {
        None => true,
        Some(last) => reference - last.instant() >= Duration::days(COOLING_PERIOD_DAYS),
    }
}
