//! Urgency window for a request, as a closed enumeration.
//!
//! Clients express urgency with a handful of fixed labels; each maps to a
//! concrete deadline computed from the creation instant. Absence of a label
//! falls back to a 24-hour window.

use core::str::FromStr;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use lifelink_core::DomainError;

/// How soon the requester needs the blood.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequiredTime {
    #[serde(rename = "30 mins")]
    ThirtyMinutes,
    #[serde(rename = "1 Hour")]
    OneHour,
    #[serde(rename = "2 Hours")]
    TwoHours,
    #[serde(rename = "4 Hours")]
    FourHours,
    /// End of the current day (23:59:59 of the creation date).
    #[serde(rename = "Today")]
    Today,
}

impl RequiredTime {
    /// Window applied when no urgency label was given.
    pub const DEFAULT_WINDOW_HOURS: i64 = 24;

    /// Deadline for a request created at `from`.
    pub fn deadline(self, from: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            RequiredTime::ThirtyMinutes => from + Duration::minutes(30),
            RequiredTime::OneHour => from + Duration::hours(1),
            RequiredTime::TwoHours => from + Duration::hours(2),
            RequiredTime::FourHours => from + Duration::hours(4),
            RequiredTime::Today => {
                let midnight = from.date_naive().and_time(NaiveTime::MIN).and_utc();
                midnight + Duration::days(1) - Duration::seconds(1)
            }
        }
    }

    /// Deadline for an optional urgency label (24-hour default).
    pub fn deadline_or_default(value: Option<RequiredTime>, from: DateTime<Utc>) -> DateTime<Utc> {
        match value {
            Some(rt) => rt.deadline(from),
            None => from + Duration::hours(Self::DEFAULT_WINDOW_HOURS),
        }
    }
}

impl FromStr for RequiredTime {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "30 mins" => Ok(RequiredTime::ThirtyMinutes),
            "1 Hour" => Ok(RequiredTime::OneHour),
            "2 Hours" => Ok(RequiredTime::TwoHours),
            "4 Hours" => Ok(RequiredTime::FourHours),
            "Today" => Ok(RequiredTime::Today),
            other => Err(DomainError::validation(format!(
                "unknown required time '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, 0).unwrap()
    }

    #[test]
    fn fixed_windows_add_the_expected_duration() {
        let from = at(9, 15);
        assert_eq!(
            RequiredTime::ThirtyMinutes.deadline(from),
            from + Duration::minutes(30)
        );
        assert_eq!(RequiredTime::OneHour.deadline(from), from + Duration::hours(1));
        assert_eq!(RequiredTime::TwoHours.deadline(from), from + Duration::hours(2));
        assert_eq!(RequiredTime::FourHours.deadline(from), from + Duration::hours(4));
    }

    #[test]
    fn today_ends_at_the_last_second_of_the_day() {
        let deadline = RequiredTime::Today.deadline(at(9, 15));
        assert_eq!(
            deadline,
            Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap()
        );
        // Late in the evening the window shrinks, it never rolls over.
        let late = RequiredTime::Today.deadline(at(23, 50));
        assert_eq!(late, Utc.with_ymd_and_hms(2024, 3, 10, 23, 59, 59).unwrap());
    }

    #[test]
    fn missing_label_defaults_to_twenty_four_hours() {
        let from = at(9, 15);
        assert_eq!(
            RequiredTime::deadline_or_default(None, from),
            from + Duration::hours(24)
        );
        assert_eq!(
            RequiredTime::deadline_or_default(Some(RequiredTime::OneHour), from),
            from + Duration::hours(1)
        );
    }

    #[test]
    fn labels_parse_and_unknown_is_rejected() {
        assert_eq!("30 mins".parse::<RequiredTime>().unwrap(), RequiredTime::ThirtyMinutes);
        assert_eq!("Today".parse::<RequiredTime>().unwrap(), RequiredTime::Today);
        assert!("whenever".parse::<RequiredTime>().is_err());
    }

    #[test]
    fn serde_uses_the_client_labels() {
        let json = serde_json::to_string(&RequiredTime::FourHours).unwrap();
        assert_eq!(json, "\"4 Hours\"");
    }
}
