//! Notification sink collaborator and broadcast fan-out.
//!
//! Delivery is somebody else's problem (FCM, e-mail, in-app bell); the core
//! hands a recipient list and a message to the sink and moves on. Nothing
//! here may fail a state transition.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

use lifelink_core::{ActorId, BloodGroup};
use lifelink_eligibility::is_eligible;
use lifelink_requests::RequestId;

use crate::directory::{ActorProfile, ActorRole};

/// A message for the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub request_id: RequestId,
}

/// Best-effort, fire-and-forget delivery boundary.
pub trait NotificationSink: Send + Sync {
    /// Deliver to each recipient. Must not block the caller on delivery and
    /// must not report failure upward.
    fn notify(&self, recipients: &[ActorId], note: Notification);

    /// Mark every pending notification for a request as dead (the request
    /// was cancelled or claimed; other candidates should stop seeing it).
    fn invalidate(&self, request_id: RequestId);
}

/// In-memory sink for tests/dev: records what would have been pushed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    notes: Mutex<Vec<(ActorId, Notification)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notes_for(&self, recipient: ActorId) -> Vec<Notification> {
        match self.notes.lock() {
            Ok(notes) => notes
                .iter()
                .filter(|(r, _)| *r == recipient)
                .map(|(_, n)| n.clone())
                .collect(),
            Err(_) => vec![],
        }
    }

    pub fn recipients_of(&self, request_id: RequestId) -> Vec<ActorId> {
        match self.notes.lock() {
            Ok(notes) => notes
                .iter()
                .filter(|(_, n)| n.request_id == request_id)
                .map(|(r, _)| *r)
                .collect(),
            Err(_) => vec![],
        }
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, recipients: &[ActorId], note: Notification) {
        if let Ok(mut notes) = self.notes.lock() {
            for recipient in recipients {
                notes.push((*recipient, note.clone()));
            }
        }
    }

    fn invalidate(&self, request_id: RequestId) {
        if let Ok(mut notes) = self.notes.lock() {
            notes.retain(|(_, n)| n.request_id != request_id);
        }
    }
}

/// Select broadcast candidates for a new request.
///
/// A candidate is a donor whose blood can serve the requested group, who
/// lives in one of the target cities (no city filter when the list is
/// empty), who is not the requester, and who is past the cooling period at
/// `now`. Donors without a recorded blood group are skipped.
pub fn broadcast_candidates(
    profiles: &[ActorProfile],
    blood_group: BloodGroup,
    cities: &[String],
    requester: ActorId,
    now: DateTime<Utc>,
) -> Vec<ActorId> {
    profiles
        .iter()
        .filter(|p| p.role == ActorRole::Donor)
        .filter(|p| p.id != requester)
        .filter(|p| {
            p.blood_group
                .map(|g| g.can_donate_to(blood_group))
                .unwrap_or(false)
        })
        .filter(|p| {
            cities.is_empty()
                || p.city
                    .as_deref()
                    .map(|c| cities.iter().any(|want| want.eq_ignore_ascii_case(c)))
                    .unwrap_or(false)
        })
        .filter(|p| is_eligible(p.last_donation, now))
        .map(|p| p.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use lifelink_eligibility::LastDonation;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn donor(group: BloodGroup, city: &str) -> ActorProfile {
        ActorProfile {
            id: ActorId::new(),
            role: ActorRole::Donor,
            name: "donor".to_string(),
            blood_group: Some(group),
            city: Some(city.to_string()),
            fcm_token: Some("token".to_string()),
            last_donation: None,
            donation_count: 0,
        }
    }

    #[test]
    fn candidates_are_compatible_local_eligible_strangers() {
        let requester = ActorId::new();
        let good = donor(BloodGroup::ONeg, "Chennai");
        let wrong_group = donor(BloodGroup::AbPos, "Chennai");
        let wrong_city = donor(BloodGroup::ONeg, "Mumbai");
        let mut cooling = donor(BloodGroup::OPos, "Chennai");
        cooling.last_donation = Some(LastDonation::At(now() - Duration::days(10)));
        let mut own = donor(BloodGroup::ONeg, "Chennai");
        own.id = requester;

        let profiles = vec![
            good.clone(),
            wrong_group,
            wrong_city,
            cooling,
            own,
        ];
        let picked = broadcast_candidates(
            &profiles,
            BloodGroup::APos,
            &["chennai".to_string()],
            requester,
            now(),
        );

        assert_eq!(picked, vec![good.id]);
    }

    #[test]
    fn empty_city_list_means_no_city_filter() {
        let requester = ActorId::new();
        let far = donor(BloodGroup::ONeg, "Mumbai");
        let picked =
            broadcast_candidates(&[far.clone()], BloodGroup::BPos, &[], requester, now());
        assert_eq!(picked, vec![far.id]);
    }

    #[test]
    fn invalidate_hides_dead_alerts() {
        let sink = RecordingSink::new();
        let donor_id = ActorId::new();
        let request_id = RequestId::new(lifelink_core::AggregateId::new());
        sink.notify(
            &[donor_id],
            Notification {
                title: "Emergency Blood Needed!".to_string(),
                body: "Urgent: O+ needed.".to_string(),
                request_id,
            },
        );
        assert_eq!(sink.notes_for(donor_id).len(), 1);

        sink.invalidate(request_id);
        assert!(sink.notes_for(donor_id).is_empty());
    }
}
