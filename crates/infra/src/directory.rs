//! Actor directory collaborator (identity/profile service boundary).
//!
//! The core never owns user records; it looks up the few fields it needs
//! (role, blood group, city, last donation) and writes back donation
//! bookkeeping on completion. Tests and dev wiring use the in-memory
//! implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lifelink_core::{ActorId, BloodGroup};
use lifelink_eligibility::LastDonation;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Donor,
    Hospital,
}

/// The slice of a directory record the core consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorProfile {
    pub id: ActorId,
    pub role: ActorRole,
    pub name: String,
    pub blood_group: Option<BloodGroup>,
    pub city: Option<String>,
    pub fcm_token: Option<String>,
    pub last_donation: Option<LastDonation>,
    pub donation_count: u32,
}

/// Donation history entry appended when a donor's gift completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationRecord {
    pub donor: ActorId,
    pub hospital: Option<ActorId>,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Directory lookups and donation bookkeeping.
pub trait ActorDirectory: Send + Sync {
    fn get(&self, id: ActorId) -> Option<ActorProfile>;

    /// All donor profiles (broadcast candidate pool).
    fn donors(&self) -> Vec<ActorProfile>;

    /// Append a history record and refresh the donor's `last_donation`
    /// and donation counter.
    fn record_donation(&self, record: DonationRecord);
}

/// In-memory directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    profiles: RwLock<HashMap<ActorId, ActorProfile>>,
    donations: RwLock<Vec<DonationRecord>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, profile: ActorProfile) {
        if let Ok(mut profiles) = self.profiles.write() {
            profiles.insert(profile.id, profile);
        }
    }

    pub fn donations_for(&self, donor: ActorId) -> Vec<DonationRecord> {
        match self.donations.read() {
            Ok(donations) => donations
                .iter()
                .filter(|d| d.donor == donor)
                .cloned()
                .collect(),
            Err(_) => vec![],
        }
    }
}

impl ActorDirectory for InMemoryDirectory {
    fn get(&self, id: ActorId) -> Option<ActorProfile> {
        self.profiles.read().ok()?.get(&id).cloned()
    }

    fn donors(&self) -> Vec<ActorProfile> {
        match self.profiles.read() {
            Ok(profiles) => profiles
                .values()
                .filter(|p| p.role == ActorRole::Donor)
                .cloned()
                .collect(),
            Err(_) => vec![],
        }
    }

    fn record_donation(&self, record: DonationRecord) {
        if let Ok(mut profiles) = self.profiles.write() {
            if let Some(profile) = profiles.get_mut(&record.donor) {
                profile.last_donation = Some(LastDonation::At(record.occurred_at));
                profile.donation_count += 1;
            }
        }
        if let Ok(mut donations) = self.donations.write() {
            donations.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn donor_profile(id: ActorId) -> ActorProfile {
        ActorProfile {
            id,
            role: ActorRole::Donor,
            name: "Asha".to_string(),
            blood_group: Some(BloodGroup::ONeg),
            city: Some("Chennai".to_string()),
            fcm_token: None,
            last_donation: None,
            donation_count: 0,
        }
    }

    #[test]
    fn recording_a_donation_updates_the_profile_and_history() {
        let directory = InMemoryDirectory::new();
        let donor = ActorId::new();
        directory.upsert(donor_profile(donor));

        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        directory.record_donation(DonationRecord {
            donor,
            hospital: None,
            blood_group: BloodGroup::ONeg,
            units: 1,
            occurred_at: at,
        });

        let profile = directory.get(donor).unwrap();
        assert_eq!(profile.donation_count, 1);
        assert_eq!(profile.last_donation, Some(LastDonation::At(at)));
        assert_eq!(directory.donations_for(donor).len(), 1);
    }

    #[test]
    fn donors_lists_only_donor_roles() {
        let directory = InMemoryDirectory::new();
        let donor = ActorId::new();
        directory.upsert(donor_profile(donor));
        directory.upsert(ActorProfile {
            id: ActorId::new(),
            role: ActorRole::Hospital,
            name: "City General".to_string(),
            blood_group: None,
            city: Some("Chennai".to_string()),
            fcm_token: None,
            last_donation: None,
            donation_count: 0,
        });

        let donors = directory.donors();
        assert_eq!(donors.len(), 1);
        assert_eq!(donors[0].id, donor);
    }
}
