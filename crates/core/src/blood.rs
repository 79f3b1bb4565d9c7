//! Blood group value object and ABO/Rh compatibility.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// The eight ABO/Rh blood groups.
///
/// Serialized with their clinical labels ("A+", "O-", ...) so events and
/// read models match what the directory and the mobile clients exchange.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APos,
    #[serde(rename = "A-")]
    ANeg,
    #[serde(rename = "B+")]
    BPos,
    #[serde(rename = "B-")]
    BNeg,
    #[serde(rename = "AB+")]
    AbPos,
    #[serde(rename = "AB-")]
    AbNeg,
    #[serde(rename = "O+")]
    OPos,
    #[serde(rename = "O-")]
    ONeg,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Abo {
    A,
    B,
    Ab,
    O,
}

impl BloodGroup {
    /// All groups, in the display order used by inventory views.
    pub const ALL: [BloodGroup; 8] = [
        BloodGroup::APos,
        BloodGroup::ANeg,
        BloodGroup::BPos,
        BloodGroup::BNeg,
        BloodGroup::OPos,
        BloodGroup::ONeg,
        BloodGroup::AbPos,
        BloodGroup::AbNeg,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            BloodGroup::APos => "A+",
            BloodGroup::ANeg => "A-",
            BloodGroup::BPos => "B+",
            BloodGroup::BNeg => "B-",
            BloodGroup::AbPos => "AB+",
            BloodGroup::AbNeg => "AB-",
            BloodGroup::OPos => "O+",
            BloodGroup::ONeg => "O-",
        }
    }

    fn abo(&self) -> Abo {
        match self {
            BloodGroup::APos | BloodGroup::ANeg => Abo::A,
            BloodGroup::BPos | BloodGroup::BNeg => Abo::B,
            BloodGroup::AbPos | BloodGroup::AbNeg => Abo::Ab,
            BloodGroup::OPos | BloodGroup::ONeg => Abo::O,
        }
    }

    fn rh_positive(&self) -> bool {
        matches!(
            self,
            BloodGroup::APos | BloodGroup::BPos | BloodGroup::AbPos | BloodGroup::OPos
        )
    }

    /// Whether blood of this group can be transfused to a recipient of
    /// `recipient` group.
    ///
    /// ABO: the donor's antigens must be a subset of the recipient's.
    /// Rh: an Rh-positive donor cannot give to an Rh-negative recipient.
    pub fn can_donate_to(&self, recipient: BloodGroup) -> bool {
        if self.rh_positive() && !recipient.rh_positive() {
            return false;
        }
        match (self.abo(), recipient.abo()) {
            (Abo::O, _) => true,
            (Abo::A, Abo::A | Abo::Ab) => true,
            (Abo::B, Abo::B | Abo::Ab) => true,
            (Abo::Ab, Abo::Ab) => true,
            _ => false,
        }
    }

    /// Groups whose carriers are viable donors for a recipient of this group.
    pub fn compatible_donors(&self) -> Vec<BloodGroup> {
        Self::ALL
            .into_iter()
            .filter(|g| g.can_donate_to(*self))
            .collect()
    }
}

impl core::fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for BloodGroup {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A+" => Ok(BloodGroup::APos),
            "A-" => Ok(BloodGroup::ANeg),
            "B+" => Ok(BloodGroup::BPos),
            "B-" => Ok(BloodGroup::BNeg),
            "AB+" => Ok(BloodGroup::AbPos),
            "AB-" => Ok(BloodGroup::AbNeg),
            "O+" => Ok(BloodGroup::OPos),
            "O-" => Ok(BloodGroup::ONeg),
            other => Err(DomainError::validation(format!(
                "unknown blood group '{other}'"
            ))),
        }
    }
}
