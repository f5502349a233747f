use serde::{Deserialize, Serialize};

use crate::facts::{keys, FactSet, RiskLevel};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Diagnosis {
    Insomnia,
    SleepApnea,
    MixedSleepDisorder,
    NoSleepDisorder,
    Inconclusive,
}

impl Diagnosis {
    pub const ALL: [Self; 5] = [
        Self::MixedSleepDisorder,
        Self::SleepApnea,
        Self::Insomnia,
        Self::NoSleepDisorder,
        Self::Inconclusive,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insomnia => "Insomnia",
            Self::SleepApnea => "SleepApnea",
            Self::MixedSleepDisorder => "MixedSleepDisorder",
            Self::NoSleepDisorder => "NoSleepDisorder",
            Self::Inconclusive => "Inconclusive",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Insomnia" => Some(Self::Insomnia),
            "SleepApnea" => Some(Self::SleepApnea),
            "MixedSleepDisorder" => Some(Self::MixedSleepDisorder),
            "NoSleepDisorder" => Some(Self::NoSleepDisorder),
            "Inconclusive" => Some(Self::Inconclusive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LifestyleIssues {
    pub activity: bool,
    pub stress: bool,
    pub sleep: bool,
    pub weight: bool,
}

impl LifestyleIssues {
    #[must_use]
    pub fn any(&self) -> bool {
        self.activity || self.stress || self.sleep || self.weight
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub diagnosis: Diagnosis,
    pub insomnia_risk: RiskLevel,
    pub apnea_risk: RiskLevel,
    pub lifestyle_issues: LifestyleIssues,
}

/// Map the terminal fact set to a single diagnosis.
///
/// Priority is mixed, apnea, insomnia, none. Anything else is
/// `Inconclusive`. Unreadable facts count as unset.
#[must_use]
pub fn resolve(facts: &FactSet) -> Resolution {
    let flag = |key: &str| facts.flag(key).unwrap_or(false);

    let diagnosis = if flag(keys::DIAGNOSIS_MIXED) {
        Diagnosis::MixedSleepDisorder
    } else if flag(keys::DIAGNOSIS_APNEA) {
        Diagnosis::SleepApnea
    } else if flag(keys::DIAGNOSIS_INSOMNIA) {
        Diagnosis::Insomnia
    } else if flag(keys::DIAGNOSIS_NONE) {
        Diagnosis::NoSleepDisorder
    } else {
        Diagnosis::Inconclusive
    };

    Resolution {
        diagnosis,
        insomnia_risk: facts.risk(keys::INSOMNIA_RISK).unwrap_or(RiskLevel::Unknown),
        apnea_risk: facts.risk(keys::APNEA_RISK).unwrap_or(RiskLevel::Unknown),
        lifestyle_issues: LifestyleIssues {
            activity: flag(keys::LIFESTYLE_ISSUE_ACTIVITY),
            stress: flag(keys::LIFESTYLE_ISSUE_STRESS),
            sleep: flag(keys::LIFESTYLE_ISSUE_SLEEP),
            weight: flag(keys::LIFESTYLE_ISSUE_WEIGHT),
        },
    }
}
