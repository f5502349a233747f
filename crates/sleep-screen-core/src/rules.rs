//! The fixed sleep-disorder knowledge base.
//!
//! Rules are plain records evaluated in declared order. Every rule only
//! reads facts produced by the normalizer or by rules declared before it,
//! so a single pass reaches the fixpoint and the next pass confirms it.
//! Thresholds are contract values.

use serde::{Deserialize, Serialize};

use crate::facts::{keys, BloodPressureStatus, BmiCategory, FactSet, Recommendation, RiskLevel};
use crate::RuleError;

pub const KNOWLEDGE_BASE_VERSION: &str = "sleep-kb.v1";

pub type Predicate = fn(&FactSet) -> Result<bool, RuleError>;
pub type Action = fn(&mut FactSet) -> Result<(), RuleError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Insomnia,
    Apnea,
    Lifestyle,
    Diagnosis,
    Recommendation,
}

impl RuleCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insomnia => "insomnia",
            Self::Apnea => "apnea",
            Self::Lifestyle => "lifestyle",
            Self::Diagnosis => "diagnosis",
            Self::Recommendation => "recommendation",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insomnia" => Some(Self::Insomnia),
            "apnea" => Some(Self::Apnea),
            "lifestyle" => Some(Self::Lifestyle),
            "diagnosis" => Some(Self::Diagnosis),
            "recommendation" => Some(Self::Recommendation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub id: &'static str,
    pub category: RuleCategory,
    pub description: &'static str,
    pub predicate: Predicate,
    pub action: Action,
}

/// Serializable view of one knowledge-base rule.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RuleCatalogEntry {
    pub position: usize,
    pub id: String,
    pub category: RuleCategory,
    pub description: String,
}

static KNOWLEDGE_BASE: [Rule; 20] = [
    Rule {
        id: "R1",
        category: RuleCategory::Insomnia,
        description: "sleep duration < 5h and quality <= 4 => high insomnia risk",
        predicate: short_poor_sleep,
        action: insomnia_high,
    },
    Rule {
        id: "R2",
        category: RuleCategory::Insomnia,
        description: "sleep duration 5-6h and stress >= 7 => moderate insomnia risk",
        predicate: borderline_sleep_with_stress,
        action: insomnia_moderate,
    },
    Rule {
        id: "R3",
        category: RuleCategory::Insomnia,
        description: "quality <= 4 and stress >= 7 => moderate insomnia risk",
        predicate: poor_quality_with_stress,
        action: insomnia_moderate,
    },
    Rule {
        id: "R4",
        category: RuleCategory::Insomnia,
        description: "sleep duration 7-9h, quality >= 7 and stress < 7 => low insomnia risk",
        predicate: healthy_sleep,
        action: insomnia_low,
    },
    Rule {
        id: "R5",
        category: RuleCategory::Apnea,
        description: "obese and hypertensive => high apnea risk",
        predicate: obese_with_hypertension,
        action: apnea_high,
    },
    Rule {
        id: "R6",
        category: RuleCategory::Apnea,
        description: "overweight and hypertensive => moderate apnea risk",
        predicate: overweight_with_hypertension,
        action: apnea_moderate,
    },
    Rule {
        id: "R7",
        category: RuleCategory::Apnea,
        description: "obese and age >= 40 => moderate apnea risk",
        predicate: obese_over_forty,
        action: apnea_moderate,
    },
    Rule {
        id: "R8",
        category: RuleCategory::Apnea,
        description: "normal BMI and normal blood pressure => low apnea risk",
        predicate: normal_weight_and_pressure,
        action: apnea_low,
    },
    Rule {
        id: "R9",
        category: RuleCategory::Lifestyle,
        description: "physical activity < 30 min => activity issue",
        predicate: low_activity,
        action: flag_activity_issue,
    },
    Rule {
        id: "R10",
        category: RuleCategory::Lifestyle,
        description: "stress >= 7 => stress issue",
        predicate: high_stress,
        action: flag_stress_issue,
    },
    Rule {
        id: "R11",
        category: RuleCategory::Lifestyle,
        description: "sleep duration < 6h => sleep issue",
        predicate: short_sleep,
        action: flag_sleep_issue,
    },
    Rule {
        id: "R12",
        category: RuleCategory::Lifestyle,
        description: "overweight or obese => weight issue",
        predicate: excess_weight,
        action: flag_weight_issue,
    },
    Rule {
        id: "R13",
        category: RuleCategory::Diagnosis,
        description: "high insomnia risk, or moderate with stress or sleep issue => insomnia",
        predicate: insomnia_indicated,
        action: diagnose_insomnia,
    },
    Rule {
        id: "R14",
        category: RuleCategory::Diagnosis,
        description: "high apnea risk, or moderate with weight issue => sleep apnea",
        predicate: apnea_indicated,
        action: diagnose_apnea,
    },
    Rule {
        id: "R15",
        category: RuleCategory::Diagnosis,
        description: "insomnia and sleep apnea together => mixed sleep disorder",
        predicate: both_disorders_indicated,
        action: diagnose_mixed,
    },
    Rule {
        id: "R16",
        category: RuleCategory::Diagnosis,
        description: "all risks low and no lifestyle issue => no sleep disorder",
        predicate: all_clear,
        action: diagnose_none,
    },
    Rule {
        id: "R17",
        category: RuleCategory::Recommendation,
        description: "insomnia or sleep issue => sleep hygiene",
        predicate: needs_sleep_hygiene,
        action: recommend_sleep_hygiene,
    },
    Rule {
        id: "R18",
        category: RuleCategory::Recommendation,
        description: "activity issue => physical activity",
        predicate: needs_physical_activity,
        action: recommend_physical_activity,
    },
    Rule {
        id: "R19",
        category: RuleCategory::Recommendation,
        description: "stress issue => stress management",
        predicate: needs_stress_management,
        action: recommend_stress_management,
    },
    Rule {
        id: "R20",
        category: RuleCategory::Recommendation,
        description: "weight issue or sleep apnea => weight management / apnea evaluation",
        predicate: needs_weight_or_apnea_follow_up,
        action: recommend_weight_and_apnea_follow_up,
    },
];

/// The default knowledge base, in evaluation order.
#[must_use]
pub fn knowledge_base() -> &'static [Rule] {
    &KNOWLEDGE_BASE
}

#[must_use]
pub fn catalog() -> Vec<RuleCatalogEntry> {
    KNOWLEDGE_BASE
        .iter()
        .enumerate()
        .map(|(index, rule)| RuleCatalogEntry {
            position: index + 1,
            id: rule.id.to_string(),
            category: rule.category,
            description: rule.description.to_string(),
        })
        .collect()
}

#[must_use]
pub fn find_rule(rule_id: &str) -> Option<(usize, &'static Rule)> {
    KNOWLEDGE_BASE.iter().enumerate().find(|(_, rule)| rule.id == rule_id).map(|(i, r)| (i + 1, r))
}

// Insomnia

fn short_poor_sleep(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.number(keys::SLEEP_DURATION)? < 5.0
        && facts.number(keys::SLEEP_QUALITY)? <= 4.0)
}

fn borderline_sleep_with_stress(facts: &FactSet) -> Result<bool, RuleError> {
    let duration = facts.number(keys::SLEEP_DURATION)?;
    Ok((5.0..=6.0).contains(&duration)
        && facts.number(keys::STRESS_LEVEL)? >= 7.0)
}

fn poor_quality_with_stress(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.number(keys::SLEEP_QUALITY)? <= 4.0
        && facts.number(keys::STRESS_LEVEL)? >= 7.0)
}

fn healthy_sleep(facts: &FactSet) -> Result<bool, RuleError> {
    let duration = facts.number(keys::SLEEP_DURATION)?;
    Ok((7.0..=9.0).contains(&duration)
        && facts.number(keys::SLEEP_QUALITY)? >= 7.0
        && facts.number(keys::STRESS_LEVEL)? < 7.0)
}

fn insomnia_high(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.raise_risk(keys::INSOMNIA_RISK, RiskLevel::High)
}

fn insomnia_moderate(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.raise_risk(keys::INSOMNIA_RISK, RiskLevel::Moderate)
}

fn insomnia_low(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.raise_risk(keys::INSOMNIA_RISK, RiskLevel::Low)
}

// Apnea

fn obese_with_hypertension(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.bmi_category()? == BmiCategory::Obese
        && facts.blood_pressure_status()? == BloodPressureStatus::Hypertension)
}

fn overweight_with_hypertension(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.bmi_category()? == BmiCategory::Overweight
        && facts.blood_pressure_status()? == BloodPressureStatus::Hypertension)
}

fn obese_over_forty(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.bmi_category()? == BmiCategory::Obese
        && facts.number(keys::AGE)? >= 40.0)
}

fn normal_weight_and_pressure(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.bmi_category()? == BmiCategory::Normal
        && facts.blood_pressure_status()? == BloodPressureStatus::Normal)
}

fn apnea_high(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.raise_risk(keys::APNEA_RISK, RiskLevel::High)
}

fn apnea_moderate(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.raise_risk(keys::APNEA_RISK, RiskLevel::Moderate)
}

fn apnea_low(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.raise_risk(keys::APNEA_RISK, RiskLevel::Low)
}

// Lifestyle

fn low_activity(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.number(keys::PHYSICAL_ACTIVITY)? < 30.0)
}

fn high_stress(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.number(keys::STRESS_LEVEL)? >= 7.0)
}

fn short_sleep(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.number(keys::SLEEP_DURATION)? < 6.0)
}

fn excess_weight(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(matches!(facts.bmi_category()?, BmiCategory::Overweight | BmiCategory::Obese))
}

fn flag_activity_issue(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::LIFESTYLE_ISSUE_ACTIVITY, true);
    Ok(())
}

fn flag_stress_issue(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::LIFESTYLE_ISSUE_STRESS, true);
    Ok(())
}

fn flag_sleep_issue(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::LIFESTYLE_ISSUE_SLEEP, true);
    Ok(())
}

fn flag_weight_issue(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::LIFESTYLE_ISSUE_WEIGHT, true);
    Ok(())
}

// Diagnosis

fn insomnia_indicated(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(match facts.risk(keys::INSOMNIA_RISK)? {
        RiskLevel::High => true,
        RiskLevel::Moderate => {
            facts.flag(keys::LIFESTYLE_ISSUE_STRESS)? || facts.flag(keys::LIFESTYLE_ISSUE_SLEEP)?
        }
        RiskLevel::Low | RiskLevel::Unknown => false,
    })
}

fn apnea_indicated(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(match facts.risk(keys::APNEA_RISK)? {
        RiskLevel::High => true,
        RiskLevel::Moderate => facts.flag(keys::LIFESTYLE_ISSUE_WEIGHT)?,
        RiskLevel::Low | RiskLevel::Unknown => false,
    })
}

fn both_disorders_indicated(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.flag(keys::DIAGNOSIS_INSOMNIA)?
        && facts.flag(keys::DIAGNOSIS_APNEA)?)
}

fn all_clear(facts: &FactSet) -> Result<bool, RuleError> {
    let risks_low = facts.risk(keys::INSOMNIA_RISK)? == RiskLevel::Low
        && facts.risk(keys::APNEA_RISK)? == RiskLevel::Low;
    let any_issue = facts.flag(keys::LIFESTYLE_ISSUE_ACTIVITY)?
        || facts.flag(keys::LIFESTYLE_ISSUE_STRESS)?
        || facts.flag(keys::LIFESTYLE_ISSUE_SLEEP)?
        || facts.flag(keys::LIFESTYLE_ISSUE_WEIGHT)?;
    Ok(risks_low && !any_issue)
}

fn diagnose_insomnia(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::DIAGNOSIS_INSOMNIA, true);
    Ok(())
}

fn diagnose_apnea(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::DIAGNOSIS_APNEA, true);
    Ok(())
}

fn diagnose_mixed(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::DIAGNOSIS_MIXED, true);
    Ok(())
}

fn diagnose_none(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.set(keys::DIAGNOSIS_NONE, true);
    Ok(())
}

// Recommendations

fn needs_sleep_hygiene(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.flag(keys::DIAGNOSIS_INSOMNIA)?
        || facts.flag(keys::LIFESTYLE_ISSUE_SLEEP)?)
}

fn needs_physical_activity(facts: &FactSet) -> Result<bool, RuleError> {
    facts.flag(keys::LIFESTYLE_ISSUE_ACTIVITY)
}

fn needs_stress_management(facts: &FactSet) -> Result<bool, RuleError> {
    facts.flag(keys::LIFESTYLE_ISSUE_STRESS)
}

fn needs_weight_or_apnea_follow_up(facts: &FactSet) -> Result<bool, RuleError> {
    Ok(facts.flag(keys::LIFESTYLE_ISSUE_WEIGHT)?
        || facts.flag(keys::DIAGNOSIS_APNEA)?)
}

fn recommend_sleep_hygiene(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.add_recommendation(Recommendation::SleepHygiene);
    Ok(())
}

fn recommend_physical_activity(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.add_recommendation(Recommendation::PhysicalActivity);
    Ok(())
}

fn recommend_stress_management(facts: &mut FactSet) -> Result<(), RuleError> {
    facts.add_recommendation(Recommendation::StressManagement);
    Ok(())
}

fn recommend_weight_and_apnea_follow_up(facts: &mut FactSet) -> Result<(), RuleError> {
    if facts.flag(keys::LIFESTYLE_ISSUE_WEIGHT)? {
        facts.add_recommendation(Recommendation::WeightManagement);
    }
    if facts.flag(keys::DIAGNOSIS_APNEA)? {
        facts.add_recommendation(Recommendation::ApneaEvaluation);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_ids_are_unique_and_sequential() {
        let ids = knowledge_base().iter().map(|rule| rule.id).collect::<Vec<_>>();
        let expected = (1..=20).map(|n| format!("R{n}")).collect::<Vec<_>>();
        assert_eq!(ids, expected);
    }

    #[test]
    fn catalog_groups_five_categories_in_declared_order() {
        let entries = catalog();
        assert_eq!(entries.len(), 20);
        assert_eq!(entries[0].position, 1);
        assert_eq!(entries[19].id, "R20");

        let mut categories = entries.iter().map(|entry| entry.category).collect::<Vec<_>>();
        categories.dedup();
        assert_eq!(
            categories,
            vec![
                RuleCategory::Insomnia,
                RuleCategory::Apnea,
                RuleCategory::Lifestyle,
                RuleCategory::Diagnosis,
                RuleCategory::Recommendation,
            ]
        );
    }

    #[test]
    fn find_rule_reports_one_based_position() {
        let Some((position, rule)) = find_rule("R13") else {
            panic!("R13 should be in the knowledge base");
        };
        assert_eq!(position, 13);
        assert_eq!(rule.category, RuleCategory::Diagnosis);
        assert!(find_rule("R21").is_none());
    }

    #[test]
    fn boundary_thresholds_are_inclusive_where_documented() -> Result<(), RuleError> {
        let mut facts = FactSet::new();
        facts.set(keys::SLEEP_DURATION, 6.0);
        facts.set(keys::SLEEP_QUALITY, 4.0);
        facts.set(keys::STRESS_LEVEL, 7.0);
        assert!(borderline_sleep_with_stress(&facts)?);
        assert!(poor_quality_with_stress(&facts)?);
        assert!(!short_poor_sleep(&facts)?);
        assert!(!short_sleep(&facts)?);

        facts.set(keys::SLEEP_DURATION, 9.0);
        facts.set(keys::SLEEP_QUALITY, 7.0);
        facts.set(keys::STRESS_LEVEL, 6.9);
        assert!(healthy_sleep(&facts)?);
        Ok(())
    }

    #[test]
    fn apnea_follow_up_only_adds_applicable_codes() -> Result<(), RuleError> {
        let mut facts = FactSet::new();
        facts.set(keys::LIFESTYLE_ISSUE_WEIGHT, true);
        recommend_weight_and_apnea_follow_up(&mut facts)?;
        assert_eq!(facts.recommendations(), &[Recommendation::WeightManagement]);
        Ok(())
    }
}
