use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::RuleError;

/// Closed vocabulary of fact names.
pub mod keys {
    pub const AGE: &str = "age";
    pub const SLEEP_DURATION: &str = "sleepDuration";
    pub const SLEEP_QUALITY: &str = "sleepQuality";
    pub const STRESS_LEVEL: &str = "stressLevel";
    pub const HEART_RATE: &str = "heartRate";
    pub const DAILY_STEPS: &str = "dailySteps";
    pub const PHYSICAL_ACTIVITY: &str = "physicalActivity";
    pub const BMI: &str = "bmi";
    pub const BMI_CATEGORY: &str = "bmiCategory";
    pub const BLOOD_PRESSURE: &str = "bloodPressure";
    pub const BLOOD_PRESSURE_STATUS: &str = "bloodPressureStatus";
    pub const GENDER: &str = "gender";
    pub const OCCUPATION: &str = "occupation";

    pub const INSOMNIA_RISK: &str = "insomnia_risk";
    pub const APNEA_RISK: &str = "apnea_risk";

    pub const LIFESTYLE_ISSUE_ACTIVITY: &str = "lifestyle_issue_activity";
    pub const LIFESTYLE_ISSUE_STRESS: &str = "lifestyle_issue_stress";
    pub const LIFESTYLE_ISSUE_SLEEP: &str = "lifestyle_issue_sleep";
    pub const LIFESTYLE_ISSUE_WEIGHT: &str = "lifestyle_issue_weight";

    pub const DIAGNOSIS_INSOMNIA: &str = "diagnosis_insomnia";
    pub const DIAGNOSIS_APNEA: &str = "diagnosis_apnea";
    pub const DIAGNOSIS_MIXED: &str = "diagnosis_mixed";
    pub const DIAGNOSIS_NONE: &str = "diagnosis_none";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FactValue {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Text(_) => "text",
        }
    }
}

impl From<bool> for FactValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FactValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for FactValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FactValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Unknown,
    Low,
    Moderate,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "low" => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BmiCategory {
    Underweight,
    Normal,
    Overweight,
    Obese,
    Unknown,
}

impl BmiCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Underweight => "Underweight",
            Self::Normal => "Normal",
            Self::Overweight => "Overweight",
            Self::Obese => "Obese",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a category label. Matching ignores case and surrounding whitespace,
    /// and the dataset spelling `Normal Weight` is folded into `Normal`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "underweight" => Some(Self::Underweight),
            "normal" | "normal weight" => Some(Self::Normal),
            "overweight" => Some(Self::Overweight),
            "obese" | "obesity" => Some(Self::Obese),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum BloodPressureStatus {
    Normal,
    Hypertension,
    Unknown,
}

impl BloodPressureStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Hypertension => "Hypertension",
            Self::Unknown => "Unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Normal" => Some(Self::Normal),
            "Hypertension" => Some(Self::Hypertension),
            "Unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Recommendation {
    SleepHygiene,
    PhysicalActivity,
    StressManagement,
    WeightManagement,
    ApneaEvaluation,
}

/// Working memory of one screening session.
///
/// Facts are only ever added or overwritten. Risk levels go through
/// [`FactSet::raise_risk`], which never lowers an existing level, and
/// recommendations are deduplicated on insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactSet {
    facts: BTreeMap<String, FactValue>,
    fired_rules: Vec<String>,
    recommendations: Vec<Recommendation>,
}

impl FactSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FactValue> {
        self.facts.get(key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.facts.contains_key(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<FactValue>) {
        self.facts.insert(key.to_string(), value.into());
    }

    /// Read a numeric fact.
    ///
    /// # Errors
    /// Returns [`RuleError::MissingFact`] when the fact is absent and
    /// [`RuleError::TypeMismatch`] when it is not a number.
    pub fn number(&self, key: &str) -> Result<f64, RuleError> {
        match self.facts.get(key) {
            Some(FactValue::Number(value)) => Ok(*value),
            Some(other) => Err(RuleError::TypeMismatch {
                key: key.to_string(),
                expected: "number",
                found: other.type_name(),
            }),
            None => Err(RuleError::MissingFact(key.to_string())),
        }
    }

    /// Read a boolean flag. An absent flag reads as `false`.
    ///
    /// # Errors
    /// Returns [`RuleError::TypeMismatch`] when the fact is present but not a boolean.
    pub fn flag(&self, key: &str) -> Result<bool, RuleError> {
        match self.facts.get(key) {
            Some(FactValue::Bool(value)) => Ok(*value),
            Some(other) => Err(RuleError::TypeMismatch {
                key: key.to_string(),
                expected: "bool",
                found: other.type_name(),
            }),
            None => Ok(false),
        }
    }

    /// Read a text fact.
    ///
    /// # Errors
    /// Returns [`RuleError::MissingFact`] when absent and [`RuleError::TypeMismatch`]
    /// when the fact is not text.
    pub fn text(&self, key: &str) -> Result<&str, RuleError> {
        match self.facts.get(key) {
            Some(FactValue::Text(value)) => Ok(value.as_str()),
            Some(other) => Err(RuleError::TypeMismatch {
                key: key.to_string(),
                expected: "text",
                found: other.type_name(),
            }),
            None => Err(RuleError::MissingFact(key.to_string())),
        }
    }

    /// Read a risk level. An absent risk reads as [`RiskLevel::Unknown`].
    ///
    /// # Errors
    /// Returns an error when the fact is not text or not a known level.
    pub fn risk(&self, key: &str) -> Result<RiskLevel, RuleError> {
        if !self.facts.contains_key(key) {
            return Ok(RiskLevel::Unknown);
        }
        let raw = self.text(key)?;
        RiskLevel::parse(raw).ok_or_else(|| RuleError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
    }

    /// Raise a risk fact to `level` unless it already holds a higher level.
    ///
    /// # Errors
    /// Returns an error when the current value cannot be read as a risk level.
    pub fn raise_risk(&mut self, key: &str, level: RiskLevel) -> Result<(), RuleError> {
        if self.risk(key)? < level {
            self.set(key, level.as_str());
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the category fact is missing or unrecognised.
    pub fn bmi_category(&self) -> Result<BmiCategory, RuleError> {
        let raw = self.text(keys::BMI_CATEGORY)?;
        BmiCategory::parse(raw).ok_or_else(|| RuleError::InvalidValue {
            key: keys::BMI_CATEGORY.to_string(),
            value: raw.to_string(),
        })
    }

    /// # Errors
    /// Returns an error when the status fact is missing or unrecognised.
    pub fn blood_pressure_status(&self) -> Result<BloodPressureStatus, RuleError> {
        let raw = self.text(keys::BLOOD_PRESSURE_STATUS)?;
        BloodPressureStatus::parse(raw).ok_or_else(|| RuleError::InvalidValue {
            key: keys::BLOOD_PRESSURE_STATUS.to_string(),
            value: raw.to_string(),
        })
    }

    /// Append a recommendation; returns `false` when it was already present.
    pub fn add_recommendation(&mut self, recommendation: Recommendation) -> bool {
        if self.recommendations.contains(&recommendation) {
            return false;
        }
        self.recommendations.push(recommendation);
        true
    }

    #[must_use]
    pub fn recommendations(&self) -> &[Recommendation] {
        &self.recommendations
    }

    #[must_use]
    pub fn fired_rules(&self) -> &[String] {
        &self.fired_rules
    }

    pub(crate) fn record_firing(&mut self, rule_id: &str) {
        if !self.fired_rules.iter().any(|fired| fired == rule_id) {
            self.fired_rules.push(rule_id.to_string());
        }
    }
}
