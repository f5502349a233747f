use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::diagnosis::{resolve, Diagnosis, LifestyleIssues, Resolution};
use crate::engine::{InferenceEngine, InferenceRun};
use crate::facts::{FactSet, Recommendation, RiskLevel};
use crate::normalize::{normalize, RawInput};
use crate::rules::{knowledge_base, Rule, KNOWLEDGE_BASE_VERSION};
use crate::validate::validate_required;
use crate::ScreeningError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningMetadata {
    pub knowledge_base_version: String,
    pub passes: u32,
    pub capped: bool,
    pub rule_failures: usize,
}

/// Response returned to the caller of a screening session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreeningReport {
    pub diagnosis: Diagnosis,
    pub insomnia_risk: RiskLevel,
    pub apnea_risk: RiskLevel,
    pub lifestyle_issues: LifestyleIssues,
    pub recommendations: Vec<Recommendation>,
    pub fired_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_ref: Option<String>,
    pub metadata: ScreeningMetadata,
}

/// Everything one session produced, before anything is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningOutcome {
    pub run: InferenceRun,
    pub resolution: Resolution,
}

impl ScreeningOutcome {
    #[must_use]
    pub fn diagnosis(&self) -> Diagnosis {
        self.resolution.diagnosis
    }

    #[must_use]
    pub fn trace(&self) -> &[String] {
        self.run.trace()
    }

    #[must_use]
    pub fn facts(&self) -> &FactSet {
        &self.run.facts
    }

    #[must_use]
    pub fn report(&self, case_ref: Option<String>) -> ScreeningReport {
        ScreeningReport {
            diagnosis: self.resolution.diagnosis,
            insomnia_risk: self.resolution.insomnia_risk,
            apnea_risk: self.resolution.apnea_risk,
            lifestyle_issues: self.resolution.lifestyle_issues,
            recommendations: self.run.facts.recommendations().to_vec(),
            fired_rules: self.run.trace().to_vec(),
            case_ref,
            metadata: ScreeningMetadata {
                knowledge_base_version: KNOWLEDGE_BASE_VERSION.to_string(),
                passes: self.run.passes,
                capped: self.run.capped,
                rule_failures: self.run.failures.len(),
            },
        }
    }
}

/// Accept a JSON document as raw screening input.
///
/// # Errors
/// Returns [`ScreeningError::NotAnObject`] for anything but a JSON object.
pub fn raw_input(value: Value) -> Result<RawInput, ScreeningError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Err(ScreeningError::NotAnObject("null")),
        Value::Bool(_) => Err(ScreeningError::NotAnObject("boolean")),
        Value::Number(_) => Err(ScreeningError::NotAnObject("number")),
        Value::String(_) => Err(ScreeningError::NotAnObject("string")),
        Value::Array(_) => Err(ScreeningError::NotAnObject("array")),
    }
}

/// Validate, normalize, infer and resolve one session against the default
/// knowledge base.
///
/// # Errors
/// Returns [`ScreeningError::Validation`] listing every missing required
/// field. No inference runs in that case.
pub fn screen(input: &RawInput) -> Result<ScreeningOutcome, ScreeningError> {
    validate_required(input)?;
    Ok(evaluate(knowledge_base(), normalize(input)))
}

/// Run an arbitrary rule catalog over an already normalized fact set.
#[must_use]
pub fn evaluate(rules: &[Rule], facts: FactSet) -> ScreeningOutcome {
    let run = InferenceEngine::new(rules).run(facts);
    let resolution = resolve(&run.facts);
    ScreeningOutcome { run, resolution }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::facts::{keys, BloodPressureStatus};

    fn screen_json(value: Value) -> ScreeningOutcome {
        let input = match raw_input(value) {
            Ok(input) => input,
            Err(err) => panic!("fixture must be an object: {err}"),
        };
        match screen(&input) {
            Ok(outcome) => outcome,
            Err(err) => panic!("fixture should validate: {err}"),
        }
    }

    fn ids(trace: &[&str]) -> Vec<String> {
        trace.iter().map(|id| (*id).to_string()).collect()
    }

    #[test]
    fn short_poor_sleep_is_insomnia() {
        let outcome = screen_json(json!({
            "sleepDuration": 4,
            "sleepQuality": 3,
            "stressLevel": 5,
            "bmiCategory": "Normal",
            "bloodPressure": "120/80",
            "age": 30,
            "physicalActivity": 40,
        }));

        assert_eq!(outcome.trace(), ids(&["R1", "R8", "R11", "R13", "R17"]).as_slice());
        assert_eq!(outcome.resolution.insomnia_risk, RiskLevel::High);
        assert_eq!(outcome.resolution.apnea_risk, RiskLevel::Low);
        assert_eq!(outcome.diagnosis(), Diagnosis::Insomnia);
        assert!(outcome.facts().recommendations().contains(&Recommendation::SleepHygiene));
    }

    #[test]
    fn obese_hypertensive_is_sleep_apnea() {
        let outcome = screen_json(json!({
            "sleepDuration": 8,
            "sleepQuality": 8,
            "stressLevel": 3,
            "bmiCategory": "Obese",
            "bloodPressure": "150/95",
            "age": 45,
            "physicalActivity": 10,
        }));

        assert_eq!(
            outcome.trace(),
            ids(&["R4", "R5", "R7", "R9", "R12", "R14", "R18", "R20"]).as_slice()
        );
        // R7 would set moderate after R5 set high.
        assert_eq!(outcome.resolution.apnea_risk, RiskLevel::High);
        assert!(outcome.resolution.lifestyle_issues.weight);
        assert_eq!(outcome.diagnosis(), Diagnosis::SleepApnea);
        assert_eq!(
            outcome.facts().recommendations(),
            &[
                Recommendation::PhysicalActivity,
                Recommendation::WeightManagement,
                Recommendation::ApneaEvaluation,
            ]
        );
    }

    #[test]
    fn healthy_profile_has_no_disorder() {
        let outcome = screen_json(json!({
            "sleepDuration": 8,
            "sleepQuality": 8,
            "stressLevel": 3,
            "bmiCategory": "Normal",
            "bloodPressure": "120/80",
            "age": 30,
            "physicalActivity": 40,
        }));

        assert_eq!(outcome.trace(), ids(&["R4", "R8", "R16"]).as_slice());
        assert_eq!(outcome.resolution.insomnia_risk, RiskLevel::Low);
        assert_eq!(outcome.resolution.apnea_risk, RiskLevel::Low);
        assert!(!outcome.resolution.lifestyle_issues.any());
        assert_eq!(outcome.diagnosis(), Diagnosis::NoSleepDisorder);
        assert!(outcome.facts().recommendations().is_empty());
    }

    #[test]
    fn unparsable_blood_pressure_blocks_pressure_rules() -> Result<(), crate::RuleError> {
        let outcome = screen_json(json!({
            "sleepDuration": 7,
            "sleepQuality": 7,
            "stressLevel": 4,
            "bmiCategory": "Obese",
            "bloodPressure": "12080",
            "age": 30,
            "physicalActivity": 45,
        }));

        assert_eq!(
            outcome.facts().blood_pressure_status()?,
            BloodPressureStatus::Unknown
        );
        for id in ["R5", "R6", "R8"] {
            assert!(!outcome.trace().iter().any(|fired| fired == id), "{id} must not fire");
        }
        assert_eq!(outcome.resolution.apnea_risk, RiskLevel::Unknown);
        assert_eq!(outcome.diagnosis(), Diagnosis::Inconclusive);
        Ok(())
    }

    #[test]
    fn blank_primary_age_falls_back_to_dataset_column() -> Result<(), crate::RuleError> {
        let outcome = screen_json(json!({
            "age": "",
            "Age": 45,
            "sleepDuration": 8,
            "sleepQuality": 8,
            "stressLevel": 3,
            "bmiCategory": "Obese",
            "bloodPressure": "120/80",
            "physicalActivity": 40,
        }));

        assert!((outcome.facts().number(keys::AGE)? - 45.0).abs() < f64::EPSILON);
        assert_eq!(outcome.trace(), ids(&["R4", "R7", "R12", "R14", "R20"]).as_slice());
        assert_eq!(outcome.resolution.apnea_risk, RiskLevel::Moderate);
        assert_eq!(outcome.diagnosis(), Diagnosis::SleepApnea);
        Ok(())
    }

    #[test]
    fn insomnia_with_apnea_is_mixed() {
        let outcome = screen_json(json!({
            "Sleep Duration": 4,
            "Quality of Sleep": 3,
            "Stress Level": 8,
            "BMI Category": "Obese",
            "Blood Pressure": "150/95",
            "Age": 45,
            "Physical Activity Level": 10,
        }));

        assert_eq!(outcome.diagnosis(), Diagnosis::MixedSleepDisorder);
        assert_eq!(outcome.resolution.insomnia_risk, RiskLevel::High);
        assert_eq!(
            outcome.facts().recommendations(),
            &[
                Recommendation::SleepHygiene,
                Recommendation::PhysicalActivity,
                Recommendation::StressManagement,
                Recommendation::WeightManagement,
                Recommendation::ApneaEvaluation,
            ]
        );
    }

    #[test]
    fn validation_failure_stops_before_inference() {
        let input = match raw_input(json!({ "sleepDuration": 7 })) {
            Ok(input) => input,
            Err(err) => panic!("fixture must be an object: {err}"),
        };
        match screen(&input) {
            Err(ScreeningError::Validation(errors)) => assert_eq!(errors.errors.len(), 5),
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(raw_input(json!([1, 2])), Err(ScreeningError::NotAnObject("array")));
    }

    #[test]
    fn report_carries_metadata_and_omits_missing_case_ref() -> Result<(), serde_json::Error> {
        let outcome = screen_json(json!({
            "sleepDuration": 8,
            "sleepQuality": 8,
            "stressLevel": 3,
            "bmiCategory": "Normal",
            "bloodPressure": "120/80",
            "age": 30,
            "physicalActivity": 40,
        }));

        let report = serde_json::to_value(outcome.report(None))?;
        assert!(report.get("caseRef").is_none());
        assert_eq!(report["diagnosis"], json!("NoSleepDisorder"));
        assert_eq!(report["insomniaRisk"], json!("low"));
        assert_eq!(report["lifestyleIssues"]["weight"], json!(false));
        assert_eq!(report["metadata"]["knowledgeBaseVersion"], json!(KNOWLEDGE_BASE_VERSION));
        assert_eq!(report["metadata"]["passes"], json!(2));
        assert_eq!(report["metadata"]["capped"], json!(false));

        let with_ref = serde_json::to_value(outcome.report(Some("case-1".to_string())))?;
        assert_eq!(with_ref["caseRef"], json!("case-1"));
        Ok(())
    }

    #[test]
    fn measurements_stand_in_for_a_missing_category() {
        let outcome = screen_json(json!({
            "sleepDuration": 8,
            "sleepQuality": 8,
            "stressLevel": 3,
            "weight": 70,
            "height": 175,
            "bloodPressure": "118/76",
            "age": 33,
            "physicalActivity": 60,
        }));
        assert_eq!(outcome.diagnosis(), Diagnosis::NoSleepDisorder);
    }

    fn bmi_label() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec!["Underweight", "Normal", "Normal Weight", "Overweight", "Obese"])
    }

    fn profile() -> impl Strategy<Value = Value> {
        (
            0.0f64..12.0,
            0u8..=10,
            0u8..=10,
            18u8..90,
            0u16..120,
            bmi_label(),
            90u16..190,
            55u16..120,
        )
            .prop_map(|(duration, quality, stress, age, activity, bmi, systolic, diastolic)| {
                json!({
                    "sleepDuration": duration,
                    "sleepQuality": quality,
                    "stressLevel": stress,
                    "age": age,
                    "physicalActivity": activity,
                    "bmiCategory": bmi,
                    "bloodPressure": format!("{systolic}/{diastolic}"),
                })
            })
    }

    proptest! {
        #[test]
        fn property_screening_is_deterministic(value in profile()) {
            let a = screen_json(value.clone());
            let b = screen_json(value);
            prop_assert_eq!(a.trace(), b.trace());
            prop_assert_eq!(a.diagnosis(), b.diagnosis());
            prop_assert_eq!(a.facts(), b.facts());
        }

        #[test]
        fn property_default_knowledge_base_terminates_quickly(value in profile()) {
            let outcome = screen_json(value);
            prop_assert!(!outcome.run.capped);
            prop_assert!(outcome.run.passes < 20);
            prop_assert!(outcome.run.failures.is_empty());
        }

        #[test]
        fn property_fixpoint_is_idempotent(value in profile()) {
            let outcome = screen_json(value);
            let rerun = evaluate(knowledge_base(), outcome.facts().clone());
            prop_assert_eq!(rerun.facts(), outcome.facts());
            prop_assert_eq!(rerun.run.passes, 1);
            prop_assert_eq!(rerun.diagnosis(), outcome.diagnosis());
        }

        #[test]
        fn property_risks_never_drop_below_a_fired_high(value in profile()) {
            let outcome = screen_json(value);
            if outcome.trace().iter().any(|id| id == "R5") {
                prop_assert_eq!(outcome.resolution.apnea_risk, RiskLevel::High);
            }
            if outcome.trace().iter().any(|id| id == "R1") {
                prop_assert_eq!(
                    outcome.facts().risk(keys::INSOMNIA_RISK).unwrap_or(RiskLevel::Unknown),
                    RiskLevel::High
                );
            }
        }
    }
}
